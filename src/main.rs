// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! streamid — encrypted adaptive-bitrate video stream identification.
//!
//! Usage:
//!   streamid identify    --config config.toml -i eth0
//!   streamid build-index --config config.toml
//!   streamid inspect-db  --config config.toml

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use streamid::capture::packet_source::{self, PacketSource};
use streamid::config::Config;
use streamid::fingerprint::index::FingerprintIndex;
use streamid::fingerprint::store::FingerprintStore;
use streamid::pipeline::Pipeline;
use streamid::sink::cli::CliSink;
use streamid::sink::http::HttpSink;
use streamid::sink::server::{self, Broadcaster};
use streamid::sink::Dispatcher;

#[derive(Parser)]
#[command(name = "streamid", about = "Encrypted ABR video stream identifier", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live identification pipeline against a network interface.
    Identify {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Network interface to capture on (required; overrides config).
        #[arg(short, long)]
        interface: Option<String>,
        /// Widen the BPF filter to the full known CDN IP ranges.
        #[arg(long)]
        full_cdn_search: bool,
        /// Render matches to the terminal instead of (or in addition to)
        /// the HTTP sink.
        #[arg(long)]
        cli: bool,
        /// Sliding window width, in segments.
        #[arg(short = 'w', long)]
        window_width: Option<usize>,
        /// Projected key dimension.
        #[arg(short = 'k', long)]
        k_dimension: Option<usize>,
        /// Pearson threshold for the legacy single-shot identification path.
        /// Passing this flag selects the legacy path over the canonical EMA
        /// fusion path for this run.
        #[arg(short = 'p', long)]
        pearson_threshold: Option<f64>,
    },
    /// Force a fingerprint index (re)build and persist its binary cache.
    BuildIndex {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print fingerprint database coverage statistics.
    InspectDb {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Identify { config, interface, full_cdn_search, cli: cli_flag, window_width, k_dimension, pearson_threshold } => {
            run_identify(config, interface, full_cdn_search, cli_flag, window_width, k_dimension, pearson_threshold).await;
        }
        Command::BuildIndex { config } => {
            run_build_index(config);
        }
        Command::InspectDb { config } => {
            run_inspect_db(config);
        }
    }
}

fn load_config(config_path: &PathBuf) -> Config {
    match Config::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_identify(
    config_path: PathBuf,
    interface: Option<String>,
    full_cdn_search: bool,
    cli_flag: bool,
    window_width: Option<usize>,
    k_dimension: Option<usize>,
    pearson_threshold: Option<f64>,
) {
    let mut config = load_config(&config_path);

    if let Some(iface) = interface {
        config.capture.interface = iface;
    }
    if full_cdn_search {
        config.capture.full_cdn_search = true;
    }
    if cli_flag {
        config.sink.cli = true;
    }
    if let Some(w) = window_width {
        config.identification.window_width = w;
    }
    if let Some(k) = k_dimension {
        config.identification.k_dimension = k;
    }
    if let Some(p) = pearson_threshold {
        config.identification.legacy_pearson_threshold = p;
        config.identification.legacy_single_shot = true;
    }

    if config.capture.interface.is_empty() {
        error!("No capture interface configured: pass -i/--interface or set capture.interface in the config file");
        std::process::exit(1);
    }

    let store = match FingerprintStore::load_or_build(&config.database.csv_path, &config.cache_path()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to load fingerprint database");
            std::process::exit(1);
        }
    };

    let index = match FingerprintIndex::load_or_build(
        &store,
        config.identification.window_width,
        config.identification.k_dimension,
        config.identification.leaf_size,
        &config.index_cache_path(),
    ) {
        Ok(ix) => ix,
        Err(e) => {
            error!(error = %e, "Failed to build fingerprint index");
            std::process::exit(1);
        }
    };

    info!(
        videos = store.len(),
        rows = index.len(),
        w = index.window_width(),
        k = index.k_dimension(),
        "Fingerprint database and index ready"
    );

    let filter = match packet_source::build_capture_filter(config.capture.full_cdn_search).await {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "Failed to resolve CDN capture filter");
            std::process::exit(1);
        }
    };

    let broadcaster = if config.sink.server_enabled {
        let b = Broadcaster::new();
        let server_handle = b.clone();
        let port = config.sink.server_port;
        tokio::spawn(async move {
            server::start_server(server_handle, port).await;
        });
        Some(b)
    } else {
        None
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received CTRL+C, shutting down…"),
            Err(e) => error!(error = %e, "Signal handling error"),
        }
        let _ = cancel_tx.send(true);
    });

    // spec.md §7: a dead packet-source subprocess is restarted once before
    // becoming a fatal error.
    let mut attempt = 0;
    loop {
        attempt += 1;
        let source = match PacketSource::spawn(&config.capture, &filter) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, attempt, "Failed to spawn packet source");
                std::process::exit(1);
            }
        };

        let mut dispatcher = Dispatcher::new();
        if config.sink.cli {
            dispatcher.add(Box::new(CliSink::new()));
        }
        if let Some(url) = &config.sink.http_url {
            dispatcher.add(Box::new(HttpSink::new(
                url.clone(),
                std::time::Duration::from_millis(config.sink.http_timeout_ms),
            )));
        }
        if let Some(b) = &broadcaster {
            dispatcher.add(Box::new(b.clone()));
        }
        if dispatcher.is_empty() {
            warn!("No sink configured; identification events will be dropped");
        }

        let pipeline = Pipeline::new(&store, &index, &config, dispatcher);
        match pipeline.run(source, cancel_rx.clone()).await {
            streamid::pipeline::PipelineOutcome::Cancelled | streamid::pipeline::PipelineOutcome::Eof => {
                std::process::exit(0);
            }
            streamid::pipeline::PipelineOutcome::SourceError if attempt == 1 => {
                warn!("Packet source died, restarting once");
                continue;
            }
            streamid::pipeline::PipelineOutcome::SourceError => {
                error!("Packet source died again after restart, giving up");
                std::process::exit(1);
            }
        }
    }
}

fn run_build_index(config_path: PathBuf) {
    let config = load_config(&config_path);
    let store = match FingerprintStore::load(&config.database.csv_path) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to load fingerprint database");
            std::process::exit(1);
        }
    };
    let index = match FingerprintIndex::build(
        &store,
        config.identification.window_width,
        config.identification.k_dimension,
        config.identification.leaf_size,
    ) {
        Ok(index) => index,
        Err(e) => {
            eprintln!("Error building index: {e}");
            std::process::exit(1);
        }
    };

    let cache_path = config.index_cache_path();
    if let Err(e) = index.persist(&cache_path) {
        eprintln!("Error writing index cache: {e}");
        std::process::exit(1);
    }

    println!(
        "Built index: {} rows from {} videos, w={}, k={} -> {}",
        index.len(),
        store.len(),
        index.window_width(),
        index.k_dimension(),
        cache_path.display()
    );
}

fn run_inspect_db(config_path: PathBuf) {
    let config = load_config(&config_path);
    let store = match FingerprintStore::load(&config.database.csv_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    println!("=== Fingerprint Database ===");
    println!("Records (video/encoding rows): {}", store.len());
    println!("Distinct video ids           : {}", store.ids().len());
    for idx in 0..store.len() {
        let Some(meta) = store.video(idx) else { continue };
        let fp_len = store.fingerprint(idx).map(|fp| fp.len()).unwrap_or(0);
        println!(
            "  [{idx:>4}] {:<10} {:<30} {:>6}s  enc={:<8} segments={}",
            meta.id, meta.title, meta.duration_secs, meta.encoding_tag, fp_len
        );
    }
}
