use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use crate::error::{IdError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Fingerprint database configuration.
    pub database: DatabaseConfig,
    /// Traffic capture configuration.
    pub capture: CaptureConfig,
    /// Identification tuning parameters.
    #[serde(default)]
    pub identification: IdentificationConfig,
    /// Sink (event dispatch) configuration.
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Fingerprint database source and cache locations.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the tabular (CSV-shaped) fingerprint source.
    pub csv_path: PathBuf,
    /// Optional path to a binary record cache. Defaults alongside `csv_path`.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    /// Optional path to a k-d tree index binary cache.
    #[serde(default)]
    pub index_cache_path: Option<PathBuf>,
}

/// Traffic capture backend configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Capture interface name (e.g. "eth0").
    pub interface: String,
    /// Which external packet-capture backend to drive.
    #[serde(default)]
    pub backend: PacketBackend,
    /// Widen the BPF filter to the full known CDN IP ranges.
    #[serde(default)]
    pub full_cdn_search: bool,
    /// Flow idle timeout, in seconds, before state is evicted (0 = never).
    #[serde(default = "default_flow_idle_secs")]
    pub flow_idle_secs: u64,
}

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PacketBackend {
    #[default]
    Tshark,
    Tcpdump,
}

/// Identification tuning: window/key geometry, index build parameters,
/// and the EMA fusion constants from spec.md §6.
#[derive(Debug, Deserialize, Clone)]
pub struct IdentificationConfig {
    /// Sliding window width `W`, in segments.
    #[serde(default = "default_window_width")]
    pub window_width: usize,
    /// Projected key dimension `K`. Must divide `window_width`.
    #[serde(default = "default_k_dimension")]
    pub k_dimension: usize,
    /// k-d tree leaf size.
    #[serde(default = "default_leaf_size")]
    pub leaf_size: usize,
    /// Number of nearest neighbors fetched from the index per query.
    #[serde(default = "default_nb_best_matches")]
    pub nb_best_matches: usize,
    /// Max candidates retained per flow before pruning.
    #[serde(default = "default_max_matches_per_stream")]
    pub max_matches_per_stream: usize,
    /// EMA smoothing factor.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// EMA threshold at which a flow is considered identified.
    #[serde(default = "default_identification_threshold")]
    pub identification_threshold: f64,
    /// Use the legacy single-shot Pearson path instead of the EMA path.
    #[serde(default)]
    pub legacy_single_shot: bool,
    /// Pearson threshold for the legacy single-shot path.
    #[serde(default = "default_legacy_pearson_threshold")]
    pub legacy_pearson_threshold: f64,
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            window_width: default_window_width(),
            k_dimension: default_k_dimension(),
            leaf_size: default_leaf_size(),
            nb_best_matches: default_nb_best_matches(),
            max_matches_per_stream: default_max_matches_per_stream(),
            alpha: default_alpha(),
            identification_threshold: default_identification_threshold(),
            legacy_single_shot: false,
            legacy_pearson_threshold: default_legacy_pearson_threshold(),
        }
    }
}

/// Sink dispatch configuration: CLI rendering, HTTP notification, and the
/// SSE broadcast server.
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    /// Render events to stdout.
    #[serde(default = "default_cli_enabled")]
    pub cli: bool,
    /// POST events to an HTTP notifier URL (fire-and-forget).
    #[serde(default)]
    pub http_url: Option<String>,
    /// POST timeout, in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Run the SSE broadcast server.
    #[serde(default = "default_server_enabled")]
    pub server_enabled: bool,
    /// Port for the SSE broadcast server.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            cli: default_cli_enabled(),
            http_url: None,
            http_timeout_ms: default_http_timeout_ms(),
            server_enabled: default_server_enabled(),
            server_port: default_server_port(),
        }
    }
}

fn default_flow_idle_secs() -> u64 { 300 }
fn default_window_width() -> usize { 12 }
fn default_k_dimension() -> usize { 6 }
fn default_leaf_size() -> usize { 400 }
fn default_nb_best_matches() -> usize { 10 }
fn default_max_matches_per_stream() -> usize { 100 }
fn default_alpha() -> f64 { 0.33 }
fn default_identification_threshold() -> f64 { 0.75 }
fn default_legacy_pearson_threshold() -> f64 { 0.99999999 }
fn default_cli_enabled() -> bool { true }
fn default_http_timeout_ms() -> u64 { 1000 }
fn default_server_enabled() -> bool { false }
fn default_server_port() -> u16 { 5000 }

/// Segment reconstruction constants (spec.md §6, normative).
pub const HTTP_HEADERS: i64 = 801;
pub const TLS_OVERHEAD: f64 = 1.0018;
pub const SEGMENT_TIME_THRESHOLD: f64 = 2.0;
pub const MIN_SEGMENT_SIZE: i64 = 5_000;
pub const MAX_SEGMENT_SIZE: i64 = 9_000_000;
pub const BUFFER_TIME_SECS: i64 = 60;

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| IdError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| IdError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let w = self.identification.window_width;
        let k = self.identification.k_dimension;
        if k == 0 || w == 0 {
            return Err(IdError::Config("window_width and k_dimension must be > 0".into()));
        }
        if k > w {
            return Err(IdError::Config(format!(
                "k_dimension ({k}) must be <= window_width ({w})"
            )));
        }
        if w % k != 0 {
            return Err(IdError::Config(format!(
                "window_width ({w}) must be divisible by k_dimension ({k})"
            )));
        }
        if !(0.0..=1.0).contains(&self.identification.alpha) {
            return Err(IdError::Config("alpha must be in [0, 1]".into()));
        }
        Ok(())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.database
            .cache_path
            .clone()
            .unwrap_or_else(|| self.database.csv_path.with_extension("bin"))
    }

    pub fn index_cache_path(&self) -> PathBuf {
        self.database.index_cache_path.clone().unwrap_or_else(|| {
            let w = self.identification.window_width;
            let k = self.identification.k_dimension;
            self.database
                .csv_path
                .with_file_name(format!("kdindex-{w}-{k}.bin"))
        })
    }
}

/// Serializable projection of the normative constants, surfaced by
/// `inspect-db` and used by tests asserting the running configuration.
#[derive(Debug, Serialize)]
pub struct EffectiveConstants {
    pub http_headers: i64,
    pub tls_overhead: f64,
    pub segment_time_threshold: f64,
    pub min_segment_size: i64,
    pub max_segment_size: i64,
}

impl Default for EffectiveConstants {
    fn default() -> Self {
        Self {
            http_headers: HTTP_HEADERS,
            tls_overhead: TLS_OVERHEAD,
            segment_time_threshold: SEGMENT_TIME_THRESHOLD,
            min_segment_size: MIN_SEGMENT_SIZE,
            max_segment_size: MAX_SEGMENT_SIZE,
        }
    }
}
