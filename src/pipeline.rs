// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Live pipeline — wires the packet source into the traffic segmenter,
//! the identifier, and the sink dispatcher, per spec.md §5.
//!
//! Grounded in the teacher's `manager.rs`/`ingestion.rs` worker shape
//! (single task, `tokio::select!` between work and a periodic tick,
//! cooperative shutdown) but with the teacher's per-camera-worker fan-out
//! collapsed into the single cooperative ingest task spec.md §5 requires
//! ("there is no intra-flow parallelism"; "any 'background' feel in the
//! source is cosmetic").

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::capture::packet_source::PacketSource;
use crate::capture::segmenter::{FlowKey, TrafficSegmenter};
use crate::fingerprint::index::FingerprintIndex;
use crate::fingerprint::store::FingerprintStore;
use crate::identifier::Identifier;
use crate::config::Config;
use crate::sink::Dispatcher;

/// Why a pipeline run ended, so the caller can apply spec.md §7's
/// "subprocess death: attempt restart once, then fatal" policy without the
/// pipeline itself needing to know about process respawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// `cancel` signalled shutdown.
    Cancelled,
    /// The packet source reached clean EOF.
    Eof,
    /// The packet source returned an I/O error.
    SourceError,
}

/// The single cooperative ingest task described in spec.md §5: parse,
/// segment, query, and dispatch all happen here in FIFO order, one packet
/// at a time.
pub struct Pipeline<'a> {
    segmenter: TrafficSegmenter,
    identifier: Identifier<'a>,
    dispatcher: Dispatcher,
    flow_idle: Duration,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        store: &'a FingerprintStore,
        index: &'a FingerprintIndex,
        config: &'a Config,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            segmenter: TrafficSegmenter::new(),
            identifier: Identifier::new(store, index, config),
            dispatcher,
            flow_idle: Duration::from_secs(config.capture.flow_idle_secs.max(1)),
        }
    }

    /// Drive `source` until it hits EOF, errors, or `cancel` signals
    /// shutdown. Flushes no in-flight segment on shutdown (none is
    /// buffered beyond the segmenter's own partial-segment bytes, which
    /// spec.md never asks to be flushed early) and releases the packet
    /// source subprocess before returning.
    pub async fn run(mut self, mut source: PacketSource, mut cancel: watch::Receiver<bool>) -> PipelineOutcome {
        let idle_sweep = if self.flow_idle.is_zero() {
            Duration::from_secs(60)
        } else {
            self.flow_idle
        };
        let mut idle_tick = tokio::time::interval(idle_sweep);
        idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;

                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("Shutdown signal received, stopping ingest");
                        break PipelineOutcome::Cancelled;
                    }
                }

                _ = idle_tick.tick() => {
                    self.segmenter.evict_idle(self.flow_idle);
                    let segmenter = &self.segmenter;
                    self.identifier.retain_flows(|flow: &FlowKey| segmenter.contains_flow(flow));
                }

                packet = source.next_packet() => {
                    match packet {
                        Ok(Some(pkt)) => {
                            let flow = FlowKey::new(pkt.src, pkt.dst);
                            if let Some(segment) = self.segmenter.on_packet(flow, pkt.t, pkt.size) {
                                let event = self.identifier.on_segment(segment);
                                self.dispatcher.emit(&event);
                            }
                        }
                        Ok(None) => {
                            info!("Packet source reached EOF, shutting down");
                            break PipelineOutcome::Eof;
                        }
                        Err(e) => {
                            error!(error = %e, "Packet source error, shutting down");
                            break PipelineOutcome::SourceError;
                        }
                    }
                }
            }
        };

        source.shutdown().await;
        outcome
    }
}
