//! CLI sink — renders identification events to the terminal.
//!
//! Grounded in `original_source/utils/format.py::cli_print` (per-stream
//! colored line with a checkmark once a match clears the threshold) and in
//! the teacher's `run_status` console printing style (`println!`, no
//! terminal UI crate). The original's `rich`-based color/emoji formatting
//! has no counterpart crate anywhere in the example pack, so this renders
//! plain text through `tracing` at `info` level instead of reimplementing a
//! terminal color library.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::info;

use super::{Sink, SinkEvent};

/// Assigns each flow a small stable display number the first time it is
/// seen, mirroring the original's `list(streams.keys()).index(stream)`.
#[derive(Default)]
pub struct CliSink {
    seen: Mutex<Vec<(String, String)>>,
    counter: AtomicUsize,
}

impl CliSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_number(&self, src: &str, dst: &str) -> usize {
        let mut seen = self.seen.lock().unwrap();
        if let Some(pos) = seen.iter().position(|(s, d)| s == src && d == dst) {
            return pos + 1;
        }
        seen.push((src.to_string(), dst.to_string()));
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Sink for CliSink {
    fn emit(&self, event: &SinkEvent) {
        let stream_num = self.stream_number(&event.ip_src, &event.ip_dst);
        match &event.best_title {
            Some(title) if event.probability_pct > 0.0 => {
                info!(
                    stream = stream_num,
                    elapsed = event.elapsed,
                    src = %event.ip_src,
                    dst = %event.ip_dst,
                    segment = event.captured_segment,
                    best_match = %title,
                    probability = event.probability_pct,
                    identified = event.probability_pct >= 75.0,
                    "match"
                );
            }
            _ => {
                info!(
                    stream = stream_num,
                    elapsed = event.elapsed,
                    src = %event.ip_src,
                    dst = %event.ip_dst,
                    segment = event.captured_segment,
                    "searching"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(src: &str, dst: &str) -> SinkEvent {
        SinkEvent {
            ip_src: src.into(),
            ip_dst: dst.into(),
            elapsed: 1.0,
            captured_segment: 1000,
            best_match: None,
            second_match: None,
            third_match: None,
            best_title: None,
            probability_pct: 0.0,
        }
    }

    #[test]
    fn stream_numbers_are_stable_per_flow() {
        let sink = CliSink::new();
        assert_eq!(sink.stream_number("a", "b"), 1);
        assert_eq!(sink.stream_number("c", "d"), 2);
        assert_eq!(sink.stream_number("a", "b"), 1);
    }

    #[test]
    fn emit_does_not_panic_without_a_match() {
        let sink = CliSink::new();
        sink.emit(&event("10.0.0.1", "10.0.0.2"));
    }
}
