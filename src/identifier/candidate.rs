//! The per-flow candidate table: an exponentially-weighted-average belief
//! per matched title, bounded to `MAX_MATCHES_PER_STREAM` entries.
//!
//! Grounded in `original_source/identifier.py::run`'s `identified` dict
//! (`identified[title] = [ema, last_match_window, last_seen_index]`) — kept
//! here as an explicit struct rather than a positional list, per spec.md
//! §9's note that the database's column layout should be a typed record,
//! generalized to the candidate table for the same reason.

use std::collections::HashMap;

/// EMA floor below which a candidate is considered to have drifted away
/// and may be dropped (spec.md §8 scenario F).
pub const DRIFT_PRUNE_THRESHOLD: f64 = 0.10;

/// Belief state for one candidate title within a single flow.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub video_idx: u32,
    pub ema_proba: f64,
    /// The live window's un-projected segment values the last time this
    /// candidate matched, used to re-correlate on rounds where the index
    /// does not return this candidate.
    pub last_matched_window: Vec<u32>,
    /// Fingerprint offset the last matched window was taken from, used for
    /// the approximate-position estimate.
    pub last_window_start: u32,
    /// Monotonic update counter; higher means more recently touched. Used
    /// for the "prefer most recently updated" tie-break.
    pub last_update_seq: u64,
}

/// Bounded `title -> Candidate` map for one flow.
#[derive(Debug, Default)]
pub struct CandidateTable {
    candidates: HashMap<String, Candidate>,
    seq: u64,
}

impl CandidateTable {
    pub fn new() -> Self {
        Self { candidates: HashMap::new(), seq: 0 }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Update (or insert) `title`'s EMA with a fresh correlation `r`
    /// against `window`, per spec.md §4.5 steps 3-4. `alpha` is the EMA
    /// smoothing factor; a brand new candidate starts from `ema_proba = 0`
    /// before the first update is folded in.
    pub fn update(
        &mut self,
        title: &str,
        video_idx: u32,
        r: f64,
        window: &[u32],
        window_start: u32,
        alpha: f64,
    ) {
        let seq = self.next_seq();
        match self.candidates.get_mut(title) {
            Some(candidate) => {
                candidate.ema_proba = (1.0 - alpha) * candidate.ema_proba + alpha * r;
                candidate.last_matched_window = window.to_vec();
                candidate.last_window_start = window_start;
                candidate.last_update_seq = seq;
            }
            None => {
                let ema_proba = (1.0 - alpha) * 0.0 + alpha * r;
                self.candidates.insert(
                    title.to_string(),
                    Candidate {
                        video_idx,
                        ema_proba,
                        last_matched_window: window.to_vec(),
                        last_window_start: window_start,
                        last_update_seq: seq,
                    },
                );
            }
        }
    }

    /// Drop the lowest-EMA entries until at most `max_size` remain.
    pub fn prune(&mut self, max_size: usize) {
        if self.candidates.len() <= max_size {
            return;
        }
        let mut entries: Vec<(String, f64)> =
            self.candidates.iter().map(|(title, c)| (title.clone(), c.ema_proba)).collect();
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let drop_count = entries.len() - max_size;
        for (title, _) in entries.into_iter().take(drop_count) {
            self.candidates.remove(&title);
        }
    }

    /// Remove entries whose EMA has decayed below `threshold` (spec.md §8
    /// scenario F: drift pruning).
    pub fn prune_below(&mut self, threshold: f64) {
        self.candidates.retain(|_, c| c.ema_proba >= threshold);
    }

    /// The current best, second-best, and third-best candidates by
    /// EMA, ties broken by most recently updated, then lowest `video_idx`.
    pub fn ranked(&self) -> Vec<(&str, &Candidate)> {
        let mut entries: Vec<(&str, &Candidate)> =
            self.candidates.iter().map(|(title, c)| (title.as_str(), c)).collect();
        entries.sort_by(|(_, a), (_, b)| {
            b.ema_proba
                .partial_cmp(&a.ema_proba)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.last_update_seq.cmp(&a.last_update_seq))
                .then(a.video_idx.cmp(&b.video_idx))
        });
        entries
    }

    pub fn get(&self, title: &str) -> Option<&Candidate> {
        self.candidates.get(title)
    }

    pub fn contains(&self, title: &str) -> bool {
        self.candidates.contains_key(title)
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> {
        self.candidates.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_candidate_starts_from_zero_ema() {
        let mut table = CandidateTable::new();
        table.update("V1", 0, 1.0, &[1, 2, 3], 0, 0.33);
        assert_eq!(table.get("V1").unwrap().ema_proba, 0.33);
    }

    #[test]
    fn repeated_updates_converge_toward_input() {
        let mut table = CandidateTable::new();
        for _ in 0..50 {
            table.update("V1", 0, 1.0, &[1, 2, 3], 0, 0.33);
        }
        assert!((table.get("V1").unwrap().ema_proba - 1.0).abs() < 1e-6);
    }

    #[test]
    fn prune_keeps_highest_ema_entries() {
        let mut table = CandidateTable::new();
        table.update("low", 0, 0.1, &[], 0, 1.0);
        table.update("mid", 1, 0.5, &[], 0, 1.0);
        table.update("high", 2, 0.9, &[], 0, 1.0);
        table.prune(2);
        assert_eq!(table.len(), 2);
        assert!(table.contains("high"));
        assert!(table.contains("mid"));
        assert!(!table.contains("low"));
    }

    #[test]
    fn never_exceeds_max_matches_per_stream() {
        let mut table = CandidateTable::new();
        for i in 0..150 {
            table.update(&format!("v{i}"), i, i as f64 / 150.0, &[], 0, 1.0);
            table.prune(100);
        }
        assert!(table.len() <= 100);
    }

    #[test]
    fn ranked_breaks_ties_by_recency_then_video_idx() {
        let mut table = CandidateTable::new();
        table.update("a", 5, 0.5, &[], 0, 1.0);
        table.update("b", 1, 0.5, &[], 0, 1.0);
        let ranked = table.ranked();
        assert_eq!(ranked[0].0, "b"); // updated most recently
    }

    #[test]
    fn prune_below_drops_decayed_candidates() {
        let mut table = CandidateTable::new();
        table.update("v", 0, 1.0, &[], 0, 0.33);
        for _ in 0..20 {
            table.update("v", 0, 0.0, &[], 0, 0.33);
        }
        table.prune_below(0.10);
        assert!(!table.contains("v"));
    }
}
