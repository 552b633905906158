//! Sink — the identifier's event-dispatch boundary (spec.md §2, §4.7).
//!
//! Not a core [MODULE] in spec.md (Sink is an external collaborator), but
//! spec.md §5/§6 pin down a concrete contract the core must drive: ordered
//! per-flow delivery, a fire-and-forget ~1s POST, and an SSE broadcast
//! stream. `Sink` is the trait every concrete dispatcher implements;
//! `Dispatcher` fans one event out to all of them in order.
//!
//! Grounded in `original_source/identifier.py::run`'s tail (`format.cli_print`
//! then `requests.post`, best-effort) and in `original_source/app.py`'s
//! `Broadcaster` for the SSE registry shape.

pub mod cli;
pub mod http;
pub mod server;

use std::fmt;

use serde::de::{self, Deserialize, Deserializer, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

/// One matched candidate, surfaced to a sink. Serializes as a JSON array
/// (`[video_id, title, estimated_position_s, probability_pct]`), mirroring
/// the original's `video_infos + (time, proba)` tuple shape. Deserializes
/// from the same array shape, so a `Broadcaster`'s ingest endpoint can
/// accept an event posted by a remote `HttpSink`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchInfo {
    pub video_id: String,
    pub title: String,
    pub estimated_position_s: f64,
    pub probability_pct: f64,
}

impl Serialize for MatchInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(4))?;
        seq.serialize_element(&self.video_id)?;
        seq.serialize_element(&self.title)?;
        seq.serialize_element(&self.estimated_position_s)?;
        seq.serialize_element(&self.probability_pct)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for MatchInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MatchInfoVisitor;

        impl<'de> Visitor<'de> for MatchInfoVisitor {
            type Value = MatchInfo;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [video_id, title, estimated_position_s, probability_pct] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<MatchInfo, A::Error> {
                let video_id = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let title = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let estimated_position_s = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let probability_pct = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(3, &self))?;
                Ok(MatchInfo { video_id, title, estimated_position_s, probability_pct })
            }
        }

        deserializer.deserialize_seq(MatchInfoVisitor)
    }
}

/// One identification update, emitted once per completed segment
/// (spec.md §4.5 step 7). Field names and shape match the wire contract
/// in spec.md §6 exactly, including the `Match`/`Match2`/`Match3` arrays
/// that serialize empty rather than absent when there is no candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkEvent {
    #[serde(rename = "IP src")]
    pub ip_src: String,
    #[serde(rename = "IP dst")]
    pub ip_dst: String,
    #[serde(rename = "Elapsed")]
    pub elapsed: f64,
    #[serde(rename = "Captured segment")]
    pub captured_segment: i64,
    #[serde(rename = "Match", serialize_with = "serialize_match_slot", deserialize_with = "deserialize_match_slot")]
    pub best_match: Option<MatchInfo>,
    #[serde(rename = "Match2", serialize_with = "serialize_match_slot", deserialize_with = "deserialize_match_slot")]
    pub second_match: Option<MatchInfo>,
    #[serde(rename = "Match3", serialize_with = "serialize_match_slot", deserialize_with = "deserialize_match_slot")]
    pub third_match: Option<MatchInfo>,
    #[serde(rename = "Best match")]
    pub best_title: Option<String>,
    #[serde(rename = "Probability")]
    pub probability_pct: f64,
}

fn serialize_match_slot<S: Serializer>(slot: &Option<MatchInfo>, serializer: S) -> Result<S::Ok, S::Error> {
    match slot {
        Some(m) => {
            let mut seq = serializer.serialize_seq(Some(1))?;
            seq.serialize_element(m)?;
            seq.end()
        }
        None => serializer.serialize_seq(Some(0))?.end(),
    }
}

/// Mirrors `serialize_match_slot`: a 0- or 1-element array of `MatchInfo`,
/// rather than a bare nullable field.
fn deserialize_match_slot<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<MatchInfo>, D::Error> {
    let slot: Vec<MatchInfo> = Deserialize::deserialize(deserializer)?;
    match slot.len() {
        0 => Ok(None),
        1 => Ok(Some(slot.into_iter().next().unwrap())),
        n => Err(de::Error::invalid_length(n, &"a 0- or 1-element match array")),
    }
}

/// A dispatch target for identification events. `emit` must not block the
/// ingest loop (spec.md §5): implementations that need I/O hand off to a
/// background task rather than awaiting it here.
pub trait Sink: Send + Sync {
    fn emit(&self, event: &SinkEvent);
}

/// Lets an `Arc`-shared sink (e.g. the broadcaster, which is also held
/// directly by the server task) be registered with a `Dispatcher`
/// alongside owned sinks.
impl<T: Sink + ?Sized> Sink for std::sync::Arc<T> {
    fn emit(&self, event: &SinkEvent) {
        (**self).emit(event)
    }
}

/// Fans one event out to every configured sink, in order, per spec.md §5's
/// per-flow ordering guarantee (dispatch itself is synchronous and FIFO;
/// only the I/O each sink kicks off is asynchronous).
#[derive(Default)]
pub struct Dispatcher {
    sinks: Vec<Box<dyn Sink>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add(&mut self, sink: Box<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn emit(&self, event: &SinkEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}
