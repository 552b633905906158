//! Fingerprint database: video metadata, the key projector, and the
//! nearest-neighbor index built over all known videos.

pub mod index;
pub mod key_projector;
pub mod store;
