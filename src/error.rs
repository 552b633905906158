// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fingerprint database error: {0}")]
    Load(String),

    #[error("Key projection error: window width {w} is not divisible by dimension {k}")]
    Dimension { w: usize, k: usize },

    #[error("Fingerprint index error: {0}")]
    Index(String),

    #[error("Packet source error: {0}")]
    PacketSource(String),

    #[error("Sink dispatch error: {0}")]
    Sink(String),
}

pub type Result<T> = std::result::Result<T, IdError>;
