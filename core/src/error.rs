//! The shared error type for the memory, breakpoint, event bus, analyzer
//! and trace buffer components.
//!
//! Per the error-handling design, address-out-of-range cannot happen for
//! Z80 addresses (masked to 16 bits by construction); out-of-range page or
//! bank indices are reported through the `UNMAPPABLE` sentinel rather than
//! `Result`, so lookups on the CPU hot path never allocate. What remains
//! here are the sentinel conditions a caller must be able to match on
//! without the core ever panicking on ordinary misuse.

use thiserror::Error;

/// Sentinel returned by page/bank-index queries that fall outside the
/// compiled-in capacity, in place of `Option<usize>`.
pub const UNMAPPABLE: usize = usize::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("event bus topic table is full")]
    TopicTableFull,

    #[error("no topic registered with name {0:?}")]
    UnknownTopic(String),

    #[error("operation referenced unknown id {0}")]
    UnknownId(u32),

    #[error("breakpoint descriptor is invalid: {0}")]
    InvalidDescriptor(&'static str),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}
