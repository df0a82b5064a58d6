/// Configuration and API-misuse errors.
///
/// These are surfaced synchronously to the caller. Transport and sync
/// failures travel as [`anyhow::Error`] and end up in per-peer results
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unsupported consistency model: {0}")]
    UnsupportedModel(String),

    #[error("unsupported conflict strategy: {0}")]
    UnsupportedStrategy(String),

    #[error("unsupported partition strategy: {0}")]
    UnsupportedPartitionStrategy(String),

    /// `increment` was called without a node id on a clock that has no owner
    #[error("no node id to increment")]
    MissingNodeId,

    #[error("no pending manual conflict at index {0}")]
    NoSuchConflict(usize),

    /// A locked or closed store refused the write
    #[error("write to {namespace}/{key} rejected")]
    WriteRejected { namespace: String, key: String },

    #[error("invalid partition config: {0}")]
    InvalidPartitioning(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
