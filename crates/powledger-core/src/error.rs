use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong while building, mining or linking blocks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("invalid transaction: {0}")]
    Validation(String),

    #[error("proof-of-work does not fit in {width} bytes")]
    EncodingOverflow { width: usize },

    #[error("difficulty {difficulty} must be below {max} hex digits")]
    InvalidDifficulty { difficulty: u32, max: u32 },

    #[error("proof-of-work width must be at least one byte, got {0}")]
    InvalidPowWidth(usize),

    #[error("block {id} links to {found}, expected tail hash {expected}")]
    ChainLinkage {
        id: u64,
        expected: String,
        found: String,
    },

    #[error("block id {found} does not follow tail, expected {expected}")]
    Sequence { expected: u64, found: u64 },

    #[error("chain has no genesis block")]
    EmptyChain,

    #[error("chain already has a genesis block")]
    GenesisExists,

    #[error("block {id} carries no valid proof-of-work")]
    InvalidProof { id: u64 },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("malformed block record: {0}")]
    MalformedBlock(String),

    #[error("no transaction arrived within {0:?}")]
    SourceTimeout(Duration),

    #[error("transaction source closed")]
    SourceClosed,

    #[error("mining cancelled")]
    MiningCancelled,

    #[error("mining worker failed: {0}")]
    Worker(String),
}
