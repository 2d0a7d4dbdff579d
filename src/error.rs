//! Error taxonomy for the tiling optimizer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TilingError {
    /// Zero-size or inconsistent dimensions, detected before any search.
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    /// Neither the M-split nor the HW-split pre-check passed.
    #[error("cannot tile this operator on this device (m-split: {m_split}; hw-split: {hw_split})")]
    NoFeasibleMode { m_split: String, hw_split: String },
    /// Even the minimal tile configuration overflows the L1 buffer.
    #[error("L1 capacity exceeded: need {required} bytes, have {capacity}")]
    L1CapacityExceeded { required: u64, capacity: u64 },
    /// The vector post-processing tile cannot fit the scratch buffer.
    #[error("vector buffer capacity exceeded: need {required} bytes, have {capacity}")]
    VectorCapacityExceeded { required: u64, capacity: u64 },
    /// A stride, dilation or divisor that must be positive was zero.
    #[error("degenerate arithmetic: {0} must be non-zero")]
    ArithmeticDegenerate(&'static str),
    #[error("invalid platform description: {0}")]
    Platform(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TilingResult<T> = Result<T, TilingError>;
