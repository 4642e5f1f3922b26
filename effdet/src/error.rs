//! Error kinds raised by the detection pipeline.
//!
//! Functions return [anyhow::Result]. Failures that belong to one of the kinds
//! below carry an [Error] which can be recovered with
//! `err.downcast_ref::<effdet::Error>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The configuration cannot describe a valid anchor layout or pipeline.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Tensor shapes disagree with the anchor layout or with each other.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// NaN or infinity showed up where a finite value is required.
    #[error("numeric anomaly: {0}")]
    NumericAnomaly(String),
    /// Per-call input violates its contract, e.g. an out-of-range class label.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
