//! Fatal pipeline errors.
//!
//! Network failures are not represented here: the fetcher classifies them into
//! [`crate::client::FetchError`] and hands them back to the caller as values.

use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum PipelineError {
    /// A caller-supplied value was unusable (e.g. a datetime without an offset).
    InvalidInput(String),
    /// The telemetry payload broke its structural contract.
    MalformedPayload(String),
    /// A channel or window had too few samples to produce a complete table.
    InsufficientData(String),
    /// Tensor or weight shape disagrees with the network architecture.
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
    /// A weight blob existed but could not be decoded.
    Weights(String),
    Io(std::io::Error),
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InvalidInput(s) => write!(f, "invalid input: {}", s),
            PipelineError::MalformedPayload(s) => write!(f, "malformed payload: {}", s),
            PipelineError::InsufficientData(s) => write!(f, "insufficient data: {}", s),
            PipelineError::DimensionMismatch { what, expected, actual } => {
                write!(f, "dimension mismatch for {}: expected {}, got {}", what, expected, actual)
            }
            PipelineError::Weights(s) => write!(f, "weights error: {}", s),
            PipelineError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl Error for PipelineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PipelineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(value: std::io::Error) -> Self {
        PipelineError::Io(value)
    }
}

impl PipelineError {
    pub fn mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        PipelineError::DimensionMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }
}
