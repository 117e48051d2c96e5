//! Error types for NDBN packing, quantization and parsing.

use thiserror::Error;

/// Result type alias for NDBN operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal errors raised while quantizing, laying out, writing or parsing a container.
#[derive(Debug, Error)]
pub enum Error {
    /// Tensor rank outside 1..=4, or a dimension that does not fit the table's u32 field.
    #[error("invalid shape for tensor '{name}' (rank {rank}): {reason}")]
    InvalidShape {
        name: String,
        rank: usize,
        reason: String,
    },

    /// Payload element count disagrees with the product of the declared shape.
    #[error("tensor '{name}' shape implies {expected} elements, payload holds {actual}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Quantization block size must be even, non-zero and fit in a u32.
    #[error("invalid block size {0}: must be even and greater than zero")]
    InvalidBlockSize(usize),

    /// Quantizer input contained NaN or an infinity.
    #[error("non-finite value at element {index}")]
    NonFiniteValue { index: usize },

    /// Write, seek or publish failure on the output sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Merge rule rejected under strict vocab encoding.
    #[error(transparent)]
    MergeRule(#[from] MergeRuleError),

    /// An offset, size or count does not fit its on-disk field.
    #[error("layout overflow: {0}")]
    LayoutOverflow(String),

    /// Container bytes failed validation.
    #[error("invalid NDBN data: {0}")]
    InvalidFormat(String),
}

impl Error {
    pub(crate) fn invalid_shape(name: &str, rank: usize, reason: impl Into<String>) -> Self {
        Error::InvalidShape {
            name: name.to_string(),
            rank,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_format(message: impl Into<String>) -> Self {
        Error::InvalidFormat(message.into())
    }
}

/// Recoverable problems with a single BPE merge rule.
///
/// These are collected into a skip report by the vocab encoder rather than
/// aborting the compile, unless the caller opts into strict encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeRuleError {
    /// Rule did not split into exactly two whitespace-separated tokens.
    #[error("merge rule {index} '{rule}' has {token_count} tokens, expected 2")]
    Malformed {
        index: usize,
        rule: String,
        token_count: usize,
    },

    /// The resolver has no id for one of the rule's symbols.
    #[error("merge rule {index}: no id for symbol '{symbol}'")]
    UnresolvableSymbol { index: usize, symbol: String },
}

impl MergeRuleError {
    /// Position of the offending rule in the original list.
    pub fn index(&self) -> usize {
        match self {
            MergeRuleError::Malformed { index, .. } => *index,
            MergeRuleError::UnresolvableSymbol { index, .. } => *index,
        }
    }
}
