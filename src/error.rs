//! Errors returned by the schedulers and the sampling pipeline.

/// The failure modes of a sampling request. None of them is retried, a
/// failed `sample` call discards everything computed so far.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid step count, unsupported mode string, out of range parameter.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Incompatible conditioning, adapter feature or latent dimensions.
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch { what: String, expected: Vec<i64>, got: Vec<i64> },

    /// A collaborator failed while computing, e.g. out of memory.
    #[error("runtime failure: {0}")]
    Runtime(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn shape(what: impl Into<String>, expected: &[i64], got: &[i64]) -> Self {
        Self::ShapeMismatch { what: what.into(), expected: expected.to_vec(), got: got.to_vec() }
    }
}
