//! Runtime error type.

/// Errors a [`crate::driver::Runtime`] can report.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("system resource failure: {0}")]
    SystemResource(String),

    #[error("executor returned an error at epoch {0}")]
    ExecutorError(u64),

    #[error("internal invariant violated: {0}")]
    InternalAssertion(&'static str),

    #[error("invalid configuration: {0}")]
    Configuration(&'static str),
}
