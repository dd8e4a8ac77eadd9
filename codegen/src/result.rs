//! Result and error types representing the outcome of compiling a function.

use std::fmt;

/// A compilation error.
///
/// Structural inconsistencies in the input IR abort the process with a
/// panic carrying a located diagnostic; this type only covers the situations
/// the pipeline reports back to its caller.
#[derive(Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// The input contains an operation the target legalizer cannot rewrite.
    Unsupported(String),

    /// No target is registered under the requested name or triple.
    UnknownTarget(String),

    /// The IR verifier rejected the function.
    Verifier(String),

    /// Writing assembly to the output stream failed.
    Io(String),
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error
/// type.
pub type CodegenResult<T> = Result<T, CodegenError>;

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unsupported(what) => write!(f, "unsupported operation: {what}"),
            Self::UnknownTarget(name) => write!(f, "unknown target: {name}"),
            Self::Verifier(msg) => write!(f, "verifier error: {msg}"),
            Self::Io(msg) => write!(f, "output error: {msg}"),
        }
    }
}

impl std::error::Error for CodegenError {}
