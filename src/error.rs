//! Compile-time errors surfaced by the code generator.

use thiserror::Error;

/// Everything that can abort a module compilation. Nothing is recovered
/// locally; the first error unwinds through the whole pipeline via `?`.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The input violates the legalization contract: a construct that an
    /// upstream normalization pass was supposed to remove is still present.
    #[error("legalization problem: {0}")]
    Legalization(String),

    /// A construct the generator recognizes but intentionally does not
    /// implement.
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    /// An internal invariant did not hold. This is a bug in the generator,
    /// not bad input.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

pub type CompileResult<T> = Result<T, CompileError>;
