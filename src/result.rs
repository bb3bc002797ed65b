//! Result and error types representing the outcome of compiling a program.

use std::fmt;

/// A position-free description of a semantic rule violation found by the
/// analyzer. Semantic errors are collected rather than aborting the pass, so
/// one compilation reports as many of them as it can find.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SemanticError {
    /// The function or method scope the error was found in, if any.
    pub function: Option<String>,
    /// Human-readable description of the violation.
    pub message: String,
}

impl SemanticError {
    pub fn new(function: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            function: function.map(|f| f.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for SemanticError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.function {
            Some(func) => write!(f, "in {}: {}", func, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A compilation error.
///
/// Every pass reports failure through this one sum type; there is no panicking
/// control flow across pass boundaries. The variants mirror the phases of the
/// pipeline so a driver can distinguish malformed input from internal bugs.
#[derive(Clone, Debug, PartialEq)]
pub enum CompileError {
    /// The input AST is malformed: a null body, an unknown declaration kind,
    /// or a statement where none is permitted.
    Structural(String),

    /// Class layout could not be finalized: circular inheritance, an unknown
    /// parent class, or an attempt to override a final method.
    ClassLayout(String),

    /// The analyzer collected one or more semantic errors. Compilation is
    /// rejected before code generation; no partial output is produced.
    Rejected(Vec<SemanticError>),

    /// The register allocator reached a state that violates its own
    /// invariants. This always indicates a bug in the allocator, never in
    /// user input.
    AllocatorInvariant(String),

    /// The code generator reached a state that violates its own invariants
    /// (missing CFG, unknown branch target, unknown frame slot).
    CodegenInvariant(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Structural(msg) => write!(f, "malformed AST: {msg}"),
            Self::ClassLayout(msg) => write!(f, "class layout error: {msg}"),
            Self::Rejected(errors) => {
                write!(f, "compilation rejected with {} semantic error(s)", errors.len())?;
                for err in errors {
                    write!(f, "\n  {err}")?;
                }
                Ok(())
            }
            Self::AllocatorInvariant(msg) => write!(f, "allocator invariant violated: {msg}"),
            Self::CodegenInvariant(msg) => write!(f, "codegen invariant violated: {msg}"),
        }
    }
}

impl std::error::Error for CompileError {}

/// A convenient alias for a `Result` that uses `CompileError` as the error.
pub type CompileResult<T> = Result<T, CompileError>;
