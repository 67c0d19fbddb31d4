//! Error taxonomies.
//!
//! - [`Trap`]: runtime faults raised while executing bytecode.
//! - [`ExecError`]: outcome of a top-level call that did not return normally.
//! - [`TranslateError`]: validation failures while translating a module.
//! - [`ParseError`]: literal parsing failures.
//! - [`HostError`]: failure reported by a host callback or import delegate.

use thiserror::Error;

use crate::types::ExternalKind;

/// All ways execution of bytecode can fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Trap {
    #[error("out of bounds memory access")]
    MemoryAccessOutOfBounds,
    #[error("atomic memory access is unaligned")]
    AtomicMemoryAccessUnaligned,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,
    #[error("undefined table index")]
    UndefinedTableIndex,
    #[error("uninitialized table element")]
    UninitializedTableElement,
    #[error("unreachable executed")]
    Unreachable,
    #[error("indirect call signature mismatch")]
    IndirectCallSignatureMismatch,
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("value stack exhausted")]
    ValueStackExhausted,
    #[error("host result type mismatch")]
    HostResultTypeMismatch,
    #[error("host function trapped")]
    HostTrapped,
}

pub type Result<T> = std::result::Result<T, Trap>;

/// Why a top-level call did not produce results.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error(transparent)]
    Trap(#[from] Trap),
    #[error("argument type mismatch")]
    ArgumentTypeMismatch,
    #[error("unknown export \"{0}\"")]
    UnknownExport(String),
    #[error("export kind mismatch: \"{name}\" is a {actual}, expected {expected}")]
    ExportKindMismatch {
        name: String,
        expected: ExternalKind,
        actual: ExternalKind,
    },
}

/// A module failed validation or import resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}{message}", offset.map(|o| format!("@{o:#010x}: ")).unwrap_or_default())]
pub struct TranslateError {
    pub offset: Option<usize>,
    pub message: String,
}

impl TranslateError {
    pub fn new(message: impl Into<String>) -> Self {
        TranslateError {
            offset: None,
            message: message.into(),
        }
    }
}

/// A textual literal could not be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed literal")]
    Malformed,
    #[error("literal out of range")]
    OutOfRange,
}

/// Failure reported by embedder code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        HostError(message.into())
    }
}
