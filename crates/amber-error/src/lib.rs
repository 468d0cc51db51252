#![forbid(unsafe_code)]
//! Error types for amberfs.
//!
//! Defines `AmberError` and a `Result<T>` alias used throughout the
//! workspace, plus the abstract wire-level code each variant maps to at the
//! dispatcher boundary.

use thiserror::Error;

/// Unified error type for all amberfs operations.
#[derive(Debug, Error)]
pub enum AmberError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural corruption: bad superblock, digest mismatch, torn metadata.
    #[error("data integrity failure at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no space left on device")]
    NoSpace,

    #[error("out of memory")]
    NoMemory,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("blob already exists")]
    AlreadyExists,

    /// The operation is not valid in the current lifecycle state.
    #[error("bad state: {0}")]
    BadState(&'static str),

    #[error("out of range: {0}")]
    OutOfRange(&'static str),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not supported")]
    Unsupported,
}

/// Abstract wire-level status codes exposed to the filesystem dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    BadState,
    NoSpace,
    NoMemory,
    OutOfRange,
    Io,
    IoDataIntegrity,
    Unavailable,
    NotSupported,
    Cancelled,
    Internal,
}

impl AmberError {
    /// Map this error onto its wire-level code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::Io,
            Self::Corruption { .. } => ErrorCode::IoDataIntegrity,
            Self::Format(_) => ErrorCode::Internal,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::NoSpace => ErrorCode::NoSpace,
            Self::NoMemory => ErrorCode::NoMemory,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists => ErrorCode::AlreadyExists,
            Self::BadState(_) => ErrorCode::BadState,
            Self::OutOfRange(_) => ErrorCode::OutOfRange,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::Unsupported => ErrorCode::NotSupported,
        }
    }
}

/// Result alias using `AmberError`.
pub type Result<T> = std::result::Result<T, AmberError>;
