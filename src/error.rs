//! Error kinds surfaced across the page store, fsindex, writer, and channels.
//!
//! Mirrors the teacher's per-module error enums (`CodecError`,
//! `SuperblockError`, `CryptoError`) but aggregated into one type, since
//! every layer here ultimately reports through the same `Mount` surface.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CookfsError {
    #[error("entry not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("entry already exists")]
    Exists,
    #[error("bad path: {0}")]
    BadPath(String),
    #[error("archive is read-only")]
    ReadOnly,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
    #[error("compression error: {0}")]
    CompressionError(String),
    #[error("encryption error: {0}")]
    EncryptionError(String),
    #[error("could not acquire lock: {0}")]
    Locked(String),
    #[error("page store is in a fatal state")]
    FatalState,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, CookfsError>;
