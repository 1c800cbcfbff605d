//! LiveBundle Error Types

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Checksum mismatch for {version}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        version: String,
        expected: String,
        actual: String,
    },

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("Insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("Activation of {version} failed: {reason}")]
    Activation { version: String, reason: String },

    #[error("Invalid storage location: {0}")]
    InvalidLocation(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Invalid metadata signature")]
    InvalidSignature,

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("An update cycle is already in progress")]
    Busy,

    #[error("Update cancelled")]
    Cancelled,

    #[error("Update task failed: {0}")]
    Task(String),
}

impl UpdateError {
    /// Stable machine-readable code, used as the `code` of `Failed` events
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "NetworkError",
            Self::NotFound(_) => "NotFound",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::Io(_) => "IOError",
            Self::InsufficientSpace(_) => "InsufficientSpace",
            Self::Activation { .. } => "ActivationError",
            Self::InvalidLocation(_) => "InvalidLocation",
            Self::InvalidMetadata(_) => "InvalidMetadata",
            Self::InvalidSignature => "InvalidSignature",
            Self::Archive(_) => "ArchiveError",
            Self::Manifest(_) => "ManifestError",
            Self::Busy => "Busy",
            Self::Cancelled => "Cancelled",
            Self::Task(_) => "TaskError",
        }
    }
}

impl From<io::Error> for UpdateError {
    fn from(e: io::Error) -> Self {
        if is_out_of_space(&e) {
            Self::InsufficientSpace(e.to_string())
        } else {
            Self::Io(e)
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<zip::result::ZipError> for UpdateError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Archive(e.to_string())
    }
}

impl From<tokio::task::JoinError> for UpdateError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

impl From<serde_json::Error> for UpdateError {
    fn from(e: serde_json::Error) -> Self {
        Self::Manifest(e.to_string())
    }
}

fn is_out_of_space(e: &io::Error) -> bool {
    // ENOSPC, ERROR_DISK_FULL and ERROR_HANDLE_DISK_FULL all decode to this
    e.kind() == io::ErrorKind::StorageFull
}

pub type Result<T> = std::result::Result<T, UpdateError>;
