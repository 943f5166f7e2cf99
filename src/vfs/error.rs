//! The closed error taxonomy the core hands back to the kernel bridge.
//! Every backend error is routed through [`FsError::from_object`]; nothing
//! backend-specific escapes the core.

use crate::cadapter::client::ObjectError;
use thiserror::Error;
use tracing::warn;

/// `Clone` so a write handle can hold an error sticky and return the same
/// value from every later write and the flush.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("not found")]
    NotFound,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("invalid argument")]
    Invalid,

    #[error("operation not supported")]
    NotSupported,

    #[error("transport error: {0}")]
    Transport(String),
}

impl FsError {
    pub fn from_object(err: ObjectError) -> Self {
        match err.status() {
            Some(404) => FsError::NotFound,
            Some(405) => FsError::NotSupported,
            _ => {
                warn!(error = %err, "unmapped object store error");
                FsError::Transport(err.to_string())
            }
        }
    }
}

impl From<ObjectError> for FsError {
    fn from(err: ObjectError) -> Self {
        FsError::from_object(err)
    }
}

pub type FsResult<T> = Result<T, FsError>;
