use thiserror::Error;

use crate::storage::StoreError;

/// The error kinds spec.md §7 names, each mapping to a wire tag written as
/// `-<TAG> <message>\r\n`.
#[derive(Error, Debug)]
pub enum FaktoryError {
    #[error("MALFORMED {0}")]
    Malformed(String),
    #[error("NOTFOUND {0}")]
    NotFound(String),
    #[error("SHUTDOWN {0}")]
    Shutdown(String),
    #[error("AUTH {0}")]
    Auth(String),
    #[error("STORAGE {0}")]
    Storage(String),
    #[error("INTERNAL {0}")]
    Internal(String),
}

impl FaktoryError {
    /// The wire tag for this error, e.g. `MALFORMED`.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "MALFORMED",
            Self::NotFound(_) => "NOTFOUND",
            Self::Shutdown(_) => "SHUTDOWN",
            Self::Auth(_) => "AUTH",
            Self::Storage(_) => "STORAGE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// The human-readable portion after the tag.
    pub fn message(&self) -> String {
        match self {
            Self::Malformed(m)
            | Self::NotFound(m)
            | Self::Shutdown(m)
            | Self::Auth(m)
            | Self::Storage(m)
            | Self::Internal(m) => m.clone(),
        }
    }
}

impl From<StoreError> for FaktoryError {
    fn from(value: StoreError) -> Self {
        Self::Storage(value.to_string())
    }
}
