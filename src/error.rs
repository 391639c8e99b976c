use thiserror::Error;

/// Error taxonomy shared by every layer of the storage stack.
///
/// The fine-grained variants collapse into a handful of kinds through
/// [`StorageError::kind`], which is what callers above the filesystem
/// usually branch on.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Bad block: {0}")]
    BadBlock(u32),

    #[error("Uncorrectable ECC error on page {0}")]
    Ecc(u32),

    #[error("Data error: {0}")]
    Data(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Queue full")]
    Busy,

    #[error("Invalid parameter: {0}")]
    Parameter(String),

    #[error("No valid filesystem found")]
    NoFilesystem,

    #[error("Out of space: no free sectors available")]
    OutOfSpace,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Flash operation timed out after {0} ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] toml::de::Error),
}

/// Coarse classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Hardware,
    BadBlock,
    Ecc,
    Data,
    State,
    Busy,
    Parameter,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Hardware(_)
            | StorageError::NoFilesystem
            | StorageError::OutOfSpace
            | StorageError::Timeout(_)
            | StorageError::Io(_) => ErrorKind::Hardware,
            StorageError::BadBlock(_) => ErrorKind::BadBlock,
            StorageError::Ecc(_) => ErrorKind::Ecc,
            StorageError::Data(_) | StorageError::Serialization(_) => ErrorKind::Data,
            StorageError::State(_) => ErrorKind::State,
            StorageError::Busy => ErrorKind::Busy,
            StorageError::Parameter(_)
            | StorageError::NotFound(_)
            | StorageError::AlreadyExists(_)
            | StorageError::Settings(_) => ErrorKind::Parameter,
        }
    }

    /// Errors the translation layer can recover from by relocating.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::BadBlock(_) | StorageError::Ecc(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(StorageError::Timeout(50).kind(), ErrorKind::Hardware);
        assert_eq!(StorageError::NoFilesystem.kind(), ErrorKind::Hardware);
        assert_eq!(StorageError::NotFound("/x".into()).kind(), ErrorKind::Parameter);
        assert_eq!(StorageError::Busy.kind(), ErrorKind::Busy);
        assert_eq!(StorageError::Ecc(3).kind(), ErrorKind::Ecc);
    }

    #[test]
    fn test_recoverable() {
        assert!(StorageError::BadBlock(1).is_recoverable());
        assert!(StorageError::Ecc(1).is_recoverable());
        assert!(!StorageError::Hardware("x".into()).is_recoverable());
        assert!(!StorageError::Timeout(10).is_recoverable());
    }
}
