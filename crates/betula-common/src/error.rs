//! Error types for Betula.

use crate::id::ObjectId;
use thiserror::Error;

/// Result type alias using BetulaError.
pub type Result<T> = std::result::Result<T, BetulaError>;

/// Errors that can occur in Betula operations.
///
/// The engine treats every failure except an absent key as fatal for the
/// operation in progress; there is no retry or rollback. Callers that need
/// durability across faults should checkpoint and treat the backing store
/// as their consistency boundary.
#[derive(Debug, Error)]
pub enum BetulaError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),

    // Backing store errors
    #[error("record {0} not found in backing store")]
    RecordNotFound(u64),

    #[error("backing store root pointer is corrupt")]
    CorruptRoot,

    // Swap space errors
    #[error("unknown object: {0}")]
    UnknownObject(ObjectId),

    #[error("checkpoint found no durable record for object {0}")]
    UncleanObject(ObjectId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: BetulaError = io_err.into();
        assert!(matches!(err, BetulaError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_record_not_found_display() {
        let err = BetulaError::RecordNotFound(42);
        assert_eq!(err.to_string(), "record 42 not found in backing store");
    }

    #[test]
    fn test_unknown_object_display() {
        let err = BetulaError::UnknownObject(ObjectId(7));
        assert_eq!(err.to_string(), "unknown object: obj:7");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(BetulaError::CorruptRoot)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
