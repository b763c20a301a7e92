//! Store error sentinels.

use lnchat_lib::{ErrorKind, LnchatError};

use crate::encryption::EncryptionError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("contact already exists")]
    ContactAlreadyExists,
    #[error("contact not found")]
    ContactNotFound,
    #[error("discussion already exists")]
    DiscussionAlreadyExists,
    #[error("discussion not found")]
    DiscussionNotFound,
    #[error("invoice {0} already exists")]
    InvoiceAlreadyExists(u64),
    #[error("invoice {0} not found")]
    InvoiceNotFound(u64),
    #[error("payment {0} already exists")]
    PaymentAlreadyExists(u64),
    #[error("payment {0} not found")]
    PaymentNotFound(u64),
    #[error("message {0} not found")]
    MessageNotFound(u64),
    #[error("message {message_id} does not belong to discussion {discussion_id}")]
    MessageInvalidDiscussion { message_id: u64, discussion_id: u64 },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContactAlreadyExists => ErrorKind::ContactAlreadyExists,
            Self::ContactNotFound => ErrorKind::ContactNotFound,
            Self::DiscussionAlreadyExists => ErrorKind::DiscussionAlreadyExists,
            Self::DiscussionNotFound => ErrorKind::DiscussionNotFound,
            Self::InvoiceAlreadyExists(_) | Self::PaymentAlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvoiceNotFound(_) | Self::PaymentNotFound(_) | Self::MessageNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::MessageInvalidDiscussion { .. } => ErrorKind::MessageInvalidDiscussion,
            Self::InvalidMessage(_) | Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Serialization(_) => ErrorKind::Marshal,
            Self::Io(_) | Self::Encryption(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for LnchatError {
    fn from(err: StoreError) -> Self {
        LnchatError::new(err.kind(), err.to_string()).with_source(err)
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_by_variant() {
        let err: LnchatError = StoreError::PaymentAlreadyExists(4).into();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(err.is_already_exists());

        let err: LnchatError = StoreError::MessageInvalidDiscussion {
            message_id: 3,
            discussion_id: 1,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::MessageInvalidDiscussion);

        let err: LnchatError = StoreError::DiscussionNotFound.into();
        assert_eq!(err.kind(), ErrorKind::DiscussionNotFound);
        assert!(!err.is_retryable());
    }
}
