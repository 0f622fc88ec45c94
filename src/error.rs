//! Error types for dkg-node

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Operation id {0} is in wrong format")]
    InvalidOperationId(String),

    #[error("Operation {0} not found")]
    OperationNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Bid rejected: {0}")]
    BidRejected(String),

    #[error("Cache conflict for operation {operation_id}, field {field}")]
    CacheConflict { operation_id: String, field: String },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Quorum not reached: {0}")]
    QuorumUnreachable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Blockchain error: {0}")]
    Blockchain(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Wire codec error: {0}")]
    Codec(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Transient infrastructure failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Storage(_)
                | NodeError::Blockchain(_)
                | NodeError::Network(_)
                | NodeError::Database(_)
                | NodeError::Io(_)
        )
    }
}

/// Tag recorded next to a FAILED operation naming the phase that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    PublishStartError,
    PublishValidateAssertionError,
    PublishFindNodesError,
    PublishReplicateError,
    PublishRemoteError,
    PublishLocalStoreRemoteError,
    GetStartError,
    GetLocalError,
    GetNetworkError,
    GetRequestRemoteError,
    UpdateStartError,
    UpdateValidateAssertionError,
    UpdateReplicateError,
    UpdateRemoteError,
    UpdateRequestRemoteError,
    UpdateDeletePendingStateError,
    AskNetworkError,
    AskRequestRemoteError,
    FinalityError,
    FinalityRequestRemoteError,
    LocalStoreError,
    FindShardError,
    QuorumTimeoutError,
    EpochCheckError,
    CommandExecutorError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::PublishStartError => "PublishStartError",
            ErrorType::PublishValidateAssertionError => "PublishValidateAssertionError",
            ErrorType::PublishFindNodesError => "PublishFindNodesError",
            ErrorType::PublishReplicateError => "PublishReplicateError",
            ErrorType::PublishRemoteError => "PublishRemoteError",
            ErrorType::PublishLocalStoreRemoteError => "PublishLocalStoreRemoteError",
            ErrorType::GetStartError => "GetStartError",
            ErrorType::GetLocalError => "GetLocalError",
            ErrorType::GetNetworkError => "GetNetworkError",
            ErrorType::GetRequestRemoteError => "GetRequestRemoteError",
            ErrorType::UpdateStartError => "UpdateStartError",
            ErrorType::UpdateValidateAssertionError => "UpdateValidateAssertionError",
            ErrorType::UpdateReplicateError => "UpdateReplicateError",
            ErrorType::UpdateRemoteError => "UpdateRemoteError",
            ErrorType::UpdateRequestRemoteError => "UpdateRequestRemoteError",
            ErrorType::UpdateDeletePendingStateError => "UpdateDeletePendingStateError",
            ErrorType::AskNetworkError => "AskNetworkError",
            ErrorType::AskRequestRemoteError => "AskRequestRemoteError",
            ErrorType::FinalityError => "FinalityError",
            ErrorType::FinalityRequestRemoteError => "FinalityRequestRemoteError",
            ErrorType::LocalStoreError => "LocalStoreError",
            ErrorType::FindShardError => "FindShardError",
            ErrorType::QuorumTimeoutError => "QuorumTimeoutError",
            ErrorType::EpochCheckError => "EpochCheckError",
            ErrorType::CommandExecutorError => "CommandExecutorError",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
