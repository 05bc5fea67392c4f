use thiserror::Error;

use crate::log::entry::LogIndex;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Missing log entry at index {0}")]
    MissingLogEntry(LogIndex),

    #[error("No majority reached: {0}")]
    NoMajorityReached(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("State machine error: {0}")]
    StateMachine(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for RaftError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for RaftError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}
