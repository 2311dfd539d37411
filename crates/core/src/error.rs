use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid tool name: {0:?}")]
    InvalidToolName(String),

    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
