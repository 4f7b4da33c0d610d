use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("content-type {0:?} cannot contain \":\"")]
    InvalidContentType(String),
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl BrokerError {
    /// Whether the caller sent something the broker refuses to accept.
    pub fn is_validation(&self) -> bool {
        matches!(self, BrokerError::InvalidContentType(_))
    }
}
