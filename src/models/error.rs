use std::time::Duration;

use thiserror::Error;

/// A payload that can never be turned into a notification request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("field `{0}` cannot be empty")]
    EmptyField(&'static str),

    #[error("invalid recipient address `{address}`: {reason}")]
    InvalidRecipient { address: String, reason: String },
}

/// Failure reported by the mail transport, already tagged at the client boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("mail provider did not answer within {0:?}")]
    Timeout(Duration),

    #[error("mail provider throttled the request: {0}")]
    Throttled(String),

    #[error("mail provider connection failed: {0}")]
    Connection(String),

    #[error("mail provider rejected credentials: {0}")]
    Authentication(String),

    #[error("mail provider rejected recipient: {0}")]
    RejectedRecipient(String),

    #[error("mail provider rejected message: {0}")]
    Rejected(String),

    #[error("message failed validation: {0}")]
    InvalidMessage(String),

    #[error("delivery budget spent after {0} attempts")]
    AttemptsExhausted(u32),
}

#[derive(Debug, Error)]
#[error("broker unreachable after {attempts} attempts: {source}")]
pub struct ConnectionError {
    pub attempts: u32,
    #[source]
    pub source: anyhow::Error,
}
