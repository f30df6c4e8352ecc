//! Retry and dead-letter decisions. Nothing here touches the broker or the clock.

use crate::models::{
    error::DeliveryError,
    retry::RetryConfig,
    status::{FailureClass, FailureDisposition},
};

pub fn classify(error: &DeliveryError) -> FailureClass {
    match error {
        DeliveryError::Timeout(_) | DeliveryError::Throttled(_) | DeliveryError::Connection(_) => {
            FailureClass::Transient
        }
        DeliveryError::Authentication(_)
        | DeliveryError::RejectedRecipient(_)
        | DeliveryError::Rejected(_)
        | DeliveryError::InvalidMessage(_)
        | DeliveryError::AttemptsExhausted(_) => FailureClass::Permanent,
    }
}

/// `attempts_made` counts the attempt that just failed.
pub fn decide(
    class: FailureClass,
    attempts_made: u32,
    retry_config: &RetryConfig,
) -> FailureDisposition {
    match class {
        FailureClass::Permanent => FailureDisposition::DeadLetter,
        FailureClass::Transient if attempts_made < retry_config.max_attempts => {
            FailureDisposition::Retry {
                delay: retry_config.delay_after(attempts_made),
            }
        }
        FailureClass::Transient => FailureDisposition::DeadLetter,
    }
}
