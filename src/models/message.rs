use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::status::FailureClass;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub to: String,
    pub subject: String,
    pub text: String,

    #[serde(
        default,
        rename = "correlationId",
        alias = "correlation_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

/// A delivery as handed over by the broker, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
    /// Attempts already made on earlier deliveries of this payload.
    pub prior_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub request: NotificationRequest,
    pub delivery_tag: u64,
    pub prior_attempts: u32,
    pub first_seen: DateTime<Utc>,
    pub trace_id: String,
}

impl DeliveryAttempt {
    pub fn new(request: NotificationRequest, delivery_tag: u64, prior_attempts: u32) -> Self {
        // Generated ids differ across redeliveries; they only tie together one attempt's logs.
        let trace_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            request,
            delivery_tag,
            prior_attempts,
            first_seen: Utc::now(),
            trace_id,
        }
    }

    pub fn attempts_made(&self) -> u32 {
        self.prior_attempts.saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqMessage {
    pub original_message: NotificationRequest,
    pub failure_reason: String,
    pub failure_class: FailureClass,
    pub attempts: u32,
    pub first_seen_at: String,
    pub failed_at: String,
}

impl DlqMessage {
    pub fn new(attempt: &DeliveryAttempt, failure_class: FailureClass, reason: String) -> Self {
        Self {
            original_message: attempt.request.clone(),
            failure_reason: reason,
            failure_class,
            attempts: attempt.attempts_made(),
            first_seen_at: attempt
                .first_seen
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
