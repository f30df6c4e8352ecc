pub mod mailer;
pub mod rbmq;

use std::time::Duration;

use anyhow::{Error, Result};
use async_trait::async_trait;

use crate::models::message::DlqMessage;

/// Broker operations the dispatcher and shutdown coordinator rely on.
///
/// Every `acknowledge`/`reject` must carry the exact delivery tag of the
/// message being resolved, and each tag is resolved at most once.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error>;

    /// Publishes a copy of `payload` that returns to the work queue after `delay`.
    async fn publish_retry(&self, payload: &[u8], attempt: u32, delay: Duration)
    -> Result<(), Error>;

    async fn publish_to_dlq(&self, message: &DlqMessage) -> Result<(), Error>;

    /// Asks the broker to stop delivering new messages to this consumer.
    async fn stop_consuming(&self) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}
