use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::{Stream, stream};
use notification_worker::{
    clients::{BrokerChannel, mailer::Mailer},
    config::Config,
    models::{
        error::DeliveryError,
        message::{DlqMessage, IncomingMessage, NotificationRequest},
    },
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCall {
    Ack(u64),
    Reject { delivery_tag: u64, requeue: bool },
    PublishRetry { attempt: u32, delay: Duration },
    PublishDlq(Box<DlqMessage>),
    StopConsuming,
    Close,
}

/// In-memory broker channel that records every call made on it.
#[derive(Default)]
pub struct RecordingChannel {
    calls: Mutex<Vec<ChannelCall>>,
    fail_retry_publish: bool,
    fail_dlq_publish: bool,
}

impl RecordingChannel {
    pub fn failing_retry() -> Self {
        Self {
            fail_retry_publish: true,
            ..Self::default()
        }
    }

    pub fn failing_dlq() -> Self {
        Self {
            fail_dlq_publish: true,
            ..Self::default()
        }
    }

    /// Neither the retry queue nor the dead-letter queue accepts publishes.
    pub fn failing_publishes() -> Self {
        Self {
            fail_retry_publish: true,
            fail_dlq_publish: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of ack/reject calls made per delivery tag.
    pub fn resolutions_per_tag(&self) -> HashMap<u64, usize> {
        let mut counts = HashMap::new();
        for call in self.calls() {
            match call {
                ChannelCall::Ack(tag) | ChannelCall::Reject { delivery_tag: tag, .. } => {
                    *counts.entry(tag).or_insert(0) += 1;
                }
                _ => {}
            }
        }
        counts
    }

    pub fn retry_attempts(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChannelCall::PublishRetry { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DlqMessage> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChannelCall::PublishDlq(message) => Some(*message),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ChannelCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BrokerChannel for RecordingChannel {
    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.record(ChannelCall::Ack(delivery_tag));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.record(ChannelCall::Reject {
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn publish_retry(
        &self,
        _payload: &[u8],
        attempt: u32,
        delay: Duration,
    ) -> Result<(), Error> {
        if self.fail_retry_publish {
            return Err(anyhow!("retry queue unavailable"));
        }
        self.record(ChannelCall::PublishRetry { attempt, delay });
        Ok(())
    }

    async fn publish_to_dlq(&self, message: &DlqMessage) -> Result<(), Error> {
        if self.fail_dlq_publish {
            return Err(anyhow!("dead-letter queue unavailable"));
        }
        self.record(ChannelCall::PublishDlq(Box::new(message.clone())));
        Ok(())
    }

    async fn stop_consuming(&self) -> Result<(), Error> {
        self.record(ChannelCall::StopConsuming);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.record(ChannelCall::Close);
        Ok(())
    }
}

/// Mailer that replays scripted results and tracks how many sends overlap.
#[derive(Default)]
pub struct ScriptedMailer {
    results: Mutex<VecDeque<Result<(), DeliveryError>>>,
    fallback: Option<DeliveryError>,
    delay: Duration,
    sent: Mutex<Vec<NotificationRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedMailer {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing_with(error: DeliveryError) -> Self {
        Self {
            fallback: Some(error),
            ..Self::default()
        }
    }

    pub fn with_results(results: Vec<Result<(), DeliveryError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> Vec<NotificationRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&self, request: &NotificationRequest) -> Result<(), DeliveryError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.sent.lock().unwrap().push(request.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| match &self.fallback {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            });

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        result
    }
}

pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let pairs = overrides
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()));

    Config::from_pairs(pairs).expect("test config should be valid")
}

pub fn payload(to: &str, subject: &str, text: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "to": to,
        "subject": subject,
        "text": text,
    }))
    .unwrap()
}

pub fn incoming(delivery_tag: u64, data: Vec<u8>, prior_attempts: u32) -> IncomingMessage {
    IncomingMessage {
        delivery_tag,
        data,
        redelivered: prior_attempts > 0,
        prior_attempts,
    }
}

pub fn valid_message(delivery_tag: u64) -> IncomingMessage {
    incoming(
        delivery_tag,
        payload(&format!("user{}@example.com", delivery_tag), "Hello", "Body"),
        0,
    )
}

/// Delivery stream fed from a channel, standing in for a live consumer.
pub fn channel_stream(
    receiver: mpsc::UnboundedReceiver<IncomingMessage>,
) -> impl Stream<Item = Result<IncomingMessage, Error>> + Send {
    stream::unfold(receiver, |mut receiver| async move {
        receiver
            .recv()
            .await
            .map(|message| (Ok::<_, Error>(message), receiver))
    })
}

pub fn finite_stream(
    messages: Vec<IncomingMessage>,
) -> impl Stream<Item = Result<IncomingMessage, Error>> + Send {
    stream::iter(messages.into_iter().map(Ok::<_, Error>))
}
