use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use anyhow::Error;
use futures_util::{Stream, StreamExt};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    clients::{BrokerChannel, mailer::Mailer},
    codec,
    config::Config,
    models::{
        error::{DecodeError, DeliveryError},
        message::{DeliveryAttempt, DlqMessage, IncomingMessage},
        retry::RetryConfig,
        status::{Disposition, FailureClass, FailureDisposition, Outcome, Resolution},
    },
    policy::{classify, decide},
    shutdown::ShutdownSignal,
    utils::with_jitter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    ConnectionLost,
}

/// Why the consumer loop stopped, plus the deliveries still being worked on.
pub struct RunOutcome {
    pub reason: StopReason,
    pub in_flight: JoinSet<Resolution>,
}

pub struct Dispatcher {
    channel: Arc<dyn BrokerChannel>,
    mailer: Arc<dyn Mailer>,
    retry_config: RetryConfig,
    send_timeout: Duration,
    slots: Arc<Semaphore>,
    /// Attempts spent on payloads that were rejected back onto the work queue.
    /// A plain reject cannot rewrite the attempt header, so the count lives here.
    held_back: Mutex<HashMap<u64, u32>>,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn BrokerChannel>, mailer: Arc<dyn Mailer>, config: &Config) -> Self {
        Self {
            channel,
            mailer,
            retry_config: config.retry_config(),
            send_timeout: config.send_timeout(),
            slots: Arc::new(Semaphore::new(usize::from(config.prefetch_count))),
            held_back: Mutex::new(HashMap::new()),
        }
    }

    /// Pulls deliveries until shutdown or until the stream fails, running at
    /// most `prefetch_count` of them at once.
    ///
    /// A slot is claimed before the next delivery is pulled, so nothing is
    /// taken off the stream that cannot be worked on immediately.
    pub async fn run<S>(self: Arc<Self>, deliveries: S, mut shutdown: ShutdownSignal) -> RunOutcome
    where
        S: Stream<Item = Result<IncomingMessage, Error>> + Send,
    {
        let mut deliveries = std::pin::pin!(deliveries);
        let mut in_flight = JoinSet::new();

        info!(
            slots = self.slots.available_permits(),
            "Notification dispatcher started"
        );

        let reason = loop {
            reap_finished(&mut in_flight);

            let permit = tokio::select! {
                biased;
                _ = shutdown.recv() => break StopReason::Shutdown,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break StopReason::Shutdown,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => break StopReason::Shutdown,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let dispatcher = Arc::clone(&self);
                    in_flight.spawn(async move {
                        let resolution = dispatcher.handle(message).await;
                        drop(permit);
                        resolution
                    });
                }
                Some(Err(e)) => {
                    error!(error = %e, "Delivery stream failed");
                    break StopReason::ConnectionLost;
                }
                None => {
                    warn!("Delivery stream ended");
                    break StopReason::ConnectionLost;
                }
            }
        };

        info!(
            reason = ?reason,
            in_flight = in_flight.len(),
            "Notification dispatcher stopped"
        );

        RunOutcome { reason, in_flight }
    }

    /// Decodes, delivers and resolves one message. The delivery tag is
    /// acknowledged or rejected exactly once before this returns.
    pub async fn handle(&self, message: IncomingMessage) -> Resolution {
        let request = match codec::decode(&message.data) {
            Ok(request) => request,
            Err(e) => return self.drop_poison(&message, e).await,
        };

        let digest = payload_digest(&message.data);
        let prior_attempts = match self.held_back.lock().await.get(&digest) {
            Some(held) => message.prior_attempts.max(*held),
            None => message.prior_attempts,
        };
        let attempt = DeliveryAttempt::new(request, message.delivery_tag, prior_attempts);

        debug!(
            trace_id = %attempt.trace_id,
            delivery_tag = attempt.delivery_tag,
            attempts = attempt.attempts_made(),
            redelivered = message.redelivered,
            "Processing notification"
        );

        // Past the budget only the dead-letter publish is still owed.
        if attempt.attempts_made() > self.retry_config.max_attempts {
            let failure = DeliveryError::AttemptsExhausted(prior_attempts);
            return self.resolve_failure(&message, &attempt, digest, failure).await;
        }

        let sent = match timeout(self.send_timeout, self.mailer.send(&attempt.request)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
        };

        match sent {
            Ok(()) => {
                self.held_back.lock().await.remove(&digest);
                self.acknowledge(attempt.delivery_tag).await;
                self.report(&attempt, Disposition::Ack, Outcome::Delivered, None)
            }
            Err(e) => self.resolve_failure(&message, &attempt, digest, e).await,
        }
    }

    async fn resolve_failure(
        &self,
        message: &IncomingMessage,
        attempt: &DeliveryAttempt,
        digest: u64,
        failure: DeliveryError,
    ) -> Resolution {
        let class = classify(&failure);
        let disposition = decide(class, attempt.attempts_made(), &self.retry_config);
        let reason = failure.to_string();

        let published = match disposition {
            FailureDisposition::Retry { delay } => self
                .channel
                .publish_retry(&message.data, attempt.attempts_made(), with_jitter(delay))
                .await
                .map(|_| Outcome::RetryScheduled),
            FailureDisposition::DeadLetter => self
                .channel
                .publish_to_dlq(&DlqMessage::new(attempt, class, reason.clone()))
                .await
                .map(|_| Outcome::DeadLettered),
        };

        let outcome = match published {
            Ok(outcome) => {
                self.held_back.lock().await.remove(&digest);
                self.acknowledge(attempt.delivery_tag).await;
                outcome
            }
            Err(e) => {
                error!(
                    trace_id = %attempt.trace_id,
                    delivery_tag = attempt.delivery_tag,
                    disposition = %Disposition::from(disposition),
                    error = %e,
                    "Failed to publish disposition, holding message back"
                );
                self.hold_back(message, attempt, digest, disposition).await
            }
        };

        self.report(
            attempt,
            disposition.into(),
            outcome,
            Some((class, reason.as_str())),
        )
    }

    /// Hands a message whose disposition could not be published back to the
    /// broker without losing its attempt count.
    ///
    /// A message bound for the dead-letter queue is recorded as having spent
    /// its whole budget, so later passes only retry the dead-letter publish and
    /// never send it again.
    async fn hold_back(
        &self,
        message: &IncomingMessage,
        attempt: &DeliveryAttempt,
        digest: u64,
        disposition: FailureDisposition,
    ) -> Outcome {
        let attempts_made = attempt.attempts_made();
        let delay = with_jitter(self.retry_config.delay_after(attempts_made));

        let spent = match disposition {
            FailureDisposition::Retry { .. } => attempts_made,
            FailureDisposition::DeadLetter => {
                let spent = attempts_made.max(self.retry_config.max_attempts);

                match self.channel.publish_retry(&message.data, spent, delay).await {
                    Ok(()) => {
                        self.held_back.lock().await.remove(&digest);
                        self.acknowledge(attempt.delivery_tag).await;
                        return Outcome::Requeued;
                    }
                    Err(e) => warn!(
                        trace_id = %attempt.trace_id,
                        error = %e,
                        "Retry queue unavailable, rejecting after local backoff"
                    ),
                }

                spent
            }
        };

        self.held_back.lock().await.insert(digest, spent);

        sleep(delay).await;
        self.reject(attempt.delivery_tag, true).await;

        Outcome::Requeued
    }

    async fn drop_poison(&self, message: &IncomingMessage, error: DecodeError) -> Resolution {
        // No discard primitive exists; the ack removes it, this log keeps it visible.
        self.acknowledge(message.delivery_tag).await;

        let resolution = Resolution {
            delivery_tag: message.delivery_tag,
            disposition: Disposition::Drop,
            outcome: Outcome::Dropped,
            trace_id: None,
            attempts: message.prior_attempts.saturating_add(1),
        };

        error!(
            delivery_tag = resolution.delivery_tag,
            attempts = resolution.attempts,
            disposition = %resolution.disposition,
            outcome = %resolution.outcome,
            payload_bytes = message.data.len(),
            error = %error,
            "Malformed notification dropped"
        );

        resolution
    }

    async fn acknowledge(&self, delivery_tag: u64) {
        if let Err(e) = self.channel.acknowledge(delivery_tag).await {
            error!(delivery_tag, error = %e, "Acknowledgement failed, broker will redeliver");
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) {
        if let Err(e) = self.channel.reject(delivery_tag, requeue).await {
            error!(delivery_tag, error = %e, "Reject failed, broker will redeliver");
        }
    }

    fn report(
        &self,
        attempt: &DeliveryAttempt,
        disposition: Disposition,
        outcome: Outcome,
        failure: Option<(FailureClass, &str)>,
    ) -> Resolution {
        let resolution = Resolution {
            delivery_tag: attempt.delivery_tag,
            disposition,
            outcome,
            trace_id: Some(attempt.trace_id.clone()),
            attempts: attempt.attempts_made(),
        };

        let trace_id = attempt.trace_id.as_str();
        let recipient = attempt.request.to.as_str();
        let (class, error) = match failure {
            Some((class, error)) => (Some(class.as_str()), Some(error)),
            None => (None, None),
        };

        match outcome {
            Outcome::Delivered => info!(
                trace_id,
                recipient,
                attempts = resolution.attempts,
                disposition = %disposition,
                outcome = %outcome,
                "Notification delivered"
            ),
            Outcome::RetryScheduled | Outcome::Requeued => warn!(
                trace_id,
                recipient,
                attempts = resolution.attempts,
                disposition = %disposition,
                outcome = %outcome,
                failure_class = class,
                error,
                "Notification delivery failed, will retry"
            ),
            Outcome::DeadLettered | Outcome::Dropped => error!(
                trace_id,
                recipient,
                attempts = resolution.attempts,
                disposition = %disposition,
                outcome = %outcome,
                failure_class = class,
                error,
                "Notification delivery abandoned"
            ),
        }

        resolution
    }
}

fn payload_digest(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

fn reap_finished(in_flight: &mut JoinSet<Resolution>) {
    while let Some(result) = in_flight.try_join_next() {
        if let Err(e) = result {
            error!(error = %e, "Delivery task panicked");
        }
    }
}
