use std::time::Duration;

use anyhow::{Error, Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info, warn};

use crate::{
    clients::BrokerChannel,
    config::Config,
    models::{
        error::ConnectionError,
        message::{DlqMessage, IncomingMessage},
    },
    utils::retry_with_backoff,
};

/// Header the worker stamps on every retry copy it republishes.
pub const ATTEMPT_HEADER: &str = "x-delivery-attempt";
/// Redelivery counter maintained by RabbitMQ quorum queues.
pub const BROKER_DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    queue_name: String,
    retry_queue_name: String,
    dead_letter_queue_name: String,
    consumer_tag: String,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        info!("RabbitMQ connection established");

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to set up QoS"))?;

        debug!(prefetch_count = config.prefetch_count, "Prefetch count set");

        channel
            .queue_declare(&config.queue_name, durable(), FieldTable::default())
            .await
            .map_err(|e| anyhow!("Failed to declare work queue: {}", e))?;

        let retry_queue_name = config.retry_queue_name();
        let mut retry_arguments = FieldTable::default();
        retry_arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        retry_arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(config.queue_name.as_str().into()),
        );

        channel
            .queue_declare(&retry_queue_name, durable(), retry_arguments)
            .await
            .map_err(|e| anyhow!("Failed to declare retry queue: {}", e))?;

        let dead_letter_queue_name = config.dead_letter_queue_name();

        channel
            .queue_declare(&dead_letter_queue_name, durable(), FieldTable::default())
            .await
            .map_err(|e| anyhow!("Failed to declare dead-letter queue: {}", e))?;

        info!(
            queue = %config.queue_name,
            retry_queue = %retry_queue_name,
            dead_letter_queue = %dead_letter_queue_name,
            "Queues declared"
        );

        Ok(Self {
            connection,
            channel,
            queue_name: config.queue_name.clone(),
            retry_queue_name,
            dead_letter_queue_name,
            consumer_tag: config.consumer_tag.clone(),
        })
    }

    pub async fn connect_with_retry(config: &Config) -> Result<Self, ConnectionError> {
        let retry_config = config.connect_retry_config();

        retry_with_backoff(&retry_config, || Self::connect(config))
            .await
            .map_err(|source| ConnectionError {
                attempts: retry_config.max_attempts,
                source,
            })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn create_consumer(&self) -> Result<Consumer, Error> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer: {}", e))?;

        info!(queue = %self.queue_name, consumer_tag = %self.consumer_tag, "Consumer created");

        Ok(consumer)
    }

    /// Adapts a lapin consumer into the dispatcher's delivery stream.
    pub fn deliveries(
        consumer: Consumer,
    ) -> impl Stream<Item = Result<IncomingMessage, Error>> + Send + 'static {
        consumer.map(|delivery| {
            delivery
                .map(incoming_from_delivery)
                .map_err(|e| anyhow!("Consumer stream failed: {}", e))
        })
    }

    async fn publish_confirmed(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), Error> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                properties,
            )
            .await
            .map_err(|e| anyhow!("Failed to publish to {}: {}", queue, e))?
            .await
            .map_err(|e| anyhow!("Publish to {} was not confirmed: {}", queue, e))?;

        match confirmation {
            Confirmation::Ack(None) => Ok(()),
            // Unroutable mandatory publishes are returned first, then acked.
            Confirmation::Ack(Some(returned)) => bail!(
                "Broker returned message published to {}: {} {}",
                queue,
                returned.reply_code,
                returned.reply_text.as_str()
            ),
            Confirmation::Nack(_) => bail!("Broker refused message published to {}", queue),
            Confirmation::NotRequested => bail!("Publisher confirms are not enabled on the channel"),
        }
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqClient {
    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| anyhow!("Failed to reject message: {}", e))?;

        Ok(())
    }

    async fn publish_retry(
        &self,
        payload: &[u8],
        attempt: u32,
        delay: Duration,
    ) -> Result<(), Error> {
        let mut headers = FieldTable::default();
        headers.insert(ATTEMPT_HEADER.into(), AMQPValue::LongLongInt(attempt.into()));

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_headers(headers)
            .with_expiration(delay.as_millis().to_string().into());

        self.publish_confirmed(&self.retry_queue_name, payload, properties)
            .await
    }

    async fn publish_to_dlq(&self, message: &DlqMessage) -> Result<(), Error> {
        let payload = serde_json::to_vec(message)?;

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into());

        self.publish_confirmed(&self.dead_letter_queue_name, &payload, properties)
            .await
    }

    async fn stop_consuming(&self) -> Result<(), Error> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to cancel consumer: {}", e))?;

        info!(consumer_tag = %self.consumer_tag, "Consumer cancelled");

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if let Err(e) = self.channel.close(200, "worker shutting down").await {
            warn!(error = %e, "Failed to close RabbitMQ channel");
        }

        self.connection
            .close(200, "worker shutting down")
            .await
            .map_err(|e| anyhow!("Failed to close RabbitMQ connection: {}", e))?;

        info!("RabbitMQ connection closed");

        Ok(())
    }
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn incoming_from_delivery(delivery: Delivery) -> IncomingMessage {
    let prior_attempts =
        prior_attempts_from(delivery.properties.headers().as_ref(), delivery.redelivered);

    IncomingMessage {
        delivery_tag: delivery.delivery_tag,
        data: delivery.data,
        redelivered: delivery.redelivered,
        prior_attempts,
    }
}

/// Attempts already made on a delivery, taken from the worker's own retry
/// header or the broker's delivery count, whichever is higher.
pub fn prior_attempts_from(headers: Option<&FieldTable>, redelivered: bool) -> u32 {
    let counted = headers.and_then(|table| {
        table
            .inner()
            .iter()
            .filter(|(name, _)| {
                name.as_str() == ATTEMPT_HEADER || name.as_str() == BROKER_DELIVERY_COUNT_HEADER
            })
            .filter_map(|(_, value)| header_count(value))
            .max()
    });

    match counted {
        Some(count) => count,
        None if redelivered => 1,
        None => 0,
    }
}

fn header_count(value: &AMQPValue) -> Option<u32> {
    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    u32::try_from(count).ok()
}
