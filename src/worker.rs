use std::sync::Arc;

use anyhow::{Context, Error, Result};
use lapin::Consumer;
use tracing::{info, warn};

use crate::{
    clients::{
        BrokerChannel,
        mailer::{Mailer, SmtpMailer},
        rbmq::RabbitMqClient,
    },
    config::Config,
    dispatcher::{Dispatcher, StopReason},
    shutdown::ShutdownCoordinator,
};

/// Runs the worker until a termination signal arrives.
///
/// Fails when the broker cannot be reached at startup or cannot be reached
/// again after losing the connection mid-run.
pub async fn run(config: Config) -> Result<(), Error> {
    let mailer: Arc<dyn Mailer> = Arc::new(SmtpMailer::new(&config)?);
    let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown_timeout()));
    let _signals = ShutdownCoordinator::listen_for_signals(&coordinator)
        .context("Failed to install signal handlers")?;

    let (mut broker, mut consumer) = subscribe(&config)
        .await
        .context("Broker unavailable at startup")?;

    info!(queue = %config.queue_name, "Notification worker started");

    loop {
        let channel: Arc<dyn BrokerChannel> = broker.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&channel),
            Arc::clone(&mailer),
            &config,
        ));

        let outcome = dispatcher
            .run(RabbitMqClient::deliveries(consumer), coordinator.subscribe())
            .await;

        match outcome.reason {
            StopReason::Shutdown => {
                coordinator
                    .shutdown(outcome.in_flight, channel.as_ref())
                    .await;
                return Ok(());
            }
            StopReason::ConnectionLost => {
                let report = coordinator.drain(outcome.in_flight).await;
                warn!(
                    completed = report.completed,
                    aborted = report.aborted,
                    "Broker connection lost, unacknowledged messages will be redelivered"
                );

                if let Err(e) = broker.close().await {
                    warn!(error = %e, "Failed to close lost broker connection");
                }
            }
        }

        let mut shutdown = coordinator.subscribe();
        (broker, consumer) = tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown requested while reconnecting");
                return Ok(());
            }
            subscribed = subscribe(&config) => subscribed.context("Broker reconnect exhausted")?,
        };

        info!("Reconnected to broker");
    }
}

async fn subscribe(config: &Config) -> Result<(Arc<RabbitMqClient>, Consumer), Error> {
    let broker = RabbitMqClient::connect_with_retry(config).await?;
    let consumer = broker.create_consumer().await?;

    Ok((Arc::new(broker), consumer))
}
