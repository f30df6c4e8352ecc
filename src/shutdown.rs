use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
    time::{Instant, timeout_at},
};
use tracing::{error, info, warn};

use crate::{clients::BrokerChannel, models::status::Resolution};

/// Receiving half of the shutdown flag, held by the dispatcher loop.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been requested (or the coordinator is gone).
    pub async fn recv(&mut self) {
        let _ = self.receiver.wait_for(|triggered| *triggered).await;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub failed: usize,
    /// Deliveries still running at the deadline; left unacknowledged for redelivery.
    pub aborted: usize,
}

pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);

        Self { sender, timeout }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown requested, no longer accepting messages");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Triggers shutdown on SIGINT or SIGTERM. Handlers are installed before
    /// this returns; failing to install them is an error.
    pub fn listen_for_signals(coordinator: &Arc<Self>) -> Result<JoinHandle<()>, Error> {
        let mut signals = TerminationSignals::install()?;
        let coordinator = Arc::clone(coordinator);

        Ok(tokio::spawn(async move {
            let signal = signals.recv().await;
            info!(signal, "Termination signal received");

            coordinator.trigger();
        }))
    }

    /// Stops consumption, waits for in-flight deliveries up to the grace
    /// timeout, then closes the broker channel and connection.
    pub async fn shutdown(
        &self,
        in_flight: JoinSet<Resolution>,
        channel: &dyn BrokerChannel,
    ) -> DrainReport {
        if let Err(e) = channel.stop_consuming().await {
            warn!(error = %e, "Failed to stop consumer, continuing shutdown");
        }

        let report = self.drain(in_flight).await;

        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close broker connection cleanly");
        }

        info!(
            completed = report.completed,
            failed = report.failed,
            aborted = report.aborted,
            "Shutdown complete"
        );

        report
    }

    pub async fn drain(&self, mut in_flight: JoinSet<Resolution>) -> DrainReport {
        let deadline = Instant::now() + self.timeout;
        let mut report = DrainReport::default();

        info!(
            in_flight = in_flight.len(),
            timeout_ms = self.timeout.as_millis() as u64,
            "Draining in-flight deliveries"
        );

        loop {
            let next = timeout_at(deadline, in_flight.join_next()).await;

            match next {
                Ok(Some(Ok(_))) => report.completed += 1,
                Ok(Some(Err(e))) => {
                    error!(error = %e, "Delivery task failed while draining");
                    report.failed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    report.aborted = in_flight.len();
                    warn!(
                        aborted = report.aborted,
                        "Grace period elapsed, abandoning in-flight deliveries"
                    );
                    in_flight.shutdown().await;
                    break;
                }
            }
        }

        report
    }
}

#[cfg(unix)]
struct TerminationSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn install() -> Result<Self, Error> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn install() -> Result<Self, Error> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Ctrl-C listener failed, shutdown needs another signal");
            std::future::pending::<()>().await;
        }

        "CTRL_C"
    }
}
