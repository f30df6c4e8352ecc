use anyhow::{Error, Result};
use notification_worker::{config::Config, utils::init_tracing, worker};
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_format);

    worker::run(config)
        .await
        .inspect_err(|e| error!(error = %format!("{:#}", e), "Notification worker terminated"))
}
