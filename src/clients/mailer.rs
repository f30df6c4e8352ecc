use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::{self, authentication::Credentials},
};
use tracing::{debug, info};

use crate::{
    config::Config,
    models::{error::DeliveryError, message::NotificationRequest},
};

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<(), DeliveryError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let from = config
            .email_from
            .parse::<Mailbox>()
            .map_err(|e| anyhow!("Invalid EMAIL_FROM address: {}", e))?;

        let host = smtp_host_for_service(&config.email_service);
        let timeout = config.send_timeout();

        let mut builder = if config.smtp_insecure {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| anyhow!("Failed to configure SMTP relay {}: {}", host, e))?
                .credentials(Credentials::new(
                    config.email_user.clone(),
                    config.email_password.clone(),
                ))
        };

        if let Some(port) = config.smtp_port {
            builder = builder.port(port);
        }

        let transport = builder.timeout(Some(timeout)).build();

        info!(
            host,
            service = %config.email_service,
            insecure = config.smtp_insecure,
            "SMTP transport initialized"
        );

        Ok(Self {
            transport,
            from,
            timeout,
        })
    }

    fn build_message(&self, request: &NotificationRequest) -> Result<Message, DeliveryError> {
        let to = request
            .to
            .parse::<Mailbox>()
            .map_err(|e| DeliveryError::InvalidMessage(format!("recipient: {}", e)))?;

        let message_id = request
            .correlation_id
            .as_ref()
            .map(|id| format!("<{}@notification-worker>", id));

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(request.subject.clone())
            .message_id(message_id)
            .header(ContentType::TEXT_PLAIN)
            .body(request.text.clone())
            .map_err(|e| DeliveryError::InvalidMessage(e.to_string()))
    }

    fn classify_smtp_error(&self, error: &smtp::Error) -> DeliveryError {
        if error.is_timeout() {
            return DeliveryError::Timeout(self.timeout);
        }

        if let Some(code) = error.status() {
            return classify_reply(&code.to_string(), error.to_string());
        }

        if error.is_permanent() {
            DeliveryError::Rejected(error.to_string())
        } else {
            DeliveryError::Connection(error.to_string())
        }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, request: &NotificationRequest) -> Result<(), DeliveryError> {
        let message = self.build_message(request)?;

        debug!(
            to = %request.to,
            correlation_id = request.correlation_id.as_deref(),
            "Sending email"
        );

        self.transport
            .send(message)
            .await
            .map_err(|e| self.classify_smtp_error(&e))?;

        Ok(())
    }
}

/// Maps an SMTP reply code to a delivery error.
pub fn classify_reply(code: &str, detail: String) -> DeliveryError {
    match code {
        "421" | "450" | "451" | "452" => DeliveryError::Throttled(detail),
        "530" | "534" | "535" => DeliveryError::Authentication(detail),
        "501" | "550" | "551" | "553" => DeliveryError::RejectedRecipient(detail),
        c if c.starts_with('4') => DeliveryError::Throttled(detail),
        c if c.starts_with('5') => DeliveryError::Rejected(detail),
        _ => DeliveryError::Connection(detail),
    }
}

/// Resolves a well-known provider name to its submission host; anything else is used as a host.
pub fn smtp_host_for_service(service: &str) -> &str {
    match service.to_ascii_lowercase().as_str() {
        "gmail" | "googlemail" => "smtp.gmail.com",
        "outlook365" | "office365" => "smtp.office365.com",
        "outlook" | "hotmail" => "smtp-mail.outlook.com",
        "yahoo" => "smtp.mail.yahoo.com",
        "icloud" => "smtp.mail.me.com",
        "zoho" => "smtp.zoho.com",
        "sendgrid" => "smtp.sendgrid.net",
        "mailgun" => "smtp.mailgun.org",
        _ => service,
    }
}
