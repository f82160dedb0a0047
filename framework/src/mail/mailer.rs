//! Mailer trait and SMTP implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Deserializer};

use super::{Email, MailError};
use crate::config::lenient;

/// Async email sending trait.
///
/// The worker only depends on this trait, so tests and alternative transports
/// can stand in for SMTP. Implementations must not retry on their own.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    /// Send an email.
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Configuration for the SMTP mailer.
#[derive(Debug, Clone, Deserialize)]
pub struct MailerConfig {
    /// SMTP server hostname.
    #[serde(rename = "smtp_server")]
    pub host: String,

    /// SMTP server port (default: 587, also used for unparseable values).
    #[serde(
        rename = "smtp_port",
        default = "default_port",
        deserialize_with = "port_or_default"
    )]
    pub port: u16,

    /// SMTP username for authentication.
    #[serde(rename = "smtp_username", default)]
    pub username: Option<String>,

    /// SMTP password for authentication.
    #[serde(rename = "smtp_password", default)]
    pub password: Option<String>,

    /// Sender address for every outgoing email.
    #[serde(rename = "smtp_sender")]
    pub sender: String,

    /// TLS mode: "starttls" (default), "tls", or "none".
    #[serde(rename = "smtp_tls", default = "default_tls")]
    pub tls: String,

    /// Connection timeout in seconds (default: 10).
    #[serde(rename = "smtp_timeout", default = "default_timeout")]
    pub timeout: u64,
}

fn default_port() -> u16 {
    587
}

fn port_or_default<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let port: Option<u16> = lenient(deserializer)?;
    Ok(port.filter(|port| *port != 0).unwrap_or_else(default_port))
}

fn default_tls() -> String {
    "starttls".to_string()
}

fn default_timeout() -> u64 {
    10
}

/// SMTP-based mailer using lettre.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Create a mailer from explicit configuration.
    ///
    /// No connection is opened here; lettre connects on each send.
    pub fn from_config(config: MailerConfig) -> Result<Self, MailError> {
        let from: Mailbox = config
            .sender
            .parse()
            .map_err(|_| MailError::InvalidAddress(config.sender.clone()))?;

        let mut builder = match config.tls.trim().to_ascii_lowercase().as_str() {
            "none" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            "tls" => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
            "starttls" => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?,
            _ => return Err(MailError::InvalidTlsMode(config.tls)),
        };

        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout)));

        if let (Some(username), Some(password)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: Arc::new(builder.build()),
            from,
        })
    }

    /// Build a lettre Message from our Email type.
    fn build_message(&self, email: &Email) -> Result<Message, MailError> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|_| MailError::InvalidAddress(email.to.clone()))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&email.subject)
            .singlepart(SinglePart::html(email.html.clone()))?;

        Ok(message)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let message = self.build_message(email)?;
        self.transport.send(message).await?;
        Ok(())
    }
}
