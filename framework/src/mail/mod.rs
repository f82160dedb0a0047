//! Template rendering and SMTP delivery.
//!
//! This module provides a thin abstraction over [lettre](https://lettre.rs) plus
//! the line-oriented template format used by email jobs.
//!
//! # Quick Start
//!
//! ```ignore
//! // 1. Build a mailer from configuration
//! let mailer = SmtpMailer::from_config(config.mailer.clone())?;
//!
//! // 2. Render a template
//! let templates = TemplateRenderer::new(FsTemplates::new("templates"));
//! let rendered = templates.render("forgot_cert", &replacements).await?;
//!
//! // 3. Send it
//! mailer.send(&Email::html("user@example.com", rendered.subject, rendered.body)).await?;
//! ```
//!
//! # Environment Variables
//!
//! [`MailerConfig`] is read with [`EnvConfig`](crate::config::EnvConfig):
//!
//! | Variable | Required | Description |
//! |----------|----------|-------------|
//! | `SMTP_SERVER` | Yes | SMTP server hostname |
//! | `SMTP_PORT` | No | Port (default: 587, also used when the value is invalid) |
//! | `SMTP_USERNAME` | No | Username for authentication |
//! | `SMTP_PASSWORD` | No | Password for authentication |
//! | `SMTP_SENDER` | Yes | Sender address |
//! | `SMTP_TLS` | No | `starttls` (default), `tls`, or `none`; other values are rejected |
//! | `SMTP_TIMEOUT` | No | Connection timeout in seconds (default: 10) |

mod mailer;
mod message;
mod template;

pub use mailer::{Mailer, MailerConfig, SmtpMailer};
pub use message::Email;
pub use template::{
    template_for_purpose, FsTemplates, RenderedMessage, StaticTemplates, TemplateError,
    TemplateRenderer, TemplateSource, PURPOSE_TEMPLATES,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    #[error("unknown SMTP TLS mode {0:?}, expected starttls, tls or none")]
    InvalidTlsMode(String),

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// Failure reported by a non-SMTP [`Mailer`].
    #[error("transport error: {0}")]
    Transport(String),
}
