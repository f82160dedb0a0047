//! Outgoing email message.

use serde::{Deserialize, Serialize};

/// A rendered email ready to hand to a [`Mailer`](super::Mailer).
///
/// The sender is not part of the message: every email leaves through the
/// address configured on the mailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    /// Recipient address.
    pub to: String,
    /// Email subject line.
    pub subject: String,
    /// HTML body content.
    pub html: String,
}

impl Email {
    /// Create an HTML email for a single recipient.
    pub fn html(
        to: impl Into<String>,
        subject: impl Into<String>,
        html: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            html: html.into(),
        }
    }
}
