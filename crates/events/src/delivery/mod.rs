//! Outbound notification channels.
//!
//! A [`Notification`] is channel-neutral; a [`Notifier`] delivers it. The
//! SMTP implementation lives in [`email`].

pub mod email;

use async_trait::async_trait;

pub use email::EmailError;

/// A message addressed to one or more people.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    /// Overrides the channel's default sender when set.
    pub from_address: Option<String>,
    pub recipients: Vec<String>,
}

impl Notification {
    pub fn new(subject: impl Into<String>, text_body: impl Into<String>) -> Self {
        let text_body = text_body.into();
        Self {
            subject: subject.into(),
            html_body: text_to_html(&text_body),
            text_body,
            from_address: None,
            recipients: Vec::new(),
        }
    }

    pub fn to(mut self, recipients: impl IntoIterator<Item = String>) -> Self {
        self.recipients.extend(recipients);
        self.recipients.sort();
        self.recipients.dedup();
        self
    }

    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from_address = Some(address.into());
        self
    }
}

/// Render a plain-text body as minimal HTML, one paragraph per line.
fn text_to_html(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let escaped = line
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            format!("<p>{escaped}</p>")
        })
        .collect()
}

/// Error type for notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Email(#[from] EmailError),

    #[error("Notification has no recipients")]
    NoRecipients,
}

/// Delivers notifications. Callers treat delivery as best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipients_are_deduplicated() {
        let n = Notification::new("s", "b").to([
            "b@example.org".to_string(),
            "a@example.org".to_string(),
            "b@example.org".to_string(),
        ]);
        assert_eq!(n.recipients, vec!["a@example.org", "b@example.org"]);
    }

    #[test]
    fn html_body_escapes_and_wraps_lines() {
        let n = Notification::new("s", "Change <7> approved\n\nTitle & text");
        assert_eq!(
            n.html_body,
            "<p>Change &lt;7&gt; approved</p><p>Title &amp; text</p>"
        );
    }
}
