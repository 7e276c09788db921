//! Outbound message shape and the transport contract.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;

use crate::{Error, Result};

/// An email message to send.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// CC addresses.
    pub cc: Vec<String>,
    /// BCC addresses.
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
    /// `Message-ID` header value, also recorded on the stored copy.
    pub message_id: String,
    /// `In-Reply-To` header value.
    pub in_reply_to: Option<String>,
}

impl OutgoingMessage {
    /// Creates a new outgoing message.
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            message_id: message_id.into(),
            in_reply_to: None,
        }
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to.push(recipient.into());
        self
    }

    /// Adds a CC recipient.
    #[must_use]
    pub fn cc(mut self, recipient: impl Into<String>) -> Self {
        self.cc.push(recipient.into());
        self
    }

    /// Adds a BCC recipient.
    #[must_use]
    pub fn bcc(mut self, recipient: impl Into<String>) -> Self {
        self.bcc.push(recipient.into());
        self
    }

    /// Sets the message this one replies to.
    #[must_use]
    pub fn in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.in_reply_to = Some(message_id.into());
        self
    }

    /// Returns all recipients (to, cc, bcc).
    #[must_use]
    pub fn all_recipients(&self) -> Vec<&str> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
            .collect()
    }

    /// Builds the RFC 5322 message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if an address does not parse or there
    /// are no recipients.
    pub fn to_lettre(&self) -> Result<lettre::Message> {
        if self.all_recipients().is_empty() {
            return Err(Error::Validation("No recipients specified".into()));
        }

        let mut builder = lettre::Message::builder()
            .from(parse_mailbox(&self.from)?)
            .subject(self.subject.as_str())
            .message_id(Some(self.message_id.clone()))
            .header(ContentType::TEXT_PLAIN);
        for addr in &self.to {
            builder = builder.to(parse_mailbox(addr)?);
        }
        for addr in &self.cc {
            builder = builder.cc(parse_mailbox(addr)?);
        }
        for addr in &self.bcc {
            builder = builder.bcc(parse_mailbox(addr)?);
        }
        if let Some(parent) = &self.in_reply_to {
            builder = builder.in_reply_to(parent.clone());
        }
        builder
            .body(self.body.clone())
            .map_err(|e| Error::Validation(format!("cannot build message: {e}")))
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox> {
    address
        .trim()
        .parse()
        .map_err(|e| Error::Validation(format!("invalid address '{address}': {e}")))
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Message identifier the transport delivered under.
    pub message_id: String,
    /// Name of the transport that sent it.
    pub provider: String,
}

/// A named outbound mail transport.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the message could not be handed off.
    async fn send(&self, message: &OutgoingMessage) -> Result<SendReceipt>;

    /// Checks that the transport is reachable and its credentials work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if verification fails.
    async fn verify(&self) -> Result<()>;
}
