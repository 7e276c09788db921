//! In-process transport that records instead of delivering.

use async_trait::async_trait;
use lettre::AsyncTransport;
use lettre::transport::stub::AsyncStubTransport;

use super::{MailTransport, OutgoingMessage, SendReceipt};
use crate::{Error, Result};

/// Transport used as the fallback and in tests.
#[derive(Clone)]
pub struct StubTransport {
    name: String,
    healthy: bool,
    inner: AsyncStubTransport,
}

impl StubTransport {
    /// A stub that accepts every message.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            inner: AsyncStubTransport::new_ok(),
        }
    }

    /// A stub that rejects every message and fails verification.
    #[must_use]
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            inner: AsyncStubTransport::new_error(),
        }
    }

    /// Raw messages accepted so far.
    pub async fn sent(&self) -> Vec<String> {
        self.inner
            .messages()
            .await
            .into_iter()
            .map(|(_, raw)| raw)
            .collect()
    }
}

#[async_trait]
impl MailTransport for StubTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<SendReceipt> {
        let email = message.to_lettre()?;
        self.inner
            .send(email)
            .await
            .map_err(|e| Error::Transport(format!("{}: {e}", self.name)))?;
        Ok(SendReceipt {
            message_id: message.message_id.clone(),
            provider: self.name.clone(),
        })
    }

    async fn verify(&self) -> Result<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(Error::Transport(format!("{}: stub configured to fail", self.name)))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn message() -> OutgoingMessage {
        OutgoingMessage::new("a@sys.local", "Hello", "Body", "<7@ssmail.local>").to("c@ext.com")
    }

    #[tokio::test]
    async fn test_records_sent_messages() {
        let stub = StubTransport::new("stub");
        let receipt = stub.send(&message()).await.unwrap();
        assert_eq!(receipt.provider, "stub");
        assert_eq!(receipt.message_id, "<7@ssmail.local>");

        let sent = stub.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Subject: Hello"));
        assert!(stub.verify().await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_stub() {
        let stub = StubTransport::failing("broken");
        assert!(matches!(stub.send(&message()).await, Err(Error::Transport(_))));
        assert!(stub.verify().await.is_err());
    }
}
