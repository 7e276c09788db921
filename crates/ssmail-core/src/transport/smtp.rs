//! SMTP transport backed by a pooled lettre connection.

use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::debug;

use super::{MailTransport, OutgoingMessage, SendReceipt};
use crate::config::{ProviderConfig, Security};
use crate::{Error, Result};

/// A named SMTP relay.
///
/// The underlying transport keeps a connection pool, so one instance is
/// built per provider and shared for the process lifetime.
pub struct SmtpTransport {
    name: String,
    host: String,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    /// Builds the relay described by `config`, authenticating with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the TLS parameters cannot be built.
    pub fn new(config: &ProviderConfig, secret: String, timeout: Duration) -> Result<Self> {
        let builder = match config.security {
            Security::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                .tls(Tls::None),
            Security::Tls => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                .tls(Tls::Wrapper(tls_parameters(&config.host)?)),
            Security::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                    .tls(Tls::Required(tls_parameters(&config.host)?))
            }
        };

        let mailer = builder
            .port(config.port)
            .credentials(Credentials::new(config.username.clone(), secret))
            .timeout(Some(timeout))
            .build();

        Ok(Self {
            name: config.name.clone(),
            host: config.host.clone(),
            mailer,
        })
    }
}

fn tls_parameters(host: &str) -> Result<TlsParameters> {
    TlsParameters::builder(host.to_string())
        .build()
        .map_err(|e| Error::Config(format!("TLS setup for {host} failed: {e}")))
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<SendReceipt> {
        let email = message.to_lettre()?;
        let response = self
            .mailer
            .send(email)
            .await
            .map_err(|e| Error::Transport(format!("{}: {e}", self.name)))?;
        debug!(
            "{} accepted {} with code {}",
            self.host,
            message.message_id,
            response.code()
        );
        Ok(SendReceipt {
            message_id: message.message_id.clone(),
            provider: self.name.clone(),
        })
    }

    async fn verify(&self) -> Result<()> {
        match self.mailer.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Transport(format!("{}: server not ready", self.name))),
            Err(e) => Err(Error::Transport(format!("{}: {e}", self.name))),
        }
    }
}
