//! Named transports, provider selection and external fetch fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::credentials::{IMAP_CREDENTIAL, SMTP_CREDENTIAL, resolve_secret};
use super::{FetchedMail, ImapFetcher, MailFetcher, MailTransport, SmtpTransport, StubTransport};
use crate::config::{LinkedAccount, STUB_FALLBACK, TransportConfig};
use crate::message::address_domain;

struct Entry {
    transport: Arc<dyn MailTransport>,
    domains: Vec<String>,
    healthy: AtomicBool,
}

impl Entry {
    fn serves(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// A transport picked for one send.
#[derive(Clone)]
pub struct Selection {
    /// The transport to send through.
    pub transport: Arc<dyn MailTransport>,
    /// Whether no registered provider was usable.
    pub used_fallback: bool,
}

/// Health of one registered transport.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProviderHealth {
    /// Registry name.
    pub name: String,
    /// Result of the last verification.
    pub healthy: bool,
    /// Failure message from the last verification.
    pub error: Option<String>,
}

/// A linked account with its login secret resolved.
struct PullAccount {
    account: LinkedAccount,
    secret: String,
}

/// Registered transports and linked accounts.
pub struct TransportRegistry {
    entries: Vec<Entry>,
    fallback: Option<Arc<dyn MailTransport>>,
    fetcher: Arc<dyn MailFetcher>,
    accounts: Vec<PullAccount>,
    fetch_timeout: Duration,
    fetch_window: usize,
}

impl TransportRegistry {
    /// An empty registry pulling through `fetcher`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn MailFetcher>) -> Self {
        let defaults = TransportConfig::default();
        Self {
            entries: Vec::new(),
            fallback: None,
            fetcher,
            accounts: Vec::new(),
            fetch_timeout: defaults.fetch_timeout(),
            fetch_window: defaults.fetch_window,
        }
    }

    /// Builds SMTP transports and pull accounts from configuration.
    ///
    /// Providers or accounts without a resolvable secret, or whose transport
    /// cannot be built, are skipped with a warning.
    #[must_use]
    pub fn from_config(config: &TransportConfig, linked_accounts: &[LinkedAccount]) -> Self {
        let mut registry = Self::new(Arc::new(ImapFetcher::new(config.fetch_timeout())))
            .with_fetch_limits(config.fetch_timeout(), config.fetch_window);

        for provider in &config.providers {
            let Some(secret) = resolve_secret(
                SMTP_CREDENTIAL,
                &provider.name,
                &provider.username,
                provider.secret.as_deref(),
            ) else {
                warn!("No secret for provider {}, skipping", provider.name);
                continue;
            };
            match SmtpTransport::new(provider, secret, config.send_timeout()) {
                Ok(transport) => registry.register(Arc::new(transport), provider.domains.clone()),
                Err(e) => warn!("Cannot build provider {}: {e}", provider.name),
            }
        }

        match config.fallback.as_deref() {
            None => {}
            Some(STUB_FALLBACK) => {
                registry = registry.with_fallback(Arc::new(StubTransport::new(STUB_FALLBACK)));
            }
            Some(name) => match registry.get(name) {
                Some(transport) => registry = registry.with_fallback(transport),
                None => warn!("Fallback provider {name} is not registered"),
            },
        }

        for account in linked_accounts {
            match resolve_secret(
                IMAP_CREDENTIAL,
                &account.provider,
                &account.address,
                account.secret.as_deref(),
            ) {
                Some(secret) => registry.link(account.clone(), secret),
                None => warn!(
                    "No secret for linked account {}/{}, skipping",
                    account.provider, account.address
                ),
            }
        }

        info!(
            "Transport registry: {} provider(s), {} linked account(s)",
            registry.entries.len(),
            registry.accounts.len()
        );
        registry
    }

    /// Registers a transport, preferred for the given sender domains.
    ///
    /// A transport registered under an existing name replaces it.
    pub fn register(&mut self, transport: Arc<dyn MailTransport>, domains: Vec<String>) {
        self.entries.retain(|e| e.transport.name() != transport.name());
        debug!("Registered transport {}", transport.name());
        self.entries.push(Entry {
            transport,
            domains,
            healthy: AtomicBool::new(true),
        });
    }

    /// Sets the transport used when no provider is usable.
    #[must_use]
    pub fn with_fallback(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.fallback = Some(transport);
        self
    }

    /// Sets the per-account fetch deadline and message window.
    #[must_use]
    pub const fn with_fetch_limits(mut self, timeout: Duration, window: usize) -> Self {
        self.fetch_timeout = timeout;
        self.fetch_window = window;
        self
    }

    /// Adds a linked account to pull from.
    pub fn link(&mut self, account: LinkedAccount, secret: String) {
        self.accounts.push(PullAccount { account, secret });
    }

    /// Transport registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn MailTransport>> {
        self.entries
            .iter()
            .find(|e| e.transport.name() == name)
            .map(|e| Arc::clone(&e.transport))
    }

    /// Registered names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.transport.name().to_string())
            .collect()
    }

    /// Picks a healthy provider for `from`.
    ///
    /// A provider serving the sender's domain wins, then the first healthy
    /// one. `None` when no provider is healthy.
    #[must_use]
    pub fn select_provider(&self, from: &str) -> Option<Arc<dyn MailTransport>> {
        let domain = address_domain(from);
        let mut healthy = self.entries.iter().filter(|e| e.is_healthy());
        self.entries
            .iter()
            .filter(|e| e.is_healthy())
            .find(|e| domain.is_some_and(|d| e.serves(d)))
            .or_else(|| healthy.next())
            .map(|e| Arc::clone(&e.transport))
    }

    /// Provider for `from`, or the fallback.
    #[must_use]
    pub fn resolve(&self, from: &str) -> Option<Selection> {
        if let Some(transport) = self.select_provider(from) {
            return Some(Selection {
                transport,
                used_fallback: false,
            });
        }
        self.fallback.as_ref().map(|transport| Selection {
            transport: Arc::clone(transport),
            used_fallback: true,
        })
    }

    /// Verifies every provider and records the result.
    pub async fn verify_all(&self) -> Vec<ProviderHealth> {
        let mut report = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let name = entry.transport.name().to_string();
            let result = entry.transport.verify().await;
            let healthy = result.is_ok();
            if entry.healthy.swap(healthy, Ordering::Relaxed) != healthy {
                if healthy {
                    info!("Provider {name} is healthy again");
                } else {
                    warn!("Provider {name} marked unhealthy");
                }
            }
            report.push(ProviderHealth {
                name,
                healthy,
                error: result.err().map(|e| e.to_string()),
            });
        }
        report
    }

    /// Current health flags without re-verifying.
    #[must_use]
    pub fn health(&self) -> Vec<ProviderHealth> {
        self.entries
            .iter()
            .map(|e| ProviderHealth {
                name: e.transport.name().to_string(),
                healthy: e.is_healthy(),
                error: None,
            })
            .collect()
    }

    /// Re-verifies all providers every `period` until the handle is aborted.
    #[must_use]
    pub fn spawn_revalidation(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = registry.verify_all().await;
                debug!(
                    "Revalidated {} provider(s), {} healthy",
                    report.len(),
                    report.iter().filter(|h| h.healthy).count()
                );
            }
        })
    }

    /// Pulls recent mail from every account linked to `owner`.
    ///
    /// A failing or slow account is logged and skipped; the others still
    /// contribute.
    pub async fn fetch_external_emails(&self, owner: &str) -> Vec<FetchedMail> {
        let mut all = Vec::new();
        for pull in self.accounts.iter().filter(|p| p.account.owner.eq_ignore_ascii_case(owner)) {
            let account = &pull.account;
            let fetch = self
                .fetcher
                .fetch_recent(account, &pull.secret, self.fetch_window);
            match tokio::time::timeout(self.fetch_timeout, fetch).await {
                Ok(Ok(mut fetched)) => all.append(&mut fetched),
                Ok(Err(e)) => warn!("Fetch from {}/{} failed: {e}", account.provider, account.address),
                Err(_) => warn!(
                    "Fetch from {}/{} timed out after {:?}",
                    account.provider, account.address, self.fetch_timeout
                ),
            }
        }
        all
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::{ProviderConfig, Security};
    use crate::{Error, Result};

    fn stub(name: &str) -> Arc<dyn MailTransport> {
        Arc::new(StubTransport::new(name))
    }

    fn failing(name: &str) -> Arc<dyn MailTransport> {
        Arc::new(StubTransport::failing(name))
    }

    /// Fetcher answering per provider label.
    struct ScriptedFetcher;

    #[async_trait]
    impl MailFetcher for ScriptedFetcher {
        async fn fetch_recent(
            &self,
            account: &LinkedAccount,
            _secret: &str,
            window: usize,
        ) -> Result<Vec<FetchedMail>> {
            match account.provider.as_str() {
                "down" => Err(Error::Transport("connection refused".into())),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
                provider => Ok((0..window)
                    .map(|i| FetchedMail {
                        provider: provider.to_string(),
                        from: format!("sender{i}@external.com"),
                        to: vec![account.address.clone()],
                        subject: format!("message {i}"),
                        body: String::new(),
                        date: None,
                        message_id: None,
                        attachments: Vec::new(),
                    })
                    .collect()),
            }
        }
    }

    fn account(owner: &str, provider: &str) -> LinkedAccount {
        LinkedAccount {
            owner: owner.into(),
            provider: provider.into(),
            address: format!("{provider}@external.com"),
            ..LinkedAccount::default()
        }
    }

    mod selection_tests {
        use super::*;

        #[tokio::test]
        async fn test_domain_match_wins() {
            let mut registry = TransportRegistry::new(Arc::new(ScriptedFetcher));
            registry.register(stub("general"), Vec::new());
            registry.register(stub("corp"), vec!["corp.com".into()]);

            let chosen = registry.select_provider("alice@Corp.com").unwrap();
            assert_eq!(chosen.name(), "corp");
            let chosen = registry.select_provider("alice@other.com").unwrap();
            assert_eq!(chosen.name(), "general");
        }

        #[tokio::test]
        async fn test_unhealthy_skipped_then_fallback() {
            let mut registry = TransportRegistry::new(Arc::new(ScriptedFetcher))
                .with_fallback(stub(STUB_FALLBACK));
            registry.register(failing("broken"), vec!["sys.local".into()]);
            registry.register(stub("backup"), Vec::new());

            let report = registry.verify_all().await;
            assert!(!report[0].healthy);
            assert!(report[0].error.is_some());
            assert!(report[1].healthy);

            let selection = registry.resolve("a@sys.local").unwrap();
            assert_eq!(selection.transport.name(), "backup");
            assert!(!selection.used_fallback);

            let mut only_broken = TransportRegistry::new(Arc::new(ScriptedFetcher))
                .with_fallback(stub(STUB_FALLBACK));
            only_broken.register(failing("broken"), Vec::new());
            only_broken.verify_all().await;
            let selection = only_broken.resolve("a@sys.local").unwrap();
            assert_eq!(selection.transport.name(), STUB_FALLBACK);
            assert!(selection.used_fallback);
        }

        #[tokio::test]
        async fn test_nothing_available() {
            let registry = TransportRegistry::new(Arc::new(ScriptedFetcher));
            assert!(registry.select_provider("a@sys.local").is_none());
            assert!(registry.resolve("a@sys.local").is_none());
        }

        #[tokio::test]
        async fn test_register_replaces_same_name() {
            let mut registry = TransportRegistry::new(Arc::new(ScriptedFetcher));
            registry.register(failing("relay"), Vec::new());
            registry.register(stub("relay"), Vec::new());
            assert_eq!(registry.names(), vec!["relay"]);
            assert!(registry.verify_all().await[0].healthy);
        }

        #[tokio::test(start_paused = true)]
        async fn test_revalidation_recovers_health() {
            let mut registry = TransportRegistry::new(Arc::new(ScriptedFetcher));
            registry.register(stub("relay"), Vec::new());
            registry.entries[0].healthy.store(false, Ordering::Relaxed);
            let registry = Arc::new(registry);

            let handle = registry.spawn_revalidation(Duration::from_secs(300));
            tokio::time::sleep(Duration::from_secs(301)).await;
            assert!(registry.health()[0].healthy);
            handle.abort();
        }
    }

    mod config_tests {
        use super::*;

        #[tokio::test]
        async fn test_from_config() {
            let config = TransportConfig {
                providers: vec![ProviderConfig {
                    name: "relay".into(),
                    host: "smtp.example.com".into(),
                    port: 587,
                    security: Security::StartTls,
                    username: "user".into(),
                    secret: Some("pw".into()),
                    domains: vec!["example.com".into()],
                }],
                ..TransportConfig::default()
            };
            let mut linked = account("bob@ssm.com", "gmail");
            linked.secret = Some("pw".into());

            let registry = TransportRegistry::from_config(&config, &[linked]);
            assert_eq!(registry.names(), vec!["relay"]);
            assert_eq!(registry.accounts.len(), 1);
            assert_eq!(registry.fallback.as_ref().unwrap().name(), STUB_FALLBACK);
        }

        #[tokio::test]
        async fn test_named_fallback() {
            let config = TransportConfig {
                providers: vec![ProviderConfig {
                    name: "relay".into(),
                    host: "smtp.example.com".into(),
                    port: 465,
                    secret: Some("pw".into()),
                    ..ProviderConfig::default()
                }],
                fallback: Some("relay".into()),
                ..TransportConfig::default()
            };
            let registry = TransportRegistry::from_config(&config, &[]);
            assert_eq!(registry.fallback.as_ref().unwrap().name(), "relay");
        }
    }

    mod fetch_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_failures_do_not_block_others() {
            let mut registry = TransportRegistry::new(Arc::new(ScriptedFetcher))
                .with_fetch_limits(Duration::from_secs(60), 3);
            registry.link(account("bob@ssm.com", "down"), "pw".into());
            registry.link(account("bob@ssm.com", "slow"), "pw".into());
            registry.link(account("bob@ssm.com", "gmail"), "pw".into());
            registry.link(account("carol@ssm.com", "outlook"), "pw".into());

            let fetched = registry.fetch_external_emails("bob@ssm.com").await;
            assert_eq!(fetched.len(), 3);
            assert!(fetched.iter().all(|m| m.provider == "gmail"));
        }

        #[tokio::test]
        async fn test_no_linked_accounts() {
            let registry = TransportRegistry::new(Arc::new(ScriptedFetcher));
            assert!(registry.fetch_external_emails("bob@ssm.com").await.is_empty());
        }
    }
}
