//! Core configuration.
//!
//! Loaded from `<config dir>/ssmail/config.json`; every field has a default
//! so an absent file yields a working local setup. A few environment
//! variables override the file:
//!
//! - `SSMAIL_DOMAIN`: the system's own mail domain
//! - `SSMAIL_DOCUMENT_PATH`: primary store file
//! - `SSMAIL_DATABASE_URL`: secondary store URL

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Directory name under the platform config/data directories.
const APP_DIR: &str = "ssmail";

/// Config file name.
const CONFIG_FILE: &str = "config.json";

/// Domain used when none is configured.
pub const DEFAULT_MAIL_DOMAIN: &str = "ssm.com";

/// Root configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// The system's own mail domain; recipients here are delivered locally.
    pub mail_domain: String,
    /// Further domains treated as internal.
    pub extra_internal_domains: Vec<String>,
    /// Backend locations.
    pub storage: StorageConfig,
    /// Outbound transports and timeouts.
    pub transport: TransportConfig,
    /// External mailboxes pulled on behalf of local users.
    pub linked_accounts: Vec<LinkedAccount>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mail_domain: DEFAULT_MAIL_DOMAIN.to_string(),
            extra_internal_domains: Vec::new(),
            storage: StorageConfig::default(),
            transport: TransportConfig::default(),
            linked_accounts: Vec::new(),
        }
    }
}

/// Storage locations for both backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Primary document store file. `None` disables the primary backend.
    pub document_path: Option<PathBuf>,
    /// Secondary store: an `sqlite:` URL or a file path.
    pub relational_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().map_or_else(|| PathBuf::from("."), |d| d.join(APP_DIR));
        Self {
            document_path: Some(data_dir.join("mail.redb")),
            relational_url: data_dir.join("mail.sqlite").display().to_string(),
        }
    }
}

/// Connection security for transports and pull sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// No encryption (not recommended).
    None,
    /// Implicit TLS (connect directly with TLS).
    #[default]
    Tls,
    /// STARTTLS upgrade after plaintext connect.
    StartTls,
}

/// One outbound SMTP provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Registry key, e.g. `gmail`.
    pub name: String,
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Username for authentication.
    pub username: String,
    /// Secret; when absent it is looked up in the keyring or environment.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// Sender domains this provider is preferred for.
    pub domains: Vec<String>,
}

/// Transport registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Configured SMTP providers, in preference order.
    pub providers: Vec<ProviderConfig>,
    /// `"stub"`, a provider name, or `None` for no fallback.
    pub fallback: Option<String>,
    /// Deadline for one external send.
    pub send_timeout_secs: u64,
    /// Deadline for one pull session.
    pub fetch_timeout_secs: u64,
    /// Number of most recent messages pulled per linked account.
    pub fetch_window: usize,
    /// Interval between transport re-verifications.
    pub revalidate_interval_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            fallback: Some(STUB_FALLBACK.to_string()),
            send_timeout_secs: 30,
            fetch_timeout_secs: 60,
            fetch_window: 10,
            revalidate_interval_secs: 300,
        }
    }
}

/// Fallback name selecting the built-in test transport.
pub const STUB_FALLBACK: &str = "stub";

impl TransportConfig {
    /// Send deadline.
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Pull session deadline.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Re-verification interval.
    #[must_use]
    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_secs(self.revalidate_interval_secs.max(1))
    }
}

/// An external IMAP mailbox pulled for a local user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkedAccount {
    /// Local user the mail is imported for.
    pub owner: String,
    /// Provider label recorded on imported mail.
    pub provider: String,
    /// External address.
    pub address: String,
    /// IMAP hostname.
    pub host: String,
    /// IMAP port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Login name.
    pub username: String,
    /// Secret; when absent it is looked up in the keyring or environment.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
}

impl CoreConfig {
    /// Default config file location.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Loads configuration, applies environment overrides and validates.
    ///
    /// With an explicit `path` the file must exist. Without one the default
    /// location is used if present, otherwise defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration JSON.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("invalid configuration: {e}")))
    }

    /// Applies environment-style overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(domain) = lookup("SSMAIL_DOMAIN").filter(|v| !v.trim().is_empty()) {
            self.mail_domain = domain;
        }
        if let Some(path) = lookup("SSMAIL_DOCUMENT_PATH") {
            self.storage.document_path = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(url) = lookup("SSMAIL_DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.storage.relational_url = url;
        }
    }

    /// Checks invariants the rest of the crate relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.mail_domain.trim().is_empty() {
            return Err(Error::Config("mail_domain must not be empty".into()));
        }
        let mut names = HashSet::new();
        for provider in &self.transport.providers {
            if provider.name.trim().is_empty() {
                return Err(Error::Config("provider name must not be empty".into()));
            }
            if provider.name == STUB_FALLBACK {
                return Err(Error::Config(format!("provider name '{STUB_FALLBACK}' is reserved")));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(Error::Config(format!("duplicate provider '{}'", provider.name)));
            }
            if provider.port == 0 {
                return Err(Error::Config(format!("provider '{}' has port 0", provider.name)));
            }
        }
        if self.transport.revalidate_interval_secs == 0 {
            return Err(Error::Config("revalidate_interval_secs must be positive".into()));
        }
        if let Some(fallback) = &self.transport.fallback
            && fallback != STUB_FALLBACK
            && !names.contains(fallback.as_str())
        {
            return Err(Error::Config(format!("unknown fallback provider '{fallback}'")));
        }
        for account in &self.linked_accounts {
            if account.port == 0 {
                return Err(Error::Config(format!(
                    "linked account '{}' has port 0",
                    account.address
                )));
            }
        }
        Ok(())
    }

    /// Every domain whose recipients are served locally, lower-cased.
    #[must_use]
    pub fn internal_domains(&self) -> Vec<String> {
        std::iter::once(&self.mail_domain)
            .chain(&self.extra_internal_domains)
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        assert_eq!(config.mail_domain, DEFAULT_MAIL_DOMAIN);
        assert_eq!(config.transport.fetch_window, 10);
        assert_eq!(config.transport.send_timeout(), Duration::from_secs(30));
        assert_eq!(config.transport.fallback.as_deref(), Some(STUB_FALLBACK));
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CoreConfig::from_json(
            r#"{
                "mail_domain": "sys.local",
                "transport": {
                    "providers": [{"name": "corp", "host": "smtp.corp", "port": 587,
                                   "security": "starttls", "username": "u", "domains": ["corp.com"]}]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mail_domain, "sys.local");
        assert_eq!(config.transport.providers[0].security, Security::StartTls);
        assert_eq!(config.transport.fetch_timeout_secs, 60);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_json() {
        assert!(matches!(
            CoreConfig::from_json("{ not json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn validation_rules() {
        let mut config = CoreConfig {
            mail_domain: " ".into(),
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());

        config.mail_domain = "sys.local".into();
        let provider = ProviderConfig {
            name: "corp".into(),
            host: "smtp.corp".into(),
            port: 465,
            ..ProviderConfig::default()
        };
        config.transport.providers = vec![provider.clone(), provider.clone()];
        assert!(config.validate().is_err());

        config.transport.providers = vec![ProviderConfig { port: 0, ..provider.clone() }];
        assert!(config.validate().is_err());

        config.transport.providers = vec![provider];
        config.transport.fallback = Some("missing".into());
        assert!(config.validate().is_err());

        config.transport.fallback = Some("corp".into());
        config.validate().unwrap();

        config.transport.revalidate_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SSMAIL_DOMAIN", "corp.example"),
            ("SSMAIL_DOCUMENT_PATH", ""),
            ("SSMAIL_DATABASE_URL", "sqlite::memory:"),
        ]);
        let mut config = CoreConfig::default();
        config.apply_overrides(|key| env.get(key).map(ToString::to_string));
        assert_eq!(config.mail_domain, "corp.example");
        assert_eq!(config.storage.document_path, None);
        assert_eq!(config.storage.relational_url, "sqlite::memory:");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"extra_internal_domains": ["Corp.Example"]}"#).unwrap();
        let config = CoreConfig::from_file(&path).unwrap();
        assert_eq!(config.internal_domains(), vec!["ssm.com", "corp.example"]);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            CoreConfig::load(Some(&missing)),
            Err(Error::Config(_))
        ));
    }
}
