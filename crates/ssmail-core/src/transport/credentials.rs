//! Provider secrets.
//!
//! Secrets are looked up in order: the configuration file, the platform
//! keyring (Secret Service, Keychain or Credential Manager), then the
//! `SSMAIL_SECRET_<PROVIDER>` environment variable.

use keyring::Entry;
use tracing::{debug, warn};

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "ssmail";

/// Credential type identifier for SMTP passwords.
pub const SMTP_CREDENTIAL: &str = "smtp";

/// Credential type identifier for IMAP passwords.
pub const IMAP_CREDENTIAL: &str = "imap";

/// Error type for credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Failed to access keyring.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Result type for credential operations.
pub type CredentialResult<T> = std::result::Result<T, CredentialError>;

/// Generates the keyring entry key for a credential.
fn credential_key(kind: &str, provider: &str, address: &str) -> String {
    format!("{kind}_{provider}_{address}")
}

/// Environment variable consulted last for a provider's secret.
#[must_use]
pub fn env_key(provider: &str) -> String {
    let name: String = provider
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("SSMAIL_SECRET_{name}")
}

/// Stores a secret in the system keyring.
///
/// # Errors
///
/// Returns an error if the keyring operation fails.
pub fn store_secret(
    kind: &str,
    provider: &str,
    address: &str,
    secret: &str,
) -> CredentialResult<()> {
    let entry = Entry::new(SERVICE_NAME, &credential_key(kind, provider, address))?;
    entry.set_password(secret)?;
    debug!("Stored {kind} secret for {provider}/{address}");
    Ok(())
}

/// Retrieves a secret from the system keyring.
///
/// # Errors
///
/// Returns an error if the keyring operation fails.
pub fn get_secret(kind: &str, provider: &str, address: &str) -> CredentialResult<Option<String>> {
    let entry = Entry::new(SERVICE_NAME, &credential_key(kind, provider, address))?;
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => {
            debug!("No {kind} secret found for {provider}/{address}");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Deletes a secret from the system keyring. Missing entries are not an error.
///
/// # Errors
///
/// Returns an error if the keyring operation fails.
pub fn delete_secret(kind: &str, provider: &str, address: &str) -> CredentialResult<()> {
    let entry = Entry::new(SERVICE_NAME, &credential_key(kind, provider, address))?;
    match entry.delete_credential() {
        Ok(()) => {
            debug!("Deleted {kind} secret for {provider}/{address}");
            Ok(())
        }
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => {
            warn!("Failed to delete {kind} secret: {e}");
            Err(e.into())
        }
    }
}

/// Resolves a secret from config, keyring, then environment.
#[must_use]
pub fn resolve_secret(
    kind: &str,
    provider: &str,
    address: &str,
    configured: Option<&str>,
) -> Option<String> {
    resolve_with(
        configured,
        || get_secret(kind, provider, address),
        |key| std::env::var(key).ok(),
        &env_key(provider),
    )
}

fn resolve_with(
    configured: Option<&str>,
    keyring: impl FnOnce() -> CredentialResult<Option<String>>,
    env: impl FnOnce(&str) -> Option<String>,
    env_key: &str,
) -> Option<String> {
    if let Some(secret) = configured.filter(|s| !s.is_empty()) {
        return Some(secret.to_string());
    }
    match keyring() {
        Ok(Some(secret)) => return Some(secret),
        Ok(None) => {}
        Err(e) => warn!("Keyring lookup failed, trying {env_key}: {e}"),
    }
    env(env_key).filter(|s| !s.is_empty())
}
