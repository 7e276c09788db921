//! One-time backend selection by write probing.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use super::DegradedStore;
use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::message::{
    Folder, Message, MessageId, MessagePatch, NewMessage, ThreadId, normalize_address,
};
use crate::store::{
    DocumentStore, ListQuery, MailStatistics, MailStore, MessagePage, RelationalStore,
};
use crate::{Error, Result};

/// Sender and recipient of the disposable probe message.
const PROBE_ADDRESS: &str = "write-probe@ssmail.invalid";

/// Which backend is authoritative for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Document store accepted the write probe.
    Primary,
    /// Relational fallback is active.
    Secondary,
    /// No backend is usable: writes fail, reads are empty.
    Degraded,
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Degraded => "degraded",
        })
    }
}

/// Writes a message already flagged deleted, then removes it for good.
///
/// # Errors
///
/// Returns the first error from either step.
pub async fn write_probe(store: &dyn MailStore) -> Result<()> {
    let mut probe = NewMessage::new(PROBE_ADDRESS, [PROBE_ADDRESS]).subject("write probe");
    probe.is_deleted = true;
    let id = store.create(probe).await?;
    store.hard_delete(&id, PROBE_ADDRESS).await
}

/// The active backend, chosen once.
///
/// Construction runs the whole selection, so a selector that exists has
/// finished initializing; every [`MailStore`] call is forwarded unchanged.
pub struct BackendSelector {
    mode: BackendMode,
    store: Arc<dyn MailStore>,
}

impl BackendSelector {
    /// Opens the backends named by `config`.
    ///
    /// The secondary is only opened if the primary is missing, unreachable
    /// or rejects the write probe.
    pub async fn initialize(config: &StorageConfig, clock: Arc<dyn Clock>) -> Self {
        let document_path = config.document_path.clone();
        let primary_clock = Arc::clone(&clock);
        let primary = async move {
            let path = document_path
                .ok_or_else(|| Error::Config("no document store configured".into()))?;
            let store = DocumentStore::open(path, primary_clock).await?;
            Ok::<_, Error>(Arc::new(store) as Arc<dyn MailStore>)
        };
        let url = config.relational_url.clone();
        let secondary = async move {
            let store = RelationalStore::new(&url, clock).await?;
            Ok::<_, Error>(Arc::new(store) as Arc<dyn MailStore>)
        };
        Self::select(primary, secondary).await
    }

    /// Runs the selection over two lazily opened backends.
    pub async fn select<P, S>(primary: P, secondary: S) -> Self
    where
        P: Future<Output = Result<Arc<dyn MailStore>>>,
        S: Future<Output = Result<Arc<dyn MailStore>>>,
    {
        match primary.await {
            Ok(store) => match write_probe(store.as_ref()).await {
                Ok(()) => {
                    info!("Using primary {} backend", store.backend());
                    return Self::with_store(BackendMode::Primary, store);
                }
                Err(e) => warn!("Primary backend rejected write probe: {e}"),
            },
            Err(e) => warn!("Primary backend unavailable: {e}"),
        }

        match secondary.await {
            Ok(store) => {
                info!("Using secondary {} backend", store.backend());
                Self::with_store(BackendMode::Secondary, store)
            }
            Err(e) => {
                error!("Secondary backend unavailable, running degraded: {e}");
                Self::with_store(BackendMode::Degraded, Arc::new(DegradedStore))
            }
        }
    }

    /// Wraps an already chosen store.
    #[must_use]
    pub fn with_store(mode: BackendMode, store: Arc<dyn MailStore>) -> Self {
        Self { mode, store }
    }

    /// Mode chosen at initialization.
    #[must_use]
    pub const fn mode(&self) -> BackendMode {
        self.mode
    }

    /// Shared handle to the active store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn MailStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl MailStore for BackendSelector {
    fn backend(&self) -> &'static str {
        self.store.backend()
    }

    async fn create(&self, message: NewMessage) -> Result<MessageId> {
        self.store.create(message).await
    }

    async fn list_by_user(
        &self,
        user: &str,
        folder: Folder,
        query: &ListQuery,
    ) -> Result<MessagePage> {
        let page = self.store.list_by_user(user, folder, query).await?;
        Ok(hide_bcc_in_page(page, user))
    }

    async fn search(&self, user: &str, term: &str, query: &ListQuery) -> Result<MessagePage> {
        let page = self.store.search(user, term, query).await?;
        Ok(hide_bcc_in_page(page, user))
    }

    async fn get_by_id(&self, id: &MessageId, user: &str) -> Result<Message> {
        let mut message = self.store.get_by_id(id, user).await?;
        message.hide_bcc_from(&normalize_address(user));
        Ok(message)
    }

    async fn update(&self, id: &MessageId, user: &str, patch: MessagePatch) -> Result<()> {
        self.store.update(id, user, patch).await
    }

    async fn move_to_folder(&self, id: &MessageId, user: &str, target: Folder) -> Result<()> {
        self.store.move_to_folder(id, user, target).await
    }

    async fn soft_delete(&self, id: &MessageId, user: &str) -> Result<()> {
        self.store.soft_delete(id, user).await
    }

    async fn hard_delete(&self, id: &MessageId, user: &str) -> Result<()> {
        self.store.hard_delete(id, user).await
    }

    async fn mark_read(&self, id: &MessageId, user: &str) -> Result<()> {
        self.store.mark_read(id, user).await
    }

    async fn toggle_star(&self, id: &MessageId, user: &str) -> Result<bool> {
        self.store.toggle_star(id, user).await
    }

    async fn statistics(&self, user: &str, days: u32) -> Result<MailStatistics> {
        self.store.statistics(user, days).await
    }

    async fn thread(&self, thread_id: &ThreadId, user: &str) -> Result<Vec<Message>> {
        let viewer = normalize_address(user);
        let mut messages = self.store.thread(thread_id, user).await?;
        for message in &mut messages {
            message.hide_bcc_from(&viewer);
        }
        Ok(messages)
    }

    async fn clear_drafts(&self, user: &str) -> Result<u64> {
        self.store.clear_drafts(user).await
    }

    async fn has_message_id(&self, token: &str, owner: &str) -> Result<bool> {
        self.store.has_message_id(token, owner).await
    }
}

/// Blind recipients are shown to the sender only.
fn hide_bcc_in_page(mut page: MessagePage, user: &str) -> MessagePage {
    let viewer = normalize_address(user);
    for message in &mut page.messages {
        message.hide_bcc_from(&viewer);
    }
    page
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::clock::FixedClock;

    /// Reachable store that refuses every write.
    struct ReadOnlyStore;

    #[async_trait]
    impl MailStore for ReadOnlyStore {
        fn backend(&self) -> &'static str {
            "read-only"
        }

        async fn create(&self, _message: NewMessage) -> Result<MessageId> {
            Err(Error::StorageUnavailable("read-only".into()))
        }

        async fn list_by_user(&self, _: &str, _: Folder, q: &ListQuery) -> Result<MessagePage> {
            Ok(MessagePage::new(Vec::new(), 0, q))
        }

        async fn search(&self, _: &str, _: &str, q: &ListQuery) -> Result<MessagePage> {
            Ok(MessagePage::new(Vec::new(), 0, q))
        }

        async fn get_by_id(&self, id: &MessageId, _: &str) -> Result<Message> {
            Err(Error::NotFound(id.to_string()))
        }

        async fn mark_read(&self, _: &MessageId, _: &str) -> Result<()> {
            Err(Error::StorageUnavailable("read-only".into()))
        }

        async fn statistics(&self, _: &str, _: u32) -> Result<MailStatistics> {
            Ok(MailStatistics::default())
        }

        async fn thread(&self, _: &ThreadId, _: &str) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn has_message_id(&self, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock::new(Utc::now()))
    }

    async fn relational() -> Result<Arc<dyn MailStore>> {
        Ok(Arc::new(RelationalStore::in_memory(clock()).await?) as Arc<dyn MailStore>)
    }

    async fn document(path: std::path::PathBuf) -> Result<Arc<dyn MailStore>> {
        Ok(Arc::new(DocumentStore::open(path, clock()).await?) as Arc<dyn MailStore>)
    }

    #[tokio::test]
    async fn test_primary_wins_when_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.redb");
        let secondary_opened = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&secondary_opened);

        let selector = BackendSelector::select(
            document(path),
            async move {
                flag.store(true, Ordering::SeqCst);
                relational().await
            },
        )
        .await;

        assert_eq!(selector.mode(), BackendMode::Primary);
        assert_eq!(selector.backend(), "document");
        assert!(!secondary_opened.load(Ordering::SeqCst));

        // Probe leaves nothing behind
        let stats = selector.statistics(PROBE_ADDRESS, 30).await.unwrap();
        assert_eq!(stats, MailStatistics::default());
    }

    #[tokio::test]
    async fn test_failed_probe_falls_back() {
        let selector = BackendSelector::select(
            async { Ok(Arc::new(ReadOnlyStore) as Arc<dyn MailStore>) },
            relational(),
        )
        .await;
        assert_eq!(selector.mode(), BackendMode::Secondary);

        let id = selector
            .create(NewMessage::new("a@sys.local", ["b@sys.local"]))
            .await
            .unwrap();
        assert!(selector.get_by_id(&id, "b@sys.local").await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_primary_falls_back() {
        let selector = BackendSelector::select(
            async { Err(Error::StorageUnavailable("connection refused".into())) },
            relational(),
        )
        .await;
        assert_eq!(selector.mode(), BackendMode::Secondary);
    }

    #[tokio::test]
    async fn test_degraded_when_both_fail() {
        let selector = BackendSelector::select(
            async { Err(Error::StorageUnavailable("down".into())) },
            async { Err(Error::StorageUnavailable("also down".into())) },
        )
        .await;
        assert_eq!(selector.mode(), BackendMode::Degraded);

        let err = selector
            .create(NewMessage::new("a@sys.local", ["b@sys.local"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));

        let page = selector
            .list_by_user("b@sys.local", Folder::Inbox, &ListQuery::default())
            .await
            .unwrap();
        assert!(page.messages.is_empty());
        assert_eq!(
            selector.statistics("b@sys.local", 7).await.unwrap(),
            MailStatistics::default()
        );
    }

    #[tokio::test]
    async fn test_bcc_shown_to_sender_only() {
        let store = relational().await.unwrap();
        let selector = BackendSelector::with_store(BackendMode::Secondary, store);
        let mut sent = NewMessage::new("a@sys.local", ["b@sys.local"]).in_folder(Folder::Sent);
        sent.bcc = vec!["secret@sys.local".into()];
        let id = selector.create(sent).await.unwrap();

        let own = selector.get_by_id(&id, "A@sys.local").await.unwrap();
        assert_eq!(own.bcc, vec!["secret@sys.local"]);
        let theirs = selector.get_by_id(&id, "b@sys.local").await.unwrap();
        assert!(theirs.bcc.is_empty());

        let page = selector
            .list_by_user("a@sys.local", Folder::Sent, &ListQuery::default())
            .await
            .unwrap();
        assert_eq!(page.messages[0].bcc, vec!["secret@sys.local"]);
        let thread = selector.thread(&own.thread_id, "b@sys.local").await.unwrap();
        assert!(thread.iter().all(|m| m.bcc.is_empty()));
    }

    #[tokio::test]
    async fn test_initialize_without_document_path() {
        let config = StorageConfig {
            document_path: None,
            relational_url: "sqlite::memory:".into(),
        };
        let selector = BackendSelector::initialize(&config, clock()).await;
        assert_eq!(selector.mode(), BackendMode::Secondary);
        assert_eq!(selector.backend(), "relational");
    }
}
