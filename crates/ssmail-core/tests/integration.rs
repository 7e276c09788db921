//! End-to-end tests over the public API.
//!
//! Storage runs on real backends: the document store in a temporary
//! directory and the relational store on an in-memory SQLite database.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use ssmail_core::message::thread_id_for_subject;
use ssmail_core::router::RecipientKind;
use ssmail_core::store::{DocumentStore, RelationalStore};
use ssmail_core::transport::ImapFetcher;
use ssmail_core::{
    BackendMode, BackendSelector, Clock, CoreConfig, DeliveryRouter, Error, FixedClock, Folder,
    ListQuery, MailListOptions, MailService, MailStatistics, MailStore, Message, MessageId,
    MessagePage, NewMessage, Result, RouteOptions, StubTransport, ThreadId, TransportRegistry,
};

fn clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()))
}

async fn document_store(dir: &tempfile::TempDir) -> Arc<dyn MailStore> {
    Arc::new(DocumentStore::open(dir.path().join("mail.redb"), clock()).await.unwrap())
}

async fn relational_store() -> Arc<dyn MailStore> {
    Arc::new(RelationalStore::in_memory(clock()).await.unwrap())
}

fn config() -> CoreConfig {
    CoreConfig {
        mail_domain: "sys.local".into(),
        ..CoreConfig::default()
    }
}

fn no_transports() -> Arc<TransportRegistry> {
    Arc::new(TransportRegistry::new(Arc::new(ImapFetcher::default())))
}

async fn contains(store: &dyn MailStore, user: &str, folder: Folder, id: &MessageId) -> bool {
    store
        .list_by_user(user, folder, &ListQuery::default())
        .await
        .unwrap()
        .messages
        .iter()
        .any(|m| &m.id == id)
}

/// Reachable backend that refuses writes.
struct ReadOnlyStore;

#[async_trait]
impl MailStore for ReadOnlyStore {
    fn backend(&self) -> &'static str {
        "read-only"
    }

    async fn create(&self, _message: NewMessage) -> Result<MessageId> {
        Err(Error::StorageUnavailable("not primary".into()))
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
        Err(Error::StorageUnavailable("not primary".into()))
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

mod scenario_tests {
    use super::*;

    async fn inbox_delivery(store: Arc<dyn MailStore>) {
        let id = store
            .create(
                NewMessage::new("a@sys.local", ["b@sys.local"])
                    .subject("Hello")
                    .body("hi"),
            )
            .await
            .unwrap();

        let inbox = store
            .list_by_user("b@sys.local", Folder::Inbox, &ListQuery::default())
            .await
            .unwrap();
        assert_eq!(inbox.messages.len(), 1);
        assert_eq!(inbox.messages[0].id, id);
        assert!(!inbox.messages[0].is_read);
        assert_eq!(inbox.messages[0].folder, Folder::Inbox);
    }

    #[tokio::test]
    async fn test_inbox_delivery_document() {
        let dir = tempfile::tempdir().unwrap();
        inbox_delivery(document_store(&dir).await).await;
    }

    #[tokio::test]
    async fn test_inbox_delivery_relational() {
        inbox_delivery(relational_store().await).await;
    }

    #[tokio::test]
    async fn test_trash_records_previous_folder() {
        let dir = tempfile::tempdir().unwrap();
        let store = document_store(&dir).await;
        let id = store
            .create(NewMessage::new("a@sys.local", ["b@sys.local"]).subject("Hello"))
            .await
            .unwrap();

        store
            .move_to_folder(&id, "b@sys.local", Folder::Trash)
            .await
            .unwrap();

        assert!(!contains(store.as_ref(), "b@sys.local", Folder::Inbox, &id).await);
        let trash = store
            .list_by_user("b@sys.local", Folder::Trash, &ListQuery::default())
            .await
            .unwrap();
        assert_eq!(trash.messages.len(), 1);
        assert_eq!(trash.messages[0].previous_folder, Some(Folder::Inbox));
        assert!(trash.messages[0].deleted_at.is_some());
        assert!(trash.messages[0].is_deleted);
    }

    #[tokio::test]
    async fn test_failed_probe_routes_to_secondary() {
        let backend = BackendSelector::select(
            async { Ok(Arc::new(ReadOnlyStore) as Arc<dyn MailStore>) },
            async { Ok(relational_store().await) },
        )
        .await;
        assert_eq!(backend.mode(), BackendMode::Secondary);

        let service = MailService::new(backend, no_transports(), &config(), clock());
        let created = service
            .create_mail(NewMessage::new("a@sys.local", ["b@sys.local"]).subject("Hi"))
            .await;
        assert!(created.success);

        let listed = service
            .get_mails_by_user("b@sys.local", &MailListOptions::folder(Folder::Inbox))
            .await;
        assert!(listed.success);
        let listed = listed.data.unwrap();
        assert_eq!(listed.total_count, 1);
        assert_eq!(listed.mails[0].id, created.data.unwrap().mail_id);
    }

    #[tokio::test]
    async fn test_route_without_transport() {
        let store = relational_store().await;
        let service = MailService::new(
            BackendSelector::with_store(BackendMode::Secondary, store),
            no_transports(),
            &config(),
            clock(),
        );

        let outcomes = service
            .route_email(
                "a@sys.local",
                &["b@sys.local".to_string(), "c@external.com".to_string()],
                "S",
                "B",
                RouteOptions::default(),
            )
            .await;

        assert_eq!(outcomes.len(), 2);
        let external = outcomes
            .iter()
            .find(|o| o.kind == RecipientKind::External)
            .unwrap();
        assert!(!external.result.success);
        assert!(external.result.error.is_some());
    }

    #[tokio::test]
    async fn test_degraded_backend_replies() {
        let backend = BackendSelector::select(
            async { Err(Error::StorageUnavailable("down".into())) },
            async { Err(Error::StorageUnavailable("down".into())) },
        )
        .await;
        let service = MailService::new(backend, no_transports(), &config(), clock());

        let created = service
            .create_mail(NewMessage::new("a@sys.local", ["b@sys.local"]))
            .await;
        assert!(!created.success);
        assert!(created.error.unwrap().starts_with("Storage unavailable"));

        let listed = service
            .get_mails_by_user("b@sys.local", &MailListOptions::default())
            .await;
        assert!(listed.success);
        assert_eq!(listed.data.unwrap().total_count, 0);
    }
}

mod property_tests {
    use super::*;

    #[tokio::test]
    async fn test_partition_matches_flags() {
        let dir = tempfile::tempdir().unwrap();
        let store = document_store(&dir).await;
        let explicit = std::iter::once(None).chain(Folder::ALL.iter().copied().map(Some));

        for folder in explicit {
            for bits in 0..8u8 {
                let mut input = NewMessage::new("a@sys.local", ["b@sys.local"]);
                input.folder = folder;
                input.is_draft = bits & 1 != 0;
                input.is_spam = bits & 2 != 0;
                input.is_deleted = bits & 4 != 0;
                let expected = input.resolved_folder();

                let id = store.create(input).await.unwrap();
                let stored = store.get_by_id(&id, "a@sys.local").await.unwrap();
                assert_eq!(stored.folder, expected);
                assert_eq!(stored.is_draft, expected == Folder::Drafts);
                assert_eq!(stored.is_spam, expected == Folder::Spam);
                assert_eq!(stored.is_deleted, expected == Folder::Trash);

                let user = match expected {
                    Folder::Sent | Folder::Drafts => "a@sys.local",
                    _ => "b@sys.local",
                };
                assert!(contains(store.as_ref(), user, expected, &id).await);
            }
        }
    }

    proptest! {
        #[test]
        fn test_thread_ignores_reply_prefixes(
            subject in "[A-Za-z0-9][A-Za-z0-9 ]{0,30}",
            prefix in prop::sample::select(vec!["Re: ", "RE: ", "Fwd: ", "FW: ", "AW: ", "SV: ", "re: Fwd: "]),
        ) {
            let reply = format!("{prefix}{subject}");
            prop_assert_eq!(thread_id_for_subject(&subject), thread_id_for_subject(&reply));
        }
    }

    #[tokio::test]
    async fn test_unread_counts_inbox_only() {
        let store = relational_store().await;
        let user = "u@sys.local";
        store.create(NewMessage::new("x@sys.local", [user])).await.unwrap();
        for folder in [Folder::Spam, Folder::Trash, Folder::Archive] {
            store
                .create(NewMessage::new("x@sys.local", [user]).in_folder(folder))
                .await
                .unwrap();
        }
        for folder in [Folder::Sent, Folder::Drafts] {
            store
                .create(NewMessage::new(user, ["x@sys.local"]).in_folder(folder))
                .await
                .unwrap();
        }

        let stats = store.statistics(user, 30).await.unwrap();
        assert_eq!(stats.unread_count, 1);
    }

    #[tokio::test]
    async fn test_unread_counts_inbox_only_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = document_store(&dir).await;
        let user = "u@sys.local";
        let read = store.create(NewMessage::new("x@sys.local", [user])).await.unwrap();
        store.create(NewMessage::new("x@sys.local", [user])).await.unwrap();
        store.mark_read(&read, user).await.unwrap();
        store
            .create(NewMessage::new("x@sys.local", [user]).in_folder(Folder::Spam))
            .await
            .unwrap();

        let stats = store.statistics(user, 30).await.unwrap();
        assert_eq!(stats.unread_count, 1);
        assert_eq!(stats.spam, 1);
    }

    async fn visibility(store: Arc<dyn MailStore>) {
        let mut input = NewMessage::new("a@sys.local", ["b@sys.local"]);
        input.cc = vec!["c@sys.local".into()];
        let id = store.create(input).await.unwrap();

        assert!(store.get_by_id(&id, "a@sys.local").await.is_ok());
        assert!(store.get_by_id(&id, "B@SYS.LOCAL").await.is_ok());
        for outsider in ["c@sys.local", "d@sys.local"] {
            let err = store.get_by_id(&id, outsider).await.unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_visibility_document() {
        let dir = tempfile::tempdir().unwrap();
        visibility(document_store(&dir).await).await;
    }

    #[tokio::test]
    async fn test_visibility_relational() {
        visibility(relational_store().await).await;
    }

    #[tokio::test]
    async fn test_move_is_seen_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = document_store(&dir).await;
        let user = "b@sys.local";
        let id = store
            .create(NewMessage::new("a@sys.local", [user]))
            .await
            .unwrap();

        for target in [Folder::Archive, Folder::Trash, Folder::Spam, Folder::Inbox] {
            store.move_to_folder(&id, user, target).await.unwrap();
            assert_eq!(store.get_by_id(&id, user).await.unwrap().folder, target);

            let mut hits = 0;
            for folder in [Folder::Inbox, Folder::Spam, Folder::Trash, Folder::Archive] {
                if contains(store.as_ref(), user, folder, &id).await {
                    hits += 1;
                    assert_eq!(folder, target);
                }
            }
            assert_eq!(hits, 1);
        }
    }

    #[tokio::test]
    async fn test_router_reports_both_classes() {
        let store = relational_store().await;
        for registry in [
            TransportRegistry::new(Arc::new(ImapFetcher::default())),
            TransportRegistry::new(Arc::new(ImapFetcher::default()))
                .with_fallback(Arc::new(StubTransport::new("stub"))),
            {
                let mut failing = TransportRegistry::new(Arc::new(ImapFetcher::default()));
                failing.register(Arc::new(StubTransport::failing("broken")), Vec::new());
                failing
            },
        ] {
            let router = DeliveryRouter::new(
                Arc::clone(&store),
                Arc::new(registry),
                vec!["sys.local".into()],
                Duration::from_secs(5),
                clock(),
            );
            let outcomes = router
                .route(
                    "a@sys.local",
                    &["i1@sys.local".to_string(), "e1@external.com".to_string()],
                    "S",
                    "B",
                    RouteOptions::default(),
                )
                .await;

            assert_eq!(outcomes.len(), 2);
            assert_eq!(outcomes[0].kind, RecipientKind::Internal);
            assert_eq!(outcomes[1].kind, RecipientKind::External);
        }
    }
}
