//! The mail facade handed to the HTTP layer.
//!
//! Every call returns a serializable [`Reply`] instead of an error: the
//! caller gets `{"success": false, "error": "<category>: <detail>"}` and
//! never a backend-specific message.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{BackendMode, BackendSelector};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::message::{
    Folder, Message, MessageId, MessagePatch, NewMessage, Priority, ThreadId,
    generate_message_token, normalize_address,
};
use crate::router::{DeliveryRouter, RecipientKind, RouteOptions, RouteOutcome, SENT_LABEL};
use crate::store::{ListQuery, MailStatistics, MailStore, MessagePage, SortField, SortOrder};
use crate::transport::{ProviderHealth, TransportRegistry};
use crate::{Error, ErrorKind, Result};

/// Result envelope of every facade call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply<T> {
    /// Whether the call succeeded.
    pub success: bool,
    /// Payload, flattened into the envelope.
    #[serde(flatten)]
    pub data: Option<T>,
    /// Public error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl<T> Reply<T> {
    /// A successful reply.
    pub const fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }

    /// A failed reply.
    #[must_use]
    pub fn err(error: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.public_message()),
            kind: Some(error.kind()),
        }
    }

    fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                warn!("Mail operation failed: {e}");
                Self::err(&e)
            }
        }
    }
}

/// Payload of `createMail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailCreated {
    /// Id of the stored message.
    pub mail_id: MessageId,
}

/// Payload of list and search calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailList {
    /// Messages on this page.
    pub mails: Vec<Message>,
    /// Matches before paging.
    pub total_count: usize,
    /// Whether another page follows.
    pub has_more: bool,
}

impl From<MessagePage> for MailList {
    fn from(page: MessagePage) -> Self {
        Self {
            mails: page.messages,
            total_count: page.total_count,
            has_more: page.has_more,
        }
    }
}

/// Payload of `getMailById`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailItem {
    /// The message.
    pub mail: Message,
}

/// Payload of `getMailStatistics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsReport {
    /// Aggregated counts.
    pub statistics: MailStatistics,
}

/// Payload of `saveDraft`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSaved {
    /// Id of the stored draft.
    pub draft_id: MessageId,
}

/// Payload of `clearDrafts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftsCleared {
    /// Number of drafts removed.
    pub deleted_count: u64,
}

/// Payload of `toggleStar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StarState {
    /// Star flag after the toggle.
    pub is_starred: bool,
}

/// Payload of `getThread`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailThread {
    /// Messages of the thread, oldest first.
    pub mails: Vec<Message>,
}

/// Payload of `sendMail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReport {
    /// Sender copy in the sent folder.
    pub mail_id: Option<MessageId>,
    /// One entry per recipient class.
    pub deliveries: Vec<RouteOutcome>,
}

/// Payload of `seedSampleMail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Seeded {
    /// Ids of the inserted messages.
    pub mail_ids: Vec<MessageId>,
}

/// Payload of `importExternal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    /// Messages stored.
    pub imported: usize,
    /// Messages already present.
    pub skipped: usize,
    /// Messages that could not be stored.
    pub failed: usize,
}

/// Backend and transport state for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Active backend mode.
    pub mode: BackendMode,
    /// Active backend name.
    pub backend: String,
    /// Registered transports and their health.
    pub providers: Vec<ProviderHealth>,
}

/// Options of `getMailsByUser`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailListOptions {
    /// Folder to list.
    pub folder: Folder,
    /// Page size.
    pub limit: usize,
    /// Matches skipped.
    pub skip: usize,
    /// Ordering field.
    pub sort_by: SortField,
    /// Ordering direction.
    pub sort_order: SortOrder,
    /// Case-insensitive filter.
    pub search: Option<String>,
}

impl Default for MailListOptions {
    fn default() -> Self {
        let query = ListQuery::default();
        Self {
            folder: Folder::Inbox,
            limit: query.limit,
            skip: query.skip,
            sort_by: query.sort_by,
            sort_order: query.sort_order,
            search: None,
        }
    }
}

impl MailListOptions {
    /// Lists `folder` with default paging.
    #[must_use]
    pub fn folder(folder: Folder) -> Self {
        Self {
            folder,
            ..Self::default()
        }
    }

    fn query(&self) -> ListQuery {
        ListQuery {
            limit: self.limit,
            skip: self.skip,
            sort_by: self.sort_by,
            sort_order: self.sort_order,
            search_term: self.search.clone(),
        }
    }
}

/// A message composed by a signed-in user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Compose {
    /// Primary recipients.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
    /// Carbon copies, priority, reply reference and attachments.
    #[serde(flatten)]
    pub options: RouteOptions,
}

/// Facade over the active backend, router and transports.
pub struct MailService {
    backend: Arc<BackendSelector>,
    router: DeliveryRouter,
    transports: Arc<TransportRegistry>,
    clock: Arc<dyn Clock>,
    mail_domain: String,
}

impl MailService {
    /// Selects a backend and builds the transport registry from `config`.
    pub async fn initialize(config: &CoreConfig, clock: Arc<dyn Clock>) -> Self {
        let backend = BackendSelector::initialize(&config.storage, Arc::clone(&clock)).await;
        let transports = Arc::new(TransportRegistry::from_config(
            &config.transport,
            &config.linked_accounts,
        ));
        if !config.transport.providers.is_empty() {
            let revalidation =
                transports.spawn_revalidation(config.transport.revalidate_interval());
            // Detached: runs for the lifetime of the runtime.
            drop(revalidation);
        }
        Self::new(backend, transports, config, clock)
    }

    /// Assembles a service from an already selected backend.
    #[must_use]
    pub fn new(
        backend: BackendSelector,
        transports: Arc<TransportRegistry>,
        config: &CoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let router = DeliveryRouter::new(
            backend.store(),
            Arc::clone(&transports),
            config.internal_domains(),
            config.transport.send_timeout(),
            Arc::clone(&clock),
        );
        Self {
            backend: Arc::new(backend),
            router,
            transports,
            clock,
            mail_domain: config.mail_domain.clone(),
        }
    }

    /// Active backend mode.
    #[must_use]
    pub fn mode(&self) -> BackendMode {
        self.backend.mode()
    }

    /// Shared transport registry.
    #[must_use]
    pub fn transports(&self) -> Arc<TransportRegistry> {
        Arc::clone(&self.transports)
    }

    /// Backend mode and cached provider health.
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            mode: self.backend.mode(),
            backend: self.backend.backend().to_string(),
            providers: self.transports.health(),
        }
    }

    /// `createMail`
    pub async fn create_mail(&self, data: NewMessage) -> Reply<MailCreated> {
        Reply::from_result(
            self.backend
                .create(data)
                .await
                .map(|mail_id| MailCreated { mail_id }),
        )
    }

    /// `getMailsByUser`
    pub async fn get_mails_by_user(&self, user: &str, options: &MailListOptions) -> Reply<MailList> {
        Reply::from_result(
            self.backend
                .list_by_user(user, options.folder, &options.query())
                .await
                .map(MailList::from),
        )
    }

    /// `getMailById`
    pub async fn get_mail_by_id(&self, id: &MessageId, user: &str) -> Reply<MailItem> {
        Reply::from_result(
            self.backend
                .get_by_id(id, user)
                .await
                .map(|mail| MailItem { mail }),
        )
    }

    /// `updateMail`
    pub async fn update_mail(&self, id: &MessageId, user: &str, patch: MessagePatch) -> Reply<()> {
        Reply::from_result(self.backend.update(id, user, patch).await)
    }

    /// `deleteMail`: soft delete moves to the trash, permanent removes.
    pub async fn delete_mail(&self, id: &MessageId, user: &str, permanent: bool) -> Reply<()> {
        let result = if permanent {
            self.backend.hard_delete(id, user).await
        } else {
            self.backend.soft_delete(id, user).await
        };
        Reply::from_result(result)
    }

    /// `markAsRead`
    pub async fn mark_as_read(&self, id: &MessageId, user: &str) -> Reply<()> {
        Reply::from_result(self.backend.mark_read(id, user).await)
    }

    /// `searchMails`
    pub async fn search_mails(&self, user: &str, term: &str, query: &ListQuery) -> Reply<MailList> {
        Reply::from_result(
            self.backend
                .search(user, term, query)
                .await
                .map(MailList::from),
        )
    }

    /// `getMailStatistics`
    pub async fn get_mail_statistics(&self, user: &str, days: u32) -> Reply<StatisticsReport> {
        Reply::from_result(
            self.backend
                .statistics(user, days)
                .await
                .map(|statistics| StatisticsReport { statistics }),
        )
    }

    /// `routeEmail`
    pub async fn route_email(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        body: &str,
        options: RouteOptions,
    ) -> Vec<RouteOutcome> {
        self.router.route(from, to, subject, body, options).await
    }

    /// `saveDraft`
    pub async fn save_draft(&self, mut data: NewMessage) -> Reply<DraftSaved> {
        data.folder = Some(Folder::Drafts);
        Reply::from_result(
            self.backend
                .create(data)
                .await
                .map(|draft_id| DraftSaved { draft_id }),
        )
    }

    /// `updateDraft`: only the author's drafts can be edited.
    pub async fn update_draft(&self, id: &MessageId, user: &str, data: NewMessage) -> Reply<()> {
        Reply::from_result(self.update_own_draft(id, user, &data).await)
    }

    async fn update_own_draft(&self, id: &MessageId, user: &str, data: &NewMessage) -> Result<()> {
        let draft = self.backend.get_by_id(id, user).await?;
        if draft.folder != Folder::Drafts || draft.from != normalize_address(user) {
            return Err(Error::NotFound(format!("draft {id}")));
        }
        self.backend
            .update(id, user, MessagePatch::from_draft(data))
            .await
    }

    /// `clearDrafts`
    pub async fn clear_drafts(&self, user: &str) -> Reply<DraftsCleared> {
        Reply::from_result(
            self.backend
                .clear_drafts(user)
                .await
                .map(|deleted_count| DraftsCleared { deleted_count }),
        )
    }

    /// `sendMail`: routes the message and keeps one copy in the sender's
    /// sent folder.
    ///
    /// Succeeds only if every recipient class was delivered; the payload is
    /// present either way so partial deliveries stay visible.
    pub async fn send_mail(&self, user: &str, compose: Compose) -> Reply<SendReport> {
        let user = normalize_address(user);
        if compose.to.iter().all(|addr| addr.trim().is_empty()) {
            return Reply::err(&Error::Validation("at least one recipient is required".into()));
        }

        let token = compose
            .options
            .message_id
            .clone()
            .unwrap_or_else(|| generate_message_token(self.clock.now()));
        let mut options = compose.options.clone();
        options.message_id = Some(token.clone());
        // The sender's own copy is the sent copy; never route to them.
        let not_sender = |list: &[String]| -> Vec<String> {
            list.iter()
                .filter(|addr| normalize_address(addr) != user)
                .cloned()
                .collect()
        };
        let others = not_sender(&compose.to);
        options.cc = not_sender(&options.cc);
        options.bcc = not_sender(&options.bcc);

        let deliveries = if others.is_empty() && options.cc.is_empty() && options.bcc.is_empty() {
            Vec::new()
        } else {
            self.router
                .route(&user, &others, &compose.subject, &compose.body, options)
                .await
        };

        let recorded = deliveries
            .iter()
            .filter(|d| d.kind == RecipientKind::External)
            .find_map(|d| d.result.mail_id.clone());
        let any_delivered = deliveries.is_empty() || deliveries.iter().any(|d| d.result.success);

        let mut mail_id = recorded;
        let mut failure = deliveries.iter().find_map(|d| d.result.error.clone());
        if mail_id.is_none() && any_delivered {
            match self.backend.create(sender_copy(&user, &compose, &token)).await {
                Ok(id) => mail_id = Some(id),
                Err(e) => {
                    warn!("Could not store sender copy of {token}: {e}");
                    failure.get_or_insert_with(|| e.public_message());
                }
            }
        }

        info!("Sent {token} from {user}: {} delivery class(es)", deliveries.len());
        let report = SendReport {
            mail_id,
            deliveries,
        };
        match failure {
            None => Reply::ok(report),
            Some(error) => Reply {
                success: false,
                data: Some(report),
                error: Some(error),
                kind: None,
            },
        }
    }

    /// `toggleStar`
    pub async fn toggle_star(&self, id: &MessageId, user: &str) -> Reply<StarState> {
        Reply::from_result(
            self.backend
                .toggle_star(id, user)
                .await
                .map(|is_starred| StarState { is_starred }),
        )
    }

    /// `moveToFolder`
    pub async fn move_to_folder(&self, id: &MessageId, user: &str, folder: Folder) -> Reply<()> {
        Reply::from_result(self.backend.move_to_folder(id, user, folder).await)
    }

    /// `restoreMail`: moves a trashed message back where it came from.
    pub async fn restore_mail(&self, id: &MessageId, user: &str) -> Reply<()> {
        Reply::from_result(self.restore(id, user).await)
    }

    async fn restore(&self, id: &MessageId, user: &str) -> Result<()> {
        let message = self.backend.get_by_id(id, user).await?;
        if message.folder != Folder::Trash {
            return Err(Error::Validation(format!("mail {id} is not in the trash")));
        }
        let target = message.previous_folder.unwrap_or(Folder::Inbox);
        self.backend.move_to_folder(id, user, target).await
    }

    /// `getThread`
    pub async fn get_thread(&self, thread_id: &ThreadId, user: &str) -> Reply<MailThread> {
        Reply::from_result(
            self.backend
                .thread(thread_id, user)
                .await
                .map(|mails| MailThread { mails }),
        )
    }

    /// `seedSampleMail`: a welcome message and a security notice.
    pub async fn seed_sample_mail(&self, user: &str) -> Reply<Seeded> {
        Reply::from_result(self.seed(user).await)
    }

    async fn seed(&self, user: &str) -> Result<Seeded> {
        let now = self.clock.now();
        let welcome = NewMessage::new(format!("welcome@{}", self.mail_domain), [user])
            .subject("Welcome to SSMail!")
            .body("This is your first message. Welcome to SSMail!")
            .in_folder(Folder::Inbox);

        let mut notice = NewMessage::new(format!("system@{}", self.mail_domain), [user])
            .subject("Account Security Notification")
            .body("Two-factor authentication has been enabled for your account.")
            .in_folder(Folder::Inbox);
        notice.date = Some(now - Duration::days(1));
        notice.is_read = true;
        notice.priority = Priority::High;

        let mut mail_ids = Vec::with_capacity(2);
        for message in [welcome, notice] {
            mail_ids.push(self.backend.create(message).await?);
        }
        info!("Seeded {} sample message(s) for {user}", mail_ids.len());
        Ok(Seeded { mail_ids })
    }

    /// `importExternal`: stores recent mail from the user's linked accounts,
    /// skipping messages already present.
    pub async fn import_external(&self, user: &str) -> Reply<ImportReport> {
        Reply::from_result(self.import(user).await)
    }

    async fn import(&self, user: &str) -> Result<ImportReport> {
        let owner = normalize_address(user);
        let fetched = self.transports.fetch_external_emails(&owner).await;
        let mut report = ImportReport::default();
        for mail in fetched {
            if let Some(token) = &mail.message_id {
                if self.backend.has_message_id(token, &owner).await? {
                    report.skipped += 1;
                    continue;
                }
            }
            match self.backend.create(mail.into_new_message(&owner)).await {
                Ok(_) => report.imported += 1,
                Err(e) if e.kind() == ErrorKind::StorageUnavailable => return Err(e),
                Err(e) => {
                    warn!("Skipping external message for {owner}: {e}");
                    report.failed += 1;
                }
            }
        }
        info!(
            "Imported {} external message(s) for {owner}, {} already present",
            report.imported, report.skipped
        );
        Ok(report)
    }
}

fn sender_copy(user: &str, compose: &Compose, token: &str) -> NewMessage {
    let mut message = NewMessage::new(user, compose.to.iter().cloned())
        .subject(compose.subject.clone())
        .body(compose.body.clone())
        .in_folder(Folder::Sent)
        .label(SENT_LABEL);
    message.cc = compose.options.cc.clone();
    message.bcc = compose.options.bcc.clone();
    message.priority = compose.options.priority;
    message.in_reply_to = compose.options.in_reply_to.clone();
    message.attachments = compose.options.attachments.clone();
    message.message_id = Some(token.to_string());
    message.is_read = true;
    message
}
