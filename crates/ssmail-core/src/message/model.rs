//! Message model types.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::thread::thread_id_for_subject;
use crate::{Error, Result};

/// Backend-assigned identifier of a stored message.
///
/// Opaque to callers; unique within a backend across all partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new message ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Grouping key shared by every message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl ThreadId {
    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which participants can see a folder's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// `to` contains the user.
    Recipient,
    /// `from` is the user.
    Sender,
    /// Either of the above.
    Participant,
}

/// Physical partition a message lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    /// Received mail.
    Inbox,
    /// Mail sent by the user.
    Sent,
    /// Unsent compositions.
    Drafts,
    /// Junk mail.
    Spam,
    /// Soft-deleted mail.
    Trash,
    /// Archived mail.
    Archive,
}

impl Folder {
    /// Every partition, in a stable order.
    pub const ALL: [Self; 6] = [
        Self::Inbox,
        Self::Sent,
        Self::Drafts,
        Self::Spam,
        Self::Trash,
        Self::Archive,
    ];

    /// Storage name of the partition.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Spam => "spam",
            Self::Trash => "trash",
            Self::Archive => "archive",
        }
    }

    /// Resolves the partition for a message.
    ///
    /// An explicit folder wins; otherwise drafts, spam and deleted flags are
    /// checked in that order, defaulting to the inbox.
    #[must_use]
    pub const fn resolve(
        explicit: Option<Self>,
        is_draft: bool,
        is_spam: bool,
        is_deleted: bool,
    ) -> Self {
        match explicit {
            Some(folder) => folder,
            None if is_draft => Self::Drafts,
            None if is_spam => Self::Spam,
            None if is_deleted => Self::Trash,
            None => Self::Inbox,
        }
    }

    /// Participants who see this folder's messages.
    #[must_use]
    pub const fn visibility(self) -> Visibility {
        match self {
            Self::Inbox | Self::Spam => Visibility::Recipient,
            Self::Sent | Self::Drafts => Visibility::Sender,
            Self::Trash | Self::Archive => Visibility::Participant,
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Folder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|folder| folder.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Validation(format!("unknown folder '{s}'")))
    }
}

/// Message importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low importance.
    Low,
    /// Default importance.
    #[default]
    Normal,
    /// High importance.
    High,
}

impl Priority {
    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    /// Parses a storage name, defaulting to normal.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Normal,
        }
    }
}

/// Metadata of an attachment (content is stored elsewhere).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    /// File name.
    pub filename: String,
    /// MIME type.
    #[serde(default)]
    pub content_type: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// Lower-cases and trims an address so comparisons are exact.
#[must_use]
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Domain part of an address, if any.
#[must_use]
pub fn address_domain(address: &str) -> Option<&str> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().trim_end_matches('>'))
        .filter(|domain| !domain.is_empty())
}

/// A stored email message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_excessive_bools)] // Flags mirror the stored schema
pub struct Message {
    /// Backend-assigned identifier.
    pub id: MessageId,
    /// Partition the message lives in.
    pub folder: Folder,
    /// Sender address.
    pub from: String,
    /// Primary recipients (never empty).
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    #[serde(default)]
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Subject line (may be empty).
    pub subject: String,
    /// Plain text body.
    pub body: String,
    /// Message date.
    pub date: DateTime<Utc>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last changed.
    pub updated_at: DateTime<Utc>,
    /// Read flag.
    pub is_read: bool,
    /// Star flag.
    pub is_starred: bool,
    /// Set while the message is in the trash.
    pub is_deleted: bool,
    /// Set while the message is in spam.
    pub is_spam: bool,
    /// Set while the message is a draft.
    pub is_draft: bool,
    /// Whether attachments are present.
    pub has_attachments: bool,
    /// Attachment metadata.
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Importance.
    #[serde(default)]
    pub priority: Priority,
    /// Application-level message token (threading / idempotency).
    pub message_id: String,
    /// `message_id` of the message this one replies to.
    #[serde(default)]
    pub in_reply_to: Option<String>,
    /// Conversation key derived from the subject.
    pub thread_id: ThreadId,
    /// Folder the message was in before it was trashed.
    #[serde(default)]
    pub previous_folder: Option<Folder>,
    /// When the message was trashed.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// When the message was first marked read.
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// True when `user` is the sender or a primary recipient.
    #[must_use]
    pub fn is_visible_to(&self, user: &str) -> bool {
        self.from == user || self.is_addressed_to(user)
    }

    /// True when `user` appears in `to`.
    #[must_use]
    pub fn is_addressed_to(&self, user: &str) -> bool {
        self.to.iter().any(|addr| addr == user)
    }

    /// Clears the blind recipients unless `viewer` is the sender.
    pub fn hide_bcc_from(&mut self, viewer: &str) {
        if self.from != viewer {
            self.bcc.clear();
        }
    }

    /// True when `user` sees this message when listing `folder`.
    #[must_use]
    pub fn is_listed_for(&self, user: &str) -> bool {
        match self.folder.visibility() {
            Visibility::Recipient => self.is_addressed_to(user),
            Visibility::Sender => self.from == user,
            Visibility::Participant => self.is_visible_to(user),
        }
    }

    /// Case-insensitive match of an already lower-cased term against
    /// subject, body or sender.
    #[must_use]
    pub fn matches_term(&self, term_lower: &str) -> bool {
        term_lower.is_empty()
            || self.subject.to_lowercase().contains(term_lower)
            || self.body.to_lowercase().contains(term_lower)
            || self.from.contains(term_lower)
    }

    /// Moves the message to `target`, keeping flags in agreement with the
    /// partition. Entering the trash records where the message came from.
    pub fn relocate(&mut self, target: Folder, now: DateTime<Utc>) {
        if target == Folder::Trash && self.folder != Folder::Trash {
            self.previous_folder = Some(self.folder);
            self.deleted_at = Some(now);
        } else if target != Folder::Trash {
            self.previous_folder = None;
            self.deleted_at = None;
        }
        self.folder = target;
        self.sync_flags();
        self.updated_at = now;
    }

    /// Marks the message read, keeping the first read time.
    pub fn mark_read(&mut self, now: DateTime<Utc>) {
        if !self.is_read {
            self.is_read = true;
            self.read_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Applies a patch, stamping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the patch would empty the `to` list.
    pub fn apply(&mut self, patch: MessagePatch, now: DateTime<Utc>) -> Result<()> {
        if let Some(to) = patch.to {
            let to = normalize_list(to);
            if to.is_empty() {
                return Err(Error::Validation("recipient list cannot be empty".into()));
            }
            self.to = to;
        }
        if let Some(cc) = patch.cc {
            self.cc = normalize_list(cc);
        }
        if let Some(bcc) = patch.bcc {
            self.bcc = normalize_list(bcc);
        }
        if let Some(subject) = patch.subject {
            self.thread_id = thread_id_for_subject(&subject);
            self.subject = subject;
        }
        if let Some(body) = patch.body {
            self.body = body;
        }
        if let Some(is_read) = patch.is_read {
            if is_read {
                self.mark_read(now);
            } else {
                self.is_read = false;
            }
        }
        if let Some(is_starred) = patch.is_starred {
            self.is_starred = is_starred;
        }
        if let Some(labels) = patch.labels {
            self.labels = labels;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(in_reply_to) = patch.in_reply_to {
            self.in_reply_to = Some(in_reply_to);
        }
        if let Some(attachments) = patch.attachments {
            self.has_attachments = !attachments.is_empty();
            self.attachments = attachments;
        }
        self.updated_at = now;
        Ok(())
    }

    fn sync_flags(&mut self) {
        self.is_draft = self.folder == Folder::Drafts;
        self.is_spam = self.folder == Folder::Spam;
        self.is_deleted = self.folder == Folder::Trash;
    }
}

/// Input for creating a message.
///
/// Deserializes from the camelCase shape the HTTP layer receives; every
/// field except `from` and `to` is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(clippy::struct_excessive_bools)] // Flags mirror the stored schema
pub struct NewMessage {
    /// Sender address (required).
    pub from: String,
    /// Primary recipients (required, non-empty).
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
    /// Message date; defaults to creation time.
    pub date: Option<DateTime<Utc>>,
    /// Read flag.
    pub is_read: bool,
    /// Star flag.
    pub is_starred: bool,
    /// Deleted flag (routes to trash without an explicit folder).
    pub is_deleted: bool,
    /// Spam flag (routes to spam without an explicit folder).
    pub is_spam: bool,
    /// Draft flag (routes to drafts without an explicit folder).
    pub is_draft: bool,
    /// Attachments present even if no metadata is given.
    pub has_attachments: bool,
    /// Attachment metadata.
    pub attachments: Vec<AttachmentMeta>,
    /// Labels.
    pub labels: BTreeSet<String>,
    /// Importance.
    pub priority: Priority,
    /// Application-level token; generated when absent.
    pub message_id: Option<String>,
    /// Token of the message being replied to.
    pub in_reply_to: Option<String>,
    /// Explicit target folder.
    pub folder: Option<Folder>,
}

static MESSAGE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl NewMessage {
    /// Creates a message from a sender to recipients.
    #[must_use]
    pub fn new<I, S>(from: impl Into<String>, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            from: from.into(),
            to: to.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the subject.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Targets an explicit folder.
    #[must_use]
    pub const fn in_folder(mut self, folder: Folder) -> Self {
        self.folder = Some(folder);
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Partition this message will be stored in.
    #[must_use]
    pub const fn resolved_folder(&self) -> Folder {
        Folder::resolve(self.folder, self.is_draft, self.is_spam, self.is_deleted)
    }

    /// Checks the required fields.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `from` is missing or malformed, or
    /// `to` is empty or contains a malformed address.
    pub fn validate(&self) -> Result<()> {
        if !is_plausible_address(&self.from) {
            return Err(Error::Validation("sender address is required".into()));
        }
        if self.to.iter().all(|addr| addr.trim().is_empty()) {
            return Err(Error::Validation("at least one recipient is required".into()));
        }
        if let Some(bad) = self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .find(|addr| !addr.trim().is_empty() && !is_plausible_address(addr))
        {
            return Err(Error::Validation(format!("invalid recipient address '{bad}'")));
        }
        Ok(())
    }

    /// Turns the input into a stored message with the given identifier.
    ///
    /// Stamps dates, derives the thread, normalizes addresses and makes the
    /// flags agree with the resolved folder.
    ///
    /// # Errors
    ///
    /// Returns a validation error if [`Self::validate`] fails.
    pub fn into_message(self, id: MessageId, now: DateTime<Utc>) -> Result<Message> {
        self.validate()?;
        let folder = self.resolved_folder();
        let message_id = self
            .message_id
            .filter(|token| !token.trim().is_empty())
            .unwrap_or_else(|| generate_message_token(now));
        let mut message = Message {
            id,
            folder,
            from: normalize_address(&self.from),
            to: normalize_list(self.to),
            cc: normalize_list(self.cc),
            bcc: normalize_list(self.bcc),
            thread_id: thread_id_for_subject(&self.subject),
            subject: self.subject,
            body: self.body,
            date: self.date.unwrap_or(now),
            created_at: now,
            updated_at: now,
            is_read: self.is_read,
            is_starred: self.is_starred,
            is_deleted: false,
            is_spam: false,
            is_draft: false,
            has_attachments: self.has_attachments || !self.attachments.is_empty(),
            attachments: self.attachments,
            labels: self.labels,
            priority: self.priority,
            message_id,
            in_reply_to: self.in_reply_to,
            previous_folder: None,
            deleted_at: (folder == Folder::Trash).then_some(now),
            read_at: self.is_read.then_some(now),
        };
        message.sync_flags();
        Ok(message)
    }
}

/// Partial update of a message.
///
/// Identity fields (`id`, `from`, `messageId`) and the folder flags are not
/// patchable; folder changes go through a move so partitions stay consistent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePatch {
    /// New primary recipients (must not be empty).
    pub to: Option<Vec<String>>,
    /// New carbon-copy recipients.
    pub cc: Option<Vec<String>>,
    /// New blind carbon-copy recipients.
    pub bcc: Option<Vec<String>>,
    /// New subject (re-derives the thread).
    pub subject: Option<String>,
    /// New body.
    pub body: Option<String>,
    /// Read flag.
    pub is_read: Option<bool>,
    /// Star flag.
    pub is_starred: Option<bool>,
    /// Replacement labels.
    pub labels: Option<BTreeSet<String>>,
    /// Importance.
    pub priority: Option<Priority>,
    /// Reply reference.
    pub in_reply_to: Option<String>,
    /// Replacement attachment metadata.
    pub attachments: Option<Vec<AttachmentMeta>>,
}

impl MessagePatch {
    /// Builds a patch from composed draft content.
    #[must_use]
    pub fn from_draft(draft: &NewMessage) -> Self {
        Self {
            to: Some(draft.to.clone()),
            cc: Some(draft.cc.clone()),
            bcc: Some(draft.bcc.clone()),
            subject: Some(draft.subject.clone()),
            body: Some(draft.body.clone()),
            attachments: Some(draft.attachments.clone()),
            ..Self::default()
        }
    }
}

fn normalize_list(addresses: Vec<String>) -> Vec<String> {
    addresses
        .iter()
        .map(|addr| normalize_address(addr))
        .filter(|addr| !addr.is_empty())
        .collect()
}

fn is_plausible_address(address: &str) -> bool {
    let address = address.trim();
    address
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
}

/// Generates a fresh `Message-ID` token, unique within the process.
#[must_use]
pub fn generate_message_token(now: DateTime<Utc>) -> String {
    let seq = MESSAGE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("<{}.{seq}@ssmail.local>", now.timestamp_millis())
}
