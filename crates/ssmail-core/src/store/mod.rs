//! Folder-partitioned message persistence.
//!
//! [`MailStore`] is the one persistence contract the rest of the crate talks
//! to. Two backends implement it:
//!
//! - [`DocumentStore`]: embedded document database with one physical table
//!   per folder; every operation is supported.
//! - [`RelationalStore`]: a single SQL table with a `folder` discriminator.
//!   Operations that have not been ported to it return
//!   [`Error::NotImplemented`](crate::Error::NotImplemented).

mod document;
mod query;
mod relational;
mod stats;

use async_trait::async_trait;

pub use document::DocumentStore;
pub use query::{DEFAULT_LIMIT, ListQuery, MessagePage, SortField, SortOrder};
pub use relational::RelationalStore;
pub use stats::{DailyCount, MailStatistics, StatsAccumulator};

use crate::message::{Folder, Message, MessageId, MessagePatch, NewMessage, ThreadId};
use crate::{Error, Result};

/// Persistence contract shared by both backends.
///
/// User addresses passed in are compared after trimming and lower-casing.
/// Every lookup by id applies the visibility rule: the caller must be the
/// sender or a primary recipient, otherwise the id is reported as not found.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Short backend name for logs and status output.
    fn backend(&self) -> &'static str;

    /// Stores a new message in the partition its folder resolves to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `from` or `to` is missing.
    async fn create(&self, message: NewMessage) -> Result<MessageId>;

    /// Lists the messages of one folder visible to `user`.
    async fn list_by_user(&self, user: &str, folder: Folder, query: &ListQuery)
    -> Result<MessagePage>;

    /// Searches every folder except the trash.
    async fn search(&self, user: &str, term: &str, query: &ListQuery) -> Result<MessagePage>;

    /// Fetches a message from whichever partition holds it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no visible message has this id.
    async fn get_by_id(&self, id: &MessageId, user: &str) -> Result<Message>;

    /// Applies a patch and stamps `updated_at`.
    async fn update(&self, _id: &MessageId, _user: &str, _patch: MessagePatch) -> Result<()> {
        Err(Error::NotImplemented("update"))
    }

    /// Physically relocates a message to another partition.
    async fn move_to_folder(&self, _id: &MessageId, _user: &str, _target: Folder) -> Result<()> {
        Err(Error::NotImplemented("move"))
    }

    /// Moves a message to the trash, keeping its content.
    async fn soft_delete(&self, id: &MessageId, user: &str) -> Result<()> {
        self.move_to_folder(id, user, Folder::Trash).await
    }

    /// Removes a message for good.
    async fn hard_delete(&self, _id: &MessageId, _user: &str) -> Result<()> {
        Err(Error::NotImplemented("permanent delete"))
    }

    /// Marks a message read, recording when it was first read.
    async fn mark_read(&self, id: &MessageId, user: &str) -> Result<()>;

    /// Flips the star flag, returning the new state.
    async fn toggle_star(&self, _id: &MessageId, _user: &str) -> Result<bool> {
        Err(Error::NotImplemented("star"))
    }

    /// Aggregates counts for `user` over the last `days` days.
    async fn statistics(&self, user: &str, days: u32) -> Result<MailStatistics>;

    /// Messages of a conversation visible to `user`, oldest first.
    async fn thread(&self, thread_id: &ThreadId, user: &str) -> Result<Vec<Message>>;

    /// Permanently removes the user's drafts, returning how many were removed.
    async fn clear_drafts(&self, _user: &str) -> Result<u64> {
        Err(Error::NotImplemented("clear drafts"))
    }

    /// Whether a message carrying this application-level token is already
    /// visible to `owner`. Other mailboxes holding the same token do not count.
    async fn has_message_id(&self, token: &str, owner: &str) -> Result<bool>;
}
