//! Stand-in store used when no backend accepts writes.

use async_trait::async_trait;

use crate::message::{Folder, Message, MessageId, MessagePatch, NewMessage, ThreadId};
use crate::store::{ListQuery, MailStatistics, MailStore, MessagePage};
use crate::{Error, Result};

/// Fails every write and answers every read with an empty result.
#[derive(Debug, Default, Clone, Copy)]
pub struct DegradedStore;

fn unavailable() -> Error {
    Error::StorageUnavailable("no storage backend is available".into())
}

#[async_trait]
impl MailStore for DegradedStore {
    fn backend(&self) -> &'static str {
        "degraded"
    }

    async fn create(&self, _message: NewMessage) -> Result<MessageId> {
        Err(unavailable())
    }

    async fn list_by_user(
        &self,
        _user: &str,
        _folder: Folder,
        query: &ListQuery,
    ) -> Result<MessagePage> {
        Ok(MessagePage::new(Vec::new(), 0, query))
    }

    async fn search(&self, _user: &str, _term: &str, query: &ListQuery) -> Result<MessagePage> {
        Ok(MessagePage::new(Vec::new(), 0, query))
    }

    async fn get_by_id(&self, id: &MessageId, _user: &str) -> Result<Message> {
        Err(Error::NotFound(format!("mail {id}")))
    }

    async fn update(&self, _id: &MessageId, _user: &str, _patch: MessagePatch) -> Result<()> {
        Err(unavailable())
    }

    async fn move_to_folder(&self, _id: &MessageId, _user: &str, _target: Folder) -> Result<()> {
        Err(unavailable())
    }

    async fn hard_delete(&self, _id: &MessageId, _user: &str) -> Result<()> {
        Err(unavailable())
    }

    async fn mark_read(&self, _id: &MessageId, _user: &str) -> Result<()> {
        Err(unavailable())
    }

    async fn toggle_star(&self, _id: &MessageId, _user: &str) -> Result<bool> {
        Err(unavailable())
    }

    async fn statistics(&self, _user: &str, _days: u32) -> Result<MailStatistics> {
        Ok(MailStatistics::default())
    }

    async fn thread(&self, _thread_id: &ThreadId, _user: &str) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn clear_drafts(&self, _user: &str) -> Result<u64> {
        Err(unavailable())
    }

    async fn has_message_id(&self, _token: &str, _owner: &str) -> Result<bool> {
        Ok(false)
    }
}
