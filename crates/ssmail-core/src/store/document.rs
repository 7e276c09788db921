//! Primary backend: embedded document store.
//!
//! Each folder is its own redb table mapping the message id to the JSON
//! document. A move removes the document from one table and inserts it into
//! another inside a single write transaction, so readers always see it in
//! exactly one partition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, info};

use super::{ListQuery, MailStatistics, MailStore, MessagePage, StatsAccumulator};
use crate::clock::Clock;
use crate::message::{
    Folder, Message, MessageId, MessagePatch, NewMessage, ThreadId, normalize_address,
};
use crate::{Error, Result};

const INBOX: TableDefinition<&str, &[u8]> = TableDefinition::new("inbox");
const SENT: TableDefinition<&str, &[u8]> = TableDefinition::new("sent");
const DRAFTS: TableDefinition<&str, &[u8]> = TableDefinition::new("drafts");
const SPAM: TableDefinition<&str, &[u8]> = TableDefinition::new("spam");
const TRASH: TableDefinition<&str, &[u8]> = TableDefinition::new("trash");
const ARCHIVE: TableDefinition<&str, &[u8]> = TableDefinition::new("archive");
// Single counter row used to mint ids unique across partitions
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const SEQUENCE_KEY: &str = "sequence";

const fn partition(folder: Folder) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match folder {
        Folder::Inbox => INBOX,
        Folder::Sent => SENT,
        Folder::Drafts => DRAFTS,
        Folder::Spam => SPAM,
        Folder::Trash => TRASH,
        Folder::Archive => ARCHIVE,
    }
}

/// Document-style store with one table per folder.
pub struct DocumentStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
}

impl DocumentStore {
    /// Opens (or creates) the store file and every partition table.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or opened, or the
    /// partitions cannot be initialized.
    pub async fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.into();
        let db_path = path.clone();
        let db = tokio::task::spawn_blocking(move || -> Result<Database> {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let db = Database::create(&db_path)?;
            init_partitions(&db)?;
            Ok(db)
        })
        .await??;

        info!("Opened document store at {}", path.display());
        Ok(Self {
            db: Arc::new(db),
            clock,
            path,
        })
    }

    /// Location of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database, &dyn Clock) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let clock = Arc::clone(&self.clock);
        tokio::task::spawn_blocking(move || f(&db, clock.as_ref())).await?
    }
}

/// Creates every table if absent.
fn init_partitions(db: &Database) -> Result<()> {
    let txn = db.begin_write()?;
    {
        for folder in Folder::ALL {
            let _ = txn.open_table(partition(folder))?;
        }
        let _ = txn.open_table(META)?;
    }
    txn.commit()?;
    Ok(())
}

/// Calls `each` for every message stored in `folders`.
fn visit(db: &Database, folders: &[Folder], mut each: impl FnMut(Message)) -> Result<()> {
    let txn = db.begin_read()?;
    for &folder in folders {
        let table = txn.open_table(partition(folder))?;
        for entry in table.iter()? {
            let (_, value) = entry?;
            each(serde_json::from_slice(value.value())?);
        }
    }
    Ok(())
}

fn collect(
    db: &Database,
    folders: &[Folder],
    keep: impl Fn(&Message) -> bool,
) -> Result<Vec<Message>> {
    let mut found = Vec::new();
    visit(db, folders, |message| {
        if keep(&message) {
            found.push(message);
        }
    })?;
    Ok(found)
}

fn not_found(id: &str) -> Error {
    Error::NotFound(format!("mail {id}"))
}

/// Loads a visible message, lets `change` edit it, then writes it back to
/// the partition its folder now names. Nothing is written if `change` fails.
fn modify<R>(
    db: &Database,
    id: &str,
    user: &str,
    change: impl FnOnce(&mut Message) -> Result<R>,
) -> Result<R> {
    let txn = db.begin_write()?;
    let mut located = None;
    for folder in Folder::ALL {
        let table = txn.open_table(partition(folder))?;
        let found = table
            .get(id)?
            .map(|value| serde_json::from_slice::<Message>(value.value()))
            .transpose()?;
        if let Some(message) = found {
            located = Some((folder, message));
            break;
        }
    }
    let Some((source, mut message)) = located.filter(|(_, m)| m.is_visible_to(user)) else {
        return Err(not_found(id));
    };

    let result = change(&mut message)?;
    let bytes = serde_json::to_vec(&message)?;
    {
        let mut table = txn.open_table(partition(source))?;
        if message.folder == source {
            table.insert(id, bytes.as_slice())?;
        } else {
            table.remove(id)?;
        }
    }
    if message.folder != source {
        let mut target = txn.open_table(partition(message.folder))?;
        target.insert(id, bytes.as_slice())?;
        debug!("Moved mail {id} from {source} to {}", message.folder);
    }
    txn.commit()?;
    Ok(result)
}

#[async_trait]
impl MailStore for DocumentStore {
    fn backend(&self) -> &'static str {
        "document"
    }

    async fn create(&self, input: NewMessage) -> Result<MessageId> {
        input.validate()?;
        self.blocking(move |db, clock| {
            let txn = db.begin_write()?;
            let (id, folder) = {
                let mut meta = txn.open_table(META)?;
                let next = meta.get(SEQUENCE_KEY)?.map_or(0, |v| v.value()) + 1;
                meta.insert(SEQUENCE_KEY, next)?;

                let id = MessageId(format!("{next:016x}"));
                let message = input.into_message(id.clone(), clock.now())?;
                let bytes = serde_json::to_vec(&message)?;
                let mut table = txn.open_table(partition(message.folder))?;
                table.insert(id.as_str(), bytes.as_slice())?;
                (id, message.folder)
            };
            txn.commit()?;
            debug!("Stored mail {id} in {folder}");
            Ok(id)
        })
        .await
    }

    async fn list_by_user(
        &self,
        user: &str,
        folder: Folder,
        query: &ListQuery,
    ) -> Result<MessagePage> {
        let user = normalize_address(user);
        let query = query.clone();
        self.blocking(move |db, _| {
            let term = query.normalized_term();
            let matches = collect(db, &[folder], |m| {
                m.is_listed_for(&user) && term.as_deref().is_none_or(|t| m.matches_term(t))
            })?;
            Ok(query.paginate(matches))
        })
        .await
    }

    async fn search(&self, user: &str, term: &str, query: &ListQuery) -> Result<MessagePage> {
        let user = normalize_address(user);
        let query = query.clone().search(term);
        self.blocking(move |db, _| {
            let term = query.normalized_term();
            let folders: Vec<Folder> = Folder::ALL
                .into_iter()
                .filter(|f| *f != Folder::Trash)
                .collect();
            let matches = collect(db, &folders, |m| {
                m.is_listed_for(&user) && term.as_deref().is_none_or(|t| m.matches_term(t))
            })?;
            Ok(query.paginate(matches))
        })
        .await
    }

    async fn get_by_id(&self, id: &MessageId, user: &str) -> Result<Message> {
        let id = id.clone();
        let user = normalize_address(user);
        self.blocking(move |db, _| {
            let txn = db.begin_read()?;
            for folder in Folder::ALL {
                let table = txn.open_table(partition(folder))?;
                if let Some(value) = table.get(id.as_str())? {
                    let message: Message = serde_json::from_slice(value.value())?;
                    if message.is_visible_to(&user) {
                        return Ok(message);
                    }
                    break;
                }
            }
            Err(not_found(id.as_str()))
        })
        .await
    }

    async fn update(&self, id: &MessageId, user: &str, patch: MessagePatch) -> Result<()> {
        let id = id.clone();
        let user = normalize_address(user);
        self.blocking(move |db, clock| {
            modify(db, id.as_str(), &user, |message| message.apply(patch, clock.now()))
        })
        .await
    }

    async fn move_to_folder(&self, id: &MessageId, user: &str, target: Folder) -> Result<()> {
        let id = id.clone();
        let user = normalize_address(user);
        self.blocking(move |db, clock| {
            modify(db, id.as_str(), &user, |message| {
                message.relocate(target, clock.now());
                Ok(())
            })
        })
        .await
    }

    async fn hard_delete(&self, id: &MessageId, user: &str) -> Result<()> {
        let id = id.clone();
        let user = normalize_address(user);
        self.blocking(move |db, _| {
            let txn = db.begin_write()?;
            let mut removed = false;
            for folder in Folder::ALL {
                let mut table = txn.open_table(partition(folder))?;
                let found = table
                    .get(id.as_str())?
                    .map(|value| serde_json::from_slice::<Message>(value.value()))
                    .transpose()?;
                if let Some(message) = found {
                    if !message.is_visible_to(&user) {
                        break;
                    }
                    table.remove(id.as_str())?;
                    removed = true;
                    break;
                }
            }
            if !removed {
                return Err(not_found(id.as_str()));
            }
            txn.commit()?;
            debug!("Permanently deleted mail {id}");
            Ok(())
        })
        .await
    }

    async fn mark_read(&self, id: &MessageId, user: &str) -> Result<()> {
        let id = id.clone();
        let user = normalize_address(user);
        self.blocking(move |db, clock| {
            modify(db, id.as_str(), &user, |message| {
                message.mark_read(clock.now());
                Ok(())
            })
        })
        .await
    }

    async fn toggle_star(&self, id: &MessageId, user: &str) -> Result<bool> {
        let id = id.clone();
        let user = normalize_address(user);
        self.blocking(move |db, clock| {
            modify(db, id.as_str(), &user, |message| {
                message.is_starred = !message.is_starred;
                message.updated_at = clock.now();
                Ok(message.is_starred)
            })
        })
        .await
    }

    async fn statistics(&self, user: &str, days: u32) -> Result<MailStatistics> {
        let user = normalize_address(user);
        self.blocking(move |db, clock| {
            let mut acc = StatsAccumulator::new(&user, days, clock.now());
            visit(db, &Folder::ALL, |message| acc.add(&message))?;
            Ok(acc.finish())
        })
        .await
    }

    async fn thread(&self, thread_id: &ThreadId, user: &str) -> Result<Vec<Message>> {
        let thread_id = thread_id.clone();
        let user = normalize_address(user);
        self.blocking(move |db, _| {
            let mut messages = collect(db, &Folder::ALL, |m| {
                m.thread_id == thread_id && m.is_visible_to(&user)
            })?;
            messages.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
            Ok(messages)
        })
        .await
    }

    async fn clear_drafts(&self, user: &str) -> Result<u64> {
        let user = normalize_address(user);
        self.blocking(move |db, _| {
            let txn = db.begin_write()?;
            let removed = {
                let mut table = txn.open_table(DRAFTS)?;
                let mut owned = Vec::new();
                for entry in table.iter()? {
                    let (key, value) = entry?;
                    let message: Message = serde_json::from_slice(value.value())?;
                    if message.from == user {
                        owned.push(key.value().to_string());
                    }
                }
                for key in &owned {
                    table.remove(key.as_str())?;
                }
                owned.len() as u64
            };
            txn.commit()?;
            debug!("Cleared {removed} drafts for {user}");
            Ok(removed)
        })
        .await
    }

    async fn has_message_id(&self, token: &str, owner: &str) -> Result<bool> {
        let token = token.to_string();
        let owner = normalize_address(owner);
        self.blocking(move |db, _| {
            let mut seen = false;
            visit(db, &Folder::ALL, |message| {
                seen |= message.message_id == token && message.is_visible_to(&owner);
            })?;
            Ok(seen)
        })
        .await
    }
}
