//! Secondary backend: one SQLite table for every folder.
//!
//! The folder is a discriminator column and multi-valued fields (`to`,
//! `labels`, `attachments`, ...) are stored as JSON text. Timestamps are
//! RFC 3339 strings with millisecond precision so text order is time order.
//!
//! Only the operations needed to keep a mailbox readable and writable are
//! ported here; the rest fall back to the trait's `NotImplemented` defaults.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::debug;

use super::{ListQuery, MailStatistics, MailStore, MessagePage, StatsAccumulator};
use crate::clock::Clock;
use crate::message::{
    Folder, Message, MessageId, NewMessage, Priority, ThreadId, Visibility, normalize_address,
};
use crate::{Error, Result};

const COLUMNS: &str = r"
    id, folder, from_email, to_emails, cc_emails, bcc_emails, subject, body,
    date, created_at, updated_at, is_read, is_starred, is_deleted, is_spam,
    is_draft, has_attachments, attachments, labels, priority, message_id,
    in_reply_to, thread_id, previous_folder, deleted_at, read_at
";

const TO_CONTAINS: &str =
    "EXISTS (SELECT 1 FROM json_each(mails.to_emails) WHERE json_each.value = ?)";

/// Relational store with a flattened schema.
pub struct RelationalStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl RelationalStore {
    /// Connect to the database at `url` and create the schema if needed.
    ///
    /// Accepts a full `sqlite:` URL or a plain file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(url: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite:{url}?mode=rwc")
        };
        // Every pooled connection to an in-memory database is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;

        let store = Self { pool, clock };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new("sqlite::memory:", clock).await
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS mails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                folder TEXT NOT NULL,
                from_email TEXT NOT NULL,
                to_emails TEXT NOT NULL,
                cc_emails TEXT NOT NULL DEFAULT '[]',
                bcc_emails TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_spam INTEGER NOT NULL DEFAULT 0,
                is_draft INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                attachments TEXT NOT NULL DEFAULT '[]',
                labels TEXT NOT NULL DEFAULT '[]',
                priority TEXT NOT NULL DEFAULT 'normal',
                message_id TEXT NOT NULL,
                in_reply_to TEXT,
                thread_id TEXT NOT NULL,
                previous_folder TEXT,
                deleted_at TEXT,
                read_at TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_mails_folder_date ON mails(folder, date)",
            "CREATE INDEX IF NOT EXISTS idx_mails_from ON mails(from_email)",
            "CREATE INDEX IF NOT EXISTS idx_mails_thread ON mails(thread_id)",
            "CREATE INDEX IF NOT EXISTS idx_mails_message_id ON mails(message_id)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn fetch_row(&self, id: &MessageId) -> Result<Option<Message>> {
        let Ok(rowid) = id.as_str().parse::<i64>() else {
            return Ok(None);
        };
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM mails WHERE id = ?"))
            .bind(rowid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn fetch_page(&self, filter: Filter, query: &ListQuery) -> Result<MessagePage> {
        let count_sql = format!("SELECT COUNT(*) FROM mails WHERE {}", filter.clause);
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
        for param in &filter.params {
            count = count.bind(param);
        }
        let total = usize::try_from(count.fetch_one(&self.pool).await?).unwrap_or_default();

        let list_sql = format!(
            "SELECT {COLUMNS} FROM mails WHERE {} ORDER BY {key} {dir}, id {dir} LIMIT ? OFFSET ?",
            filter.clause,
            key = query.sort_by.sql_key(),
            dir = query.sort_order.keyword(),
        );
        let mut list = sqlx::query(&list_sql);
        for param in &filter.params {
            list = list.bind(param);
        }
        let rows = list
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(query.skip).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let messages = rows.iter().map(row_to_message).collect::<Result<Vec<_>>>()?;
        Ok(MessagePage::new(messages, total, query))
    }

    async fn fetch_all(&self, filter: Filter, order: &str) -> Result<Vec<Message>> {
        let sql = format!("SELECT {COLUMNS} FROM mails WHERE {} {order}", filter.clause);
        let mut select = sqlx::query(&sql);
        for param in &filter.params {
            select = select.bind(param);
        }
        let rows = select.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }
}

/// SQL predicate plus its positional parameters.
#[derive(Debug, Default)]
struct Filter {
    clause: String,
    params: Vec<String>,
}

impl Filter {
    fn and(mut self, clause: &str, params: impl IntoIterator<Item = String>) -> Self {
        if !self.clause.is_empty() {
            self.clause.push_str(" AND ");
        }
        self.clause.push_str(clause);
        self.params.extend(params);
        self
    }

    /// Rows the user may see in `folder`.
    fn listed_for(self, user: &str, folder: Folder) -> Self {
        let user = user.to_string();
        let filter = self.and("folder = ?", [folder.as_str().to_string()]);
        match folder.visibility() {
            Visibility::Recipient => filter.and(TO_CONTAINS, [user]),
            Visibility::Sender => filter.and("from_email = ?", [user]),
            Visibility::Participant => filter.participant(&user),
        }
    }

    fn participant(self, user: &str) -> Self {
        self.and(
            &format!("(from_email = ? OR {TO_CONTAINS})"),
            [user.to_string(), user.to_string()],
        )
    }

    fn matching(self, term: Option<&str>) -> Self {
        match term {
            Some(term) => {
                let pattern = format!("%{}%", escape_like(term));
                self.and(
                    r"(lower(subject) LIKE ? ESCAPE '\' OR lower(body) LIKE ? ESCAPE '\' OR from_email LIKE ? ESCAPE '\')",
                    [pattern.clone(), pattern.clone(), pattern],
                )
            }
            None => self,
        }
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::StorageUnavailable(format!("bad timestamp '{text}': {e}")))
}

fn parse_optional_time(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.as_deref().map(parse_time).transpose()
}

/// Convert a database row to a Message.
fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let folder: String = row.try_get("folder")?;
    let previous_folder: Option<String> = row.try_get("previous_folder")?;
    Ok(Message {
        id: MessageId(row.try_get::<i64, _>("id")?.to_string()),
        folder: folder.parse()?,
        from: row.try_get("from_email")?,
        to: serde_json::from_str(row.try_get("to_emails")?)?,
        cc: serde_json::from_str(row.try_get("cc_emails")?)?,
        bcc: serde_json::from_str(row.try_get("bcc_emails")?)?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        date: parse_time(row.try_get("date")?)?,
        created_at: parse_time(row.try_get("created_at")?)?,
        updated_at: parse_time(row.try_get("updated_at")?)?,
        is_read: row.try_get("is_read")?,
        is_starred: row.try_get("is_starred")?,
        is_deleted: row.try_get("is_deleted")?,
        is_spam: row.try_get("is_spam")?,
        is_draft: row.try_get("is_draft")?,
        has_attachments: row.try_get("has_attachments")?,
        attachments: serde_json::from_str(row.try_get("attachments")?)?,
        labels: serde_json::from_str(row.try_get("labels")?)?,
        priority: Priority::parse(row.try_get("priority")?),
        message_id: row.try_get("message_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        thread_id: ThreadId(row.try_get("thread_id")?),
        previous_folder: previous_folder.as_deref().map(str::parse::<Folder>).transpose()?,
        deleted_at: parse_optional_time(row.try_get("deleted_at")?)?,
        read_at: parse_optional_time(row.try_get("read_at")?)?,
    })
}

#[async_trait]
impl MailStore for RelationalStore {
    fn backend(&self) -> &'static str {
        "relational"
    }

    async fn create(&self, input: NewMessage) -> Result<MessageId> {
        // The row id is only known after the insert
        let message = input.into_message(MessageId::default(), self.clock.now())?;
        let result = sqlx::query(
            r"
            INSERT INTO mails (
                folder, from_email, to_emails, cc_emails, bcc_emails, subject, body,
                date, created_at, updated_at, is_read, is_starred, is_deleted, is_spam,
                is_draft, has_attachments, attachments, labels, priority, message_id,
                in_reply_to, thread_id, previous_folder, deleted_at, read_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(message.folder.as_str())
        .bind(&message.from)
        .bind(serde_json::to_string(&message.to)?)
        .bind(serde_json::to_string(&message.cc)?)
        .bind(serde_json::to_string(&message.bcc)?)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(format_time(message.date))
        .bind(format_time(message.created_at))
        .bind(format_time(message.updated_at))
        .bind(message.is_read)
        .bind(message.is_starred)
        .bind(message.is_deleted)
        .bind(message.is_spam)
        .bind(message.is_draft)
        .bind(message.has_attachments)
        .bind(serde_json::to_string(&message.attachments)?)
        .bind(serde_json::to_string(&message.labels)?)
        .bind(message.priority.as_str())
        .bind(&message.message_id)
        .bind(&message.in_reply_to)
        .bind(message.thread_id.as_str())
        .bind(message.previous_folder.map(Folder::as_str))
        .bind(message.deleted_at.map(format_time))
        .bind(message.read_at.map(format_time))
        .execute(&self.pool)
        .await?;

        let id = MessageId(result.last_insert_rowid().to_string());
        debug!("Stored mail {id} in {} (relational)", message.folder);
        Ok(id)
    }

    async fn list_by_user(
        &self,
        user: &str,
        folder: Folder,
        query: &ListQuery,
    ) -> Result<MessagePage> {
        let user = normalize_address(user);
        let term = query.normalized_term();
        let filter = Filter::default()
            .listed_for(&user, folder)
            .matching(term.as_deref());
        self.fetch_page(filter, query).await
    }

    async fn search(&self, user: &str, term: &str, query: &ListQuery) -> Result<MessagePage> {
        let user = normalize_address(user);
        let query = query.clone().search(term);
        let term = query.normalized_term();

        // Same per-folder visibility as listing, over every folder but the trash
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for folder in Folder::ALL.into_iter().filter(|f| *f != Folder::Trash) {
            let part = Filter::default().listed_for(&user, folder);
            clauses.push(format!("({})", part.clause));
            params.extend(part.params);
        }
        let filter = Filter {
            clause: format!("({})", clauses.join(" OR ")),
            params,
        }
        .matching(term.as_deref());
        self.fetch_page(filter, &query).await
    }

    async fn get_by_id(&self, id: &MessageId, user: &str) -> Result<Message> {
        let user = normalize_address(user);
        self.fetch_row(id)
            .await?
            .filter(|message| message.is_visible_to(&user))
            .ok_or_else(|| Error::NotFound(format!("mail {id}")))
    }

    async fn mark_read(&self, id: &MessageId, user: &str) -> Result<()> {
        let message = self.get_by_id(id, user).await?;
        let now = format_time(self.clock.now());
        sqlx::query(
            r"
            UPDATE mails SET
                is_read = 1,
                read_at = COALESCE(read_at, ?),
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&now)
        .bind(&now)
        .bind(message.id.as_str().parse::<i64>().unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn statistics(&self, user: &str, days: u32) -> Result<MailStatistics> {
        let user = normalize_address(user);
        let rows = self
            .fetch_all(Filter::default().participant(&user), "")
            .await?;
        let mut acc = StatsAccumulator::new(&user, days, self.clock.now());
        for message in &rows {
            acc.add(message);
        }
        Ok(acc.finish())
    }

    async fn thread(&self, thread_id: &ThreadId, user: &str) -> Result<Vec<Message>> {
        let user = normalize_address(user);
        let filter = Filter::default()
            .and("thread_id = ?", [thread_id.as_str().to_string()])
            .participant(&user);
        self.fetch_all(filter, "ORDER BY date ASC, id ASC").await
    }

    async fn has_message_id(&self, token: &str, owner: &str) -> Result<bool> {
        let owner = normalize_address(owner);
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM mails WHERE message_id = ? AND (from_email = ? OR {TO_CONTAINS}))"
        );
        let exists: i64 = sqlx::query_scalar(&sql)
            .bind(token)
            .bind(&owner)
            .bind(&owner)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists != 0)
    }
}
