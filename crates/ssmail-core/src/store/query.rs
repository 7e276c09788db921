//! Listing parameters and paged results.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Default page size.
pub const DEFAULT_LIMIT: usize = 50;

/// Field used to order listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    /// Message date.
    #[default]
    Date,
    /// Record creation time.
    CreatedAt,
    /// Subject line.
    Subject,
    /// Sender address.
    From,
}

impl SortField {
    /// Ordering expression in the relational schema.
    #[must_use]
    pub const fn sql_key(self) -> &'static str {
        match self {
            Self::Date => "date",
            Self::CreatedAt => "created_at",
            Self::Subject => "lower(subject)",
            Self::From => "from_email",
        }
    }
}

/// Direction of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Smallest first.
    Asc,
    /// Largest first.
    #[default]
    Desc,
}

impl SortOrder {
    /// SQL keyword.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Paging, ordering and filtering for list and search calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListQuery {
    /// Maximum number of messages returned.
    pub limit: usize,
    /// Number of matching messages skipped.
    pub skip: usize,
    /// Ordering field.
    pub sort_by: SortField,
    /// Ordering direction.
    pub sort_order: SortOrder,
    /// Case-insensitive filter on subject, body and sender.
    pub search_term: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            skip: 0,
            sort_by: SortField::default(),
            sort_order: SortOrder::default(),
            search_term: None,
        }
    }
}

impl ListQuery {
    /// Sets the page window.
    #[must_use]
    pub const fn page(mut self, limit: usize, skip: usize) -> Self {
        self.limit = limit;
        self.skip = skip;
        self
    }

    /// Sets the search term.
    #[must_use]
    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search_term = Some(term.into());
        self
    }

    /// Lower-cased search term, `None` when absent or blank.
    #[must_use]
    pub fn normalized_term(&self) -> Option<String> {
        self.search_term
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase)
    }

    /// Orders matching messages in place.
    pub fn sort(&self, messages: &mut [Message]) {
        messages.sort_by(|a, b| {
            let ord = compare(a, b, self.sort_by).then_with(|| a.id.cmp(&b.id));
            match self.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }

    /// Sorts the full match set and cuts out the requested page.
    #[must_use]
    pub fn paginate(&self, mut messages: Vec<Message>) -> MessagePage {
        self.sort(&mut messages);
        let total_count = messages.len();
        let messages = messages
            .into_iter()
            .skip(self.skip)
            .take(self.limit)
            .collect();
        MessagePage::new(messages, total_count, self)
    }
}

fn compare(a: &Message, b: &Message, field: SortField) -> Ordering {
    match field {
        SortField::Date => a.date.cmp(&b.date),
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::Subject => a.subject.to_lowercase().cmp(&b.subject.to_lowercase()),
        SortField::From => a.from.cmp(&b.from),
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// Messages on this page.
    pub messages: Vec<Message>,
    /// Number of matches before paging.
    pub total_count: usize,
    /// Whether more matches follow this page.
    pub has_more: bool,
}

impl MessagePage {
    /// Builds a page, deriving `has_more` from the query window.
    #[must_use]
    pub const fn new(messages: Vec<Message>, total_count: usize, query: &ListQuery) -> Self {
        Self {
            messages,
            total_count,
            has_more: query.skip.saturating_add(query.limit) < total_count,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::message::{MessageId, NewMessage};

    fn message(id: &str, subject: &str, offset_mins: i64) -> Message {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        NewMessage::new("a@sys.local", ["b@sys.local"])
            .subject(subject)
            .into_message(MessageId::new(id), now + Duration::minutes(offset_mins))
            .unwrap()
    }

    #[test]
    fn default_is_newest_first() {
        let page = ListQuery::default().paginate(vec![
            message("1", "old", 0),
            message("2", "new", 10),
        ]);
        assert_eq!(page.messages[0].id.as_str(), "2");
        assert_eq!(page.total_count, 2);
        assert!(!page.has_more);
    }

    #[test]
    fn has_more_follows_window() {
        let all: Vec<_> = (0..5).map(|i| message(&i.to_string(), "s", i)).collect();
        let page = ListQuery::default().page(2, 2).paginate(all.clone());
        assert_eq!(page.messages.len(), 2);
        assert!(page.has_more);

        let last = ListQuery::default().page(2, 4).paginate(all);
        assert_eq!(last.messages.len(), 1);
        assert!(!last.has_more);
    }

    #[test]
    fn subject_sort_ascending() {
        let query = ListQuery {
            sort_by: SortField::Subject,
            sort_order: SortOrder::Asc,
            ..ListQuery::default()
        };
        let page = query.paginate(vec![message("1", "beta", 0), message("2", "Alpha", 1)]);
        assert_eq!(page.messages[0].subject, "Alpha");
    }

    #[test]
    fn blank_term_is_ignored() {
        assert_eq!(ListQuery::default().search("  ").normalized_term(), None);
        assert_eq!(
            ListQuery::default().search("HeLLo").normalized_term().as_deref(),
            Some("hello")
        );
    }
}
