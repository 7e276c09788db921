//! Mailbox statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Folder, Message};

/// Per-day message counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCount {
    /// Calendar day (UTC).
    pub day: NaiveDate,
    /// Messages sent by the user that day.
    pub sent: u64,
    /// Messages received by the user that day.
    pub received: u64,
}

/// Aggregated counts for one mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailStatistics {
    /// Messages in the user's inbox.
    pub received: u64,
    /// Messages in the user's sent folder.
    pub sent: u64,
    /// The user's drafts.
    pub drafts: u64,
    /// Messages in the user's spam folder.
    pub spam: u64,
    /// Messages in the user's trash.
    pub trash: u64,
    /// Starred messages outside the trash.
    pub starred: u64,
    /// Unread messages in the inbox. Other folders never count.
    pub unread_count: u64,
    /// Sent/received counts per day over the requested range, oldest first.
    pub daily: Vec<DailyCount>,
}

/// Folds messages into [`MailStatistics`] for one user.
///
/// Callers feed every message of every partition; the accumulator applies
/// the per-folder visibility rules itself.
#[derive(Debug)]
pub struct StatsAccumulator<'a> {
    user: &'a str,
    since: DateTime<Utc>,
    stats: MailStatistics,
    daily: BTreeMap<NaiveDate, (u64, u64)>,
}

impl<'a> StatsAccumulator<'a> {
    /// Starts an accumulation covering `days` days before `now`.
    #[must_use]
    pub fn new(user: &'a str, days: u32, now: DateTime<Utc>) -> Self {
        Self {
            user,
            since: range_start(days, now),
            stats: MailStatistics::default(),
            daily: BTreeMap::new(),
        }
    }

    /// Counts one message.
    pub fn add(&mut self, message: &Message) {
        if !message.is_listed_for(self.user) {
            return;
        }
        let counter = match message.folder {
            Folder::Inbox => Some(&mut self.stats.received),
            Folder::Sent => Some(&mut self.stats.sent),
            Folder::Drafts => Some(&mut self.stats.drafts),
            Folder::Spam => Some(&mut self.stats.spam),
            Folder::Trash => Some(&mut self.stats.trash),
            Folder::Archive => None,
        };
        if let Some(counter) = counter {
            *counter += 1;
        }
        if message.folder == Folder::Inbox && !message.is_read {
            self.stats.unread_count += 1;
        }
        if message.is_starred && message.folder != Folder::Trash {
            self.stats.starred += 1;
        }
        if message.folder != Folder::Drafts && message.date >= self.since {
            let entry = self.daily.entry(message.date.date_naive()).or_default();
            if message.from == self.user {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
    }

    /// Finishes the accumulation.
    #[must_use]
    pub fn finish(mut self) -> MailStatistics {
        self.stats.daily = self
            .daily
            .into_iter()
            .map(|(day, (sent, received))| DailyCount {
                day,
                sent,
                received,
            })
            .collect();
        self.stats
    }
}

/// First instant included in a statistics range.
///
/// Ranges reaching past the earliest representable instant start there.
#[must_use]
pub fn range_start(days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    Duration::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::message::{MessageId, NewMessage};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    fn stored(input: NewMessage, id: &str) -> Message {
        input.into_message(MessageId::new(id), now()).unwrap()
    }

    #[test]
    fn unread_counts_inbox_only() {
        let user = "u@sys.local";
        let mut acc = StatsAccumulator::new(user, 30, now());
        acc.add(&stored(NewMessage::new("x@sys.local", [user]), "1"));
        acc.add(&stored(NewMessage::new("x@sys.local", [user]).in_folder(Folder::Spam), "2"));
        acc.add(&stored(NewMessage::new("x@sys.local", [user]).in_folder(Folder::Trash), "3"));
        acc.add(&stored(NewMessage::new(user, ["y@sys.local"]).in_folder(Folder::Sent), "4"));
        let stats = acc.finish();
        assert_eq!(stats.unread_count, 1);
        assert_eq!(stats.received, 1);
        assert_eq!(stats.spam, 1);
        assert_eq!(stats.trash, 1);
        assert_eq!(stats.sent, 1);
    }

    #[test]
    fn other_users_are_ignored() {
        let mut acc = StatsAccumulator::new("u@sys.local", 30, now());
        acc.add(&stored(NewMessage::new("x@sys.local", ["v@sys.local"]), "1"));
        assert_eq!(acc.finish(), MailStatistics::default());
    }

    #[test]
    fn daily_series_skips_drafts_and_old_mail() {
        let user = "u@sys.local";
        let mut acc = StatsAccumulator::new(user, 7, now());
        acc.add(&stored(NewMessage::new(user, ["y@sys.local"]).in_folder(Folder::Sent), "1"));
        acc.add(&stored(NewMessage::new(user, ["y@sys.local"]).in_folder(Folder::Drafts), "2"));
        let mut old = NewMessage::new("x@sys.local", [user]);
        old.date = Some(now() - Duration::days(30));
        acc.add(&stored(old, "3"));
        acc.add(&stored(NewMessage::new("x@sys.local", [user]), "4"));
        let stats = acc.finish();
        assert_eq!(
            stats.daily,
            vec![DailyCount {
                day: now().date_naive(),
                sent: 1,
                received: 1,
            }]
        );
        assert_eq!(stats.drafts, 1);
        assert_eq!(stats.received, 2);
    }

    #[test]
    fn range_start_saturates() {
        assert_eq!(range_start(7, now()), now() - Duration::days(7));
        assert_eq!(range_start(u32::MAX, now()), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn unbounded_range_counts_everything() {
        let user = "u@sys.local";
        let mut acc = StatsAccumulator::new(user, u32::MAX, now());
        let mut old = NewMessage::new("x@sys.local", [user]);
        old.date = Some(Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap());
        acc.add(&stored(old, "1"));
        acc.add(&stored(NewMessage::new(user, ["y@sys.local"]).in_folder(Folder::Sent), "2"));
        let stats = acc.finish();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.daily.len(), 2);
        assert_eq!(stats.daily[0].received, 1);
        assert_eq!(stats.daily[1].sent, 1);
    }
}
