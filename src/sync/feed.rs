use chrono::{ DateTime, TimeZone };
use futures::future::join_all;
use log::{ debug, info, warn };
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ decode, ChatClient };
use crate::models::chat::{ ConversationId, ConversationSummary, UserProfile };
use crate::store::{ Direction, Query, Subscription, SNAPSHOT_BUFFER };
use crate::error::ChatError;

/// One row of a user's conversation list.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationEntry {
    pub summary: ConversationSummary,
    /// `None` when the profile is missing or could not be read.
    pub other_user: Option<UserProfile>,
}

impl ConversationEntry {
    pub fn id(&self) -> ConversationId {
        self.summary.id()
    }

    pub fn has_unread(&self, viewer: &str) -> bool {
        self.summary.unread_for(viewer) > 0
    }

    pub fn preview(&self, viewer: &str) -> String {
        if self.summary.last_sender == viewer {
            format!("You: {}", self.summary.last_message)
        } else {
            self.summary.last_message.clone()
        }
    }

    /// `HH:MM` for messages from the same day as `now`, `Mon DD, YYYY` otherwise.
    /// Both the day and the clock time are taken in `now`'s time zone.
    pub fn display_time<Tz>(&self, now: DateTime<Tz>) -> String
        where Tz: TimeZone, Tz::Offset: fmt::Display
    {
        let Some(sent) = self.summary.last_message_timestamp.to_datetime() else {
            return String::new();
        };
        let at = sent.with_timezone(&now.timezone());
        if at.date_naive() == now.date_naive() {
            at.format("%H:%M").to_string()
        } else {
            at.format("%b %d, %Y").to_string()
        }
    }
}

/// Live conversation list of one user, newest activity first.
pub struct ConversationFeed {
    receiver: mpsc::Receiver<Vec<ConversationEntry>>,
    task: Option<JoinHandle<()>>,
    user: String,
}

impl ChatClient {
    pub async fn conversation_feed(&self, user: &str) -> Result<ConversationFeed, ChatError> {
        let query = Query::collection(self.config().chats_collection.clone())
            .array_contains("participants", user)
            .order_by("lastMessageTimestamp", Direction::Descending);
        let subscription = self.store().subscribe_ordered_query(query).await?;

        let (tx, receiver) = mpsc::channel(SNAPSHOT_BUFFER);
        let task = tokio::spawn(aggregate(self.clone(), user.to_string(), subscription, tx));
        info!("Watching conversation list of {}", user);

        Ok(ConversationFeed {
            receiver,
            task: Some(task),
            user: user.to_string(),
        })
    }

    async fn resolve_entry(&self, user: &str, summary: ConversationSummary) -> ConversationEntry {
        let other_user = match summary.other_participant(user) {
            Some(other) =>
                match self.get_profile(other).await {
                    Ok(profile) => profile,
                    Err(e) => {
                        warn!("Profile lookup for {} failed: {}", other, e);
                        None
                    }
                }
            None => None,
        };
        ConversationEntry { summary, other_user }
    }
}

async fn aggregate(
    client: ChatClient,
    user: String,
    mut subscription: Subscription,
    tx: mpsc::Sender<Vec<ConversationEntry>>
) {
    while let Some(snapshot) = subscription.next().await {
        let mut summaries = Vec::with_capacity(snapshot.len());
        for doc in snapshot {
            match decode::<ConversationSummary>(&doc.id, doc.data) {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!("Skipping conversation {}: {}", doc.id, e),
            }
        }

        let entries = join_all(
            summaries.into_iter().map(|summary| client.resolve_entry(&user, summary))
        ).await;

        if tx.send(entries).await.is_err() {
            break;
        }
    }
    debug!("Conversation list of {} ended", user);
}

impl ConversationFeed {
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The next full list, or `None` once the feed has stopped.
    pub async fn next(&mut self) -> Option<Vec<ConversationEntry>> {
        self.receiver.recv().await
    }

    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Stopped conversation list of {}", self.user);
        }
    }
}

impl Drop for ConversationFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Timestamp;
    use chrono::{ FixedOffset, Utc };
    use std::collections::BTreeMap;

    fn entry(last_sender: &str, at: DateTime<Utc>, unread_u1: u64) -> ConversationEntry {
        let mut unread_counts = BTreeMap::new();
        unread_counts.insert("u1".to_string(), unread_u1);
        unread_counts.insert("u2".to_string(), 0);
        ConversationEntry {
            summary: ConversationSummary {
                participants: ["u1".to_string(), "u2".to_string()],
                last_message: "see you".into(),
                last_message_timestamp: Timestamp::from_millis(at.timestamp_millis()),
                last_sender: last_sender.into(),
                unread_counts,
            },
            other_user: None,
        }
    }

    #[test]
    fn preview_marks_own_messages() {
        let now = Utc::now();
        assert_eq!(entry("u1", now, 0).preview("u1"), "You: see you");
        assert_eq!(entry("u2", now, 0).preview("u1"), "see you");
    }

    #[test]
    fn unread_dot_follows_viewer_count() {
        let now = Utc::now();
        assert!(entry("u2", now, 2).has_unread("u1"));
        assert!(!entry("u2", now, 0).has_unread("u1"));
        assert!(!entry("u2", now, 2).has_unread("u2"));
    }

    #[test]
    fn display_time_switches_format_after_a_day() {
        let sent = Utc.with_ymd_and_hms(2024, 3, 5, 9, 7, 0).unwrap();
        let same_day = Utc.with_ymd_and_hms(2024, 3, 5, 22, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 6, 8, 0, 0).unwrap();

        assert_eq!(entry("u1", sent, 0).display_time(same_day), "09:07");
        assert_eq!(entry("u1", sent, 0).display_time(later), "Mar 05, 2024");
    }

    #[test]
    fn display_time_uses_the_viewers_time_zone() {
        let sent = Utc.with_ymd_and_hms(2024, 3, 5, 23, 30, 0).unwrap();
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let next_morning = plus_two.with_ymd_and_hms(2024, 3, 6, 8, 0, 0).unwrap();
        let minus_five = FixedOffset::west_opt(5 * 3600).unwrap();
        let next_evening = minus_five.with_ymd_and_hms(2024, 3, 6, 20, 0, 0).unwrap();

        assert_eq!(entry("u1", sent, 0).display_time(next_morning), "01:30");
        assert_eq!(entry("u1", sent, 0).display_time(next_evening), "Mar 05, 2024");
    }
}
