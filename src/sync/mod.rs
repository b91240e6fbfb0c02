//! Chat synchronization over a [`DocumentStore`].
//!
//! A conversation between two users is a summary document at
//! `chats/{conversationId}` plus an append-only `messages` sub-collection
//! ordered by server timestamp. Sending updates the summary (last message,
//! sender, recipient's unread count) and then appends the message; opening a
//! conversation clears the viewer's unread count.

pub mod conversation;
pub mod feed;

use log::{ debug, info };
use serde_json::{ json, Value };
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{ ChatConfig, UnreadUpdate };
use crate::error::ChatError;
use crate::models::chat::{ ConversationId, ConversationSummary, Timestamp, UserProfile };
use crate::store::{ document_path, Document, DocumentStore, FieldValue, Fields };

pub use self::conversation::ConversationView;
pub use self::feed::{ ConversationEntry, ConversationFeed };

/// A message accepted for sending but not yet written.
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub client_id: Uuid,
    pub sender_id: String,
    pub recipient_id: String,
    pub text: String,
    pub created_at: Timestamp,
}

impl OutgoingMessage {
    /// Rejects blank text and messages addressed to the sender.
    pub fn new(sender_id: &str, recipient_id: &str, text: &str) -> Result<Self, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if sender_id == recipient_id {
            return Err(ChatError::SelfChat(sender_id.to_string()));
        }
        Ok(Self {
            client_id: Uuid::new_v4(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            text: text.to_string(),
            created_at: Timestamp::now(),
        })
    }

    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::for_pair(&self.sender_id, &self.recipient_id)
    }
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(path: &str, data: Document) -> Result<T, ChatError> {
    serde_json::from_value(Value::Object(data)).map_err(|source| ChatError::Malformed {
        path: path.to_string(),
        source,
    })
}

#[derive(Clone)]
pub struct ChatClient {
    store: Arc<dyn DocumentStore>,
    config: ChatConfig,
}

impl ChatClient {
    pub fn new(store: Arc<dyn DocumentStore>, config: ChatConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub async fn get_summary(
        &self,
        id: &ConversationId
    ) -> Result<Option<ConversationSummary>, ChatError> {
        let path = self.config.summary_path(id);
        match self.store.get_document(&path).await? {
            Some(data) => Ok(Some(decode(&path, data)?)),
            None => Ok(None),
        }
    }

    /// Sets `viewer`'s unread count to zero. Returns `false` without writing
    /// when the conversation has no summary yet.
    pub async fn reset_unread(&self, id: &ConversationId, viewer: &str) -> Result<bool, ChatError> {
        let path = self.config.summary_path(id);
        if self.store.get_document(&path).await?.is_none() {
            debug!("No summary for {}, nothing to reset", id);
            return Ok(false);
        }
        let mut counts = Fields::new();
        counts.insert(viewer.to_string(), FieldValue::set(0));
        let mut fields = Fields::new();
        fields.insert("unreadCounts".into(), FieldValue::Map(counts));
        self.store.set_document(&path, &fields, true).await?;
        debug!("Reset unread count of {} in {}", viewer, id);
        Ok(true)
    }

    /// Writes a message without a conversation view: summary update, then
    /// the message itself.
    pub async fn send_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        text: &str
    ) -> Result<Uuid, ChatError> {
        let outgoing = OutgoingMessage::new(sender_id, recipient_id, text)?;
        self.write_summary(&outgoing).await?;
        self.write_message(&outgoing).await?;
        Ok(outgoing.client_id)
    }

    /// Points the summary at `outgoing` and bumps the recipient's unread count.
    pub(crate) async fn write_summary(&self, outgoing: &OutgoingMessage) -> Result<(), ChatError> {
        let id = outgoing.conversation_id();
        let summary_path = self.config.summary_path(&id);
        let sender = outgoing.sender_id.as_str();
        let recipient = outgoing.recipient_id.as_str();

        let mut fields = Fields::new();
        fields.insert("lastMessage".into(), FieldValue::set(outgoing.text.as_str()));
        fields.insert("lastMessageTimestamp".into(), FieldValue::ServerTimestamp);
        fields.insert("lastSender".into(), FieldValue::set(sender));

        match self.store.get_document(&summary_path).await? {
            None => {
                let mut counts = Fields::new();
                counts.insert(sender.to_string(), FieldValue::set(0));
                counts.insert(recipient.to_string(), FieldValue::set(1));
                fields.insert("participants".into(), FieldValue::set(json!([sender, recipient])));
                fields.insert("unreadCounts".into(), FieldValue::Map(counts));
                self.store.set_document(&summary_path, &fields, false).await?;
                info!("Started conversation {}", id);
            }
            Some(existing) => {
                let existing_counts = existing.get("unreadCounts").and_then(Value::as_object);
                let current = |user: &str| existing_counts.and_then(|c| c.get(user)).and_then(Value::as_u64);

                let mut counts = Fields::new();
                let bump = match self.config.unread_update {
                    UnreadUpdate::Atomic => FieldValue::Increment(1),
                    UnreadUpdate::ReadModifyWrite =>
                        FieldValue::set(current(recipient).unwrap_or(0) + 1),
                };
                counts.insert(recipient.to_string(), bump);
                if current(sender).is_none() {
                    counts.insert(sender.to_string(), FieldValue::set(0));
                }
                fields.insert("unreadCounts".into(), FieldValue::Map(counts));
                self.store.set_document(&summary_path, &fields, true).await?;
            }
        }
        Ok(())
    }

    /// Stores the message under its client id, so writing it again replaces
    /// the earlier copy instead of adding a second one.
    pub(crate) async fn write_message(&self, outgoing: &OutgoingMessage) -> Result<(), ChatError> {
        let id = outgoing.conversation_id();
        let key = outgoing.client_id.to_string();
        let path = document_path(&self.config.messages_path(&id), &key);

        let mut message = Fields::new();
        message.insert("senderId".into(), FieldValue::set(outgoing.sender_id.as_str()));
        message.insert("recipientId".into(), FieldValue::set(outgoing.recipient_id.as_str()));
        message.insert("text".into(), FieldValue::set(outgoing.text.as_str()));
        message.insert("timestamp".into(), FieldValue::ServerTimestamp);
        message.insert("isRead".into(), FieldValue::set(false));
        message.insert("clientId".into(), FieldValue::set(key));
        self.store.set_document(&path, &message, false).await?;
        debug!("Wrote message {} to {}", outgoing.client_id, id);
        Ok(())
    }

    pub async fn put_profile(&self, profile: &UserProfile) -> Result<(), ChatError> {
        let path = self.config.user_path(&profile.id);
        let value = serde_json::to_value(profile).map_err(|source| ChatError::Malformed {
            path: path.clone(),
            source,
        })?;
        let fields: Fields = match value {
            Value::Object(map) => map.into_iter().map(|(k, v)| (k, FieldValue::Set(v))).collect(),
            _ => Fields::new(),
        };
        self.store.set_document(&path, &fields, false).await?;
        Ok(())
    }

    /// Point lookup of a profile; `None` when absent.
    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, ChatError> {
        let path = self.config.user_path(user_id);
        match self.store.get_document(&path).await? {
            Some(data) => Ok(Some(decode(&path, data)?)),
            None => Ok(None),
        }
    }
}
