use serde::{ Deserialize, Serialize };
use std::fmt;
use std::str::FromStr;

use crate::cli::Args;
use crate::models::chat::ConversationId;
use crate::store::document_path;

/// How a send bumps the recipient's unread count on an existing summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnreadUpdate {
    /// Field-level increment applied by the store.
    Atomic,
    /// Read the count, write count + 1. Concurrent sends can lose an increment.
    ReadModifyWrite,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseUnreadUpdateError {
    message: String,
}

impl fmt::Display for ParseUnreadUpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseUnreadUpdateError {}

impl FromStr for UnreadUpdate {
    type Err = ParseUnreadUpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "atomic" => Ok(UnreadUpdate::Atomic),
            "read-modify-write" | "rmw" => Ok(UnreadUpdate::ReadModifyWrite),
            _ =>
                Err(ParseUnreadUpdateError {
                    message: format!("Invalid unread update mode: '{}'", s),
                }),
        }
    }
}

impl fmt::Display for UnreadUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnreadUpdate::Atomic => f.write_str("atomic"),
            UnreadUpdate::ReadModifyWrite => f.write_str("read-modify-write"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub chats_collection: String,
    pub messages_collection: String,
    pub users_collection: String,
    pub unread_update: UnreadUpdate,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            chats_collection: "chats".to_string(),
            messages_collection: "messages".to_string(),
            users_collection: "users".to_string(),
            unread_update: UnreadUpdate::Atomic,
        }
    }
}

impl ChatConfig {
    pub fn from_args(args: &Args) -> Result<Self, ParseUnreadUpdateError> {
        Ok(Self {
            chats_collection: args.chats_collection.clone(),
            messages_collection: args.messages_collection.clone(),
            users_collection: args.users_collection.clone(),
            unread_update: args.unread_update.parse()?,
        })
    }

    /// `chats/{id}`
    pub fn summary_path(&self, id: &ConversationId) -> String {
        document_path(&self.chats_collection, id.as_str())
    }

    /// `chats/{id}/messages`
    pub fn messages_path(&self, id: &ConversationId) -> String {
        format!("{}/{}", self.summary_path(id), self.messages_collection)
    }

    /// `users/{id}`
    pub fn user_path(&self, user_id: &str) -> String {
        document_path(&self.users_collection, user_id)
    }
}
