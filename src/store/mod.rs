pub mod memory;
pub mod query;
pub mod redis;

use async_trait::async_trait;
use futures::Stream;
use log::{ debug, info };
use serde_json::{ Map, Value };
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{ Context, Poll };
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::cli::Args;
use crate::error::StoreError;

pub use self::memory::MemoryDocumentStore;
pub use self::query::{ Direction, Filter, OrderBy, Query };
pub use self::redis::RedisDocumentStore;

/// Snapshots buffered per subscription before the producer waits.
pub(crate) const SNAPSHOT_BUFFER: usize = 16;

pub type Document = Map<String, Value>;

/// Write payload: top-level field name to the value written there.
pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Set(Value),
    /// Resolved to the store's commit time.
    ServerTimestamp,
    /// Adds to the current number; a missing or non-numeric field counts as 0.
    Increment(i64),
    /// Merged into the nested map field-by-field.
    Map(Fields),
}

impl FieldValue {
    pub fn set(value: impl Into<Value>) -> Self {
        FieldValue::Set(value.into())
    }
}

/// Applies `fields` onto `target`. Map values are merged recursively; every
/// other value replaces what was there.
pub fn apply_fields(target: &mut Document, fields: &Fields, server_time: i64) {
    for (name, field) in fields {
        match field {
            FieldValue::Set(value) => {
                target.insert(name.clone(), value.clone());
            }
            FieldValue::ServerTimestamp => {
                target.insert(name.clone(), Value::from(server_time));
            }
            FieldValue::Increment(by) => {
                let current = target.get(name).and_then(Value::as_i64).unwrap_or(0);
                target.insert(name.clone(), Value::from(current + by));
            }
            FieldValue::Map(nested) => {
                let entry = target
                    .entry(name.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Value::Object(child) = entry {
                    apply_fields(child, nested, server_time);
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    pub id: String,
    pub data: Document,
}

/// Full, ordered result set of a query at one point in time.
pub type Snapshot = Vec<DocumentSnapshot>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// `merge = true` leaves unspecified fields untouched; `merge = false`
    /// replaces the whole document.
    async fn set_document(
        &self,
        path: &str,
        fields: &Fields,
        merge: bool
    ) -> Result<(), StoreError>;

    /// Writes `fields` under a freshly generated key and returns that key.
    async fn append_document(
        &self,
        collection_path: &str,
        fields: &Fields
    ) -> Result<String, StoreError>;

    /// Delivers the full result set now and again after every change to the
    /// queried collection, until the returned handle is cancelled or dropped.
    async fn subscribe_ordered_query(&self, query: Query) -> Result<Subscription, StoreError>;
}

/// Live query handle. Dropping it cancels the underlying listener.
pub struct Subscription {
    stream: ReceiverStream<Snapshot>,
    task: Option<JoinHandle<()>>,
    label: String,
}

impl Subscription {
    pub(crate) fn new(label: String, receiver: mpsc::Receiver<Snapshot>, task: JoinHandle<()>) -> Self {
        debug!("Subscribed to {}", label);
        Self {
            stream: ReceiverStream::new(receiver),
            task: Some(task),
            label,
        }
    }

    pub async fn next(&mut self) -> Option<Snapshot> {
        self.stream.next().await
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Cancelled subscription to {}", self.label);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl Stream for Subscription {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("label", &self.label).finish()
    }
}

pub fn document_path(collection_path: &str, id: &str) -> String {
    format!("{}/{}", collection_path, id)
}

fn segments(path: &str) -> Result<Vec<&str>, StoreError> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

/// Collection paths have an odd number of segments (`chats`, `chats/x/messages`).
pub fn validate_collection_path(path: &str) -> Result<(), StoreError> {
    if segments(path)?.len() % 2 == 1 {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

/// Splits a document path into its collection path and key.
pub fn split_document_path(path: &str) -> Result<(&str, &str), StoreError> {
    if segments(path)?.len() % 2 != 0 {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    path.rsplit_once('/').ok_or_else(|| StoreError::InvalidPath(path.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreType {
    Memory,
    Redis,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStoreTypeError {
    message: String,
}

impl fmt::Display for ParseStoreTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseStoreTypeError {}

impl FromStr for StoreType {
    type Err = ParseStoreTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreType::Memory),
            "redis" => Ok(StoreType::Redis),
            _ =>
                Err(ParseStoreTypeError {
                    message: format!("Invalid store type: '{}'", s),
                }),
        }
    }
}

pub fn create_document_store(
    args: &Args
) -> Result<Arc<dyn DocumentStore>, Box<dyn Error + Send + Sync>> {
    match args.store_type.parse::<StoreType>()? {
        StoreType::Memory => {
            info!("Documents will be kept in process memory");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
        StoreType::Redis => {
            info!("Documents will be stored in redis at {}", args.store_host);
            let store = RedisDocumentStore::new(&args.store_host, &args.redis_prefix)?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn merge_leaves_other_fields_alone() {
        let mut target = doc(json!({ "a": 1, "nested": { "x": 1, "y": 2 } }));
        let mut nested = Fields::new();
        nested.insert("x".into(), FieldValue::set(10));
        let mut fields = Fields::new();
        fields.insert("nested".into(), FieldValue::Map(nested));

        apply_fields(&mut target, &fields, 0);

        assert_eq!(Value::Object(target), json!({ "a": 1, "nested": { "x": 10, "y": 2 } }));
    }

    #[test]
    fn increment_treats_missing_as_zero() {
        let mut target = doc(json!({ "n": 4 }));
        let mut fields = Fields::new();
        fields.insert("n".into(), FieldValue::Increment(1));
        fields.insert("m".into(), FieldValue::Increment(0));
        fields.insert("at".into(), FieldValue::ServerTimestamp);

        apply_fields(&mut target, &fields, 99);

        assert_eq!(Value::Object(target), json!({ "n": 5, "m": 0, "at": 99 }));
    }

    #[test]
    fn paths_are_validated() {
        assert!(validate_collection_path("chats").is_ok());
        assert!(validate_collection_path("chats/u1_u2/messages").is_ok());
        assert!(validate_collection_path("chats/u1_u2").is_err());
        assert!(validate_collection_path("chats//messages").is_err());

        assert_eq!(split_document_path("chats/u1_u2").unwrap(), ("chats", "u1_u2"));
        assert_eq!(
            split_document_path("chats/u1_u2/messages/m1").unwrap(),
            ("chats/u1_u2/messages", "m1")
        );
        assert!(split_document_path("chats").is_err());
    }

    #[test]
    fn store_type_parses_case_insensitively() {
        assert_eq!("Redis".parse::<StoreType>().unwrap(), StoreType::Redis);
        assert_eq!("memory".parse::<StoreType>().unwrap(), StoreType::Memory);
        assert!("qdrant".parse::<StoreType>().is_err());
    }
}
