use async_trait::async_trait;
use chrono::Utc;
use log::{ debug, warn };
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{ broadcast, mpsc, Mutex };
use uuid::Uuid;

use super::{
    apply_fields,
    document_path,
    split_document_path,
    validate_collection_path,
    Document,
    DocumentSnapshot,
    DocumentStore,
    Fields,
    Query,
    Snapshot,
    Subscription,
    SNAPSHOT_BUFFER,
};
use crate::error::StoreError;

const CHANGE_BUFFER: usize = 256;

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<String, Document>,
    last_server_time: i64,
}

impl MemoryState {
    /// Wall-clock millis, bumped so that commits never share a timestamp.
    fn next_server_time(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_server_time = now.max(self.last_server_time + 1);
        self.last_server_time
    }

    fn write(&mut self, path: &str, fields: &Fields, merge: bool) {
        let server_time = self.next_server_time();
        let mut document = if merge {
            self.documents.get(path).cloned().unwrap_or_default()
        } else {
            Document::new()
        };
        apply_fields(&mut document, fields, server_time);
        self.documents.insert(path.to_string(), document);
    }

    fn run(&self, query: &Query) -> Snapshot {
        let members = self.documents.iter().filter_map(|(path, data)| {
            let (collection, id) = path.rsplit_once('/')?;
            (collection == query.collection).then(|| DocumentSnapshot {
                id: id.to_string(),
                data: data.clone(),
            })
        });
        query.evaluate(members)
    }
}

/// In-process document store. Every write commits immediately and wakes the
/// subscriptions on the written collection.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
    changes: broadcast::Sender<String>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            changes,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn notify(&self, collection: &str) {
        // No receivers just means nobody is subscribed.
        let _ = self.changes.send(collection.to_string());
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_document(&self, path: &str) -> Result<Option<Document>, StoreError> {
        split_document_path(path)?;
        Ok(self.state.lock().await.documents.get(path).cloned())
    }

    async fn set_document(
        &self,
        path: &str,
        fields: &Fields,
        merge: bool
    ) -> Result<(), StoreError> {
        let (collection, _) = split_document_path(path)?;
        self.state.lock().await.write(path, fields, merge);
        debug!("Wrote {} (merge: {})", path, merge);
        self.notify(collection);
        Ok(())
    }

    async fn append_document(
        &self,
        collection_path: &str,
        fields: &Fields
    ) -> Result<String, StoreError> {
        validate_collection_path(collection_path)?;
        let id = Uuid::new_v4().to_string();
        let path = document_path(collection_path, &id);
        self.state.lock().await.write(&path, fields, false);
        debug!("Appended {}", path);
        self.notify(collection_path);
        Ok(id)
    }

    async fn subscribe_ordered_query(&self, query: Query) -> Result<Subscription, StoreError> {
        validate_collection_path(&query.collection)?;

        // Register for changes before the first read so nothing slips between.
        let mut changes = self.changes.subscribe();
        let state = Arc::clone(&self.state);
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let label = query.collection.clone();

        let task = tokio::spawn(async move {
            let initial = state.lock().await.run(&query);
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(collection) if collection == query.collection => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Subscription to {} missed {} change notifications, resending",
                            query.collection,
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
                let snapshot = state.lock().await.run(&query);
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(label, rx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ Direction, FieldValue };
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn text(value: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("text".into(), FieldValue::set(value));
        fields.insert("timestamp".into(), FieldValue::ServerTimestamp);
        fields
    }

    #[tokio::test]
    async fn set_without_merge_replaces_document() {
        let store = MemoryDocumentStore::new();
        let mut first = Fields::new();
        first.insert("a".into(), FieldValue::set(1));
        first.insert("b".into(), FieldValue::set(2));
        store.set_document("docs/d", &first, false).await.unwrap();

        let mut second = Fields::new();
        second.insert("a".into(), FieldValue::set(3));
        store.set_document("docs/d", &second, false).await.unwrap();

        let doc = store.get_document("docs/d").await.unwrap().unwrap();
        assert_eq!(serde_json::Value::Object(doc), json!({ "a": 3 }));
    }

    #[tokio::test]
    async fn server_timestamps_strictly_increase() {
        let store = MemoryDocumentStore::new();
        for i in 0..20 {
            store.append_document("m", &text(&i.to_string())).await.unwrap();
        }
        let mut sub = store
            .subscribe_ordered_query(Query::collection("m").order_by("timestamp", Direction::Ascending))
            .await
            .unwrap();
        let snapshot = sub.next().await.unwrap();
        let times: Vec<i64> = snapshot
            .iter()
            .map(|d| d.data["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(times.len(), 20);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn subscription_sees_writes_to_its_collection_only() {
        let store = MemoryDocumentStore::new();
        let mut sub = store
            .subscribe_ordered_query(Query::collection("m").order_by("timestamp", Direction::Ascending))
            .await
            .unwrap();
        assert!(sub.next().await.unwrap().is_empty());

        store.append_document("other", &text("ignored")).await.unwrap();
        store.append_document("m", &text("hello")).await.unwrap();

        let snapshot = timeout(Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].data["text"], json!("hello"));
    }

    #[tokio::test]
    async fn cancelled_subscription_stops() {
        let store = MemoryDocumentStore::new();
        let mut sub = store.subscribe_ordered_query(Query::collection("m")).await.unwrap();
        sub.next().await.unwrap();
        assert!(sub.is_active());
        sub.cancel();

        // The aborted listener releases its change receiver.
        timeout(Duration::from_secs(1), async {
            while store.changes.receiver_count() > 0 {
                tokio::task::yield_now().await;
            }
        }).await.expect("listener was not released");
    }

    #[tokio::test]
    async fn rejects_malformed_paths() {
        let store = MemoryDocumentStore::new();
        assert!(matches!(store.get_document("chats").await, Err(StoreError::InvalidPath(_))));
        assert!(store.append_document("chats/x", &Fields::new()).await.is_err());
    }
}
