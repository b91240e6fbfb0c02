#![allow(dead_code)]

use async_trait::async_trait;
use chat_sync::config::{ ChatConfig, UnreadUpdate };
use chat_sync::store::{ Document, DocumentStore, Fields, Query, Subscription };
use chat_sync::sync::ChatClient;
use chat_sync::{ MemoryDocumentStore, StoreError };
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::sync::Arc;

/// Wraps the memory store, counts writes and can be told to fail them, either
/// all of them or only those into a `messages` collection.
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryDocumentStore,
    fail_writes: Arc<AtomicBool>,
    fail_messages: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, path: &str) -> Result<(), StoreError> {
        let message_write = path.contains("/messages");
        if self.fail_writes.load(Ordering::SeqCst) || (message_write && self.fail_messages.load(Ordering::SeqCst)) {
            return Err(StoreError::Backend("store unavailable".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get_document(&self, path: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get_document(path).await
    }

    async fn set_document(
        &self,
        path: &str,
        fields: &Fields,
        merge: bool
    ) -> Result<(), StoreError> {
        self.check(path)?;
        self.inner.set_document(path, fields, merge).await
    }

    async fn append_document(
        &self,
        collection_path: &str,
        fields: &Fields
    ) -> Result<String, StoreError> {
        self.check(collection_path)?;
        self.inner.append_document(collection_path, fields).await
    }

    async fn subscribe_ordered_query(&self, query: Query) -> Result<Subscription, StoreError> {
        self.inner.subscribe_ordered_query(query).await
    }
}

pub fn client_over(store: impl DocumentStore + 'static) -> ChatClient {
    ChatClient::new(Arc::new(store), ChatConfig::default())
}

pub fn client_with_mode(store: impl DocumentStore + 'static, mode: UnreadUpdate) -> ChatClient {
    let config = ChatConfig { unread_update: mode, ..ChatConfig::default() };
    ChatClient::new(Arc::new(store), config)
}
