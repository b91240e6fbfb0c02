use log::{ debug, info, warn };
use std::sync::Arc;
use tokio::sync::{ watch, RwLock };
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{ decode, ChatClient, OutgoingMessage };
use crate::error::{ ChatError, StoreError };
use crate::models::chat::{ ConversationId, DeliveryStatus, LocalMessage, Message, Timestamp };
use crate::store::{ Direction, Query, Subscription };

/// Committed messages from the latest snapshot followed by local entries the
/// store has not confirmed yet.
#[derive(Default)]
struct Projection {
    committed: Vec<LocalMessage>,
    local: Vec<LocalMessage>,
    version: u64,
    /// Set once the message stream has ended.
    closed: bool,
}

impl Projection {
    fn replace_committed(&mut self, messages: Vec<Message>) {
        self.local.retain(|entry| {
            !messages.iter().any(|m| m.client_id.is_some() && m.client_id == entry.client_id)
        });
        self.committed = messages.into_iter().map(LocalMessage::committed).collect();
        self.version += 1;
    }

    fn push_local(&mut self, entry: LocalMessage) {
        self.local.push(entry);
        self.version += 1;
    }

    fn local_mut(&mut self, client_id: Uuid) -> Option<&mut LocalMessage> {
        self.local.iter_mut().find(|m| m.client_id == Some(client_id))
    }

    fn set_status(&mut self, client_id: Uuid, status: DeliveryStatus) -> bool {
        match self.local_mut(client_id) {
            Some(entry) => {
                entry.status = status;
                self.version += 1;
                true
            }
            None => false,
        }
    }

    fn remove_local(&mut self, client_id: Uuid) -> Option<LocalMessage> {
        let index = self.local.iter().position(|m| m.client_id == Some(client_id))?;
        self.version += 1;
        Some(self.local.remove(index))
    }

    fn close(&mut self) {
        self.closed = true;
        self.version += 1;
    }

    fn messages(&self) -> Vec<LocalMessage> {
        self.committed.iter().chain(self.local.iter()).cloned().collect()
    }
}

struct Shared {
    projection: RwLock<Projection>,
    notify: watch::Sender<u64>,
}

impl Shared {
    async fn update<R>(&self, change: impl FnOnce(&mut Projection) -> R) -> R {
        let mut projection = self.projection.write().await;
        let result = change(&mut projection);
        let _ = self.notify.send(projection.version);
        result
    }
}

/// An open conversation as seen by one participant.
///
/// Holds the live message subscription for as long as it exists; dropping the
/// view (or calling [`ConversationView::close`]) cancels it.
pub struct ConversationView {
    client: ChatClient,
    id: ConversationId,
    viewer: String,
    other: String,
    shared: Arc<Shared>,
    changes: watch::Receiver<u64>,
    listener: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// Clears `viewer`'s unread count (when the conversation exists) and starts
    /// listening to its messages.
    pub async fn open_conversation(
        &self,
        viewer: &str,
        other: &str
    ) -> Result<ConversationView, ChatError> {
        let id = ConversationId::for_pair(viewer, other);
        self.reset_unread(&id, viewer).await?;

        let query = Query::collection(self.config().messages_path(&id)).order_by(
            "timestamp",
            Direction::Ascending
        );
        let subscription = self.store().subscribe_ordered_query(query).await?;

        let (notify, changes) = watch::channel(0);
        let shared = Arc::new(Shared {
            projection: RwLock::new(Projection::default()),
            notify,
        });
        let listener = tokio::spawn(listen(id.clone(), subscription, Arc::clone(&shared)));
        info!("{} opened conversation {}", viewer, id);

        Ok(ConversationView {
            client: self.clone(),
            id,
            viewer: viewer.to_string(),
            other: other.to_string(),
            shared,
            changes,
            listener: Some(listener),
        })
    }
}

/// Replaces the committed part of the projection with every snapshot.
async fn listen(id: ConversationId, mut subscription: Subscription, shared: Arc<Shared>) {
    while let Some(snapshot) = subscription.next().await {
        let mut messages = Vec::with_capacity(snapshot.len());
        for doc in snapshot {
            match decode::<Message>(&doc.id, doc.data) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping message in {}: {}", id, e),
            }
        }
        shared.update(|p| p.replace_committed(messages)).await;
    }
    shared.update(Projection::close).await;
    warn!("Message stream for {} ended", id);
}

impl ConversationView {
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    pub fn other(&self) -> &str {
        &self.other
    }

    pub async fn messages(&self) -> Vec<LocalMessage> {
        self.shared.projection.read().await.messages()
    }

    /// `true` once the store stopped delivering messages for this view.
    pub async fn is_closed(&self) -> bool {
        self.shared.projection.read().await.closed
    }

    /// Waits until the projection changes. Fails once the message stream has
    /// ended, as nothing will change after that.
    pub async fn changed(&mut self) -> Result<(), ChatError> {
        if self.is_closed().await {
            return Err(subscription_closed());
        }
        self.changes.changed().await.map_err(|_| subscription_closed())?;
        if self.is_closed().await {
            return Err(subscription_closed());
        }
        Ok(())
    }

    /// Waits until `predicate` holds for the projection and returns it.
    pub async fn wait_until<F>(&mut self, mut predicate: F) -> Result<Vec<LocalMessage>, ChatError>
        where F: FnMut(&[LocalMessage]) -> bool
    {
        loop {
            self.changes.borrow_and_update();
            let current = self.messages().await;
            if predicate(&current) {
                return Ok(current);
            }
            self.changed().await?;
        }
    }

    /// Clears the viewer's unread count again, e.g. after new messages arrived
    /// while the view was open.
    pub async fn mark_read(&self) -> Result<bool, ChatError> {
        self.client.reset_unread(&self.id, &self.viewer).await
    }

    /// Shows the message immediately as pending, then writes the summary and
    /// the message. On failure the entry stays in the projection as failed.
    pub async fn send(&self, text: &str) -> Result<Uuid, ChatError> {
        let outgoing = OutgoingMessage::new(&self.viewer, &self.other, text)?;
        let entry = LocalMessage {
            client_id: Some(outgoing.client_id),
            sender_id: outgoing.sender_id.clone(),
            recipient_id: outgoing.recipient_id.clone(),
            text: outgoing.text.clone(),
            timestamp: outgoing.created_at,
            status: DeliveryStatus::Pending,
        };
        self.shared.update(|p| p.push_local(entry)).await;
        self.deliver(&outgoing, false).await
    }

    /// Sends a failed message again under the same client id, starting from
    /// the write that failed.
    pub async fn retry(&self, client_id: Uuid) -> Result<Uuid, ChatError> {
        let (outgoing, summary_written) = self.shared
            .update(|p: &mut Projection| -> Result<(OutgoingMessage, bool), ChatError> {
                let entry = p.local_mut(client_id).ok_or(ChatError::UnknownMessage(client_id))?;
                let summary_written = match &entry.status {
                    DeliveryStatus::Failed { summary_written, .. } => *summary_written,
                    _ => {
                        return Err(ChatError::NotFailed(client_id));
                    }
                };
                entry.status = DeliveryStatus::Pending;
                entry.timestamp = Timestamp::now();
                let outgoing = OutgoingMessage {
                    client_id,
                    sender_id: entry.sender_id.clone(),
                    recipient_id: entry.recipient_id.clone(),
                    text: entry.text.clone(),
                    created_at: entry.timestamp,
                };
                p.version += 1;
                Ok((outgoing, summary_written))
            }).await?;
        info!("Retrying message {} in {}", client_id, self.id);
        self.deliver(&outgoing, summary_written).await
    }

    /// Drops an unconfirmed message from the projection.
    pub async fn discard(&self, client_id: Uuid) -> Result<LocalMessage, ChatError> {
        self.shared
            .update(|p| p.remove_local(client_id))
            .await
            .ok_or(ChatError::UnknownMessage(client_id))
    }

    async fn deliver(
        &self,
        outgoing: &OutgoingMessage,
        summary_written: bool
    ) -> Result<Uuid, ChatError> {
        if !summary_written {
            if let Err(e) = self.client.write_summary(outgoing).await {
                return Err(self.mark_failed(outgoing, e, false).await);
            }
        }
        if let Err(e) = self.client.write_message(outgoing).await {
            return Err(self.mark_failed(outgoing, e, true).await);
        }
        Ok(outgoing.client_id)
    }

    async fn mark_failed(
        &self,
        outgoing: &OutgoingMessage,
        error: ChatError,
        summary_written: bool
    ) -> ChatError {
        warn!("Sending {} in {} failed: {}", outgoing.client_id, self.id, error);
        let status = DeliveryStatus::Failed { reason: error.to_string(), summary_written };
        self.shared.update(|p| p.set_status(outgoing.client_id, status)).await;
        error
    }

    /// Cancels the message subscription. Dropping the view does the same.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            debug!("{} closed conversation {}", self.viewer, self.id);
        }
    }
}

fn subscription_closed() -> ChatError {
    ChatError::Store(StoreError::SubscriptionClosed)
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::store::{ Document, DocumentStore, Fields, MemoryDocumentStore, Snapshot };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Memory store whose subscriptions deliver one empty snapshot and end.
    #[derive(Default)]
    struct EndingStore {
        inner: MemoryDocumentStore,
    }

    #[async_trait]
    impl DocumentStore for EndingStore {
        async fn get_document(&self, path: &str) -> Result<Option<Document>, StoreError> {
            self.inner.get_document(path).await
        }

        async fn set_document(
            &self,
            path: &str,
            fields: &Fields,
            merge: bool
        ) -> Result<(), StoreError> {
            self.inner.set_document(path, fields, merge).await
        }

        async fn append_document(
            &self,
            collection_path: &str,
            fields: &Fields
        ) -> Result<String, StoreError> {
            self.inner.append_document(collection_path, fields).await
        }

        async fn subscribe_ordered_query(&self, query: Query) -> Result<Subscription, StoreError> {
            let (tx, rx) = mpsc::channel::<Snapshot>(1);
            let task = tokio::spawn(async move {
                let _ = tx.send(Vec::new()).await;
            });
            Ok(Subscription::new(query.collection, rx, task))
        }
    }

    fn message(text: &str, ts: i64, client_id: Option<Uuid>) -> Message {
        Message {
            sender_id: "u1".into(),
            recipient_id: "u2".into(),
            text: text.into(),
            timestamp: Timestamp::from_millis(ts),
            is_read: false,
            client_id,
        }
    }

    fn pending(text: &str, client_id: Uuid) -> LocalMessage {
        LocalMessage {
            client_id: Some(client_id),
            sender_id: "u1".into(),
            recipient_id: "u2".into(),
            text: text.into(),
            timestamp: Timestamp::from_millis(1),
            status: DeliveryStatus::Pending,
        }
    }

    #[tokio::test]
    async fn changed_fails_once_the_message_stream_ends() {
        let chat = ChatClient::new(Arc::new(EndingStore::default()), ChatConfig::default());
        let mut view = chat.open_conversation("u1", "u2").await.unwrap();

        let error = timeout(Duration::from_secs(2), async {
            loop {
                if let Err(e) = view.changed().await {
                    return e;
                }
            }
        }).await.expect("view never noticed the closed stream");

        assert!(matches!(error, ChatError::Store(StoreError::SubscriptionClosed)));
        assert!(view.is_closed().await);
        let again = timeout(Duration::from_secs(2), view.changed()).await.unwrap();
        assert!(matches!(again, Err(ChatError::Store(StoreError::SubscriptionClosed))));
        assert!(view.messages().await.is_empty());
    }

    #[test]
    fn closing_the_projection_bumps_its_version() {
        let mut projection = Projection::default();
        projection.close();
        assert!(projection.closed);
        assert_eq!(projection.version, 1);
    }

    #[test]
    fn snapshot_retires_matching_pending_entries() {
        let confirmed = Uuid::new_v4();
        let waiting = Uuid::new_v4();
        let mut projection = Projection::default();
        projection.push_local(pending("a", confirmed));
        projection.push_local(pending("b", waiting));

        projection.replace_committed(vec![message("a", 10, Some(confirmed))]);

        let rows = projection.messages();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, DeliveryStatus::Committed);
        assert_eq!(rows[0].timestamp, Timestamp::from_millis(10));
        assert_eq!(rows[1].client_id, Some(waiting));
        assert!(rows[1].is_pending());
    }

    #[test]
    fn snapshot_replaces_previous_committed_set() {
        let mut projection = Projection::default();
        projection.replace_committed(vec![message("a", 1, None), message("b", 2, None)]);
        projection.replace_committed(vec![message("c", 3, None)]);

        let texts: Vec<_> = projection.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, ["c"]);
        assert_eq!(projection.version, 2);
    }

    #[test]
    fn status_changes_only_touch_local_entries() {
        let id = Uuid::new_v4();
        let mut projection = Projection::default();
        assert!(!projection.set_status(id, DeliveryStatus::Committed));

        projection.push_local(pending("a", id));
        assert!(projection.set_status(id, DeliveryStatus::Failed { reason: "offline".into(), summary_written: false }));
        assert!(projection.messages()[0].is_failed());
        assert!(projection.remove_local(id).is_some());
        assert!(projection.messages().is_empty());
    }
}
