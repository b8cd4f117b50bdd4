//! In-memory implementation of the feed and document contracts.
//!
//! Behaves like the hosted document store the client talks to in
//! production: ids and timestamps are assigned by the backend, query
//! listeners receive their window newest-first, and every write fans out to
//! the listeners it affects as one ordered callback.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_shared::protocol::{decode_timestamp, encode_timestamp, DocChange, Document, Fields};

use crate::backend::{DocumentStore, FeedQuery, Listener, ListenerGuard, LiveQueryFeed, SetOptions};
use crate::error::{Result, StoreError};

struct StoredDoc {
    fields: Fields,
    /// Insertion order, used to break timestamp ties.
    seq: u64,
}

struct QueryListener {
    query: FeedQuery,
    tx: mpsc::UnboundedSender<Vec<DocChange>>,
    /// Ids currently inside this listener's window.
    window: Vec<String>,
}

struct DocListener {
    collection: String,
    id: String,
    tx: mpsc::UnboundedSender<Vec<DocChange>>,
    delivered: bool,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, BTreeMap<String, StoredDoc>>,
    queries: HashMap<u64, QueryListener>,
    documents: HashMap<u64, DocListener>,
    next_listener: u64,
    next_seq: u64,
    /// Listen calls per target (`collection` or `collection/id`).
    listen_counts: HashMap<String, usize>,
    fail_writes: Option<String>,
    fail_listens: HashSet<String>,
}

/// In-memory document store with live listeners.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    echo_pending_writes: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver appended documents twice, first with a null stamp field and
    /// then with the acknowledged timestamp, the way latency-compensated
    /// clients observe their own writes.
    pub fn with_pending_echo() -> Self {
        Self {
            echo_pending_writes: true,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- Fault injection / inspection ---------------------------------------

    /// Make every subsequent write fail with `reason` (`None` restores writes).
    pub fn fail_writes(&self, reason: Option<&str>) {
        self.state().fail_writes = reason.map(str::to_string);
    }

    /// Make listen calls on `target` (`collection` or `collection/id`) fail.
    pub fn fail_listens_on(&self, target: &str) {
        self.state().fail_listens.insert(target.to_string());
    }

    pub fn clear_listen_failures(&self) {
        self.state().fail_listens.clear();
    }

    /// How many times `target` has been listened to.
    pub fn listen_count(&self, target: &str) -> usize {
        self.state().listen_counts.get(target).copied().unwrap_or(0)
    }

    /// Number of listeners still attached.
    pub fn active_listeners(&self) -> usize {
        let state = self.state();
        state.queries.len() + state.documents.len()
    }

    /// Insert a raw document, bypassing id assignment and validation.
    pub fn put_document(&self, collection: &str, id: &str, fields: Fields) {
        let mut state = self.state();
        let seq = state.bump_seq();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), StoredDoc { fields, seq });
        state.notify(collection, id);
    }

    /// Delete a document and notify listeners.
    pub fn delete(&self, collection: &str, id: &str) -> bool {
        let mut state = self.state();
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        if removed {
            state.notify(collection, id);
        }
        removed
    }

    /// Snapshot of every document in `collection`, newest first by `order_by`.
    pub fn documents(&self, collection: &str, order_by: &str) -> Vec<Document> {
        self.state().window(collection, order_by, usize::MAX)
    }

    fn check_writable(&self) -> Result<()> {
        match &self.state().fail_writes {
            Some(reason) => Err(StoreError::WriteRejected(reason.clone())),
            None => Ok(()),
        }
    }

    fn register(&self, target: String) -> Result<(u64, mpsc::UnboundedSender<Vec<DocChange>>, mpsc::UnboundedReceiver<Vec<DocChange>>)> {
        let mut state = self.state();
        *state.listen_counts.entry(target.clone()).or_default() += 1;
        if state.fail_listens.contains(&target) {
            return Err(StoreError::Unavailable(format!("listen on {target} refused")));
        }
        let id = state.next_listener;
        state.next_listener += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((id, tx, rx))
    }

    fn guard_for(&self, listener_id: u64) -> ListenerGuard {
        let weak: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        ListenerGuard::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                let removed = state.queries.remove(&listener_id).is_some()
                    || state.documents.remove(&listener_id).is_some();
                if removed {
                    debug!(listener = listener_id, "Listener detached");
                }
            }
        })
    }
}

impl State {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Newest-first window of `collection`. Unstamped documents count as newest.
    fn window(&self, collection: &str, order_by: &str, limit: usize) -> Vec<Document> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };

        let mut ordered: Vec<(Option<DateTime<Utc>>, u64, &String, &StoredDoc)> = docs
            .iter()
            .map(|(id, doc)| {
                let ts = decode_timestamp("orderBy", doc.fields.get(order_by)).unwrap_or(None);
                (ts, doc.seq, id, doc)
            })
            .collect();

        ordered.sort_by(|a, b| match (a.0, b.0) {
            (None, None) => b.1.cmp(&a.1),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => y.cmp(&x).then(b.1.cmp(&a.1)),
        });

        ordered
            .into_iter()
            .take(limit)
            .map(|(_, _, id, doc)| Document::new(id.clone(), doc.fields.clone()))
            .collect()
    }

    fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| Document::new(id, doc.fields.clone()))
    }

    /// Fan a write to `collection/id` out to every affected listener.
    fn notify(&mut self, collection: &str, changed_id: &str) {
        let mut query_updates = Vec::new();
        for (listener_id, listener) in &self.queries {
            if listener.query.collection != collection {
                continue;
            }
            let window = self.window(collection, &listener.query.order_by, listener.query.limit);
            let mut changes = Vec::new();
            for doc in &window {
                if !listener.window.contains(&doc.id) {
                    changes.push(DocChange::Added(doc.clone()));
                } else if doc.id == changed_id {
                    changes.push(DocChange::Modified(doc.clone()));
                }
            }
            for id in &listener.window {
                if !window.iter().any(|doc| &doc.id == id) {
                    changes.push(DocChange::Removed { id: id.clone() });
                }
            }
            if !changes.is_empty() {
                query_updates.push((*listener_id, changes, window));
            }
        }

        for (listener_id, changes, window) in query_updates {
            if let Some(listener) = self.queries.get_mut(&listener_id) {
                listener.window = window.into_iter().map(|doc| doc.id).collect();
                let _ = listener.tx.send(changes);
            }
        }

        let current = self.document(collection, changed_id);
        for listener in self.documents.values_mut() {
            if listener.collection != collection || listener.id != changed_id {
                continue;
            }
            let change = match (&current, listener.delivered) {
                (Some(doc), false) => DocChange::Added(doc.clone()),
                (Some(doc), true) => DocChange::Modified(doc.clone()),
                (None, _) => DocChange::Removed {
                    id: changed_id.to_string(),
                },
            };
            listener.delivered = current.is_some();
            let _ = listener.tx.send(vec![change]);
        }
    }

    fn write(&mut self, collection: &str, id: &str, fields: Fields, merge: bool) {
        let seq = self.bump_seq();
        let docs = self.collections.entry(collection.to_string()).or_default();
        match docs.get_mut(id) {
            Some(existing) if merge => existing.fields.extend(fields),
            Some(existing) => existing.fields = fields,
            None => {
                docs.insert(id.to_string(), StoredDoc { fields, seq });
            }
        }
        self.notify(collection, id);
    }
}

#[async_trait]
impl LiveQueryFeed for MemoryBackend {
    async fn listen_query(&self, query: &FeedQuery) -> Result<Listener> {
        let (listener_id, tx, rx) = self.register(query.collection.clone())?;

        let mut state = self.state();
        let window = state.window(&query.collection, &query.order_by, query.limit);
        let initial: Vec<DocChange> = window.iter().cloned().map(DocChange::Added).collect();
        let _ = tx.send(initial);
        state.queries.insert(
            listener_id,
            QueryListener {
                query: query.clone(),
                tx,
                window: window.into_iter().map(|doc| doc.id).collect(),
            },
        );
        drop(state);

        info!(collection = %query.collection, limit = query.limit, "Query listener attached");
        Ok(Listener::new(rx, self.guard_for(listener_id)))
    }

    async fn add(
        &self,
        collection: &str,
        mut fields: Fields,
        stamp_field: Option<&str>,
    ) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::new_v4().simple().to_string();
        let mut state = self.state();

        match stamp_field {
            Some(field) if self.echo_pending_writes => {
                fields.insert(field.to_string(), Value::Null);
                state.write(collection, &id, fields, false);
                let mut ack = Fields::new();
                ack.insert(field.to_string(), encode_timestamp(Utc::now()));
                state.write(collection, &id, ack, true);
            }
            Some(field) => {
                fields.insert(field.to_string(), encode_timestamp(Utc::now()));
                state.write(collection, &id, fields, false);
            }
            None => state.write(collection, &id, fields, false),
        }

        debug!(collection, id = %id, "Document added");
        Ok(id)
    }
}

#[async_trait]
impl DocumentStore for MemoryBackend {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self.state().document(collection, id))
    }

    async fn listen_document(&self, collection: &str, id: &str) -> Result<Listener> {
        let (listener_id, tx, rx) = self.register(format!("{collection}/{id}"))?;

        let mut state = self.state();
        let current = state.document(collection, id);
        let delivered = current.is_some();
        let _ = tx.send(current.into_iter().map(DocChange::Added).collect());
        state.documents.insert(
            listener_id,
            DocListener {
                collection: collection.to_string(),
                id: id.to_string(),
                tx,
                delivered,
            },
        );
        drop(state);

        debug!(collection, id, "Document listener attached");
        Ok(Listener::new(rx, self.guard_for(listener_id)))
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        mut fields: Fields,
        options: SetOptions,
    ) -> Result<()> {
        self.check_writable()?;
        if let Some(field) = &options.stamp_field {
            fields.insert(field.clone(), encode_timestamp(Utc::now()));
        }
        self.state().write(collection, id, fields, options.merge);
        debug!(collection, id, merge = options.merge, "Document set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER: &str = "createdAt";

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn ids(changes: &[DocChange]) -> Vec<String> {
        changes.iter().map(|c| c.id().to_string()).collect()
    }

    #[tokio::test]
    async fn test_initial_window_is_newest_first() {
        let backend = MemoryBackend::new();
        let mut added = Vec::new();
        for i in 0..3 {
            added.push(
                backend
                    .add("messages", fields(json!({"n": i})), Some(ORDER))
                    .await
                    .unwrap(),
            );
        }

        let query = FeedQuery::newest("messages", ORDER, 2);
        let mut listener = backend.listen_query(&query).await.unwrap();
        let initial = listener.changes.recv().await.unwrap();
        assert_eq!(ids(&initial), vec![added[2].clone(), added[1].clone()]);
        assert!(initial.iter().all(|c| matches!(c, DocChange::Added(_))));
    }

    #[tokio::test]
    async fn test_window_eviction_reports_removal() {
        let backend = MemoryBackend::new();
        let first = backend
            .add("messages", fields(json!({})), Some(ORDER))
            .await
            .unwrap();
        let query = FeedQuery::newest("messages", ORDER, 1);
        let mut listener = backend.listen_query(&query).await.unwrap();
        listener.changes.recv().await.unwrap();

        let second = backend
            .add("messages", fields(json!({})), Some(ORDER))
            .await
            .unwrap();
        let update = listener.changes.recv().await.unwrap();
        assert_eq!(
            update,
            vec![
                DocChange::Added(backend.state().document("messages", &second).unwrap()),
                DocChange::Removed { id: first },
            ]
        );
    }

    #[tokio::test]
    async fn test_pending_echo_delivers_null_then_stamp() {
        let backend = MemoryBackend::with_pending_echo();
        let query = FeedQuery::newest("messages", ORDER, 10);
        let mut listener = backend.listen_query(&query).await.unwrap();
        assert!(listener.changes.recv().await.unwrap().is_empty());

        backend
            .add("messages", fields(json!({"uid": "u1"})), Some(ORDER))
            .await
            .unwrap();

        match &listener.changes.recv().await.unwrap()[..] {
            [DocChange::Added(doc)] => assert_eq!(doc.fields[ORDER], Value::Null),
            other => panic!("unexpected {other:?}"),
        }
        match &listener.changes.recv().await.unwrap()[..] {
            [DocChange::Modified(doc)] => assert!(doc.fields[ORDER].is_object()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_document_listener_and_merge() {
        let backend = MemoryBackend::new();
        let mut listener = backend.listen_document("users", "u1").await.unwrap();
        assert!(listener.changes.recv().await.unwrap().is_empty());

        backend
            .set("users", "u1", fields(json!({"displayName": "Ada"})), SetOptions::default())
            .await
            .unwrap();
        backend
            .set("users", "u1", fields(json!({"online": true})), SetOptions::merge())
            .await
            .unwrap();

        let first = listener.changes.recv().await.unwrap();
        assert!(matches!(&first[..], [DocChange::Added(_)]));
        let second = listener.changes.recv().await.unwrap();
        match &second[..] {
            [DocChange::Modified(doc)] => {
                assert_eq!(doc.fields["displayName"], json!("Ada"));
                assert_eq!(doc.fields["online"], json!(true));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropping_listener_detaches() {
        let backend = MemoryBackend::new();
        let query = FeedQuery::newest("messages", ORDER, 5);
        let listener = backend.listen_query(&query).await.unwrap();
        let doc_listener = backend.listen_document("users", "u1").await.unwrap();
        assert_eq!(backend.active_listeners(), 2);
        assert_eq!(backend.listen_count("messages"), 1);
        assert_eq!(backend.listen_count("users/u1"), 1);

        drop(listener);
        drop(doc_listener);
        assert_eq!(backend.active_listeners(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let backend = MemoryBackend::new();
        backend.fail_writes(Some("offline"));
        assert!(backend.add("messages", Fields::new(), None).await.is_err());
        backend.fail_writes(None);
        assert!(backend.add("messages", Fields::new(), None).await.is_ok());

        backend.fail_listens_on("users/u9");
        assert!(backend.listen_document("users", "u9").await.is_err());
        assert_eq!(backend.listen_count("users/u9"), 1);
        assert_eq!(backend.active_listeners(), 0);
    }

    #[tokio::test]
    async fn test_delete_notifies_document_listener() {
        let backend = MemoryBackend::new();
        backend.put_document("users", "u1", fields(json!({"displayName": "Ada"})));
        let mut listener = backend.listen_document("users", "u1").await.unwrap();
        listener.changes.recv().await.unwrap();

        assert!(backend.delete("users", "u1"));
        let update = listener.changes.recv().await.unwrap();
        assert_eq!(update, vec![DocChange::Removed { id: "u1".into() }]);
    }
}
