//! In-memory record source.
//!
//! Stores records in insertion order and fans out change events to every
//! open subscription, like a single-collection backend would. Filters are
//! not evaluated: every query sees the whole collection. Fetches can be
//! paused or made to fail, which makes fetch/event interleavings
//! reproducible in tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use threadline_pb::{
    CollectionRecord, ConnectionStatus, ListOptions, ListResult, PbError, RecordEvent,
    RecordOptions, SubscribeOptions, Subscription, SubscriptionGuard,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::RecordSource;

struct MemoryInner<T> {
    records: Mutex<Vec<T>>,
    subscribers: DashMap<u64, mpsc::UnboundedSender<RecordEvent<T>>>,
    next_subscriber: AtomicU64,
    next_record: AtomicU64,
    connection: watch::Sender<ConnectionStatus>,
    fetch_gate: watch::Sender<bool>,
    failing_fetches: AtomicUsize,
    fetches: AtomicUsize,
    subscribes: AtomicUsize,
}

/// A [`RecordSource`] backed by a `Vec`.
pub struct MemorySource<T> {
    inner: Arc<MemoryInner<T>>,
}

impl<T> Clone for MemorySource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: CollectionRecord> Default for MemorySource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CollectionRecord> MemorySource<T> {
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    pub fn with_records(records: Vec<T>) -> Self {
        let (connection, _) = watch::channel(ConnectionStatus::Connected);
        let (fetch_gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(MemoryInner {
                records: Mutex::new(records),
                subscribers: DashMap::new(),
                next_subscriber: AtomicU64::new(0),
                next_record: AtomicU64::new(1),
                connection,
                fetch_gate,
                failing_fetches: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
                subscribes: AtomicUsize::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current stored records.
    pub fn records(&self) -> Vec<T> {
        self.lock().clone()
    }

    /// Store a record and announce it to subscribers.
    pub fn insert(&self, record: T) {
        self.lock().push(record.clone());
        self.emit(RecordEvent::create(record));
    }

    /// Replace a stored record and announce the update. Returns false if no
    /// record has that id.
    pub fn replace(&self, record: T) -> bool {
        let replaced = {
            let mut records = self.lock();
            match records.iter_mut().find(|r| r.id() == record.id()) {
                Some(slot) => {
                    *slot = record.clone();
                    true
                }
                None => false,
            }
        };
        if replaced {
            self.emit(RecordEvent::update(record));
        }
        replaced
    }

    /// Remove a stored record and announce the deletion.
    pub fn remove(&self, id: &str) -> Option<T> {
        let removed = {
            let mut records = self.lock();
            let pos = records.iter().position(|r| r.id() == id)?;
            records.remove(pos)
        };
        self.emit(RecordEvent::delete(removed.clone()));
        Some(removed)
    }

    /// Deliver an event to every open subscription without touching storage.
    pub fn emit(&self, event: RecordEvent<T>) {
        trace!(action = ?event.action, id = event.record.id(), "emitting memory event");
        self.inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Publish a connection status to every subscription.
    pub fn set_connection(&self, status: ConnectionStatus) {
        self.inner.connection.send_replace(status);
    }

    /// Hold every fetch until [`resume_fetches`](Self::resume_fetches).
    pub fn pause_fetches(&self) {
        self.inner.fetch_gate.send_replace(false);
    }

    pub fn resume_fetches(&self) {
        self.inner.fetch_gate.send_replace(true);
    }

    /// Make the next `count` list fetches fail with a 503.
    pub fn fail_next_fetches(&self, count: usize) {
        self.inner.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Number of list fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Number of subscriptions opened so far.
    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }

    /// Number of subscriptions still open.
    pub fn active_subscriptions(&self) -> usize {
        self.inner
            .subscribers
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    fn not_found(&self, id: &str) -> PbError {
        PbError::NotFound {
            collection: T::COLLECTION.to_string(),
            id: id.to_string(),
        }
    }

    fn first_record(&self) -> Option<T> {
        self.lock().first().cloned()
    }
}

#[async_trait]
impl<T: CollectionRecord> RecordSource<T> for MemorySource<T> {
    async fn get_list(
        &self,
        page: u32,
        per_page: u32,
        _options: &ListOptions,
    ) -> Result<ListResult<T>, PbError> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.inner.fetch_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let failing = self
            .inner
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            debug!(collection = T::COLLECTION, "simulated fetch failure");
            return Err(PbError::Api {
                status: 503,
                message: "simulated outage".to_string(),
                data: serde_json::Value::Null,
            });
        }

        let records = self.lock();
        let per_page = per_page.max(1) as usize;
        let start = (page.max(1) as usize - 1) * per_page;
        let items: Vec<T> = records.iter().skip(start).take(per_page).cloned().collect();
        let total = records.len();

        Ok(ListResult {
            page,
            per_page: per_page as u32,
            total_items: total as i64,
            total_pages: total.div_ceil(per_page) as i64,
            items,
        })
    }

    async fn get_one(&self, id: &str, _options: &RecordOptions) -> Result<T, PbError> {
        self.lock()
            .iter()
            .find(|r| r.id() == id)
            .cloned()
            .ok_or_else(|| self.not_found(id))
    }

    async fn get_first_list_item(
        &self,
        filter: &str,
        _options: &ListOptions,
    ) -> Result<T, PbError> {
        self.first_record().ok_or_else(|| self.not_found(filter))
    }

    async fn create(&self, values: serde_json::Value) -> Result<T, PbError> {
        let mut object = match values {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(PbError::InvalidResponse(format!(
                    "record values must be an object, got {}",
                    other
                )));
            }
        };
        if !object.contains_key("id") {
            let n = self.inner.next_record.fetch_add(1, Ordering::SeqCst);
            object.insert("id".to_string(), format!("mem{:012}", n).into());
        }
        object.insert("collectionName".to_string(), T::COLLECTION.into());

        let record: T = serde_json::from_value(serde_json::Value::Object(object))?;
        self.insert(record.clone());
        Ok(record)
    }

    async fn update(&self, id: &str, values: serde_json::Value) -> Result<T, PbError> {
        let existing = self
            .lock()
            .iter()
            .find(|r| r.id() == id)
            .cloned()
            .ok_or_else(|| self.not_found(id))?;

        let mut merged = serde_json::to_value(&existing)?;
        if let (Some(target), serde_json::Value::Object(patch)) = (merged.as_object_mut(), values) {
            for (field, value) in patch {
                if field != "id" {
                    target.insert(field, value);
                }
            }
        }

        let record: T = serde_json::from_value(merged)?;
        if !self.replace(record.clone()) {
            return Err(self.not_found(id));
        }
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<(), PbError> {
        self.remove(id).map(|_| ()).ok_or_else(|| self.not_found(id))
    }

    async fn subscribe(&self, options: &SubscribeOptions) -> Result<Subscription<T>, PbError> {
        self.inner.subscribes.fetch_add(1, Ordering::SeqCst);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(id, tx);
        debug!(collection = T::COLLECTION, subscriber = id, filter = ?options.filter, "memory subscription opened");

        let weak = Arc::downgrade(&self.inner);
        let guard = SubscriptionGuard::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.remove(&id);
            }
        });

        Ok(Subscription::from_parts(
            rx,
            self.inner.connection.subscribe(),
            guard,
        ))
    }
}
