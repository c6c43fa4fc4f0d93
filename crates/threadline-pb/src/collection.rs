//! Typed access to the Threadline collections.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use crate::realtime::{ConnectionStatus, RealtimeClient, Subscription};
use crate::{
    CollectionRecord, Comment, ListOptions, ListResult, Notebook, PbError, Playground,
    PocketBaseClient, RecordOptions, Scratchpad, SubscribeOptions, Thread, User,
};

/// A backend handle: REST client plus the shared realtime connection.
#[derive(Clone)]
pub struct PocketBase {
    client: Arc<PocketBaseClient>,
    realtime: Arc<RealtimeClient>,
}

impl PocketBase {
    pub fn new(client: PocketBaseClient) -> Self {
        let client = Arc::new(client);
        let realtime = Arc::new(RealtimeClient::new(client.clone()));
        Self { client, realtime }
    }

    /// Connect to `base_url` with default client settings.
    pub fn connect(base_url: impl Into<String>) -> Self {
        Self::new(PocketBaseClient::new(base_url))
    }

    pub fn client(&self) -> &Arc<PocketBaseClient> {
        &self.client
    }

    pub fn realtime(&self) -> &Arc<RealtimeClient> {
        &self.realtime
    }

    /// Watch the realtime connection status.
    pub fn connection_status(&self) -> tokio::sync::watch::Receiver<ConnectionStatus> {
        self.realtime.status()
    }

    /// Typed handle for any collection record type.
    pub fn collection<T: CollectionRecord>(&self) -> Collection<T> {
        Collection {
            client: self.client.clone(),
            realtime: self.realtime.clone(),
            _record: PhantomData,
        }
    }

    pub fn threads(&self) -> Collection<Thread> {
        self.collection()
    }

    pub fn comments(&self) -> Collection<Comment> {
        self.collection()
    }

    pub fn notebooks(&self) -> Collection<Notebook> {
        self.collection()
    }

    pub fn playgrounds(&self) -> Collection<Playground> {
        self.collection()
    }

    pub fn scratchpads(&self) -> Collection<Scratchpad> {
        self.collection()
    }

    pub fn users(&self) -> Collection<User> {
        self.collection()
    }
}

/// Typed CRUD and subscriptions for one collection.
pub struct Collection<T> {
    client: Arc<PocketBaseClient>,
    realtime: Arc<RealtimeClient>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            realtime: self.realtime.clone(),
            _record: PhantomData,
        }
    }
}

impl<T: CollectionRecord> Collection<T> {
    pub fn name(&self) -> &'static str {
        T::COLLECTION
    }

    pub async fn get_list(
        &self,
        page: u32,
        per_page: u32,
        options: &ListOptions,
    ) -> Result<ListResult<T>, PbError> {
        self.client.get_list(T::COLLECTION, page, per_page, options).await
    }

    pub async fn get_full_list(&self, options: &ListOptions) -> Result<Vec<T>, PbError> {
        self.client.get_full_list(T::COLLECTION, options).await
    }

    pub async fn get_one(&self, id: &str, options: &RecordOptions) -> Result<T, PbError> {
        self.client.get_one(T::COLLECTION, id, options).await
    }

    pub async fn get_first_list_item(
        &self,
        filter: &str,
        options: &ListOptions,
    ) -> Result<T, PbError> {
        self.client
            .get_first_list_item(T::COLLECTION, filter, options)
            .await
    }

    pub async fn create<V: Serialize + ?Sized>(&self, values: &V) -> Result<T, PbError> {
        self.client.create(T::COLLECTION, values).await
    }

    pub async fn update<V: Serialize + ?Sized>(&self, id: &str, values: &V) -> Result<T, PbError> {
        self.client.update(T::COLLECTION, id, values).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), PbError> {
        self.client.delete(T::COLLECTION, id).await
    }

    /// Subscribe to realtime changes matching `options`.
    pub async fn subscribe(&self, options: &SubscribeOptions) -> Result<Subscription<T>, PbError> {
        self.realtime.subscribe(T::COLLECTION, options).await
    }
}
