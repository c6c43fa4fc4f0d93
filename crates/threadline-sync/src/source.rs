//! The remote side of the sync layer.

use async_trait::async_trait;
use threadline_pb::{
    Collection, CollectionRecord, ListOptions, ListResult, PbError, RecordOptions,
    SubscribeOptions, Subscription,
};

/// Typed record operations for one collection.
///
/// Implemented by [`threadline_pb::Collection`] for a live backend and by
/// [`MemorySource`](crate::MemorySource) for tests and offline use.
#[async_trait]
pub trait RecordSource<T: CollectionRecord>: Send + Sync + 'static {
    /// Name of the collection behind this source.
    fn collection(&self) -> &str {
        T::COLLECTION
    }

    async fn get_list(
        &self,
        page: u32,
        per_page: u32,
        options: &ListOptions,
    ) -> Result<ListResult<T>, PbError>;

    async fn get_one(&self, id: &str, options: &RecordOptions) -> Result<T, PbError>;

    async fn get_first_list_item(&self, filter: &str, options: &ListOptions)
    -> Result<T, PbError>;

    async fn create(&self, values: serde_json::Value) -> Result<T, PbError>;

    async fn update(&self, id: &str, values: serde_json::Value) -> Result<T, PbError>;

    async fn delete(&self, id: &str) -> Result<(), PbError>;

    /// Open a realtime subscription for records matching `options`.
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<Subscription<T>, PbError>;
}

#[async_trait]
impl<T: CollectionRecord> RecordSource<T> for Collection<T> {
    async fn get_list(
        &self,
        page: u32,
        per_page: u32,
        options: &ListOptions,
    ) -> Result<ListResult<T>, PbError> {
        Collection::get_list(self, page, per_page, options).await
    }

    async fn get_one(&self, id: &str, options: &RecordOptions) -> Result<T, PbError> {
        Collection::get_one(self, id, options).await
    }

    async fn get_first_list_item(
        &self,
        filter: &str,
        options: &ListOptions,
    ) -> Result<T, PbError> {
        Collection::get_first_list_item(self, filter, options).await
    }

    async fn create(&self, values: serde_json::Value) -> Result<T, PbError> {
        Collection::create(self, &values).await
    }

    async fn update(&self, id: &str, values: serde_json::Value) -> Result<T, PbError> {
        Collection::update(self, id, &values).await
    }

    async fn delete(&self, id: &str) -> Result<(), PbError> {
        Collection::delete(self, id).await
    }

    async fn subscribe(&self, options: &SubscribeOptions) -> Result<Subscription<T>, PbError> {
        Collection::subscribe(self, options).await
    }
}
