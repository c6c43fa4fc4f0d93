//! Keyed query cache with explicit invalidation.
//!
//! Every entry holds the resolved value of one remote read. Entries never
//! expire on their own: they are dropped by [`QueryCache::invalidate`] or
//! [`QueryCache::invalidate_prefix`], typically after a mutation.
//! Concurrent `resolve` calls for the same key share one in-flight fetch.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use threadline_pb::{CollectionRecord, ListOptions, ListResult, RecordOptions};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::key::{CacheKey, QueryMethod};
use crate::{RecordSource, SyncError};

type CachedValue = Arc<dyn Any + Send + Sync>;
type Slot = Arc<OnceCell<CachedValue>>;

/// Shared query cache. Cloning yields another handle to the same entries.
#[derive(Clone, Default)]
pub struct QueryCache {
    entries: Arc<DashMap<String, Slot>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value cached under `key`, running `fetcher` if there is none.
    ///
    /// A failed fetch is returned to the caller and leaves no entry behind.
    pub async fn resolve<V, F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<V, SyncError>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, SyncError>>,
    {
        let slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut fetched = false;
        let result = slot
            .get_or_try_init(|| {
                fetched = true;
                async move {
                    debug!(key = %key, "query cache miss, fetching");
                    let value = fetcher().await?;
                    Ok::<CachedValue, SyncError>(Arc::new(value))
                }
            })
            .await;

        match result {
            Ok(value) => {
                if !fetched {
                    trace!(key = %key, "query cache hit");
                }
                value
                    .downcast_ref::<V>()
                    .cloned()
                    .ok_or_else(|| SyncError::CacheTypeMismatch {
                        key: key.to_string(),
                    })
            }
            Err(e) => {
                self.entries.remove_if(key.as_str(), |_, current| {
                    Arc::ptr_eq(current, &slot) && !current.initialized()
                });
                debug!(key = %key, error = %e, "query fetch failed");
                Err(e)
            }
        }
    }

    /// Like [`resolve`](Self::resolve), but does nothing while `enabled` is
    /// false.
    pub async fn resolve_if<V, F, Fut>(
        &self,
        enabled: bool,
        key: &CacheKey,
        fetcher: F,
    ) -> Result<Option<V>, SyncError>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, SyncError>>,
    {
        if !enabled {
            trace!(key = %key, "query disabled, skipping fetch");
            return Ok(None);
        }
        self.resolve(key, fetcher).await.map(Some)
    }

    /// Cached value for `key`, without fetching.
    pub fn peek<V: Clone + 'static>(&self, key: &CacheKey) -> Option<V> {
        let slot = self.entries.get(key.as_str())?.clone();
        slot.get()?.downcast_ref::<V>().cloned()
    }

    /// Drop the entry for `key`; the next `resolve` fetches again.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key.as_str()).is_some();
        if removed {
            debug!(key = %key, "invalidated query");
        }
        removed
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(prefix, removed, "invalidated queries by prefix");
        }
        removed
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Cached reads and invalidating writes over `source`.
    pub fn collection<T, S>(&self, source: S) -> CachedCollection<T, S>
    where
        T: CollectionRecord,
        S: RecordSource<T>,
    {
        CachedCollection {
            source: Arc::new(source),
            cache: self.clone(),
            _record: PhantomData,
        }
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// A record source whose reads go through a [`QueryCache`].
///
/// Successful writes invalidate every cached read of the collection.
pub struct CachedCollection<T, S> {
    source: Arc<S>,
    cache: QueryCache,
    _record: PhantomData<fn() -> T>,
}

impl<T, S> Clone for CachedCollection<T, S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            cache: self.cache.clone(),
            _record: PhantomData,
        }
    }
}

impl<T, S> CachedCollection<T, S>
where
    T: CollectionRecord,
    S: RecordSource<T>,
{
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    fn key(&self, method: QueryMethod, params: &impl Serialize) -> Result<CacheKey, SyncError> {
        CacheKey::new(self.source.collection(), method, params)
    }

    pub async fn get_list(
        &self,
        page: u32,
        per_page: u32,
        options: &ListOptions,
    ) -> Result<ListResult<T>, SyncError> {
        let key = self.key(QueryMethod::GetList, &(page, per_page, options))?;
        self.cache
            .resolve(&key, || async {
                Ok(self.source.get_list(page, per_page, options).await?)
            })
            .await
    }

    pub async fn get_one(&self, id: &str, options: &RecordOptions) -> Result<T, SyncError> {
        let key = self.key(QueryMethod::GetOne, &(id, options))?;
        self.cache
            .resolve(&key, || async { Ok(self.source.get_one(id, options).await?) })
            .await
    }

    pub async fn get_first_list_item(
        &self,
        filter: &str,
        options: &ListOptions,
    ) -> Result<T, SyncError> {
        let key = self.key(QueryMethod::GetFirstListItem, &(filter, options))?;
        self.cache
            .resolve(&key, || async {
                Ok(self.source.get_first_list_item(filter, options).await?)
            })
            .await
    }

    /// Gated variant: returns `Ok(None)` without fetching while disabled.
    pub async fn get_first_list_item_if(
        &self,
        enabled: bool,
        filter: &str,
        options: &ListOptions,
    ) -> Result<Option<T>, SyncError> {
        if !enabled {
            return Ok(None);
        }
        self.get_first_list_item(filter, options).await.map(Some)
    }

    pub async fn create(&self, values: &impl Serialize) -> Result<T, SyncError> {
        let values = to_values(values)?;
        let record = self.source.create(values).await?;
        self.invalidate_all();
        Ok(record)
    }

    pub async fn update(&self, id: &str, values: &impl Serialize) -> Result<T, SyncError> {
        let values = to_values(values)?;
        let record = self.source.update(id, values).await?;
        self.invalidate_all();
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        self.source.delete(id).await?;
        self.invalidate_all();
        Ok(())
    }

    /// Drop every cached read of this collection.
    pub fn invalidate_all(&self) -> usize {
        self.cache
            .invalidate_prefix(&CacheKey::collection_prefix(self.source.collection()))
    }

    /// Drop cached reads of one method.
    pub fn invalidate_method(&self, method: QueryMethod) -> usize {
        self.cache
            .invalidate_prefix(&CacheKey::method_prefix(self.source.collection(), method))
    }
}

fn to_values(values: &impl Serialize) -> Result<serde_json::Value, SyncError> {
    serde_json::to_value(values).map_err(|e| threadline_pb::PbError::Json(e).into())
}
