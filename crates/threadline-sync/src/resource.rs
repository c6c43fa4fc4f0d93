//! Realtime list resources.
//!
//! A [`RealtimeListResource`] owns one list snapshot for a filtered query.
//! The snapshot is replaced wholesale by [`fetch`](RealtimeListResource::fetch)
//! and folded forward by a merge function for every realtime event, so the
//! list stays current without refetching.
//!
//! Ordering rules:
//!
//! - All snapshot changes go through one async mutex per resource.
//! - A successful fetch is the new baseline. Events delivered while it was in
//!   flight are discarded; if it fails they are replayed onto the prior
//!   snapshot instead.
//! - Fetch results are tagged with a generation. A result is dropped if the
//!   resource was closed, or a newer fetch started, before it settled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use threadline_pb::{
    CollectionRecord, ConnectionStatus, ListOptions, ListResult, RecordAction, RecordEvent,
    SubscribeOptions, SubscriptionGuard,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{RecordSource, SyncError};

/// Maximum number of events queued behind an in-flight fetch.
/// When exceeded, the oldest queued events are dropped.
pub const MAX_PENDING_EVENTS: usize = 10_000;

/// Default page size for list resources.
pub const DEFAULT_PER_PAGE: u32 = 50;

/// Query parameters of a list resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListParams {
    pub page: u32,
    pub per_page: u32,
    pub options: ListOptions,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
            options: ListOptions::default(),
        }
    }
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.options.filter = Some(filter.into());
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.options.sort = Some(sort.into());
        self
    }

    pub fn expand(mut self, expand: impl Into<String>) -> Self {
        self.options.expand = Some(expand.into());
        self
    }

    /// Options for the matching realtime subscription.
    pub fn subscribe_options(&self) -> SubscribeOptions {
        self.options.for_subscription()
    }
}

/// The locally held list.
///
/// `total_items` always equals `items.len()`; the count the server reported
/// for the whole query (possibly spanning several pages) is kept in
/// `remote_total_items`.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSnapshot<T> {
    pub items: Vec<T>,
    pub total_items: usize,
    pub remote_total_items: i64,
}

impl<T> Default for ListSnapshot<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total_items: 0,
            remote_total_items: 0,
        }
    }
}

impl<T> From<ListResult<T>> for ListSnapshot<T> {
    fn from(result: ListResult<T>) -> Self {
        Self {
            total_items: result.items.len(),
            remote_total_items: result.total_items,
            items: result.items,
        }
    }
}

impl<T: CollectionRecord> ListSnapshot<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total = items.len();
        Self {
            items,
            total_items: total,
            remote_total_items: total as i64,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.id()).collect()
    }
}

/// Data state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Nothing fetched yet.
    Unresolved,
    /// First fetch in progress.
    Loading,
    /// A snapshot is available.
    Resolved,
    /// Refetch in progress; the previous snapshot stays visible.
    Refetching,
    /// Closed for good.
    Closed,
}

/// Data state plus the most recent error.
#[derive(Debug, Clone)]
pub struct ResourceStatus {
    pub state: ResourceState,
    pub error: Option<SyncError>,
}

/// What happened to a fetch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The snapshot was replaced.
    Applied,
    /// The resource was closed or refetched before the result arrived.
    Discarded,
}

/// What happened to a realtime event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Merged into the snapshot.
    Applied,
    /// Held until the in-flight fetch settles.
    Queued,
}

/// Folds one event into a snapshot.
pub type MergeFn<T> =
    Arc<dyn Fn(&RecordEvent<T>, &mut ListSnapshot<T>) -> Result<(), SyncError> + Send + Sync>;

/// Default merge policy.
///
/// - create appends the record, or replaces it in place if the id is already
///   present
/// - update replaces the matching record; updates for unknown ids are dropped
/// - delete removes every record with the id
pub fn default_merge<T: CollectionRecord>(
    event: &RecordEvent<T>,
    snapshot: &mut ListSnapshot<T>,
) -> Result<(), SyncError> {
    let id = event.record.id();
    match event.action {
        RecordAction::Create => match snapshot.position(id) {
            Some(pos) => snapshot.items[pos] = event.record.clone(),
            None => {
                snapshot.items.push(event.record.clone());
                snapshot.total_items += 1;
            }
        },
        RecordAction::Update => match snapshot.position(id) {
            Some(pos) => snapshot.items[pos] = event.record.clone(),
            None => trace!(id, "dropping update for record not in list"),
        },
        RecordAction::Delete => {
            let before = snapshot.items.len();
            snapshot.items.retain(|item| item.id() != id);
            let removed = before - snapshot.items.len();
            snapshot.total_items = snapshot.total_items.saturating_sub(removed);
        }
    }
    Ok(())
}

struct ActiveSubscription {
    guard: SubscriptionGuard,
    pump: JoinHandle<()>,
}

impl ActiveSubscription {
    fn teardown(mut self) {
        self.guard.cancel();
        self.pump.abort();
    }
}

struct Core<T> {
    state: ResourceState,
    generation: u64,
    /// Generation of the fetch currently in flight.
    in_flight: Option<u64>,
    has_baseline: bool,
    pending: VecDeque<RecordEvent<T>>,
    subscription: Option<ActiveSubscription>,
}

struct Inner<T, S> {
    source: S,
    params: ListParams,
    merge: MergeFn<T>,
    core: Mutex<Core<T>>,
    closed: AtomicBool,
    snapshot: watch::Sender<ListSnapshot<T>>,
    status: watch::Sender<ResourceStatus>,
    connection: watch::Sender<ConnectionStatus>,
}

impl<T, S> Drop for Inner<T, S> {
    fn drop(&mut self) {
        if let Some(active) = self.core.get_mut().subscription.take() {
            active.teardown();
        }
    }
}

/// Builder for [`RealtimeListResource`].
pub struct RealtimeListResourceBuilder<T, S> {
    source: S,
    params: ListParams,
    merge: MergeFn<T>,
}

impl<T, S> RealtimeListResourceBuilder<T, S>
where
    T: CollectionRecord,
    S: RecordSource<T>,
{
    /// Use a custom merge function instead of [`default_merge`].
    pub fn merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(&RecordEvent<T>, &mut ListSnapshot<T>) -> Result<(), SyncError>
            + Send
            + Sync
            + 'static,
    {
        self.merge = Arc::new(merge);
        self
    }

    pub fn open(self) -> RealtimeListResource<T, S> {
        let (snapshot, _) = watch::channel(ListSnapshot::default());
        let (status, _) = watch::channel(ResourceStatus {
            state: ResourceState::Unresolved,
            error: None,
        });
        let (connection, _) = watch::channel(ConnectionStatus::Disconnected);

        let resource = RealtimeListResource {
            inner: Arc::new(Inner {
                source: self.source,
                params: self.params,
                merge: self.merge,
                core: Mutex::new(Core {
                    state: ResourceState::Loading,
                    generation: 0,
                    in_flight: None,
                    has_baseline: false,
                    pending: VecDeque::new(),
                    subscription: None,
                }),
                closed: AtomicBool::new(false),
                snapshot,
                status,
                connection,
            }),
        };
        resource.publish_status(ResourceState::Loading, None);
        debug!(
            collection = resource.inner.source.collection(),
            filter = ?resource.inner.params.options.filter,
            "opened list resource"
        );
        resource
    }
}

/// Releases the in-flight marker if a fetch future is dropped mid-flight,
/// so queued events are not held forever.
struct FetchGuard<T, S>
where
    T: CollectionRecord,
    S: RecordSource<T>,
{
    resource: Option<RealtimeListResource<T, S>>,
    generation: u64,
}

impl<T, S> FetchGuard<T, S>
where
    T: CollectionRecord,
    S: RecordSource<T>,
{
    fn disarm(&mut self) {
        self.resource = None;
    }
}

impl<T, S> Drop for FetchGuard<T, S>
where
    T: CollectionRecord,
    S: RecordSource<T>,
{
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let generation = self.generation;
        if let Ok(mut core) = resource.inner.core.try_lock() {
            resource.abandon_fetch(&mut core, generation);
            return;
        }
        // Dropped while waiting for the lock; settle once it is free.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let mut core = resource.inner.core.lock().await;
                resource.abandon_fetch(&mut core, generation);
            });
        }
    }
}

/// A list kept in sync with a remote query.
///
/// Cloning yields another handle to the same resource.
pub struct RealtimeListResource<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for RealtimeListResource<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, S> RealtimeListResource<T, S>
where
    T: CollectionRecord,
    S: RecordSource<T>,
{
    pub fn builder(source: S, params: ListParams) -> RealtimeListResourceBuilder<T, S> {
        RealtimeListResourceBuilder {
            source,
            params,
            merge: Arc::new(default_merge::<T>),
        }
    }

    /// Open a resource with the default merge policy.
    pub fn open(source: S, params: ListParams) -> Self {
        Self::builder(source, params).open()
    }

    pub fn params(&self) -> &ListParams {
        &self.inner.params
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ListSnapshot<T> {
        self.inner.snapshot.borrow().clone()
    }

    /// Receiver notified on every snapshot change.
    pub fn watch(&self) -> watch::Receiver<ListSnapshot<T>> {
        self.inner.snapshot.subscribe()
    }

    pub fn status(&self) -> ResourceStatus {
        self.inner.status.borrow().clone()
    }

    pub fn state(&self) -> ResourceState {
        self.inner.status.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<ResourceStatus> {
        self.inner.status.subscribe()
    }

    /// Realtime connection status of the current subscription.
    pub fn connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.subscribe()
    }

    /// Number of events waiting for an in-flight fetch to settle.
    pub async fn pending_events(&self) -> usize {
        self.inner.core.lock().await.pending.len()
    }

    fn publish_status(&self, state: ResourceState, error: Option<SyncError>) {
        self.inner.status.send_replace(ResourceStatus { state, error });
    }

    /// Fetch the list and make it the new snapshot.
    ///
    /// On failure the error is returned and recorded in the status, and the
    /// previous snapshot stays in place.
    pub async fn fetch(&self) -> Result<FetchOutcome, SyncError> {
        let generation = {
            let mut core = self.inner.core.lock().await;
            if self.is_closed() {
                return Err(SyncError::Closed);
            }
            core.generation += 1;
            core.in_flight = Some(core.generation);
            core.state = if core.has_baseline {
                ResourceState::Refetching
            } else {
                ResourceState::Loading
            };
            let error = self.inner.status.borrow().error.clone();
            self.publish_status(core.state, error);
            core.generation
        };
        let mut guard = FetchGuard {
            resource: Some(self.clone()),
            generation,
        };

        let params = &self.inner.params;
        debug!(
            collection = self.inner.source.collection(),
            generation,
            page = params.page,
            per_page = params.per_page,
            "fetching list"
        );
        let result = self
            .inner
            .source
            .get_list(params.page, params.per_page, &params.options)
            .await;

        let mut core = self.inner.core.lock().await;
        guard.disarm();
        if self.is_closed() || core.generation != generation {
            debug!(generation, current = core.generation, "discarding stale fetch result");
            return Ok(FetchOutcome::Discarded);
        }
        core.in_flight = None;

        match result {
            Ok(list) => {
                let dropped = core.pending.len();
                core.pending.clear();
                if dropped > 0 {
                    debug!(dropped, "discarded events superseded by fetch");
                }

                let snapshot = ListSnapshot::from(list);
                debug!(
                    items = snapshot.items.len(),
                    remote_total = snapshot.remote_total_items,
                    "list fetched"
                );
                self.inner.snapshot.send_replace(snapshot);

                core.has_baseline = true;
                core.state = ResourceState::Resolved;
                self.publish_status(core.state, None);
                Ok(FetchOutcome::Applied)
            }
            Err(e) => {
                let error = SyncError::from(e);
                warn!(error = %error, "list fetch failed");
                self.settle_without_baseline(&mut core, Some(error.clone()));
                Err(error)
            }
        }
    }

    /// Replay queued events onto the current snapshot and fall back to the
    /// state held before the fetch started.
    fn settle_without_baseline(&self, core: &mut Core<T>, error: Option<SyncError>) {
        let queued: Vec<_> = core.pending.drain(..).collect();
        if !queued.is_empty() {
            debug!(count = queued.len(), "replaying events queued during unsettled fetch");
        }
        for event in &queued {
            if let Err(merge_error) = self.merge_into_snapshot(event) {
                warn!(error = %merge_error, "failed to replay queued event");
            }
        }

        core.state = if core.has_baseline {
            ResourceState::Resolved
        } else {
            ResourceState::Unresolved
        };
        self.publish_status(core.state, error);
    }

    /// Release a fetch whose future was dropped before it settled.
    fn abandon_fetch(&self, core: &mut Core<T>, generation: u64) {
        if self.is_closed() || core.in_flight != Some(generation) {
            return;
        }
        core.in_flight = None;
        debug!(generation, "fetch dropped before settling");
        let error = self.inner.status.borrow().error.clone();
        self.settle_without_baseline(core, error);
    }

    /// Apply one realtime event.
    ///
    /// While a fetch is in flight the event is queued instead. A merge error
    /// is returned as-is and leaves the snapshot untouched.
    pub async fn apply_event(&self, event: RecordEvent<T>) -> Result<EventOutcome, SyncError> {
        let mut core = self.inner.core.lock().await;
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        if core.in_flight.is_some() {
            while core.pending.len() >= MAX_PENDING_EVENTS {
                core.pending.pop_front();
                warn!(
                    max = MAX_PENDING_EVENTS,
                    "pending events queue full, dropping oldest event"
                );
            }
            core.pending.push_back(event);
            trace!(queue_len = core.pending.len(), "queued event behind in-flight fetch");
            return Ok(EventOutcome::Queued);
        }

        self.merge_into_snapshot(&event)?;
        trace!(action = ?event.action, id = event.record.id(), "applied event");
        Ok(EventOutcome::Applied)
    }

    /// Run the merge function on a copy and publish it only if the merge
    /// succeeds.
    fn merge_into_snapshot(&self, event: &RecordEvent<T>) -> Result<(), SyncError> {
        let mut outcome = Ok(());
        self.inner.snapshot.send_if_modified(|current| {
            let mut next = current.clone();
            match (self.inner.merge)(event, &mut next) {
                Ok(()) => {
                    *current = next;
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    /// Edit matching items in place without a round-trip.
    ///
    /// Returns the number of items changed. Subscribers are only notified if
    /// at least one item matched.
    pub fn mutate_local<M, F>(&self, matcher: M, mut transform: F) -> usize
    where
        M: Fn(&T) -> bool,
        F: FnMut(&mut T),
    {
        if self.is_closed() {
            return 0;
        }
        let mut changed = 0;
        self.inner.snapshot.send_if_modified(|snapshot| {
            for item in snapshot.items.iter_mut().filter(|item| matcher(item)) {
                transform(item);
                changed += 1;
            }
            changed > 0
        });
        if changed > 0 {
            debug!(changed, "applied local mutation");
        }
        changed
    }

    /// Open the realtime subscription for this resource's filter.
    ///
    /// Any previous subscription is torn down first.
    pub async fn subscribe(&self) -> Result<(), SyncError> {
        let mut core = self.inner.core.lock().await;
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        if let Some(previous) = core.subscription.take() {
            debug!("replacing existing subscription");
            previous.teardown();
        }

        self.inner
            .connection
            .send_replace(ConnectionStatus::Connecting);

        let options = self.inner.params.subscribe_options();
        let subscription = match self.inner.source.subscribe(&options).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(error = %e, "failed to open subscription");
                self.inner
                    .connection
                    .send_replace(ConnectionStatus::Disconnected);
                return Err(e.into());
            }
        };

        let (events, status, guard) = subscription.split();
        let pump = tokio::spawn(pump_events(Arc::downgrade(&self.inner), events, status));
        core.subscription = Some(ActiveSubscription { guard, pump });

        debug!(
            collection = self.inner.source.collection(),
            filter = ?options.filter,
            "subscribed"
        );
        Ok(())
    }

    /// Subscribe, wait until the subscription is live, then fetch.
    ///
    /// Anything created after the fetch read the list is then guaranteed to
    /// arrive as an event. Waits as long as the transport keeps reconnecting;
    /// wrap in a timeout to bound it.
    pub async fn load(&self) -> Result<FetchOutcome, SyncError> {
        self.subscribe().await?;
        self.wait_connected().await?;
        self.fetch().await
    }

    async fn wait_connected(&self) -> Result<(), SyncError> {
        let mut connection = self.inner.connection.subscribe();
        let connected = connection
            .wait_for(|status| status.is_connected() || self.is_closed())
            .await
            .is_ok();
        if !connected || self.is_closed() {
            return Err(SyncError::Closed);
        }
        debug!(collection = self.inner.source.collection(), "subscription live");
        Ok(())
    }

    /// Unsubscribe and stop accepting fetch results and events. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut core = self.inner.core.lock().await;
        if let Some(active) = core.subscription.take() {
            active.teardown();
        }
        core.pending.clear();
        core.in_flight = None;
        core.generation += 1;
        core.state = ResourceState::Closed;

        self.publish_status(ResourceState::Closed, None);
        self.inner
            .connection
            .send_replace(ConnectionStatus::Disconnected);
        debug!(collection = self.inner.source.collection(), "closed list resource");
    }

    fn record_error(&self, error: SyncError) {
        let state = self.inner.status.borrow().state;
        self.publish_status(state, Some(error));
    }
}

/// Forward subscription events and connection changes into the resource.
async fn pump_events<T, S>(
    weak: Weak<Inner<T, S>>,
    mut events: mpsc::UnboundedReceiver<RecordEvent<T>>,
    mut status: watch::Receiver<ConnectionStatus>,
) where
    T: CollectionRecord,
    S: RecordSource<T>,
{
    match weak.upgrade() {
        Some(inner) => {
            inner.connection.send_replace(*status.borrow_and_update());
        }
        None => return,
    }

    let mut status_open = true;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("subscription ended");
                    if let Some(inner) = weak.upgrade() {
                        inner.connection.send_replace(ConnectionStatus::Disconnected);
                    }
                    break;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let resource = RealtimeListResource { inner };
                match resource.apply_event(event).await {
                    Ok(_) => {}
                    Err(SyncError::Closed) => break,
                    Err(e) => {
                        warn!(error = %e, "merge function rejected event");
                        resource.record_error(e);
                    }
                }
            }
            changed = status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    continue;
                }
                let current = *status.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                debug!(status = ?current, "connection status changed");
                inner.connection.send_replace(current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySource;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use threadline_pb::Comment;

    type CommentResource = RealtimeListResource<Comment, MemorySource<Comment>>;

    fn comment(id: &str) -> Comment {
        Comment::new(id, "t1", format!("body of {}", id))
    }

    fn thread_params() -> ListParams {
        ListParams::new().filter("thread = 't1'")
    }

    async fn wait_for_snapshot(
        resource: &CommentResource,
        predicate: impl FnMut(&ListSnapshot<Comment>) -> bool,
    ) -> ListSnapshot<Comment> {
        let mut rx = resource.watch();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .expect("snapshot sender dropped")
            .clone();
        snapshot
    }

    async fn wait_until_fetch_started(source: &MemorySource<Comment>, count: usize) {
        while source.fetch_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_default_merge_create_and_delete() {
        let mut snapshot = ListSnapshot::new(vec![comment("c1")]);

        default_merge(&RecordEvent::create(comment("c2")), &mut snapshot).unwrap();
        assert_eq!(snapshot.ids(), vec!["c1", "c2"]);
        assert_eq!(snapshot.total_items, 2);

        default_merge(&RecordEvent::delete(comment("c1")), &mut snapshot).unwrap();
        assert_eq!(snapshot.ids(), vec!["c2"]);
        assert_eq!(snapshot.total_items, 1);
    }

    #[test]
    fn test_default_merge_duplicate_create_replaces() {
        let mut snapshot = ListSnapshot::new(vec![comment("c1")]);
        let mut edited = comment("c1");
        edited.content = "edited".to_string();

        default_merge(&RecordEvent::create(edited), &mut snapshot).unwrap();
        assert_eq!(snapshot.total_items, 1);
        assert_eq!(snapshot.items[0].content, "edited");
    }

    #[test]
    fn test_default_merge_orphan_update_dropped() {
        let mut snapshot = ListSnapshot::new(vec![comment("c1")]);
        default_merge(&RecordEvent::delete(comment("c1")), &mut snapshot).unwrap();
        default_merge(&RecordEvent::update(comment("c1")), &mut snapshot).unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.total_items, 0);
    }

    #[test]
    fn test_default_merge_delete_absent_is_noop() {
        let mut snapshot = ListSnapshot::new(vec![comment("c1")]);
        default_merge(&RecordEvent::delete(comment("zz")), &mut snapshot).unwrap();
        default_merge(&RecordEvent::delete(comment("zz")), &mut snapshot).unwrap();
        assert_eq!(snapshot.ids(), vec!["c1"]);
        assert_eq!(snapshot.total_items, 1);
    }

    #[tokio::test]
    async fn test_open_starts_loading() {
        let resource = CommentResource::open(MemorySource::new(), thread_params());
        assert_eq!(resource.state(), ResourceState::Loading);
        assert!(resource.snapshot().is_empty());
        assert_eq!(*resource.connection().borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_fetch_replaces_snapshot() {
        let source = MemorySource::with_records(vec![comment("c1"), comment("c2")]);
        let resource = CommentResource::open(source, thread_params());

        assert_eq!(resource.fetch().await.unwrap(), FetchOutcome::Applied);
        let snapshot = resource.snapshot();
        assert_eq!(snapshot.total_items, snapshot.items.len());
        assert_eq!(snapshot.remote_total_items, 2);
        assert_eq!(resource.state(), ResourceState::Resolved);
    }

    #[tokio::test]
    async fn test_remote_total_kept_separately() {
        let source = MemorySource::with_records((0..5).map(|i| comment(&format!("c{}", i))).collect());
        let resource = CommentResource::open(source, ListParams::new().per_page(2));

        resource.fetch().await.unwrap();
        let snapshot = resource.snapshot();
        assert_eq!(snapshot.total_items, 2);
        assert_eq!(snapshot.remote_total_items, 5);
    }

    #[tokio::test]
    async fn test_failed_first_fetch_returns_to_unresolved() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        source.fail_next_fetches(1);
        let resource = CommentResource::open(source, thread_params());

        assert!(resource.fetch().await.is_err());
        let status = resource.status();
        assert_eq!(status.state, ResourceState::Unresolved);
        assert!(status.error.is_some());

        // Recoverable by fetching again.
        resource.fetch().await.unwrap();
        let status = resource.status();
        assert_eq!(status.state, ResourceState::Resolved);
        assert!(status.error.is_none());
        assert_eq!(resource.snapshot().ids(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_snapshot() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        let resource = CommentResource::open(source.clone(), thread_params());
        resource.fetch().await.unwrap();

        source.fail_next_fetches(1);
        let err = resource.fetch().await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
        assert_eq!(resource.state(), ResourceState::Resolved);
        assert_eq!(resource.snapshot().ids(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_refetching_state_while_in_flight() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        let resource = CommentResource::open(source.clone(), thread_params());
        resource.fetch().await.unwrap();

        source.pause_fetches();
        let handle = {
            let resource = resource.clone();
            tokio::spawn(async move { resource.fetch().await })
        };
        wait_until_fetch_started(&source, 2).await;
        assert_eq!(resource.state(), ResourceState::Refetching);
        assert_eq!(resource.snapshot().ids(), vec!["c1"]);

        source.resume_fetches();
        assert_eq!(handle.await.unwrap().unwrap(), FetchOutcome::Applied);
        assert_eq!(resource.state(), ResourceState::Resolved);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let source: MemorySource<Comment> = MemorySource::new();
        let resource = CommentResource::open(source.clone(), thread_params());
        resource.subscribe().await.unwrap();
        assert_eq!(source.active_subscriptions(), 1);

        resource.close().await;
        resource.close().await;
        assert!(resource.is_closed());
        assert_eq!(resource.state(), ResourceState::Closed);
        assert_eq!(source.active_subscriptions(), 0);
        assert!(matches!(resource.fetch().await, Err(SyncError::Closed)));
        assert!(matches!(resource.subscribe().await, Err(SyncError::Closed)));
    }

    #[tokio::test]
    async fn test_close_before_fetch_settles_discards_result() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        source.pause_fetches();
        let resource = CommentResource::open(source.clone(), thread_params());

        let handle = {
            let resource = resource.clone();
            tokio::spawn(async move { resource.fetch().await })
        };
        wait_until_fetch_started(&source, 1).await;

        resource.close().await;
        source.resume_fetches();

        assert_eq!(handle.await.unwrap().unwrap(), FetchOutcome::Discarded);
        assert!(resource.snapshot().is_empty());
        assert_eq!(resource.state(), ResourceState::Closed);
    }

    #[tokio::test]
    async fn test_newer_fetch_wins() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        source.pause_fetches();
        let resource = CommentResource::open(source.clone(), thread_params());

        let first = {
            let resource = resource.clone();
            tokio::spawn(async move { resource.fetch().await })
        };
        wait_until_fetch_started(&source, 1).await;
        let second = {
            let resource = resource.clone();
            tokio::spawn(async move { resource.fetch().await })
        };
        wait_until_fetch_started(&source, 2).await;

        source.resume_fetches();
        assert_eq!(first.await.unwrap().unwrap(), FetchOutcome::Discarded);
        assert_eq!(second.await.unwrap().unwrap(), FetchOutcome::Applied);
        assert_eq!(resource.snapshot().ids(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_events_during_fetch_discarded_on_success() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        let resource = CommentResource::open(source.clone(), thread_params());
        resource.subscribe().await.unwrap();

        source.pause_fetches();
        let handle = {
            let resource = resource.clone();
            tokio::spawn(async move { resource.fetch().await })
        };
        wait_until_fetch_started(&source, 1).await;

        // Not stored on the source, so only the queued event knows about it.
        source.emit(RecordEvent::create(comment("ghost")));
        while resource.pending_events().await == 0 {
            tokio::task::yield_now().await;
        }

        source.resume_fetches();
        handle.await.unwrap().unwrap();
        assert_eq!(resource.snapshot().ids(), vec!["c1"]);
        assert_eq!(resource.pending_events().await, 0);
    }

    #[tokio::test]
    async fn test_events_during_failed_fetch_are_replayed() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        let resource = CommentResource::open(source.clone(), thread_params());
        resource.load().await.unwrap();

        source.pause_fetches();
        source.fail_next_fetches(1);
        let handle = {
            let resource = resource.clone();
            tokio::spawn(async move { resource.fetch().await })
        };
        wait_until_fetch_started(&source, 2).await;

        source.emit(RecordEvent::create(comment("c2")));
        while resource.pending_events().await == 0 {
            tokio::task::yield_now().await;
        }

        source.resume_fetches();
        assert!(handle.await.unwrap().is_err());

        let snapshot = resource.snapshot();
        assert_eq!(snapshot.ids(), vec!["c1", "c2"]);
        assert_eq!(snapshot.total_items, 2);
        assert_eq!(resource.state(), ResourceState::Resolved);
    }

    #[tokio::test]
    async fn test_resubscribe_tears_down_previous() {
        let source: MemorySource<Comment> = MemorySource::new();
        let resource = CommentResource::open(source.clone(), thread_params());

        resource.subscribe().await.unwrap();
        resource.subscribe().await.unwrap();
        assert_eq!(source.subscribe_count(), 2);
        assert_eq!(source.active_subscriptions(), 1);

        source.insert(comment("c1"));
        let snapshot = wait_for_snapshot(&resource, |s| !s.is_empty()).await;
        assert_eq!(snapshot.ids(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_merge_error_recorded() {
        let source: MemorySource<Comment> = MemorySource::new();
        let resource = CommentResource::builder(source.clone(), thread_params())
            .merge(|event, snapshot| {
                if event.record.content.is_empty() {
                    return Err(SyncError::Merge("empty comment".to_string()));
                }
                default_merge(event, snapshot)
            })
            .open();

        let err = resource
            .apply_event(RecordEvent::create(Comment::new("c1", "t1", "")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Merge(_)));
        assert!(resource.snapshot().is_empty());

        resource.subscribe().await.unwrap();
        source.emit(RecordEvent::create(Comment::new("c2", "t1", "")));
        let mut status = resource.watch_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| matches!(s.error, Some(SyncError::Merge(_)))),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(resource.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_connection_status_forwarded() {
        let source: MemorySource<Comment> = MemorySource::new();
        let resource = CommentResource::open(source.clone(), thread_params());
        resource.subscribe().await.unwrap();

        let mut connection = resource.connection();
        tokio::time::timeout(Duration::from_secs(5), connection.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();

        source.set_connection(ConnectionStatus::Disconnected);
        tokio::time::timeout(
            Duration::from_secs(5),
            connection.wait_for(|s| *s == ConnectionStatus::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        // A dropped transport never clears the snapshot.
        assert_eq!(resource.state(), ResourceState::Loading);
    }

    #[tokio::test]
    async fn test_mutate_local_removes_attachment() {
        let mut with_files = comment("c1");
        with_files.attachments = vec!["a.png".to_string(), "b.png".to_string()];
        let source = MemorySource::with_records(vec![with_files, comment("c2")]);
        let resource = CommentResource::open(source, thread_params());
        resource.fetch().await.unwrap();

        let mut rx = resource.watch();
        rx.borrow_and_update();

        let changed = resource.mutate_local(
            |c| c.id() == "c1",
            |c| c.attachments.retain(|a| a != "a.png"),
        );
        assert_eq!(changed, 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(resource.snapshot().items[0].attachments, vec!["b.png"]);

        rx.borrow_and_update();
        assert_eq!(resource.mutate_local(|c| c.id() == "nope", |_| {}), 0);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_thread_comments_scenario() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        let resource = CommentResource::open(source.clone(), thread_params());
        resource.load().await.unwrap();
        assert_eq!(resource.snapshot().ids(), vec!["c1"]);

        source.insert(comment("c2"));
        let snapshot = wait_for_snapshot(&resource, |s| s.len() == 2).await;
        assert_eq!(snapshot.ids(), vec!["c1", "c2"]);
        assert_eq!(snapshot.total_items, 2);

        source.remove("c1");
        let snapshot = wait_for_snapshot(&resource, |s| s.len() == 1).await;
        assert_eq!(snapshot.ids(), vec!["c2"]);
        assert_eq!(snapshot.total_items, 1);

        resource.close().await;
    }

    #[tokio::test]
    async fn test_dropped_fetch_releases_event_queue() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        let resource = CommentResource::open(source.clone(), thread_params());
        resource.load().await.unwrap();

        source.pause_fetches();
        let timed_out = tokio::time::timeout(Duration::from_millis(50), resource.fetch())
            .await
            .is_err();
        assert!(timed_out);
        assert_eq!(resource.state(), ResourceState::Resolved);
        assert_eq!(resource.pending_events().await, 0);

        source.insert(comment("c2"));
        let snapshot = wait_for_snapshot(&resource, |s| s.len() == 2).await;
        assert_eq!(snapshot.ids(), vec!["c1", "c2"]);
        assert_eq!(resource.pending_events().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_fetch_replays_queued_events() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        let resource = CommentResource::open(source.clone(), thread_params());

        source.pause_fetches();
        {
            let fetch = resource.fetch();
            tokio::pin!(fetch);
            tokio::select! {
                _ = &mut fetch => panic!("fetch should still be paused"),
                _ = wait_until_fetch_started(&source, 1) => {}
            }
            assert_eq!(resource.state(), ResourceState::Loading);
            assert_eq!(
                resource.apply_event(RecordEvent::create(comment("c9"))).await.unwrap(),
                EventOutcome::Queued
            );
        }

        assert_eq!(resource.state(), ResourceState::Unresolved);
        assert_eq!(resource.snapshot().ids(), vec!["c9"]);
        assert_eq!(
            resource.apply_event(RecordEvent::create(comment("c10"))).await.unwrap(),
            EventOutcome::Applied
        );

        // A later fetch still works normally.
        source.resume_fetches();
        assert_eq!(resource.fetch().await.unwrap(), FetchOutcome::Applied);
        assert_eq!(resource.snapshot().ids(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_load_waits_for_live_subscription() {
        let source = MemorySource::with_records(vec![comment("c1")]);
        source.set_connection(ConnectionStatus::Connecting);
        let resource = CommentResource::open(source.clone(), thread_params());

        let handle = {
            let resource = resource.clone();
            tokio::spawn(async move { resource.load().await })
        };
        while source.subscribe_count() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(source.fetch_count(), 0);
        assert_eq!(resource.state(), ResourceState::Loading);

        source.set_connection(ConnectionStatus::Connected);
        assert_eq!(handle.await.unwrap().unwrap(), FetchOutcome::Applied);
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(*resource.connection().borrow(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_load() {
        let source: MemorySource<Comment> = MemorySource::new();
        source.set_connection(ConnectionStatus::Disconnected);
        let resource = CommentResource::open(source.clone(), thread_params());

        let handle = {
            let resource = resource.clone();
            tokio::spawn(async move { resource.load().await })
        };
        while source.subscribe_count() == 0 {
            tokio::task::yield_now().await;
        }
        resource.close().await;

        assert!(matches!(handle.await.unwrap(), Err(SyncError::Closed)));
        assert_eq!(source.fetch_count(), 0);
    }
}
