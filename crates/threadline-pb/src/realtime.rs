//! Realtime record subscriptions over PocketBase's SSE endpoint.
//!
//! A single event stream (`GET /api/realtime`) is shared by every
//! subscription. The server announces a client id in a `PB_CONNECT` frame;
//! the set of wanted topics is then registered with `POST /api/realtime`.
//! Each topic is `{collection}/*`, optionally followed by the encoded query
//! options, and events come back named after the topic they match.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use dashmap::DashMap;
use futures_util::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::sse::{SseDecoder, SseFrame};
use crate::{PbError, PocketBaseClient, RecordEvent, SubscribeOptions};

const REALTIME_PATH: &str = "/api/realtime";
const CONNECT_EVENT: &str = "PB_CONNECT";

/// Characters `encodeURIComponent` escapes.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// State of the shared realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Opening the stream or waiting for the server's client id.
    Connecting,
    /// Topics are registered and events flow.
    Connected,
    /// No live stream (not started, backing off, or stopped).
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Topic key for a collection subscription with query options.
///
/// Matches the naming the server uses for dispatched events:
/// `comments/*` or `comments/*?options=%7B%22query%22...`.
pub fn topic_key(collection: &str, options: &SubscribeOptions) -> String {
    let topic = format!("{}/*", collection);
    if options.is_empty() {
        return topic;
    }
    let payload = serde_json::json!({ "query": options }).to_string();
    format!(
        "{}?options={}",
        topic,
        utf8_percent_encode(&payload, URI_COMPONENT)
    )
}

/// Delivers a raw event payload to one subscriber. Returns `false` once the
/// subscriber has gone away.
type Deliver = Box<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

struct Listener {
    id: Uuid,
    deliver: Deliver,
}

struct ConnectionTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared {
    client: Arc<PocketBaseClient>,
    listeners: DashMap<String, Vec<Listener>>,
    client_id: watch::Sender<Option<String>>,
    status: watch::Sender<ConnectionStatus>,
    /// Serializes topic registration so the last POST reflects the latest set.
    submit_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<ConnectionTask>>,
}

/// Client for the realtime event stream.
///
/// The connection is opened lazily on the first subscription and closed
/// again when the last subscription is cancelled.
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl RealtimeClient {
    pub fn new(client: Arc<PocketBaseClient>) -> Self {
        let (client_id, _) = watch::channel(None);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                client,
                listeners: DashMap::new(),
                client_id,
                status,
                submit_lock: tokio::sync::Mutex::new(()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Watch the connection status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Client id assigned by the server for the current connection.
    pub fn client_id(&self) -> Option<String> {
        self.shared.client_id.borrow().clone()
    }

    /// Topics that currently have at least one subscriber.
    pub fn topics(&self) -> Vec<String> {
        self.shared.topics()
    }

    /// Subscribe to changes in `collection` matching `options`.
    ///
    /// Events that fail to decode as `T` are logged and skipped.
    pub async fn subscribe<T>(
        &self,
        collection: &str,
        options: &SubscribeOptions,
    ) -> Result<Subscription<T>, PbError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let topic = topic_key(collection, options);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let log_topic = topic.clone();
        let deliver: Deliver = Box::new(move |data| {
            match serde_json::from_value::<RecordEvent<T>>(data.clone()) {
                Ok(event) => tx.send(event).is_ok(),
                Err(e) => {
                    warn!(topic = %log_topic, error = %e, "failed to decode realtime event");
                    true
                }
            }
        });

        let is_new_topic = {
            let mut entry = self.shared.listeners.entry(topic.clone()).or_default();
            entry.push(Listener { id, deliver });
            entry.len() == 1
        };
        debug!(topic = %topic, listener = %id, is_new_topic, "subscribing");

        Shared::ensure_running(&self.shared);

        if is_new_topic {
            if let Err(e) = self.shared.submit_subscriptions().await {
                self.shared.remove_listener(&topic, id);
                return Err(e);
            }
        }

        let weak = Arc::downgrade(&self.shared);
        let guard = SubscriptionGuard::new(move || Shared::cancel(weak, topic, id));

        Ok(Subscription::from_parts(rx, self.status(), guard))
    }

    /// Close the stream and drop every subscription.
    pub fn disconnect(&self) {
        self.shared.listeners.clear();
        self.shared.stop();
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl Shared {
    fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .listeners
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<ConnectionTask>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the connection task unless one is already running.
    fn ensure_running(shared: &Arc<Self>) {
        let mut slot = shared.task_slot();
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::run(Arc::downgrade(shared), shutdown_rx));
        *slot = Some(ConnectionTask {
            shutdown_tx,
            handle,
        });
    }

    fn stop(&self) {
        let mut slot = self.task_slot();
        self.shutdown_locked(&mut slot);
    }

    /// Stop the stream if no topic has listeners left.
    ///
    /// The check runs under the task slot lock, the same lock
    /// `ensure_running` takes after a subscriber registers, so a concurrent
    /// subscribe either sees the stream torn down and restarts it or keeps
    /// this call from stopping it.
    fn stop_if_idle(&self) -> bool {
        let mut slot = self.task_slot();
        if !self.listeners.is_empty() {
            return false;
        }
        self.shutdown_locked(&mut slot);
        true
    }

    fn shutdown_locked(&self, slot: &mut Option<ConnectionTask>) {
        if let Some(task) = slot.take() {
            let _ = task.shutdown_tx.send(true);
            task.handle.abort();
            info!("realtime connection stopped");
        }
        self.client_id.send_replace(None);
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    fn remove_listener(&self, topic: &str, id: Uuid) -> bool {
        let mut emptied = false;
        if let Some(mut entry) = self.listeners.get_mut(topic) {
            entry.retain(|listener| listener.id != id);
            emptied = entry.is_empty();
        }
        if emptied {
            self.listeners.remove_if(topic, |_, listeners| listeners.is_empty());
        }
        emptied
    }

    /// Remove one listener. When its topic empties, re-register the
    /// remaining topics and stop the stream if nothing is left.
    fn cancel(weak: Weak<Self>, topic: String, id: Uuid) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        debug!(topic = %topic, listener = %id, "unsubscribing");
        if !shared.remove_listener(&topic, id) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            shared.stop_if_idle();
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = shared.submit_subscriptions().await {
                warn!(error = %e, "failed to update realtime subscriptions");
            }
            shared.stop_if_idle();
        });
    }

    /// Register the current topic set with the server.
    ///
    /// A no-op until the server has assigned a client id; the `PB_CONNECT`
    /// handler submits the full set once it arrives.
    async fn submit_subscriptions(&self) -> Result<(), PbError> {
        let _guard = self.submit_lock.lock().await;

        let Some(client_id) = self.client_id.borrow().clone() else {
            return Ok(());
        };
        let topics = self.topics();
        debug!(client_id = %client_id, topics = ?topics, "registering realtime topics");

        let response = self
            .client
            .request(Method::POST, REALTIME_PATH)
            .await
            .json(&serde_json::json!({
                "clientId": client_id,
                "subscriptions": topics,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PbError::Realtime(format!(
                "topic registration failed ({}): {}",
                status, body
            )));
        }
        Ok(())
    }

    /// Reconnection loop. Exits on shutdown or once the client is dropped.
    async fn run(weak: Weak<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let Some(shared) = weak.upgrade() else {
                break;
            };

            shared.status.send_replace(ConnectionStatus::Connecting);
            let result = shared
                .connect_and_process(&mut shutdown_rx, &mut backoff)
                .await;
            shared.client_id.send_replace(None);
            shared.status.send_replace(ConnectionStatus::Disconnected);
            drop(shared);

            match result {
                Ok(()) => break,
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    error!(error = %e, wait_ms = wait.as_millis() as u64, "realtime connection error, reconnecting");

                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        info!("realtime client shutting down");
    }

    async fn connect_and_process(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), PbError> {
        let url = self.client.url(REALTIME_PATH);
        info!(url = %url, "connecting to realtime stream");

        let mut request = self
            .client
            .http()
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = self.client.auth_token().await {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PbError::Realtime(format!("connect failed ({})", status)));
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for frame in decoder.push(&bytes) {
                                self.handle_frame(frame, backoff).await?;
                            }
                        }
                        Some(Err(e)) => return Err(PbError::Http(e)),
                        None => return Err(PbError::Realtime("stream closed by server".to_string())),
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: SseFrame,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), PbError> {
        if frame.event == CONNECT_EVENT {
            let connect: ConnectFrame = serde_json::from_str(&frame.data)?;
            info!(client_id = %connect.client_id, "realtime connected");
            self.client_id.send_replace(Some(connect.client_id));
            self.submit_subscriptions().await?;
            backoff.reset();
            self.status.send_replace(ConnectionStatus::Connected);
            return Ok(());
        }

        let Some(listeners) = self.listeners.get(&frame.event) else {
            trace!(event = %frame.event, "no listeners for realtime event");
            return Ok(());
        };

        let data: serde_json::Value = match serde_json::from_str(&frame.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(event = %frame.event, error = %e, "malformed realtime payload");
                return Ok(());
            }
        };

        for listener in listeners.iter() {
            if !(listener.deliver)(&data) {
                trace!(listener = %listener.id, "realtime listener closed");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectFrame {
    client_id: String,
}

/// Cancels a subscription when dropped.
pub struct SubscriptionGuard {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A guard with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Cancel now. Later calls (and the drop) do nothing.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A live stream of record events for one topic.
pub struct Subscription<T> {
    events: mpsc::UnboundedReceiver<RecordEvent<T>>,
    status: watch::Receiver<ConnectionStatus>,
    guard: SubscriptionGuard,
}

impl<T> Subscription<T> {
    /// Assemble a subscription from its parts (used by in-memory sources).
    pub fn from_parts(
        events: mpsc::UnboundedReceiver<RecordEvent<T>>,
        status: watch::Receiver<ConnectionStatus>,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            events,
            status,
            guard,
        }
    }

    /// Next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<RecordEvent<T>> {
        self.events.recv().await
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Split into the event receiver, status watch and cancel guard.
    pub fn split(
        self,
    ) -> (
        mpsc::UnboundedReceiver<RecordEvent<T>>,
        watch::Receiver<ConnectionStatus>,
        SubscriptionGuard,
    ) {
        (self.events, self.status, self.guard)
    }

    /// Stop receiving events.
    pub fn unsubscribe(mut self) {
        self.guard.cancel();
    }
}
