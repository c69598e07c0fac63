//! Deduplication and reuse of command responses.
//!
//! An executor asks the cache whether it has seen a request before executing it. A repeat of a
//! request still in flight or recently answered gets the same response instead of running
//! the command twice. Idempotent commands may also share responses between requests with
//! different correlation data but identical content.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::Shared;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ProtocolError;
use crate::mqtt::Publish;

use state::{Benefit, CacheState, FullCorrelationId};

mod state;

/// The expiry loop wakes at least this often, even if nothing is due.
const MAX_EXPIRY_WAIT: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    pub max_entry_count: usize,
    pub max_aggregate_payload_bytes: u64,
    /// Storage cost of an entry beyond its payloads.
    pub unit_storage_overhead_bytes: u64,
    /// Cost of executing any command beyond its measured duration.
    pub fixed_processing_overhead_millis: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entry_count: 10_000,
            max_aggregate_payload_bytes: 10_000_000,
            unit_storage_overhead_bytes: 100,
            fixed_processing_overhead_millis: 10,
        }
    }
}

impl CacheConfig {
    fn benefit(&self, request_bytes: u64, response_bytes: u64, duration: Duration) -> Benefit {
        let millis = self.fixed_processing_overhead_millis as f64 + duration.as_secs_f64() * 1000.0;
        let bytes = (self.unit_storage_overhead_bytes + request_bytes + response_bytes) as f64;

        Benefit(millis / bytes)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("the cache has not been started")]
    NotStarted,
    #[error("the entry was evicted before a response was stored")]
    Evicted,
}

impl From<CacheError> for ProtocolError {
    fn from(e: CacheError) -> Self {
        ProtocolError::state_invalid(Some("CommandResponseCache".into())).with_message(e.to_string())
    }
}

/// Identifies a request received by an executor.
#[derive(Clone, Debug)]
pub struct CommandRequest {
    pub command_name: String,
    pub invoker_id: String,
    pub topic: String,
    pub correlation_data: Bytes,
    pub payload: Bytes,
}

impl CommandRequest {
    fn correlation_id(&self) -> FullCorrelationId {
        FullCorrelationId {
            topic: self.topic.clone(),
            correlation_data: self.correlation_data.clone(),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct StoreOptions {
    /// Idempotent commands may be evicted before they expire.
    pub is_idempotent: bool,
    /// When the invoker gives up on the command.
    pub command_expiration_time: Instant,
    /// How long the command took to execute.
    pub execution_duration: Duration,
    /// How long the response may be reused for an equivalent request.
    pub cacheable_duration: Duration,
}

/// A response that has been, or will be, stored in the cache.
#[derive(Clone)]
pub struct CachedResponse(Shared<oneshot::Receiver<Publish>>);

impl fmt::Debug for CachedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CachedResponse").field(&self.peek()).finish()
    }
}

impl CachedResponse {
    /// Wait for the response to be stored.
    pub async fn wait(self) -> Result<Publish, CacheError> {
        self.0.await.map_err(|_| CacheError::Evicted)
    }

    /// The response, if it has already been stored.
    pub fn peek(&self) -> Option<&Publish> {
        self.0.peek().and_then(|response| response.as_ref().ok())
    }

    /// `true` if both handles refer to the same entry.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

/// The outcome of [`CommandResponseCache::reserve`].
#[derive(Debug)]
pub enum Lookup {
    /// A response to the same or an equivalent request, possibly still pending.
    Hit(CachedResponse),
    /// The caller must execute the command and store its response.
    Miss(Reservation),
}

/// A pending entry awaiting its response.
///
/// Dropping it without [`store`](Self::store) abandons the entry, so duplicates waiting on
/// it see [`CacheError::Evicted`] and a redelivered request is executed again.
pub struct Reservation {
    cache: Arc<CommandResponseCache>,
    request: Option<CommandRequest>,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Reservation {
    pub async fn store(mut self, response: Publish, options: StoreOptions) -> Result<(), CacheError> {
        let Some(request) = &self.request else {
            return Ok(());
        };

        self.cache.store(request, response, options).await?;
        self.request = None;

        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(request) = self.request.take() else {
            return;
        };

        if let Ok(mut state) = self.cache.state.try_lock() {
            state.abandon(&request);
            return;
        }

        let cache = self.cache.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { cache.abandon(&request).await });
            }
            Err(_) => tracing::warn!(
                topic = request.topic,
                "no runtime to abandon pending cache entry; it stays until the cache is dropped"
            ),
        }
    }
}

/// A cache of command responses, bounded by entry count and total payload size.
///
/// Entries leave the cache when they expire or when they are the least valuable entry
/// while the cache is over capacity. A response to a non-idempotent command is never
/// evicted before its command expires.
pub struct CommandResponseCache {
    state: Mutex<CacheState>,
    wake: Notify,
    expiry_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CommandResponseCache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(CommandResponseCache {
            state: Mutex::new(CacheState::new(config)),
            wake: Notify::new(),
            expiry_task: Mutex::new(None),
        })
    }

    /// The cache shared by every executor in the process that doesn't bring its own.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<CommandResponseCache>> = OnceLock::new();

        SHARED
            .get_or_init(|| CommandResponseCache::new(CacheConfig::default()))
            .clone()
    }

    pub async fn config(&self) -> CacheConfig {
        self.state.lock().await.config.clone()
    }

    /// Replace the tuning parameters. Takes effect at the next trim.
    pub async fn set_config(&self, config: CacheConfig) {
        self.state.lock().await.config = config;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Total bytes of stored requests and responses.
    pub async fn aggregate_size(&self) -> u64 {
        self.state.lock().await.aggregate_size()
    }

    pub async fn contains(&self, topic: &str, correlation_data: &Bytes) -> bool {
        self.state.lock().await.contains(&FullCorrelationId {
            topic: topic.to_owned(),
            correlation_data: correlation_data.clone(),
        })
    }

    /// Look up the response to `request`.
    ///
    /// Returns `None` if the caller should execute the command, in which case a pending entry
    /// is registered and the caller must [`store`](Self::store) its response. Otherwise the
    /// returned response may still be pending.
    pub async fn retrieve(
        &self,
        request: &CommandRequest,
        is_cacheable: bool,
        can_reuse_across_invokers: bool,
    ) -> Option<CachedResponse> {
        self.state
            .lock()
            .await
            .retrieve(request, is_cacheable, can_reuse_across_invokers)
    }

    /// Like [`retrieve`](Self::retrieve), but a miss holds the pending entry until its
    /// response is stored or the [`Reservation`] is dropped.
    pub async fn reserve(
        self: &Arc<Self>,
        request: CommandRequest,
        is_cacheable: bool,
        can_reuse_across_invokers: bool,
    ) -> Lookup {
        match self
            .retrieve(&request, is_cacheable, can_reuse_across_invokers)
            .await
        {
            Some(cached) => Lookup::Hit(cached),
            None => Lookup::Miss(Reservation {
                cache: self.clone(),
                request: Some(request),
            }),
        }
    }

    /// Remove the pending entry for `request` if its response was never stored.
    ///
    /// Returns `false` if there was no such entry.
    pub async fn abandon(&self, request: &CommandRequest) -> bool {
        self.state.lock().await.abandon(request)
    }

    /// Complete the entry registered by [`retrieve`](Self::retrieve).
    ///
    /// Discards the response if there is no such entry.
    pub async fn store(
        &self,
        request: &CommandRequest,
        response: Publish,
        options: StoreOptions,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;

        if !state.started {
            return Err(CacheError::NotStarted);
        }

        state.store(request, response, &options);
        drop(state);

        self.wake.notify_one();

        Ok(())
    }

    /// Start the expiry loop. Does nothing if it's already running.
    pub async fn start(self: &Arc<Self>) {
        let mut expiry_task = self.expiry_task.lock().await;

        if expiry_task.is_some() {
            return;
        }

        self.state.lock().await.started = true;

        let token = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_expiry(token.clone()));

        *expiry_task = Some((token, handle));
    }

    /// Stop the expiry loop and wait for it to exit. Does nothing if it isn't running.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.expiry_task.lock().await.take() else {
            return;
        };

        token.cancel();

        if let Err(e) = handle.await {
            tracing::error!(?e, "cache expiry task failed");
        }

        self.state.lock().await.started = false;
    }

    #[tracing::instrument(name = "CommandResponseCache::run_expiry", skip_all)]
    async fn run_expiry(self: Arc<Self>, token: CancellationToken) {
        loop {
            let deadline = {
                let mut state = self.state.lock().await;
                let cap = Instant::now() + MAX_EXPIRY_WAIT;

                state.next_deadline().map_or(cap, |deadline| deadline.min(cap))
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wake.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    self.state.lock().await.expire_one(Instant::now());
                }
            }
        }

        tracing::debug!("cache stopped; exiting.");
    }
}
