//! Dmc implements the Dynamic Multiplexing Controller: a single process-wide set of informers
//! and a single rate-limited workqueue shared across every registered `ResourceGraphDefinition`.
//!
//! Unlike the typed, fixed-kind controllers a `kube::runtime::Controller` wraps, the set of
//! kinds served here grows and shrinks at runtime as ResourceGraphDefinitions are reconciled and
//! deleted, so the informer/handler machinery is built by hand on top of `kube::runtime::watcher`
//! and a bespoke [`RateLimitingQueue`] rather than on `kube::runtime::Controller` directly.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use futures::{future::poll_fn, StreamExt};
use kro_graph::Gvr;
use kube::{
    api::{Api, DynamicObject},
    core::ApiResource,
    runtime::watcher::{self, Event},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::{
    sync::CancellationToken,
    time::{delay_queue, DelayQueue},
};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{Error, Result};

/// ObjectIdentifiers names one work item: a namespaced key plus the GVR it belongs to, since the
/// same key can exist under different kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentifiers {
    /// NamespacedKey is `namespace/name`, or bare `name` for cluster-scoped objects.
    pub namespaced_key: String,
    /// Gvr is the group/version/resource the key was observed under.
    pub gvr: Gvr,
}

impl ObjectIdentifiers {
    /// New builds an identifier from a namespace/name pair and a GVR.
    pub fn new(namespace: Option<&str>, name: &str, gvr: Gvr) -> Self {
        let namespaced_key = match namespace {
            Some(ns) => format!("{ns}/{name}"),
            None => name.to_string(),
        };
        Self { namespaced_key, gvr }
    }
}

/// HandlerOutcome is the result a registered handler reports for one work item; it drives the
/// queue's requeue decision, distinct from the plain `Result` a `kube::runtime::Controller`
/// reconciler returns.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Done means the item reconciled successfully (or was not found) and should not be
    /// requeued.
    Done,
    /// NoRequeue means the handler hit an error it has already logged and does not want
    /// retried.
    NoRequeue,
    /// RequeueNeeded means the item should be added back immediately, without rate limiting.
    RequeueNeeded,
    /// RequeueNeededAfter means the item should be added back after the given delay, without
    /// consuming a retry.
    RequeueNeededAfter(Duration),
}

/// Handler is the per-GVR callback the DMC invokes for each dequeued work item.
pub type Handler = Arc<
    dyn Fn(ObjectIdentifiers) -> futures::future::BoxFuture<'static, Result<HandlerOutcome>>
        + Send
        + Sync,
>;

/// RateLimiterConfig configures the combined exponential-backoff-plus-token-bucket limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// MinRetryDelay is the backoff delay for the first retry.
    pub min_retry_delay: Duration,
    /// MaxRetryDelay caps the exponential backoff.
    pub max_retry_delay: Duration,
    /// RatePerSecond is the steady-state token refill rate.
    pub rate_per_second: f64,
    /// Burst is the token bucket's capacity.
    pub burst: u32,
    /// MaxRetries is the number of `AddRateLimited` calls an item tolerates before it is
    /// dropped rather than requeued.
    pub max_retries: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_secs(1000),
            rate_per_second: 10.0,
            burst: 100,
            max_retries: 15,
        }
    }
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        Self {
            capacity: burst as f64,
            tokens: burst as f64,
            rate,
            last: Instant::now(),
        }
    }

    /// Delay_for_one returns how long to wait before one more token is available, consuming it
    /// immediately if one is already on hand.
    fn delay_for_one(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            let need = 1.0 - self.tokens;
            self.tokens = 0.0;
            Duration::from_secs_f64(need / self.rate)
        }
    }
}

fn exponential_delay(cfg: &RateLimiterConfig, retries: u32) -> Duration {
    let millis = cfg.min_retry_delay.as_millis() as f64 * 2f64.powi(retries as i32);
    let millis = millis.min(cfg.max_retry_delay.as_millis() as f64);
    Duration::from_millis(millis as u64)
}

struct QueueState {
    queue: DelayQueue<ObjectIdentifiers>,
    keys: HashMap<ObjectIdentifiers, delay_queue::Key>,
    retries: HashMap<ObjectIdentifiers, u32>,
    processing: HashSet<ObjectIdentifiers>,
    dirty: HashSet<ObjectIdentifiers>,
    bucket: TokenBucket,
}

/// RateLimitingQueue is a `tokio_util::time::DelayQueue`-backed workqueue combining
/// exponential-backoff-per-item retry delay with a shared token bucket, modeled on
/// `kube::runtime::scheduler::Scheduler` (the same delay-queue primitive `kube-runtime` itself
/// uses for controller requeues) plus client-go's rate-limiting workqueue semantics.
pub struct RateLimitingQueue {
    state: Mutex<QueueState>,
    cfg: RateLimiterConfig,
}

impl RateLimitingQueue {
    /// New builds an empty queue with the given limiter configuration.
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let bucket = TokenBucket::new(cfg.rate_per_second, cfg.burst);
        Self {
            state: Mutex::new(QueueState {
                queue: DelayQueue::new(),
                keys: HashMap::new(),
                retries: HashMap::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                bucket,
            }),
            cfg,
        }
    }

    async fn insert_at(&self, item: ObjectIdentifiers, delay: Duration) {
        let mut state = self.state.lock().await;
        if state.processing.contains(&item) {
            state.dirty.insert(item);
            return;
        }
        if let Some(key) = state.keys.remove(&item) {
            state.queue.remove(&key);
        }
        let key = state.queue.insert(item.clone(), delay);
        state.keys.insert(item, key);
    }

    /// Add enqueues `item` for immediate processing, without rate limiting.
    pub async fn add(&self, item: ObjectIdentifiers) {
        self.insert_at(item, Duration::ZERO).await;
    }

    /// Add_after enqueues `item` to become ready after `delay`, without consuming a retry.
    pub async fn add_after(&self, item: ObjectIdentifiers, delay: Duration) {
        self.insert_at(item, delay).await;
    }

    /// Add_rate_limited enqueues `item` after a delay derived from exponential backoff and the
    /// shared token bucket, whichever is longer. Returns `false` (and does not requeue) once
    /// `max_retries` has been exceeded.
    pub async fn add_rate_limited(&self, item: ObjectIdentifiers) -> bool {
        let delay = {
            let mut state = self.state.lock().await;
            let retries = state.retries.entry(item.clone()).or_insert(0);
            *retries += 1;
            if *retries > self.cfg.max_retries {
                state.retries.remove(&item);
                return false;
            }
            let backoff = exponential_delay(&self.cfg, *retries - 1);
            let bucket_delay = state.bucket.delay_for_one();
            backoff.max(bucket_delay)
        };
        self.insert_at(item, delay).await;
        true
    }

    /// Forget clears the retry count tracked for `item`, as if it had never failed.
    pub async fn forget(&self, item: &ObjectIdentifiers) {
        self.state.lock().await.retries.remove(item);
    }

    /// Len reports the number of items currently waiting (scheduled or in-flight).
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.keys.len() + state.processing.len()
    }

    /// Next pops the next ready item, blocking until one becomes ready, and marks it as
    /// in-flight so a concurrent `add*` for the same key is deferred rather than dropped.
    pub async fn next(&self) -> ObjectIdentifiers {
        let expired = poll_fn(|cx| {
            let mut state = match self.state.try_lock() {
                Ok(s) => s,
                Err(_) => return std::task::Poll::Pending,
            };
            state.queue.poll_expired(cx)
        })
        .await;
        let item = expired.expect("DelayQueue never closes").into_inner();
        let mut state = self.state.lock().await;
        state.keys.remove(&item);
        state.processing.insert(item.clone());
        item
    }

    /// Done marks `item` as no longer in-flight. If an `add*` arrived for it while it was being
    /// processed, it is re-added for immediate processing.
    pub async fn done(&self, item: &ObjectIdentifiers) {
        let requeue = {
            let mut state = self.state.lock().await;
            state.processing.remove(item);
            state.dirty.remove(item)
        };
        if requeue {
            self.add(item.clone()).await;
        }
    }
}

struct Informer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Dmc is the Dynamic Multiplexing Controller: one informer per registered GVR feeding a single
/// shared [`RateLimitingQueue`], drained by a fixed pool of workers that dispatch to the
/// per-GVR [`Handler`].
pub struct Dmc {
    client: kube::Client,
    handlers: DashMap<Gvr, Handler>,
    informers: DashMap<Gvr, Informer>,
    queue: Arc<RateLimitingQueue>,
    workers: usize,
    generations: Arc<DashMap<(Gvr, String), i64>>,
    metrics: crate::metrics::DmcMetrics,
}

impl Dmc {
    /// New builds a DMC with no GVRs registered yet.
    pub fn new(
        client: kube::Client,
        workers: usize,
        limiter: RateLimiterConfig,
        metrics: crate::metrics::DmcMetrics,
    ) -> Self {
        Self {
            client,
            handlers: DashMap::new(),
            informers: DashMap::new(),
            queue: Arc::new(RateLimitingQueue::new(limiter)),
            workers,
            generations: Arc::new(DashMap::new()),
            metrics,
        }
    }

    fn api_resource(gvr: &Gvr, kind: &str) -> ApiResource {
        ApiResource {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            api_version: if gvr.group.is_empty() {
                gvr.version.clone()
            } else {
                format!("{}/{}", gvr.group, gvr.version)
            },
            kind: kind.to_string(),
            plural: gvr.resource.clone(),
        }
    }

    /// Start_serving_gvk registers `handler` for `gvr`/`kind`, starting a new informer if the
    /// GVR is not already served, or, if it is, replacing the handler in place and re-enqueuing
    /// every currently cached object so the new handler reconciles existing instances.
    ///
    /// The informer and the re-enqueue list both watch/list across every namespace: a parent
    /// instance kind lives in an arbitrary, unbounded set of namespaces, so there is no single
    /// namespace to scope an `Api` to, whether or not the kind is itself namespaced.
    #[instrument(skip(self, handler), fields(gvr = ?gvr))]
    pub async fn start_serving_gvk(&self, gvr: Gvr, kind: &str, handler: Handler) -> Result<()> {
        if self.informers.contains_key(&gvr) {
            self.handlers.insert(gvr.clone(), handler);
            // Re-enqueue every cached object so the newly installed handler sees them.
            let ar = Self::api_resource(&gvr, kind);
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
            if let Ok(list) = api.list(&Default::default()).await {
                for obj in list.items {
                    let key = ObjectIdentifiers::new(
                        obj.metadata.namespace.as_deref(),
                        obj.metadata.name.as_deref().unwrap_or_default(),
                        gvr.clone(),
                    );
                    self.queue.add(key).await;
                    self.metrics.queue_depth.increment(1.0);
                }
            }
            return Ok(());
        }

        self.handlers.insert(gvr.clone(), handler);

        let ar = Self::api_resource(&gvr, kind);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let cancel = CancellationToken::new();
        let queue = self.queue.clone();
        let informer_gvr = gvr.clone();
        let stop = cancel.clone();
        let generations = self.generations.clone();
        let metrics = self.metrics.clone();

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(async move {
            let mut stream = std::pin::pin!(watcher::watcher(api, watcher::Config::default()));
            let mut ready_tx = Some(ready_tx);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(gvr = ?informer_gvr, "informer stopping");
                        return;
                    }
                    next = stream.next() => {
                        match next {
                            None => return,
                            Some(Ok(Event::InitDone)) => {
                                if let Some(tx) = ready_tx.take() {
                                    let _ = tx.send(());
                                }
                            }
                            Some(Ok(Event::Init)) | Some(Ok(Event::InitApply(_))) => {}
                            Some(Ok(Event::Apply(obj))) => {
                                let name = obj.metadata.name.as_deref().unwrap_or_default();
                                let gen_key = (informer_gvr.clone(), match obj.metadata.namespace.as_deref() {
                                    Some(ns) => format!("{ns}/{name}"),
                                    None => name.to_string(),
                                });
                                let generation = obj.metadata.generation.unwrap_or_default();
                                let unchanged = generations
                                    .get(&gen_key)
                                    .is_some_and(|prev| *prev == generation);
                                generations.insert(gen_key, generation);
                                if unchanged {
                                    trace!(gvr = ?informer_gvr, name, "dropping update with unchanged generation");
                                    continue;
                                }
                                let key = ObjectIdentifiers::new(
                                    obj.metadata.namespace.as_deref(),
                                    name,
                                    informer_gvr.clone(),
                                );
                                queue.add(key).await;
                                metrics.queue_depth.increment(1.0);
                            }
                            Some(Ok(Event::Delete(obj))) => {
                                let name = obj.metadata.name.as_deref().unwrap_or_default();
                                let gen_key = (informer_gvr.clone(), match obj.metadata.namespace.as_deref() {
                                    Some(ns) => format!("{ns}/{name}"),
                                    None => name.to_string(),
                                });
                                generations.remove(&gen_key);
                                let key = ObjectIdentifiers::new(
                                    obj.metadata.namespace.as_deref(),
                                    name,
                                    informer_gvr.clone(),
                                );
                                queue.add(key).await;
                                metrics.queue_depth.increment(1.0);
                            }
                            Some(Err(err)) => {
                                warn!(gvr = ?informer_gvr, error = %err, "watcher error");
                            }
                        }
                    }
                }
            }
        });

        // Wait for cache sync, but do not block forever if the stream never reports InitDone
        // (e.g. it errored before completing its first list).
        let _ = tokio::time::timeout(Duration::from_secs(60), ready_rx).await;

        self.informers.insert(gvr, Informer { cancel, task });
        self.metrics.informers.increment(1.0);
        Ok(())
    }

    /// Stop_serving_gvk cancels the informer for `gvr`, waits for it to drain, and removes its
    /// handler. No-op if `gvr` is not currently served.
    #[instrument(skip(self), fields(gvr = ?gvr))]
    pub async fn stop_serving_gvk(&self, gvr: &Gvr) -> Result<()> {
        if let Some((_, informer)) = self.informers.remove(gvr) {
            informer.cancel.cancel();
            let _ = informer.task.await;
            self.metrics.informers.decrement(1.0);
        }
        self.handlers.remove(gvr);
        Ok(())
    }

    /// Run drains the queue with `self.workers` concurrent workers until `cancel` fires, then
    /// waits (bounded by `shutdown_timeout`) for in-flight work to finish.
    #[instrument(skip(self, cancel))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, shutdown_timeout: Duration) -> Result<()> {
        info!(workers = self.workers, "starting dynamic multiplexing controller");
        let mut set = tokio::task::JoinSet::new();
        for id in 0..self.workers {
            let dmc = self.clone();
            let stop = cancel.clone();
            set.spawn(async move { dmc.worker(id, stop).await });
        }
        cancel.cancelled().await;
        info!("dmc shutting down, stopping informers");
        for gvr in self.informers.iter().map(|e| e.key().clone()).collect::<Vec<_>>() {
            let _ = self.stop_serving_gvk(&gvr).await;
        }
        if tokio::time::timeout(shutdown_timeout, async {
            while set.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            error!("dmc workers did not stop within the shutdown timeout");
            return Err(Error::Other(anyhow::anyhow!(
                "dmc graceful shutdown timed out"
            )));
        }
        Ok(())
    }

    async fn worker(self: Arc<Self>, id: usize, cancel: CancellationToken) {
        trace!(id, "worker started");
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = self.queue.next() => item,
            };
            self.metrics.queue_depth.decrement(1.0);
            let gvr = item.gvr.clone();
            let handler = self.handlers.get(&gvr).map(|h| h.clone());
            let Some(handler) = handler else {
                warn!(?gvr, "no handler registered for GVR, dropping item");
                self.queue.done(&item).await;
                continue;
            };
            let outcome = handler(item.clone()).await;
            match outcome {
                Ok(HandlerOutcome::Done) => self.queue.forget(&item).await,
                Ok(HandlerOutcome::NoRequeue) => self.queue.forget(&item).await,
                Ok(HandlerOutcome::RequeueNeeded) => {
                    self.queue.add(item.clone()).await;
                    self.metrics.queue_depth.increment(1.0);
                }
                Ok(HandlerOutcome::RequeueNeededAfter(d)) => {
                    self.queue.add_after(item.clone(), d).await;
                    self.metrics.queue_depth.increment(1.0);
                }
                Err(err) => {
                    error!(?gvr, error = %err, "handler error");
                    if self.queue.add_rate_limited(item.clone()).await {
                        self.metrics.queue_depth.increment(1.0);
                    } else {
                        warn!(?gvr, namespaced_key = %item.namespaced_key, "dropping item after exceeding max retries");
                    }
                }
            }
            self.queue.done(&item).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvr() -> Gvr {
        Gvr {
            group: "kro.run".into(),
            version: "v1alpha1".into(),
            resource: "webapps".into(),
        }
    }

    #[tokio::test]
    async fn add_then_next_round_trips() {
        let queue = RateLimitingQueue::new(RateLimiterConfig::default());
        let item = ObjectIdentifiers::new(Some("default"), "a", gvr());
        queue.add(item.clone()).await;
        let got = queue.next().await;
        assert_eq!(got, item);
        queue.done(&item).await;
    }

    #[tokio::test]
    async fn rate_limited_item_dropped_after_max_retries() {
        let cfg = RateLimiterConfig {
            min_retry_delay: Duration::from_millis(0),
            max_retry_delay: Duration::from_millis(0),
            rate_per_second: 1_000_000.0,
            burst: 1_000_000,
            max_retries: 2,
            ..RateLimiterConfig::default()
        };
        let queue = RateLimitingQueue::new(cfg);
        let item = ObjectIdentifiers::new(None, "a", gvr());
        assert!(queue.add_rate_limited(item.clone()).await);
        assert!(queue.add_rate_limited(item.clone()).await);
        assert!(!queue.add_rate_limited(item.clone()).await);
    }

    #[tokio::test]
    async fn add_while_processing_requeues_on_done() {
        let queue = RateLimitingQueue::new(RateLimiterConfig::default());
        let item = ObjectIdentifiers::new(None, "a", gvr());
        queue.add(item.clone()).await;
        let got = queue.next().await;
        assert_eq!(got, item);
        // Simulate a watch event arriving while the worker is still processing `item`.
        queue.add(item.clone()).await;
        queue.done(&item).await;
        let got = queue.next().await;
        assert_eq!(got, item);
    }
}
