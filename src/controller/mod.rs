//! Worker pool and sync coordinator
//!
//! A [`Controller`] starts the informer, waits (bounded) for the first full
//! listing, then runs N workers that drain the queue into the handler. Keys
//! that fail are requeued with backoff up to `max_retries` times.

pub mod context;
pub mod handler;
pub mod state;

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, RetryConfig};
use crate::error::{ControllerError, HandlerError, RetryableError};
use crate::informer::Informer;
use crate::models::Resource;
use crate::otel::ReconcileOutcome;
use crate::source::RemoteSource;
use crate::translator::EventTranslator;

pub use context::Context;
pub use handler::{Handler, LoggingHandler};
pub use state::ControllerState;
use state::StateCell;

enum SyncWait {
    Synced,
    TimedOut,
    Cancelled,
}

/// Level-triggered controller over one remote collection
pub struct Controller<K: Resource> {
    ctx: Context<K>,
    informer: Arc<Informer<K>>,
    max_retries: u32,
    sync_timeout: Duration,
    state: StateCell,
}

impl<K: Resource> Controller<K> {
    /// Wire an informer on `source` into the context's cache and queue
    pub fn new(
        source: Arc<dyn RemoteSource<K>>,
        ctx: Context<K>,
        config: &ControllerConfig,
        relist: RetryConfig,
    ) -> Self {
        let mut informer = Informer::new(source, Arc::clone(&ctx.cache), relist);
        informer.add_event_handler(Arc::new(EventTranslator::new(
            ctx.queue.clone(),
            config.suppress_unchanged_updates,
        )));
        if let Some(metrics) = &ctx.metrics {
            informer = informer.with_metrics(Arc::clone(metrics));
        }

        Self {
            ctx,
            informer: Arc::new(informer),
            max_retries: config.max_retries,
            sync_timeout: config.sync_timeout(),
            state: StateCell::new(),
        }
    }

    /// Whether the first full listing has been applied to the cache
    pub fn has_synced(&self) -> bool {
        self.informer.has_synced()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ControllerState {
        self.state.get()
    }

    /// The shared cache, queue and handler
    pub fn context(&self) -> &Context<K> {
        &self.ctx
    }

    /// Run until `cancel` fires
    ///
    /// Workers start only after the cache has synced. Returns
    /// [`ControllerError::SyncTimeout`] if the first listing does not complete
    /// within the configured timeout; no worker is started in that case. A
    /// controller runs at most once.
    pub async fn run(&self, workers: usize, cancel: CancellationToken) -> Result<(), ControllerError> {
        self.state
            .transition(ControllerState::Created, ControllerState::Syncing)
            .map_err(|_| ControllerError::AlreadyStarted)?;

        let workers = workers.max(1);
        info!(workers, "Starting controller");

        let feed_cancel = cancel.child_token();
        let feed = {
            let informer = Arc::clone(&self.informer);
            let token = feed_cancel.clone();
            tokio::spawn(async move { informer.run(token).await })
        };

        match self.wait_for_sync(&cancel).await {
            SyncWait::Synced => {}
            SyncWait::TimedOut => {
                error!(
                    timeout_secs = self.sync_timeout.as_secs(),
                    "Timed out waiting for caches to sync"
                );
                self.stop(feed_cancel, feed, Vec::new()).await;
                return Err(ControllerError::SyncTimeout(self.sync_timeout.as_secs()));
            }
            SyncWait::Cancelled => {
                info!("Shutdown requested before caches synced");
                self.state.set(ControllerState::Draining);
                self.stop(feed_cancel, feed, Vec::new()).await;
                return Ok(());
            }
        }

        self.state.set(ControllerState::Running);
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| {
                let ctx = self.ctx.clone();
                let max_retries = self.max_retries;
                tokio::spawn(async move { run_worker(ctx, id, max_retries).await })
            })
            .collect();
        info!(workers, "Started workers");

        cancel.cancelled().await;

        info!("Shutting down workers");
        self.state.set(ControllerState::Draining);
        self.stop(feed_cancel, feed, handles).await;

        Ok(())
    }

    async fn wait_for_sync(&self, cancel: &CancellationToken) -> SyncWait {
        let mut synced = self.informer.synced();
        tokio::select! {
            _ = cancel.cancelled() => SyncWait::Cancelled,
            waited = tokio::time::timeout(self.sync_timeout, synced.wait_for(|s| *s)) => match waited {
                Ok(Ok(_)) => SyncWait::Synced,
                // Sender lives as long as the informer, which we hold
                Ok(Err(_)) => SyncWait::Cancelled,
                Err(_) => SyncWait::TimedOut,
            },
        }
    }

    /// Stop the informer and the queue, then join every task
    async fn stop(
        &self,
        feed_cancel: CancellationToken,
        feed: JoinHandle<()>,
        workers: Vec<JoinHandle<()>>,
    ) {
        feed_cancel.cancel();
        self.ctx.queue.shut_down();

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        if let Err(e) = feed.await {
            error!(error = %e, "Informer task failed");
        }

        self.state.set(ControllerState::Stopped);
        info!("Controller stopped");
    }
}

async fn run_worker<K: Resource>(ctx: Context<K>, id: usize, max_retries: u32) {
    debug!(worker = id, "Worker started");

    while let Some(key) = ctx.queue.get().await {
        process_key(&ctx, &key, max_retries).await;
        ctx.queue.done(&key);
    }

    debug!(worker = id, "Worker stopped");
}

async fn process_key<K: Resource>(ctx: &Context<K>, key: &str, max_retries: u32) -> ReconcileOutcome {
    let started = Instant::now();
    let result = invoke_handler(Arc::clone(&ctx.handler), key.to_string()).await;
    let elapsed = started.elapsed();

    let outcome = match result {
        Ok(()) => {
            debug!(key, elapsed_ms = elapsed.as_millis() as u64, "Reconciled key");
            ctx.queue.forget(key);
            ReconcileOutcome::Success
        }
        Err(e) => {
            let requeues = ctx.queue.num_requeues(key);
            if e.is_retryable() && requeues < max_retries {
                let delay = ctx.queue.add_rate_limited(key);
                warn!(
                    key,
                    error = %e,
                    attempt = requeues + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Reconcile failed, requeueing"
                );
                ReconcileOutcome::Requeued
            } else {
                error!(
                    key,
                    error = %e,
                    retries = requeues,
                    "Dropping key out of the queue"
                );
                ctx.queue.forget(key);
                ReconcileOutcome::Dropped
            }
        }
    };

    if let Some(metrics) = &ctx.metrics {
        metrics.record_reconcile(outcome, elapsed.as_secs_f64());
    }
    outcome
}

/// Run the handler in its own task so a panic fails only this attempt
async fn invoke_handler(handler: Arc<dyn Handler>, key: String) -> Result<(), HandlerError> {
    match tokio::spawn(async move { handler.handle(&key).await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(HandlerError::Failed(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
