use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument, Span};
use vigil_core::{CachedObject, ChangeEvent, ChangeSource, ObjectKey, Selector, SyncOutcome, SyncResult, Tombstone};
use vigil_queue::WorkQueue;
use vigil_store::{Informer, Lister, SyncSignal};

use crate::reconciler::Reconciler;
use crate::ManagerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("{kind}: timed out after {timeout:?} waiting for caches to sync")]
    CacheSyncTimeout { kind: &'static str, timeout: Duration },
    #[error("{kind}: stopped before caches synced")]
    Stopped { kind: &'static str },
    #[error("{kind}: controller already started")]
    AlreadyStarted { kind: &'static str },
}

/// Informer, lister and work queue for one kind, wired so that every relevant cache
/// change ends up as a queued key.
pub struct ResourceController<T, R> {
    kind: &'static str,
    informer: Mutex<Option<Informer<T>>>,
    synced: SyncSignal,
    lister: Lister<T>,
    queue: WorkQueue<String>,
    reconciler: Arc<R>,
    sync_timeout: Duration,
    span: Span,
}

impl<T, R> ResourceController<T, R>
where
    T: Send + Sync + 'static,
    R: Reconciler<T>,
{
    pub fn new(source: Arc<dyn ChangeSource<T>>, reconciler: R, config: &ManagerConfig) -> Self {
        let reconciler = Arc::new(reconciler);
        let kind = reconciler.kind();
        let queue = WorkQueue::new(kind, config.rate_limiter());
        let mut informer = Informer::new(kind, source, config.informer_options());
        let (q, r) = (queue.clone(), Arc::clone(&reconciler));
        informer.add_event_handler(move |ev: &ChangeEvent<T>| enqueue(&q, r.as_ref(), ev));
        Self {
            kind,
            synced: informer.sync_signal(),
            lister: informer.lister(),
            informer: Mutex::new(Some(informer)),
            queue,
            reconciler,
            sync_timeout: config.sync_timeout,
            span: info_span!("controller", kind),
        }
    }

    pub fn kind(&self) -> &'static str { self.kind }

    pub fn queue(&self) -> &WorkQueue<String> { &self.queue }

    pub fn lister(&self) -> Lister<T> { self.lister.clone() }

    pub fn has_synced(&self) -> bool { self.synced.has_synced() }

    pub fn summarize(&self, obj: &CachedObject<T>) -> String { self.reconciler.summarize(obj) }

    /// Start the informer and wait for its first full list.
    ///
    /// The work queue is shut down once `stop` fires, which releases idle workers.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), ControllerError> {
        let informer = self.informer.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(informer) = informer else {
            return Err(ControllerError::AlreadyStarted { kind: self.kind });
        };
        let informer_task = informer.spawn(stop.clone());
        tokio::spawn(watch_informer(self.kind, informer_task, stop.clone()).instrument(self.span.clone()));
        let queue = self.queue.clone();
        let on_stop = stop.clone();
        tokio::spawn(async move {
            on_stop.cancelled().await;
            queue.shut_down();
        });

        async {
            info!(timeout = ?self.sync_timeout, "sync start");
            match tokio::time::timeout(self.sync_timeout, self.synced.wait(&stop)).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(ControllerError::Stopped { kind: self.kind }),
                Err(_) => Err(ControllerError::CacheSyncTimeout { kind: self.kind, timeout: self.sync_timeout }),
            }
        }
        .instrument(self.span.clone())
        .await
    }

    pub fn worker(&self) -> Worker<T, R> {
        Worker { kind: self.kind, queue: self.queue.clone(), lister: self.lister.clone(), reconciler: Arc::clone(&self.reconciler) }
    }

    /// Log every cached object once. Returns how many were logged.
    pub fn log_cached(&self) -> usize {
        let _g = self.span.enter();
        let objs = self.lister.list(&Selector::everything());
        for o in &objs {
            info!(key = %o.key, version = %o.resource_version, summary = %self.reconciler.summarize(o), "cached object");
        }
        info!(count = objs.len(), "listed cache");
        objs.len()
    }
}

/// Report an informer that ends before `stop`: its cache stops changing from then on.
async fn watch_informer(kind: &'static str, task: JoinHandle<()>, stop: CancellationToken) {
    match task.await {
        Ok(()) if stop.is_cancelled() => debug!("informer finished"),
        Ok(()) => error!(kind, "informer exited before stop; cache is no longer updated"),
        Err(e) => {
            counter!("informer_task_failures_total", 1u64, "kind" => kind);
            error!(kind, error = %e, "informer task failed; cache is no longer updated");
        }
    }
}

/// Event handler body: log the change and queue the key, skipping unchanged updates.
fn enqueue<T, R>(queue: &WorkQueue<String>, reconciler: &R, ev: &ChangeEvent<T>)
where
    T: Send + Sync + 'static,
    R: Reconciler<T>,
{
    match ev {
        ChangeEvent::Added(obj) => {
            info!(key = %obj.key, summary = %reconciler.summarize(obj), "CREATED");
        }
        ChangeEvent::Updated { old, new } => {
            // Resyncs and relists redeliver objects that did not change.
            if old.same_version(new) {
                return;
            }
            info!(key = %new.key, from = %old.resource_version, to = %new.resource_version, summary = %reconciler.summarize(new), "UPDATED");
        }
        ChangeEvent::Deleted(t) => {
            let unknown = matches!(t, Tombstone::FinalStateUnknown { .. });
            info!(key = %t.key(), final_state_unknown = unknown, summary = %reconciler.summarize(t.last_known()), "DELETED");
        }
    }
    queue.add_rate_limited(ev.key().to_string());
}

/// Calls `done` for the key when dropped, including while unwinding from a panic.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<String>,
    key: &'a String,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) { self.queue.done(self.key); }
}

/// Pulls keys off a controller's queue and reconciles them one at a time.
pub struct Worker<T, R> {
    kind: &'static str,
    queue: WorkQueue<String>,
    lister: Lister<T>,
    reconciler: Arc<R>,
}

impl<T, R> Worker<T, R>
where
    T: Send + Sync + 'static,
    R: Reconciler<T>,
{
    /// Process keys until `stop` fires or the queue shuts down.
    pub async fn run(self, stop: CancellationToken) {
        info!("worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = self.queue.get() => next,
            };
            let Some(key) = next else { break };
            self.process(key).await;
        }
        info!("worker shutting down");
    }

    async fn process(&self, key: String) {
        let _done = DoneGuard { queue: &self.queue, key: &key };
        let started = Instant::now();
        let res = self.sync(&key).await;
        histogram!("controller_sync_duration_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => self.kind);
        match res {
            Ok(outcome) => {
                self.queue.forget(&key);
                counter!("controller_syncs_total", 1u64, "kind" => self.kind, "result" => outcome_label(outcome));
                info!(key = %key, ?outcome, "Successfully synced");
            }
            Err(e) if !e.is_retryable() => {
                self.queue.forget(&key);
                counter!("controller_syncs_total", 1u64, "kind" => self.kind, "result" => "invalid");
                error!(key = %key, error = %e, "dropping key that cannot succeed");
            }
            Err(e) => {
                counter!("controller_syncs_total", 1u64, "kind" => self.kind, "result" => "error");
                error!(key = %key, reason = %e, retries = self.queue.num_requeues(&key), "sync error");
                self.queue.add_rate_limited(key.clone());
            }
        }
    }

    /// Reconcile the cached state of `key`.
    pub async fn sync(&self, key: &str) -> SyncResult {
        let key = ObjectKey::parse(key)?;
        let Some(obj) = self.lister.get_by_key(&key) else {
            info!(key = %key, "no longer in cache; nothing to do");
            return Ok(SyncOutcome::NotFound);
        };
        debug!(key = %key, version = %obj.resource_version, "reconciling");
        self.reconciler.reconcile(&obj).await?;
        Ok(SyncOutcome::Synced)
    }
}

fn outcome_label(outcome: SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Synced => "synced",
        SyncOutcome::NotFound => "not_found",
    }
}

/// Launch a worker as its own task, instrumented with a per-worker span.
pub(crate) fn spawn_worker<T, R>(worker: Worker<T, R>, id: usize, stop: CancellationToken) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    R: Reconciler<T>,
{
    let span = info_span!("worker", kind = worker.kind, id);
    tokio::spawn(worker.run(stop).instrument(span))
}
