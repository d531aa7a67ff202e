use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use vigil_core::backoff::Backoff;
use vigil_core::{CachedObject, ChangeEvent, ChangeSource, ObjectKey, SourceError, WatchEvent, WatchStream};

use crate::cache::Indexer;
use crate::lister::Lister;

/// Called on the informer task for every cache change, after the cache was updated.
pub trait EventHandler<T>: Send + Sync {
    fn on_change(&self, event: &ChangeEvent<T>);
}

impl<T, F> EventHandler<T> for F
where
    F: Fn(&ChangeEvent<T>) + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent<T>) { self(event) }
}

#[derive(Debug, Clone)]
pub struct InformerOptions {
    /// Redeliver every cached object as an unchanged update at this interval.
    pub resync_period: Option<Duration>,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for InformerOptions {
    fn default() -> Self {
        Self { resync_period: None, reconnect_base: Duration::from_millis(800), reconnect_max: Duration::from_secs(30) }
    }
}

/// Observes whether an informer has applied its first full list.
#[derive(Clone)]
pub struct SyncSignal {
    rx: watch::Receiver<bool>,
}

impl SyncSignal {
    pub fn has_synced(&self) -> bool { *self.rx.borrow() }

    /// Wait until synced. Returns false if `stop` fires or the informer is gone first.
    pub async fn wait(&self, stop: &CancellationToken) -> bool {
        let mut rx = self.rx.clone();
        tokio::select! {
            res = rx.wait_for(|synced| *synced) => res.is_ok(),
            _ = stop.cancelled() => false,
        }
    }
}

/// Keeps an [`Indexer`] in sync with a [`ChangeSource`] and fans changes out to handlers.
///
/// Handlers run one at a time on the informer task, in stream order.
pub struct Informer<T> {
    kind: String,
    source: Arc<dyn ChangeSource<T>>,
    indexer: Indexer<T>,
    handlers: Vec<Arc<dyn EventHandler<T>>>,
    synced_tx: watch::Sender<bool>,
    opts: InformerOptions,
    span: Span,
}

impl<T: Send + Sync + 'static> Informer<T> {
    pub fn new(kind: impl Into<String>, source: Arc<dyn ChangeSource<T>>, opts: InformerOptions) -> Self {
        let kind = kind.into();
        let (synced_tx, _) = watch::channel(false);
        let span = info_span!("informer", kind = %kind);
        Self { indexer: Indexer::new(kind.clone()), kind, source, handlers: Vec::new(), synced_tx, opts, span }
    }

    pub fn kind(&self) -> &str { &self.kind }

    pub fn add_event_handler(&mut self, handler: impl EventHandler<T> + 'static) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn lister(&self) -> Lister<T> { self.indexer.lister() }

    pub fn sync_signal(&self) -> SyncSignal { SyncSignal { rx: self.synced_tx.subscribe() } }

    pub fn has_synced(&self) -> bool { *self.synced_tx.borrow() }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<CachedObject<T>> { self.indexer.get_by_key(key) }

    /// Run until `stop` fires.
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        let span = self.span.clone();
        tokio::spawn(self.run(stop).instrument(span))
    }

    async fn run(self, stop: CancellationToken) {
        info!("informer started");
        let mut backoff = Backoff::new(self.opts.reconnect_base, self.opts.reconnect_max);
        let mut resync = self.opts.resync_period.filter(|p| !p.is_zero()).map(|p| tokio::time::interval_at(Instant::now() + p, p));
        'connect: loop {
            let mut stream: WatchStream<T> = self.source.watch();
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => break 'connect,
                    _ = tick(&mut resync) => {
                        self.resync();
                        continue;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(ev)) => {
                        backoff.reset();
                        self.apply(ev);
                    }
                    Some(Err(e)) => {
                        self.on_error(&e);
                        if !pause(backoff.next_delay(), &stop).await {
                            break 'connect;
                        }
                    }
                    None => {
                        warn!("watch stream ended; reconnecting");
                        if !pause(backoff.next_delay(), &stop).await {
                            break 'connect;
                        }
                        continue 'connect;
                    }
                }
            }
        }
        info!("informer stopped");
    }

    fn on_error(&self, e: &SourceError) {
        counter!("informer_watch_errors_total", 1u64, "kind" => self.kind.clone());
        warn!(error = %e, synced = self.has_synced(), "watch error; backing off");
    }

    fn apply(&self, ev: WatchEvent<T>) {
        match ev {
            WatchEvent::Restarted(list) => {
                let count = list.len();
                let events = self.indexer.replace(list);
                self.dispatch(&events);
                if !self.has_synced() {
                    self.synced_tx.send_replace(true);
                    info!(count, "cache synced");
                } else {
                    debug!(count, "relisted");
                }
            }
            WatchEvent::Applied(obj) => {
                let ev = self.indexer.upsert(obj);
                self.dispatch(std::slice::from_ref(&ev));
            }
            WatchEvent::Deleted(obj) => {
                let ev = self.indexer.delete(obj);
                self.dispatch(std::slice::from_ref(&ev));
            }
        }
    }

    fn resync(&self) {
        if !self.has_synced() {
            return;
        }
        let events = self.indexer.resync();
        debug!(count = events.len(), "periodic resync");
        self.dispatch(&events);
    }

    fn dispatch(&self, events: &[ChangeEvent<T>]) {
        for ev in events {
            counter!("informer_events_total", 1u64, "kind" => self.kind.clone(), "event" => ev.verb());
            for h in &self.handlers {
                // A failing handler must not take the informer down with it.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| h.on_change(ev))) {
                    counter!("informer_handler_panics_total", 1u64, "kind" => self.kind.clone());
                    error!(key = %ev.key(), event = ev.verb(), panic = panic_message(payload.as_ref()), "event handler panicked");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic")
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Sleep for `delay` unless stopped first. Returns false when stopped.
async fn pause(delay: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stop.cancelled() => false,
    }
}

type Feed<T> = mpsc::UnboundedReceiver<Result<WatchEvent<T>, SourceError>>;
pub type FeedSender<T> = mpsc::UnboundedSender<Result<WatchEvent<T>, SourceError>>;

/// In-process change source fed through channels; useful for replaying recorded events.
///
/// Each `watch` call takes the oldest unused feed. Closing a feed's sender ends that
/// stream, and the informer reconnects to the next feed. Once every feed is used up,
/// `watch` returns a stream that never yields.
pub struct ChannelSource<T> {
    feeds: Mutex<VecDeque<Feed<T>>>,
}

impl<T: Send + Sync + 'static> ChannelSource<T> {
    pub fn new() -> (Self, FeedSender<T>) {
        let source = Self { feeds: Mutex::new(VecDeque::new()) };
        let tx = source.add_feed();
        (source, tx)
    }

    /// Queue another feed, served to the next reconnect.
    pub fn add_feed(&self) -> FeedSender<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner).push_back(rx);
        tx
    }
}

impl<T: Send + Sync + 'static> ChangeSource<T> for ChannelSource<T> {
    fn watch(&self) -> WatchStream<T> {
        let next = self.feeds.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        match next {
            Some(mut rx) => futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed(),
            None => futures::stream::pending::<Result<WatchEvent<T>, SourceError>>().boxed(),
        }
    }
}
