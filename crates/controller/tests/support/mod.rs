#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use vigil_controller::{ManagerConfig, Reconciler, ResourceController};
use vigil_core::{CachedObject, ObjectKey, SourceError, SyncError, WatchEvent};
use vigil_store::ChannelSource;

pub type Feed = UnboundedSender<Result<WatchEvent<String>, SourceError>>;

/// What the reconciler does on each call, in order; once exhausted every call succeeds.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Ok,
    Fail,
    Panic,
}

#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<(String, Instant)>>>);

impl Calls {
    pub fn keys(&self) -> Vec<String> { self.0.lock().unwrap().iter().map(|(k, _)| k.clone()).collect() }
    pub fn times(&self) -> Vec<Instant> { self.0.lock().unwrap().iter().map(|(_, t)| *t).collect() }
    pub fn len(&self) -> usize { self.0.lock().unwrap().len() }
}

pub struct Scripted {
    steps: Mutex<VecDeque<Step>>,
    calls: Calls,
}

impl Scripted {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> (Self, Calls) {
        let calls = Calls::default();
        (Self { steps: Mutex::new(steps.into_iter().collect()), calls: calls.clone() }, calls)
    }
}

#[async_trait::async_trait]
impl Reconciler<String> for Scripted {
    fn kind(&self) -> &'static str { "pod" }

    async fn reconcile(&self, obj: &CachedObject<String>) -> Result<(), SyncError> {
        self.calls.0.lock().unwrap().push((obj.key.to_string(), Instant::now()));
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Ok);
        match step {
            Step::Ok => Ok(()),
            Step::Fail => Err(SyncError::transient("backend unavailable")),
            Step::Panic => panic!("reconciler blew up on {}", obj.key),
        }
    }
}

pub fn pod(name: &str, rv: &str) -> CachedObject<String> {
    CachedObject::new(ObjectKey::namespaced("ns1", name), rv, format!("{name}@{rv}"))
}

pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        sync_timeout: Duration::from_secs(5),
        queue_base_delay: Duration::from_millis(10),
        queue_max_delay: Duration::from_secs(1),
        worker_restart: Duration::from_millis(20),
        ..ManagerConfig::default()
    }
}

pub fn controller(steps: impl IntoIterator<Item = Step>, config: &ManagerConfig) -> (ResourceController<String, Scripted>, Feed, Calls) {
    let (source, feed) = ChannelSource::new();
    let (reconciler, calls) = Scripted::new(steps);
    (ResourceController::new(Arc::new(source), reconciler, config), feed, calls)
}

/// Poll `cond` until it holds, panicking after `limit`.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached within {limit:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
