use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use metrics::counter;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::controller::{spawn_worker, ControllerError, ResourceController};
use crate::kinds::{deployment_controller, node_controller, pod_controller};
use crate::reconciler::Reconciler;
use crate::{ConfigError, ManagerConfig};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Type-erased view of a [`ResourceController`], as driven by the manager.
#[async_trait::async_trait]
pub trait ManagedController: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn start(&self, stop: CancellationToken) -> Result<(), ControllerError>;
    fn log_cached(&self) -> usize;
    fn spawn_worker(&self, id: usize, stop: CancellationToken) -> JoinHandle<()>;
    fn queue_shutting_down(&self) -> bool;
}

#[async_trait::async_trait]
impl<T, R> ManagedController for ResourceController<T, R>
where
    T: Send + Sync + 'static,
    R: Reconciler<T>,
{
    fn kind(&self) -> &'static str { ResourceController::kind(self) }

    async fn start(&self, stop: CancellationToken) -> Result<(), ControllerError> { self.run(stop).await }

    fn log_cached(&self) -> usize { ResourceController::log_cached(self) }

    fn spawn_worker(&self, id: usize, stop: CancellationToken) -> JoinHandle<()> {
        spawn_worker(self.worker(), id, stop)
    }

    fn queue_shutting_down(&self) -> bool { self.queue().is_shutting_down() }
}

/// Owns one controller per kind and runs them until stopped.
pub struct ControllerManager {
    controllers: Vec<Arc<dyn ManagedController>>,
    config: ManagerConfig,
}

impl ControllerManager {
    pub fn new(config: ManagerConfig) -> Self { Self { controllers: Vec::new(), config } }

    /// Node, Pod and Deployment controllers backed by `client`.
    pub fn for_cluster(client: Client, config: ManagerConfig) -> Self {
        let mut mgr = Self::new(config);
        let node = node_controller(client.clone(), &mgr.config);
        let pod = pod_controller(client.clone(), &mgr.config);
        let deploy = deployment_controller(client, &mgr.config);
        mgr.add(node);
        mgr.add(pod);
        mgr.add(deploy);
        mgr
    }

    pub fn config(&self) -> &ManagerConfig { &self.config }

    pub fn add(&mut self, controller: impl ManagedController + 'static) {
        self.controllers.push(Arc::new(controller));
    }

    pub fn kinds(&self) -> Vec<&'static str> { self.controllers.iter().map(|c| c.kind()).collect() }

    /// Start every controller in order, then run `workers` supervised workers per kind
    /// until `stop` fires.
    ///
    /// Startup fails fast: the first controller that cannot sync aborts the run and stops
    /// the ones already started.
    pub async fn run(&self, workers: usize, stop: CancellationToken) -> Result<(), ManagerError> {
        if workers == 0 {
            return Err(ManagerError::NoWorkers);
        }
        self.config.validate()?;
        let stop = stop.child_token();
        info!(kinds = ?self.kinds(), workers, "starting controller manager");
        for ctl in &self.controllers {
            match ctl.start(stop.clone()).await {
                Ok(()) => info!(kind = ctl.kind(), "controller synced"),
                Err(ControllerError::Stopped { kind }) => {
                    info!(kind, "stopped during startup");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "controller failed to start");
                    stop.cancel();
                    return Err(e.into());
                }
            }
            if self.config.list_on_start {
                ctl.log_cached();
            }
        }

        let mut tasks = JoinSet::new();
        for ctl in &self.controllers {
            for id in 0..workers {
                tasks.spawn(supervise(Arc::clone(ctl), id, stop.clone(), self.config.worker_restart));
            }
        }
        info!("workers started");

        stop.cancelled().await;
        info!("shutting down workers");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "worker supervisor failed");
            }
        }
        info!("controller manager stopped");
        Ok(())
    }
}

/// Keep one worker slot alive: relaunch after a panic, or after a return while the
/// controller is still meant to run.
async fn supervise(ctl: Arc<dyn ManagedController>, id: usize, stop: CancellationToken, restart: Duration) {
    let kind = ctl.kind();
    loop {
        match ctl.spawn_worker(id, stop.clone()).await {
            Ok(()) => {
                if stop.is_cancelled() || ctl.queue_shutting_down() {
                    break;
                }
                warn!(kind, worker = id, "worker returned; relaunching");
            }
            Err(e) if e.is_panic() => {
                counter!("controller_worker_restarts_total", 1u64, "kind" => kind);
                error!(kind, worker = id, "worker panicked; relaunching");
            }
            Err(e) => {
                warn!(kind, worker = id, error = %e, "worker task cancelled");
                break;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(restart) => {}
            _ = stop.cancelled() => break,
        }
    }
}
