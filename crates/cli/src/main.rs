use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_controller::kinds::{deployment_controller, node_controller, pod_controller};
use vigil_controller::{ControllerManager, ManagerConfig, Reconciler, ResourceController};
use vigil_core::Selector;

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Watch nodes, pods and deployments and reconcile changes")]
struct Cli {
    /// Path to a kubeconfig (default: in-cluster, then KUBECONFIG / ~/.kube/config)
    #[arg(long, env = "VIGIL_KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Limit pods and deployments to one namespace (default: all namespaces)
    #[arg(long = "namespace", short = 'n', env = "VIGIL_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Seconds to wait for each cache to sync
    #[arg(long, env = "VIGIL_SYNC_TIMEOUT_SECS", default_value_t = 120, global = true)]
    sync_timeout_secs: u64,

    /// Redeliver every cached object at this interval (0 disables)
    #[arg(long, env = "VIGIL_RESYNC_SECS", default_value_t = 0, global = true)]
    resync_secs: u64,

    /// Serve Prometheus metrics on this address, e.g. 0.0.0.0:9000
    #[arg(long, env = "VIGIL_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    /// File/line in log output
    #[arg(long, env = "VIGIL_DEV_MODE", action = ArgAction::SetTrue, global = true)]
    dev_mode: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind { Node, Pod, Deployment }

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Workers per kind
    #[arg(long, env = "VIGIL_WORKERS", default_value_t = 3)]
    workers: usize,
    /// First retry delay for a failing key
    #[arg(long, env = "VIGIL_QUEUE_BASE_DELAY_MS", default_value_t = 5)]
    queue_base_delay_ms: u64,
    /// Retry delay cap for a failing key
    #[arg(long, env = "VIGIL_QUEUE_MAX_DELAY_SECS", default_value_t = 1000)]
    queue_max_delay_secs: u64,
    /// Overall queue rate, keys per second
    #[arg(long, env = "VIGIL_QUEUE_QPS", default_value_t = 10.0, value_parser = positive_rate)]
    queue_qps: f64,
    #[arg(long, env = "VIGIL_QUEUE_BURST", default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
    queue_burst: u32,
    /// Pause before relaunching a crashed worker
    #[arg(long, env = "VIGIL_WORKER_RESTART_MS", default_value_t = 1000)]
    worker_restart_ms: u64,
    /// Log every cached object once caches have synced
    #[arg(long, env = "VIGIL_LIST_ON_START", action = ArgAction::SetTrue)]
    list_on_start: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller manager until interrupted
    Run(RunArgs),
    /// Sync one kind's cache once and print it
    Ls {
        kind: Kind,
        /// Label selector, e.g. "app=web,tier!=db"
        #[arg(short = 'l', long = "selector", default_value = "")]
        selector: String,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
}

impl Cli {
    fn manager_config(&self) -> ManagerConfig {
        let mut cfg = ManagerConfig {
            namespace: self.namespace.clone(),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            resync_period: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            ..ManagerConfig::default()
        };
        if let Commands::Run(args) = &self.command {
            cfg.queue_base_delay = Duration::from_millis(args.queue_base_delay_ms);
            cfg.queue_max_delay = Duration::from_secs(args.queue_max_delay_secs);
            cfg.queue_qps = args.queue_qps;
            cfg.queue_burst = args.queue_burst;
            cfg.worker_restart = Duration::from_millis(args.worker_restart_ms);
            cfg.list_on_start = args.list_on_start;
        }
        cfg
    }
}

fn positive_rate(s: &str) -> Result<f64, String> {
    let qps: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if qps.is_finite() && qps > 0.0 {
        Ok(qps)
    } else {
        Err(format!("{s} is not a positive number"))
    }
}

fn init_tracing(dev_mode: bool) {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(dev_mode)
        .with_line_number(dev_mode)
        .init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match builder.with_http_listener(addr).install() {
        Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// First signal cancels `stop`; a second one exits right away.
fn spawn_signal_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("stop signal received; shutting down (signal again to force)");
        stop.cancel();
        wait_for_signal().await;
        error!("second stop signal; exiting");
        std::process::exit(1);
    });
}

#[derive(Debug, Serialize)]
struct Row {
    key: String,
    version: String,
    labels: BTreeMap<String, String>,
    summary: String,
}

async fn list_kind<T, R>(ctl: ResourceController<T, R>, selector: &Selector) -> Result<Vec<Row>>
where
    T: Send + Sync + 'static,
    R: Reconciler<T>,
{
    let stop = CancellationToken::new();
    let res = ctl.run(stop.clone()).await;
    let rows = res.map(|()| {
        ctl.lister()
            .list(selector)
            .iter()
            .map(|o| Row {
                key: o.key.to_string(),
                version: o.resource_version.clone(),
                labels: o.labels.iter().cloned().collect(),
                summary: ctl.summarize(o),
            })
            .collect()
    });
    stop.cancel();
    rows.with_context(|| format!("syncing {} cache", ctl.kind()))
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.manager_config();
    config.validate()?;
    let client = vigil_kubehub::connect(cli.kubeconfig.as_deref()).await?;
    match cli.command {
        Commands::Run(args) => {
            let stop = CancellationToken::new();
            spawn_signal_handler(stop.clone());
            let mgr = ControllerManager::for_cluster(client, config);
            mgr.run(args.workers, stop).await.context("controller manager")?;
        }
        Commands::Ls { kind, selector, output } => {
            let selector = Selector::parse(&selector).context("parsing label selector")?;
            let rows = match kind {
                Kind::Node => list_kind(node_controller(client, &config), &selector).await?,
                Kind::Pod => list_kind(pod_controller(client, &config), &selector).await?,
                Kind::Deployment => list_kind(deployment_controller(client, &config), &selector).await?,
            };
            match output {
                Output::Human => {
                    for r in &rows {
                        println!("{} • {} • {}", r.key, r.version, r.summary);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.dev_mode);
    init_metrics(cli.metrics_addr);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "fatal");
            ExitCode::FAILURE
        }
    }
}
