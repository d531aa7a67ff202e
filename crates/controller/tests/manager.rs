#![forbid(unsafe_code)]

mod support;

use std::time::Duration;

use support::{controller, eventually, fast_config, pod, Step};
use tokio_util::sync::CancellationToken;
use vigil_controller::{ConfigError, ControllerError, ControllerManager, ManagerConfig, ManagerError};
use vigil_core::WatchEvent;

#[tokio::test]
async fn zero_workers_is_rejected() {
    let mgr = ControllerManager::new(ManagerConfig::default());
    let err = mgr.run(0, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ManagerError::NoWorkers));
}

#[tokio::test]
async fn non_positive_queue_rate_is_rejected() {
    let mgr = ControllerManager::new(ManagerConfig { queue_qps: 0.0, ..ManagerConfig::default() });
    let err = mgr.run(1, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ManagerError::Config(ConfigError::QueueQps(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_worker_is_relaunched() {
    let config = fast_config();
    let (ctl, feed, calls) = controller([Step::Panic], &config);
    let mut mgr = ControllerManager::new(config);
    mgr.add(ctl);
    feed.send(Ok(WatchEvent::Restarted(vec![pod("pod-a", "1")]))).unwrap();

    let stop = CancellationToken::new();
    let run = tokio::spawn({
        let stop = stop.clone();
        async move { mgr.run(1, stop).await }
    });

    eventually(Duration::from_secs(5), || calls.len() == 1).await;
    // The only worker died on pod-a; pod-b needs the relaunched one.
    feed.send(Ok(WatchEvent::Applied(pod("pod-b", "1")))).unwrap();
    eventually(Duration::from_secs(5), || calls.len() == 2).await;
    assert_eq!(calls.keys(), vec!["ns1/pod-a", "ns1/pod-b"]);

    stop.cancel();
    let res = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    assert!(res.is_ok());
}

#[tokio::test(start_paused = true)]
async fn startup_fails_fast_on_sync_timeout() {
    let config = ManagerConfig { sync_timeout: Duration::from_secs(1), list_on_start: true, ..fast_config() };
    let (synced, synced_feed, _) = controller([], &config);
    let (stuck, _stuck_feed, _) = controller([], &config);
    synced_feed.send(Ok(WatchEvent::Restarted(vec![pod("pod-a", "1")]))).unwrap();
    let synced_queue = synced.queue().clone();

    let mut mgr = ControllerManager::new(config);
    mgr.add(synced);
    mgr.add(stuck);
    let stop = CancellationToken::new();
    let err = mgr.run(2, stop.clone()).await.unwrap_err();

    assert!(matches!(err, ManagerError::Controller(ControllerError::CacheSyncTimeout { .. })));
    // The caller's token is left alone; the started controller was stopped anyway.
    assert!(!stop.is_cancelled());
    eventually(Duration::from_secs(1), || synced_queue.is_shutting_down()).await;
}

#[tokio::test]
async fn stop_during_startup_returns_cleanly() {
    let config = fast_config();
    let (ctl, _feed, _) = controller([], &config);
    let mut mgr = ControllerManager::new(config);
    mgr.add(ctl);
    let stop = CancellationToken::new();
    stop.cancel();
    assert!(mgr.run(3, stop).await.is_ok());
}
