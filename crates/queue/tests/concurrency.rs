#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vigil_queue::{ExponentialBackoff, RateLimiter, WorkQueue};

fn queue(name: &str) -> WorkQueue<String> {
    WorkQueue::new(name, ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(50)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_key_is_never_held_by_two_workers() {
    let q = queue("in-flight");
    let held: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let violations = Arc::new(Mutex::new(0u32));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let q = q.clone();
        let held = Arc::clone(&held);
        let violations = Arc::clone(&violations);
        workers.push(tokio::spawn(async move {
            while let Some(k) = q.get().await {
                if !held.lock().unwrap().insert(k.clone()) {
                    *violations.lock().unwrap() += 1;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                held.lock().unwrap().remove(&k);
                q.done(&k);
            }
        }));
    }

    // Hammer a small key space so keys are re-added while in flight.
    for i in 0..500 {
        q.add(format!("ns/obj-{}", i % 5));
        if i % 50 == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    q.shut_down();
    for w in workers {
        tokio::time::timeout(Duration::from_secs(5), w).await.expect("worker hung").unwrap();
    }
    assert_eq!(*violations.lock().unwrap(), 0);
}

#[tokio::test]
async fn adds_during_processing_coalesce_into_one_redelivery() {
    let q = queue("coalesce");
    q.add("ns1/pod-a".to_string());
    let k = q.get().await.unwrap();
    for _ in 0..10 {
        q.add("ns1/pod-a".to_string());
    }
    q.done(&k);

    let again = tokio::time::timeout(Duration::from_millis(100), q.get()).await.unwrap().unwrap();
    assert_eq!(again, "ns1/pod-a");
    q.done(&again);
    // Exactly once: nothing further is pending.
    assert!(q.is_empty());
    assert!(tokio::time::timeout(Duration::from_millis(30), q.get()).await.is_err());
}

#[tokio::test]
async fn shutdown_unblocks_waiting_getters() {
    let q = queue("shutdown");
    let mut getters = Vec::new();
    for _ in 0..3 {
        let q = q.clone();
        getters.push(tokio::spawn(async move { q.get().await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.shut_down();
    for g in getters {
        let got = tokio::time::timeout(Duration::from_secs(1), g).await.expect("get did not unblock").unwrap();
        assert_eq!(got, None);
    }
}

#[tokio::test]
async fn rate_limited_key_appears_after_back_off_and_forget_resets() {
    let q = queue("backoff");
    let k = "ns/a".to_string();
    q.add_rate_limited(k.clone());
    assert_eq!(q.num_requeues(&k), 1);
    let got = tokio::time::timeout(Duration::from_millis(500), q.get()).await.unwrap().unwrap();
    q.add_rate_limited(got.clone());
    q.add_rate_limited(got.clone());
    q.done(&got);
    assert_eq!(q.num_requeues(&k), 3);
    q.forget(&k);
    assert_eq!(q.num_requeues(&k), 0);

    let rl: ExponentialBackoff<String> = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(50));
    let delays: Vec<_> = (0..10).map(|_| rl.when(&k)).collect();
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(delays[9], Duration::from_millis(50));
    rl.forget(&k);
    assert_eq!(rl.when(&k), Duration::from_millis(1));
}

#[tokio::test]
async fn delayed_adds_are_dropped_on_shutdown() {
    let q = queue("drop-delayed");
    q.add_after("ns/late".to_string(), Duration::from_millis(20));
    q.shut_down();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(q.get().await, None);
}
