//! Mutual exclusion among local and remote contenders

use minilock::{Locker, LockerConfig, MemoryStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn start_node(store: &Arc<MemoryStore>, dir: &TempDir) -> Arc<Locker> {
    let config = LockerConfig {
        runtime_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    Arc::new(Locker::initialize(config, store.clone()).await.unwrap())
}

fn contend(
    locker: Arc<Locker>,
    inside: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
    rounds: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        for _ in 0..rounds {
            let guard = locker.acquire_wait("shared-job").await.unwrap();
            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders at once");
            tokio::time::sleep(Duration::from_millis(2)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            guard.release().await.unwrap();
            done.fetch_add(1, Ordering::SeqCst);
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_callers_take_turns() {
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().unwrap();
    let locker = start_node(&store, &dir).await;

    let inside = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..8)
        .map(|_| contend(locker.clone(), inside.clone(), done.clone(), 5))
        .collect();

    tokio::time::timeout(Duration::from_secs(30), async {
        for task in tasks {
            task.await.unwrap();
        }
    })
    .await
    .expect("callers starved");

    assert_eq!(done.load(Ordering::SeqCst), 40);
    assert!(locker.held_keys().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_take_turns() {
    let store = Arc::new(MemoryStore::new());
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node_a = start_node(&store, &dir_a).await;
    let node_b = start_node(&store, &dir_b).await;
    assert_ne!(node_a.node_id(), node_b.node_id());

    let inside = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..4 {
        tasks.push(contend(node_a.clone(), inside.clone(), done.clone(), 5));
        tasks.push(contend(node_b.clone(), inside.clone(), done.clone(), 5));
    }

    tokio::time::timeout(Duration::from_secs(30), async {
        for task in tasks {
            task.await.unwrap();
        }
    })
    .await
    .expect("callers starved");

    assert_eq!(done.load(Ordering::SeqCst), 40);
}

#[tokio::test]
async fn test_release_admits_exactly_one_more() {
    let store = Arc::new(MemoryStore::new());
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node_a = start_node(&store, &dir_a).await;
    let node_b = start_node(&store, &dir_b).await;

    let guard = node_a.acquire_wait("report").await.unwrap();
    let (_busy, acquired) = node_b
        .acquire_non_blocking("report", Duration::ZERO)
        .await
        .unwrap();
    assert!(!acquired);

    guard.release().await.unwrap();

    let (first, first_ok) = node_b
        .acquire_non_blocking("report", Duration::ZERO)
        .await
        .unwrap();
    let (second, second_ok) = node_a
        .acquire_non_blocking("report", Duration::ZERO)
        .await
        .unwrap();
    assert!(first_ok);
    assert!(!second_ok);
    assert!(!second.is_held());

    first.release().await.unwrap();
}
