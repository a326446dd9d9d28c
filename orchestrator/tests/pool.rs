mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;

use common::{orchestrator, test_config, FakeRuntime};
use pysandbox_orchestrator::{PoolStats, SandboxConfig, SandboxError};

fn pooled_config(size: usize) -> SandboxConfig {
    let mut config = test_config();
    config.pool.enabled = true;
    config.pool.size = size;
    config.pool.max_age = 60;
    config.pool.maintenance_interval = 1;
    config
}

#[tokio::test]
async fn test_creations_never_exceed_cap() {
    let runtime = FakeRuntime::new();
    runtime.set_create_delay(Duration::from_millis(20));

    let mut config = test_config();
    config.pool.max_concurrent_creations = 2;
    let engine = Arc::new(orchestrator(config, &runtime));

    let calls = (0..8).map(|i| {
        let engine = engine.clone();
        async move { engine.execute_transient(&format!("x = {}", i), None).await }
    });
    let results = join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(runtime.created_count(), 8);
    assert!(runtime.max_in_flight() <= 2);
}

#[tokio::test]
async fn test_sessions_share_the_creation_cap() {
    let runtime = FakeRuntime::new();
    runtime.set_create_delay(Duration::from_millis(20));

    let mut config = test_config();
    config.pool.max_concurrent_creations = 3;
    let engine = Arc::new(orchestrator(config, &runtime));

    let calls = (0..9).map(|i| {
        let engine = engine.clone();
        async move {
            if i % 2 == 0 {
                engine.execute_transient("x = 1", None).await.map(|_| ())
            } else {
                engine
                    .execute_persistent(Some(&format!("s{}", i)), "x = 1")
                    .await
                    .map(|_| ())
            }
        }
    });
    let results = join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert!(runtime.max_in_flight() <= 3);
}

#[tokio::test]
async fn test_maintenance_fills_pool_and_acquire_uses_it() {
    let runtime = FakeRuntime::new();
    let engine = orchestrator(pooled_config(2), &runtime);

    engine.maintain_pool().await;
    assert_eq!(
        engine.pool_stats().await,
        PoolStats {
            idle: 2,
            pending: 0,
            capacity: 2
        }
    );
    assert_eq!(runtime.created_count(), 2);

    engine.execute_transient("x = 1", None).await.unwrap();

    assert_eq!(runtime.created_count(), 2);
    assert_eq!(engine.pool_stats().await.idle, 1);
    assert_eq!(runtime.removed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_aged_containers_are_replaced() {
    let runtime = FakeRuntime::new();
    let engine = orchestrator(pooled_config(2), &runtime);

    engine.maintain_pool().await;
    let first_generation = runtime.created_count();

    tokio::time::advance(Duration::from_secs(61)).await;
    engine.maintain_pool().await;

    assert_eq!(runtime.removed().len(), first_generation);
    assert_eq!(runtime.created_count(), first_generation + 2);
    assert_eq!(engine.pool_stats().await.idle, 2);
}

#[tokio::test]
async fn test_disabled_pool_keeps_no_idle_containers() {
    let runtime = FakeRuntime::new();
    let engine = orchestrator(test_config(), &runtime);

    engine.maintain_pool().await;
    assert_eq!(engine.pool_stats().await, PoolStats::default());
    assert_eq!(runtime.created_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_pool_and_sessions() {
    let runtime = FakeRuntime::new();
    let engine = orchestrator(pooled_config(2), &runtime);

    engine.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.pool_stats().await.idle, 2);

    engine.execute_persistent(Some("s1"), "x = 1").await.unwrap();
    engine.shutdown().await;

    assert_eq!(runtime.live_containers(), 0);
    assert_eq!(engine.pool_stats().await.idle, 0);
    assert!(engine.list_sessions().await.is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(runtime.live_containers(), 0);

    let err = engine.execute_transient("x = 1", None).await.unwrap_err();
    assert!(matches!(err, SandboxError::CreationFailure(_)));
}
