// ABOUTME: Tests for the warm session pool: isolation, TTL sweep, invalidation,
// ABOUTME: resume fallback, and the mid-use sweep skip. All against the mock backend.

use crossbar::warm::{PoolConfig, SessionOutcome, WarmSessionManager};
use crossbar_agent::backends::mock::MockBackend;
use crossbar_agent::AgentRegistry;
use std::sync::Arc;
use std::time::Duration;

fn pool_with_keep_alive(keep_alive: Duration) -> Arc<WarmSessionManager> {
    let registry = AgentRegistry::new().register("mock", MockBackend::factory());
    Arc::new(WarmSessionManager::new(
        PoolConfig {
            backend_type: "mock".to_string(),
            keep_alive,
            backend_settings: serde_json::json!({}),
        },
        registry,
    ))
}

fn pool() -> Arc<WarmSessionManager> {
    pool_with_keep_alive(Duration::from_secs(3600))
}

#[tokio::test]
async fn distinct_names_never_share_an_entry() {
    let pool = pool();

    let (a, b) = tokio::join!(
        pool.get_or_create("alpha", "/tmp/alpha", None),
        pool.get_or_create("beta", "/tmp/beta", None),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.session_id(), b.session_id());
    assert!(pool.contains("alpha").await);
    assert!(pool.contains("beta").await);
}

#[tokio::test]
async fn same_name_concurrent_checkouts_converge() {
    let pool = pool();

    let (x, y) = tokio::join!(
        pool.get_or_create("shared", "/tmp/shared", None),
        pool.get_or_create("shared", "/tmp/shared", None),
    );
    let (x, y) = (x.unwrap(), y.unwrap());

    // Whichever racer lost the insert still ends up on the winner's session.
    assert_eq!(x.session_id(), y.session_id());
    assert_eq!(pool.warm_names().await.len(), 1);
}

#[tokio::test]
async fn second_checkout_reuses_the_warm_entry() {
    let pool = pool();

    let first = pool.get_or_create("s", "/tmp/s", None).await.unwrap();
    assert_eq!(first.outcome(), SessionOutcome::Created);
    let id = first.session_id().to_string();
    drop(first);

    let second = pool.get_or_create("s", "/tmp/s", None).await.unwrap();
    assert_eq!(second.outcome(), SessionOutcome::Reused);
    assert_eq!(second.session_id(), id);
}

#[tokio::test]
async fn resume_of_known_id_is_tagged_resumed() {
    let pool = pool();

    let lease = pool
        .get_or_create("s", "/tmp/s", Some("resumable-7"))
        .await
        .unwrap();
    assert_eq!(lease.outcome(), SessionOutcome::Resumed);
    assert_eq!(lease.session_id(), "resumable-7");
}

#[tokio::test]
async fn failed_resume_recovers_with_fresh_session() {
    let pool = pool();

    let lease = pool
        .get_or_create("s", "/tmp/s", Some("orphaned-id"))
        .await
        .unwrap();
    assert_eq!(lease.outcome(), SessionOutcome::Recovered);
    assert_ne!(lease.session_id(), "orphaned-id");
}

#[tokio::test]
async fn invalidate_forces_a_rebuild() {
    let pool = pool();

    let first = pool.get_or_create("s", "/tmp/s", None).await.unwrap();
    let old_id = first.session_id().to_string();
    drop(first);

    pool.invalidate("s").await;
    assert!(!pool.contains("s").await);

    let rebuilt = pool.get_or_create("s", "/tmp/s", None).await.unwrap();
    assert_eq!(rebuilt.outcome(), SessionOutcome::Created);
    assert_ne!(rebuilt.session_id(), old_id);
}

#[tokio::test]
async fn lease_survives_eviction_underneath() {
    let pool = pool();

    let lease = pool.get_or_create("s", "/tmp/s", None).await.unwrap();
    assert!(pool.evict("s").await);

    // The handle still reaches its worker; only new checkouts rebuild.
    let mut events = lease.handle().prompt(lease.session_id(), "hi").await.unwrap();
    assert!(events.recv().await.is_some());
}

#[tokio::test]
async fn cleanup_removes_idle_sessions_and_rebuild_is_fresh() {
    let pool = pool_with_keep_alive(Duration::from_millis(10));

    let first = pool.get_or_create("s", "/tmp/s", None).await.unwrap();
    let old_id = first.session_id().to_string();
    drop(first);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(pool.cleanup_stale().await, 1);
    assert!(!pool.contains("s").await);

    let rebuilt = pool.get_or_create("s", "/tmp/s", None).await.unwrap();
    assert_eq!(rebuilt.outcome(), SessionOutcome::Created);
    assert_ne!(rebuilt.session_id(), old_id);
}

#[tokio::test]
async fn cleanup_skips_entries_mid_use() {
    let pool = pool_with_keep_alive(Duration::from_millis(10));

    let lease = pool.get_or_create("busy", "/tmp/busy", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Held lease marks the entry in-flight; the sweep leaves it alone.
    assert_eq!(pool.cleanup_stale().await, 0);
    assert!(pool.contains("busy").await);

    drop(lease);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(pool.cleanup_stale().await, 1);
}

#[tokio::test]
async fn unrelated_invalidate_does_not_touch_other_sessions() {
    let pool = pool();

    let a = pool.get_or_create("a", "/tmp/a", None).await.unwrap();
    let a_id = a.session_id().to_string();
    drop(a);
    pool.get_or_create("b", "/tmp/b", None).await.unwrap();

    pool.invalidate("b").await;

    let a_again = pool.get_or_create("a", "/tmp/a", None).await.unwrap();
    assert_eq!(a_again.outcome(), SessionOutcome::Reused);
    assert_eq!(a_again.session_id(), a_id);
}

#[tokio::test]
async fn unknown_backend_type_errors() {
    let registry = AgentRegistry::new();
    let pool = WarmSessionManager::new(
        PoolConfig {
            backend_type: "nope".to_string(),
            keep_alive: Duration::from_secs(60),
            backend_settings: serde_json::json!({}),
        },
        registry,
    );
    assert!(pool.get_or_create("s", "/tmp/s", None).await.is_err());
}
