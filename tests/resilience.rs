use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use httptest::Server;
use serde_json::json;

use featureflagshq::{models::FlagsOptions, BreakerState, Client};

use common::{create_client, create_client_with_options};

pub mod common;

#[tokio::test]
async fn test_offline_mode_serves_defaults() {
    let client = Client::new(
        "client_id".to_string(),
        "client_secret".to_string(),
        FlagsOptions::offline(),
    )
    .await
    .expect("offline client needs no server");

    assert_eq!(client.get_int("user_1", "max_items", 9, None), 9);
    assert!(client.refresh_flags().await.is_err());
    assert!(client.flush_logs().await.is_err());

    let health = client.get_health_check();
    assert!(health.offline_mode);
    assert_eq!(health.cached_flags_count, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_construction_rejects_bad_config() {
    assert!(Client::new("".to_string(), "secret".to_string(), FlagsOptions::offline())
        .await
        .is_err());
    assert!(Client::new(
        "id".to_string(),
        "secret".to_string(),
        FlagsOptions {
            api_url: Some("ftp://example.com".to_string()),
            ..FlagsOptions::offline()
        },
    )
    .await
    .is_err());
    assert!(Client::new(
        "id".to_string(),
        "secret".to_string(),
        FlagsOptions {
            polling_interval: Some(tokio::time::Duration::from_secs(5)),
            ..FlagsOptions::offline()
        },
    )
    .await
    .is_err());
}

#[tokio::test]
async fn test_unreachable_server_degrades_to_defaults() {
    // Nothing is listening here, so the initial fetch fails and every
    // evaluation serves the caller default.
    let client = Client::new(
        "client_id".to_string(),
        "client_secret".to_string(),
        FlagsOptions {
            api_url: Some("http://127.0.0.1:9".to_string()),
            max_retries: 0,
            request_timeout: Some(tokio::time::Duration::from_millis(200)),
            ..FlagsOptions::default()
        },
    )
    .await
    .expect("network failure at startup is not fatal");

    assert_eq!(client.get("user_1", "anything", json!("fallback"), None), json!("fallback"));
    assert!(client.get_stats().api_calls.failed >= 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_breaker_opens_after_repeated_failures() {
    let client = Client::new(
        "client_id".to_string(),
        "client_secret".to_string(),
        FlagsOptions {
            api_url: Some("http://127.0.0.1:9".to_string()),
            max_retries: 0,
            request_timeout: Some(tokio::time::Duration::from_millis(200)),
            breaker_failure_threshold: 3,
            ..FlagsOptions::default()
        },
    )
    .await
    .expect("network failure at startup is not fatal");

    // Initial fetch already failed once; drive the breaker to its
    // threshold with manual refreshes.
    let _ = client.refresh_flags().await;
    let _ = client.refresh_flags().await;

    let health = client.get_health_check();
    assert_eq!(health.circuit_breaker.state, BreakerState::Open);
    assert_eq!(health.status, "degraded");

    // Once open, refreshes short-circuit without touching the transport.
    let failed_before = client.get_stats().api_calls.failed;
    assert!(client.refresh_flags().await.is_err());
    assert_eq!(client.get_stats().api_calls.failed, failed_before);

    client.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_blocks_and_counts() {
    let server = Server::run();
    let client = create_client_with_options(
        &server,
        FlagsOptions {
            rate_limit_max_requests: 3,
            ..FlagsOptions::default()
        },
    )
    .await;

    for _ in 0..3 {
        assert_eq!(client.get_int("user_1", "max_items", 1, None), 25);
    }
    // The fourth call in the window is denied and serves the default.
    assert_eq!(client.get_int("user_1", "max_items", 1, None), 1);
    // Other users are unaffected.
    assert_eq!(client.get_int("user_2", "max_items", 1, None), 25);

    let stats = client.get_stats();
    assert_eq!(stats.blocked_evaluations, 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_flush_logs_uploads_pending_entries() {
    let server = Server::run();
    let client = create_client(&server).await;

    for i in 0..5 {
        client.get_int(&format!("user_{}", i), "max_items", 1, None);
    }
    assert!(client.get_stats().pending_log_entries >= 5);

    client.flush_logs().await.expect("upload should succeed");
    assert_eq!(client.get_stats().pending_log_entries, 0);
    assert!(client.get_stats().last_log_upload.is_some());

    client.shutdown().await;
}

#[tokio::test]
async fn test_stats_snapshot_is_a_copy() {
    let server = Server::run();
    let client = create_client(&server).await;

    let before = client.get_stats();
    client.get_int("user_1", "max_items", 1, None);
    let after = client.get_stats();
    assert_eq!(before.total_evaluations + 1, after.total_evaluations);

    client.shutdown().await;
}

#[tokio::test]
async fn test_flag_change_callback_fires_on_refresh() {
    let server = Server::run();
    let changes = Arc::new(AtomicUsize::new(0));
    let counter = changes.clone();
    let client = create_client_with_options(
        &server,
        FlagsOptions {
            on_flag_change: Some(Arc::new(move |_key, _old, _new| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..FlagsOptions::default()
        },
    )
    .await;

    // Same payload again: no definitions changed, no callbacks.
    client.refresh_flags().await.expect("refresh should succeed");
    assert_eq!(changes.load(Ordering::SeqCst), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_keeps_serving() {
    let server = Server::run();
    let client = create_client(&server).await;

    client.shutdown().await;
    client.shutdown().await;

    // The last snapshot keeps serving after shutdown.
    assert_eq!(client.get_int("user_1", "max_items", 1, None), 25);
}
