use std::collections::HashMap;

use httptest::Server;
use serde_json::json;

use featureflagshq::SegmentMap;

use common::create_client;

pub mod common;

fn us_segments() -> SegmentMap {
    HashMap::from([("country".to_string(), json!("US"))])
}

fn ca_segments() -> SegmentMap {
    HashMap::from([("country".to_string(), json!("CA"))])
}

#[tokio::test]
async fn test_segment_targeting() {
    let server = Server::run();
    let client = create_client(&server).await;

    // Matching segment serves the configured value.
    assert!(client.is_enabled("user_1", "new_dashboard", Some(&us_segments())));

    // Non-matching segment falls back to the caller default.
    assert!(!client.is_enabled("user_1", "new_dashboard", Some(&ca_segments())));
    assert!(client.get_bool("user_1", "new_dashboard", true, Some(&ca_segments())));

    // Segments configured but none supplied.
    assert!(!client.is_enabled("user_1", "new_dashboard", None));

    client.shutdown().await;
}

#[tokio::test]
async fn test_typed_accessors() {
    let server = Server::run();
    let client = create_client(&server).await;

    assert_eq!(client.get_int("user_1", "max_items", 10, None), 25);
    assert_eq!(client.get_float("user_1", "max_items", 1.0, None), 25.0);
    assert_eq!(
        client.get_string("user_1", "max_items", "".to_string(), None),
        "25"
    );
    assert_eq!(client.get("user_1", "max_items", json!(10), None), json!(25));

    client.shutdown().await;
}

#[tokio::test]
async fn test_missing_flag_returns_default() {
    let server = Server::run();
    let client = create_client(&server).await;

    assert_eq!(client.get("user_1", "missing", json!(42), None), json!(42));
    assert_eq!(client.get_int("user_1", "missing", 42, None), 42);

    client.shutdown().await;
}

#[tokio::test]
async fn test_inactive_flag_returns_default() {
    let server = Server::run();
    let client = create_client(&server).await;

    assert!(!client.is_enabled("user_1", "retired", None));
    assert_eq!(client.get_int("user_1", "retired", 7, None), 7);

    client.shutdown().await;
}

#[tokio::test]
async fn test_malformed_definition_skipped() {
    let server = Server::run();
    let client = create_client(&server).await;

    // Four valid records survive; the malformed one is skipped without
    // poisoning the snapshot.
    let all = client.get_all_flags();
    assert_eq!(all.len(), 4);
    assert!(all.contains_key("new_dashboard"));
    assert!(all.contains_key("retired"));

    client.shutdown().await;
}

#[tokio::test]
async fn test_rollout_is_sticky_per_user() {
    let server = Server::run();
    let client = create_client(&server).await;

    let first = client.get_string("user_42", "beta", "default".to_string(), None);
    for _ in 0..20 {
        assert_eq!(
            first,
            client.get_string("user_42", "beta", "default".to_string(), None)
        );
    }

    client.shutdown().await;
}

#[tokio::test]
async fn test_get_user_flags() {
    let server = Server::run();
    let client = create_client(&server).await;

    let flags = client.get_user_flags("user_1", Some(&us_segments()), None);
    assert_eq!(flags.len(), 4);
    assert_eq!(flags.get("new_dashboard"), Some(&json!(true)));
    assert_eq!(flags.get("max_items"), Some(&json!(25)));
    // Inactive flag resolves to its type's zero value here.
    assert_eq!(flags.get("retired"), Some(&json!(false)));

    let subset = client.get_user_flags("user_1", Some(&us_segments()), Some(&["max_items"]));
    assert_eq!(subset.len(), 1);
    assert_eq!(subset.get("max_items"), Some(&json!(25)));

    client.shutdown().await;
}

#[tokio::test]
async fn test_invalid_inputs_serve_default() {
    let server = Server::run();
    let client = create_client(&server).await;

    assert_eq!(client.get_int("", "max_items", 3, None), 3);
    assert_eq!(client.get_int("user\n1", "max_items", 3, None), 3);
    assert_eq!(client.get_int("user_1", "bad key", 3, None), 3);
    assert!(client.get_stats().invalid_inputs >= 3);

    client.shutdown().await;
}
