use std::collections::HashMap;

use featureflagshq::{Client, SegmentMap};
use featureflagshq::models::FlagsOptions;

#[tokio::main]
async fn main() {
    let client = Client::new(
        "client_id".to_string(),
        "client_secret".to_string(),
        FlagsOptions {
            polling_interval: Some(tokio::time::Duration::from_secs(30)),
            ..FlagsOptions::default()
        },
    )
    .await
    .unwrap();

    let segments: SegmentMap = HashMap::from([
        ("country".to_string(), serde_json::json!("US")),
        ("plan".to_string(), serde_json::json!("pro")),
    ]);

    println!(
        "new_dashboard enabled: {}",
        client.is_enabled("user_1238", "new_dashboard", Some(&segments))
    );
    println!(
        "max_items: {}",
        client.get_int("user_1238", "max_items", 10, Some(&segments))
    );

    tokio::time::sleep(tokio::time::Duration::from_secs(40)).await;

    println!("{:?}", client.get_health_check());

    client.shutdown().await;
}
