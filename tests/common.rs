use std::sync::Arc;

use httptest::{matchers::request, responders::json_encoded, Expectation, Server};
use serde_json::json;

use featureflagshq::{models::FlagsOptions, Client};

pub fn expect_fetch_flags(server: &Server) {
    server.expect(
        Expectation::matching(request::method_path("GET", "/v1/flags/"))
            .times(..)
            .respond_with(json_encoded(json!({
                "environment": {"name": "test"},
                "data": [
                    {
                        "key": "new_dashboard",
                        "type": "bool",
                        "value": "true",
                        "is_active": true,
                        "segments": [
                            {"rules": [
                                {"attribute": "country", "comparator": "eq", "value": "US"},
                            ]},
                        ],
                        "rollout": {"percentage": 100},
                        "version": 3,
                    },
                    {
                        "key": "max_items",
                        "type": "int",
                        "value": "25",
                        "is_active": true,
                        "rollout": {"percentage": 100},
                    },
                    {
                        "key": "beta",
                        "type": "string",
                        "value": "enabled",
                        "is_active": true,
                        "rollout": {"percentage": 50},
                    },
                    {
                        "key": "retired",
                        "type": "bool",
                        "value": "true",
                        "is_active": false,
                    },
                    {
                        "not_a_flag": true,
                    },
                ],
            }))),
    );
}

pub fn expect_log_upload(server: &Server) {
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/logs/batch/"))
            .times(..)
            .respond_with(json_encoded(json!({"accepted": true}))),
    );
}

pub async fn create_client(server: &Server) -> Arc<Client> {
    create_client_with_options(server, FlagsOptions::default()).await
}

pub async fn create_client_with_options(server: &Server, options: FlagsOptions) -> Arc<Client> {
    expect_fetch_flags(server);
    expect_log_upload(server);

    Client::new(
        "client_id".to_string(),
        "client_secret".to_string(),
        FlagsOptions {
            api_url: Some(format!("http://{}", server.addr())),
            ..options
        },
    )
    .await
    .expect("should be able to create featureflagshq client")
}
