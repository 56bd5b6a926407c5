use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{
    breaker::BreakerState,
    evaluator::{
        models::{EvalReason, FlagValue},
        SegmentMap,
    },
};

/// Hook invoked with (flag key, old value, new value) once per flag whose
/// definition changed between two successfully fetched snapshots.
pub type FlagChangeHandler = Arc<dyn Fn(&str, Option<&FlagValue>, Option<&FlagValue>) + Send + Sync>;

/// Options to use when creating the client, they will override default
/// values, if they exist.
///
/// The default value for api_url is <https://api.featureflagshq.com>.
/// The default polling interval is 300s (minimum 30s) and the default log
/// upload interval is 120s.
pub struct FlagsOptions {
    pub api_url: Option<String>,
    pub environment: String,
    pub polling_interval: Option<Duration>,
    pub log_upload_interval: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub max_retries: u32,
    pub max_logs_batch: usize,
    /// Disables access-log collection and upload when false.
    pub enable_analytics: bool,
    /// Never fetches from the backend; evaluation serves caller defaults.
    pub offline_mode: bool,
    pub rate_limit_max_requests: u64,
    pub rate_limit_window: Option<Duration>,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Option<Duration>,
    pub max_unique_users: usize,
    pub max_unique_flags: usize,
    pub max_pending_logs: usize,
    pub on_flag_change: Option<FlagChangeHandler>,
}

impl FlagsOptions {
    pub fn default() -> Self {
        Self {
            api_url: None,
            environment: "production".to_string(),
            polling_interval: None,
            log_upload_interval: None,
            request_timeout: None,
            max_retries: 3,
            max_logs_batch: 100,
            enable_analytics: true,
            offline_mode: false,
            rate_limit_max_requests: crate::limiter::RateLimiter::DEFAULT_MAX_REQUESTS,
            rate_limit_window: None,
            breaker_failure_threshold: crate::breaker::CircuitBreaker::DEFAULT_FAILURE_THRESHOLD,
            breaker_reset_timeout: None,
            max_unique_users: crate::stats::StatsTracker::DEFAULT_MAX_UNIQUE_USERS,
            max_unique_flags: crate::stats::StatsTracker::DEFAULT_MAX_UNIQUE_FLAGS,
            max_pending_logs: crate::stats::StatsTracker::DEFAULT_MAX_PENDING_LOGS,
            on_flag_change: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            offline_mode: true,
            ..Self::default()
        }
    }
}

/// Response body of the flag definitions endpoint. Records stay raw here;
/// they are parsed one by one so a malformed record can be skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct FlagsResponse {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default)]
    pub environment: Option<serde_json::Value>,
}

/// One evaluation, as queued for analytics upload. The segment context is
/// redacted before the entry is constructed.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub user_id: String,
    pub flag_key: String,
    pub value: serde_json::Value,
    pub flag_type: String,
    pub matched: bool,
    pub reason: EvalReason,
    pub segments: Option<SegmentMap>,
    pub segment_matched: bool,
    pub rollout_bucket: Option<u32>,
    pub evaluation_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

/// Upload payload for a batch of access logs.
#[derive(Debug, Clone, Serialize)]
pub struct LogBatch {
    pub logs: Vec<AccessLogEntry>,
    pub session_metadata: SessionMetadata,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub environment: Option<serde_json::Value>,
    pub sdk_type: String,
    pub sdk_version: String,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiCallStats {
    pub successful: u64,
    pub failed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub network_errors: u64,
    pub auth_errors: u64,
    pub config_errors: u64,
    pub other_errors: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingStats {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
}

/// Point-in-time copy of the tracker counters.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_evaluations: u64,
    pub blocked_evaluations: u64,
    pub coercion_errors: u64,
    pub invalid_inputs: u64,
    pub segment_matches: u64,
    pub rollout_evaluations: u64,
    pub unique_users_count: usize,
    pub unique_flags_count: usize,
    pub api_calls: ApiCallStats,
    pub errors: ErrorStats,
    pub evaluation_times: TimingStats,
    pub pending_log_entries: usize,
    pub dropped_log_entries: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_log_upload: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub state: BreakerState,
    pub failure_count: u32,
}

/// SDK health status, derived from the breaker state and cache freshness.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub api_base_url: String,
    pub environment: String,
    pub offline_mode: bool,
    pub cached_flags_count: usize,
    pub pending_log_entries: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub circuit_breaker: BreakerHealth,
    pub session_id: String,
    pub sdk_version: String,
}

/// Summary of one cached definition, as returned by `get_all_flags`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct FlagSummary {
    pub key: String,
    pub flag_type: String,
    pub value: serde_json::Value,
    pub is_active: bool,
    pub segment_groups: usize,
    pub rollout_percentage: u8,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

const SENSITIVE_KEY_MARKERS: [&str; 5] = ["password", "secret", "token", "signature", "credential"];

/// Copies the segment context with sensitive values masked, so raw
/// credentials never sit in the analytics queue.
pub fn redact_segments(segments: &SegmentMap) -> SegmentMap {
    segments
        .iter()
        .map(|(k, v)| {
            let lower = k.to_ascii_lowercase();
            if SENSITIVE_KEY_MARKERS.iter().any(|m| lower.contains(m)) {
                (k.clone(), serde_json::Value::String("[REDACTED]".to_string()))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_redact_segments() {
        let segments: SegmentMap = [
            ("country".to_string(), json!("US")),
            ("api_token".to_string(), json!("abc123")),
            ("Password".to_string(), json!("hunter2")),
            ("client_secret".to_string(), json!("shh")),
        ]
        .into_iter()
        .collect();
        let redacted = redact_segments(&segments);
        assert_eq!(redacted.get("country"), Some(&json!("US")));
        assert_eq!(redacted.get("api_token"), Some(&json!("[REDACTED]")));
        assert_eq!(redacted.get("Password"), Some(&json!("[REDACTED]")));
        assert_eq!(redacted.get("client_secret"), Some(&json!("[REDACTED]")));
    }

    #[test]
    fn test_flags_response_tolerates_missing_fields() {
        let response: FlagsResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.data.is_empty());
        assert!(response.environment.is_none());
    }
}
