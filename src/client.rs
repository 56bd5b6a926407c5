use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use anyhow::{bail, Result};
use tokio::{sync::watch, task::JoinHandle, time, time::Duration};
use tracing::{event, Level};
use uuid::Uuid;

use crate::{
    breaker::{BreakerState, CircuitBreaker},
    evaluator::{
        models::{CacheSnapshot, EvalReason, EvalResult, FlagValue},
        Evaluator, SegmentMap,
    },
    http::{is_auth_error, FlagsHttpClient},
    limiter::RateLimiter,
    models::{
        redact_segments, AccessLogEntry, BreakerHealth, FlagChangeHandler, FlagSummary,
        FlagsOptions, HealthCheck, LogBatch, SessionMetadata, StatsSnapshot,
    },
    stats::{ErrorKind, StatsTracker},
};

const SDK_TYPE: &str = "rust-client";

const MAX_USER_ID_LENGTH: usize = 256;
const MAX_FLAG_KEY_LENGTH: usize = 128;

const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(300);
const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_LOG_UPLOAD_INTERVAL: Duration = Duration::from_secs(120);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Feature flags client that evaluates against a local cache and syncs with
/// the API periodically. Evaluation calls never perform I/O and never
/// return errors; only construction and the management calls do.
pub struct Client {
    api_base_url: String,
    environment: String,
    offline_mode: bool,
    enable_analytics: bool,
    max_logs_batch: usize,
    session_id: String,
    http_client: FlagsHttpClient,
    evaluator: Evaluator,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    stats: StatsTracker,
    environment_info: Mutex<Option<serde_json::Value>>,
    on_flag_change: Option<FlagChangeHandler>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

impl Client {
    pub async fn new(
        client_id: String,
        client_secret: String,
        options: FlagsOptions,
    ) -> Result<Arc<Self>> {
        if client_id.trim().is_empty() || client_secret.trim().is_empty() {
            bail!("featureflagshq: client_id and client_secret are required");
        }
        if let Some(url) = options.api_url.as_deref() {
            validate_api_url(url)?;
        }
        if let Some(interval) = options.polling_interval {
            if interval < MIN_POLLING_INTERVAL {
                bail!(
                    "featureflagshq: polling interval must be at least {}s",
                    MIN_POLLING_INTERVAL.as_secs()
                );
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let api_base_url = options
            .api_url
            .clone()
            .unwrap_or_else(|| "https://api.featureflagshq.com".to_string())
            .trim_end_matches('/')
            .to_string();
        let http_client = FlagsHttpClient::new(
            client_id,
            client_secret,
            options.api_url,
            options.environment.clone(),
            session_id.clone(),
            options.request_timeout,
            options.max_retries,
        );

        let (shutdown_tx, _) = watch::channel(false);
        let s = Arc::new(Self {
            api_base_url,
            environment: options.environment,
            offline_mode: options.offline_mode,
            enable_analytics: options.enable_analytics,
            max_logs_batch: options.max_logs_batch.max(1),
            session_id,
            http_client,
            evaluator: Evaluator::new(),
            breaker: CircuitBreaker::new(
                options.breaker_failure_threshold,
                options
                    .breaker_reset_timeout
                    .unwrap_or(CircuitBreaker::DEFAULT_RESET_TIMEOUT),
            ),
            limiter: RateLimiter::new(
                options.rate_limit_max_requests,
                options.rate_limit_window.unwrap_or(RateLimiter::DEFAULT_WINDOW),
                options.max_unique_users,
            ),
            stats: StatsTracker::new(
                options.max_unique_users,
                options.max_unique_flags,
                options.max_pending_logs,
            ),
            environment_info: Mutex::new(None),
            on_flag_change: options.on_flag_change,
            shutdown_tx,
            tasks: Mutex::new(vec![]),
            shutdown_started: AtomicBool::new(false),
        });

        if s.offline_mode {
            event!(Level::INFO, "featureflagshq client initialized in offline mode");
            return Ok(s);
        }

        // Invalid credentials are fatal here; a transient failure is not,
        // evaluation serves caller defaults until the first good refresh.
        if let Err(e) = s.refresh_internal().await {
            if is_auth_error(&e) {
                return Err(e);
            }
            event!(Level::ERROR, "initial flag fetch failed: {}", e);
        }

        let mut tasks = vec![tokio::spawn(
            s.clone()
                .poll_for_changes(options.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL)),
        )];
        if s.enable_analytics {
            tasks.push(tokio::spawn(s.clone().background_logs_flush(
                options
                    .log_upload_interval
                    .unwrap_or(DEFAULT_LOG_UPLOAD_INTERVAL),
            )));
        }
        *s.tasks.lock().expect("should always be able to acquire lock") = tasks;

        Ok(s)
    }

    /// Resolves a flag for a user, falling back to `default_value` whenever
    /// the flag is missing, inactive, not matched, rate limited or cannot
    /// be represented as the requested type.
    pub fn get(
        &self,
        user_id: &str,
        flag_key: &str,
        default_value: serde_json::Value,
        segments: Option<&SegmentMap>,
    ) -> serde_json::Value {
        match self.evaluate_internal(user_id, flag_key, segments).value {
            Some(v) => v.as_json(),
            None => default_value,
        }
    }

    pub fn get_bool(
        &self,
        user_id: &str,
        flag_key: &str,
        default_value: bool,
        segments: Option<&SegmentMap>,
    ) -> bool {
        match self.evaluate_internal(user_id, flag_key, segments).value {
            Some(v) => v.as_bool().unwrap_or_else(|| {
                self.stats.record_coercion_error();
                default_value
            }),
            None => default_value,
        }
    }

    pub fn get_string(
        &self,
        user_id: &str,
        flag_key: &str,
        default_value: String,
        segments: Option<&SegmentMap>,
    ) -> String {
        match self.evaluate_internal(user_id, flag_key, segments).value {
            Some(v) => v.as_string().unwrap_or_else(|| {
                self.stats.record_coercion_error();
                default_value
            }),
            None => default_value,
        }
    }

    pub fn get_int(
        &self,
        user_id: &str,
        flag_key: &str,
        default_value: i64,
        segments: Option<&SegmentMap>,
    ) -> i64 {
        match self.evaluate_internal(user_id, flag_key, segments).value {
            Some(v) => v.as_int().unwrap_or_else(|| {
                self.stats.record_coercion_error();
                default_value
            }),
            None => default_value,
        }
    }

    pub fn get_float(
        &self,
        user_id: &str,
        flag_key: &str,
        default_value: f64,
        segments: Option<&SegmentMap>,
    ) -> f64 {
        match self.evaluate_internal(user_id, flag_key, segments).value {
            Some(v) => v.as_float().unwrap_or_else(|| {
                self.stats.record_coercion_error();
                default_value
            }),
            None => default_value,
        }
    }

    pub fn get_json(
        &self,
        user_id: &str,
        flag_key: &str,
        default_value: serde_json::Value,
        segments: Option<&SegmentMap>,
    ) -> serde_json::Value {
        self.get(user_id, flag_key, default_value, segments)
    }

    pub fn is_enabled(&self, user_id: &str, flag_key: &str, segments: Option<&SegmentMap>) -> bool {
        self.get_bool(user_id, flag_key, false, segments)
    }

    /// Evaluates every cached flag (or the given subset) for one user.
    /// Flags the user does not match resolve to their type's zero value.
    pub fn get_user_flags(
        &self,
        user_id: &str,
        segments: Option<&SegmentMap>,
        flag_keys: Option<&[&str]>,
    ) -> HashMap<String, serde_json::Value> {
        if !valid_user_id(user_id) {
            self.stats.record_invalid_input();
            event!(Level::WARN, "invalid user id, returning no flags");
            return HashMap::new();
        }
        let snapshot = match self.evaluator.snapshot() {
            Some(s) => s,
            None => return HashMap::new(),
        };
        snapshot
            .flags
            .values()
            .filter(|flag| flag_keys.map_or(true, |keys| keys.contains(&flag.key.as_str())))
            .map(|flag| {
                let res = Evaluator::eval_flag(flag, user_id, segments);
                let value = match res.value {
                    Some(v) => v.as_json(),
                    None => FlagValue::default_for(flag.flag_type).as_json(),
                };
                (flag.key.clone(), value)
            })
            .collect()
    }

    /// Summary of every cached definition.
    pub fn get_all_flags(&self) -> HashMap<String, FlagSummary> {
        let snapshot = match self.evaluator.snapshot() {
            Some(s) => s,
            None => return HashMap::new(),
        };
        snapshot
            .flags
            .values()
            .map(|flag| {
                (
                    flag.key.clone(),
                    FlagSummary {
                        key: flag.key.clone(),
                        flag_type: flag.flag_type.as_str().to_string(),
                        value: flag.value.as_json(),
                        is_active: flag.is_active,
                        segment_groups: flag.segments.as_ref().map_or(0, |g| g.len()),
                        rollout_percentage: flag.rollout.percentage,
                        version: flag.version,
                        updated_at: flag.updated_at,
                    },
                )
            })
            .collect()
    }

    /// Manually refreshes flag definitions from the API.
    pub async fn refresh_flags(&self) -> Result<()> {
        if self.offline_mode {
            bail!("featureflagshq: cannot refresh flags in offline mode");
        }
        self.refresh_internal().await
    }

    /// Manually uploads all pending access logs.
    pub async fn flush_logs(&self) -> Result<()> {
        if self.offline_mode || !self.enable_analytics {
            bail!("featureflagshq: cannot flush logs in offline mode or with analytics disabled");
        }
        self.flush_internal().await
    }

    /// Point-in-time copy of the usage counters.
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn get_health_check(&self) -> HealthCheck {
        let breaker_state = self.breaker.state();
        let stats = self.stats.snapshot();
        HealthCheck {
            status: if breaker_state == BreakerState::Open {
                "degraded".to_string()
            } else {
                "healthy".to_string()
            },
            api_base_url: self.api_base_url.clone(),
            environment: self.environment.clone(),
            offline_mode: self.offline_mode,
            cached_flags_count: self.evaluator.flag_count(),
            pending_log_entries: stats.pending_log_entries,
            last_sync: stats.last_sync,
            circuit_breaker: BreakerHealth {
                state: breaker_state,
                failure_count: self.breaker.failure_count(),
            },
            session_id: self.session_id.clone(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Stops both background tasks, attempts a final log flush and waits
    /// for in-flight calls within a grace period. Idempotent; evaluation
    /// keeps serving the last snapshot afterwards.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        event!(Level::INFO, "featureflagshq client shutting down");
        let _ = self.shutdown_tx.send(true);

        if self.enable_analytics && !self.offline_mode {
            if let Err(e) = self.flush_internal().await {
                event!(Level::WARN, "final log flush failed: {}", e);
            }
        }

        let handles = {
            let mut tasks = self.tasks.lock().expect("should always be able to acquire lock");
            std::mem::take(&mut *tasks)
        };
        for mut handle in handles {
            if time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                event!(Level::WARN, "background task did not stop within grace period");
                handle.abort();
            }
        }
    }
}

// Private methods
impl Client {
    fn evaluate_internal(
        &self,
        user_id: &str,
        flag_key: &str,
        segments: Option<&SegmentMap>,
    ) -> EvalResult {
        let started = Instant::now();

        if !valid_user_id(user_id) || !valid_flag_key(flag_key) {
            self.stats.record_invalid_input();
            event!(Level::WARN, "invalid user id or flag key, serving default");
            return EvalResult::miss(EvalReason::InvalidInput);
        }

        if !self.limiter.allow(user_id) {
            let res = EvalResult::miss(EvalReason::RateLimited);
            self.log_access(user_id, flag_key, &res, segments, started);
            return res;
        }

        let res = self.evaluator.evaluate(user_id, flag_key, segments);
        self.log_access(user_id, flag_key, &res, segments, started);
        res
    }

    fn log_access(
        &self,
        user_id: &str,
        flag_key: &str,
        res: &EvalResult,
        segments: Option<&SegmentMap>,
        started: Instant,
    ) {
        if !self.enable_analytics {
            return;
        }
        let value = match (&res.value, res.reason) {
            (Some(v), _) => v.as_json(),
            (None, EvalReason::RateLimited) => serde_json::Value::String("blocked".to_string()),
            (None, _) => serde_json::Value::Null,
        };
        let mut request_id = Uuid::new_v4().simple().to_string();
        request_id.truncate(16);
        self.stats.record(AccessLogEntry {
            user_id: user_id.to_string(),
            flag_key: flag_key.to_string(),
            value,
            flag_type: res.flag_type.as_str().to_string(),
            matched: res.matched,
            reason: res.reason,
            segments: segments.map(redact_segments),
            segment_matched: res.segment_matched,
            rollout_bucket: res.bucket,
            evaluation_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            timestamp: chrono::Utc::now(),
            request_id,
        });
    }

    /// Fetches definitions and installs a new snapshot, reporting the
    /// outcome to the breaker exactly once. The previous snapshot stays
    /// current on any failure.
    async fn refresh_internal(&self) -> Result<()> {
        if !self.breaker.try_acquire() {
            bail!("featureflagshq: refresh blocked by open circuit breaker");
        }
        match self.http_client.fetch_flags().await {
            Ok(response) => {
                self.breaker.record_success();
                self.stats.record_api_success();
                if let Some(env) = response.environment {
                    *self
                        .environment_info
                        .lock()
                        .expect("should always be able to acquire lock") = Some(env);
                }
                let snapshot = CacheSnapshot::from_records(&response.data);
                event!(Level::DEBUG, "fetched {} flag definitions", snapshot.flags.len());
                let old = self.evaluator.install(snapshot);
                self.stats.mark_sync();
                self.notify_flag_changes(old.as_deref());
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                self.stats.record_api_failure(if is_auth_error(&e) {
                    ErrorKind::Auth
                } else {
                    ErrorKind::Network
                });
                Err(e)
            }
        }
    }

    /// Fires the change hook once per flag whose definition differs between
    /// the replaced snapshot and the current one. The first snapshot of a
    /// process is an initial load, not a change.
    fn notify_flag_changes(&self, old: Option<&CacheSnapshot>) {
        let (Some(callback), Some(old)) = (self.on_flag_change.as_deref(), old) else {
            return;
        };
        let Some(new) = self.evaluator.snapshot() else {
            return;
        };
        for (key, new_flag) in &new.flags {
            match old.flags.get(key) {
                Some(old_flag) if old_flag.differs_from(new_flag) => {
                    callback(key, Some(&old_flag.value), Some(&new_flag.value));
                }
                Some(_) => {}
                None => callback(key, None, Some(&new_flag.value)),
            }
        }
        for (key, old_flag) in &old.flags {
            if !new.flags.contains_key(key) {
                callback(key, Some(&old_flag.value), None);
            }
        }
    }

    /// Drains a batch and uploads it, reporting the outcome to the breaker
    /// exactly once. A failed batch is requeued; whatever no longer fits is
    /// dropped and counted.
    async fn flush_internal(&self) -> Result<()> {
        let batch = self.stats.drain_logs(self.max_logs_batch);
        if batch.is_empty() {
            return Ok(());
        }
        if !self.breaker.try_acquire() {
            self.stats.requeue_logs(batch);
            bail!("featureflagshq: log upload blocked by open circuit breaker");
        }

        let payload = LogBatch {
            logs: batch.clone(),
            session_metadata: SessionMetadata {
                session_id: self.session_id.clone(),
                environment: self
                    .environment_info
                    .lock()
                    .expect("should always be able to acquire lock")
                    .clone(),
                sdk_type: SDK_TYPE.to_string(),
                sdk_version: env!("CARGO_PKG_VERSION").to_string(),
                stats: self.stats.snapshot(),
            },
        };

        match self.http_client.upload_logs(&payload).await {
            Ok(()) => {
                self.breaker.record_success();
                self.stats.record_api_success();
                self.stats.mark_log_upload();
                event!(Level::DEBUG, "uploaded {} access log entries", payload.logs.len());
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                self.stats.record_api_failure(if is_auth_error(&e) {
                    ErrorKind::Auth
                } else {
                    ErrorKind::Network
                });
                self.stats.requeue_logs(batch);
                Err(e)
            }
        }
    }

    async fn poll_for_changes(self: Arc<Self>, period: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = time::interval(period);
        // the first tick completes immediately and the initial fetch
        // already happened in the constructor
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    event!(Level::DEBUG, "refreshing flag definitions");
                    if let Err(e) = self.refresh_internal().await {
                        event!(Level::ERROR, "failed to refresh flags: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    async fn background_logs_flush(self: Arc<Self>, period: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    event!(Level::DEBUG, "flushing access logs");
                    if let Err(e) = self.flush_internal().await {
                        event!(Level::ERROR, "failed to flush access logs: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }
}

fn validate_api_url(url: &str) -> Result<()> {
    let parsed = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed,
        Err(e) => bail!("featureflagshq: invalid API base URL: {}", e),
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("featureflagshq: invalid URL scheme, only http and https are allowed");
    }
    if parsed.host_str().is_none() {
        bail!("featureflagshq: invalid URL: missing hostname");
    }
    Ok(())
}

fn valid_user_id(user_id: &str) -> bool {
    !user_id.trim().is_empty()
        && user_id.len() <= MAX_USER_ID_LENGTH
        && !user_id.chars().any(|c| c.is_control())
}

fn valid_flag_key(flag_key: &str) -> bool {
    !flag_key.is_empty()
        && flag_key.len() <= MAX_FLAG_KEY_LENGTH
        && flag_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
