//! Threat detection over inbound request traffic.
//!
//! Three detectors run in a fixed order and the first hit wins: a per-IP
//! request-rate check (DDoS), a z-score latency anomaly check against
//! statistics persisted in the shared store, and a per-user behavioral
//! score built from exponentially-weighted moving averages. Blocks are
//! written to the shared store so every service instance enforces them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::core::store::{Store, StoreError};
use crate::models::ThreatConfig;
use crate::utils::{format_blocked_key, format_stats_key, get_current_timestamp};

/// Samples required before anomaly scoring kicks in
const MIN_ANOMALY_SAMPLES: u64 = 10;
/// Lifetime of the per-source statistics hash, refreshed on every update
const STATS_TTL: Duration = Duration::from_secs(3600);
/// Smoothing factor for the behavioral moving averages
const EMA_ALPHA: f64 = 0.1;

/// Errors that can occur during threat analysis
#[derive(Error, Debug)]
pub enum ThreatError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid threat detector configuration: {0}")]
    Config(String),
}

/// Threat category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    Ddos,
    Anomaly,
    Behavioral,
    BruteForce,
    Suspicious,
}

/// Threat severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected threat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    pub id: Uuid,
    pub threat_type: ThreatType,
    pub level: ThreatLevel,
    /// IP address or user id the threat was attributed to
    pub source: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Confidence in [0, 1]
    pub score: f64,
}

/// Per-IP fixed-window request counter
#[derive(Debug)]
struct RequestCounter {
    count: u64,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Per-user smoothed behavior estimate
#[derive(Debug)]
struct BehaviorPattern {
    request_rate: f64,
    error_rate: f64,
    avg_latency_ms: f64,
    last_seen: Instant,
    suspicion_score: f64,
}

/// Welford running statistics for one source's request latency
#[derive(Debug, Default, PartialEq)]
struct LatencyStats {
    count: u64,
    mean: f64,
    m2: f64,
    errors: u64,
}

impl LatencyStats {
    fn from_hash(map: &HashMap<String, String>) -> Self {
        fn field<T: std::str::FromStr>(map: &HashMap<String, String>, name: &str) -> Option<T> {
            map.get(name).and_then(|v| v.parse().ok())
        }
        Self {
            count: field(map, "count").unwrap_or(0),
            mean: field(map, "mean").unwrap_or(0.0),
            m2: field(map, "m2").unwrap_or(0.0),
            errors: field(map, "errors").unwrap_or(0),
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("count".to_string(), self.count.to_string()),
            ("mean".to_string(), self.mean.to_string()),
            ("m2".to_string(), self.m2.to_string()),
            ("errors".to_string(), self.errors.to_string()),
        ]
    }

    fn update(&mut self, sample: f64, is_error: bool) {
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
        if is_error {
            self.errors += 1;
        }
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }
}

#[derive(Debug, Default)]
struct DetectorCounters {
    total_threats: AtomicU64,
    ddos_detections: AtomicU64,
    anomaly_detections: AtomicU64,
    behavioral_detections: AtomicU64,
}

/// Snapshot of lifetime detection counters
#[derive(Debug, Clone, Serialize)]
pub struct ThreatStats {
    pub total_threats: u64,
    pub ddos_detections: u64,
    pub anomaly_detections: u64,
    pub behavioral_detections: u64,
}

struct DetectorInner {
    store: Arc<dyn Store>,
    config: ThreatConfig,
    counters: DashMap<String, RequestCounter>,
    patterns: DashMap<String, BehaviorPattern>,
    stats: DetectorCounters,
}

impl DetectorInner {
    /// Drop expired blocks and evict entries idle past twice their window
    fn sweep(&self) {
        let now = Instant::now();
        let counter_idle = self.config.ddos_window() * 2;
        self.counters.retain(|_, counter| {
            if let Some(until) = counter.blocked_until {
                if until > now {
                    return true;
                }
                counter.blocked_until = None;
            }
            now.duration_since(counter.window_start) <= counter_idle
        });

        let pattern_idle = self.config.behavior_window() * 2;
        self.patterns
            .retain(|_, pattern| now.duration_since(pattern.last_seen) <= pattern_idle);
    }
}

/// Threat detector with local tracking and store-coordinated blocking
pub struct ThreatDetector {
    inner: Arc<DetectorInner>,
    shutdown: watch::Sender<bool>,
}

impl ThreatDetector {
    /// Create a detector and start its background cleanup sweep.
    ///
    /// The sweep stops when [`close`](Self::close) is called or the detector
    /// is dropped.
    pub fn new(store: Arc<dyn Store>, config: ThreatConfig) -> Result<Self, ThreatError> {
        if config.ddos_threshold == 0 {
            return Err(ThreatError::Config(
                "ddos_threshold must be greater than zero".to_string(),
            ));
        }
        if config.ddos_window_seconds == 0 || config.ddos_block_seconds == 0 {
            return Err(ThreatError::Config(
                "ddos windows must be greater than zero".to_string(),
            ));
        }
        if config.anomaly_threshold <= 0.0 {
            return Err(ThreatError::Config(
                "anomaly_threshold must be greater than zero".to_string(),
            ));
        }
        if config.behavior_threshold <= 0.0 {
            return Err(ThreatError::Config(
                "behavior_threshold must be greater than zero".to_string(),
            ));
        }
        if config.cleanup_interval_seconds == 0 {
            return Err(ThreatError::Config(
                "cleanup_interval_seconds must be greater than zero".to_string(),
            ));
        }

        let inner = Arc::new(DetectorInner {
            store,
            config,
            counters: DashMap::new(),
            patterns: DashMap::new(),
            stats: DetectorCounters::default(),
        });
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(Self::run_cleanup(Arc::clone(&inner), rx));
        Ok(Self { inner, shutdown })
    }

    async fn run_cleanup(inner: Arc<DetectorInner>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(inner.config.cleanup_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => inner.sweep(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("threat detector cleanup loop stopped");
    }

    /// Stop the background cleanup sweep
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Analyze one request.
    ///
    /// Runs the DDoS, anomaly and behavioral checks in that order and
    /// returns the first threat found. The behavioral check only runs when
    /// a user id is present.
    pub async fn analyze_request(
        &self,
        source_ip: &str,
        user_id: Option<&str>,
        latency: Duration,
        is_error: bool,
    ) -> Result<Option<Threat>, ThreatError> {
        if let Some(threat) = self.detect_ddos(source_ip).await? {
            self.record_threat(&threat, &self.inner.stats.ddos_detections, "ddos");
            return Ok(Some(threat));
        }
        if let Some(threat) = self.detect_anomaly(source_ip, latency, is_error).await? {
            self.record_threat(&threat, &self.inner.stats.anomaly_detections, "anomaly");
            return Ok(Some(threat));
        }
        if let Some(user) = user_id {
            if let Some(threat) = self.detect_behavioral(user, latency, is_error) {
                self.record_threat(&threat, &self.inner.stats.behavioral_detections, "behavioral");
                return Ok(Some(threat));
            }
        }
        Ok(None)
    }

    /// Whether `ip` is currently blocked.
    ///
    /// The shared store is authoritative across instances; the local
    /// counter's block window is the fallback when the store cannot answer.
    pub async fn is_blocked(&self, ip: &str) -> Result<bool, ThreatError> {
        let key = format_blocked_key(ip);
        match self.inner.store.get(&key).await {
            Ok(Some(raw)) => {
                let expiry = raw.parse::<u64>().unwrap_or(0);
                if expiry > get_current_timestamp() {
                    return Ok(true);
                }
                // Expired marker left behind, clear it
                if let Err(err) = self.inner.store.del(&key).await {
                    warn!("failed to clear expired block marker for {}: {}", ip, err);
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("block lookup for {} fell back to local state: {}", ip, err);
            }
        }

        let now = Instant::now();
        Ok(self
            .inner
            .counters
            .get(ip)
            .map_or(false, |c| c.blocked_until.map_or(false, |until| until > now)))
    }

    /// Lifetime detection counters
    pub fn threat_stats(&self) -> ThreatStats {
        let stats = &self.inner.stats;
        ThreatStats {
            total_threats: stats.total_threats.load(Ordering::Relaxed),
            ddos_detections: stats.ddos_detections.load(Ordering::Relaxed),
            anomaly_detections: stats.anomaly_detections.load(Ordering::Relaxed),
            behavioral_detections: stats.behavioral_detections.load(Ordering::Relaxed),
        }
    }

    async fn detect_ddos(&self, ip: &str) -> Result<Option<Threat>, ThreatError> {
        enum Outcome {
            Clear,
            AlreadyBlocked,
            NewBlock { count: u64 },
        }

        let now = Instant::now();
        let config = &self.inner.config;
        let outcome = {
            let mut counter = self
                .inner
                .counters
                .entry(ip.to_string())
                .or_insert_with(|| RequestCounter {
                    count: 0,
                    window_start: now,
                    blocked_until: None,
                });
            if counter.blocked_until.map_or(false, |until| until > now) {
                Outcome::AlreadyBlocked
            } else {
                if now.duration_since(counter.window_start) > config.ddos_window() {
                    counter.count = 0;
                    counter.window_start = now;
                }
                counter.count += 1;
                if counter.count >= config.ddos_threshold {
                    counter.blocked_until = Some(now + config.ddos_block_duration());
                    Outcome::NewBlock {
                        count: counter.count,
                    }
                } else {
                    Outcome::Clear
                }
            }
        };

        match outcome {
            Outcome::Clear => Ok(None),
            Outcome::AlreadyBlocked => Ok(Some(self.threat(
                ThreatType::Ddos,
                ThreatLevel::High,
                ip,
                "request from a source inside an active block window".to_string(),
                0.9,
                HashMap::new(),
            ))),
            Outcome::NewBlock { count } => {
                // Propagate the block so other instances enforce it too
                let expiry = get_current_timestamp() + config.ddos_block_seconds;
                if let Err(err) = self
                    .inner
                    .store
                    .set_ex(
                        &format_blocked_key(ip),
                        &expiry.to_string(),
                        config.ddos_block_duration(),
                    )
                    .await
                {
                    warn!("failed to propagate block for {} to the store: {}", ip, err);
                }

                let mut metadata = HashMap::new();
                metadata.insert("request_count".to_string(), serde_json::json!(count));
                metadata.insert(
                    "window_seconds".to_string(),
                    serde_json::json!(config.ddos_window_seconds),
                );
                metadata.insert(
                    "block_seconds".to_string(),
                    serde_json::json!(config.ddos_block_seconds),
                );
                Ok(Some(self.threat(
                    ThreatType::Ddos,
                    ThreatLevel::Critical,
                    ip,
                    format!(
                        "{} requests within {}s window, source blocked for {}s",
                        count, config.ddos_window_seconds, config.ddos_block_seconds
                    ),
                    1.0,
                    metadata,
                )))
            }
        }
    }

    async fn detect_anomaly(
        &self,
        ip: &str,
        latency: Duration,
        is_error: bool,
    ) -> Result<Option<Threat>, ThreatError> {
        let key = format_stats_key(ip);
        let latency_ms = latency.as_secs_f64() * 1000.0;

        let mut stats = match self.inner.store.hash_get_all(&key).await {
            Ok(map) => LatencyStats::from_hash(&map),
            Err(err) => {
                warn!("latency statistics unavailable for {}: {}", ip, err);
                return Ok(None);
            }
        };

        let mut threat = None;
        if stats.count >= MIN_ANOMALY_SAMPLES {
            let std_dev = stats.std_dev();
            // Zero variance cannot produce a meaningful z-score
            if std_dev > 0.0 {
                let z_score = (latency_ms - stats.mean).abs() / std_dev;
                if z_score > self.inner.config.anomaly_threshold {
                    let mut metadata = HashMap::new();
                    metadata.insert("z_score".to_string(), serde_json::json!(z_score));
                    metadata.insert("latency_ms".to_string(), serde_json::json!(latency_ms));
                    metadata.insert("mean_ms".to_string(), serde_json::json!(stats.mean));
                    metadata.insert("std_dev_ms".to_string(), serde_json::json!(std_dev));
                    threat = Some(self.threat(
                        ThreatType::Anomaly,
                        ThreatLevel::Medium,
                        ip,
                        format!(
                            "request latency {:.1}ms is {:.1} standard deviations from the mean",
                            latency_ms, z_score
                        ),
                        (z_score / self.inner.config.anomaly_threshold).min(1.0),
                        metadata,
                    ));
                }
            }
        }

        // The running statistics absorb every sample, anomalous or not
        stats.update(latency_ms, is_error);
        match self.inner.store.hash_set(&key, stats.to_fields()).await {
            Ok(()) => {
                if let Err(err) = self.inner.store.expire(&key, STATS_TTL).await {
                    warn!("failed to refresh statistics TTL for {}: {}", ip, err);
                }
            }
            Err(err) => warn!("failed to persist latency statistics for {}: {}", ip, err),
        }

        Ok(threat)
    }

    fn detect_behavioral(&self, user: &str, latency: Duration, is_error: bool) -> Option<Threat> {
        let now = Instant::now();
        let latency_ms = latency.as_secs_f64() * 1000.0;

        let mut pattern = match self.inner.patterns.get_mut(user) {
            Some(pattern) => pattern,
            None => {
                // First sighting seeds the estimate and is never a threat
                self.inner.patterns.insert(
                    user.to_string(),
                    BehaviorPattern {
                        request_rate: 0.0,
                        error_rate: 0.0,
                        avg_latency_ms: latency_ms,
                        last_seen: now,
                        suspicion_score: 0.0,
                    },
                );
                return None;
            }
        };

        let inter_arrival = now.duration_since(pattern.last_seen);
        let instant_rate = 1.0 / inter_arrival.as_secs_f64().max(1e-6);
        pattern.request_rate = EMA_ALPHA * instant_rate + (1.0 - EMA_ALPHA) * pattern.request_rate;
        pattern.error_rate = EMA_ALPHA * if is_error { 1.0 } else { 0.0 }
            + (1.0 - EMA_ALPHA) * pattern.error_rate;
        pattern.avg_latency_ms = EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * pattern.avg_latency_ms;
        pattern.last_seen = now;

        let mut score: f64 = 0.0;
        if pattern.request_rate > 10.0 {
            score += 0.3;
        }
        if pattern.error_rate > 0.5 {
            score += 0.3;
        }
        if pattern.avg_latency_ms < 1.0 || pattern.avg_latency_ms > 1000.0 {
            score += 0.2;
        }
        if inter_arrival < Duration::from_millis(100) {
            score += 0.2;
        }
        let score = score.min(1.0);
        pattern.suspicion_score = score;

        let flagged = score > self.inner.config.behavior_threshold;
        let (request_rate, error_rate, avg_latency_ms) = (
            pattern.request_rate,
            pattern.error_rate,
            pattern.avg_latency_ms,
        );
        drop(pattern);

        if !flagged {
            return None;
        }

        let mut metadata = HashMap::new();
        metadata.insert("request_rate".to_string(), serde_json::json!(request_rate));
        metadata.insert("error_rate".to_string(), serde_json::json!(error_rate));
        metadata.insert(
            "avg_latency_ms".to_string(),
            serde_json::json!(avg_latency_ms),
        );
        Some(self.threat(
            ThreatType::Behavioral,
            ThreatLevel::High,
            user,
            format!("suspicious behavior pattern, score {:.2}", score),
            score,
            metadata,
        ))
    }

    fn record_threat(&self, threat: &Threat, detections: &AtomicU64, kind: &'static str) {
        self.inner.stats.total_threats.fetch_add(1, Ordering::Relaxed);
        detections.fetch_add(1, Ordering::Relaxed);
        counter!("gatekeeper_threats_total", 1, "type" => kind);
        warn!(
            "threat detected: type={:?} level={:?} source={} score={:.2} {}",
            threat.threat_type, threat.level, threat.source, threat.score, threat.description
        );
    }

    fn threat(
        &self,
        threat_type: ThreatType,
        level: ThreatLevel,
        source: &str,
        description: String,
        score: f64,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Threat {
        Threat {
            id: Uuid::new_v4(),
            threat_type,
            level,
            source: source.to_string(),
            description,
            timestamp: Utc::now(),
            metadata,
            score,
        }
    }

    #[cfg(test)]
    pub(crate) fn sweep_now(&self) {
        self.inner.sweep();
    }

    #[cfg(test)]
    pub(crate) fn tracked_sources(&self) -> usize {
        self.inner.counters.len()
    }

    #[cfg(test)]
    pub(crate) fn tracked_users(&self) -> usize {
        self.inner.patterns.len()
    }
}
