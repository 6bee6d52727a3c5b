//! Per-service circuit breaker
//!
//! Tracks consecutive failures per named service and imposes a cooldown once
//! `max_failures` is reached. The monitor is a pure admission oracle: callers
//! consult [`HealthMonitor::is_healthy`] before an attempt and report the
//! outcome afterwards.
//!
//! ```text
//! healthy --(failure_count >= max_failures)--> open (cooldown_until = now + cooldown)
//! open    --(now >= cooldown_until, on check)--> healthy, failure_count = 0
//! any     --(report_success)--> healthy, failure_count = 0
//! any     --(untouched for healthy_threshold, on check)--> healthy, failure_count = 0
//! ```

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use ts_rs::TS;

use crate::config::HealthConfig;

pub const DEFAULT_MAX_FAILURES: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_HEALTHY_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Health bookkeeping for one service name
#[derive(Debug, Clone)]
pub struct ServiceHealthRecord {
    pub service_name: String,
    pub is_healthy: bool,
    pub failure_count: u32,
    pub last_checked_at: Instant,
    pub cooldown_until: Option<Instant>,
}

impl ServiceHealthRecord {
    fn new(service_name: &str, now: Instant) -> Self {
        Self {
            service_name: service_name.to_string(),
            is_healthy: true,
            failure_count: 0,
            last_checked_at: now,
            cooldown_until: None,
        }
    }

    fn recover(&mut self) {
        self.is_healthy = true;
        self.failure_count = 0;
        self.cooldown_until = None;
    }
}

/// Serializable view of a health record for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthSnapshot {
    pub service_name: String,
    pub is_healthy: bool,
    pub failure_count: u32,
    pub last_checked_ms_ago: u64,
    pub cooldown_remaining_ms: u64,
}

/// Circuit breaker keyed by service name.
///
/// Constructed once by the process entry point and shared by reference
/// (`Arc<HealthMonitor>`) with every component that calls an external service.
#[derive(Debug)]
pub struct HealthMonitor {
    records: Mutex<HashMap<String, ServiceHealthRecord>>,
    max_failures: u32,
    cooldown: Duration,
    healthy_threshold: Duration,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_MAX_FAILURES, DEFAULT_COOLDOWN, DEFAULT_HEALTHY_THRESHOLD)
    }

    pub fn with_params(max_failures: u32, cooldown: Duration, healthy_threshold: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_failures: max_failures.max(1),
            cooldown,
            healthy_threshold,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::with_params(
            config.max_failures,
            Duration::from_millis(config.cooldown_ms),
            Duration::from_millis(config.healthy_threshold_ms),
        )
    }

    // Record updates never hold the lock across an await, so a poisoned map is
    // still internally consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServiceHealthRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether calls to `service_name` should be attempted right now.
    ///
    /// Creates a healthy record on first access. An elapsed cooldown, or a record
    /// untouched for longer than the healthy threshold, is reset as a side effect.
    pub fn is_healthy(&self, service_name: &str) -> bool {
        let now = Instant::now();
        let mut records = self.lock();
        let record = records
            .entry(service_name.to_string())
            .or_insert_with(|| ServiceHealthRecord::new(service_name, now));

        match record.cooldown_until {
            Some(until) if now >= until => {
                tracing::info!("[HEALTH] Cooldown elapsed for {}, closing circuit", service_name);
                record.recover();
            }
            _ if record.failure_count > 0
                && now.duration_since(record.last_checked_at) >= self.healthy_threshold =>
            {
                tracing::debug!(
                    "[HEALTH] {} untouched for {:?}, assuming recovered",
                    service_name,
                    self.healthy_threshold
                );
                record.recover();
            }
            _ => {}
        }

        record.is_healthy
    }

    pub fn report_success(&self, service_name: &str) {
        let now = Instant::now();
        let mut records = self.lock();
        let record = records
            .entry(service_name.to_string())
            .or_insert_with(|| ServiceHealthRecord::new(service_name, now));

        if !record.is_healthy {
            tracing::info!("[HEALTH] {} recovered", service_name);
        }
        record.recover();
        record.last_checked_at = now;
    }

    pub fn report_failure(&self, service_name: &str) {
        let now = Instant::now();
        let mut records = self.lock();
        let record = records
            .entry(service_name.to_string())
            .or_insert_with(|| ServiceHealthRecord::new(service_name, now));

        record.failure_count = record.failure_count.saturating_add(1);
        record.last_checked_at = now;

        if record.failure_count >= self.max_failures {
            if record.is_healthy {
                tracing::warn!(
                    "[HEALTH] Opening circuit for {} after {} consecutive failures (cooldown {:?})",
                    service_name,
                    record.failure_count,
                    self.cooldown
                );
            }
            record.is_healthy = false;
            record.cooldown_until = Some(now + self.cooldown);
        } else {
            tracing::debug!(
                "[HEALTH] {} failure {}/{}",
                service_name,
                record.failure_count,
                self.max_failures
            );
        }
    }

    /// Manually close the circuit for a service
    pub fn reset(&self, service_name: &str) {
        if let Some(record) = self.lock().get_mut(service_name) {
            record.recover();
        }
    }

    pub fn record(&self, service_name: &str) -> Option<ServiceHealthRecord> {
        self.lock().get(service_name).cloned()
    }

    /// Current state of every tracked service, sorted by name
    pub fn snapshot(&self) -> Vec<ServiceHealthSnapshot> {
        let now = Instant::now();
        let mut snapshot: Vec<ServiceHealthSnapshot> = self
            .lock()
            .values()
            .map(|record| ServiceHealthSnapshot {
                service_name: record.service_name.clone(),
                is_healthy: record.is_healthy,
                failure_count: record.failure_count,
                last_checked_ms_ago: now.duration_since(record.last_checked_at).as_millis() as u64,
                cooldown_remaining_ms: record
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                    .unwrap_or(0),
            })
            .collect();
        snapshot.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        snapshot
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
