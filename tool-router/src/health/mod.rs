//! Cached health signal for remote targets
//!
//! A fresh record answers without I/O. An expired or missing record triggers
//! one bounded probe per target; concurrent callers wait on the same probe
//! instead of issuing their own. Probe errors are folded into `healthy=false`
//! and never reach the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Mutex;

use crate::core::RemoteTarget;
use crate::error::{mapping, Result};

/// Path of the health endpoint, relative to the target base URL
pub const HEALTH_PATH: &str = "health";

/// A single liveness check against a target
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Succeeds when the target reports itself healthy
    async fn probe(&self, target: &RemoteTarget) -> Result<()>;
}

/// Probe issuing `GET {base_url}/health`
#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    /// Create a probe with its own connection pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, target: &RemoteTarget) -> Result<()> {
        let url = target.endpoint(HEALTH_PATH)?;
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(mapping::map_status(
                status,
                format!("Health endpoint of {} answered {}", target.name, status),
            ))
        }
    }
}

/// Last probe result for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Target name
    pub target: String,

    /// Outcome of the last probe
    pub healthy: bool,

    /// When the probe finished
    pub checked_at: DateTime<Utc>,

    /// How long the record stays authoritative
    pub ttl_seconds: f64,
}

#[derive(Debug, Clone)]
struct CachedRecord {
    record: HealthRecord,
    checked: Instant,
}

/// Health checker with TTL cache and single-flight probing
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    ttl: Duration,
    probe_timeout: Duration,
    records: DashMap<String, CachedRecord>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    probes: AtomicU64,
}

impl HealthChecker {
    /// Create a checker
    pub fn new(probe: Arc<dyn HealthProbe>, ttl: Duration, probe_timeout: Duration) -> Self {
        Self {
            probe,
            ttl,
            probe_timeout,
            records: DashMap::new(),
            in_flight: DashMap::new(),
            probes: AtomicU64::new(0),
        }
    }

    /// Create a checker probing over HTTP
    pub fn http(client: Client, ttl: Duration, probe_timeout: Duration) -> Self {
        Self::new(Arc::new(HttpHealthProbe::with_client(client)), ttl, probe_timeout)
    }

    /// Whether `target` is healthy, probing if the cached record is stale
    pub async fn is_healthy(&self, target: &RemoteTarget) -> bool {
        if let Some(healthy) = self.fresh(&target.name) {
            return healthy;
        }

        let lock = self.probe_lock(&target.name);
        let _guard = lock.lock().await;

        // Another caller may have probed while we waited
        if let Some(healthy) = self.fresh(&target.name) {
            return healthy;
        }

        self.probe_and_store(target).await
    }

    /// Non-blocking variant.
    ///
    /// Returns the fresh value when there is one. Otherwise returns the last
    /// known value (false if none) and starts a background probe unless one
    /// is already running. Outside a tokio runtime no probe is started.
    pub fn try_is_healthy(self: &Arc<Self>, target: &RemoteTarget) -> bool {
        if let Some(healthy) = self.fresh(&target.name) {
            return healthy;
        }

        let last_known = self
            .records
            .get(&target.name)
            .map(|cached| cached.record.healthy)
            .unwrap_or(false);

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::debug!(
                    "No runtime available, skipping background health check of {}",
                    target.name
                );
                return last_known;
            }
        };

        if let Ok(guard) = self.probe_lock(&target.name).try_lock_owned() {
            let checker = Arc::clone(self);
            let target = target.clone();
            runtime.spawn(async move {
                let _guard = guard;
                if checker.fresh(&target.name).is_none() {
                    checker.probe_and_store(&target).await;
                }
            });
        }

        last_known
    }

    /// Last record for a target, fresh or not
    pub fn record(&self, target_name: &str) -> Option<HealthRecord> {
        self.records
            .get(target_name)
            .map(|cached| cached.record.clone())
    }

    /// Forget the cached record so the next call probes
    pub fn invalidate(&self, target_name: &str) {
        if self.records.remove(target_name).is_some() {
            log::debug!("Health record for {} invalidated", target_name);
        }
    }

    /// Number of probes issued so far
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Configured record lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn fresh(&self, target_name: &str) -> Option<bool> {
        self.records
            .get(target_name)
            .filter(|cached| cached.checked.elapsed() < self.ttl)
            .map(|cached| cached.record.healthy)
    }

    fn probe_lock(&self, target_name: &str) -> Arc<Mutex<()>> {
        let entry = self
            .in_flight
            .entry(target_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    async fn probe_and_store(&self, target: &RemoteTarget) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        log::debug!("Probing health of {}", target);

        let healthy = match tokio::time::timeout(self.probe_timeout, self.probe.probe(target)).await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::warn!("Health probe for {} failed: {}", target.name, e);
                false
            }
            Err(_) => {
                log::warn!(
                    "Health probe for {} timed out after {:?}",
                    target.name,
                    self.probe_timeout
                );
                false
            }
        };

        let previous = self.records.insert(
            target.name.clone(),
            CachedRecord {
                record: HealthRecord {
                    target: target.name.clone(),
                    healthy,
                    checked_at: Utc::now(),
                    ttl_seconds: self.ttl.as_secs_f64(),
                },
                checked: Instant::now(),
            },
        );

        if previous.map(|p| p.record.healthy) != Some(healthy) {
            log::info!(
                "Target {} is now {}",
                target.name,
                if healthy { "healthy" } else { "unhealthy" }
            );
        }

        healthy
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("ttl", &self.ttl)
            .field("probe_timeout", &self.probe_timeout)
            .field("targets", &self.records.len())
            .field("probes", &self.probe_count())
            .finish()
    }
}
