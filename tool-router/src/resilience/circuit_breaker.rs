//! Circuit breaker implementation for preventing cascading failures
//!
//! One circuit per remote target. A call is admitted by taking a
//! [`CallPermit`]; the permit is consumed by reporting the outcome, so every
//! admitted call updates the circuit at most once. A permit dropped without a
//! report (cancellation, or the router deciding against the remote after all)
//! counts as neither success nor failure.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial call is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Public view of a circuit's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,

    /// Circuit is open, rejecting requests
    Open,

    /// Circuit is half-open, allowing a single trial request
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Internal phase. An open circuit always knows when it opened.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open {
        opened_at: Instant,
        opened_wall: DateTime<Utc>,
    },
    HalfOpen {
        trial_in_flight: bool,
        opened_wall: DateTime<Utc>,
    },
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn opened_wall(&self) -> Option<DateTime<Utc>> {
        match self {
            Phase::Closed => None,
            Phase::Open { opened_wall, .. } | Phase::HalfOpen { opened_wall, .. } => {
                Some(*opened_wall)
            }
        }
    }

    fn open_now() -> Self {
        Phase::Open {
            opened_at: Instant::now(),
            opened_wall: Utc::now(),
        }
    }
}

/// Serializable snapshot of one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Target name
    pub target: String,

    /// Current state
    pub state: CircuitState,

    /// Failures since the last success
    pub consecutive_failures: u32,

    /// When the circuit last opened; set whenever the state is not CLOSED
    pub opened_at: Option<DateTime<Utc>>,

    /// Configured failure threshold
    pub failure_threshold: u32,

    /// Configured recovery timeout in seconds
    pub recovery_timeout_seconds: f64,

    /// Total failures reported
    pub total_failures: u64,

    /// Total successes reported
    pub total_successes: u64,

    /// Calls rejected while open
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct TargetCircuit {
    target: String,
    config: CircuitBreakerConfig,
    phase: Phase,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    rejected_calls: u64,
}

impl TargetCircuit {
    fn new(target: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.to_string(),
            config,
            phase: Phase::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            rejected_calls: 0,
        }
    }

    fn admit(&mut self) -> Result<bool> {
        match self.phase {
            Phase::Closed => Ok(false),
            Phase::Open {
                opened_at,
                opened_wall,
            } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.recovery_timeout {
                    log::info!(
                        "Circuit breaker for {} transitioning to Half-Open state",
                        self.target
                    );
                    self.phase = Phase::HalfOpen {
                        trial_in_flight: true,
                        opened_wall,
                    };
                    Ok(true)
                } else {
                    self.rejected_calls += 1;
                    let remaining = self.config.recovery_timeout - elapsed;
                    Err(ServiceError::circuit_open(format!(
                        "Circuit for {} is open, rejecting requests for {:.1} more seconds",
                        self.target,
                        remaining.as_secs_f64()
                    )))
                }
            }
            Phase::HalfOpen {
                trial_in_flight: true,
                ..
            } => {
                self.rejected_calls += 1;
                Err(ServiceError::circuit_open(format!(
                    "Circuit for {} is half-open with a trial call in flight",
                    self.target
                )))
            }
            Phase::HalfOpen {
                trial_in_flight: false,
                opened_wall,
            } => {
                self.phase = Phase::HalfOpen {
                    trial_in_flight: true,
                    opened_wall,
                };
                Ok(true)
            }
        }
    }

    fn on_success(&mut self, trial: bool) {
        self.total_successes += 1;

        match self.phase {
            Phase::Closed => {
                // Failures must be consecutive
                self.consecutive_failures = 0;
            }
            Phase::HalfOpen { .. } if trial => {
                log::info!(
                    "Circuit breaker for {} transitioning to Closed state",
                    self.target
                );
                self.phase = Phase::Closed;
                self.consecutive_failures = 0;
            }
            _ => {
                log::debug!(
                    "Ignoring stale success for {} in {} state",
                    self.target,
                    self.phase.state()
                );
            }
        }
    }

    fn on_failure(&mut self, trial: bool) {
        self.total_failures += 1;

        match self.phase {
            Phase::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    log::warn!(
                        "Circuit breaker for {} transitioning to Open state after {} consecutive failures",
                        self.target,
                        self.consecutive_failures
                    );
                    self.phase = Phase::open_now();
                }
            }
            Phase::HalfOpen { .. } if trial => {
                log::warn!(
                    "Trial call for {} failed, circuit breaker re-opening",
                    self.target
                );
                self.consecutive_failures += 1;
                self.phase = Phase::open_now();
            }
            _ => {
                log::debug!(
                    "Ignoring stale failure for {} in {} state",
                    self.target,
                    self.phase.state()
                );
            }
        }
    }

    fn abandon_trial(&mut self) {
        if let Phase::HalfOpen {
            trial_in_flight: true,
            opened_wall,
        } = self.phase
        {
            log::debug!("Trial call for {} abandoned, trial slot released", self.target);
            self.phase = Phase::HalfOpen {
                trial_in_flight: false,
                opened_wall,
            };
        }
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            target: self.target.clone(),
            state: self.phase.state(),
            consecutive_failures: self.consecutive_failures,
            opened_at: self.phase.opened_wall(),
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_seconds: self.config.recovery_timeout.as_secs_f64(),
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            rejected_calls: self.rejected_calls,
        }
    }
}

type SharedCircuit = Arc<Mutex<TargetCircuit>>;

fn lock(circuit: &SharedCircuit) -> MutexGuard<'_, TargetCircuit> {
    circuit.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admission ticket for one remote call
#[must_use = "a permit must be resolved with record_success or record_failure"]
pub struct CallPermit {
    circuit: SharedCircuit,
    trial: bool,
    resolved: bool,
}

impl CallPermit {
    /// Whether this permit is the half-open trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report a successful call
    pub fn record_success(mut self) {
        self.resolved = true;
        lock(&self.circuit).on_success(self.trial);
    }

    /// Report a failed call
    pub fn record_failure(mut self) {
        self.resolved = true;
        lock(&self.circuit).on_failure(self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            lock(&self.circuit).abandon_trial();
        }
    }
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("trial", &self.trial)
            .field("resolved", &self.resolved)
            .finish()
    }
}

/// A thread-safe, per-target circuit breaker
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    default_config: CircuitBreakerConfig,
    circuits: DashMap<String, SharedCircuit>,
}

impl CircuitBreaker {
    /// Create a circuit breaker whose targets use `default_config`
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            circuits: DashMap::new(),
        }
    }

    fn circuit(&self, target: &str) -> SharedCircuit {
        if let Some(existing) = self.circuits.get(target) {
            return Arc::clone(existing.value());
        }

        let entry = self.circuits.entry(target.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TargetCircuit::new(
                target,
                self.default_config.clone(),
            )))
        });
        Arc::clone(entry.value())
    }

    /// Override the configuration of one target
    pub fn configure_target(&self, target: &str, config: CircuitBreakerConfig) {
        let circuit = self.circuit(target);
        lock(&circuit).config = config;
    }

    /// Ask to make a call to `target`.
    ///
    /// Fails fast with [`ServiceError::CircuitOpen`] while the circuit is open
    /// or a half-open trial is already in flight.
    pub fn try_acquire(&self, target: &str) -> Result<CallPermit> {
        let circuit = self.circuit(target);
        let trial = lock(&circuit).admit()?;

        Ok(CallPermit {
            circuit,
            trial,
            resolved: false,
        })
    }

    /// Current state of a target's circuit. Unknown targets are closed.
    pub fn state(&self, target: &str) -> CircuitState {
        self.circuits
            .get(target)
            .map(|circuit| lock(circuit.value()).phase.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Full snapshot of a target's circuit
    pub fn snapshot(&self, target: &str) -> CircuitSnapshot {
        let circuit = self.circuit(target);
        let snapshot = lock(&circuit).snapshot();
        snapshot
    }

    /// Snapshots of every tracked circuit, sorted by target
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let circuits: Vec<SharedCircuit> = self
            .circuits
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshots: Vec<CircuitSnapshot> =
            circuits.iter().map(|c| lock(c).snapshot()).collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }

    /// Reset a target's circuit to closed state (for testing/admin purposes)
    pub fn reset(&self, target: &str) {
        let circuit = self.circuit(target);
        let mut state = lock(&circuit);
        state.phase = Phase::Closed;
        state.consecutive_failures = 0;
        log::info!("Circuit manually reset for target: {}", target);
    }

    /// Names of all tracked targets
    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.circuits.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
