//! Recovery validation under synthetic failures
//!
//! The harness builds a fresh router per case whose remote executor is a
//! [`FaultInjectingExecutor`] around a healthy stub, drives the case's
//! recovery strategy through it, and compares what the router did with
//! what the strategy promises.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{
    Arguments, CallContext, ExecutionOutcome, Executor, PathUsed, RemoteTarget, RouterBuilder,
    ToolRegistration,
};
use crate::error::{ErrorKind, Result, ServiceError};
use crate::flags::FeatureFlag;
use crate::health::HealthProbe;
use crate::resilience::{CircuitBreakerConfig, CircuitState, FixedBackoffPolicy, RetryConfig};
use crate::router::ToolRouter;

const HARNESS_TARGET: &str = "harness-remote";
const HARNESS_FLAG: &str = "harness_remote_execution";
const HARNESS_TOOL: &str = "harness_tool";
const HARNESS_CALLER: &str = "recovery-harness";
const REQUIRED_ARG: &str = "payload";

/// Error kinds the harness knows how to inject
pub const INJECTABLE_KINDS: [ErrorKind; 6] = [
    ErrorKind::Transport,
    ErrorKind::Timeout,
    ErrorKind::Auth,
    ErrorKind::RateLimit,
    ErrorKind::Validation,
    ErrorKind::Remote,
];

/// Recovery strategy under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Bounded retry of transient failures
    Retry,
    /// Local execution after remote failure
    Fallback,
    /// Fast local routing once the circuit opens
    CircuitBreaker,
    /// Short deadline on remote attempts
    Timeout,
    /// Remote-only tool failing without a crash
    GracefulDegradation,
}

impl RecoveryStrategy {
    /// Every strategy
    pub const ALL: [RecoveryStrategy; 5] = [
        RecoveryStrategy::Retry,
        RecoveryStrategy::Fallback,
        RecoveryStrategy::CircuitBreaker,
        RecoveryStrategy::Timeout,
        RecoveryStrategy::GracefulDegradation,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::CircuitBreaker => "circuit_breaker",
            RecoveryStrategy::Timeout => "timeout",
            RecoveryStrategy::GracefulDegradation => "graceful_degradation",
        }
    }

    fn has_local_path(&self) -> bool {
        !matches!(self, RecoveryStrategy::GracefulDegradation)
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of what the router did for the final call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutcome {
    /// Answered by the remote path
    RemoteSuccess,
    /// Answered locally after the remote path failed
    LocalFallback,
    /// Answered locally because the circuit was open
    CircuitOpen,
    /// Failed cleanly with an error kind
    HandledFailure,
}

impl ExpectedOutcome {
    /// Outcome promised by `strategy` when `kind` is always injected
    pub fn derive(kind: ErrorKind, strategy: RecoveryStrategy) -> Self {
        if kind == ErrorKind::Validation {
            // Rejected before routing, whatever the strategy
            return ExpectedOutcome::HandledFailure;
        }

        match strategy {
            RecoveryStrategy::Retry | RecoveryStrategy::Fallback | RecoveryStrategy::Timeout => {
                ExpectedOutcome::LocalFallback
            }
            RecoveryStrategy::CircuitBreaker => ExpectedOutcome::CircuitOpen,
            RecoveryStrategy::GracefulDegradation => ExpectedOutcome::HandledFailure,
        }
    }
}

impl fmt::Display for ExpectedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExpectedOutcome::RemoteSuccess => "remote_success",
            ExpectedOutcome::LocalFallback => "local_fallback",
            ExpectedOutcome::CircuitOpen => "circuit_open",
            ExpectedOutcome::HandledFailure => "handled_failure",
        };
        f.write_str(name)
    }
}

/// One combination to validate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryTestCase {
    /// Error kind to inject
    pub error_kind: ErrorKind,

    /// Strategy under test
    pub recovery_strategy: RecoveryStrategy,

    /// Chance that a remote attempt is replaced by the injected error
    pub injection_probability: f64,

    /// Outcome the strategy promises under full injection
    pub expected_outcome: ExpectedOutcome,
}

impl RecoveryTestCase {
    /// Create a case, deriving the expected outcome
    pub fn new(
        error_kind: ErrorKind,
        recovery_strategy: RecoveryStrategy,
        injection_probability: f64,
    ) -> Result<Self> {
        Self::with_expected(
            error_kind,
            recovery_strategy,
            injection_probability,
            ExpectedOutcome::derive(error_kind, recovery_strategy),
        )
    }

    /// Create a case with an explicit expectation
    pub fn with_expected(
        error_kind: ErrorKind,
        recovery_strategy: RecoveryStrategy,
        injection_probability: f64,
        expected_outcome: ExpectedOutcome,
    ) -> Result<Self> {
        if !INJECTABLE_KINDS.contains(&error_kind) {
            return Err(ServiceError::validation(format!(
                "Error kind {} cannot be injected",
                error_kind
            )));
        }

        if !(0.0..=1.0).contains(&injection_probability) {
            return Err(ServiceError::validation(format!(
                "Injection probability must be within 0..=1, got {}",
                injection_probability
            )));
        }

        Ok(Self {
            error_kind,
            recovery_strategy,
            injection_probability,
            expected_outcome,
        })
    }

    /// Outcomes that count as a match.
    ///
    /// Partial injection may let any call through, so the remote answer and
    /// a plain fallback are then acceptable too.
    fn acceptable_outcomes(&self) -> Vec<ExpectedOutcome> {
        if self.injection_probability <= 0.0 {
            return vec![ExpectedOutcome::RemoteSuccess];
        }

        let mut acceptable = vec![self.expected_outcome];
        if self.injection_probability < 1.0 {
            acceptable.push(ExpectedOutcome::RemoteSuccess);
            if self.recovery_strategy.has_local_path() {
                acceptable.push(ExpectedOutcome::LocalFallback);
            }
        }
        acceptable
    }

    fn label(&self) -> String {
        format!("{}/{}", self.error_kind, self.recovery_strategy)
    }
}

/// What the router actually did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedOutcome {
    /// Classification of the final call
    pub outcome: ExpectedOutcome,

    /// Final call as returned by the router
    pub final_call: ExecutionOutcome,

    /// Invocations made for the case
    pub calls: u32,

    /// Remote attempts across all calls
    pub total_remote_attempts: u32,

    /// Faults the injector raised
    pub injected_faults: u32,

    /// Circuit state after the last call
    pub circuit_state: CircuitState,
}

/// Result of one case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    /// The case that ran
    pub case: RecoveryTestCase,

    /// What happened
    pub observed_outcome: ObservedOutcome,

    /// Whether the observation satisfies the strategy
    pub matches_expected: bool,

    /// Why the case did not match, when it did not
    pub mismatch: Option<String>,

    /// When the case finished
    pub completed_at: DateTime<Utc>,
}

/// Per-strategy tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySummary {
    /// Cases run
    pub total: usize,
    /// Cases that matched
    pub passed: usize,
}

/// Aggregate of a suite run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    /// Cases run
    pub total: usize,

    /// Cases that matched
    pub passed: usize,

    /// passed / total, 1.0 for an empty suite
    pub success_rate: f64,

    /// Tally per strategy
    pub per_strategy: BTreeMap<RecoveryStrategy, StrategySummary>,

    /// Every case result, in input order
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    fn from_results(results: Vec<CaseResult>) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.matches_expected).count();

        let mut per_strategy: BTreeMap<RecoveryStrategy, StrategySummary> = BTreeMap::new();
        for result in &results {
            let summary = per_strategy
                .entry(result.case.recovery_strategy)
                .or_default();
            summary.total += 1;
            if result.matches_expected {
                summary.passed += 1;
            }
        }

        let success_rate = if total == 0 {
            1.0
        } else {
            passed as f64 / total as f64
        };

        Self {
            total,
            passed,
            success_rate,
            per_strategy,
            results,
        }
    }

    /// Results that did not match
    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.results.iter().filter(|r| !r.matches_expected)
    }
}

/// Executor that replaces calls with an injected error at random
pub struct FaultInjectingExecutor {
    inner: Arc<dyn Executor>,
    kind: ErrorKind,
    probability: f64,
    rng: Mutex<StdRng>,
    calls: AtomicU32,
    injected: AtomicU32,
}

impl FaultInjectingExecutor {
    /// Wrap `inner`, injecting `kind` with `probability` using a seeded RNG
    pub fn new(inner: Arc<dyn Executor>, kind: ErrorKind, probability: f64, seed: u64) -> Self {
        Self {
            inner,
            kind,
            probability: probability.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            calls: AtomicU32::new(0),
            injected: AtomicU32::new(0),
        }
    }

    /// Calls that reached the injector
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls replaced by an injected error
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn roll(&self) -> bool {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen::<f64>() < self.probability
    }
}

#[async_trait]
impl Executor for FaultInjectingExecutor {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        context: &CallContext,
    ) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        // Validation faults are injected into the arguments, not here
        if self.kind == ErrorKind::Validation || !self.roll() {
            return self.inner.execute(tool_name, arguments, context).await;
        }

        self.injected.fetch_add(1, Ordering::SeqCst);
        log::debug!("Injecting {} into {}", self.kind, tool_name);

        if self.kind == ErrorKind::Timeout {
            // Outlive the caller's deadline so the real timeout path fires
            tokio::time::sleep(context.timeout + Duration::from_millis(50)).await;
        }

        Err(ServiceError::from_kind(
            self.kind,
            format!("injected {} fault", self.kind),
        ))
    }
}

impl fmt::Debug for FaultInjectingExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultInjectingExecutor")
            .field("kind", &self.kind)
            .field("probability", &self.probability)
            .field("calls", &self.calls())
            .field("injected", &self.injected())
            .finish()
    }
}

/// Healthy remote stand-in: echoes its input
struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        _context: &CallContext,
    ) -> Result<Value> {
        Ok(json!({ "tool": tool_name, "path": "remote", "arguments": arguments }))
    }
}

/// Harness targets are always reported healthy
struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn probe(&self, _target: &RemoteTarget) -> Result<()> {
        Ok(())
    }
}

/// Harness settings
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Retries after the first remote attempt
    pub max_retries: u32,

    /// Failures before the circuit opens
    pub failure_threshold: u32,

    /// Per-attempt remote timeout
    pub remote_timeout: Duration,

    /// Per-attempt timeout for the timeout strategy
    pub short_timeout: Duration,

    /// Delay between retries
    pub retry_delay: Duration,

    /// Base seed; each case derives its own
    pub seed: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            failure_threshold: 3,
            remote_timeout: Duration::from_millis(100),
            short_timeout: Duration::from_millis(30),
            retry_delay: Duration::from_millis(5),
            seed: 0x5eed,
        }
    }
}

/// Runs recovery cases and keeps their results
#[derive(Debug, Default)]
pub struct RecoveryTestHarness {
    config: HarnessConfig,
    history: Mutex<Vec<CaseResult>>,
}

impl RecoveryTestHarness {
    /// Create a harness with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a harness with custom settings
    pub fn with_config(config: HarnessConfig) -> Self {
        Self {
            config,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every injectable kind against every strategy at full injection
    pub fn default_matrix() -> Vec<RecoveryTestCase> {
        INJECTABLE_KINDS
            .into_iter()
            .flat_map(|kind| {
                RecoveryStrategy::ALL
                    .into_iter()
                    .filter_map(move |strategy| RecoveryTestCase::new(kind, strategy, 1.0).ok())
            })
            .collect()
    }

    /// Run one case against a fresh router
    pub async fn run_case(&self, case: RecoveryTestCase) -> Result<CaseResult> {
        let seed = self.case_seed(&case);
        let injector = Arc::new(FaultInjectingExecutor::new(
            Arc::new(EchoExecutor),
            case.error_kind,
            case.injection_probability,
            seed,
        ));
        let router = self.router_for(&case, Arc::clone(&injector) as Arc<dyn Executor>)?;

        let calls = match case.recovery_strategy {
            RecoveryStrategy::CircuitBreaker => self.config.failure_threshold + 1,
            _ => 1,
        };

        let mut arg_rng = StdRng::seed_from_u64(seed ^ 0xa5a5);
        let mut total_remote_attempts = 0;
        let mut final_call = None;
        for _ in 0..calls {
            let omit_required = case.error_kind == ErrorKind::Validation
                && arg_rng.gen::<f64>() < case.injection_probability;
            let outcome = router
                .invoke(HARNESS_TOOL, Self::arguments(omit_required), HARNESS_CALLER)
                .await;
            total_remote_attempts += outcome.remote_attempts;
            final_call = Some(outcome);
        }

        let final_call = final_call
            .ok_or_else(|| ServiceError::internal("Recovery case made no calls"))?;
        let circuit_state = router.circuit_breaker().state(HARNESS_TARGET);

        let observed_outcome = ObservedOutcome {
            outcome: classify(&final_call, circuit_state),
            final_call,
            calls,
            total_remote_attempts,
            injected_faults: injector.injected(),
            circuit_state,
        };

        let mismatch = self.check(&case, &observed_outcome);
        let result = CaseResult {
            matches_expected: mismatch.is_none(),
            mismatch,
            case,
            observed_outcome,
            completed_at: Utc::now(),
        };

        if result.matches_expected {
            log::info!("Recovery case {} passed", result.case.label());
        } else {
            log::warn!(
                "Recovery case {} failed: {}",
                result.case.label(),
                result.mismatch.as_deref().unwrap_or("unknown")
            );
        }

        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result.clone());
        Ok(result)
    }

    /// Run cases concurrently and aggregate the results.
    /// Cases that cannot be set up are reported as errors.
    pub async fn run_suite(&self, cases: Vec<RecoveryTestCase>) -> Result<SuiteReport> {
        let runs = cases.into_iter().map(|case| self.run_case(case));
        let results = join_all(runs)
            .await
            .into_iter()
            .collect::<Result<Vec<CaseResult>>>()?;

        let report = SuiteReport::from_results(results);
        log::info!(
            "Recovery suite finished: {}/{} passed ({:.1}%)",
            report.passed,
            report.total,
            report.success_rate * 100.0
        );
        Ok(report)
    }

    /// Results of every case run so far
    pub fn history(&self) -> Vec<CaseResult> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget all results
    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn case_seed(&self, case: &RecoveryTestCase) -> u64 {
        let kind = INJECTABLE_KINDS
            .iter()
            .position(|k| *k == case.error_kind)
            .unwrap_or(0) as u64;
        let strategy = RecoveryStrategy::ALL
            .iter()
            .position(|s| *s == case.recovery_strategy)
            .unwrap_or(0) as u64;
        self.config.seed.wrapping_mul(31).wrapping_add(kind * 8 + strategy)
    }

    fn router_for(&self, case: &RecoveryTestCase, remote: Arc<dyn Executor>) -> Result<ToolRouter> {
        let timeout = match case.recovery_strategy {
            RecoveryStrategy::Timeout => self.config.short_timeout,
            _ => self.config.remote_timeout,
        };

        let mut builder = RouterBuilder::new()
            .remote_executor(RemoteTarget::new(HARNESS_TARGET, "http://harness.invalid")?, remote)
            .tool(
                ToolRegistration::remote_capable(HARNESS_TOOL, HARNESS_TARGET, HARNESS_FLAG)
                    .require([REQUIRED_ARG]),
            )
            .flag(FeatureFlag::new(HARNESS_FLAG, true, 100))
            .remote_timeout(timeout)
            .retry_config(RetryConfig {
                max_retries: self.config.max_retries,
                ..RetryConfig::default()
            })
            .backoff_policy(Arc::new(FixedBackoffPolicy::new(self.config.retry_delay)))
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: self.config.failure_threshold,
                recovery_timeout: Duration::from_secs(60),
            })
            .health_probe(Arc::new(AlwaysHealthy));

        if case.recovery_strategy.has_local_path() {
            builder = builder.local_fn(HARNESS_TOOL, |args| {
                Ok(json!({ "path": "local", "arguments": args }))
            });
        }

        builder.build()
    }

    fn arguments(omit_required: bool) -> Arguments {
        let mut args = Arguments::new();
        if !omit_required {
            args.insert(REQUIRED_ARG.to_string(), json!("recovery-test"));
        }
        args
    }

    /// Strategy-specific checks; `None` means the case matched
    fn check(&self, case: &RecoveryTestCase, observed: &ObservedOutcome) -> Option<String> {
        if !case.acceptable_outcomes().contains(&observed.outcome) {
            return Some(format!(
                "expected {}, observed {}",
                case.expected_outcome, observed.outcome
            ));
        }

        // Detailed checks only hold when every attempt was faulted
        if case.injection_probability < 1.0 || case.error_kind == ErrorKind::Validation {
            return None;
        }

        let last = &observed.final_call;
        match case.recovery_strategy {
            RecoveryStrategy::Retry => {
                let expected_attempts = if case.error_kind.is_retryable() {
                    self.config.max_retries + 1
                } else {
                    1
                };
                (last.remote_attempts != expected_attempts).then(|| {
                    format!(
                        "expected {} remote attempts, observed {}",
                        expected_attempts, last.remote_attempts
                    )
                })
            }
            RecoveryStrategy::Fallback | RecoveryStrategy::Timeout => {
                (last.error_kind != Some(case.error_kind) || !last.fallback).then(|| {
                    format!(
                        "expected fallback tagged {}, observed {:?} (fallback={})",
                        case.error_kind, last.error_kind, last.fallback
                    )
                })
            }
            RecoveryStrategy::CircuitBreaker => {
                (observed.circuit_state != CircuitState::Open || last.remote_attempts != 0).then(
                    || {
                        format!(
                            "expected open circuit and no remote attempts, observed {} with {}",
                            observed.circuit_state, last.remote_attempts
                        )
                    },
                )
            }
            RecoveryStrategy::GracefulDegradation => {
                (last.path_used != PathUsed::Remote || last.error_kind != Some(case.error_kind))
                    .then(|| {
                        format!(
                            "expected REMOTE failure tagged {}, observed {} {:?}",
                            case.error_kind, last.path_used, last.error_kind
                        )
                    })
            }
        }
    }
}

fn classify(outcome: &ExecutionOutcome, circuit_state: CircuitState) -> ExpectedOutcome {
    match (outcome.success, outcome.path_used) {
        (false, _) => ExpectedOutcome::HandledFailure,
        (true, PathUsed::Remote) => ExpectedOutcome::RemoteSuccess,
        (true, PathUsed::Local)
            if !outcome.fallback
                && outcome.remote_attempts == 0
                && circuit_state == CircuitState::Open =>
        {
            ExpectedOutcome::CircuitOpen
        }
        (true, PathUsed::Local) => ExpectedOutcome::LocalFallback,
    }
}
