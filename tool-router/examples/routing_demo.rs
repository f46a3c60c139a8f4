//! Routing Demo
//!
//! Builds a router with a flaky in-process "remote" executor and walks
//! through gradual rollout, fallback, the circuit opening and a recovery
//! harness run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use tool_router::{
    Arguments, CallContext, CircuitBreakerConfig, Executor, FeatureFlag, HealthProbe,
    RecoveryTestHarness, RemoteTarget, RetryConfig, RouterBuilder, ServiceError,
    ToolRegistration,
};

const TARGET: &str = "bmad-api";
const FLAG: &str = "bmad_remote_execution";
const TOOL: &str = "bmad_prd_create";

struct FlakyRemote {
    down: AtomicBool,
}

#[async_trait]
impl Executor for FlakyRemote {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        _context: &CallContext,
    ) -> tool_router::Result<Value> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ServiceError::transport("connection reset by peer"));
        }
        Ok(json!({ "tool": tool_name, "doc_id": "prd-remote", "input": arguments }))
    }
}

struct Healthy;

#[async_trait]
impl HealthProbe for Healthy {
    async fn probe(&self, _target: &RemoteTarget) -> tool_router::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("Tool Router Demo");
    println!("================\n");

    let remote = Arc::new(FlakyRemote {
        down: AtomicBool::new(false),
    });

    let router = RouterBuilder::new()
        .remote_executor(
            RemoteTarget::new(TARGET, "http://bmad.internal:8080")?,
            Arc::clone(&remote) as Arc<dyn Executor>,
        )
        .tool(ToolRegistration::remote_capable(TOOL, TARGET, FLAG).require(["project_name"]))
        .local_fn(TOOL, |args| {
            Ok(json!({ "doc_id": "prd-local", "input": args }))
        })
        .flag(FeatureFlag::new(FLAG, true, 50))
        .retry_config(RetryConfig {
            max_retries: 1,
            initial_interval: Duration::from_millis(20),
            ..RetryConfig::default()
        })
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(10),
        })
        .health_probe(Arc::new(Healthy))
        .build()?;

    let mut args = Arguments::new();
    args.insert("project_name".to_string(), json!("apollo"));

    println!("GRADUAL ROLLOUT (50%)");
    println!("---------------------");
    for caller in ["alice", "bob", "carol", "dave", "erin", "frank"] {
        let outcome = router.invoke(TOOL, args.clone(), caller).await;
        println!("{:>6} -> {}", caller, outcome.path_used);
    }

    println!("\nREMOTE OUTAGE");
    println!("-------------");
    router.flags().set_flag(FLAG, true, 100);
    remote.down.store(true, Ordering::SeqCst);
    for attempt in 1..=5 {
        let outcome = router.invoke(TOOL, args.clone(), "alice").await;
        println!(
            "call {}: path={} fallback={} error_kind={:?} remote_attempts={} circuit={}",
            attempt,
            outcome.path_used,
            outcome.fallback,
            outcome.error_kind,
            outcome.remote_attempts,
            router.circuit_breaker().state(TARGET)
        );
    }

    println!("\nMetrics: {:?}", router.metrics());

    println!("\nRECOVERY HARNESS");
    println!("----------------");
    let harness = RecoveryTestHarness::new();
    let report = harness
        .run_suite(RecoveryTestHarness::default_matrix())
        .await?;
    for (strategy, summary) in &report.per_strategy {
        println!("{:>22}: {}/{}", strategy, summary.passed, summary.total);
    }
    println!("Success rate: {:.1}%", report.success_rate * 100.0);

    Ok(())
}
