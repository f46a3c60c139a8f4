//! Tests for the routing decision and fallback protocol
//!
//! The remote executor and the health probe are mocked, so every test can
//! assert exactly how many remote calls a decision made.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::core::{Arguments, MockExecutor, PathUsed, RemoteTarget, RouterBuilder, ToolInvocation, ToolRegistration};
    use crate::error::{ErrorKind, ServiceError};
    use crate::flags::FeatureFlag;
    use crate::health::MockHealthProbe;
    use crate::resilience::{CircuitBreakerConfig, CircuitState, FixedBackoffPolicy, RetryConfig};
    use crate::router::ToolRouter;

    const TARGET: &str = "bmad-api";
    const FLAG: &str = "remote_execution";
    const TOOL: &str = "bmad_prd_create";
    const REMOTE_ONLY_TOOL: &str = "bmad_cluster_status";

    fn probe(healthy: bool) -> MockHealthProbe {
        let mut probe = MockHealthProbe::new();
        probe.expect_probe().returning(move |_| {
            if healthy {
                Ok(())
            } else {
                Err(ServiceError::transport("health endpoint unreachable"))
            }
        });
        probe
    }

    fn builder(remote: MockExecutor, healthy: bool, rollout: i64, max_retries: u32) -> RouterBuilder {
        RouterBuilder::new()
            .remote_executor(
                RemoteTarget::new(TARGET, "http://bmad.invalid").unwrap(),
                Arc::new(remote),
            )
            .tool(ToolRegistration::remote_capable(TOOL, TARGET, FLAG).require(["project_name"]))
            .tool(ToolRegistration::remote_capable(REMOTE_ONLY_TOOL, TARGET, FLAG))
            .local_fn(TOOL, |args| Ok(json!({ "path": "local", "arguments": args })))
            .flag(FeatureFlag::new(FLAG, true, rollout))
            .health_probe(Arc::new(probe(healthy)))
            .retry_config(RetryConfig {
                max_retries,
                ..RetryConfig::default()
            })
            .backoff_policy(Arc::new(FixedBackoffPolicy::immediate()))
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(60),
            })
            .remote_timeout(Duration::from_millis(200))
    }

    fn router(remote: MockExecutor, healthy: bool, rollout: i64) -> ToolRouter {
        builder(remote, healthy, rollout, 0).build().unwrap()
    }

    fn arguments() -> Arguments {
        let mut args = Arguments::new();
        args.insert("project_name".to_string(), json!("apollo"));
        args
    }

    #[tokio::test]
    async fn test_flag_off_routes_local_without_remote_call() {
        let mut remote = MockExecutor::new();
        remote.expect_execute().times(0);

        let router = router(remote, true, 0);
        let outcome = router.invoke(TOOL, arguments(), "user-1").await;

        assert!(outcome.success);
        assert_eq!(outcome.path_used, PathUsed::Local);
        assert!(!outcome.fallback);
        assert_eq!(outcome.remote_attempts, 0);
        assert_eq!(router.metrics().local_direct, 1);
    }

    #[tokio::test]
    async fn test_eligible_and_healthy_routes_remote() {
        let mut remote = MockExecutor::new();
        remote
            .expect_execute()
            .times(1)
            .returning(|tool, _, _| Ok(json!({ "path": "remote", "tool": tool })));

        let router = router(remote, true, 100);
        let outcome = router.invoke(TOOL, arguments(), "user-1").await;

        assert!(outcome.success);
        assert_eq!(outcome.path_used, PathUsed::Remote);
        assert_eq!(outcome.result, Some(json!({ "path": "remote", "tool": TOOL })));
        assert_eq!(outcome.error_kind, None);
        assert_eq!(outcome.remote_attempts, 1);
        assert!(outcome.latency_ms >= 0.0);
        assert_eq!(router.metrics().remote_successes, 1);
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_with_original_kind() {
        let mut remote = MockExecutor::new();
        remote
            .expect_execute()
            .times(1)
            .returning(|_, _, _| Err(ServiceError::auth("token rejected")));

        let router = router(remote, true, 100);
        let outcome = router.invoke(TOOL, arguments(), "user-1").await;

        assert!(outcome.success);
        assert_eq!(outcome.path_used, PathUsed::Local);
        assert!(outcome.fallback);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Auth));
        assert_eq!(outcome.remote_attempts, 1);

        let snapshot = router.circuit_breaker().snapshot(TARGET);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(router.metrics().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_before_fallback() {
        let mut remote = MockExecutor::new();
        remote
            .expect_execute()
            .times(3)
            .returning(|_, _, _| Err(ServiceError::transport("connection reset")));

        let router = builder(remote, true, 100, 2).build().unwrap();
        let outcome = router.invoke(TOOL, arguments(), "user-1").await;

        assert_eq!(outcome.path_used, PathUsed::Local);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Transport));
        assert_eq!(outcome.remote_attempts, 3);
        // One failed invocation is one circuit failure, however many attempts
        assert_eq!(router.circuit_breaker().snapshot(TARGET).consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let mut remote = MockExecutor::new();
        remote
            .expect_execute()
            .times(5)
            .returning(|_, _, _| Err(ServiceError::transport("connection refused")));

        let router = router(remote, true, 100);
        for _ in 0..5 {
            let outcome = router.invoke(TOOL, arguments(), "user-1").await;
            assert!(outcome.fallback);
        }
        assert_eq!(router.circuit_breaker().state(TARGET), CircuitState::Open);

        // Sixth call never reaches the remote
        let outcome = router.invoke(TOOL, arguments(), "user-1").await;
        assert!(outcome.success);
        assert_eq!(outcome.path_used, PathUsed::Local);
        assert_eq!(outcome.remote_attempts, 0);
        assert!(!outcome.fallback);
    }

    #[tokio::test]
    async fn test_unhealthy_target_routes_local_and_leaves_circuit_alone() {
        let mut remote = MockExecutor::new();
        remote.expect_execute().times(0);

        let router = router(remote, false, 100);
        let outcome = router.invoke(TOOL, arguments(), "user-1").await;

        assert!(outcome.success);
        assert_eq!(outcome.path_used, PathUsed::Local);
        assert_eq!(outcome.remote_attempts, 0);

        let snapshot = router.circuit_breaker().snapshot(TARGET);
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.total_failures, 0);
    }

    #[tokio::test]
    async fn test_missing_required_argument_is_validation() {
        let mut remote = MockExecutor::new();
        remote.expect_execute().times(0);

        let router = router(remote, true, 100);
        let outcome = router.invoke(TOOL, Arguments::new(), "user-1").await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Validation));
        assert_eq!(outcome.result, None);
        assert_eq!(router.metrics().validation_rejections, 1);
        assert_eq!(router.circuit_breaker().snapshot(TARGET).total_failures, 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_validation() {
        let mut remote = MockExecutor::new();
        remote.expect_execute().times(0);

        let router = router(remote, true, 100);
        let outcome = router.invoke("no_such_tool", arguments(), "user-1").await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_remote_only_failure_is_handled() {
        let mut remote = MockExecutor::new();
        remote
            .expect_execute()
            .times(1)
            .returning(|_, _, _| Err(ServiceError::remote("boom")));

        let router = router(remote, true, 100);
        let outcome = router
            .invoke(REMOTE_ONLY_TOOL, Arguments::new(), "user-1")
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.path_used, PathUsed::Remote);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Remote));
        assert_eq!(outcome.remote_attempts, 1);
    }

    #[tokio::test]
    async fn test_remote_only_with_flag_disabled() {
        let mut remote = MockExecutor::new();
        remote.expect_execute().times(0);

        let router = router(remote, true, 100);
        router.flags().set_flag(FLAG, false, 100);

        let outcome = router
            .invoke(REMOTE_ONLY_TOOL, Arguments::new(), "user-1")
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.path_used, PathUsed::Remote);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Unavailable));
        assert_eq!(outcome.remote_attempts, 0);
        assert_eq!(router.circuit_breaker().state(TARGET), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_remote_only_outside_rollout() {
        let mut remote = MockExecutor::new();
        remote.expect_execute().times(0);

        let router = router(remote, true, 0);
        let outcome = router
            .invoke(REMOTE_ONLY_TOOL, Arguments::new(), "user-1")
            .await;

        assert_eq!(outcome.path_used, PathUsed::Remote);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Unavailable));
    }

    #[tokio::test]
    async fn test_remote_only_with_open_circuit() {
        let mut remote = MockExecutor::new();
        remote.expect_execute().times(0);

        let router = router(remote, true, 100);
        for _ in 0..5 {
            router
                .circuit_breaker()
                .try_acquire(TARGET)
                .unwrap()
                .record_failure();
        }

        let outcome = router
            .invoke(REMOTE_ONLY_TOOL, Arguments::new(), "user-1")
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.path_used, PathUsed::Remote);
        assert_eq!(outcome.error_kind, Some(ErrorKind::CircuitOpen));
    }

    #[tokio::test]
    async fn test_remote_only_with_unhealthy_target() {
        let mut remote = MockExecutor::new();
        remote.expect_execute().times(0);

        let router = router(remote, false, 100);
        let outcome = router
            .invoke(REMOTE_ONLY_TOOL, Arguments::new(), "user-1")
            .await;

        assert_eq!(outcome.path_used, PathUsed::Remote);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Unavailable));
    }

    #[tokio::test]
    async fn test_caller_token_forwarded() {
        let mut remote = MockExecutor::new();
        remote
            .expect_execute()
            .withf(|_, _, context| {
                context.auth_token.as_deref() == Some("caller-token")
                    && context.caller_identity == "user-1"
            })
            .times(1)
            .returning(|_, _, _| Ok(json!("ok")));

        let router = router(remote, true, 100);
        let invocation =
            ToolInvocation::new(TOOL, arguments(), "user-1").with_auth_token("caller-token");
        let outcome = router.dispatch(invocation).await;

        assert_eq!(outcome.path_used, PathUsed::Remote);
    }

    #[tokio::test]
    async fn test_service_token_used_when_caller_has_none() {
        let mut remote = MockExecutor::new();
        remote
            .expect_execute()
            .withf(|_, _, context| context.auth_token.as_deref() == Some("svc-token"))
            .times(1)
            .returning(|_, _, _| Ok(json!("ok")));

        let router = builder(remote, true, 100, 0)
            .service_token("svc-token")
            .build()
            .unwrap();
        let outcome = router.invoke(TOOL, arguments(), "user-1").await;

        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_local_failure_after_remote_failure() {
        let mut remote = MockExecutor::new();
        remote
            .expect_execute()
            .times(1)
            .returning(|_, _, _| Err(ServiceError::remote("boom")));

        let router = builder(remote, true, 100, 0)
            .local_fn(TOOL, |_| Err(ServiceError::internal("template store offline")))
            .build()
            .unwrap();
        let outcome = router.invoke(TOOL, arguments(), "user-1").await;

        assert!(!outcome.success);
        assert_eq!(outcome.path_used, PathUsed::Local);
        assert!(outcome.fallback);
        assert_eq!(outcome.error_kind, Some(ErrorKind::LocalExecution));
    }

    #[tokio::test]
    async fn test_outcome_serialization() {
        let mut remote = MockExecutor::new();
        remote
            .expect_execute()
            .returning(|_, _, _| Err(ServiceError::timeout("slow")));

        let router = router(remote, true, 100);
        let outcome = router.invoke(TOOL, arguments(), "user-1").await;
        let value = serde_json::to_value(&outcome).unwrap();

        assert_eq!(value["path_used"], "LOCAL");
        assert_eq!(value["error_kind"], "timeout");
        assert_eq!(value["fallback"], true);
        assert_eq!(value["success"], true);
    }
}
