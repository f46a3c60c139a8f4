//! Tests for the recovery test harness

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::core::{Arguments, CallContext, Executor, MockExecutor};
    use crate::error::ErrorKind;
    use crate::harness::{
        ExpectedOutcome, FaultInjectingExecutor, RecoveryStrategy, RecoveryTestCase,
        RecoveryTestHarness,
    };
    use crate::resilience::CircuitState;

    fn case(kind: ErrorKind, strategy: RecoveryStrategy, probability: f64) -> RecoveryTestCase {
        RecoveryTestCase::new(kind, strategy, probability).unwrap()
    }

    #[tokio::test]
    async fn test_timeout_with_retry_shows_retries() {
        let harness = RecoveryTestHarness::new();
        let result = harness
            .run_case(case(ErrorKind::Timeout, RecoveryStrategy::Retry, 1.0))
            .await
            .unwrap();

        assert!(result.matches_expected, "{:?}", result.mismatch);
        let observed = &result.observed_outcome;
        assert_eq!(observed.outcome, ExpectedOutcome::LocalFallback);
        assert_eq!(observed.final_call.remote_attempts, 3);
        assert_eq!(observed.final_call.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(observed.injected_faults, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_kind_attempted_once() {
        let harness = RecoveryTestHarness::new();
        let result = harness
            .run_case(case(ErrorKind::Auth, RecoveryStrategy::Retry, 1.0))
            .await
            .unwrap();

        assert!(result.matches_expected, "{:?}", result.mismatch);
        assert_eq!(result.observed_outcome.final_call.remote_attempts, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_strategy_opens_circuit() {
        let harness = RecoveryTestHarness::new();
        let result = harness
            .run_case(case(ErrorKind::Remote, RecoveryStrategy::CircuitBreaker, 1.0))
            .await
            .unwrap();

        assert!(result.matches_expected, "{:?}", result.mismatch);
        let observed = &result.observed_outcome;
        assert_eq!(observed.calls, 4);
        assert_eq!(observed.circuit_state, CircuitState::Open);
        assert_eq!(observed.outcome, ExpectedOutcome::CircuitOpen);
        assert_eq!(observed.final_call.remote_attempts, 0);
    }

    #[tokio::test]
    async fn test_graceful_degradation_is_handled_failure() {
        let harness = RecoveryTestHarness::new();
        let result = harness
            .run_case(case(
                ErrorKind::Transport,
                RecoveryStrategy::GracefulDegradation,
                1.0,
            ))
            .await
            .unwrap();

        assert!(result.matches_expected, "{:?}", result.mismatch);
        assert!(!result.observed_outcome.final_call.success);
        assert_eq!(
            result.observed_outcome.final_call.error_kind,
            Some(ErrorKind::Transport)
        );
    }

    #[tokio::test]
    async fn test_validation_rejected_before_routing() {
        let harness = RecoveryTestHarness::new();
        let result = harness
            .run_case(case(ErrorKind::Validation, RecoveryStrategy::Fallback, 1.0))
            .await
            .unwrap();

        assert!(result.matches_expected, "{:?}", result.mismatch);
        assert_eq!(result.observed_outcome.outcome, ExpectedOutcome::HandledFailure);
        assert_eq!(result.observed_outcome.total_remote_attempts, 0);
    }

    #[tokio::test]
    async fn test_zero_probability_stays_remote() {
        let harness = RecoveryTestHarness::new();
        let result = harness
            .run_case(case(ErrorKind::Transport, RecoveryStrategy::Fallback, 0.0))
            .await
            .unwrap();

        assert!(result.matches_expected, "{:?}", result.mismatch);
        assert_eq!(result.observed_outcome.outcome, ExpectedOutcome::RemoteSuccess);
        assert_eq!(result.observed_outcome.injected_faults, 0);
    }

    #[tokio::test]
    async fn test_wrong_expectation_is_reported() {
        let harness = RecoveryTestHarness::new();
        let wrong = RecoveryTestCase::with_expected(
            ErrorKind::Auth,
            RecoveryStrategy::Fallback,
            1.0,
            ExpectedOutcome::RemoteSuccess,
        )
        .unwrap();

        let result = harness.run_case(wrong).await.unwrap();
        assert!(!result.matches_expected);
        assert!(result.mismatch.unwrap().contains("local_fallback"));
    }

    #[tokio::test]
    async fn test_default_matrix_passes() {
        let harness = RecoveryTestHarness::new();
        let matrix = RecoveryTestHarness::default_matrix();
        assert_eq!(matrix.len(), 6 * 5);

        let report = harness.run_suite(matrix).await.unwrap();
        let failures: Vec<String> = report
            .failures()
            .map(|r| format!("{:?}", r.mismatch))
            .collect();

        assert!(failures.is_empty(), "failures: {:?}", failures);
        assert_eq!(report.total, 30);
        assert_eq!(report.success_rate, 1.0);
        assert_eq!(report.per_strategy[&RecoveryStrategy::Retry].total, 6);
        assert_eq!(harness.history().len(), 30);
    }

    #[tokio::test]
    async fn test_history_and_clear() {
        let harness = RecoveryTestHarness::new();
        harness
            .run_case(case(ErrorKind::RateLimit, RecoveryStrategy::Fallback, 1.0))
            .await
            .unwrap();
        assert_eq!(harness.history().len(), 1);

        harness.clear_history();
        assert!(harness.history().is_empty());

        let report = harness.run_suite(Vec::new()).await.unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.success_rate, 1.0);
    }

    #[test]
    fn test_case_validation() {
        assert!(RecoveryTestCase::new(ErrorKind::Timeout, RecoveryStrategy::Retry, 1.5).is_err());
        assert!(RecoveryTestCase::new(ErrorKind::Timeout, RecoveryStrategy::Retry, -0.1).is_err());
        assert!(
            RecoveryTestCase::new(ErrorKind::CircuitOpen, RecoveryStrategy::Retry, 1.0).is_err()
        );
    }

    #[test]
    fn test_expected_outcome_derivation() {
        use ExpectedOutcome::*;
        use RecoveryStrategy::*;

        assert_eq!(ExpectedOutcome::derive(ErrorKind::Timeout, Retry), LocalFallback);
        assert_eq!(ExpectedOutcome::derive(ErrorKind::Auth, Fallback), LocalFallback);
        assert_eq!(ExpectedOutcome::derive(ErrorKind::Remote, CircuitBreaker), CircuitOpen);
        assert_eq!(
            ExpectedOutcome::derive(ErrorKind::Transport, GracefulDegradation),
            HandledFailure
        );
        assert_eq!(ExpectedOutcome::derive(ErrorKind::Validation, Retry), HandledFailure);
    }

    #[tokio::test]
    async fn test_injection_is_seeded() {
        fn injector(seed: u64) -> FaultInjectingExecutor {
            let mut inner = MockExecutor::new();
            inner.expect_execute().returning(|_, _, _| Ok(json!("ok")));
            FaultInjectingExecutor::new(Arc::new(inner), ErrorKind::Transport, 0.5, seed)
        }

        let context = CallContext::new("user-1", Duration::from_secs(1));
        let args = Arguments::new();
        let (a, b) = (injector(7), injector(7));

        let mut pattern_a = Vec::new();
        let mut pattern_b = Vec::new();
        for _ in 0..32 {
            pattern_a.push(a.execute("t", &args, &context).await.is_err());
            pattern_b.push(b.execute("t", &args, &context).await.is_err());
        }

        assert_eq!(pattern_a, pattern_b);
        assert!(a.injected() > 0 && a.injected() < 32);
        assert_eq!(a.calls(), 32);
    }
}
