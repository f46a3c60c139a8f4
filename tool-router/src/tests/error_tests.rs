//! Tests for error handling functionality
//!
//! These tests verify the error taxonomy the router reports across the
//! invocation boundary.

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::error::{mapping, ErrorContext, ErrorKind, ServiceError};

    #[test]
    fn test_service_error_creation() {
        let transport_err = ServiceError::transport("Connection refused");
        let auth_err = ServiceError::auth("Invalid credentials");
        let rate_limit_err = ServiceError::rate_limit("Too many requests");

        assert_eq!(transport_err.to_string(), "Transport error: Connection refused");
        assert_eq!(auth_err.to_string(), "Authentication error: Invalid credentials");
        assert_eq!(rate_limit_err.to_string(), "Rate limit exceeded: Too many requests");

        // Check error classification for retry decisions
        assert!(transport_err.is_retryable());
        assert!(!auth_err.is_retryable());
        assert!(rate_limit_err.is_retryable());
        assert!(auth_err.is_permanent());
    }

    #[test]
    fn test_only_transient_kinds_are_retryable() {
        let retryable: Vec<ErrorKind> = ErrorKind::ALL
            .iter()
            .copied()
            .filter(ErrorKind::is_retryable)
            .collect();
        assert_eq!(
            retryable,
            vec![ErrorKind::Transport, ErrorKind::Timeout, ErrorKind::RateLimit]
        );
    }

    #[test]
    fn test_circuit_accounting() {
        assert!(ServiceError::auth("x").counts_against_circuit());
        assert!(ServiceError::remote("x").counts_against_circuit());
        assert!(ServiceError::timeout("x").counts_against_circuit());
        assert!(!ServiceError::validation("x").counts_against_circuit());
        assert!(!ServiceError::circuit_open("x").counts_against_circuit());
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::String(kind.as_str().to_string())
            );
        }
        assert!("exploded".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_from_kind_matches_kind() {
        for kind in ErrorKind::ALL {
            assert_eq!(ServiceError::from_kind(kind, "injected").kind(), kind);
        }
    }

    #[test]
    fn test_error_context() {
        let context = ErrorContext::for_service("bmad-api")
            .status_code(503)
            .request_id("req-123")
            .endpoint("/tools/bmad_prd_create")
            .with("attempt", 3);

        let err = ServiceError::transport("Service unavailable").with_context(context);

        // Context does not change the classification or the message
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.to_string(), "Transport error: Service unavailable");
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.context_value("attempt"), Some("3"));
    }

    #[test]
    fn test_with_context_value_merges() {
        let err = ServiceError::timeout("slow")
            .with_context(ErrorContext::for_service("bmad-api").status_code(504))
            .with_context_value("attempts", 3);

        assert_eq!(err.context_value("attempts"), Some("3"));
        assert_eq!(err.status_code(), Some(504));
        match err {
            ServiceError::WithContext { inner, .. } => {
                // Merged into the existing context, not nested twice
                assert!(!matches!(*inner, ServiceError::WithContext { .. }));
            }
            other => panic!("expected context, got {:?}", other),
        }
    }

    #[test]
    fn test_http_status_mapping() {
        let cases = [
            (StatusCode::UNAUTHORIZED, ErrorKind::Auth),
            (StatusCode::FORBIDDEN, ErrorKind::Auth),
            (StatusCode::TOO_MANY_REQUESTS, ErrorKind::RateLimit),
            (StatusCode::SERVICE_UNAVAILABLE, ErrorKind::Transport),
            (StatusCode::BAD_GATEWAY, ErrorKind::Transport),
            (StatusCode::GATEWAY_TIMEOUT, ErrorKind::Timeout),
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Remote),
            (StatusCode::NOT_FOUND, ErrorKind::Remote),
            (StatusCode::BAD_REQUEST, ErrorKind::Validation),
            (StatusCode::UNPROCESSABLE_ENTITY, ErrorKind::Validation),
        ];

        for (status, kind) in cases {
            let mut context = ErrorContext::new();
            let err = mapping::map_http_error(status, "", &mut context);
            assert_eq!(err.kind(), kind, "status {}", status);
            assert_eq!(context.status_code, Some(status.as_u16()));
        }
    }

    #[test]
    fn test_request_builder_error_is_not_a_remote_failure() {
        let reqwest_err = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        assert!(reqwest_err.is_builder());

        let err = ServiceError::from(reqwest_err);
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.counts_against_circuit());
        assert!(!err.is_retryable());
    }
}
