mod common;

use common::{counting_service, request_from};
use http::StatusCode;
use std::io::Write;
use std::sync::atomic::Ordering;
use tollgate::{AdmissionConfig, BackendConfig, ConfigError, FailurePolicy, NullSink, PolicyRegistry};
use tower::{Layer, ServiceExt};

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(
        file,
        r#"{{
            "limits": {{ "global": "30/min", "reports": "2/hour" }},
            "rules": [ {{ "prefix": "/reports", "scope": "reports" }} ],
            "on_backend_error": "open"
        }}"#
    )
    .unwrap();

    let config = AdmissionConfig::from_path(file.path()).unwrap();
    assert_eq!(config.backend, BackendConfig::Local { sweep_interval_secs: None });
    assert_eq!(config.on_backend_error, FailurePolicy::Open);
    let registry = config.policy_registry().unwrap();
    assert_eq!(registry.lookup("reports").capacity, 2);
    assert_eq!(registry.lookup("reports").retry_after_secs(), 3600);
    assert_eq!(config.scope_rules().classify("/reports/q3"), "reports");
    assert_eq!(config.scope_rules().classify("/api/x"), "global");
}

#[test]
fn bad_header_name_is_rejected() {
    let config =
        AdmissionConfig::from_json_str(r#"{ "identifier_header": "x api key" }"#).unwrap();
    assert!(matches!(config.identity(), Err(ConfigError::InvalidHeaderName { .. })));
}

#[tokio::test]
async fn configured_layer_enforces_configured_limits() {
    let config = AdmissionConfig::from_json_str(
        r#"{ "limits": { "global": "100/min", "auth": "2/min" } }"#,
    )
    .unwrap();
    let (inner, hits) = counting_service();
    let svc = config.build_layer(NullSink).await.unwrap().layer(inner);

    let mut statuses = Vec::new();
    for _ in 0..3 {
        statuses.push(svc.clone().oneshot(request_from("/auth/login", [192, 0, 2, 1])).await.unwrap().status());
    }
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reload_applies_to_new_requests() {
    let config = AdmissionConfig::default();
    let layer = config.build_default_layer().await.unwrap();
    let limiter = layer.limiter().clone();
    let (inner, _hits) = counting_service();
    let svc = layer.layer(inner);

    limiter.reload_policies(PolicyRegistry::from_specs([("global", "1/min")], "global").unwrap());
    let first = svc.clone().oneshot(request_from("/healthz", [192, 0, 2, 2])).await.unwrap();
    let second = svc.clone().oneshot(request_from("/healthz", [192, 0, 2, 2])).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[cfg(feature = "redis-store")]
#[tokio::test]
async fn unreachable_redis_fails_startup() {
    let config = AdmissionConfig::from_json_str(
        r#"{ "backend": { "kind": "remote", "address": "redis://127.0.0.1:1/", "timeout_ms": 50 } }"#,
    )
    .unwrap();
    let err = config.build_limiter().await.unwrap_err();
    assert!(matches!(err, ConfigError::Connect { .. }));
}
