//! Cross-module tests against the crate's public API.
//!
//! These exercise pure logic that does not require a live control-plane
//! connection: error-status mapping (spec section 7), config construction
//! (spec section 6), and the Function/Cls option-stacking rules (spec
//! section 4.H). End-to-end scenarios that require a running control plane
//! (section 8's echo/spawn/sandbox/dict scenarios) are out of reach here —
//! see DESIGN.md for why no in-process gRPC mock server is provided.

use std::time::Duration;

use nimbus_client::{ClientConfig, FunctionOptions};
use nimbus_common::NimbusError;
use test_r::test;

test_r::enable!();

fn status(code: tonic::Code, message: &str) -> tonic::Status {
    tonic::Status::new(code, message)
}

#[test]
fn status_mapping_matches_the_documented_table() {
    assert!(matches!(
        NimbusError::from(status(tonic::Code::NotFound, "x")),
        NimbusError::NotFound(_)
    ));
    assert!(matches!(
        NimbusError::from(status(tonic::Code::AlreadyExists, "x")),
        NimbusError::AlreadyExists(_)
    ));
    assert!(matches!(
        NimbusError::from(status(tonic::Code::InvalidArgument, "x")),
        NimbusError::InvalidArgument(_)
    ));
    assert!(matches!(
        NimbusError::from(status(tonic::Code::FailedPrecondition, "x")),
        NimbusError::FailedPrecondition(_)
    ));
    assert!(matches!(
        NimbusError::from(status(tonic::Code::Unauthenticated, "x")),
        NimbusError::Unauthenticated(_)
    ));
    assert!(matches!(
        NimbusError::from(status(tonic::Code::PermissionDenied, "x")),
        NimbusError::PermissionDenied(_)
    ));
    assert!(matches!(
        NimbusError::from(status(tonic::Code::DeadlineExceeded, "x")),
        NimbusError::DeadlineExceeded(_)
    ));
    assert!(matches!(
        NimbusError::from(status(tonic::Code::Unavailable, "x")),
        NimbusError::Unavailable(_)
    ));
}

#[test]
fn internal_unknown_and_cancelled_fold_into_internal() {
    for code in [tonic::Code::Internal, tonic::Code::Unknown, tonic::Code::Cancelled] {
        assert!(matches!(NimbusError::from(status(code, "x")), NimbusError::Internal(_)));
    }
}

#[test]
fn retriable_kinds_match_the_retry_utilitys_contract() {
    assert!(NimbusError::Unavailable("x".into()).is_retriable());
    assert!(NimbusError::DeadlineExceeded("x".into()).is_retriable());
    assert!(NimbusError::Internal("x".into()).is_retriable());
    assert!(NimbusError::InternalFailure("x".into()).is_retriable());

    assert!(!NimbusError::NotFound("x".into()).is_retriable());
    assert!(!NimbusError::InvalidArgument("x".into()).is_retriable());
    assert!(!NimbusError::RemoteError("x".into()).is_retriable());
}

#[test]
fn client_config_carries_explicit_params_through_unchanged() {
    let config = ClientConfig::new(
        "https://api.example.invalid:443".parse().unwrap(),
        "tok-id".to_string(),
        "tok-secret".to_string(),
    )
    .with_environment("staging");

    assert_eq!(config.token_id, "tok-id");
    assert_eq!(config.token_secret, "tok-secret");
    assert_eq!(config.environment.as_deref(), Some("staging"));
}

#[test]
fn client_config_defaults_to_no_environment() {
    let config = ClientConfig::new(
        "https://api.example.invalid:443".parse().unwrap(),
        "tok-id".to_string(),
        "tok-secret".to_string(),
    );
    assert_eq!(config.environment, None);
}

#[test]
fn function_options_validate_enforces_every_rule_in_one_pass() {
    // timeout/scaledown_window must be >= 1s and a whole number of seconds
    assert!(FunctionOptions {
        timeout: Some(Duration::from_millis(1500)),
        ..Default::default()
    }
    .validate()
    .is_err());
    assert!(FunctionOptions {
        scaledown_window: Some(Duration::from_secs(0)),
        ..Default::default()
    }
    .validate()
    .is_err());

    // memory/cpu must be positive
    assert!(FunctionOptions {
        memory_mib: Some(0),
        ..Default::default()
    }
    .validate()
    .is_err());
    assert!(FunctionOptions {
        cpu: Some(0.0),
        ..Default::default()
    }
    .validate()
    .is_err());

    // limit >= request
    assert!(FunctionOptions {
        memory_mib: Some(512),
        memory_limit_mib: Some(256),
        ..Default::default()
    }
    .validate()
    .is_err());
    assert!(FunctionOptions {
        cpu: Some(2.0),
        cpu_limit: Some(1.0),
        ..Default::default()
    }
    .validate()
    .is_err());

    // a fully valid set of overrides passes
    assert!(FunctionOptions {
        timeout: Some(Duration::from_secs(30)),
        scaledown_window: Some(Duration::from_secs(60)),
        memory_mib: Some(256),
        memory_limit_mib: Some(512),
        cpu: Some(1.0),
        cpu_limit: Some(2.0),
        ..Default::default()
    }
    .validate()
    .is_ok());
}

#[test]
fn empty_collections_do_not_set_the_replace_bit() {
    let options = FunctionOptions::default();
    assert!(!options.replace_secrets());
    assert!(!options.replace_volumes());

    let with_secret = FunctionOptions {
        secrets: vec!["st-abc".to_string()],
        ..Default::default()
    };
    assert!(with_secret.replace_secrets());

    let with_volume = FunctionOptions {
        volumes: [( "/mnt".to_string(), "vo-abc".to_string())].into_iter().collect(),
        ..Default::default()
    };
    assert!(with_volume.replace_volumes());
}
