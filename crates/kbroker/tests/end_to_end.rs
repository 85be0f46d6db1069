//! End-to-end broker flows: nonce issuance, nonce-bound credential issuance
//! and the error taxonomy callers see

mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::DateTime;
use common::*;
use kbroker::{BrokerError, ConfigError};
use kbroker_keytab::derive_password;
use pretty_assertions::assert_eq;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_nonce_bound_credential_flow() {
    // GIVEN: a broker trusting ISSUER, serving alice, bob and mallory
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();

    // WHEN: token A from the trusted issuer asks for a nonce
    let token_a = sign(&claims("kbroker", "alice@EX.COM,bob@EX.COM"));
    let nonce = h.broker.issue_nonce(&cancel, &token_a).await.unwrap();

    // THEN: a fresh 64-character nonce comes back
    assert_eq!(nonce.value.len(), 64);
    assert_eq!(nonce.expires_at.timestamp(), NOW + 60);

    // WHEN: token B carries the nonce as audience
    let token_b = sign(&claims(&nonce.value, "alice@EX.COM,bob@EX.COM"));
    let keytab = h
        .broker
        .issue_credential(&cancel, &token_b, "alice@EX.COM")
        .await
        .unwrap();

    // THEN: alice's keytab for the current period is returned
    let boundary = DateTime::from_timestamp(NOW - NOW % 300, 0).unwrap();
    let expected = derive_password(&SecretString::new(SEED.to_string()), "alice@EX.COM", boundary);
    assert_eq!(keytab.principal, "alice@EX.COM");
    assert_eq!(keytab.material, STANDARD.encode(expected.expose_secret()));
    assert_eq!(keytab.expires_at, boundary + chrono::Duration::seconds(300));

    // AND: mallory is configured but not authorized by the claims
    assert_eq!(
        h.broker
            .issue_credential(&cancel, &token_b, "mallory@EX.COM")
            .await
            .unwrap_err(),
        BrokerError::AuthFail
    );

    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_untrusted_issuer_gets_no_nonce() {
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();

    let mut other = claims("kbroker", "alice@EX.COM");
    other["iss"] = json!(OTHER_ISSUER);
    let result = h.broker.issue_nonce(&cancel, &sign(&other)).await;

    assert_eq!(result.unwrap_err(), BrokerError::AuthFail);
    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_plain_http_issuer_is_an_auth_failure() {
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();

    for iss in ["http://issuer.example/", "issuer.example"] {
        let mut insecure = claims("kbroker", "alice@EX.COM");
        insecure["iss"] = json!(iss);
        let result = h.broker.issue_nonce(&cancel, &sign(&insecure)).await;
        assert_eq!(result.unwrap_err(), BrokerError::AuthFail, "{iss}");
    }
    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_credential_requires_live_nonce() {
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();

    // No nonce in the audience at all
    let unbound = sign(&claims("kbroker", "alice@EX.COM"));
    assert_eq!(
        h.broker
            .issue_credential(&cancel, &unbound, "alice@EX.COM")
            .await
            .unwrap_err(),
        BrokerError::AuthFail
    );

    // A nonce value this broker never issued
    let forged = sign(&claims(&"x".repeat(64), "alice@EX.COM"));
    assert_eq!(
        h.broker
            .issue_credential(&cancel, &forged, "alice@EX.COM")
            .await
            .unwrap_err(),
        BrokerError::AuthFail
    );

    // A real nonce that has since expired
    let token_a = sign(&claims("kbroker", "alice@EX.COM"));
    let nonce = h.broker.issue_nonce(&cancel, &token_a).await.unwrap();
    let token_b = sign(&claims(&nonce.value, "alice@EX.COM"));
    h.clock.advance(Duration::from_secs(61));
    assert_eq!(
        h.broker
            .issue_credential(&cancel, &token_b, "alice@EX.COM")
            .await
            .unwrap_err(),
        BrokerError::AuthFail
    );

    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_nonce_in_multi_valued_audience() {
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();

    let nonce = h
        .broker
        .issue_nonce(&cancel, &sign(&claims("kbroker", "bob@EX.COM")))
        .await
        .unwrap();
    let mut b = claims("kbroker", "bob@EX.COM");
    b["aud"] = json!(["kbroker", nonce.value]);

    let keytab = h
        .broker
        .issue_credential(&cancel, &sign(&b), "bob@EX.COM")
        .await
        .unwrap();
    assert_eq!(keytab.principal, "bob@EX.COM");

    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_authorized_but_unconfigured_principal_is_not_found() {
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();

    let nonce = h
        .broker
        .issue_nonce(&cancel, &sign(&claims("kbroker", "dave@EX.COM")))
        .await
        .unwrap();
    let token_b = sign(&claims(&nonce.value, "dave@EX.COM"));

    assert_eq!(
        h.broker
            .issue_credential(&cancel, &token_b, "dave@EX.COM")
            .await
            .unwrap_err(),
        BrokerError::NotFound("dave@EX.COM".to_string())
    );
    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_caller_errors_are_data_validation() {
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();
    let token = sign(&claims("kbroker", "alice@EX.COM"));

    for (token, principal) in [
        ("", "alice@EX.COM"),
        ("not-a-jwt", "alice@EX.COM"),
        (token.as_str(), ""),
        (token.as_str(), "alice"),
    ] {
        let err = h
            .broker
            .issue_credential(&cancel, token, principal)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "data_validation", "{token:?} / {principal:?}");
    }

    assert!(matches!(
        h.broker.issue_nonce(&cancel, "").await,
        Err(BrokerError::DataValidation(_))
    ));
    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_bad_signatures_and_expiry_are_auth_failures() {
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();

    // Payload swapped under a valid signature
    let good = sign(&claims("kbroker", "alice@EX.COM"));
    let evil = sign(&claims("kbroker", "mallory@EX.COM"));
    let good_parts: Vec<&str> = good.split('.').collect();
    let evil_parts: Vec<&str> = evil.split('.').collect();
    let spliced = format!("{}.{}.{}", good_parts[0], evil_parts[1], good_parts[2]);
    assert_eq!(
        h.broker.issue_nonce(&cancel, &spliced).await.unwrap_err(),
        BrokerError::AuthFail
    );

    // Expired token
    let mut expired = claims("kbroker", "alice@EX.COM");
    expired["exp"] = json!(NOW - 1);
    assert_eq!(
        h.broker.issue_nonce(&cancel, &sign(&expired)).await.unwrap_err(),
        BrokerError::AuthFail
    );

    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_operational_failures_are_system_faults() {
    // Issuer whose keys cannot be fetched
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();
    let mut unknown = claims("kbroker", "alice@EX.COM");
    unknown["iss"] = json!(UNKNOWN_ISSUER);
    assert_eq!(
        h.broker.issue_nonce(&cancel, &sign(&unknown)).await.unwrap_err(),
        BrokerError::SystemFault
    );
    h.broker.shutdown().await;

    // Policy binding the wrong types
    let broken = r#"
package kbroker

import rego.v1

grant := "yes"

principals := 42
"#;
    let h = start(config(broken)).await.unwrap();
    assert_eq!(
        h.broker
            .issue_nonce(&cancel, &sign(&claims("kbroker", "alice@EX.COM")))
            .await
            .unwrap_err(),
        BrokerError::SystemFault
    );
    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_request() {
    let h = start(config(POLICY)).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let token = sign(&claims("kbroker", "alice@EX.COM"));
    assert_eq!(
        h.broker.issue_nonce(&cancel, &token).await.unwrap_err(),
        BrokerError::Cancelled
    );
    assert_eq!(
        h.broker
            .issue_credential(&cancel, &token, "alice@EX.COM")
            .await
            .unwrap_err(),
        BrokerError::Cancelled
    );
    h.broker.shutdown().await;
}

#[tokio::test]
async fn test_replicas_serve_identical_keytabs() {
    let a = start(config(POLICY)).await.unwrap();
    let b = start(config(POLICY)).await.unwrap();

    for principal in PRINCIPALS {
        assert_eq!(
            *a.broker.keytabs().get(principal).unwrap(),
            *b.broker.keytabs().get(principal).unwrap()
        );
    }

    a.broker.shutdown().await;
    b.broker.shutdown().await;
}

#[tokio::test]
async fn test_startup_rejects_bad_configuration() {
    let mut bad = config(POLICY);
    bad.nonce_lifetime_secs = 5;
    assert!(matches!(start(bad).await, Err(ConfigError::Invalid(_))));

    let unparseable = config("package kbroker\n\ngrant if {");
    assert!(matches!(start(unparseable).await, Err(ConfigError::Policy(_))));
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let h = start(config(POLICY)).await.unwrap();
    assert!(h.broker.keytabs().is_running());
    h.broker.shutdown().await;
    h.broker.shutdown().await;
    assert!(!h.broker.keytabs().is_running());
}
