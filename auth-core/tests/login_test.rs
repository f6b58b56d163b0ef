mod common;

use argon2::Params;
use auth_core::{
    models::{AuditAction, LoginFailureReason, Principal},
    services::AuthError,
    store::{SecurityStore, UserStore},
    utils::{Clock, CredentialVerifier, Password},
};
use chrono::Duration;
use common::{device, setup, PASSWORD};

#[tokio::test]
async fn test_password_login_issues_valid_pair() {
    let h = setup();
    let user_id = h.create_user("alice@example.com");

    let pair = h
        .service
        .authenticate_with_password("alice@example.com", PASSWORD, &device(), false)
        .await
        .expect("login should succeed");

    assert_eq!(pair.token_type, "Bearer");
    let claims = h
        .service
        .validate_access_token(&pair.access_token)
        .await
        .expect("fresh access token should validate");
    assert_eq!(claims.sub, user_id);
    assert_eq!(claims.sid, pair.session_id);
    assert_eq!(h.audit.count(AuditAction::LoginSucceeded), 1);
    assert_eq!(h.audit.count(AuditAction::TokenPairIssued), 1);
}

#[tokio::test]
async fn test_email_is_matched_case_insensitively() {
    let h = setup();
    h.create_user("alice@example.com");

    let result = h
        .service
        .authenticate_with_password("  Alice@Example.COM ", PASSWORD, &device(), false)
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_unknown_and_wrong_password_are_indistinguishable() {
    let h = setup();
    h.create_user("alice@example.com");

    let wrong = h
        .service
        .authenticate_with_password("alice@example.com", "nope", &device(), false)
        .await
        .unwrap_err();
    let unknown = h
        .service
        .authenticate_with_password("ghost@example.com", PASSWORD, &device(), false)
        .await
        .unwrap_err();

    assert_eq!(wrong, AuthError::InvalidCredential);
    assert_eq!(unknown, AuthError::InvalidCredential);
    assert_eq!(wrong.to_string(), unknown.to_string());
}

#[tokio::test]
async fn test_inactive_and_federated_principals_cannot_use_password() {
    let h = setup();
    let inactive = h.create_user("inactive@example.com");
    h.store.set_principal_active(inactive, false).unwrap();
    h.create_federated_user("sso@example.com");

    for email in ["inactive@example.com", "sso@example.com"] {
        let err = h
            .service
            .authenticate_with_password(email, PASSWORD, &device(), false)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredential);
    }

    let reasons: Vec<_> = h
        .store
        .login_attempts()
        .unwrap()
        .into_iter()
        .filter_map(|a| a.failure_reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            LoginFailureReason::InactivePrincipal,
            LoginFailureReason::NoPasswordSet
        ]
    );
}

#[tokio::test]
async fn test_malformed_input_is_rejected_before_lookup() {
    let h = setup();

    let err = h
        .service
        .authenticate_with_password("not-an-email", PASSWORD, &device(), false)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidCredential);

    let attempts = h.store.login_attempts().unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(
        attempts[0].failure_reason,
        Some(LoginFailureReason::InvalidInput)
    );
}

#[tokio::test]
async fn test_lockout_end_to_end() {
    let h = setup();
    h.create_user("alice@example.com");
    let start = h.clock.now();

    for _ in 0..2 {
        let err = h
            .service
            .authenticate_with_password("alice@example.com", "wrong", &device(), false)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredential);
    }

    let third = h
        .service
        .authenticate_with_password("alice@example.com", "wrong", &device(), false)
        .await
        .unwrap_err();
    let expected_until = start + Duration::minutes(1);
    assert_eq!(
        third,
        AuthError::AccountLocked {
            locked_until: expected_until
        }
    );

    // The correct password does not get through while locked.
    let fourth = h
        .service
        .authenticate_with_password("alice@example.com", PASSWORD, &device(), false)
        .await
        .unwrap_err();
    assert_eq!(
        fourth,
        AuthError::AccountLocked {
            locked_until: expected_until
        }
    );
    assert_eq!(h.audit.count(AuditAction::LoginLocked), 1);

    h.clock.advance(Duration::minutes(1));
    let first = h
        .service
        .authenticate_with_password("alice@example.com", PASSWORD, &device(), false)
        .await
        .expect("lockout should have elapsed");
    let second = h
        .service
        .authenticate_with_password("alice@example.com", PASSWORD, &device(), false)
        .await
        .expect("counter should be reset");
    assert_ne!(first.session_id, second.session_id);
}

#[tokio::test]
async fn test_repeated_lockouts_escalate_and_flag_suspicious_activity() {
    let h = setup();
    h.create_user("alice@example.com");

    for minutes in [1, 5, 15] {
        let start = h.clock.now();
        let mut last = None;
        for _ in 0..3 {
            last = h
                .service
                .authenticate_with_password("alice@example.com", "wrong", &device(), false)
                .await
                .err();
        }
        assert_eq!(
            last,
            Some(AuthError::AccountLocked {
                locked_until: start + Duration::minutes(minutes)
            })
        );
        h.clock.advance(Duration::minutes(20));
    }

    assert_eq!(h.audit.count(AuditAction::SuspiciousActivity), 1);
    let record = h
        .store
        .get_security_record("alice@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(record.suspicious_activity);
    assert_eq!(record.prior_lockouts, 2);

    // A successful login starts the schedule over.
    h.service
        .authenticate_with_password("alice@example.com", PASSWORD, &device(), false)
        .await
        .expect("lockout has elapsed");
    let start = h.clock.now();
    let mut last = None;
    for _ in 0..3 {
        last = h
            .service
            .authenticate_with_password("alice@example.com", "wrong", &device(), false)
            .await
            .err();
    }
    assert_eq!(
        last,
        Some(AuthError::AccountLocked {
            locked_until: start + Duration::minutes(1)
        })
    );
}

#[tokio::test]
async fn test_unknown_identifier_locks_like_a_real_one() {
    let h = setup();

    let mut last = None;
    for _ in 0..3 {
        last = Some(
            h.service
                .authenticate_with_password("ghost@example.com", "guess", &device(), false)
                .await
                .unwrap_err(),
        );
    }
    assert!(matches!(last, Some(AuthError::AccountLocked { .. })));
}

#[tokio::test]
async fn test_success_resets_failure_counter() {
    let h = setup();
    h.create_user("alice@example.com");

    for _ in 0..2 {
        let _ = h
            .service
            .authenticate_with_password("alice@example.com", "wrong", &device(), false)
            .await;
    }
    h.service
        .authenticate_with_password("alice@example.com", PASSWORD, &device(), false)
        .await
        .unwrap();

    // Two more failures stay below the threshold again.
    for _ in 0..2 {
        let err = h
            .service
            .authenticate_with_password("alice@example.com", "wrong", &device(), false)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredential);
    }
}

#[tokio::test]
async fn test_verified_identity_login_clears_lockout() {
    let h = setup();
    let user_id = h.create_user("alice@example.com");

    for _ in 0..3 {
        let _ = h
            .service
            .authenticate_with_password("alice@example.com", "wrong", &device(), false)
            .await;
    }

    let pair = h
        .service
        .authenticate_with_verified_identity(user_id, &device(), false)
        .await
        .expect("federated login ignores lockout");
    assert_ne!(pair.access_token, pair.refresh_token);

    h.service
        .authenticate_with_password("alice@example.com", PASSWORD, &device(), false)
        .await
        .expect("lockout was cleared");
}

#[tokio::test]
async fn test_verified_identity_requires_active_principal() {
    let h = setup();
    let user_id = h.create_federated_user("sso@example.com");
    h.store.set_principal_active(user_id, false).unwrap();

    let err = h
        .service
        .authenticate_with_verified_identity(user_id, &device(), false)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidCredential);

    let err = h
        .service
        .authenticate_with_verified_identity(uuid::Uuid::new_v4(), &device(), false)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidCredential);
}

#[tokio::test]
async fn test_weak_hash_is_upgraded_on_login() {
    let h = setup();
    let weak = CredentialVerifier::with_params(Params::new(1024, 1, 1, None).unwrap()).unwrap();
    let weak_hash = weak.hash(&Password::new(PASSWORD)).unwrap().into_string();
    let user_id = h
        .store
        .insert_principal(Principal::new(
            "legacy@example.com",
            Some(weak_hash.clone()),
            h.clock.now(),
        ))
        .unwrap();

    h.service
        .authenticate_with_password("legacy@example.com", PASSWORD, &device(), false)
        .await
        .unwrap();

    let stored = h
        .store
        .find_principal(user_id)
        .await
        .unwrap()
        .unwrap()
        .password_hash
        .unwrap();
    assert_ne!(stored, weak_hash);
    assert!(!h.verifier.needs_upgrade(&stored));
    assert!(h.verifier.verify(&Password::new(PASSWORD), &stored));
}

#[tokio::test]
async fn test_attempts_are_journaled() {
    let h = setup();
    let user_id = h.create_user("alice@example.com");

    let _ = h
        .service
        .authenticate_with_password("alice@example.com", "wrong", &device(), false)
        .await;
    let pair = h
        .service
        .authenticate_with_password("alice@example.com", PASSWORD, &device(), false)
        .await
        .unwrap();

    let attempts = h.store.login_attempts().unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].success);
    assert_eq!(
        attempts[0].failure_reason,
        Some(LoginFailureReason::BadPassword)
    );
    assert!(attempts[1].success);
    assert_eq!(attempts[1].principal_id, Some(user_id));
    assert_eq!(attempts[1].session_id, Some(pair.session_id));
    assert_eq!(attempts[1].ip_address.as_deref(), Some("203.0.113.7"));
}

#[tokio::test]
async fn test_store_outage_is_retryable() {
    let h = setup();
    h.create_user("alice@example.com");
    h.store.set_unavailable(true);

    let err = h
        .service
        .authenticate_with_password("alice@example.com", PASSWORD, &device(), false)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::StoreUnavailable);
    assert!(err.is_retryable());
}
