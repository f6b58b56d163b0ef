//! Test helper module for auth-core integration tests.
//!
//! Wires an [`AuthService`] against the in-memory store, a manual clock and a
//! recording audit sink.

#![allow(dead_code)]

use argon2::Params;
use auth_core::{
    config::{JwtConfig, LockoutConfig},
    models::{
        Organization, OrganizationMembership, Permission, Principal, Role, RoleAssignment,
    },
    services::{AuthService, AuthSettings, MemoryAuditSink, PermissionCache},
    store::MemoryStore,
    utils::{Clock, CredentialVerifier, DeviceInfo, ManualClock, Password},
};
use chrono::Utc;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const PASSWORD: &str = "correct horse battery staple";

pub struct TestHarness {
    pub service: AuthService,
    pub store: Arc<MemoryStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: ManualClock,
    pub verifier: CredentialVerifier,
}

pub fn test_settings() -> AuthSettings {
    AuthSettings {
        jwt: JwtConfig::new(
            "test-access-secret-0123456789abcdef0123",
            "test-refresh-secret-0123456789abcdef012",
            "auth-core-test",
        ),
        lockout: LockoutConfig::default(),
        fingerprint_secret: SecretString::new("test-fingerprint-secret".to_string()),
        strict_device_binding: false,
        store_timeout: Duration::from_secs(1),
        audit_timeout: Duration::from_secs(1),
    }
}

/// Argon2id at a cost low enough for tests.
pub fn fast_verifier() -> CredentialVerifier {
    let params = Params::new(4096, 1, 1, None).expect("valid argon2 params");
    CredentialVerifier::with_params(params).expect("verifier")
}

pub fn device() -> DeviceInfo {
    DeviceInfo::new("203.0.113.7", "Mozilla/5.0 (X11; Linux x86_64)")
}

pub fn other_device() -> DeviceInfo {
    DeviceInfo::new("198.51.100.20", "curl/8.5.0")
}

pub fn permission(name: &str) -> Permission {
    name.parse().expect("valid permission name")
}

pub fn setup() -> TestHarness {
    setup_with(test_settings(), None)
}

pub fn setup_with_cache<F>(cache: F) -> TestHarness
where
    F: FnOnce(Arc<dyn Clock>) -> Arc<dyn PermissionCache>,
{
    let clock = ManualClock::new(Utc::now());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let cache = cache(shared);
    build(test_settings(), clock, Some(cache))
}

pub fn setup_with(
    settings: AuthSettings,
    cache: Option<Arc<dyn PermissionCache>>,
) -> TestHarness {
    build(settings, ManualClock::new(Utc::now()), cache)
}

fn build(
    settings: AuthSettings,
    clock: ManualClock,
    cache: Option<Arc<dyn PermissionCache>>,
) -> TestHarness {
    // Initialize tracing if not already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();

    let store = Arc::new(MemoryStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let verifier = fast_verifier();

    let service = AuthService::new(
        store.clone(),
        settings,
        verifier.clone(),
        audit.clone(),
        Arc::new(clock.clone()),
        cache,
    )
    .expect("Failed to build auth service");

    TestHarness {
        service,
        store,
        audit,
        clock,
        verifier,
    }
}

impl TestHarness {
    /// Insert an active principal with `PASSWORD`.
    pub fn create_user(&self, email: &str) -> Uuid {
        let hash = self
            .verifier
            .hash(&Password::new(PASSWORD))
            .expect("hash")
            .into_string();
        self.store
            .insert_principal(Principal::new(email, Some(hash), self.clock.now()))
            .expect("insert principal")
    }

    /// Insert a principal that can only sign in through a federated verifier.
    pub fn create_federated_user(&self, email: &str) -> Uuid {
        self.store
            .insert_principal(Principal::new(email, None, self.clock.now()))
            .expect("insert principal")
    }

    pub fn create_organization(&self, name: &str, parent_id: Option<Uuid>) -> Uuid {
        self.store
            .insert_organization(Organization::new(name, parent_id))
            .expect("insert organization")
    }

    pub fn add_member(&self, principal_id: Uuid, organization_id: Uuid) {
        self.store
            .add_membership(OrganizationMembership::new(
                principal_id,
                organization_id,
                self.clock.now(),
            ))
            .expect("add membership");
    }

    /// A system role holding `permissions`.
    pub fn create_role(&self, name: &str, permissions: &[&str]) -> Uuid {
        let role_id = self
            .store
            .insert_role(Role::system(name, self.clock.now()))
            .expect("insert role");
        for name in permissions {
            self.store
                .grant_permission(role_id, &permission(name))
                .expect("grant permission");
        }
        role_id
    }

    pub fn create_bootstrap_role(&self, name: &str) -> Uuid {
        let mut role = Role::system(name, self.clock.now());
        role.grants_all = true;
        self.store.insert_role(role).expect("insert role")
    }

    pub fn assign(&self, principal_id: Uuid, role_id: Uuid, organization_id: Option<Uuid>) {
        self.store
            .assign_role(RoleAssignment::new(
                principal_id,
                role_id,
                organization_id,
                self.clock.now(),
            ))
            .expect("assign role");
    }
}
