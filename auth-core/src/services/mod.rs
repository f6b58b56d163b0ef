//! Services layer for the auth core.
//!
//! [`AuthService`] is the exposed surface; the other services are the
//! components it wires together and may be used on their own.

pub mod account_guard;
pub mod audit;
mod auth;
pub mod cleanup;
pub mod error;
mod jwt;
pub mod metrics;
pub mod rbac;
pub mod token_manager;

pub use account_guard::{AccountSecurityGuard, LockStatus};
pub use audit::{AuditSink, Auditor, MemoryAuditSink, PgAuditSink, TracingAuditSink};
pub use auth::{AuthService, AuthSettings, Subject};
pub use cleanup::{CleanupSweeper, SweepReport};
pub use error::AuthError;
pub use jwt::{AccessTokenClaims, JwtService, RefreshTokenClaims};
pub use rbac::{
    AccessTarget, AuthzSnapshot, Decision, DenyReason, EffectivePermissions, PermissionCache,
    RbacResolver, ScopeFilter,
};
pub use token_manager::{TokenManager, TokenManagerSettings, TokenPair};
