pub mod account_security;
pub mod audit_event;
pub mod blacklist;
pub mod login_attempt;
pub mod organization;
pub mod permission;
pub mod principal;
pub mod refresh_token;
pub mod role;
pub mod role_assignment;
pub mod session;

pub use account_security::AccountSecurityRecord;
pub use audit_event::{AuditAction, AuditEvent, AuditSeverity};
pub use blacklist::{BlacklistEntry, TokenType};
pub use login_attempt::{LoginAttempt, LoginFailureReason};
pub use organization::{expand_descendants, Organization, OrganizationMembership};
pub use permission::{Permission, PermissionError, PermissionRecord, PermissionScope};
pub use principal::{normalize_email, Principal};
pub use refresh_token::{NewRefreshToken, RefreshTokenRecord, RevocationReason};
pub use role::{Role, RoleGrant};
pub use role_assignment::RoleAssignment;
pub use session::{Session, SessionInfo};
