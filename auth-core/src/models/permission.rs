//! Permission model - `resource:action:scope` triples.
//!
//! A [`Permission`] can only be built from its three fields (or parsed from a
//! canonical name that splits into exactly those fields), so its name is
//! always the derived concatenation. [`PermissionRecord`] is the persisted row,
//! whose stored `name` column has to be checked against its fields.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Breadth of a permission. Ordered narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    /// The principal acts on itself only.
    Own,
    /// The principal acts within organizations it can reach.
    Organization,
    /// Unrestricted.
    All,
}

impl PermissionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionScope::Own => "own",
            PermissionScope::Organization => "organization",
            PermissionScope::All => "all",
        }
    }
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionScope {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "own" => Ok(PermissionScope::Own),
            "organization" => Ok(PermissionScope::Organization),
            "all" => Ok(PermissionScope::All),
            other => Err(PermissionError::InvalidScope(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("invalid permission scope: {0}")]
    InvalidScope(String),

    #[error("invalid permission segment: {0:?}")]
    InvalidSegment(String),

    #[error("malformed permission name: {0}")]
    MalformedName(String),

    #[error("permission name {stored} does not match derived name {derived}")]
    NameMismatch { stored: String, derived: String },
}

/// A `resource:action:scope` permission.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Permission {
    resource: String,
    action: String,
    scope: PermissionScope,
}

impl Permission {
    pub fn new(
        resource: impl Into<String>,
        action: impl Into<String>,
        scope: PermissionScope,
    ) -> Result<Self, PermissionError> {
        let resource = resource.into();
        let action = action.into();
        validate_segment(&resource)?;
        validate_segment(&action)?;
        Ok(Self {
            resource,
            action,
            scope,
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn scope(&self) -> PermissionScope {
        self.scope
    }

    /// Canonical `resource:action:scope` name.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Same resource and action, regardless of scope.
    pub fn same_operation(&self, resource: &str, action: &str) -> bool {
        self.resource == resource && self.action == action
    }

    pub fn with_scope(&self, scope: PermissionScope) -> Self {
        Self {
            resource: self.resource.clone(),
            action: self.action.clone(),
            scope,
        }
    }
}

fn validate_segment(segment: &str) -> Result<(), PermissionError> {
    let valid = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(PermissionError::InvalidSegment(segment.to_string()))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.resource, self.action, self.scope)
    }
}

impl FromStr for Permission {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [resource, action, scope] => Permission::new(*resource, *action, scope.parse()?),
            _ => Err(PermissionError::MalformedName(s.to_string())),
        }
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Persisted permission row.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PermissionRecord {
    pub id: Uuid,
    pub name: String,
    pub resource: String,
    pub action: String,
    pub scope: String,
    pub is_active: bool,
}

impl PermissionRecord {
    pub fn from_permission(permission: &Permission) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: permission.name(),
            resource: permission.resource().to_string(),
            action: permission.action().to_string(),
            scope: permission.scope().as_str().to_string(),
            is_active: true,
        }
    }

    /// Build the value type from the row's fields, rejecting a stored name
    /// that differs from the derived one.
    pub fn permission(&self) -> Result<Permission, PermissionError> {
        let permission = Permission::new(
            self.resource.as_str(),
            self.action.as_str(),
            self.scope.parse()?,
        )?;
        let derived = permission.name();
        if derived != self.name {
            return Err(PermissionError::NameMismatch {
                stored: self.name.clone(),
                derived,
            });
        }
        Ok(permission)
    }

    /// Rewrite `name` from the fields. Returns whether anything changed.
    pub fn correct_name(&mut self) -> Result<bool, PermissionError> {
        let derived = Permission::new(
            self.resource.as_str(),
            self.action.as_str(),
            self.scope.parse()?,
        )?
        .name();
        if derived == self.name {
            return Ok(false);
        }
        self.name = derived;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_derived_from_fields() {
        let p = Permission::new("patients", "read", PermissionScope::Organization).unwrap();
        assert_eq!(p.name(), "patients:read:organization");
        assert_eq!(p.resource(), "patients");
        assert_eq!(p.action(), "read");
        assert_eq!(p.scope(), PermissionScope::Organization);
    }

    #[test]
    fn test_parse_canonical_name() {
        let p: Permission = "invoices:update:own".parse().unwrap();
        assert_eq!(p.scope(), PermissionScope::Own);
        assert_eq!(p.to_string(), "invoices:update:own");
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert!(matches!(
            "invoices:update".parse::<Permission>(),
            Err(PermissionError::MalformedName(_))
        ));
        assert!(matches!(
            "invoices:update:own:extra".parse::<Permission>(),
            Err(PermissionError::MalformedName(_))
        ));
        assert!(matches!(
            "invoices:update:galaxy".parse::<Permission>(),
            Err(PermissionError::InvalidScope(_))
        ));
        assert!(matches!(
            "Invoices:update:own".parse::<Permission>(),
            Err(PermissionError::InvalidSegment(_))
        ));
        assert!(matches!(
            ":update:own".parse::<Permission>(),
            Err(PermissionError::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_scope_ordering_widest_last() {
        assert!(PermissionScope::Own < PermissionScope::Organization);
        assert!(PermissionScope::Organization < PermissionScope::All);
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let p = Permission::new("users", "delete", PermissionScope::All).unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"users:delete:all\"");
        let back: Permission = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(serde_json::from_str::<Permission>("\"users:delete\"").is_err());
    }

    #[test]
    fn test_record_rejects_name_mismatch() {
        let mut record = PermissionRecord::from_permission(
            &Permission::new("users", "read", PermissionScope::Own).unwrap(),
        );
        assert!(record.permission().is_ok());

        record.name = "users:read:all".to_string();
        assert!(matches!(
            record.permission(),
            Err(PermissionError::NameMismatch { .. })
        ));

        assert!(record.correct_name().unwrap());
        assert_eq!(record.name, "users:read:own");
        assert!(!record.correct_name().unwrap());
        assert!(record.permission().is_ok());
    }
}
