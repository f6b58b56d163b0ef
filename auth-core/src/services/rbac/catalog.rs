//! Permission catalog maintenance.

use std::collections::HashMap;

use crate::models::PermissionRecord;
use crate::store::{RbacStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    /// Definitions or stored rows whose name had to be rewritten from their
    /// fields. A corrected definition that was also created counts in both.
    pub corrected: usize,
    pub unchanged: usize,
    /// Definitions whose fields do not form a valid permission.
    pub rejected: usize,
}

/// Upsert permission definitions keyed by `(resource, action, scope)`.
///
/// A definition whose `name` differs from `resource:action:scope` is
/// corrected before use, and so is a stored row with a drifted name.
pub async fn synchronize_permissions(
    store: &dyn RbacStore,
    definitions: &[PermissionRecord],
) -> Result<SyncReport, StoreError> {
    let mut report = SyncReport::default();

    let mut existing: HashMap<(String, String, String), PermissionRecord> = store
        .list_permission_records()
        .await?
        .into_iter()
        .map(|r| ((r.resource.clone(), r.action.clone(), r.scope.clone()), r))
        .collect();

    for definition in definitions {
        let mut definition = definition.clone();
        let mut corrected = match definition.correct_name() {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!(
                    name = %definition.name,
                    error = %e,
                    "Rejecting invalid permission definition"
                );
                report.rejected += 1;
                continue;
            }
        };
        if corrected {
            tracing::warn!(
                name = %definition.name,
                "Corrected permission definition name"
            );
        }

        let key = (
            definition.resource.clone(),
            definition.action.clone(),
            definition.scope.clone(),
        );

        match existing.get(&key) {
            Some(stored) if stored.name != definition.name => {
                store
                    .update_permission_name(stored.id, &definition.name)
                    .await?;
                tracing::warn!(
                    stored = %stored.name,
                    derived = %definition.name,
                    "Corrected stored permission name"
                );
                corrected = true;
            }
            Some(_) => {}
            None => {
                store.insert_permission(&definition).await?;
                tracing::info!(name = %definition.name, "Created permission");
                report.created += 1;
                if corrected {
                    report.corrected += 1;
                }
                existing.insert(key, definition);
                continue;
            }
        }

        if corrected {
            report.corrected += 1;
        } else {
            report.unchanged += 1;
        }
    }

    tracing::info!(
        created = report.created,
        corrected = report.corrected,
        unchanged = report.unchanged,
        rejected = report.rejected,
        "Permission catalog synchronized"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Permission, PermissionScope};
    use crate::store::MemoryStore;

    fn definition(resource: &str, action: &str, scope: &str, name: &str) -> PermissionRecord {
        PermissionRecord {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            scope: scope.to_string(),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_sync_creates_and_corrects() {
        let store = MemoryStore::new();
        let definitions = vec![
            definition("patient", "read", "organization", "patient:read:organization"),
            definition("patient", "write", "own", "patient:read:own"),
            definition("patient", "delete", "galaxy", "patient:delete:galaxy"),
        ];

        let report = synchronize_permissions(&store, &definitions).await.unwrap();
        assert_eq!(
            report,
            SyncReport {
                created: 2,
                corrected: 1,
                unchanged: 0,
                rejected: 1,
            }
        );

        let names: Vec<String> = store
            .list_permission_records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert!(names.contains(&"patient:write:own".to_string()));
        assert!(!names.contains(&"patient:read:own".to_string()));
    }

    #[tokio::test]
    async fn test_sync_is_idempotent_and_repairs_stored_names() {
        let store = MemoryStore::new();
        let permission = Permission::new("visit", "read", PermissionScope::All).unwrap();
        let definitions = vec![PermissionRecord::from_permission(&permission)];

        synchronize_permissions(&store, &definitions).await.unwrap();
        let report = synchronize_permissions(&store, &definitions).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.created, 0);

        let stored = store.list_permission_records().await.unwrap().remove(0);
        store
            .update_permission_name(stored.id, "visit:read:own")
            .await
            .unwrap();

        let report = synchronize_permissions(&store, &definitions).await.unwrap();
        assert_eq!(report.corrected, 1);
        let stored = store.list_permission_records().await.unwrap().remove(0);
        assert_eq!(stored.name, "visit:read:all");
    }
}
