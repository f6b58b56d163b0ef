//! Organization model - tenant units, optionally nested through `parent_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::{BTreeSet, HashMap, VecDeque};
use uuid::Uuid;

/// Organization entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub is_active: bool,
}

impl Organization {
    pub fn new(name: impl Into<String>, parent_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parent_id,
            is_active: true,
        }
    }

    /// Check if this is a root node.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Principal × organization membership.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrganizationMembership {
    pub principal_id: Uuid,
    pub organization_id: Uuid,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
}

impl OrganizationMembership {
    pub fn new(principal_id: Uuid, organization_id: Uuid, joined_at: DateTime<Utc>) -> Self {
        Self {
            principal_id,
            organization_id,
            is_active: true,
            joined_at,
        }
    }
}

/// Expand `roots` with every active descendant reachable through parent
/// pointers. Inactive organizations are neither returned nor traversed.
pub fn expand_descendants(
    organizations: &[Organization],
    roots: impl IntoIterator<Item = Uuid>,
) -> BTreeSet<Uuid> {
    let active: HashMap<Uuid, &Organization> = organizations
        .iter()
        .filter(|o| o.is_active)
        .map(|o| (o.id, o))
        .collect();

    let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for org in active.values() {
        if let Some(parent) = org.parent_id {
            children.entry(parent).or_default().push(org.id);
        }
    }

    let mut reached = BTreeSet::new();
    let mut queue: VecDeque<Uuid> = roots
        .into_iter()
        .filter(|id| active.contains_key(id))
        .collect();

    while let Some(id) = queue.pop_front() {
        if !reached.insert(id) {
            continue;
        }
        if let Some(kids) = children.get(&id) {
            queue.extend(kids.iter().copied());
        }
    }

    reached
}
