mod common;

use auth_core::{
    models::{AuditAction, RoleAssignment},
    services::{
        rbac::LocalPermissionCache, AccessTarget, AuthError, PermissionCache, ScopeFilter, Subject,
    },
    utils::Clock,
};
use chrono::Duration;
use common::{device, permission, setup, setup_with_cache, PASSWORD};
use std::sync::Arc;
use uuid::Uuid;

fn cached() -> common::TestHarness {
    setup_with_cache(|clock| -> Arc<dyn PermissionCache> {
        Arc::new(LocalPermissionCache::new(300, clock))
    })
}

#[tokio::test]
async fn test_all_scope_reaches_foreign_organization() {
    let h = setup();
    let user = h.create_user("alice@example.com");
    let home = h.create_organization("home", None);
    let foreign = h.create_organization("foreign", None);
    h.add_member(user, home);

    let viewer = h.create_role("viewer", &["project:read:organization"]);
    let auditor = h.create_role("auditor", &["project:read:all"]);
    h.assign(user, viewer, Some(home));
    h.assign(user, auditor, None);

    h.service
        .authorize(
            Subject::Principal(user),
            &permission("project:read:organization"),
            AccessTarget::organization(foreign),
        )
        .await
        .expect("all scope covers every organization");

    let filter = h
        .service
        .scope_filter(Subject::Principal(user), "project", "read")
        .await
        .unwrap();
    assert_eq!(filter, ScopeFilter::Unrestricted);
}

#[tokio::test]
async fn test_organization_scope_follows_hierarchy() {
    let h = setup();
    let user = h.create_user("bob@example.com");
    let parent = h.create_organization("parent", None);
    let child = h.create_organization("child", Some(parent));
    let sibling = h.create_organization("sibling", None);
    h.add_member(user, parent);

    let role = h.create_role("member", &["project:read:organization"]);
    h.assign(user, role, Some(parent));
    let read = permission("project:read:organization");

    for org in [parent, child] {
        h.service
            .authorize(Subject::Principal(user), &read, AccessTarget::organization(org))
            .await
            .expect("organization and its descendants are reachable");
    }

    let err = h
        .service
        .authorize(
            Subject::Principal(user),
            &read,
            AccessTarget::organization(sibling),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AuthError::PermissionDenied {
            permission: "project:read:organization".to_string(),
            resource_id: Some(sibling),
        }
    );
    assert_eq!(h.audit.count(AuditAction::PermissionDenied), 1);

    match h
        .service
        .scope_filter(Subject::Principal(user), "project", "read")
        .await
        .unwrap()
    {
        ScopeFilter::Organizations(ids) => {
            assert!(ids.contains(&parent));
            assert!(ids.contains(&child));
            assert!(!ids.contains(&sibling));
        }
        other => panic!("expected organization filter, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_organization_set_denies_everything() {
    let h = setup();
    let user = h.create_user("carol@example.com");
    let org = h.create_organization("somewhere", None);
    let role = h.create_role("floating", &["project:read:organization"]);
    h.assign(user, role, None);

    let result = h
        .service
        .authorize(
            Subject::Principal(user),
            &permission("project:read:organization"),
            AccessTarget::organization(org),
        )
        .await;
    assert!(matches!(result, Err(AuthError::PermissionDenied { .. })));

    let filter = h
        .service
        .scope_filter(Subject::Principal(user), "project", "read")
        .await
        .unwrap();
    assert!(filter.is_nothing());
}

#[tokio::test]
async fn test_own_scope_requires_ownership() {
    let h = setup();
    let user = h.create_user("dave@example.com");
    let org = h.create_organization("org", None);
    h.add_member(user, org);
    let role = h.create_role("author", &["document:edit:own"]);
    h.assign(user, role, Some(org));
    let edit = permission("document:edit:own");

    h.service
        .authorize(Subject::Principal(user), &edit, AccessTarget::owned_in(user, org))
        .await
        .expect("owner may edit");

    let someone_else = Uuid::new_v4();
    assert!(h
        .service
        .authorize(
            Subject::Principal(user),
            &edit,
            AccessTarget::owned_in(someone_else, org),
        )
        .await
        .is_err());
    assert_eq!(
        h.service
            .scope_filter(Subject::Principal(user), "document", "edit")
            .await
            .unwrap(),
        ScopeFilter::OwnerOnly(user)
    );
}

#[tokio::test]
async fn test_bootstrap_role_picks_up_new_permissions() {
    let h = setup();
    let admin = h.create_user("root@example.com");
    let bootstrap = h.create_bootstrap_role("super_admin");
    h.assign(admin, bootstrap, None);
    let org = h.create_organization("any", None);

    // Added to the catalog after the assignment exists.
    h.create_role("reporter", &["report:export:organization"]);

    h.service
        .authorize(
            Subject::Principal(admin),
            &permission("report:export:organization"),
            AccessTarget::organization(org),
        )
        .await
        .expect("bootstrap role expands at resolution time");

    // Not in the catalog at all.
    assert!(h
        .service
        .authorize(
            Subject::Principal(admin),
            &permission("billing:refund:all"),
            AccessTarget::default(),
        )
        .await
        .is_err());

    // Deactivated permissions drop out of the expansion.
    h.store
        .set_permission_active("report:export:organization", false)
        .unwrap();
    assert!(h
        .service
        .authorize(
            Subject::Principal(admin),
            &permission("report:export:organization"),
            AccessTarget::organization(org),
        )
        .await
        .is_err());
}

#[tokio::test]
async fn test_bootstrap_role_inside_organization_is_capped() {
    let h = setup();
    let user = h.create_user("orgadmin@example.com");
    let home = h.create_organization("home", None);
    let other = h.create_organization("other", None);
    h.add_member(user, home);
    h.create_role("global-reader", &["project:read:all"]);

    let bootstrap = h.create_bootstrap_role("org_admin");
    h.assign(user, bootstrap, Some(home));

    h.service
        .authorize(
            Subject::Principal(user),
            &permission("project:read:organization"),
            AccessTarget::organization(home),
        )
        .await
        .expect("capped to organization scope at home");

    for (name, target) in [
        ("project:read:all", AccessTarget::organization(home)),
        ("project:read:organization", AccessTarget::organization(other)),
    ] {
        assert!(h
            .service
            .authorize(Subject::Principal(user), &permission(name), target)
            .await
            .is_err());
    }
}

#[tokio::test]
async fn test_expired_assignment_stops_granting() {
    let h = setup();
    let user = h.create_user("temp@example.com");
    let org = h.create_organization("org", None);
    h.add_member(user, org);
    let role = h.create_role("contractor", &["project:read:organization"]);
    h.store
        .assign_role(
            RoleAssignment::new(user, role, Some(org), h.clock.now())
                .expiring_at(h.clock.now() + Duration::hours(1)),
        )
        .unwrap();
    let read = permission("project:read:organization");

    h.service
        .authorize(Subject::Principal(user), &read, AccessTarget::organization(org))
        .await
        .unwrap();

    h.clock.advance(Duration::hours(2));
    assert!(h
        .service
        .authorize(Subject::Principal(user), &read, AccessTarget::organization(org))
        .await
        .is_err());
}

#[tokio::test]
async fn test_cached_permissions_follow_role_changes() {
    let h = cached();
    let user = h.create_user("erin@example.com");
    let org = h.create_organization("org", None);
    h.add_member(user, org);
    let role = h.create_role("editor", &["project:write:organization"]);
    h.assign(user, role, Some(org));
    let write = permission("project:write:organization");

    h.service
        .authorize(Subject::Principal(user), &write, AccessTarget::organization(org))
        .await
        .unwrap();

    h.store.revoke_permission(role, &write).unwrap();
    assert!(h
        .service
        .authorize(Subject::Principal(user), &write, AccessTarget::organization(org))
        .await
        .is_err());
}

#[tokio::test]
async fn test_token_snapshot_is_refreshed_on_rotation() {
    let h = setup();
    let user = h.create_user("frank@example.com");
    let org = h.create_organization("org", None);
    h.add_member(user, org);
    let role = h.create_role("editor", &["project:write:organization"]);
    h.assign(user, role, Some(org));
    let write = permission("project:write:organization");

    let pair = h
        .service
        .authenticate_with_password("frank@example.com", PASSWORD, &device(), false)
        .await
        .unwrap();
    let claims = h
        .service
        .validate_access_token(&pair.access_token)
        .await
        .unwrap();
    assert!(claims.authz.contains(&write));

    h.store.revoke_permission(role, &write).unwrap();

    // The minted snapshot stays valid until the access token is replaced.
    h.service
        .authorize(Subject::Claims(&claims), &write, AccessTarget::organization(org))
        .await
        .unwrap();

    let rotated = h.service.refresh(&pair.refresh_token, &device()).await.unwrap();
    let claims = h
        .service
        .validate_access_token(&rotated.access_token)
        .await
        .unwrap();
    assert!(h
        .service
        .authorize(Subject::Claims(&claims), &write, AccessTarget::organization(org))
        .await
        .is_err());
}

#[tokio::test]
async fn test_cached_permissions_drop_expired_assignment() {
    let h = cached();
    let user = h.create_user("temp@example.com");
    let org = h.create_organization("org", None);
    h.add_member(user, org);
    let role = h.create_role("contractor", &["project:read:organization"]);
    h.store
        .assign_role(
            RoleAssignment::new(user, role, Some(org), h.clock.now())
                .expiring_at(h.clock.now() + Duration::minutes(1)),
        )
        .unwrap();
    let read = permission("project:read:organization");

    h.service
        .authorize(Subject::Principal(user), &read, AccessTarget::organization(org))
        .await
        .unwrap();

    // Well inside the cache TTL.
    h.clock.advance(Duration::minutes(2));
    assert!(h
        .service
        .authorize(Subject::Principal(user), &read, AccessTarget::organization(org))
        .await
        .is_err());
}

#[tokio::test]
async fn test_cached_bootstrap_role_picks_up_new_permissions() {
    let h = cached();
    let admin = h.create_user("root@example.com");
    let bootstrap = h.create_bootstrap_role("super_admin");
    h.assign(admin, bootstrap, None);
    let org = h.create_organization("any", None);
    h.create_role("reporter", &["report:export:organization"]);

    h.service
        .authorize(
            Subject::Principal(admin),
            &permission("report:export:organization"),
            AccessTarget::organization(org),
        )
        .await
        .unwrap();

    h.create_role("clerk", &["invoice:void:organization"]);
    h.service
        .authorize(
            Subject::Principal(admin),
            &permission("invoice:void:organization"),
            AccessTarget::organization(org),
        )
        .await
        .expect("catalog additions reach cached bootstrap holders");

    h.store
        .set_permission_active("report:export:organization", false)
        .unwrap();
    assert!(h
        .service
        .authorize(
            Subject::Principal(admin),
            &permission("report:export:organization"),
            AccessTarget::organization(org),
        )
        .await
        .is_err());
}

#[tokio::test]
async fn test_cached_permissions_follow_assignment_changes() {
    let h = cached();
    let user = h.create_user("gina@example.com");
    let org = h.create_organization("org", None);
    h.add_member(user, org);
    let role = h.create_role("editor", &["project:write:organization"]);
    let write = permission("project:write:organization");

    // Caches an empty set.
    assert!(h
        .service
        .authorize(Subject::Principal(user), &write, AccessTarget::organization(org))
        .await
        .is_err());

    h.assign(user, role, Some(org));
    h.service
        .authorize(Subject::Principal(user), &write, AccessTarget::organization(org))
        .await
        .expect("new assignment is visible");

    h.store.set_assignment_active(user, role, false).unwrap();
    assert!(h
        .service
        .authorize(Subject::Principal(user), &write, AccessTarget::organization(org))
        .await
        .is_err());
}

#[tokio::test]
async fn test_token_snapshot_lapses_with_its_assignment() {
    let h = setup();
    let user = h.create_user("hank@example.com");
    let org = h.create_organization("org", None);
    h.add_member(user, org);
    let role = h.create_role("contractor", &["project:read:organization"]);
    h.store
        .assign_role(
            RoleAssignment::new(user, role, Some(org), h.clock.now())
                .expiring_at(h.clock.now() + Duration::minutes(5)),
        )
        .unwrap();
    let read = permission("project:read:organization");

    let pair = h
        .service
        .authenticate_with_password("hank@example.com", PASSWORD, &device(), false)
        .await
        .unwrap();
    let claims = h
        .service
        .validate_access_token(&pair.access_token)
        .await
        .unwrap();
    h.service
        .authorize(Subject::Claims(&claims), &read, AccessTarget::organization(org))
        .await
        .unwrap();

    // The access token itself is still valid for another ten minutes.
    h.clock.advance(Duration::minutes(5));
    assert!(h
        .service
        .authorize(Subject::Claims(&claims), &read, AccessTarget::organization(org))
        .await
        .is_err());
}
