//! Tests for users, groups, and permission checks.

use std::sync::Arc;

use super::*;
use crate::constants::ALL_RESOURCE_TYPES;
use crate::store::MemoryStore;

async fn service() -> AuthService {
    let auth = AuthService::new(Arc::new(MemoryStore::new()));
    auth.init(&["root".to_string()]).await.unwrap();
    auth
}

fn names(groups: &[Group]) -> Vec<&str> {
    groups.iter().map(|g| g.name.as_str()).collect()
}

// ============================================================================
// Bootstrap
// ============================================================================

#[tokio::test]
async fn test_init_creates_builtin_groups() {
    let auth = service().await;
    let default = auth.get_group(DEFAULT_GROUP).await.unwrap();
    assert_eq!(default.members, vec![DEFAULT_USER]);
    assert_eq!(default.items.len(), ALL_RESOURCE_TYPES.len());
    let admin = auth.get_group(ADMIN_GROUP).await.unwrap();
    assert_eq!(admin.members, vec!["root"]);
    assert_eq!(auth.get_user("root").await.unwrap().groups, vec![ADMIN_GROUP]);
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let auth = service().await;
    auth.init(&["root".to_string(), "ops".to_string()]).await.unwrap();
    auth.init(&["root".to_string(), "ops".to_string()]).await.unwrap();
    let admin = auth.get_group(ADMIN_GROUP).await.unwrap();
    assert_eq!(admin.members, vec!["root", "ops"]);
    assert_eq!(auth.get_user("ops").await.unwrap().groups, vec![ADMIN_GROUP]);
    assert_eq!(auth.list_users().await.unwrap().len(), 3);
}

// ============================================================================
// Check
// ============================================================================

#[tokio::test]
async fn test_default_user_reads_everything_writes_nothing() {
    let auth = service().await;
    assert!(auth.check(DEFAULT_USER, "api.web.loda", "machine", "GET").await.unwrap());
    assert!(!auth.check(DEFAULT_USER, "api.web.loda", "machine", "POST").await.unwrap());
    assert!(auth.check("root", "api.web.loda", "alarm", "DELETE").await.unwrap());
    assert!(!auth.check("nobody", "loda", "machine", "GET").await.unwrap());
}

#[tokio::test]
async fn test_grant_is_inherited_below_namespace() {
    let auth = service().await;
    auth.create_user(User::new("u")).await.unwrap();
    auth.create_group("web-readers", vec!["web.loda-machine-GET".into()], &["u".to_string()])
        .await
        .unwrap();
    assert!(auth.check("u", "web.loda", "machine", "GET").await.unwrap());
    assert!(auth.check("u", "api.web.loda", "machine", "GET").await.unwrap());
    assert!(!auth.check("u", "db.loda", "machine", "GET").await.unwrap());
    assert!(!auth.check("u", "xweb.loda", "machine", "GET").await.unwrap());
    assert!(!auth.check("u", "api.web.loda", "alarm", "GET").await.unwrap());
}

#[tokio::test]
async fn test_user_without_groups_is_denied() {
    let auth = service().await;
    auth.create_user(User::new("loner")).await.unwrap();
    assert!(!auth.check("loner", "loda", "machine", "GET").await.unwrap());
}

// ============================================================================
// Users
// ============================================================================

#[tokio::test]
async fn test_create_user_joins_groups() {
    let auth = service().await;
    let mut user = User::new("bob");
    user.groups = vec![DEFAULT_GROUP.to_string()];
    auth.create_user(user.clone()).await.unwrap();
    assert!(auth.get_group(DEFAULT_GROUP).await.unwrap().members.contains(&"bob".to_string()));
    assert!(matches!(auth.create_user(user).await, Err(RegistryError::AlreadyExists { .. })));

    let mut ghost = User::new("carol");
    ghost.groups = vec!["missing".to_string()];
    assert!(auth.create_user(ghost).await.unwrap_err().is_not_found());
    assert!(auth.get_user("carol").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_update_user_validates_alert() {
    let auth = service().await;
    auth.update_user("root", Some("123".into()), Some(ALERT_DISABLE.into())).await.unwrap();
    let root = auth.get_user("root").await.unwrap();
    assert_eq!(root.mobile, "123");
    assert_eq!(root.alert, ALERT_DISABLE);
    assert!(auth.update_user("root", None, Some("maybe".into())).await.is_err());
}

#[tokio::test]
async fn test_remove_user_leaves_groups() {
    let auth = service().await;
    auth.remove_user("root").await.unwrap();
    assert!(auth.get_user("root").await.unwrap_err().is_not_found());
    assert!(auth.get_group(ADMIN_GROUP).await.unwrap().members.is_empty());
    assert!(!auth.check("root", "loda", "machine", "GET").await.unwrap());
    assert!(auth.list_users().await.unwrap().iter().all(|u| u.username != "root"));
}

// ============================================================================
// Groups
// ============================================================================

#[tokio::test]
async fn test_create_group_rejects_duplicates_and_bad_items() {
    let auth = service().await;
    auth.create_group("g", vec![], &[]).await.unwrap();
    assert!(matches!(auth.create_group("g", vec![], &[]).await, Err(RegistryError::AlreadyExists { .. })));
    let err = auth.create_group("h", vec!["loda-widget-GET".into()], &[]).await.unwrap_err();
    assert!(matches!(err, RegistryError::InvalidParam { .. }));
    assert!(auth.create_group("h", vec![], &["ghost".to_string()]).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_update_group_member_is_bidirectional() {
    let auth = service().await;
    for name in ["a", "b", "c"] {
        auth.create_user(User::new(name)).await.unwrap();
    }
    auth.create_group("team", vec![], &["a".to_string()]).await.unwrap();
    auth.update_group_member("team", &["b".to_string()], &["c".to_string()]).await.unwrap();

    let team = auth.get_group("team").await.unwrap();
    assert_eq!(team.managers, vec!["b"]);
    assert_eq!(team.members, vec!["c", "b"]);
    assert!(auth.get_user("a").await.unwrap().groups.is_empty());
    assert_eq!(auth.get_user("b").await.unwrap().groups, vec!["team"]);
    assert_eq!(auth.get_user("c").await.unwrap().groups, vec!["team"]);

    let err = auth.update_group_member("team", &[], &["ghost".to_string()]).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_update_group_items() {
    let auth = service().await;
    auth.create_user(User::new("u")).await.unwrap();
    auth.create_group("g", vec![], &["u".to_string()]).await.unwrap();
    assert!(!auth.check("u", "loda", "document", "PUT").await.unwrap());
    auth.update_group_items("g", vec!["loda-document-PUT".into()]).await.unwrap();
    assert!(auth.check("u", "a.loda", "document", "PUT").await.unwrap());
}

#[tokio::test]
async fn test_remove_group() {
    let auth = service().await;
    auth.create_group("tmp", vec![], &["root".to_string()]).await.unwrap();
    auth.remove_group("tmp").await.unwrap();
    assert!(auth.get_group("tmp").await.unwrap_err().is_not_found());
    assert_eq!(auth.get_user("root").await.unwrap().groups, vec![ADMIN_GROUP]);
    assert!(matches!(auth.remove_group(ADMIN_GROUP).await, Err(RegistryError::NotAllowed { .. })));
    // The name can be reused.
    auth.create_group("tmp", vec![], &[]).await.unwrap();
}

#[tokio::test]
async fn test_ns_groups_and_listing() {
    let auth = service().await;
    auth.create_ns_groups("web.loda", &["root".to_string()]).await.unwrap();
    auth.create_ns_groups("api.web.loda", &[]).await.unwrap();
    auth.create_ns_groups("webx.loda", &[]).await.unwrap();
    // Second call is a no-op.
    auth.create_ns_groups("web.loda", &[]).await.unwrap();

    let groups = auth.list_ns_groups("web.loda").await.unwrap();
    assert_eq!(names(&groups), vec![
        "loda.web-dev",
        "loda.web-op",
        "loda.web.api-dev",
        "loda.web.api-op"
    ]);
    assert!(auth.check("root", "api.web.loda", "machine", "POST").await.unwrap());
}
