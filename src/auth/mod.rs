//! Users, groups, and namespace permissions.
//!
//! Users live at `(authorize, "u-" + name)` and groups at
//! `(authorize, "g-" + name)`, both as JSON. Membership is recorded on both
//! sides (group `Members`/`Managers` and user `Groups`) and every change that
//! touches both sides is written as one batch. The store has no delete, so a
//! removed record is written as an empty value and read back as absent.
//!
//! # Usage
//!
//! ```rust,ignore
//! let auth = AuthService::new(store);
//! auth.init(&["alice".to_string()]).await?;
//! if !auth.check("alice", "api.web.loda", "machine", "GET").await? {
//!     return Err(RegistryError::not_allowed("permission denied"));
//! }
//! ```

mod permission;
pub mod ratelimit;
pub mod session;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;

pub use self::permission::PermissionItem;
pub use self::permission::item_grants;
pub use self::permission::query;
pub use self::ratelimit::RateLimiter;
pub use self::session::MemorySessionStore;
pub use self::session::SessionStore;
use crate::constants::ADMIN_GROUP;
use crate::constants::ALERT_DISABLE;
use crate::constants::ALERT_ENABLE;
use crate::constants::AUTH_BUCKET;
use crate::constants::DEFAULT_GROUP;
use crate::constants::DEFAULT_USER;
use crate::constants::GROUP_PREFIX;
use crate::constants::ROOT_NAME;
use crate::constants::USER_PREFIX;
use crate::error::RegistryError;
use crate::error::Result;
use crate::store::KeyValueStore;
use crate::store::Row;
use crate::tree::ns_dev_group;
use crate::tree::ns_op_group;
use crate::tree::reverse_ns;

fn default_alert() -> String {
    ALERT_ENABLE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Mobile", default)]
    pub mobile: String,
    #[serde(rename = "Alert", default = "default_alert")]
    pub alert: String,
    #[serde(rename = "Groups", default)]
    pub groups: Vec<String>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            mobile: String::new(),
            alert: default_alert(),
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    #[serde(rename = "GName")]
    pub name: String,
    #[serde(rename = "Managers", default)]
    pub managers: Vec<String>,
    #[serde(rename = "Members", default)]
    pub members: Vec<String>,
    #[serde(rename = "Items", default)]
    pub items: Vec<String>,
}

impl Group {
    pub fn new(name: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            name: name.into(),
            items,
            ..Self::default()
        }
    }

    fn has_user(&self, username: &str) -> bool {
        self.members.iter().chain(&self.managers).any(|u| u == username)
    }

    fn drop_user(&mut self, username: &str) {
        self.members.retain(|u| u != username);
        self.managers.retain(|u| u != username);
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v == value) {
        return false;
    }
    list.push(value.to_string());
    true
}

fn user_key(name: &str) -> String {
    format!("{USER_PREFIX}{name}")
}

fn group_key(name: &str) -> String {
    format!("{GROUP_PREFIX}{name}")
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(RegistryError::invalid_param(format!("invalid {what} name {name:?}")));
    }
    Ok(())
}

fn check_alert(alert: &str) -> Result<()> {
    if alert != ALERT_ENABLE && alert != ALERT_DISABLE {
        return Err(RegistryError::invalid_param(format!(
            "alert must be {ALERT_ENABLE} or {ALERT_DISABLE}, got {alert:?}"
        )));
    }
    Ok(())
}

fn check_items(items: &[String]) -> Result<()> {
    for item in items {
        item.parse::<PermissionItem>()?;
    }
    Ok(())
}

fn encode<T: Serialize>(key: String, value: &T) -> Result<Row> {
    let bytes = serde_json::to_vec(value).map_err(|e| RegistryError::storage(format!("failed to encode {key}: {e}")))?;
    Ok(Row::new(AUTH_BUCKET, key, bytes))
}

fn tombstone(key: String) -> Row {
    Row::new(AUTH_BUCKET, key, Vec::new())
}

pub struct AuthService {
    store: Arc<dyn KeyValueStore>,
    /// Serialises read-modify-write cycles on user and group records.
    lock: Mutex<()>,
}

impl AuthService {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.view(AUTH_BUCKET.as_bytes(), key.as_bytes()).await? {
            Some(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| RegistryError::invalid_format(format!("{key}: {e}"))),
            _ => Ok(None),
        }
    }

    async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let rows = self.store.views(AUTH_BUCKET.as_bytes(), prefix.as_bytes()).await?;
        rows.into_iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| {
                serde_json::from_slice(&v).map_err(|e| {
                    RegistryError::invalid_format(format!("{}: {e}", String::from_utf8_lossy(&k)))
                })
            })
            .collect()
    }

    async fn read_user(&self, name: &str) -> Result<Option<User>> {
        self.read(&user_key(name)).await
    }

    async fn read_group(&self, name: &str) -> Result<Option<Group>> {
        self.read(&group_key(name)).await
    }

    async fn existing_users(&self, names: &[String]) -> Result<BTreeMap<String, User>> {
        let mut out = BTreeMap::new();
        for name in names {
            if out.contains_key(name) {
                continue;
            }
            let user = self
                .read_user(name)
                .await?
                .ok_or_else(|| RegistryError::not_found(format!("user {name}")))?;
            out.insert(name.clone(), user);
        }
        Ok(out)
    }

    async fn write(&self, rows: Vec<Row>) -> Result<()> {
        self.store.batch(rows).await
    }

    /// First-boot setup: the default group with read access and the
    /// `default` user, the admin group with full access and the configured
    /// admins. Safe to call on every start.
    pub async fn init(&self, admins: &[String]) -> Result<()> {
        self.store.create_bucket_if_not_exist(AUTH_BUCKET.as_bytes()).await?;
        self.init_group(DEFAULT_GROUP, PermissionItem::defaults(), &[DEFAULT_USER.to_string()])
            .await?;
        self.init_group(ADMIN_GROUP, PermissionItem::full(ROOT_NAME), admins).await?;
        Ok(())
    }

    /// Creates `name` with `items` if it does not exist, and makes sure every
    /// user in `members` exists and belongs to it.
    pub async fn init_group(&self, name: &str, items: Vec<String>, members: &[String]) -> Result<()> {
        check_name("group", name)?;
        check_items(&items)?;
        let _guard = self.lock.lock().await;

        let mut rows = Vec::new();
        let mut group = match self.read_group(name).await? {
            Some(group) => group,
            None => {
                info!(group = name, "creating group");
                let group = Group::new(name, items);
                rows.push(encode(group_key(name), &group)?);
                group
            }
        };

        let mut group_dirty = false;
        for member in members {
            check_name("user", member)?;
            let mut user = self.read_user(member).await?.unwrap_or_else(|| User::new(member.clone()));
            if push_unique(&mut user.groups, name) {
                rows.push(encode(user_key(member), &user)?);
            }
            group_dirty |= push_unique(&mut group.members, member);
        }
        if group_dirty {
            rows.retain(|r| r.key != group_key(name).as_bytes());
            rows.push(encode(group_key(name), &group)?);
        }
        if !rows.is_empty() {
            self.write(rows).await?;
        }
        Ok(())
    }

    /// Creates a user; every group named in `user.groups` must exist and
    /// gains the user as a member.
    pub async fn create_user(&self, user: User) -> Result<()> {
        check_name("user", &user.username)?;
        check_alert(&user.alert)?;
        let _guard = self.lock.lock().await;
        if self.read_user(&user.username).await?.is_some() {
            return Err(RegistryError::already_exists(format!("user {}", user.username)));
        }

        let mut rows = vec![encode(user_key(&user.username), &user)?];
        for name in user.groups.iter().collect::<BTreeSet<_>>() {
            let mut group = self
                .read_group(name)
                .await?
                .ok_or_else(|| RegistryError::not_found(format!("group {name}")))?;
            push_unique(&mut group.members, &user.username);
            rows.push(encode(group_key(name), &group)?);
        }
        self.write(rows).await?;
        info!(user = %user.username, "created user");
        Ok(())
    }

    pub async fn get_user(&self, username: &str) -> Result<User> {
        self.read_user(username)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("user {username}")))
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.list(USER_PREFIX).await
    }

    /// Changes contact details. `None` keeps the current value.
    pub async fn update_user(&self, username: &str, mobile: Option<String>, alert: Option<String>) -> Result<()> {
        if let Some(alert) = &alert {
            check_alert(alert)?;
        }
        let _guard = self.lock.lock().await;
        let mut user = self.get_user(username).await?;
        if let Some(mobile) = mobile {
            user.mobile = mobile;
        }
        if let Some(alert) = alert {
            user.alert = alert;
        }
        self.write(vec![encode(user_key(username), &user)?]).await
    }

    /// Removes a user and drops it from every group it was in.
    pub async fn remove_user(&self, username: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let user = self.get_user(username).await?;
        let mut rows = vec![tombstone(user_key(username))];
        for name in &user.groups {
            if let Some(mut group) = self.read_group(name).await? {
                group.drop_user(username);
                rows.push(encode(group_key(name), &group)?);
            }
        }
        self.write(rows).await?;
        info!(user = username, "removed user");
        Ok(())
    }

    /// Creates a group. Managers must exist and also become members.
    pub async fn create_group(&self, name: &str, items: Vec<String>, managers: &[String]) -> Result<()> {
        check_name("group", name)?;
        check_items(&items)?;
        let _guard = self.lock.lock().await;
        if self.read_group(name).await?.is_some() {
            return Err(RegistryError::already_exists(format!("group {name}")));
        }
        let users = self.existing_users(managers).await?;

        let mut group = Group::new(name, items);
        let mut rows = Vec::new();
        for (username, mut user) in users {
            push_unique(&mut group.managers, &username);
            push_unique(&mut group.members, &username);
            push_unique(&mut user.groups, name);
            rows.push(encode(user_key(&username), &user)?);
        }
        rows.push(encode(group_key(name), &group)?);
        self.write(rows).await?;
        info!(group = name, "created group");
        Ok(())
    }

    /// Ops and dev groups of a namespace: full access for ops, read access
    /// for dev. Existing groups are left alone.
    pub async fn create_ns_groups(&self, ns: &str, managers: &[String]) -> Result<()> {
        let op = ns_op_group(ns);
        let dev = ns_dev_group(ns);
        for (name, items) in [(op, PermissionItem::full(ns)), (dev, PermissionItem::read_only(ns))] {
            match self.create_group(&name, items, managers).await {
                Ok(()) | Err(RegistryError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn get_group(&self, name: &str) -> Result<Group> {
        self.read_group(name)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("group {name}")))
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        self.list(GROUP_PREFIX).await
    }

    /// Groups of `ns` and of every namespace below it.
    pub async fn list_ns_groups(&self, ns: &str) -> Result<Vec<Group>> {
        let reversed = reverse_ns(ns);
        let groups: Vec<Group> = self.list(&format!("{GROUP_PREFIX}{reversed}")).await?;
        Ok(groups
            .into_iter()
            .filter(|g| {
                g.name
                    .strip_prefix(&reversed)
                    .is_some_and(|rest| rest.starts_with('-') || rest.starts_with('.'))
            })
            .collect())
    }

    pub async fn update_group_items(&self, name: &str, items: Vec<String>) -> Result<()> {
        check_items(&items)?;
        let _guard = self.lock.lock().await;
        let mut group = self.get_group(name).await?;
        group.items = items;
        self.write(vec![encode(group_key(name), &group)?]).await?;
        debug!(group = name, "updated group items");
        Ok(())
    }

    /// Replaces the managers and members of a group and updates the `Groups`
    /// list of every user that joined or left.
    pub async fn update_group_member(&self, name: &str, managers: &[String], members: &[String]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut group = self.get_group(name).await?;

        let mut new_members: Vec<String> = Vec::new();
        for user in members.iter().chain(managers) {
            push_unique(&mut new_members, user);
        }
        let mut users = self.existing_users(&new_members).await?;

        let before: BTreeSet<String> = group.members.iter().chain(&group.managers).cloned().collect();
        let after: BTreeSet<String> = new_members.iter().cloned().collect();

        let mut rows = Vec::new();
        for joined in after.difference(&before) {
            if let Some(user) = users.get_mut(joined) {
                if push_unique(&mut user.groups, name) {
                    rows.push(encode(user_key(joined), &*user)?);
                }
            }
        }
        for left in before.difference(&after) {
            if let Some(mut user) = self.read_user(left).await? {
                user.groups.retain(|g| g != name);
                rows.push(encode(user_key(left), &user)?);
            }
        }

        group.managers = managers.to_vec();
        group.members = new_members;
        rows.push(encode(group_key(name), &group)?);
        self.write(rows).await?;
        info!(group = name, members = group.members.len(), "updated group membership");
        Ok(())
    }

    /// Removes a group and drops it from its users. The built-in groups
    /// cannot be removed.
    pub async fn remove_group(&self, name: &str) -> Result<()> {
        if name == DEFAULT_GROUP || name == ADMIN_GROUP {
            return Err(RegistryError::not_allowed(format!("group {name} is built in")));
        }
        let _guard = self.lock.lock().await;
        let group = self.get_group(name).await?;
        let mut rows = vec![tombstone(group_key(name))];
        let users: BTreeSet<&String> = group.members.iter().chain(&group.managers).collect();
        for username in users {
            if let Some(mut user) = self.read_user(username).await? {
                user.groups.retain(|g| g != name);
                rows.push(encode(user_key(username), &user)?);
            }
        }
        self.write(rows).await?;
        info!(group = name, "removed group");
        Ok(())
    }

    /// Whether `username` may call `method` on `resource_type` under `ns`.
    /// Unknown users and users without groups are denied.
    ///
    /// The request URI plays no part in the decision, so callers resolve it
    /// to `ns` and `resource_type` first and it is not taken here.
    pub async fn check(&self, username: &str, ns: &str, resource_type: &str, method: &str) -> Result<bool> {
        let Some(user) = self.read_user(username).await? else {
            debug!(username, "permission denied: unknown user");
            return Ok(false);
        };
        let q = query(ns, resource_type, method);
        for name in &user.groups {
            let Some(group) = self.read_group(name).await? else {
                continue;
            };
            if !group.has_user(username) {
                continue;
            }
            if group.items.iter().any(|item| item_grants(item, &q)) {
                return Ok(true);
            }
        }
        debug!(username, query = %q, "permission denied");
        Ok(false)
    }
}

#[cfg(test)]
mod tests;
