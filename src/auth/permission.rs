//! Namespace-scoped permission items.
//!
//! An item is the string `ns-resourceType-method`, e.g. `loda.web-machine-GET`.
//! A request for `(ns, type, method)` is granted by an item when the request
//! string equals the item or ends with `.` followed by the item, so a grant
//! on a namespace covers everything below it.

use std::fmt;
use std::str::FromStr;

use crate::constants::ALL_RESOURCE_TYPES;
use crate::constants::METHODS;
use crate::constants::ROOT_NAME;
use crate::error::RegistryError;

/// Request string checked against permission items.
pub fn query(ns: &str, resource_type: &str, method: &str) -> String {
    format!("{ns}-{resource_type}-{method}")
}

/// Whether `item` grants the request string `q`.
pub fn item_grants(item: &str, q: &str) -> bool {
    match q.strip_suffix(item) {
        Some("") => true,
        Some(head) => head.ends_with('.'),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionItem {
    pub ns: String,
    pub resource_type: String,
    pub method: String,
}

impl PermissionItem {
    pub fn new(ns: impl Into<String>, resource_type: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            resource_type: resource_type.into(),
            method: method.into(),
        }
    }

    /// Read access to every resource type under `ns`.
    pub fn read_only(ns: &str) -> Vec<String> {
        ALL_RESOURCE_TYPES
            .iter()
            .map(|t| PermissionItem::new(ns, *t, "GET").to_string())
            .collect()
    }

    /// Every method on every resource type under `ns`.
    pub fn full(ns: &str) -> Vec<String> {
        ALL_RESOURCE_TYPES
            .iter()
            .flat_map(|t| METHODS.iter().map(move |m| PermissionItem::new(ns, *t, *m).to_string()))
            .collect()
    }

    /// Baseline items of the default group.
    pub fn defaults() -> Vec<String> {
        Self::read_only(ROOT_NAME)
    }
}

impl fmt::Display for PermissionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", query(&self.ns, &self.resource_type, &self.method))
    }
}

impl FromStr for PermissionItem {
    type Err = RegistryError;

    /// Splits from the right; the NS may itself contain `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, '-');
        let (Some(method), Some(resource_type), Some(ns)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RegistryError::invalid_param(format!("permission item {s:?} is not ns-type-method")));
        };
        if ns.is_empty() {
            return Err(RegistryError::invalid_param(format!("permission item {s:?} has no ns")));
        }
        if !ALL_RESOURCE_TYPES.contains(&resource_type) {
            return Err(RegistryError::invalid_param(format!("unknown resource type {resource_type} in {s:?}")));
        }
        if !METHODS.contains(&method) {
            return Err(RegistryError::invalid_param(format!("unknown method {method} in {s:?}")));
        }
        Ok(Self::new(ns, resource_type, method))
    }
}
