//! Per-node dashboards.
//!
//! Each node has one JSON document mapping dashboard name to dashboard.
//! Panels and targets are addressed by index. Every edit reads the whole
//! document, changes it, and writes it back.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RegistryError;
use crate::error::Result;
use crate::tree::NodeTree;

/// Key of the dashboard document inside a node bucket.
pub const DASHBOARD_KEY: &str = "_dashboards";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub measurement: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub aggregate: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Panel {
    #[serde(default)]
    pub title: String,
    #[serde(rename = "graphtype", default)]
    pub graph_type: String,
    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dashboard {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub panels: Vec<Panel>,
}

pub type Dashboards = BTreeMap<String, Dashboard>;

/// Checks that `order` is a permutation of `0..len`.
pub fn check_permutation(order: &[usize], len: usize) -> Result<()> {
    if order.len() != len {
        return Err(RegistryError::invalid_param(format!(
            "new order has {} entries, dashboard has {len} panels",
            order.len()
        )));
    }
    let mut seen = HashSet::with_capacity(len);
    for &i in order {
        if i >= len || !seen.insert(i) {
            return Err(RegistryError::invalid_param(format!("{order:?} is not a permutation of 0..{len}")));
        }
    }
    Ok(())
}

fn panel_mut<'a>(dashboard: &'a mut Dashboard, name: &str, pindex: usize) -> Result<&'a mut Panel> {
    dashboard
        .panels
        .get_mut(pindex)
        .ok_or_else(|| RegistryError::not_found(format!("panel {pindex} of dashboard {name}")))
}

fn target_mut<'a>(panel: &'a mut Panel, name: &str, pindex: usize, tindex: usize) -> Result<&'a mut Target> {
    panel
        .targets
        .get_mut(tindex)
        .ok_or_else(|| RegistryError::not_found(format!("target {tindex} of panel {pindex} in dashboard {name}")))
}

pub struct DashboardService {
    tree: Arc<NodeTree>,
    write_lock: Mutex<()>,
}

impl DashboardService {
    pub fn new(tree: Arc<NodeTree>) -> Self {
        Self {
            tree,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self, node_id: &str) -> Result<Dashboards> {
        match self.tree.store().view(node_id.as_bytes(), DASHBOARD_KEY.as_bytes()).await? {
            Some(blob) if !blob.is_empty() => serde_json::from_slice(&blob)
                .map_err(|e| RegistryError::invalid_format(format!("dashboards of {node_id}: {e}"))),
            _ => Ok(Dashboards::new()),
        }
    }

    async fn save(&self, node_id: &str, dashboards: &Dashboards) -> Result<()> {
        let blob = serde_json::to_vec(dashboards)
            .map_err(|e| RegistryError::storage(format!("failed to encode dashboards: {e}")))?;
        self.tree
            .store()
            .update(node_id.as_bytes(), DASHBOARD_KEY.as_bytes(), &blob)
            .await
    }

    /// Read-modify-write of the document of `ns`.
    async fn edit<T>(&self, ns: &str, f: impl FnOnce(&mut Dashboards) -> Result<T>) -> Result<T> {
        let node = self.tree.get_by_ns(ns).await?;
        let _guard = self.write_lock.lock().await;
        let mut dashboards = self.load(&node.id).await?;
        let out = f(&mut dashboards)?;
        self.save(&node.id, &dashboards).await?;
        Ok(out)
    }

    async fn edit_dashboard<T>(&self, ns: &str, name: &str, f: impl FnOnce(&mut Dashboard) -> Result<T>) -> Result<T> {
        self.edit(ns, |dashboards| {
            let dashboard = dashboards
                .get_mut(name)
                .ok_or_else(|| RegistryError::not_found(format!("dashboard {name} in {ns}")))?;
            f(dashboard)
        })
        .await
    }

    pub async fn get_dashboards(&self, ns: &str) -> Result<Dashboards> {
        let node = self.tree.get_by_ns(ns).await?;
        self.load(&node.id).await
    }

    pub async fn get_dashboard(&self, ns: &str, name: &str) -> Result<Dashboard> {
        self.get_dashboards(ns)
            .await?
            .remove(name)
            .ok_or_else(|| RegistryError::not_found(format!("dashboard {name} in {ns}")))
    }

    /// Creates or replaces a dashboard.
    pub async fn set_dashboard(&self, ns: &str, name: &str, dashboard: Dashboard) -> Result<()> {
        if name.is_empty() {
            return Err(RegistryError::invalid_param("empty dashboard name"));
        }
        self.edit(ns, |dashboards| {
            dashboards.insert(name.to_string(), dashboard);
            Ok(())
        })
        .await?;
        debug!(%ns, name, "saved dashboard");
        Ok(())
    }

    pub async fn remove_dashboard(&self, ns: &str, name: &str) -> Result<()> {
        self.edit(ns, |dashboards| {
            dashboards
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| RegistryError::not_found(format!("dashboard {name} in {ns}")))
        })
        .await
    }

    /// Appends a panel and returns its index.
    pub async fn add_panel(&self, ns: &str, name: &str, panel: Panel) -> Result<usize> {
        self.edit_dashboard(ns, name, |d| {
            d.panels.push(panel);
            Ok(d.panels.len() - 1)
        })
        .await
    }

    pub async fn update_panel(&self, ns: &str, name: &str, pindex: usize, panel: Panel) -> Result<()> {
        self.edit_dashboard(ns, name, |d| {
            *panel_mut(d, name, pindex)? = panel;
            Ok(())
        })
        .await
    }

    pub async fn remove_panel(&self, ns: &str, name: &str, pindex: usize) -> Result<()> {
        self.edit_dashboard(ns, name, |d| {
            panel_mut(d, name, pindex)?;
            d.panels.remove(pindex);
            Ok(())
        })
        .await
    }

    /// Reorders panels so that new position `i` holds old panel `order[i]`.
    pub async fn reorder_panel(&self, ns: &str, name: &str, order: &[usize]) -> Result<()> {
        self.edit_dashboard(ns, name, |d| {
            check_permutation(order, d.panels.len())?;
            let old = std::mem::take(&mut d.panels);
            let mut slots: Vec<Option<Panel>> = old.into_iter().map(Some).collect();
            d.panels = order.iter().filter_map(|&i| slots[i].take()).collect();
            Ok(())
        })
        .await
    }

    /// Appends a target to a panel and returns its index.
    pub async fn add_target(&self, ns: &str, name: &str, pindex: usize, target: Target) -> Result<usize> {
        self.edit_dashboard(ns, name, |d| {
            let panel = panel_mut(d, name, pindex)?;
            panel.targets.push(target);
            Ok(panel.targets.len() - 1)
        })
        .await
    }

    pub async fn update_target(&self, ns: &str, name: &str, pindex: usize, tindex: usize, target: Target) -> Result<()> {
        self.edit_dashboard(ns, name, |d| {
            let panel = panel_mut(d, name, pindex)?;
            *target_mut(panel, name, pindex, tindex)? = target;
            Ok(())
        })
        .await
    }

    pub async fn remove_target(&self, ns: &str, name: &str, pindex: usize, tindex: usize) -> Result<()> {
        self.edit_dashboard(ns, name, |d| {
            let panel = panel_mut(d, name, pindex)?;
            target_mut(panel, name, pindex, tindex)?;
            panel.targets.remove(tindex);
            Ok(())
        })
        .await
    }
}
