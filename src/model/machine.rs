//! Machine placement, registration, and status.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use regex::Regex;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::resource::ResourceService;
use crate::constants::HOSTNAME_PROPERTY;
use crate::constants::ID_PROPERTY;
use crate::constants::MACHINE_STATUS_CONCURRENCY;
use crate::constants::MACHINE_REPORT_ALIVE;
use crate::constants::MACHINE_REPORT_TIMEOUT;
use crate::constants::NO_MATCH_REG;
use crate::constants::POOL_NS;
use crate::constants::RES_MACHINE;
use crate::constants::ROOT_NAME;
use crate::constants::STATUS_DEAD;
use crate::constants::STATUS_ONLINE;
use crate::constants::STATUS_PROPERTY;
use crate::error::RegistryError;
use crate::error::Result;
use crate::report::ReportJournal;
use crate::resource::Resource;

/// Status a host should have given its last report, or `None` to leave it
/// unchanged (reported between the alive and timeout windows).
pub fn classify(last_report: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<&'static str> {
    let Some(at) = last_report else {
        return Some(STATUS_DEAD);
    };
    let age = (now - at).to_std().unwrap_or(Duration::ZERO);
    if age >= MACHINE_REPORT_TIMEOUT {
        Some(STATUS_DEAD)
    } else if age < MACHINE_REPORT_ALIVE {
        Some(STATUS_ONLINE)
    } else {
        None
    }
}

pub struct MachineController {
    resources: Arc<ResourceService>,
    reports: Arc<ReportJournal>,
    regex_cache: Mutex<HashMap<String, Regex>>,
}

impl MachineController {
    pub fn new(resources: Arc<ResourceService>, reports: Arc<ReportJournal>) -> Self {
        Self {
            resources,
            reports,
            regex_cache: Mutex::new(HashMap::new()),
        }
    }

    fn matches(&self, reg: &str, hostname: &str) -> Option<bool> {
        let mut cache = self.regex_cache.lock();
        if let Some(re) = cache.get(reg) {
            return Some(re.is_match(hostname));
        }
        match Regex::new(reg) {
            Ok(re) => {
                let hit = re.is_match(hostname);
                cache.insert(reg.to_string(), re);
                Some(hit)
            }
            Err(err) => {
                warn!(reg, error = %err, "skipping leaf with invalid machine regex");
                None
            }
        }
    }

    /// Leaves whose machine regex matches `hostname`. Falls back to the pool.
    pub async fn match_ns(&self, hostname: &str) -> Result<Vec<String>> {
        if hostname.is_empty() {
            return Err(RegistryError::invalid_param("empty hostname"));
        }
        let leaves = self.resources.tree().leaf_machine_reg(ROOT_NAME).await?;
        let mut matched: Vec<String> = leaves
            .into_iter()
            .filter(|(_, reg)| !reg.is_empty() && reg.as_str() != NO_MATCH_REG)
            .filter(|(_, reg)| self.matches(reg, hostname) == Some(true))
            .map(|(ns, _)| ns)
            .collect();
        if matched.is_empty() {
            matched.push(POOL_NS.to_string());
        }
        Ok(matched)
    }

    /// Appends a fresh copy of `machine` to every matching leaf and returns
    /// `ns -> resource id`.
    ///
    /// Appends that succeeded are kept when a later one fails; the error
    /// names every NS that could not be written.
    pub async fn register_machine(&self, machine: Resource) -> Result<BTreeMap<String, String>> {
        let hostname = machine
            .get(HOSTNAME_PROPERTY)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RegistryError::invalid_param("machine has no hostname"))?
            .clone();
        let namespaces = self.match_ns(&hostname).await?;

        let mut registered = BTreeMap::new();
        let mut failed = Vec::new();
        for ns in namespaces {
            let mut copy = machine.clone();
            copy.remove(ID_PROPERTY);
            match self.resources.append_resource(&ns, RES_MACHINE, vec![copy]).await {
                Ok(ids) => {
                    if let Some(id) = ids.into_iter().next() {
                        registered.insert(ns, id);
                    }
                }
                Err(err) => {
                    error!(%hostname, %ns, error = %err, "failed to register machine");
                    failed.push(ns);
                }
            }
        }

        if !failed.is_empty() {
            return Err(RegistryError::storage(format!(
                "registered {hostname} in {:?} but failed in {failed:?}",
                registered.keys().collect::<Vec<_>>()
            )));
        }
        info!(%hostname, namespaces = ?registered.keys().collect::<Vec<_>>(), "registered machine");
        Ok(registered)
    }

    /// Reclassifies every machine from the report journal as of `now`.
    /// Lists are written back only when an entry changed. Returns the
    /// number of machines whose status changed.
    pub async fn update_machine_status(&self, now: DateTime<Utc>) -> Result<usize> {
        let leaves = self.resources.tree().leaf_ns(ROOT_NAME).await?;
        let results: Vec<(String, Result<usize>)> = stream::iter(leaves)
            .map(|ns| async move {
                let result = self.update_leaf_status(&ns, now).await;
                (ns, result)
            })
            .buffer_unordered(MACHINE_STATUS_CONCURRENCY)
            .collect()
            .await;
        let mut changed_total = 0;
        for (ns, result) in results {
            match result {
                Ok(changed) => changed_total += changed,
                Err(err) => warn!(%ns, error = %err, "failed to update machine status"),
            }
        }
        if changed_total > 0 {
            info!(changed = changed_total, "machine status updated");
        }
        Ok(changed_total)
    }

    /// Runs under the resource write lock, so machines registered or removed
    /// while the pass is running are kept.
    async fn update_leaf_status(&self, ns: &str, now: DateTime<Utc>) -> Result<usize> {
        self.resources
            .edit_list(ns, RES_MACHINE, |machines| {
                let mut changed = 0;
                for machine in machines.iter_mut() {
                    let Some(hostname) = machine.get(HOSTNAME_PROPERTY) else {
                        continue;
                    };
                    let last = self.reports.get_report(hostname).map(|r| r.update_time);
                    let Some(status) = classify(last, now) else {
                        continue;
                    };
                    if machine.get(STATUS_PROPERTY).map(String::as_str) != Some(status) {
                        debug!(%ns, %hostname, status, "machine status changed");
                        machine.insert(STATUS_PROPERTY.to_string(), status.to_string());
                        changed += 1;
                    }
                }
                Ok(changed)
            })
            .await
    }
}

/// Runs [`MachineController::update_machine_status`] every `every` while
/// `should_run` holds (the daemon passes "is leader").
pub async fn run_status_loop(
    controller: Arc<MachineController>,
    every: Duration,
    should_run: impl Fn() -> bool + Send,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_secs = every.as_secs(), "machine status loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("machine status loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                if !should_run() {
                    continue;
                }
                if let Err(err) = controller.update_machine_status(Utc::now()).await {
                    warn!(error = %err, "machine status pass failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::report::Report;
    use crate::store::KeyValueStore;
    use crate::store::MemoryStore;
    use crate::store::SlowViews;
    use crate::tree::NodeTree;
    use crate::tree::NodeType;

    fn at_hours(h: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(h * 3600, 0).single().unwrap()
    }

    async fn controller_on(
        store: Arc<dyn KeyValueStore>,
    ) -> (MachineController, Arc<ResourceService>, Arc<ReportJournal>) {
        let tree = Arc::new(NodeTree::new(Arc::clone(&store)));
        tree.init().await.unwrap();
        tree.new_node("a", "loda", NodeType::Leaf, "x-").await.unwrap();
        tree.new_node("b", "loda", NodeType::Leaf, "x-1").await.unwrap();
        tree.new_node("c", "loda", NodeType::Leaf, "^db-").await.unwrap();
        let resources = Arc::new(ResourceService::new(tree));
        let reports = Arc::new(ReportJournal::new(store));
        (
            MachineController::new(Arc::clone(&resources), Arc::clone(&reports)),
            resources,
            reports,
        )
    }

    async fn controller() -> (MachineController, Arc<ResourceService>, Arc<ReportJournal>) {
        controller_on(Arc::new(MemoryStore::new())).await
    }

    fn machine(host: &str) -> Resource {
        [("hostname", host), ("ip", "10.0.0.9")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_classify_windows() {
        let now = at_hours(100);
        assert_eq!(classify(None, now), Some(STATUS_DEAD));
        assert_eq!(classify(Some(at_hours(99)), now), Some(STATUS_ONLINE));
        assert_eq!(classify(Some(at_hours(70)), now), None);
        assert_eq!(classify(Some(at_hours(52)), now), Some(STATUS_DEAD));
        // Reports from the future count as fresh.
        assert_eq!(classify(Some(at_hours(101)), now), Some(STATUS_ONLINE));
    }

    #[tokio::test]
    async fn test_match_ns_multiple_and_pool() {
        let (ctl, _, _) = controller().await;
        assert_eq!(ctl.match_ns("x-1-host").await.unwrap(), vec!["a.loda", "b.loda"]);
        assert_eq!(ctl.match_ns("db-3").await.unwrap(), vec!["c.loda"]);
        assert_eq!(ctl.match_ns("other").await.unwrap(), vec![POOL_NS]);
        assert!(ctl.match_ns("").await.is_err());
    }

    #[tokio::test]
    async fn test_register_machine_in_every_match() {
        let (ctl, resources, _) = controller().await;
        let placed = ctl.register_machine(machine("x-1-host")).await.unwrap();
        assert_eq!(placed.keys().collect::<Vec<_>>(), vec!["a.loda", "b.loda"]);
        assert_ne!(placed["a.loda"], placed["b.loda"]);
        let found = resources.search_machine("x-1-host").await.unwrap();
        assert_eq!(found.len(), 2);

        let err = ctl.register_machine(machine("")).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidParam { .. }));
    }

    #[tokio::test]
    async fn test_unmatched_machine_goes_to_pool() {
        let (ctl, resources, _) = controller().await;
        let placed = ctl.register_machine(machine("lonely")).await.unwrap();
        assert_eq!(placed.keys().collect::<Vec<_>>(), vec![POOL_NS]);
        assert_eq!(resources.get_resource_list(POOL_NS, "machine").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_follows_reports() {
        let (ctl, resources, reports) = controller().await;
        let mut m = machine("db-1");
        m.insert("status".into(), STATUS_ONLINE.into());
        ctl.register_machine(m).await.unwrap();

        assert_eq!(ctl.update_machine_status(at_hours(49)).await.unwrap(), 1);
        let list = resources.get_resource_list("c.loda", "machine").await.unwrap();
        assert_eq!(list[0]["status"], STATUS_DEAD);
        // Nothing left to change.
        assert_eq!(ctl.update_machine_status(at_hours(49)).await.unwrap(), 0);

        reports.agent_report(Report::new("db-1", at_hours(50))).unwrap();
        assert_eq!(ctl.update_machine_status(at_hours(51)).await.unwrap(), 1);
        let list = resources.get_resource_list("c.loda", "machine").await.unwrap();
        assert_eq!(list[0]["status"], STATUS_ONLINE);
    }

    #[tokio::test]
    async fn test_status_pass_keeps_concurrent_registrations() {
        let store = Arc::new(SlowViews::new(RES_MACHINE));
        let (ctl, resources, _) = controller_on(Arc::clone(&store) as Arc<dyn KeyValueStore>).await;
        let ctl = Arc::new(ctl);
        let mut m = machine("db-1");
        m.insert("status".into(), STATUS_ONLINE.into());
        ctl.register_machine(m).await.unwrap();

        store.arm(Duration::from_millis(200));
        let pass = tokio::spawn({
            let ctl = Arc::clone(&ctl);
            async move { ctl.update_machine_status(at_hours(49)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.disarm();
        ctl.register_machine(machine("db-2")).await.unwrap();
        pass.await.unwrap().unwrap();

        let list = resources.get_resource_list("c.loda", "machine").await.unwrap();
        let mut hosts: Vec<&str> = list.iter().map(|r| r["hostname"].as_str()).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["db-1", "db-2"]);
        let db1 = list.iter().find(|r| r["hostname"] == "db-1").unwrap();
        assert_eq!(db1["status"], STATUS_DEAD);
    }
}
