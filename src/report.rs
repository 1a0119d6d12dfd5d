//! Agent report journal.
//!
//! Agents report their hostname periodically. The journal keeps the latest
//! report per hostname in memory, snapshots it into the `report` bucket on a
//! timer, and is rehydrated from that snapshot on startup. The machine status
//! loop reads it to decide which hosts are alive.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::REPORT_BUCKET;
use crate::constants::REPORT_KEY;
use crate::error::RegistryError;
use crate::error::Result;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Previous hostname when the host was renamed, empty otherwise.
    #[serde(rename = "OldHostname", default)]
    pub old_hostname: String,
    #[serde(rename = "NewHostname")]
    pub new_hostname: String,
    #[serde(rename = "UpdateTime")]
    pub update_time: DateTime<Utc>,
}

impl Report {
    pub fn new(hostname: impl Into<String>, update_time: DateTime<Utc>) -> Self {
        Self {
            old_hostname: String::new(),
            new_hostname: hostname.into(),
            update_time,
        }
    }

    pub fn renamed(&self) -> bool {
        !self.old_hostname.is_empty() && self.old_hostname != self.new_hostname
    }
}

pub struct ReportJournal {
    store: Arc<dyn KeyValueStore>,
    reports: RwLock<HashMap<String, Report>>,
}

impl ReportJournal {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            reports: RwLock::new(HashMap::new()),
        }
    }

    /// Records a report. A rename drops the entry of the old hostname.
    pub fn agent_report(&self, report: Report) -> Result<()> {
        if report.new_hostname.is_empty() {
            return Err(RegistryError::invalid_param("report without hostname"));
        }
        let mut reports = self.reports.write();
        if report.renamed() {
            reports.remove(&report.old_hostname);
            info!(old = %report.old_hostname, new = %report.new_hostname, "host renamed");
        }
        reports.insert(report.new_hostname.clone(), report);
        Ok(())
    }

    pub fn get_report(&self, hostname: &str) -> Option<Report> {
        self.reports.read().get(hostname).cloned()
    }

    pub fn reports(&self) -> BTreeMap<String, Report> {
        self.reports
            .read()
            .iter()
            .map(|(host, report)| (host.clone(), report.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.read().is_empty()
    }

    /// Writes the journal into the report bucket.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.reports();
        let blob = serde_json::to_vec(&snapshot)
            .map_err(|e| RegistryError::storage(format!("failed to encode report journal: {e}")))?;
        self.store.create_bucket_if_not_exist(REPORT_BUCKET.as_bytes()).await?;
        self.store
            .update(REPORT_BUCKET.as_bytes(), REPORT_KEY.as_bytes(), &blob)
            .await?;
        debug!(count = snapshot.len(), "persisted report journal");
        Ok(())
    }

    /// Replaces the in-memory journal with the persisted one. Returns how
    /// many reports were loaded; a missing snapshot loads nothing.
    pub async fn load(&self) -> Result<usize> {
        let blob = match self.store.view(REPORT_BUCKET.as_bytes(), REPORT_KEY.as_bytes()).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return Ok(0),
            Err(err) if err.is_not_found() => return Ok(0),
            Err(err) => return Err(err),
        };
        let loaded: HashMap<String, Report> = serde_json::from_slice(&blob)
            .map_err(|e| RegistryError::invalid_format(format!("report journal: {e}")))?;
        let count = loaded.len();
        *self.reports.write() = loaded;
        info!(count, "loaded report journal");
        Ok(count)
    }
}

/// Persists `journal` every `every` until cancelled.
pub async fn run_persist_loop(journal: Arc<ReportJournal>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; nothing has been reported yet.
    ticker.tick().await;

    info!(interval_secs = every.as_secs(), "report persistence started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("report persistence shutting down");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = journal.persist().await {
                    warn!(error = %err, "failed to persist report journal");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::store::MemoryStore;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_rejects_empty_hostname() {
        let journal = ReportJournal::new(Arc::new(MemoryStore::new()));
        assert!(journal.agent_report(Report::new("", at(0))).is_err());
        assert!(journal.is_empty());
    }

    #[test]
    fn test_rename_replaces_old_entry() {
        let journal = ReportJournal::new(Arc::new(MemoryStore::new()));
        journal.agent_report(Report::new("old-host", at(10))).unwrap();
        journal
            .agent_report(Report {
                old_hostname: "old-host".into(),
                new_hostname: "new-host".into(),
                update_time: at(20),
            })
            .unwrap();
        assert!(journal.get_report("old-host").is_none());
        assert_eq!(journal.get_report("new-host").unwrap().update_time, at(20));
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_latest_report_wins() {
        let journal = ReportJournal::new(Arc::new(MemoryStore::new()));
        journal.agent_report(Report::new("h", at(1))).unwrap();
        journal.agent_report(Report::new("h", at(2))).unwrap();
        assert_eq!(journal.reports()["h"].update_time, at(2));
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let journal = ReportJournal::new(Arc::clone(&store));
        assert_eq!(journal.load().await.unwrap(), 0);
        journal.agent_report(Report::new("a", at(100))).unwrap();
        journal.agent_report(Report::new("b", at(200))).unwrap();
        journal.persist().await.unwrap();

        let restarted = ReportJournal::new(store);
        assert_eq!(restarted.load().await.unwrap(), 2);
        assert_eq!(restarted.reports(), journal.reports());
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(Report::new("h", at(0))).unwrap();
        assert_eq!(json["NewHostname"], "h");
        assert_eq!(json["OldHostname"], "");
        assert!(json["UpdateTime"].is_string());
    }
}
