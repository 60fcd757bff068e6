//! Retention and cleanup of the backup store.
//!
//! Every operation first works out which names would go and only deletes
//! when `force` is set. The chain the next incremental builds on is never
//! touched, and sets that newer sets still depend on are reported instead
//! of deleted.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collections::{BackupSet, CollectionsStatus};
use crate::config::Config;
use crate::executor::upload::run_blocking;
use crate::naming::time_to_pretty;
use crate::storage::{ArchiveDir, ArchiveLock, Backend};
use crate::utils::errors::Result;

/// What an operation removed, or would remove.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub remote: Vec<String>,
    pub local: Vec<String>,
    /// Sets past the cutoff that are kept because later sets need them
    pub retained: Vec<String>,
    /// False for a dry run
    pub deleted: bool,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        self.remote.is_empty() && self.local.is_empty()
    }

    fn add_set(&mut self, set: &BackupSet) {
        self.remote.extend(set.remote_filenames());
        self.local.extend(set.local_files.iter().cloned());
    }
}

#[derive(Clone)]
pub struct Maintenance {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    archive: ArchiveDir,
}

impl Maintenance {
    pub fn new(config: Arc<Config>, backend: Arc<dyn Backend>) -> Result<Self> {
        let archive = ArchiveDir::open(&config.archive.archive_dir)?;
        Ok(Self {
            config,
            backend,
            archive,
        })
    }

    /// Current collection status, for the textual report.
    pub async fn status(&self) -> Result<CollectionsStatus> {
        let this = self.clone();
        let status = run_blocking(move || this.scan()).await?;
        for line in status.to_log_info() {
            debug!("{}", line);
        }
        Ok(status)
    }

    /// Remove orphaned and incomplete sets and orphaned signatures.
    pub async fn cleanup(&self, force: bool) -> Result<MaintenanceReport> {
        self.run(force, |status| {
            let (local, remote) = status.extraneous();
            MaintenanceReport {
                remote,
                local,
                ..Default::default()
            }
        })
        .await
    }

    /// Remove every chain that ended before `time`.
    pub async fn remove_older_than(&self, time: i64, force: bool) -> Result<MaintenanceReport> {
        self.run(force, move |status| plan_older_than(status, time, false))
            .await
    }

    /// Keep the newest `n` chains and remove the rest.
    pub async fn remove_all_but_n_full(&self, n: usize, force: bool) -> Result<MaintenanceReport> {
        self.run(force, move |status| match status.nth_last_full_backup_time(n) {
            Some(time) => plan_older_than(status, time, false),
            None => {
                info!("Fewer than {} full backups, nothing to remove", n);
                MaintenanceReport::default()
            }
        })
        .await
    }

    /// Remove the incrementals of every chain but the newest `n`, keeping
    /// their full sets.
    pub async fn remove_all_inc_of_but_n_full(
        &self,
        n: usize,
        force: bool,
    ) -> Result<MaintenanceReport> {
        self.run(force, move |status| match status.nth_last_full_backup_time(n) {
            Some(time) => plan_older_than(status, time, true),
            None => {
                info!("Fewer than {} full backups, nothing to remove", n);
                MaintenanceReport::default()
            }
        })
        .await
    }

    fn scan(&self) -> Result<CollectionsStatus> {
        CollectionsStatus::scan(self.backend.as_ref(), &self.archive, &self.config)
    }

    async fn run<F>(&self, force: bool, plan: F) -> Result<MaintenanceReport>
    where
        F: FnOnce(&CollectionsStatus) -> MaintenanceReport + Send + 'static,
    {
        let this = self.clone();
        run_blocking(move || {
            let _lock = ArchiveLock::acquire(this.archive.root())?;
            let status = this.scan()?;
            let mut report = plan(&status);
            for name in &report.retained {
                warn!("Keeping {}: later sets depend on it", name);
            }
            if report.is_empty() {
                info!("No old backup sets found, nothing deleted");
                return Ok(report);
            }
            if !force {
                for name in report.remote.iter().chain(report.local.iter()) {
                    info!("Would delete {}", name);
                }
                info!("Run again with force to actually delete");
                return Ok(report);
            }
            this.delete(&report)?;
            report.deleted = true;
            Ok(report)
        })
        .await
    }

    fn delete(&self, report: &MaintenanceReport) -> Result<()> {
        if !report.remote.is_empty() {
            for name in &report.remote {
                info!("Deleting {}", name);
            }
            self.backend.delete(&report.remote)?;
        }
        for name in &report.local {
            self.archive.delete(name)?;
        }
        info!(
            "Deleted {} remote and {} local files",
            report.remote.len(),
            report.local.len()
        );
        Ok(())
    }
}

/// Names to remove for a cutoff at `time`. Newest sets come first so an
/// interrupted deletion never leaves a chain without its full set.
fn plan_older_than(status: &CollectionsStatus, time: i64, incs_only: bool) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();
    let chains = status.chains_older_than(time);
    for chain in chains.iter().rev() {
        for set in chain.incsets.iter().rev() {
            report.add_set(set);
        }
        if !incs_only {
            report.add_set(&chain.fullset);
        }
    }

    if !incs_only {
        for sig_chain in status.sig_chains_older_than(time) {
            let names = sig_chain.filenames(None);
            if sig_chain.is_local() {
                report.local.extend(names);
            } else {
                report.remote.extend(names);
            }
        }
    }

    report.retained = status
        .sets_older_than_required(time)
        .into_iter()
        .map(|set| format!("{} set at {}", set.kind.label(), time_to_pretty(set.time())))
        .collect();

    report.local.sort();
    report.local.dedup();
    report
}
