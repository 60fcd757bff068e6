//! Discovery of backup sets and chains in the archive dir and on the target.
//!
//! [`CollectionsStatus`] is rebuilt from scratch from the two listings every
//! time the store may have changed. It groups names into sets, links sets
//! into backup chains and signature files into signature chains, and picks
//! the (signature chain, backup chain) pair the next incremental or restore
//! will build on.

pub mod chain;
pub mod set;

pub use chain::{sort_chains, AddInc, BackupChain, ChainSpan, Location, SignatureChain};
pub use set::{BackupSet, ChangeAction, FileChange, SetKind};

use std::fmt;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::executor::manifest::Manifest;
use crate::naming::{time_to_pretty, FileType, Naming, ParseResults};
use crate::storage::{ArchiveDir, Backend};
use crate::utils::errors::{EngineError, ErrorCode, Result};

#[derive(Debug)]
pub struct CollectionsStatus {
    backend_label: String,
    archive_dir: String,
    /// Sorted by end time
    pub all_backup_chains: Vec<BackupChain>,
    /// Local and remote, sorted by end time with remote first on ties
    pub all_sig_chains: Vec<SignatureChain>,
    /// Indices into `all_sig_chains` and `all_backup_chains`
    matched: Option<(usize, usize)>,
    pub orphaned_backup_sets: Vec<BackupSet>,
    pub incomplete_backup_sets: Vec<BackupSet>,
    pub local_orphaned_sig_names: Vec<String>,
    pub remote_orphaned_sig_names: Vec<String>,
}

impl CollectionsStatus {
    /// List both stores and build the status, loading change lists from
    /// the cached manifests.
    pub fn scan(backend: &dyn Backend, archive: &ArchiveDir, config: &Config) -> Result<Self> {
        let remote = backend.list()?;
        let local = archive.list()?;
        let mut status = Self::build(
            config,
            &backend.label(),
            &archive.root().display().to_string(),
            &remote,
            &local,
        );
        status.load_files_changed(archive);
        Ok(status)
    }

    /// Build from listings alone.
    pub fn build(
        config: &Config,
        backend_label: &str,
        archive_dir: &str,
        remote: &[String],
        local: &[String],
    ) -> Self {
        let naming = Naming::from_config(config);
        let local_parsed: Vec<(&str, ParseResults)> = local
            .iter()
            .filter_map(|name| naming.parse(name).map(|pr| (name.as_str(), pr)))
            .collect();

        // Partial files only exist locally; they go first so that a set
        // started by a partial manifest picks up its remote volumes.
        let partials = local_parsed
            .iter()
            .filter(|(_, pr)| pr.partial)
            .map(|(name, _)| *name);
        let mut sets = group_sets(&naming, partials.chain(remote.iter().map(String::as_str)));

        for set in &mut sets {
            for (name, pr) in &local_parsed {
                set.attach_local(name, pr);
            }
        }

        let (complete, incomplete): (Vec<BackupSet>, Vec<BackupSet>) =
            sets.into_iter().partition(BackupSet::is_complete);
        for set in &incomplete {
            info!("Found incomplete backup set {}", set);
        }

        let (mut all_backup_chains, orphaned) = link_backup_chains(complete);
        sort_chains(&mut all_backup_chains);

        let (mut local_sigs, local_orphans) =
            link_signature_chains(Location::Local, &local_parsed);
        let remote_parsed: Vec<(&str, ParseResults)> = remote
            .iter()
            .filter_map(|name| naming.parse(name).map(|pr| (name.as_str(), pr)))
            .collect();
        let (remote_sigs, remote_orphans) =
            link_signature_chains(Location::Remote, &remote_parsed);
        local_sigs.extend(remote_sigs);
        sort_chains(&mut local_sigs);

        let mut status = Self {
            backend_label: backend_label.to_string(),
            archive_dir: archive_dir.to_string(),
            all_backup_chains,
            all_sig_chains: local_sigs,
            matched: None,
            orphaned_backup_sets: orphaned,
            incomplete_backup_sets: incomplete,
            local_orphaned_sig_names: local_orphans,
            remote_orphaned_sig_names: remote_orphans,
        };
        status.set_matched_chain_pair();
        status.warn();
        status
    }

    /// Pair the latest backup chain with a signature chain ending at the
    /// same time, scanning signature chains newest first. A chain whose last
    /// incremental has no signature is matched on the set before it, and
    /// that incremental is moved to the incomplete list.
    fn set_matched_chain_pair(&mut self) {
        self.matched = None;
        let Some(latest) = self.all_backup_chains.len().checked_sub(1) else {
            return;
        };

        let chain = &self.all_backup_chains[latest];
        let end = chain.end_time;
        let second_to_last = chain
            .incsets
            .len()
            .checked_sub(1)
            .map(|i| if i == 0 { chain.fullset.time() } else { chain.incsets[i - 1].time() });

        for (i, sig_chain) in self.all_sig_chains.iter().enumerate().rev() {
            if sig_chain.end_time == end {
                self.matched = Some((i, latest));
                break;
            }
            if Some(sig_chain.end_time) == second_to_last {
                let full_time = chain.fullset.time();
                if let Some(dropped) = self.all_backup_chains[latest].pop_last_inc() {
                    warn!("No signatures for last set {}, moved to the incomplete sets", dropped);
                    self.incomplete_backup_sets.push(dropped);
                }
                sort_chains(&mut self.all_backup_chains);
                self.matched = self
                    .all_backup_chains
                    .iter()
                    .position(|c| c.fullset.time() == full_time)
                    .map(|b| (i, b));
                break;
            }
        }
    }

    fn warn(&self) {
        if self.all_backup_chains.is_empty() {
            info!("No backup chains found");
        } else if self.matched.is_none() {
            warn!("No backup chains with active signatures found; a full backup is required");
        }
        for name in &self.local_orphaned_sig_names {
            warn!("Found orphaned local signature file {}", name);
        }
        for name in &self.remote_orphaned_sig_names {
            warn!("Found orphaned remote signature file {}", name);
        }
        if !self.orphaned_backup_sets.is_empty() || !self.incomplete_backup_sets.is_empty() {
            warn!(
                "Found {} orphaned and {} incomplete backup sets",
                self.orphaned_backup_sets.len(),
                self.incomplete_backup_sets.len()
            );
        }
    }

    fn load_files_changed(&mut self, archive: &ArchiveDir) {
        let sets = self
            .all_backup_chains
            .iter_mut()
            .flat_map(|c| std::iter::once(&mut c.fullset).chain(c.incsets.iter_mut()));
        for set in sets {
            let Some(name) = &set.local_manifest else {
                continue;
            };
            match archive
                .read(name)
                .map_err(EngineError::from)
                .and_then(|bytes| Manifest::from_bytes(&bytes))
            {
                Ok(manifest) => set.files_changed = manifest.files_changed,
                Err(e) => warn!("Could not read cached manifest {}: {}", name, e),
            }
        }
    }

    pub fn matched_chain_pair(&self) -> Option<(&SignatureChain, &BackupChain)> {
        self.matched
            .map(|(s, b)| (&self.all_sig_chains[s], &self.all_backup_chains[b]))
    }

    /// Backup chains other than the matched one.
    pub fn other_backup_chains(&self) -> Vec<&BackupChain> {
        let matched = self.matched.map(|(_, b)| b);
        self.all_backup_chains
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != matched)
            .map(|(_, c)| c)
            .collect()
    }

    /// The matched chain, or else the newest one.
    pub fn last_backup_chain(&self) -> Option<&BackupChain> {
        match self.matched_chain_pair() {
            Some((_, chain)) => Some(chain),
            None => self.all_backup_chains.last(),
        }
    }

    /// Newest set of the last chain, when a crash left it partial.
    pub fn partial_set(&self) -> Option<&BackupSet> {
        self.last_backup_chain()
            .map(BackupChain::last)
            .filter(|s| s.partial)
    }

    fn chains_by_full_time_desc(&self) -> Vec<&BackupChain> {
        let mut chains: Vec<&BackupChain> = self.all_backup_chains.iter().collect();
        chains.sort_by_key(|c| std::cmp::Reverse(c.fullset.time()));
        chains
    }

    /// The chain whose full backup is `n`th newest (1-based).
    pub fn nth_last_backup_chain(&self, n: usize) -> Option<&BackupChain> {
        n.checked_sub(1)
            .and_then(|i| self.chains_by_full_time_desc().get(i).copied())
    }

    pub fn last_full_backup_time(&self) -> Option<i64> {
        self.nth_last_full_backup_time(1)
    }

    pub fn nth_last_full_backup_time(&self, n: usize) -> Option<i64> {
        self.nth_last_backup_chain(n).map(|c| c.fullset.time())
    }

    /// The chain covering `time`; else the newest one ending before it;
    /// else the oldest chain.
    pub fn backup_chain_at_time(&self, time: i64) -> Result<&BackupChain> {
        if self.all_backup_chains.is_empty() {
            return Err(EngineError::NoChains);
        }
        let covering: Vec<&BackupChain> = self
            .all_backup_chains
            .iter()
            .filter(|c| c.start_time <= time && time <= c.end_time)
            .collect();
        match covering.as_slice() {
            [chain] => return Ok(chain),
            [] => {}
            _ => {
                return Err(EngineError::consistency(
                    ErrorCode::TwoChainsCoverTime,
                    format!(
                        "{} backup chains cover {}",
                        covering.len(),
                        time_to_pretty(time)
                    ),
                ))
            }
        }
        let older = self.all_backup_chains.iter().filter(|c| c.end_time < time).last();
        Ok(older.unwrap_or(&self.all_backup_chains[0]))
    }

    /// The last signature chain covering `time` (local wins ties); else the
    /// newest one ending before it; else the oldest, with a warning.
    pub fn signature_chain_at_time(&self, time: i64) -> Result<&SignatureChain> {
        let Some(oldest) = self.all_sig_chains.first() else {
            return Err(EngineError::NoChains);
        };
        if let Some(chain) = self
            .all_sig_chains
            .iter()
            .filter(|c| c.start_time <= time && time <= c.end_time)
            .last()
        {
            return Ok(chain);
        }
        if let Some(chain) = self.all_sig_chains.iter().filter(|c| c.end_time < time).last() {
            return Ok(chain);
        }
        if time < oldest.start_time {
            warn!(
                "No signature chain for the requested time. Using oldest available chain, starting at time {}.",
                time_to_pretty(oldest.start_time)
            );
        }
        Ok(oldest)
    }

    /// Names of orphaned and incomplete sets and orphaned signatures:
    /// `(local, remote)`.
    pub fn extraneous(&self) -> (Vec<String>, Vec<String>) {
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for set in self
            .orphaned_backup_sets
            .iter()
            .chain(self.incomplete_backup_sets.iter())
        {
            remote.extend(set.remote_filenames());
            local.extend(set.local_files.iter().cloned());
        }
        local.extend(self.local_orphaned_sig_names.iter().cloned());
        remote.extend(self.remote_orphaned_sig_names.iter().cloned());
        local.sort();
        local.dedup();
        remote.sort();
        remote.dedup();
        (local, remote)
    }

    /// Chains ending before `time`, never the matched one.
    pub fn chains_older_than(&self, time: i64) -> Vec<&BackupChain> {
        let matched = self.matched.map(|(_, b)| b);
        self.all_backup_chains
            .iter()
            .enumerate()
            .filter(|(i, c)| c.end_time < time && Some(*i) != matched)
            .map(|(_, c)| c)
            .collect()
    }

    /// Signature chains ending before `time`, never the matched one.
    pub fn sig_chains_older_than(&self, time: i64) -> Vec<&SignatureChain> {
        let matched = self.matched.map(|(s, _)| s);
        self.all_sig_chains
            .iter()
            .enumerate()
            .filter(|(i, c)| c.end_time < time && Some(*i) != matched)
            .map(|(_, c)| c)
            .collect()
    }

    /// Every set of the chains that may be deleted at `time`.
    pub fn sets_older_than(&self, time: i64) -> Vec<&BackupSet> {
        let mut sets: Vec<&BackupSet> = self
            .chains_older_than(time)
            .into_iter()
            .flat_map(|c| c.all_sets())
            .collect();
        sets.sort_by_key(|s| s.time());
        sets
    }

    /// Sets older than `time` that newer sets still depend on: the early
    /// part of any chain that ends at or after `time`.
    pub fn sets_older_than_required(&self, time: i64) -> Vec<&BackupSet> {
        let mut sets: Vec<&BackupSet> = self
            .all_backup_chains
            .iter()
            .filter(|c| c.end_time >= time)
            .flat_map(|c| c.all_sets())
            .filter(|s| s.time() < time)
            .collect();
        sets.sort_by_key(|s| s.time());
        sets
    }

    /// Machine-readable status lines.
    pub fn to_log_info(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for chain in self.other_backup_chains() {
            lines.extend(chain.to_log_info("secondary "));
        }
        if let Some((_, chain)) = self.matched_chain_pair() {
            lines.extend(chain.to_log_info("primary "));
        }
        lines.push(format!(
            "orphaned-sets-num {}",
            self.orphaned_backup_sets.len()
        ));
        lines.push(format!(
            "incomplete-sets-num {}",
            self.incomplete_backup_sets.len()
        ));
        lines
    }
}

impl fmt::Display for CollectionsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Collection Status")?;
        writeln!(f, "-----------------")?;
        writeln!(f, "Connecting with backend: {}", self.backend_label)?;
        writeln!(f, "Archive dir: {}", self.archive_dir)?;
        writeln!(f)?;

        let others = self.other_backup_chains();
        writeln!(f, "Found {} secondary backup chain(s).", others.len())?;
        for (i, chain) in others.iter().enumerate() {
            writeln!(f, "Secondary chain {} of {}:", i + 1, others.len())?;
            writeln!(f, "{}", chain)?;
            writeln!(f)?;
        }
        writeln!(f)?;

        match self.matched_chain_pair() {
            Some((sigs, chain)) => {
                writeln!(f, "Found primary backup chain with matching signature chain:")?;
                writeln!(f, "{}", chain)?;
                writeln!(f, "Signature chain {}", sigs)?;
            }
            None => writeln!(f, "No backup chains with active signatures found")?,
        }

        let orphaned = self.orphaned_backup_sets.len();
        let incomplete = self.incomplete_backup_sets.len();
        if orphaned == 0 && incomplete == 0 {
            write!(f, "No orphaned or incomplete backup sets found.")
        } else {
            writeln!(
                f,
                "Also found {} backup set(s) not part of any chain,",
                orphaned
            )?;
            writeln!(f, "and {} incomplete backup set(s).", incomplete)?;
            write!(f, "These may be deleted by running the \"cleanup\" command.")
        }
    }
}

/// Group archive names into sets. Names no set accepts are dropped.
fn group_sets<'a>(naming: &Naming, names: impl Iterator<Item = &'a str>) -> Vec<BackupSet> {
    let mut sets: Vec<BackupSet> = Vec::new();
    'names: for name in names {
        let Some(pr) = naming.parse(name) else {
            debug!("Ignoring non-backup file '{}'", name);
            continue;
        };
        if pr.file_type.archive_kind().is_none() {
            continue;
        }
        for set in sets.iter_mut() {
            match set.add_filename(name, &pr) {
                Ok(true) => continue 'names,
                Ok(false) => {}
                Err(e) => {
                    warn!("Dropping '{}': {}", name, e);
                    continue 'names;
                }
            }
        }
        match BackupSet::from_parse(&pr) {
            Some(mut set) => match set.add_filename(name, &pr) {
                Ok(true) => sets.push(set),
                Ok(false) => debug!("Ignoring file (rejected by backup set) '{}'", name),
                Err(e) => warn!("Dropping '{}': {}", name, e),
            },
            None => debug!("Ignoring file (rejected by backup set) '{}'", name),
        }
    }
    sets
}

/// Link complete sets into chains. Returns the chains and the orphaned sets.
fn link_backup_chains(mut sets: Vec<BackupSet>) -> (Vec<BackupChain>, Vec<BackupSet>) {
    sets.sort_by_key(|s| (s.kind.start_time(), !s.kind.is_full()));

    let mut chains: Vec<BackupChain> = Vec::new();
    let mut orphaned = Vec::new();
    'sets: for set in sets {
        if set.kind.is_full() {
            chains.push(BackupChain::new(set));
            continue;
        }
        let mut set = set;
        for chain in chains.iter_mut() {
            match chain.add_inc(set) {
                AddInc::Appended => continue 'sets,
                AddInc::Replaced(old) => {
                    warn!("Discarding superseded incremental set {}", old);
                    orphaned.push(old);
                    continue 'sets;
                }
                AddInc::Rejected(back) => set = back,
            }
        }
        info!("Found orphaned backup set {}", set);
        orphaned.push(set);
    }
    (chains, orphaned)
}

/// Link signature names from one location. Returns the chains and the
/// names that fit none.
fn link_signature_chains(
    location: Location,
    parsed: &[(&str, ParseResults)],
) -> (Vec<SignatureChain>, Vec<String>) {
    let mut chains: Vec<SignatureChain> = parsed
        .iter()
        .filter_map(|(name, pr)| SignatureChain::from_full(location, name, pr))
        .collect();

    let mut new_sigs: Vec<&(&str, ParseResults)> = parsed
        .iter()
        .filter(|(_, pr)| pr.file_type == FileType::NewSig)
        .collect();
    new_sigs.sort_by_key(|(_, pr)| pr.start_time);

    let mut orphaned = Vec::new();
    for (name, pr) in new_sigs {
        if !chains.iter_mut().any(|c| c.add_filename(name, pr)) {
            orphaned.push(name.to_string());
        }
    }
    (chains, orphaned)
}
