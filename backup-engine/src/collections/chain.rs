//! Backup and signature chains.

use std::fmt;
use tracing::info;

use super::set::BackupSet;
use crate::naming::{time_to_pretty, time_to_string, FileType, ParseResults};

/// Where a signature chain lives. A chain is never split across both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Local,
    Remote,
}

/// Common view used to order chains.
pub trait ChainSpan {
    fn start_time(&self) -> i64;
    fn end_time(&self) -> i64;
    fn is_local(&self) -> bool {
        false
    }
}

/// Sort by end time; on a tie remote chains come first and local ones last.
pub fn sort_chains<C: ChainSpan>(chains: &mut [C]) {
    chains.sort_by_key(|c| (c.end_time(), c.is_local()));
}

/// Outcome of offering an incremental set to a chain.
#[derive(Debug)]
pub enum AddInc {
    Appended,
    /// The new set superseded the previous last incremental, returned here.
    Replaced(BackupSet),
    Rejected(BackupSet),
}

/// A full set followed by contiguous incrementals.
#[derive(Debug, Clone)]
pub struct BackupChain {
    pub fullset: BackupSet,
    pub incsets: Vec<BackupSet>,
    pub start_time: i64,
    pub end_time: i64,
}

impl BackupChain {
    pub fn new(fullset: BackupSet) -> Self {
        let time = fullset.kind.start_time();
        Self {
            fullset,
            incsets: Vec::new(),
            start_time: time,
            end_time: time,
        }
    }

    /// Extend the chain with `incset` if its start meets the chain's end.
    ///
    /// Two incrementals starting at the same time: the one ending later wins.
    pub fn add_inc(&mut self, incset: BackupSet) -> AddInc {
        let start = incset.kind.start_time();
        let end = incset.kind.end_time();

        let outcome = if self.end_time == start {
            self.incsets.push(incset);
            AddInc::Appended
        } else {
            match self.incsets.last_mut() {
                Some(last) if start == last.kind.start_time() && end > last.kind.end_time() => {
                    let old = std::mem::replace(last, incset);
                    info!(
                        "Preferring incremental set ending {} over the one ending {}",
                        time_to_pretty(end),
                        time_to_pretty(old.time())
                    );
                    AddInc::Replaced(old)
                }
                _ => {
                    info!(
                        "Ignoring incremental set (start_time: {}; needed: {})",
                        time_to_pretty(start),
                        time_to_pretty(self.end_time)
                    );
                    return AddInc::Rejected(incset);
                }
            }
        };

        self.end_time = end;
        info!(
            "Added incremental set (start_time: {} / end_time: {})",
            time_to_pretty(start),
            time_to_pretty(end)
        );
        outcome
    }

    /// Drop the last incremental, pulling the chain end back.
    pub fn pop_last_inc(&mut self) -> Option<BackupSet> {
        let set = self.incsets.pop()?;
        self.end_time = self.last().time();
        Some(set)
    }

    /// The full set plus every incremental ending at or before `time`.
    pub fn sets_at_time(&self, time: i64) -> Vec<&BackupSet> {
        let mut sets = vec![&self.fullset];
        sets.extend(self.incsets.iter().filter(|s| s.kind.end_time() <= time));
        sets
    }

    pub fn last(&self) -> &BackupSet {
        self.incsets.last().unwrap_or(&self.fullset)
    }

    pub fn all_sets(&self) -> Vec<&BackupSet> {
        let mut sets = Vec::with_capacity(self.incsets.len() + 1);
        sets.push(&self.fullset);
        sets.extend(self.incsets.iter());
        sets
    }

    pub fn set_count(&self) -> usize {
        self.incsets.len() + 1
    }

    pub fn num_volumes(&self) -> usize {
        self.all_sets().iter().map(|s| s.len()).sum()
    }

    pub fn short_desc(&self) -> String {
        format!(
            "[{}]-[{}]",
            time_to_pretty(self.start_time),
            time_to_pretty(self.end_time)
        )
    }

    /// Machine-readable summary lines.
    pub fn to_log_info(&self, prefix: &str) -> Vec<String> {
        self.all_sets()
            .iter()
            .map(|s| {
                format!(
                    "{}{} {} {} {}",
                    prefix,
                    s.kind.label(),
                    time_to_string(s.time()),
                    s.len(),
                    if s.encrypted { "enc" } else { "noenc" }
                )
            })
            .collect()
    }
}

impl ChainSpan for BackupChain {
    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> i64 {
        self.end_time
    }
}

impl fmt::Display for BackupChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-------------------------")?;
        writeln!(f, "Chain start time: {}", time_to_pretty(self.start_time))?;
        writeln!(f, "Chain end time: {}", time_to_pretty(self.end_time))?;
        writeln!(f, "Number of contained backup sets: {}", self.set_count())?;
        writeln!(f, "Total number of contained volumes: {}", self.num_volumes())?;
        writeln!(
            f,
            "{:>20}   {:>30}   {:>15}",
            "Type of backup set:", "Time:", "Num volumes:"
        )?;
        for set in self.all_sets() {
            let label = if set.kind.is_full() {
                "Full"
            } else {
                "Incremental"
            };
            writeln!(
                f,
                "{:>20}   {:>30}   {:>15}",
                label,
                time_to_pretty(set.time()),
                set.len()
            )?;
        }
        write!(f, "-------------------------")
    }
}

#[derive(Debug, Clone)]
pub struct SigFile {
    pub name: String,
    pub start_time: i64,
    pub end_time: i64,
}

/// A full signature followed by contiguous new-signature files.
#[derive(Debug, Clone)]
pub struct SignatureChain {
    pub location: Location,
    pub fullsig: String,
    pub incs: Vec<SigFile>,
    pub start_time: i64,
    pub end_time: i64,
}

impl SignatureChain {
    /// Start a chain from a full signature name.
    pub fn from_full(location: Location, filename: &str, pr: &ParseResults) -> Option<Self> {
        if pr.file_type != FileType::FullSig {
            return None;
        }
        let time = pr.time?;
        Some(Self {
            location,
            fullsig: filename.to_string(),
            incs: Vec::new(),
            start_time: time,
            end_time: time,
        })
    }

    /// Append a new-signature name if it continues this chain.
    pub fn add_filename(&mut self, filename: &str, pr: &ParseResults) -> bool {
        if pr.file_type != FileType::NewSig {
            return false;
        }
        let (Some(start), Some(end)) = (pr.start_time, pr.end_time) else {
            return false;
        };
        if start != self.end_time {
            return false;
        }
        self.incs.push(SigFile {
            name: filename.to_string(),
            start_time: start,
            end_time: end,
        });
        self.end_time = end;
        true
    }

    pub fn is_local(&self) -> bool {
        self.location == Location::Local
    }

    /// Ordered signature names, optionally only those ending by `time`.
    pub fn filenames(&self, time: Option<i64>) -> Vec<String> {
        let mut names = vec![self.fullsig.clone()];
        names.extend(
            self.incs
                .iter()
                .filter(|s| time.map_or(true, |t| s.end_time <= t))
                .map(|s| s.name.clone()),
        );
        names
    }
}

impl ChainSpan for SignatureChain {
    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> i64 {
        self.end_time
    }

    fn is_local(&self) -> bool {
        SignatureChain::is_local(self)
    }
}

impl fmt::Display for SignatureChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let place = if self.is_local() { "local" } else { "remote" };
        write!(f, "{}: [{}]", place, self.filenames(None).join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::set::SetKind;
    use crate::naming::{Component, Encoding, Naming};

    const T0: i64 = 1_700_000_000;
    const T1: i64 = T0 + 3600;
    const T2: i64 = T0 + 7200;
    const T3: i64 = T0 + 10800;

    fn set(kind: SetKind) -> BackupSet {
        let naming = Naming::new("", false);
        let name = naming.get(&kind, Component::Manifest, false, Encoding::Plain);
        let pr = naming.parse(&name).unwrap();
        let mut s = BackupSet::from_parse(&pr).unwrap();
        s.add_filename(&name, &pr).unwrap();
        s
    }

    fn inc(start_time: i64, end_time: i64) -> BackupSet {
        set(SetKind::Incremental {
            start_time,
            end_time,
        })
    }

    #[test]
    fn test_continuity() {
        let mut chain = BackupChain::new(set(SetKind::Full { time: T0 }));
        assert!(matches!(chain.add_inc(inc(T0, T1)), AddInc::Appended));
        assert!(matches!(chain.add_inc(inc(T2, T3)), AddInc::Rejected(_)));
        assert!(matches!(chain.add_inc(inc(T1, T2)), AddInc::Appended));

        assert_eq!(chain.start_time, T0);
        assert_eq!(chain.end_time, T2);
        for pair in chain.all_sets().windows(2) {
            assert_eq!(pair[1].kind.start_time(), pair[0].kind.end_time());
        }
    }

    #[test]
    fn test_prefers_newer_end_time() {
        let mut chain = BackupChain::new(set(SetKind::Full { time: T0 }));
        chain.add_inc(inc(T0, T1));
        match chain.add_inc(inc(T0, T2)) {
            AddInc::Replaced(old) => assert_eq!(old.time(), T1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(chain.end_time, T2);
        assert_eq!(chain.set_count(), 2);

        // older end time loses
        assert!(matches!(chain.add_inc(inc(T0, T1)), AddInc::Rejected(_)));
    }

    #[test]
    fn test_pop_last_inc_moves_end_back() {
        let mut chain = BackupChain::new(set(SetKind::Full { time: T0 }));
        chain.add_inc(inc(T0, T1));
        chain.add_inc(inc(T1, T2));
        let dropped = chain.pop_last_inc().unwrap();
        assert_eq!(dropped.time(), T2);
        assert_eq!(chain.end_time, T1);
        chain.pop_last_inc();
        assert_eq!(chain.end_time, T0);
        assert!(chain.pop_last_inc().is_none());
    }

    #[test]
    fn test_sets_at_time() {
        let mut chain = BackupChain::new(set(SetKind::Full { time: T0 }));
        chain.add_inc(inc(T0, T1));
        chain.add_inc(inc(T1, T2));
        assert_eq!(chain.sets_at_time(T1 + 1).len(), 2);
        assert_eq!(chain.sets_at_time(T2).len(), 3);
    }

    #[test]
    fn test_signature_chain_and_sorting() {
        let naming = Naming::new("", false);
        let full = naming.get(&SetKind::Full { time: T0 }, Component::Signature, false, Encoding::Plain);
        let new = naming.get(
            &SetKind::Incremental {
                start_time: T0,
                end_time: T1,
            },
            Component::Signature,
            false,
            Encoding::Plain,
        );

        let mut local = SignatureChain::from_full(Location::Local, &full, &naming.parse(&full).unwrap()).unwrap();
        let mut remote = SignatureChain::from_full(Location::Remote, &full, &naming.parse(&full).unwrap()).unwrap();
        assert!(local.add_filename(&new, &naming.parse(&new).unwrap()));
        assert!(remote.add_filename(&new, &naming.parse(&new).unwrap()));
        assert!(!remote.add_filename(&new, &naming.parse(&new).unwrap()));

        let mut chains = vec![local, remote];
        sort_chains(&mut chains);
        assert!(!chains[0].is_local());
        assert!(chains[1].is_local());
        assert_eq!(chains[1].filenames(Some(T0)), vec![full]);
    }
}
