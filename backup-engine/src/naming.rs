//! Backup filename encoding and parsing.
//!
//! Every object the engine writes carries its role in its name: the kind of
//! set, its time or time interval, the volume number, a partial marker and an
//! encoding suffix. The collections layer only ever sees [`ParseResults`].

use chrono::{DateTime, NaiveDateTime};

use crate::collections::set::SetKind;
use crate::config::Config;
use crate::utils::errors::{EngineError, Result};

const TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// The role a file plays in a backup set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Full,
    Inc,
    FullSig,
    NewSig,
    FullStat,
    IncStat,
}

impl FileType {
    fn is_interval(self) -> bool {
        matches!(self, FileType::Inc | FileType::NewSig | FileType::IncStat)
    }

    /// Full and incremental archive sets, ignoring the stat flavour.
    pub fn archive_kind(self) -> Option<FileType> {
        match self {
            FileType::Full | FileType::FullStat => Some(FileType::Full),
            FileType::Inc | FileType::IncStat => Some(FileType::Inc),
            _ => None,
        }
    }

    pub fn is_signature(self) -> bool {
        matches!(self, FileType::FullSig | FileType::NewSig)
    }

    pub fn is_stat(self) -> bool {
        matches!(self, FileType::FullStat | FileType::IncStat)
    }

    fn long_tag(self) -> &'static str {
        match self {
            FileType::Full => "backup-full",
            FileType::Inc => "backup-inc",
            FileType::FullSig => "backup-full-signatures",
            FileType::NewSig => "backup-new-signatures",
            FileType::FullStat => "backup-full-stat",
            FileType::IncStat => "backup-inc-stat",
        }
    }

    fn short_tag(self) -> &'static str {
        match self {
            FileType::Full => "df",
            FileType::Inc => "di",
            FileType::FullSig => "dfs",
            FileType::NewSig => "dns",
            FileType::FullStat => "dfj",
            FileType::IncStat => "dij",
        }
    }

    fn from_tag(tag: &str) -> Option<(FileType, bool)> {
        const ALL: [FileType; 6] = [
            FileType::Full,
            FileType::Inc,
            FileType::FullSig,
            FileType::NewSig,
            FileType::FullStat,
            FileType::IncStat,
        ];
        ALL.iter().find_map(|t| {
            if t.long_tag() == tag {
                Some((*t, false))
            } else if t.short_tag() == tag {
                Some((*t, true))
            } else {
                None
            }
        })
    }
}

/// Which object of a set a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Volume(u32),
    Manifest,
    Signature,
    Stat,
}

/// Transform applied to the stored bytes, reflected in the name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Compressed,
    Encrypted,
}

/// Information taken from a backup filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResults {
    pub file_type: FileType,
    pub time: Option<i64>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub volume_number: Option<u32>,
    pub manifest: bool,
    pub partial: bool,
    pub encrypted: bool,
    pub compressed: bool,
}

impl ParseResults {
    /// The set interval this name belongs to.
    pub fn set_kind(&self) -> Option<SetKind> {
        match (self.time, self.start_time, self.end_time) {
            (Some(time), _, _) => Some(SetKind::Full { time }),
            (None, Some(start_time), Some(end_time)) => Some(SetKind::Incremental {
                start_time,
                end_time,
            }),
            _ => None,
        }
    }

    /// Time the name refers to: full time or interval end.
    pub fn end(&self) -> i64 {
        self.time.or(self.end_time).unwrap_or(0)
    }
}

/// Generates and parses names under one prefix and one length style.
#[derive(Debug, Clone)]
pub struct Naming {
    prefix: String,
    short: bool,
}

impl Naming {
    pub fn new(prefix: impl Into<String>, short: bool) -> Self {
        Self {
            prefix: prefix.into(),
            short,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.archive.file_prefix.clone(),
            config.archive.short_filenames,
        )
    }

    pub fn short_filenames(&self) -> bool {
        self.short
    }

    /// Name of `component` of the set `kind`.
    pub fn get(
        &self,
        kind: &SetKind,
        component: Component,
        partial: bool,
        encoding: Encoding,
    ) -> String {
        let file_type = match (component, kind) {
            (Component::Signature, SetKind::Full { .. }) => FileType::FullSig,
            (Component::Signature, SetKind::Incremental { .. }) => FileType::NewSig,
            (Component::Stat, SetKind::Full { .. }) => FileType::FullStat,
            (Component::Stat, SetKind::Incremental { .. }) => FileType::IncStat,
            (_, SetKind::Full { .. }) => FileType::Full,
            (_, SetKind::Incremental { .. }) => FileType::Inc,
        };

        let mut name = self.prefix.clone();
        if self.short {
            name.push_str(file_type.short_tag());
        } else {
            name.push_str(file_type.long_tag());
        }

        match *kind {
            SetKind::Full { time } => {
                name.push('.');
                name.push_str(&self.time_str(time));
            }
            SetKind::Incremental {
                start_time,
                end_time,
            } => {
                name.push('.');
                name.push_str(&self.time_str(start_time));
                if !self.short {
                    name.push_str(".to");
                }
                name.push('.');
                name.push_str(&self.time_str(end_time));
            }
        }

        let body = match (component, self.short) {
            (Component::Volume(n), false) => format!(".vol{}.difftar", n),
            (Component::Volume(n), true) => format!(".{}.dt", to_base36(u64::from(n))),
            (Component::Manifest, false) => ".manifest".to_string(),
            (Component::Manifest, true) => ".m".to_string(),
            (Component::Signature, false) => ".sigtar".to_string(),
            (Component::Signature, true) => ".st".to_string(),
            (Component::Stat, false) => ".jsonstat".to_string(),
            (Component::Stat, true) => ".js".to_string(),
        };
        name.push_str(&body);

        if partial {
            name.push_str(if self.short { ".p" } else { ".part" });
        }

        name.push_str(match (encoding, self.short) {
            (Encoding::Plain, _) => "",
            (Encoding::Compressed, false) => ".zst",
            (Encoding::Compressed, true) => ".z",
            (Encoding::Encrypted, false) => ".gpg",
            (Encoding::Encrypted, true) => ".g",
        });
        name
    }

    fn time_str(&self, t: i64) -> String {
        if self.short {
            to_base36(t.max(0) as u64)
        } else {
            time_to_string(t)
        }
    }

    /// Parse a backup filename. Returns `None` for anything that is not ours.
    ///
    /// Both long and short forms are recognised regardless of the style this
    /// `Naming` generates.
    pub fn parse(&self, filename: &str) -> Option<ParseResults> {
        let rest = filename.strip_prefix(self.prefix.as_str())?;
        let mut tokens: Vec<&str> = rest.split('.').collect();
        let (file_type, short) = FileType::from_tag(tokens.first()?)?;

        let mut encrypted = false;
        let mut compressed = false;
        match (tokens.last().copied(), short) {
            (Some("gpg"), false) | (Some("g"), true) => {
                encrypted = true;
                tokens.pop();
            }
            (Some("zst"), false) | (Some("z"), true) => {
                compressed = true;
                tokens.pop();
            }
            _ => {}
        }

        let mut partial = false;
        if tokens.last().copied() == Some(if short { "p" } else { "part" }) {
            partial = true;
            tokens.pop();
        }

        let mut pos = 1;
        let mut next = || {
            let t = tokens.get(pos).copied();
            pos += 1;
            t
        };

        let parse_time = |s: &str| -> Option<i64> {
            let t = if short {
                from_base36(s).and_then(|v| i64::try_from(v).ok())
            } else {
                string_to_time(s)
            };
            t.filter(|t| *t > 0)
        };

        let (time, start_time, end_time) = if file_type.is_interval() {
            let start = parse_time(next()?)?;
            if !short && next()? != "to" {
                return None;
            }
            let end = parse_time(next()?)?;
            (None, Some(start), Some(end))
        } else {
            (Some(parse_time(next()?)?), None, None)
        };

        let mut volume_number = None;
        let mut manifest = false;
        match file_type {
            FileType::Full | FileType::Inc => {
                let tok = next()?;
                if short {
                    if tok == "m" {
                        manifest = true;
                    } else {
                        let n = from_base36(tok)?;
                        if next()? != "dt" {
                            return None;
                        }
                        volume_number = Some(u32::try_from(n).ok()?);
                    }
                } else if tok == "manifest" {
                    manifest = true;
                } else {
                    let n = tok.strip_prefix("vol")?.parse::<u32>().ok()?;
                    if next()? != "difftar" {
                        return None;
                    }
                    volume_number = Some(n);
                }
            }
            FileType::FullSig | FileType::NewSig => {
                if next()? != if short { "st" } else { "sigtar" } {
                    return None;
                }
            }
            FileType::FullStat | FileType::IncStat => {
                if next()? != if short { "js" } else { "jsonstat" } {
                    return None;
                }
            }
        }

        if next().is_some() {
            return None;
        }
        if volume_number == Some(0) {
            return None;
        }

        Some(ParseResults {
            file_type,
            time,
            start_time,
            end_time,
            volume_number,
            manifest,
            partial,
            encrypted,
            compressed,
        })
    }
}

pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

pub fn from_base36(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    s.chars().try_fold(0u64, |acc, c| {
        let digit = c.to_digit(36)?;
        if c.is_ascii_uppercase() {
            return None;
        }
        acc.checked_mul(36)?.checked_add(u64::from(digit))
    })
}

/// Render unix seconds as `YYYYMMDDTHHMMSSZ`.
pub fn time_to_string(t: i64) -> String {
    DateTime::from_timestamp(t, 0)
        .map(|dt| dt.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| t.to_string())
}

pub fn string_to_time(s: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(&s.to_ascii_uppercase(), TIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Human-readable form for logs and reports.
pub fn time_to_pretty(t: i64) -> String {
    DateTime::from_timestamp(t, 0)
        .map(|dt| dt.format("%a %b %e %H:%M:%S %Y").to_string())
        .unwrap_or_else(|| t.to_string())
}

/// Parse a time given on the command line: `now`, a backup time string,
/// RFC 3339, unix seconds, or an interval before `now` such as `3D` or
/// `1W2h` (units s, m, h, D, W, M, Y).
pub fn parse_time_spec(s: &str, now: i64) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(EngineError::Config("empty time".into()));
    }
    if s == "now" {
        return Ok(now);
    }
    if let Some(t) = string_to_time(s) {
        return Ok(t);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }
    if let Ok(t) = s.parse::<i64>() {
        return Ok(t);
    }
    let secs = parse_interval(s)?;
    now.checked_sub(secs)
        .ok_or_else(|| EngineError::Config(format!("interval out of range: {}", s)))
}

fn parse_interval(s: &str) -> Result<i64> {
    let bad = || EngineError::Config(format!("cannot parse time: {}", s));
    let overflow = || EngineError::Config(format!("interval out of range: {}", s));
    let mut total = 0i64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits.parse().map_err(|_| {
            if digits.is_empty() {
                bad()
            } else {
                overflow()
            }
        })?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'D' => 86_400,
            'W' => 7 * 86_400,
            'M' => 30 * 86_400,
            'Y' => 365 * 86_400,
            _ => return Err(bad()),
        };
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(overflow)?;
    }
    if !digits.is_empty() {
        return Err(bad());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000;
    const T1: i64 = 1_700_086_400;

    #[test]
    fn test_long_volume_name() {
        let naming = Naming::new("", false);
        let name = naming.get(
            &SetKind::Full { time: T0 },
            Component::Volume(3),
            false,
            Encoding::Encrypted,
        );
        assert_eq!(name, "backup-full.20231114T221320Z.vol3.difftar.gpg");

        let pr = naming.parse(&name).unwrap();
        assert_eq!(pr.file_type, FileType::Full);
        assert_eq!(pr.time, Some(T0));
        assert_eq!(pr.volume_number, Some(3));
        assert!(pr.encrypted);
        assert!(!pr.compressed);
        assert!(!pr.partial);
    }

    #[test]
    fn test_inc_manifest_partial() {
        let naming = Naming::new("host1-", false);
        let kind = SetKind::Incremental {
            start_time: T0,
            end_time: T1,
        };
        let name = naming.get(&kind, Component::Manifest, true, Encoding::Plain);
        assert_eq!(
            name,
            "host1-backup-inc.20231114T221320Z.to.20231115T221320Z.manifest.part"
        );

        let pr = naming.parse(&name).unwrap();
        assert!(pr.manifest);
        assert!(pr.partial);
        assert_eq!(pr.set_kind(), Some(kind));
    }

    #[test]
    fn test_short_names() {
        let naming = Naming::new("", true);
        let kind = SetKind::Incremental {
            start_time: T0,
            end_time: T1,
        };
        let vol = naming.get(&kind, Component::Volume(40), false, Encoding::Compressed);
        assert!(vol.starts_with("di."));
        assert!(vol.ends_with(".14.dt.z"));

        let pr = naming.parse(&vol).unwrap();
        assert_eq!(pr.volume_number, Some(40));
        assert!(pr.compressed);

        let sig = naming.get(&kind, Component::Signature, true, Encoding::Plain);
        let pr = naming.parse(&sig).unwrap();
        assert_eq!(pr.file_type, FileType::NewSig);
        assert!(pr.partial);
    }

    #[test]
    fn test_stat_and_signature_names() {
        let naming = Naming::new("", false);
        let full = SetKind::Full { time: T0 };
        let stat = naming.get(&full, Component::Stat, false, Encoding::Plain);
        assert_eq!(stat, "backup-full-stat.20231114T221320Z.jsonstat");
        assert_eq!(naming.parse(&stat).unwrap().file_type, FileType::FullStat);

        let sig = naming.get(&full, Component::Signature, false, Encoding::Compressed);
        assert_eq!(sig, "backup-full-signatures.20231114T221320Z.sigtar.zst");
        assert_eq!(naming.parse(&sig).unwrap().file_type, FileType::FullSig);
    }

    #[test]
    fn test_rejects_foreign_names() {
        let naming = Naming::new("", false);
        assert!(naming.parse("notes.txt").is_none());
        assert!(naming.parse("backup-full.garbage.vol1.difftar").is_none());
        assert!(naming.parse("backup-full.20231114T221320Z.vol0.difftar").is_none());
        assert!(naming
            .parse("backup-full.20231114T221320Z.vol1.difftar.gpg.extra")
            .is_none());
        assert!(naming.parse("tmp.2f1c").is_none());
    }

    #[test]
    fn test_prefix_must_match() {
        let naming = Naming::new("a-", false);
        assert!(naming
            .parse("backup-full.20231114T221320Z.manifest")
            .is_none());
        assert!(naming
            .parse("a-backup-full.20231114T221320Z.manifest")
            .is_some());
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(from_base36("10"), Some(36));
        assert_eq!(from_base36(&to_base36(T0 as u64)), Some(T0 as u64));
        assert_eq!(from_base36("A"), None);
        assert_eq!(from_base36(""), None);
    }

    #[test]
    fn test_parse_time_spec() {
        let parse = |s: &str| parse_time_spec(s, T1).ok();
        assert_eq!(parse("now"), Some(T1));
        assert_eq!(parse("20231114T221320Z"), Some(T0));
        assert_eq!(parse("1D"), Some(T0));
        assert_eq!(parse("1W2h"), Some(T1 - 7 * 86_400 - 7200));
        assert_eq!(parse(&T0.to_string()), Some(T0));
        assert_eq!(parse("2023-11-14T22:13:20Z"), Some(T0));
        assert_eq!(parse("12"), Some(12));
        assert!(matches!(parse_time_spec("3X", T1), Err(EngineError::Config(_))));
        assert!(matches!(parse_time_spec("", T1), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_huge_interval_is_rejected() {
        for spec in ["9223372036854775807Y", "99999999999999999999s", "300000000000Y"] {
            assert!(
                matches!(parse_time_spec(spec, T1), Err(EngineError::Config(_))),
                "{} accepted",
                spec
            );
        }
        assert!(matches!(
            parse_time_spec("9223372036854775807s", i64::MIN + 1),
            Err(EngineError::Config(_))
        ));
    }
}
