//! Source selection: a lazy, sorted walk of the backup source.
//!
//! Entries come out ordered by their path components, which is the order
//! the archive stream and the signature files rely on.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links to directories
    pub follow_links: bool,

    /// Exclude patterns (glob-style), matched against the relative path and
    /// the file name
    pub exclude_patterns: Vec<String>,
}

/// One selected path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path components from the root
    pub index: Vec<String>,

    pub size: u64,

    /// Modification time in nanoseconds since the epoch
    pub mtime_ns: i64,

    pub is_dir: bool,
}

impl FileInfo {
    /// For symlinks, resolves to the target to get the real file size.
    /// Returns None if the symlink target is a directory or cannot be resolved.
    fn from_entry(entry: &DirEntry, root: &Path) -> io::Result<Option<Self>> {
        let raw_metadata = entry.metadata().map_err(io::Error::from)?;
        let path = entry.path().to_path_buf();

        let metadata = if raw_metadata.is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_dir() => return Ok(None),
                Ok(resolved) => resolved,
                Err(_) => return Ok(None),
            }
        } else {
            raw_metadata
        };

        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);

        Ok(Some(Self {
            index: path_index(path.strip_prefix(root).unwrap_or(&path)),
            path,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            mtime_ns,
            is_dir: metadata.is_dir(),
        }))
    }
}

/// Split a relative path into its components.
pub fn path_index(relative: &Path) -> Vec<String> {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect()
}

/// Join an index back onto `root`.
pub fn index_path(root: &Path, index: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(index);
    path
}

/// Lazy iterator over the selected files and directories below a root.
///
/// Not restartable: walk again to start over.
pub struct Selection {
    root: PathBuf,
    inner: walkdir::IntoIter,
    excludes: GlobSet,
}

impl Selection {
    pub fn new(root: &Path, options: &WalkOptions) -> io::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &options.exclude_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid exclude pattern '{}': {}", pattern, e),
                )
            })?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let inner = WalkDir::new(root)
            .follow_links(options.follow_links)
            .sort_by_file_name()
            .into_iter();

        Ok(Self {
            root: root.to_path_buf(),
            inner,
            excludes,
        })
    }

    fn should_exclude(&self, entry: &DirEntry) -> bool {
        if self.excludes.is_empty() {
            return false;
        }
        let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
        self.excludes.is_match(relative) || self.excludes.is_match(entry.file_name())
    }
}

impl Iterator for Selection {
    type Item = io::Result<FileInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(io::Error::from(e))),
            };
            if entry.depth() == 0 {
                continue;
            }
            if self.should_exclude(&entry) {
                if entry.file_type().is_dir() {
                    self.inner.skip_current_dir();
                }
                continue;
            }
            match FileInfo::from_entry(&entry, &self.root) {
                Ok(Some(info)) => return Some(Ok(info)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Walk a directory tree and collect every selected entry.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> io::Result<Vec<FileInfo>> {
    Selection::new(root, options)?.collect()
}
