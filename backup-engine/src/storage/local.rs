//! Storage backend for a local (or mounted) directory.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::{sha256_file, Backend, BackendResult, RemoteInfo};
use crate::utils::errors::BackendError;

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub fn new(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        Ok(Self { root })
    }

    /// Remote names are flat; anything that could escape the root is refused.
    fn resolve(&self, name: &str) -> BackendResult<PathBuf> {
        let path = Path::new(name);
        let mut components = path.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(BackendError::Fatal(format!("unsafe remote name: '{}'", name))),
        }
    }
}

impl Backend for LocalBackend {
    fn put(&self, local: &Path, remote_name: &str) -> BackendResult<()> {
        let target = self.resolve(remote_name)?;
        let io_err = |e| BackendError::from_io(remote_name, e);

        // Copy into a temp file next to the target, then rename into place.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root).map_err(io_err)?;
        let mut src = fs::File::open(local).map_err(io_err)?;
        io::copy(&mut src, tmp.as_file_mut()).map_err(io_err)?;
        tmp.as_file_mut().flush().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&target).map_err(|e| io_err(e.error))?;
        debug!("Stored {} in {}", remote_name, self.root.display());
        Ok(())
    }

    fn get(&self, remote_name: &str, local: &Path) -> BackendResult<()> {
        let source = self.resolve(remote_name)?;
        fs::copy(&source, local).map_err(|e| BackendError::from_io(remote_name, e))?;
        Ok(())
    }

    fn list(&self) -> BackendResult<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| BackendError::from_io("list", e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackendError::from_io("list", e))?;
            let is_file = entry
                .file_type()
                .map(|t| t.is_file())
                .map_err(|e| BackendError::from_io("list", e))?;
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, remote_names: &[String]) -> BackendResult<()> {
        for name in remote_names {
            let path = self.resolve(name)?;
            match fs::remove_file(&path) {
                Ok(()) => debug!("Deleted {}", name),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(BackendError::from_io(name, e)),
            }
        }
        Ok(())
    }

    fn query(&self, remote_name: &str) -> BackendResult<RemoteInfo> {
        let path = self.resolve(remote_name)?;
        let meta = fs::metadata(&path).map_err(|e| BackendError::from_io(remote_name, e))?;
        let sha256 = sha256_file(&path).map_err(|e| BackendError::from_io(remote_name, e))?;
        Ok(RemoteInfo {
            size: Some(meta.len()),
            sha256: Some(sha256),
        })
    }

    fn label(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_list_delete() -> io::Result<()> {
        let dir = TempDir::new()?;
        let backend = LocalBackend::new(&dir.path().join("remote"))?;
        let src = dir.path().join("src");
        fs::write(&src, b"hello")?;

        backend.put(&src, "b-file").unwrap();
        backend.put(&src, "a-file").unwrap();
        assert!(src.exists());
        assert_eq!(backend.list().unwrap(), vec!["a-file", "b-file"]);

        let info = backend.query("a-file").unwrap();
        assert_eq!(info.size, Some(5));

        let out = dir.path().join("out");
        backend.get("a-file", &out).unwrap();
        assert_eq!(fs::read(&out)?, b"hello");

        backend
            .delete(&["a-file".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(backend.list().unwrap(), vec!["b-file"]);
        Ok(())
    }

    #[test]
    fn test_missing_object_is_not_found() -> io::Result<()> {
        let dir = TempDir::new()?;
        let backend = LocalBackend::new(dir.path())?;
        assert!(matches!(
            backend.query("nope"),
            Err(BackendError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_rejects_path_traversal() -> io::Result<()> {
        let dir = TempDir::new()?;
        let backend = LocalBackend::new(dir.path())?;
        let src = dir.path().join("src");
        fs::write(&src, b"x")?;
        assert!(matches!(
            backend.put(&src, "../escape"),
            Err(BackendError::Fatal(_))
        ));
        assert!(backend.put(&src, "sub/dir").is_err());
        Ok(())
    }
}
