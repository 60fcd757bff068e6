//! End-to-end backup, restart and restore against a local directory target.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use backup_engine::codec::{PlainCodec, VolumeCodec, VolumeEncoder, ZstdCodec};
use backup_engine::executor::manifest::Manifest;
use backup_engine::naming::Encoding;
use backup_engine::restore::{RestoreOptions, Restorer};
use backup_engine::storage::{Backend, BackendResult, LocalBackend, RemoteInfo};
use backup_engine::{BackupEngine, BackupMode, Config, EngineError, ErrorCode, Result};
use tempfile::TempDir;

/// Stand-in for an encrypting codec: XOR with a one-byte key.
struct XorCodec(u8);

struct XorWriter {
    key: u8,
    out: Box<dyn Write + Send>,
}

impl Write for XorWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mixed: Vec<u8> = buf.iter().map(|b| b ^ self.key).collect();
        self.out.write_all(&mixed)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl VolumeEncoder for XorWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.out.flush()
    }
}

struct XorReader {
    key: u8,
    input: Box<dyn Read + Send>,
}

impl Read for XorReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.input.read(buf)?;
        buf[..n].iter_mut().for_each(|b| *b ^= self.key);
        Ok(n)
    }
}

impl VolumeCodec for XorCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Encrypted
    }

    fn encoder(&self, out: Box<dyn Write + Send>) -> io::Result<Box<dyn VolumeEncoder>> {
        Ok(Box::new(XorWriter { key: self.0, out }))
    }

    fn decoder(&self, input: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(XorReader { key: self.0, input }))
    }
}

/// Flips the first byte of every stored volume after a put.
struct FlippingBackend {
    inner: LocalBackend,
    root: PathBuf,
}

impl Backend for FlippingBackend {
    fn put(&self, local: &Path, remote_name: &str) -> BackendResult<()> {
        self.inner.put(local, remote_name)?;
        if remote_name.contains(".difftar") {
            let path = self.root.join(remote_name);
            let mut bytes = fs::read(&path).map_err(|e| {
                backup_engine::storage::BackendError::from_io(remote_name, e)
            })?;
            bytes[0] ^= 0xff;
            fs::write(&path, &bytes)
                .map_err(|e| backup_engine::storage::BackendError::from_io(remote_name, e))?;
        }
        Ok(())
    }

    fn get(&self, remote_name: &str, local: &Path) -> BackendResult<()> {
        self.inner.get(remote_name, local)
    }

    fn list(&self) -> BackendResult<Vec<String>> {
        self.inner.list()
    }

    fn delete(&self, remote_names: &[String]) -> BackendResult<()> {
        self.inner.delete(remote_names)
    }

    fn query(&self, remote_name: &str) -> BackendResult<RemoteInfo> {
        self.inner.query(remote_name)
    }

    fn label(&self) -> String {
        "flipping".to_string()
    }
}

/// Deterministic incompressible bytes.
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

struct Site {
    dir: TempDir,
    source: PathBuf,
}

impl Site {
    fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("nested"))?;
        for i in 0..4u64 {
            fs::write(source.join(format!("blob{}", i)), noise(i + 1, 700 * 1024))?;
        }
        fs::write(source.join("nested/notes.txt"), b"first draft")?;
        Ok(Self { dir, source })
    }

    /// Config for a store named `store` inside this site.
    fn config(&self, store: &str) -> Config {
        let mut config = Config::default();
        config.backup.source_dir = self.source.clone();
        config.archive.archive_dir = self.dir.path().join(store).join("cache");
        config.archive.temp_dir = self.dir.path().join(store).join("tmp");
        config.archive.target_url = format!("file://{}", self.remote(store).display());
        config.volume.volsize = 1024 * 1024;
        config.volume.compression = "none".into();
        config
    }

    fn remote(&self, store: &str) -> PathBuf {
        self.dir.path().join(store).join("remote")
    }

    fn backend(&self, store: &str) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(LocalBackend::new(&self.remote(store))?))
    }

    async fn backup(
        &self,
        config: Config,
        store: &str,
        codec: Arc<dyn VolumeCodec>,
        mode: BackupMode,
    ) -> Result<backup_engine::BackupResult> {
        BackupEngine::new(Arc::new(config), self.backend(store)?, codec)?
            .execute(mode)
            .await
    }
}

fn final_manifest(config: &Config) -> Result<Manifest> {
    let cache = &config.archive.archive_dir;
    let name = fs::read_dir(cache)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .find(|n| n.ends_with(".manifest"))
        .ok_or_else(|| EngineError::Format("no final manifest".into()))?;
    Manifest::from_bytes(&fs::read(cache.join(name))?)
}

#[tokio::test]
async fn resumed_backup_matches_uninterrupted_run() -> Result<()> {
    let site = Site::new()?;

    let reference = site
        .backup(site.config("clean"), "clean", Arc::new(PlainCodec), BackupMode::Full)
        .await?;
    assert!(reference.volumes >= 3);

    let mut crashing = site.config("crash");
    crashing.testing.fail_on_volume = Some(2);
    let err = site
        .backup(crashing, "crash", Arc::new(PlainCodec), BackupMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::FaultInjected(2)));

    let resumed = site
        .backup(site.config("crash"), "crash", Arc::new(PlainCodec), BackupMode::Auto)
        .await?;
    assert!(resumed.restarted);
    assert_eq!(resumed.volumes, reference.volumes);

    let expected = final_manifest(&site.config("clean"))?;
    let actual = final_manifest(&site.config("crash"))?;
    assert_eq!(actual.volumes, expected.volumes);
    Ok(())
}

#[tokio::test]
async fn chain_of_three_sets_links_and_answers_queries() -> Result<()> {
    let site = Site::new()?;
    let codec: Arc<dyn VolumeCodec> = Arc::new(ZstdCodec::new(3));

    let t0 = site
        .backup(site.config("s"), "s", Arc::clone(&codec), BackupMode::Full)
        .await?
        .set
        .end_time();
    fs::write(site.source.join("nested/notes.txt"), b"second draft")?;
    let t1 = site
        .backup(site.config("s"), "s", Arc::clone(&codec), BackupMode::Incremental)
        .await?
        .set
        .end_time();
    fs::write(site.source.join("added.txt"), b"new")?;
    let t2 = site
        .backup(site.config("s"), "s", Arc::clone(&codec), BackupMode::Incremental)
        .await?
        .set
        .end_time();
    assert!(t0 < t1 && t1 < t2);

    let engine = BackupEngine::new(Arc::new(site.config("s")), site.backend("s")?, codec)?;
    let status = engine.collection_status().await?;
    assert_eq!(status.all_backup_chains.len(), 1);
    let chain = &status.all_backup_chains[0];
    assert_eq!((chain.start_time, chain.end_time), (t0, t2));
    assert_eq!(chain.incsets[0].kind.start_time(), t0);
    assert_eq!(chain.incsets[1].kind.start_time(), t1);

    let required = status.sets_older_than_required(t1);
    assert_eq!(required.len(), 1);
    assert!(required[0].kind.is_full());

    let at = status.backup_chain_at_time(t1)?;
    assert_eq!((at.start_time, at.end_time), (t0, t2));
    Ok(())
}

#[tokio::test]
async fn corrupted_upload_fails_the_backup() -> Result<()> {
    let site = Site::new()?;
    let config = site.config("bad");
    let root = site.remote("bad");
    let backend: Arc<dyn Backend> = Arc::new(FlippingBackend {
        inner: LocalBackend::new(&root)?,
        root,
    });

    let err = BackupEngine::new(Arc::new(config), backend, Arc::new(PlainCodec))?
        .execute(BackupMode::Full)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::BackendValidationFailed));
    assert!(err.is_fatal());
    Ok(())
}

#[tokio::test]
async fn encrypted_backup_restores_latest_state() -> Result<()> {
    let site = Site::new()?;
    let codec: Arc<dyn VolumeCodec> = Arc::new(XorCodec(0x5A));
    site.backup(site.config("enc"), "enc", Arc::clone(&codec), BackupMode::Full)
        .await?;

    let mut edited = fs::read(site.source.join("blob1"))?;
    edited[1000..1100].copy_from_slice(&[7u8; 100]);
    fs::write(site.source.join("blob1"), &edited)?;
    fs::remove_file(site.source.join("blob3"))?;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let inc = site
        .backup(site.config("enc"), "enc", Arc::clone(&codec), BackupMode::Auto)
        .await?;
    assert_eq!(inc.backup_type, "inc");
    assert_eq!(inc.source.changed_files, 1);
    assert_eq!(inc.source.deleted_files, 1);

    let names = site.backend("enc")?.list()?;
    assert!(names.iter().all(|n| n.ends_with(".gpg")));

    let target = site.dir.path().join("restored");
    let stats = Restorer::new(Arc::new(site.config("enc")), site.backend("enc")?, codec)?
        .restore(RestoreOptions {
            time: None,
            target: target.clone(),
            force: false,
        })
        .await?;
    assert_eq!(stats.sets, 2);
    assert_eq!(stats.deltas_applied, 1);

    assert_eq!(fs::read(target.join("blob1"))?, edited);
    assert_eq!(fs::read(target.join("blob0"))?, fs::read(site.source.join("blob0"))?);
    assert_eq!(fs::read(target.join("nested/notes.txt"))?, b"first draft");
    assert!(!target.join("blob3").exists());
    Ok(())
}

#[tokio::test]
async fn oversized_blocks_are_refused_before_writing() -> Result<()> {
    let site = Site::new()?;
    let mut config = site.config("big");
    config.volume.max_block_size = 2 * 1024 * 1024;

    let err = match BackupEngine::new(Arc::new(config), site.backend("big")?, Arc::new(PlainCodec)) {
        Ok(_) => panic!("engine accepted blocks larger than a volume"),
        Err(e) => e,
    };
    assert!(matches!(err, EngineError::Config(_)));
    assert!(site.backend("big")?.list()?.is_empty());
    Ok(())
}
