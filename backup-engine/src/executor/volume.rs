//! Splitting the archive stream into sealed volumes.
//!
//! A volume is filled until another block might not fit its data budget,
//! closed with the source's footer and, unless the stream is drained,
//! topped off to the target size with bytes re-read from the start of the
//! volume file itself. Those bytes are already encoded, so the codec cannot
//! shrink them again, and the reader never looks past the footer.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpoint::Checkpoint;
use super::manifest::VolumeInfo;
use super::upload::{run_blocking, upload_volume, ManifestSequencer, UploadJob, UploadOutcome, UploadPool};
use crate::archive::{BlockIter, BlockSource, MAX_FOOTER_SIZE};
use crate::codec::{CountingWriter, VolumeCodec, VolumeEncoder};
use crate::config::Config;
use crate::naming::{Component, Naming};
use crate::storage::{sha256_file, Backend};
use crate::transfer::TransferStats;
use crate::utils::errors::{EngineError, Result};

/// Room left below the volume size for framing the codec adds.
pub const VOLUME_FUDGE: u64 = 50 * 1024;

/// Below this much estimated room the encoder is flushed before measuring.
const FLUSH_MARGIN: u64 = 256 * 1024;

const PAD_ROUNDS: usize = 4;

/// Size targets derived from the configured volume size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeTarget {
    pub target: u64,
    pub data_budget: u64,
}

impl VolumeTarget {
    pub fn new(volsize: u64) -> Self {
        let target = volsize.saturating_sub(VOLUME_FUDGE);
        Self {
            target,
            data_budget: target.saturating_sub(MAX_FOOTER_SIZE),
        }
    }
}

/// Outcome of writing one volume file.
#[derive(Debug, Clone, Copy)]
pub struct WrittenVolume {
    pub size: u64,
    /// The source has no more blocks
    pub at_end: bool,
}

/// Write the next volume of `iter` into `path`.
pub fn write_volume<S: BlockSource>(
    iter: &mut BlockIter<S>,
    codec: &dyn VolumeCodec,
    path: &Path,
    target: &VolumeTarget,
) -> Result<WrittenVolume> {
    let (out, written) = CountingWriter::new(BufWriter::new(File::create(path)?));
    let mut encoder = codec.encoder(Box::new(out))?;
    let read_size = iter.read_size() as u64;

    let mut at_end = false;
    let mut taken = 0usize;
    loop {
        let mut room = target.data_budget.saturating_sub(written.load(Ordering::Relaxed));
        if room < read_size + FLUSH_MARGIN {
            encoder.flush()?;
            room = target.data_budget.saturating_sub(written.load(Ordering::Relaxed));
        }
        if room < read_size {
            if taken == 0 {
                return Err(EngineError::Format(format!(
                    "blocks of {} bytes do not fit the {} byte data budget of a volume",
                    read_size, target.data_budget
                )));
            }
            break;
        }
        match iter.next()? {
            Some(block) => {
                block.write_to(&mut encoder)?;
                taken += 1;
            }
            None => {
                at_end = true;
                break;
            }
        }
    }

    iter.footer().write_to(&mut encoder)?;

    if !at_end {
        top_off(&mut encoder, &written, codec, path, target.target)?;
    }
    encoder.finish()?;

    let size = fs::metadata(path)?.len();
    debug!("Wrote {} ({} bytes, at_end: {})", path.display(), size, at_end);
    Ok(WrittenVolume { size, at_end })
}

/// Pad with bytes from the start of the volume until it reaches `target`.
fn top_off(
    encoder: &mut Box<dyn VolumeEncoder>,
    written: &AtomicU64,
    codec: &dyn VolumeCodec,
    path: &Path,
    target: u64,
) -> Result<()> {
    for _ in 0..PAD_ROUNDS {
        encoder.flush()?;
        let current = written.load(Ordering::Relaxed);
        if current > target {
            warn!("{} overshot its target by {} bytes", path.display(), current - target);
            return Ok(());
        }
        let short = target - current;
        if short <= codec.overhead(0) {
            return Ok(());
        }
        let pad = short - codec.overhead(short).min(short);
        copy_from_start(path, pad, encoder)?;
    }
    encoder.flush()?;
    Ok(())
}

/// Feed `len` bytes read from the beginning of `path` into `out`, cycling
/// over the file if it is shorter.
fn copy_from_start(path: &Path, len: u64, out: &mut dyn Write) -> io::Result<()> {
    let mut remaining = len;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let mut file = File::open(path)?;
        let mut progressed = false;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            remaining -= n as u64;
            progressed = true;
        }
        if !progressed {
            // nothing on disk yet to recycle
            let zeros = vec![0u8; remaining as usize];
            out.write_all(&zeros)?;
            remaining = 0;
        }
    }
    Ok(())
}

/// How a write run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Volumes up to `last_volume` are committed
    Completed { last_volume: u32 },
    /// Nothing changed; no volume was kept
    Skipped,
}

/// Drives [`write_volume`] over a whole stream: uploads each volume and
/// commits its info to the checkpoint in volume order.
pub struct VolumeWriter {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    codec: Arc<dyn VolumeCodec>,
    naming: Naming,
    cancel: CancellationToken,
    stats: TransferStats,
}

impl VolumeWriter {
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn Backend>,
        codec: Arc<dyn VolumeCodec>,
        cancel: CancellationToken,
    ) -> Self {
        let naming = Naming::from_config(&config);
        Self {
            config,
            backend,
            codec,
            naming,
            cancel,
            stats: TransferStats::default(),
        }
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Write volumes starting at `first_volume` until the source is drained.
    pub async fn run<S: BlockSource>(
        &mut self,
        iter: &mut BlockIter<S>,
        checkpoint: &mut Checkpoint,
        first_volume: u32,
    ) -> Result<WriteOutcome> {
        let mut pool = match self.config.upload.concurrency {
            0 => None,
            n => Some(UploadPool::new(
                Arc::clone(&self.backend),
                n,
                self.cancel.child_token(),
            )),
        };
        let result = self
            .run_volumes(iter, checkpoint, first_volume, pool.as_mut())
            .await;
        if let Some(pool) = pool.as_mut() {
            if result.is_err() {
                pool.shutdown().await;
            }
        }
        result
    }

    async fn run_volumes<S: BlockSource>(
        &mut self,
        iter: &mut BlockIter<S>,
        checkpoint: &mut Checkpoint,
        first_volume: u32,
        mut pool: Option<&mut UploadPool>,
    ) -> Result<WriteOutcome> {
        let temp_dir = self.config.archive.temp_dir.clone();
        fs::create_dir_all(&temp_dir)?;
        let target = VolumeTarget::new(self.config.volume.volsize);
        let kind = checkpoint.kind();
        let mut sequencer = ManifestSequencer::new(first_volume);
        let mut volume = first_volume;

        loop {
            if self.cancel.is_cancelled() {
                info!("Cancelled before volume {}", volume);
                return Err(EngineError::Cancelled);
            }

            let path = temp_dir.join(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
            iter.remember_next_index();
            let written = match write_volume(iter, self.codec.as_ref(), &path, &target) {
                Ok(written) => written,
                Err(e) => {
                    remove_scratch(&path);
                    return Err(e);
                }
            };
            let start = iter
                .recall_index()
                .or(iter.previous_index())
                .cloned()
                .unwrap_or_default();
            let end = iter.previous_index().cloned().unwrap_or_default();
            let info = VolumeInfo::new(volume, &start, &end, sha256_file(&path)?);

            if volume == 1
                && !kind.is_full()
                && written.at_end
                && self.config.backup.skip_if_no_change
                && !iter.has_changes()
            {
                info!("Skipping incremental: nothing changed");
                remove_scratch(&path);
                return Ok(WriteOutcome::Skipped);
            }

            let remote_name = self.naming.get(
                &kind,
                Component::Volume(volume),
                false,
                self.codec.encoding(),
            );
            info!(
                volume = volume,
                "Sealed {} ({} bytes)", remote_name, written.size
            );
            let job = UploadJob {
                local: path,
                remote_name,
                info,
                skip: self.config.testing.skip_volume == Some(volume),
            };

            match pool.as_deref_mut() {
                None => {
                    let backend = Arc::clone(&self.backend);
                    let done = run_blocking(move || {
                        let outcome = upload_volume(backend.as_ref(), &job);
                        if outcome.is_err() {
                            remove_scratch(&job.local);
                        }
                        outcome.map(|o| (o, job.info))
                    })
                    .await?;
                    self.commit(checkpoint, &mut sequencer, done)?;
                }
                Some(pool) => {
                    pool.submit(job).await?;
                    let mut batch = pool.try_completed();
                    if batch.iter().any(Result::is_err) {
                        batch.extend(pool.drain().await);
                    }
                    self.commit_batch(checkpoint, &mut sequencer, batch)?;
                }
            }

            if written.at_end {
                break;
            }
            volume += 1;
        }

        if let Some(pool) = pool {
            let batch = pool.drain().await;
            self.commit_batch(checkpoint, &mut sequencer, batch)?;
        }
        checkpoint.sync()?;
        Ok(WriteOutcome::Completed {
            last_volume: volume,
        })
    }

    /// Commit every successful transfer of `batch`, then report the first
    /// failure. Volumes that landed before a failed one stay committed.
    fn commit_batch(
        &mut self,
        checkpoint: &mut Checkpoint,
        sequencer: &mut ManifestSequencer,
        batch: Vec<Result<(UploadOutcome, VolumeInfo)>>,
    ) -> Result<()> {
        let mut first_err = None;
        for done in batch {
            match done {
                Ok(done) => self.commit(checkpoint, sequencer, done)?,
                Err(e) => {
                    warn!("Upload failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn commit(
        &mut self,
        checkpoint: &mut Checkpoint,
        sequencer: &mut ManifestSequencer,
        (outcome, info): (UploadOutcome, VolumeInfo),
    ) -> Result<()> {
        self.stats.record(&outcome);
        for ready in sequencer.complete(info) {
            let n = ready.volume_number;
            checkpoint.commit_volume(ready)?;
            if self.config.testing.fail_on_volume == Some(n) {
                warn!(volume = n, "Failing after volume {} as configured", n);
                return Err(EngineError::FaultInjected(n));
            }
        }
        Ok(())
    }
}

fn remove_scratch(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}
