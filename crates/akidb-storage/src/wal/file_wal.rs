//! File-based Write-Ahead Log implementation
//!
//! Stores WAL entries as JSON lines in append-only segment files with fsync
//! for durability. Supports size-based rotation, crash recovery and
//! truncation of segments already covered by a snapshot.

use super::{LogEntry, LogSequenceNumber, WalSegment, WriteAheadLog};
use akidb_core::{CollectionId, CoreError, CoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Configuration for FileWAL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileWALConfig {
    /// Segment size in bytes that triggers rotation (default: 64MB)
    pub max_segment_bytes: u64,

    /// fsync on every write (default: true)
    pub sync_on_write: bool,

    /// Rotation attempts before giving up until the next append (default: 3)
    pub rotation_max_attempts: u32,

    /// Base delay between rotation attempts, doubled per attempt (default: 50ms)
    pub rotation_backoff_ms: u64,
}

impl Default for FileWALConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 64 * 1024 * 1024,
            sync_on_write: true,
            rotation_max_attempts: 3,
            rotation_backoff_ms: 50,
        }
    }
}

struct ActiveSegment {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes: u64,
    current_lsn: LogSequenceNumber,
}

/// File-based WAL owned by a single collection.
///
/// # File Format
/// - Filename: `wal-{lsn:016x}.log` where the LSN is the first one the
///   segment contains (the next LSN to be assigned when it was opened)
/// - Content: JSON lines, one `(LSN, LogEntry)` pair per line
///
/// # Crash Recovery
/// On open, scans every segment for the highest LSN. A torn or corrupt line
/// is logged and skipped. Appends always go to a fresh segment.
///
/// # Thread Safety
/// One mutex covers LSN assignment and the write, so file order equals LSN
/// order even under concurrent appends.
pub struct FileWAL {
    dir: PathBuf,
    collection_id: CollectionId,
    config: FileWALConfig,
    active: Mutex<ActiveSegment>,
    total_bytes: AtomicU64,
    rotation_pending: AtomicBool,
}

fn segment_path(dir: &Path, start_lsn: LogSequenceNumber) -> PathBuf {
    dir.join(format!("wal-{:016x}.log", start_lsn.value()))
}

fn parse_segment_name(path: &Path) -> Option<LogSequenceNumber> {
    if path.extension().map_or(true, |e| e != "log") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let hex = stem.strip_prefix("wal-")?;
    u64::from_str_radix(hex, 16).ok().map(LogSequenceNumber::new)
}

/// Lists segments sorted by their starting LSN.
fn list_segments(dir: &Path) -> CoreResult<Vec<WalSegment>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(start_lsn) = parse_segment_name(&path) {
            let size_bytes = std::fs::metadata(&path)?.len();
            segments.push(WalSegment {
                start_lsn,
                path,
                size_bytes,
            });
        }
    }
    segments.sort_by_key(|s| s.start_lsn);
    Ok(segments)
}

/// Reads every decodable entry of a segment.
fn read_segment(path: &Path) -> CoreResult<Vec<(LogSequenceNumber, LogEntry)>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<(LogSequenceNumber, LogEntry)>(&line) {
            Ok(pair) => entries.push(pair),
            Err(e) => {
                tracing::warn!(
                    segment = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable WAL record"
                );
            }
        }
    }

    Ok(entries)
}

fn open_segment(path: &Path) -> CoreResult<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

impl FileWAL {
    /// Opens (or creates) the WAL of `collection_id` in `dir`.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or segments cannot be read
    pub async fn open(
        dir: impl AsRef<Path>,
        collection_id: CollectionId,
        config: FileWALConfig,
    ) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let segments = list_segments(&dir)?;

        // Highest LSN ever assigned: either the last decodable entry or, when
        // truncation left only empty segments, one below the newest start.
        let mut max_lsn = LogSequenceNumber::ZERO;
        for segment in &segments {
            if let Some((lsn, _)) = read_segment(&segment.path)?.last() {
                max_lsn = max_lsn.max(*lsn);
            }
        }
        if let Some(last) = segments.last() {
            max_lsn = max_lsn.max(LogSequenceNumber::new(last.start_lsn.value().saturating_sub(1)));
        }

        let start_lsn = max_lsn.next()?;
        let path = segment_path(&dir, start_lsn);

        // A segment already named after the next LSN cannot hold a valid
        // entry, only an empty file or a torn write.
        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.len() > 0 {
                tracing::warn!(
                    collection_id = %collection_id,
                    segment = %path.display(),
                    bytes = meta.len(),
                    "Discarding torn WAL tail"
                );
                OpenOptions::new().write(true).truncate(true).open(&path)?;
            }
        }

        let file = open_segment(&path)?;
        let total_bytes = list_segments(&dir)?.iter().map(|s| s.size_bytes).sum();

        tracing::debug!(
            collection_id = %collection_id,
            lsn = %max_lsn,
            segments = segments.len(),
            "WAL opened"
        );

        Ok(Self {
            dir,
            collection_id,
            config,
            active: Mutex::new(ActiveSegment {
                writer: BufWriter::new(file),
                path,
                bytes: 0,
                current_lsn: max_lsn,
            }),
            total_bytes: AtomicU64::new(total_bytes),
            rotation_pending: AtomicBool::new(false),
        })
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segments currently on disk, oldest first.
    pub fn segments(&self) -> CoreResult<Vec<WalSegment>> {
        list_segments(&self.dir)
    }

    fn check_owner(&self, entry: &LogEntry) -> CoreResult<()> {
        if entry.collection_id() != self.collection_id {
            return Err(CoreError::ValidationError(format!(
                "WAL of collection {} cannot accept entry for collection {}",
                self.collection_id,
                entry.collection_id()
            )));
        }
        Ok(())
    }

    /// Writes entries under consecutive LSNs while holding the segment lock.
    fn write_locked(&self, entries: &[LogEntry]) -> CoreResult<(Vec<LogSequenceNumber>, bool)> {
        let mut active = self.active.lock();
        let mut lsn = active.current_lsn;
        let mut lsns = Vec::with_capacity(entries.len());
        let mut written = 0u64;

        for entry in entries {
            lsn = lsn.next()?;
            let mut line = serde_json::to_vec(&(lsn, entry))?;
            line.push(b'\n');
            active.writer.write_all(&line)?;
            written += line.len() as u64;
            lsns.push(lsn);
        }

        active.writer.flush()?;
        if self.config.sync_on_write {
            active.writer.get_ref().sync_data()?;
        }

        active.current_lsn = lsn;
        active.bytes += written;
        self.total_bytes.fetch_add(written, Ordering::Relaxed);

        let needs_rotation = active.bytes >= self.config.max_segment_bytes
            || self.rotation_pending.load(Ordering::Relaxed);
        Ok((lsns, needs_rotation))
    }

    fn rotate_locked(&self) -> CoreResult<()> {
        let mut active = self.active.lock();
        let next_lsn = active.current_lsn.next()?;
        let new_path = segment_path(&self.dir, next_lsn);

        if new_path == active.path {
            // Active segment is still empty and already named correctly.
            return Ok(());
        }

        active.writer.flush()?;
        active.writer.get_ref().sync_all()?;

        let file = open_segment(&new_path)?;
        active.writer = BufWriter::new(file);
        active.path = new_path;
        active.bytes = 0;

        tracing::debug!(
            collection_id = %self.collection_id,
            start_lsn = %next_lsn,
            "WAL segment rotated"
        );
        Ok(())
    }

    /// Rotation after a durable append. Failure leaves the append intact and
    /// marks rotation as pending for the next append.
    async fn rotate_after_append(&self) {
        if let Err(e) = self.rotate().await {
            tracing::error!(
                collection_id = %self.collection_id,
                error = %e,
                "WAL rotation failed, will retry on next append"
            );
        }
    }
}

#[async_trait]
impl WriteAheadLog for FileWAL {
    async fn append(&self, entry: LogEntry) -> CoreResult<LogSequenceNumber> {
        self.check_owner(&entry)?;
        let (lsns, needs_rotation) = self.write_locked(std::slice::from_ref(&entry))?;

        if needs_rotation {
            self.rotate_after_append().await;
        }

        lsns.into_iter()
            .next()
            .ok_or_else(|| CoreError::internal("WAL append produced no LSN"))
    }

    async fn append_batch(&self, entries: Vec<LogEntry>) -> CoreResult<Vec<LogSequenceNumber>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        for entry in &entries {
            self.check_owner(entry)?;
        }

        let (lsns, needs_rotation) = self.write_locked(&entries)?;
        if needs_rotation {
            self.rotate_after_append().await;
        }
        Ok(lsns)
    }

    async fn replay(
        &self,
        from_lsn: LogSequenceNumber,
    ) -> CoreResult<Vec<(LogSequenceNumber, LogEntry)>> {
        // Buffered bytes must reach the file before it is read back.
        self.active.lock().writer.flush()?;

        let segments = list_segments(&self.dir)?;
        let mut entries = Vec::new();

        for (i, segment) in segments.iter().enumerate() {
            // Segment i holds [start_i, start_{i+1}); skip it only when the
            // next segment begins at or before `from_lsn`.
            let covered = segments
                .get(i + 1)
                .map_or(true, |next| next.start_lsn > from_lsn);
            if !covered {
                continue;
            }

            entries.extend(
                read_segment(&segment.path)?
                    .into_iter()
                    .filter(|(lsn, _)| *lsn >= from_lsn),
            );
        }

        entries.sort_by_key(|(lsn, _)| *lsn);
        Ok(entries)
    }

    async fn rotate(&self) -> CoreResult<()> {
        let attempts = self.config.rotation_max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.rotate_locked() {
                Ok(()) => {
                    self.rotation_pending.store(false, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        collection_id = %self.collection_id,
                        attempt,
                        error = %e,
                        "WAL rotation attempt failed"
                    );
                    let delay = self
                        .config
                        .rotation_backoff_ms
                        .saturating_mul(1u64 << (attempt - 1).min(16));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    self.rotation_pending.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }

    async fn truncate_through(&self, lsn: LogSequenceNumber) -> CoreResult<u64> {
        let active_path = self.active.lock().path.clone();
        let segments = list_segments(&self.dir)?;
        let mut reclaimed = 0u64;

        for pair in segments.windows(2) {
            let (segment, next) = (&pair[0], &pair[1]);
            // Every entry of `segment` is < next.start_lsn.
            if segment.path == active_path || next.start_lsn.value() > lsn.value().saturating_add(1)
            {
                continue;
            }
            tokio::fs::remove_file(&segment.path).await?;
            reclaimed += segment.size_bytes;
        }

        self.total_bytes.fetch_sub(
            reclaimed.min(self.total_bytes.load(Ordering::Relaxed)),
            Ordering::Relaxed,
        );

        if reclaimed > 0 {
            tracing::debug!(
                collection_id = %self.collection_id,
                lsn = %lsn,
                bytes = reclaimed,
                "WAL segments truncated"
            );
        }
        Ok(reclaimed)
    }

    async fn current_lsn(&self) -> CoreResult<LogSequenceNumber> {
        Ok(self.active.lock().current_lsn)
    }

    fn size_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    async fn flush(&self) -> CoreResult<()> {
        let mut active = self.active.lock();
        active.writer.flush()?;
        active.writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use akidb_core::{DocumentId, VectorDocument};
    use tempfile::TempDir;

    fn upsert(collection_id: CollectionId, value: f32) -> LogEntry {
        LogEntry::upsert(
            collection_id,
            &VectorDocument::new(DocumentId::new(), vec![value]),
        )
    }

    fn small_segments() -> FileWALConfig {
        FileWALConfig {
            max_segment_bytes: 512,
            ..FileWALConfig::default()
        }
    }

    #[tokio::test]
    async fn test_file_wal_creation() {
        let dir = TempDir::new().unwrap();
        let wal = FileWAL::open(dir.path(), CollectionId::allocate(), FileWALConfig::default())
            .await
            .unwrap();
        assert_eq!(wal.current_lsn().await.unwrap(), LogSequenceNumber::ZERO);
        assert_eq!(wal.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_append_assigns_consecutive_lsns() {
        let dir = TempDir::new().unwrap();
        let cid = CollectionId::allocate();
        let wal = FileWAL::open(dir.path(), cid, FileWALConfig::default())
            .await
            .unwrap();

        assert_eq!(wal.append(upsert(cid, 0.0)).await.unwrap().value(), 1);
        let batch = wal
            .append_batch(vec![upsert(cid, 1.0), LogEntry::delete(cid, DocumentId::new())])
            .await
            .unwrap();
        assert_eq!(batch, vec![LogSequenceNumber::new(2), LogSequenceNumber::new(3)]);
        assert!(wal.size_bytes() > 0);
    }

    #[tokio::test]
    async fn test_append_rejects_foreign_collection() {
        let dir = TempDir::new().unwrap();
        let wal = FileWAL::open(dir.path(), CollectionId::allocate(), FileWALConfig::default())
            .await
            .unwrap();

        let err = wal
            .append(upsert(CollectionId::allocate(), 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
        assert_eq!(wal.current_lsn().await.unwrap(), LogSequenceNumber::ZERO);
    }

    #[tokio::test]
    async fn test_crash_recovery_continues_sequence() {
        let dir = TempDir::new().unwrap();
        let cid = CollectionId::allocate();
        {
            let wal = FileWAL::open(dir.path(), cid, FileWALConfig::default())
                .await
                .unwrap();
            for i in 0..10 {
                wal.append(upsert(cid, i as f32)).await.unwrap();
            }
        }

        let wal = FileWAL::open(dir.path(), cid, FileWALConfig::default())
            .await
            .unwrap();
        assert_eq!(wal.current_lsn().await.unwrap().value(), 10);
        assert_eq!(wal.append(upsert(cid, 10.0)).await.unwrap().value(), 11);
        assert_eq!(wal.replay(LogSequenceNumber::ZERO).await.unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_segments_are_named_after_first_lsn() {
        let dir = TempDir::new().unwrap();
        let cid = CollectionId::allocate();
        let wal = FileWAL::open(dir.path(), cid, small_segments()).await.unwrap();

        for i in 0..40 {
            wal.append(upsert(cid, i as f32)).await.unwrap();
        }

        let segments = wal.segments().unwrap();
        assert!(segments.len() > 2, "expected rotation to occur");
        for segment in &segments {
            let entries = read_segment(&segment.path).unwrap();
            if let Some((first, _)) = entries.first() {
                assert_eq!(*first, segment.start_lsn);
            }
        }
    }

    #[tokio::test]
    async fn test_replay_from_any_lsn_never_skips_entries() {
        let dir = TempDir::new().unwrap();
        let cid = CollectionId::allocate();
        let wal = FileWAL::open(dir.path(), cid, small_segments()).await.unwrap();

        for i in 0..40 {
            wal.append(upsert(cid, i as f32)).await.unwrap();
        }

        for from in 0..=41u64 {
            let entries = wal.replay(LogSequenceNumber::new(from)).await.unwrap();
            let expected = 40 - from.saturating_sub(1).min(40);
            assert_eq!(entries.len() as u64, expected, "replay from {from}");
            if let Some((first, _)) = entries.first() {
                assert_eq!(first.value(), from.max(1));
            }
        }
    }

    #[tokio::test]
    async fn test_rotation_on_empty_segment_is_noop() {
        let dir = TempDir::new().unwrap();
        let cid = CollectionId::allocate();
        let wal = FileWAL::open(dir.path(), cid, FileWALConfig::default())
            .await
            .unwrap();

        wal.rotate().await.unwrap();
        wal.rotate().await.unwrap();
        assert_eq!(wal.segments().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_torn_tail_is_skipped() {
        let dir = TempDir::new().unwrap();
        let cid = CollectionId::allocate();
        {
            let wal = FileWAL::open(dir.path(), cid, FileWALConfig::default())
                .await
                .unwrap();
            for i in 0..3 {
                wal.append(upsert(cid, i as f32)).await.unwrap();
            }
        }

        let segment = list_segments(dir.path()).unwrap().pop().unwrap();
        let mut file = OpenOptions::new().append(true).open(&segment.path).unwrap();
        file.write_all(b"[4,{\"type\":\"ups").unwrap();

        let wal = FileWAL::open(dir.path(), cid, FileWALConfig::default())
            .await
            .unwrap();
        assert_eq!(wal.current_lsn().await.unwrap().value(), 3);
        wal.append(upsert(cid, 9.0)).await.unwrap();

        let entries = wal.replay(LogSequenceNumber::ZERO).await.unwrap();
        let lsns: Vec<u64> = entries.iter().map(|(lsn, _)| lsn.value()).collect();
        assert_eq!(lsns, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_truncate_through_keeps_uncovered_entries() {
        let dir = TempDir::new().unwrap();
        let cid = CollectionId::allocate();
        let wal = FileWAL::open(dir.path(), cid, small_segments()).await.unwrap();

        for i in 0..40 {
            wal.append(upsert(cid, i as f32)).await.unwrap();
        }
        let before = wal.size_bytes();

        let reclaimed = wal.truncate_through(LogSequenceNumber::new(20)).await.unwrap();
        assert!(reclaimed > 0);
        assert_eq!(wal.size_bytes(), before - reclaimed);

        let remaining = wal.replay(LogSequenceNumber::new(21)).await.unwrap();
        assert_eq!(remaining.len(), 20);
        assert_eq!(remaining[0].0.value(), 21);
    }

    #[tokio::test]
    async fn test_lsn_survives_full_truncation() {
        let dir = TempDir::new().unwrap();
        let cid = CollectionId::allocate();
        {
            let wal = FileWAL::open(dir.path(), cid, FileWALConfig::default())
                .await
                .unwrap();
            for i in 0..5 {
                wal.append(upsert(cid, i as f32)).await.unwrap();
            }
            wal.rotate().await.unwrap();
            wal.truncate_through(LogSequenceNumber::new(5)).await.unwrap();
            assert_eq!(wal.segments().unwrap().len(), 1);
        }

        let wal = FileWAL::open(dir.path(), cid, FileWALConfig::default())
            .await
            .unwrap();
        assert_eq!(wal.current_lsn().await.unwrap().value(), 5);
        assert_eq!(wal.append(upsert(cid, 5.0)).await.unwrap().value(), 6);
    }
}
