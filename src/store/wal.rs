// ============================================================================
// WAL-BACKED STORE
// ============================================================================
// In-memory tables rebuilt on startup from an append-only log.
//
// Frame layout: [len: u32 LE][crc32: u32 LE][payload: len bytes]
// The payload is a JSON-encoded `WalRecord`. A short or checksum-failing
// final frame is a torn write and is truncated on replay; a bad frame with
// valid data after it is corruption and fails the open.
//
// Purges are logged first, applied to the tables, then the log is compacted
// by rewriting the surviving state to a temp file and renaming it over the
// old one.
// ============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::memory::Tables;
use super::MetricStore;
use crate::error::{StorageError, StorageResult};
use crate::types::{
    AggregatedBucket, AggregationInterval, MetricPoint, MetricQuery, Timestamp,
};

const WAL_FILE_NAME: &str = "metrics.wal";
const FRAME_HEADER_LEN: usize = 8;
const COMPACTION_CHUNK: usize = 1024;

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
enum WalEntry {
    Points(Vec<MetricPoint>),
    Buckets(Vec<AggregatedBucket>),
    Purge { cutoff: Timestamp },
    PurgeBuckets { cutoff: Timestamp },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalRecord {
    sequence: u64,
    entry: WalEntry,
}

/// CRC-32 (IEEE, reflected)
fn crc32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0xFFFF_FFFF;
    for byte in data {
        hash ^= *byte as u32;
        for _ in 0..8 {
            if hash & 1 != 0 {
                hash = (hash >> 1) ^ 0xEDB8_8320;
            } else {
                hash >>= 1;
            }
        }
    }
    !hash
}

fn encode_frame(record: &WalRecord) -> StorageResult<Vec<u8>> {
    let payload = serde_json::to_vec(record).map_err(|e| StorageError::SerializationFailed {
        message: e.to_string(),
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

enum Frame<'a> {
    Complete { payload: &'a [u8], next: usize },
    Torn,
    BadChecksum { next: usize },
}

fn read_frame(data: &[u8], offset: usize) -> Frame<'_> {
    let rest = &data[offset..];
    if rest.len() < FRAME_HEADER_LEN {
        return Frame::Torn;
    }
    let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
    if rest.len() < FRAME_HEADER_LEN + len {
        return Frame::Torn;
    }
    let payload = &rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
    let next = offset + FRAME_HEADER_LEN + len;
    if crc32(payload) != crc {
        return Frame::BadChecksum { next };
    }
    Frame::Complete { payload, next }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct WalCounters {
    entries_written: AtomicU64,
    bytes_written: AtomicU64,
    syncs_performed: AtomicU64,
    compactions: AtomicU64,
    entries_replayed: AtomicU64,
}

/// WAL statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalStats {
    pub entries_written: u64,
    pub bytes_written: u64,
    pub syncs_performed: u64,
    pub compactions: u64,
    pub entries_replayed: u64,
    pub current_sequence: u64,
}

// ----------------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------------

struct WalInner {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    tables: RwLock<Tables>,
    sequence: AtomicU64,
    sync_every_write: bool,
    counters: WalCounters,
    /// Bytes of the next frame to write before failing it
    #[cfg(test)]
    fail_next_append: Mutex<Option<usize>>,
}

/// Durable store: every mutation is logged before it becomes visible.
#[derive(Clone)]
pub struct WalStore {
    inner: Arc<WalInner>,
}

impl WalStore {
    /// Open (or create) the log in `dir` and replay it.
    pub fn open(dir: impl AsRef<Path>, sync_every_write: bool) -> StorageResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| StorageError::io("create_dir", dir, e))?;
        let path = dir.join(WAL_FILE_NAME);

        let mut tables = Tables::default();
        let (replayed, max_sequence) = replay(&path, &mut tables)?;

        let file = open_append(&path)?;
        let inner = WalInner {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            tables: RwLock::new(tables),
            sequence: AtomicU64::new(max_sequence + 1),
            sync_every_write,
            counters: WalCounters::default(),
            #[cfg(test)]
            fail_next_append: Mutex::new(None),
        };
        inner
            .counters
            .entries_replayed
            .store(replayed, AtomicOrdering::Relaxed);

        info!(
            target: "pulse::wal",
            path = %inner.path.display(),
            replayed,
            points = inner.tables.read().point_count(),
            next_sequence = max_sequence + 1,
            "WAL opened"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn point_count(&self) -> usize {
        self.inner.tables.read().point_count()
    }

    pub fn stats(&self) -> WalStats {
        let c = &self.inner.counters;
        WalStats {
            entries_written: c.entries_written.load(AtomicOrdering::Relaxed),
            bytes_written: c.bytes_written.load(AtomicOrdering::Relaxed),
            syncs_performed: c.syncs_performed.load(AtomicOrdering::Relaxed),
            compactions: c.compactions.load(AtomicOrdering::Relaxed),
            entries_replayed: c.entries_replayed.load(AtomicOrdering::Relaxed),
            current_sequence: self.inner.sequence.load(AtomicOrdering::SeqCst),
        }
    }

    /// Stop accepting writes; further mutations fail with `Closed`
    pub fn close(&self) -> StorageResult<()> {
        let mut writer = self.inner.writer.lock();
        if let Some(mut w) = writer.take() {
            w.flush()
                .and_then(|_| w.get_ref().sync_all())
                .map_err(|e| StorageError::io("sync", &self.inner.path, e))?;
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&WalInner) -> StorageResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StorageError::WorkerFailed {
                message: e.to_string(),
            })?
    }
}

impl WalInner {
    /// Append one record. On failure the log is cut back to its length before
    /// the call, so a rejected entry never reaches disk.
    fn append(&self, writer: &mut Option<BufWriter<File>>, entry: WalEntry) -> StorageResult<()> {
        let w = writer.as_mut().ok_or(StorageError::Closed)?;
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let frame = encode_frame(&WalRecord { sequence, entry })?;

        let start = w
            .get_ref()
            .metadata()
            .map_err(|e| StorageError::io("stat", &self.path, e))?
            .len();
        if let Err((op, e)) = self.write_frame(w, &frame) {
            self.rollback(writer, start);
            return Err(StorageError::io(op, &self.path, e));
        }

        self.counters.entries_written.fetch_add(1, AtomicOrdering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(frame.len() as u64, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn write_frame(
        &self,
        w: &mut BufWriter<File>,
        frame: &[u8],
    ) -> Result<(), (&'static str, io::Error)> {
        #[cfg(test)]
        if let Some(written) = self.fail_next_append.lock().take() {
            let (head, tail) = frame.split_at(written.min(frame.len()));
            w.write_all(head).and_then(|_| w.flush()).map_err(|e| ("append", e))?;
            w.write_all(tail).map_err(|e| ("append", e))?;
            return Err(("append", io::Error::new(io::ErrorKind::Other, "injected write failure")));
        }

        w.write_all(frame)
            .and_then(|_| w.flush())
            .map_err(|e| ("append", e))?;
        if self.sync_every_write {
            w.get_ref().sync_data().map_err(|e| ("sync", e))?;
            self.counters.syncs_performed.fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(())
    }

    /// Discard buffered bytes and truncate the log to `len`. If the truncate
    /// itself fails the writer is closed rather than appending after a torn frame.
    fn rollback(&self, writer: &mut Option<BufWriter<File>>, len: u64) {
        let Some(w) = writer.take() else {
            return;
        };
        let (file, _unflushed) = w.into_parts();
        match file.set_len(len) {
            Ok(()) => {
                warn!(target: "pulse::wal", len, "Rolled back failed WAL append");
                *writer = Some(BufWriter::new(file));
            }
            Err(e) => {
                error!(
                    target: "pulse::wal",
                    path = %self.path.display(),
                    error = %e,
                    "Failed to roll back WAL append, closing writer"
                );
            }
        }
    }

    fn insert_points(&self, points: Vec<MetricPoint>) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        self.append(&mut writer, WalEntry::Points(points.clone()))?;
        let mut tables = self.tables.write();
        for point in points {
            tables.insert(point);
        }
        Ok(())
    }

    fn upsert_buckets(&self, buckets: Vec<AggregatedBucket>) -> StorageResult<usize> {
        let mut writer = self.writer.lock();
        self.append(&mut writer, WalEntry::Buckets(buckets.clone()))?;
        let count = buckets.len();
        let mut tables = self.tables.write();
        for bucket in buckets {
            tables.upsert_bucket(bucket);
        }
        Ok(count)
    }

    fn purge(&self, entry: WalEntry) -> StorageResult<usize> {
        let mut writer = self.writer.lock();
        self.append(&mut writer, entry.clone())?;
        let removed = {
            let mut tables = self.tables.write();
            match entry {
                WalEntry::Purge { cutoff } => tables.purge_older_than(cutoff),
                WalEntry::PurgeBuckets { cutoff } => tables.purge_buckets_older_than(cutoff),
                WalEntry::Points(_) | WalEntry::Buckets(_) => 0,
            }
        };
        if removed > 0 {
            self.compact(&mut writer)?;
        }
        Ok(removed)
    }

    /// Rewrite the log as the current table contents. Caller holds the writer lock.
    fn compact(&self, writer: &mut Option<BufWriter<File>>) -> StorageResult<()> {
        if writer.is_none() {
            return Err(StorageError::Closed);
        }
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut out = BufWriter::new(
            File::create(&tmp_path).map_err(|e| StorageError::io("create", &tmp_path, e))?,
        );

        let (points, buckets): (Vec<MetricPoint>, Vec<AggregatedBucket>) = {
            let tables = self.tables.read();
            (
                tables.all_points().cloned().collect(),
                tables.all_buckets().cloned().collect(),
            )
        };

        let mut frames = 0u64;
        let mut write_entry = |entry: WalEntry| -> StorageResult<()> {
            let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
            let frame = encode_frame(&WalRecord { sequence, entry })?;
            out.write_all(&frame)
                .map_err(|e| StorageError::io("compact", &tmp_path, e))?;
            frames += 1;
            Ok(())
        };
        for chunk in points.chunks(COMPACTION_CHUNK) {
            write_entry(WalEntry::Points(chunk.to_vec()))?;
        }
        for chunk in buckets.chunks(COMPACTION_CHUNK) {
            write_entry(WalEntry::Buckets(chunk.to_vec()))?;
        }

        out.flush()
            .and_then(|_| out.get_ref().sync_all())
            .map_err(|e| StorageError::io("sync", &tmp_path, e))?;
        drop(out);

        fs::rename(&tmp_path, &self.path)
            .map_err(|e| StorageError::io("rename", &self.path, e))?;
        *writer = Some(BufWriter::new(open_append(&self.path)?));

        self.counters.compactions.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(
            target: "pulse::wal",
            frames,
            points = points.len(),
            buckets = buckets.len(),
            "WAL compacted"
        );
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        if let Some(w) = writer.as_mut() {
            w.flush()
                .and_then(|_| w.get_ref().sync_data())
                .map_err(|e| StorageError::io("sync", &self.path, e))?;
            self.counters.syncs_performed.fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> StorageResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StorageError::io("open", path, e))
}

/// Apply every intact record to `tables`. Returns (records replayed, max sequence).
fn replay(path: &Path, tables: &mut Tables) -> StorageResult<(u64, u64)> {
    if !path.exists() {
        return Ok((0, 0));
    }
    let data = fs::read(path).map_err(|e| StorageError::io("read", path, e))?;

    let mut offset = 0usize;
    let mut replayed = 0u64;
    let mut max_sequence = 0u64;

    while offset < data.len() {
        let payload = match read_frame(&data, offset) {
            Frame::Complete { payload, next } => {
                offset = next;
                payload
            }
            Frame::BadChecksum { next } if next < data.len() => {
                return Err(StorageError::DataCorruption {
                    offset: offset as u64,
                    message: "checksum mismatch".into(),
                });
            }
            Frame::Torn | Frame::BadChecksum { .. } => {
                warn!(
                    target: "pulse::wal",
                    offset,
                    discarded = data.len() - offset,
                    "Truncating torn write at end of WAL"
                );
                OpenOptions::new()
                    .write(true)
                    .open(path)
                    .and_then(|f| f.set_len(offset as u64))
                    .map_err(|e| StorageError::io("truncate", path, e))?;
                break;
            }
        };

        let record: WalRecord =
            serde_json::from_slice(payload).map_err(|e| StorageError::DataCorruption {
                offset: offset as u64,
                message: e.to_string(),
            })?;
        max_sequence = max_sequence.max(record.sequence);
        match record.entry {
            WalEntry::Points(points) => points.into_iter().for_each(|p| tables.insert(p)),
            WalEntry::Buckets(buckets) => buckets.into_iter().for_each(|b| tables.upsert_bucket(b)),
            WalEntry::Purge { cutoff } => {
                tables.purge_older_than(cutoff);
            }
            WalEntry::PurgeBuckets { cutoff } => {
                tables.purge_buckets_older_than(cutoff);
            }
        }
        replayed += 1;
    }

    Ok((replayed, max_sequence))
}

#[async_trait]
impl MetricStore for WalStore {
    fn name(&self) -> &'static str {
        "wal"
    }

    async fn insert(&self, point: &MetricPoint) -> StorageResult<()> {
        let point = point.clone();
        self.blocking(move |inner| inner.insert_points(vec![point])).await
    }

    async fn insert_batch(&self, points: &[MetricPoint]) -> StorageResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points = points.to_vec();
        self.blocking(move |inner| inner.insert_points(points)).await
    }

    async fn scan(
        &self,
        query: &MetricQuery,
        limit: Option<usize>,
    ) -> StorageResult<Vec<MetricPoint>> {
        Ok(self.inner.tables.read().scan(query, limit))
    }

    async fn latest(&self, n: usize) -> StorageResult<Vec<MetricPoint>> {
        Ok(self.inner.tables.read().latest(n))
    }

    async fn list_services(&self) -> StorageResult<Vec<String>> {
        Ok(self.inner.tables.read().services())
    }

    async fn purge_older_than(&self, cutoff: Timestamp) -> StorageResult<usize> {
        self.blocking(move |inner| inner.purge(WalEntry::Purge { cutoff }))
            .await
    }

    async fn upsert_buckets(&self, buckets: &[AggregatedBucket]) -> StorageResult<usize> {
        if buckets.is_empty() {
            return Ok(0);
        }
        let buckets = buckets.to_vec();
        self.blocking(move |inner| inner.upsert_buckets(buckets)).await
    }

    async fn scan_buckets(
        &self,
        interval: AggregationInterval,
        query: &MetricQuery,
    ) -> StorageResult<Vec<AggregatedBucket>> {
        Ok(self.inner.tables.read().scan_buckets(interval, query))
    }

    async fn purge_buckets_older_than(&self, cutoff: Timestamp) -> StorageResult<usize> {
        self.blocking(move |inner| inner.purge(WalEntry::PurgeBuckets { cutoff }))
            .await
    }

    async fn sync(&self) -> StorageResult<()> {
        self.blocking(|inner| inner.sync()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricType;

    fn at(secs: i64, service: &str) -> MetricPoint {
        MetricPoint::new(service, MetricType::Latency, secs as f64)
            .with_timestamp(Timestamp::from_secs(secs))
            .with_tag("endpoint", "/login")
            .with_tag("status_code", 200i64)
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[tokio::test]
    async fn test_reopen_replays_points() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = WalStore::open(dir.path(), false).unwrap();
            store.insert(&at(10, "auth")).await.unwrap();
            store.insert_batch(&[at(20, "api"), at(30, "auth")]).await.unwrap();
            store.sync().await.unwrap();
            assert_eq!(store.stats().entries_written, 2);
        }

        let store = WalStore::open(dir.path(), false).unwrap();
        assert_eq!(store.point_count(), 3);
        assert_eq!(store.stats().entries_replayed, 2);
        assert_eq!(
            store.list_services().await.unwrap(),
            vec!["api".to_string(), "auth".to_string()]
        );

        let latest = store.latest(1).await.unwrap();
        assert_eq!(latest[0], at(30, "auth"));
    }

    #[tokio::test]
    async fn test_purge_compacts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalStore::open(dir.path(), true).unwrap();
        let points: Vec<_> = (0..100).map(|i| at(i, "auth")).collect();
        store.insert_batch(&points).await.unwrap();
        let before = fs::metadata(store.path()).unwrap().len();

        let removed = store.purge_older_than(Timestamp::from_secs(90)).await.unwrap();
        assert_eq!(removed, 90);
        assert_eq!(store.stats().compactions, 1);
        let after = fs::metadata(store.path()).unwrap().len();
        assert!(after < before);

        store.insert(&at(200, "auth")).await.unwrap();
        drop(store);

        let reopened = WalStore::open(dir.path(), false).unwrap();
        assert_eq!(reopened.point_count(), 11);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let store = WalStore::open(dir.path(), false).unwrap();
            store.insert(&at(1, "auth")).await.unwrap();
            store.insert(&at(2, "auth")).await.unwrap();
            store.path().to_path_buf()
        };

        let mut bytes = fs::read(&path).unwrap();
        let intact = bytes.len();
        bytes.extend_from_slice(&[42, 0, 0, 0, 1, 2]);
        fs::write(&path, &bytes).unwrap();

        let store = WalStore::open(dir.path(), false).unwrap();
        assert_eq!(store.point_count(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, intact);
    }

    #[tokio::test]
    async fn test_mid_log_corruption_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let store = WalStore::open(dir.path(), false).unwrap();
            store.insert(&at(1, "auth")).await.unwrap();
            store.insert(&at(2, "auth")).await.unwrap();
            store.path().to_path_buf()
        };

        let mut bytes = fs::read(&path).unwrap();
        bytes[FRAME_HEADER_LEN + 2] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = WalStore::open(dir.path(), false).err().unwrap();
        assert!(matches!(err, StorageError::DataCorruption { offset: 0, .. }));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalStore::open(dir.path(), false).unwrap();
        store.close().unwrap();
        let err = store.insert(&at(1, "auth")).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed));
    }

    #[tokio::test]
    async fn test_failed_append_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = WalStore::open(dir.path(), true).unwrap();
            store.insert(&at(1, "auth")).await.unwrap();
            let len = fs::metadata(store.path()).unwrap().len();

            *store.inner.fail_next_append.lock() = Some(10);
            assert!(store.insert(&at(2, "auth")).await.is_err());
            assert_eq!(store.point_count(), 1);
            assert_eq!(fs::metadata(store.path()).unwrap().len(), len);

            store.insert(&at(3, "auth")).await.unwrap();
            assert_eq!(store.point_count(), 2);
            assert_eq!(store.stats().entries_written, 2);
        }

        let store = WalStore::open(dir.path(), false).unwrap();
        let values: Vec<f64> = store.latest(10).await.unwrap().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![3.0, 1.0]);
    }

    #[tokio::test]
    async fn test_buckets_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let points: Vec<_> = (0..10).map(|i| at(i, "auth")).collect();
        let buckets = crate::aggregator::aggregate(&points, AggregationInterval::OneMinute);
        {
            let store = WalStore::open(dir.path(), false).unwrap();
            assert_eq!(store.upsert_buckets(&buckets).await.unwrap(), 1);
        }
        let store = WalStore::open(dir.path(), false).unwrap();
        let query = MetricQuery::range(Timestamp::from_secs(0), Timestamp::from_secs(60));
        let stored = store
            .scan_buckets(AggregationInterval::OneMinute, &query)
            .await
            .unwrap();
        assert_eq!(stored, buckets);
    }
}
