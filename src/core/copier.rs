//! Cluster copy engine
//!
//! [`CopyEngine::copy_range`] is the single unit of work shared by the
//! background scan and the live-write hook: it copies every not-yet-copied
//! cluster covering a byte range from source to target, under one
//! in-flight registration for the whole range.
//!
//! A reader/writer gate doubles as the drain barrier. Every copy holds a
//! shared guard for its whole duration; [`CopyEngine::drain`] takes the
//! exclusive guard, which is only granted once all running copies have
//! finished, and closes the engine so later calls do nothing.

use super::bitmap::DirtyBitmap;
use super::policy::{ErrorAction, ErrorPolicy, IoSide};
use super::range_lock::RangeLock;
use crate::device::{BlockDevice, WriteInterceptor};
use crate::error::BackupError;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::RwLock;

/// Default copy granularity
pub const DEFAULT_CLUSTER_SIZE: u64 = 64 * 1024;

/// A cluster copy failed and the error policy did not let it be skipped
#[derive(Debug)]
pub struct CopyFailure {
    /// Device the error came from
    pub side: IoSide,
    /// What the policy decided
    pub action: ErrorAction,
    /// The error itself, with cluster context
    pub error: BackupError,
}

impl CopyFailure {
    /// True if the source read failed
    pub fn is_read(&self) -> bool {
        self.side == IoSide::Source
    }

    /// Underlying I/O error
    pub fn io_error(&self) -> Option<&io::Error> {
        self.error.io_error()
    }

    /// Convert into an I/O error for the intercepted write
    pub fn into_io_error(self) -> io::Error {
        let kind = self.io_error().map_or(io::ErrorKind::Other, io::Error::kind);
        io::Error::new(kind, self.error)
    }
}

/// Copies clusters from source to target at most once each
pub struct CopyEngine {
    source: Arc<dyn BlockDevice>,
    /// Taken out by [`CopyEngine::release_target`] once the job is over
    target: Mutex<Option<Arc<dyn BlockDevice>>>,
    target_name: String,
    len: u64,
    bitmap: DirtyBitmap,
    in_flight: RangeLock,
    policy: ErrorPolicy,
    /// `true` once drained
    gate: RwLock<bool>,
    bytes_copied: AtomicU64,
    zero_clusters: AtomicU64,
    skipped: Mutex<Vec<u64>>,
}

impl CopyEngine {
    /// Create an engine for a source of `len` bytes
    pub fn new(
        source: Arc<dyn BlockDevice>,
        target: Arc<dyn BlockDevice>,
        len: u64,
        cluster_size: u64,
        policy: ErrorPolicy,
    ) -> Self {
        Self {
            source,
            target_name: target.name().to_string(),
            target: Mutex::new(Some(target)),
            len,
            bitmap: DirtyBitmap::new(len, cluster_size),
            in_flight: RangeLock::new(),
            policy,
            gate: RwLock::new(false),
            bytes_copied: AtomicU64::new(0),
            zero_clusters: AtomicU64::new(0),
            skipped: Mutex::new(Vec::new()),
        }
    }

    /// Source device
    pub fn source(&self) -> &Arc<dyn BlockDevice> {
        &self.source
    }

    /// Target device, until it has been released
    pub fn target(&self) -> Option<Arc<dyn BlockDevice>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Name of the target device
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Give up the engine's reference to the target.
    ///
    /// Only meaningful after [`CopyEngine::drain`]: no copy can run any more,
    /// and the caller becomes the last user of the target inside the engine.
    pub fn release_target(&self) -> Option<Arc<dyn BlockDevice>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Source length captured at start
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True for an empty source
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Cluster size in bytes
    pub fn cluster_size(&self) -> u64 {
        self.bitmap.cluster_size()
    }

    /// Copied-cluster bitmap
    pub fn bitmap(&self) -> &DirtyBitmap {
        &self.bitmap
    }

    /// Number of copies currently registered
    pub fn in_flight(&self) -> usize {
        self.in_flight.in_flight()
    }

    /// Bytes transferred or zeroed on the target so far
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Acquire)
    }

    /// Clusters found all-zero and written as zeroes
    pub fn zero_clusters(&self) -> u64 {
        self.zero_clusters.load(Ordering::Acquire)
    }

    /// Clusters marked copied without valid data, in order of skipping
    pub fn skipped_clusters(&self) -> Vec<u64> {
        self.skipped.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Copy every uncopied cluster covering `[offset, offset + len)`.
    ///
    /// Returns the number of bytes written to the target. Clusters already
    /// marked copied cost no I/O. A failure the policy wants skipped marks
    /// the cluster copied and the copy continues; any other failure stops
    /// here and leaves the cluster unmarked.
    pub async fn copy_range(&self, offset: u64, len: u64) -> Result<u64, CopyFailure> {
        let closed = self.gate.read().await;
        if *closed {
            return Ok(0);
        }
        let Some(target) = self.target() else {
            return Ok(0);
        };

        let (start, end) = self.bitmap.cluster_range(offset, len);
        if start == end {
            return Ok(0);
        }

        let _registration = self.in_flight.lock(start, end).await;
        let mut scratch: Option<Vec<u8>> = None;
        let mut copied = 0;

        for cluster in start..end {
            if self.bitmap.is_copied(cluster) {
                tracing::debug!("Cluster {} already copied, skipping", cluster);
                continue;
            }
            copied += self.copy_cluster(target.as_ref(), cluster, &mut scratch).await?;
        }

        Ok(copied)
    }

    async fn copy_cluster(
        &self,
        target: &dyn BlockDevice,
        cluster: u64,
        scratch: &mut Option<Vec<u8>>,
    ) -> Result<u64, CopyFailure> {
        let cluster_size = self.cluster_size();
        let offset = cluster * cluster_size;
        let valid = cluster_size.min(self.len - offset);

        tracing::debug!("Copying cluster {} ({} bytes at {})", cluster, valid, offset);

        let buf = scratch.get_or_insert_with(|| vec![0u8; cluster_size as usize]);
        let data = &mut buf[..valid as usize];

        if let Err(e) = self.source.read_at(offset, data).await {
            return self.handle_error(cluster, offset, IoSide::Source, e);
        }

        let zero = is_zero(data);
        let written = if zero {
            target.write_zeroes(offset, valid).await
        } else {
            target.write_at(offset, data).await
        };
        if let Err(e) = written {
            return self.handle_error(cluster, offset, IoSide::Target, e);
        }

        self.bitmap.mark_copied(cluster);
        if zero {
            self.zero_clusters.fetch_add(1, Ordering::AcqRel);
        }
        self.bytes_copied.fetch_add(valid, Ordering::AcqRel);
        tracing::debug!("Cluster {} done", cluster);
        Ok(valid)
    }

    fn handle_error(
        &self,
        cluster: u64,
        offset: u64,
        side: IoSide,
        error: io::Error,
    ) -> Result<u64, CopyFailure> {
        let action = self.policy.decide(side == IoSide::Source, &error);
        tracing::warn!(
            "{} error at cluster {} (offset {}): {} -> {:?}",
            side,
            cluster,
            offset,
            error,
            action
        );

        if action == ErrorAction::SkipAndContinue {
            self.bitmap.mark_copied(cluster);
            self.skipped
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(cluster);
            return Ok(0);
        }

        let error = match side {
            IoSide::Source => BackupError::SourceRead {
                cluster,
                offset,
                source: error,
            },
            IoSide::Target => BackupError::TargetWrite {
                cluster,
                offset,
                source: error,
            },
        };
        Err(CopyFailure {
            side,
            action,
            error,
        })
    }

    /// Wait for every running copy to finish and refuse new ones.
    ///
    /// After this returns no copy touches either device again and the
    /// in-flight registry is empty.
    pub async fn drain(&self) {
        let mut closed = self.gate.write().await;
        *closed = true;
        debug_assert!(self.in_flight.is_empty());
    }

    /// Whether [`CopyEngine::drain`] has completed
    pub async fn is_drained(&self) -> bool {
        *self.gate.read().await
    }
}

/// Write hook that pushes the old content of a range to the target before
/// the source is overwritten.
///
/// Holds the engine weakly so the source's interceptor list never keeps a
/// finished job alive.
pub struct CowInterceptor {
    engine: Weak<CopyEngine>,
}

impl CowInterceptor {
    /// Create a hook feeding `engine`
    pub fn new(engine: &Arc<CopyEngine>) -> Self {
        Self {
            engine: Arc::downgrade(engine),
        }
    }
}

#[async_trait]
impl WriteInterceptor for CowInterceptor {
    async fn before_write(&self, offset: u64, len: u64) -> io::Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };

        match engine.copy_range(offset, len).await {
            Ok(_) => Ok(()),
            Err(failure) => {
                tracing::warn!(
                    "Refusing write of {} bytes at {}: {}",
                    len,
                    offset,
                    failure.error
                );
                Err(failure.into_io_error())
            }
        }
    }
}

fn is_zero(buf: &[u8]) -> bool {
    let mut words = buf.chunks_exact(8);
    let mut word = [0u8; 8];
    let zero_words = words.by_ref().all(|chunk| {
        word.copy_from_slice(chunk);
        u64::from_ne_bytes(word) == 0
    });
    zero_words && words.remainder().iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OnError;
    use crate::device::{FaultOp, MemoryDevice};
    use std::time::Duration;

    const CLUSTER: u64 = 64 * 1024;

    fn patterned(clusters: u64) -> Vec<u8> {
        (0..clusters * CLUSTER).map(|i| (i / CLUSTER + 1) as u8).collect()
    }

    fn engine(
        source: &Arc<MemoryDevice>,
        target: &Arc<MemoryDevice>,
        policy: ErrorPolicy,
    ) -> CopyEngine {
        let len = source.contents().len() as u64;
        CopyEngine::new(source.clone(), target.clone(), len, CLUSTER, policy)
    }

    #[test]
    fn test_is_zero() {
        assert!(is_zero(&[]));
        assert!(is_zero(&vec![0u8; 4099]));
        let mut buf = vec![0u8; 4099];
        buf[4098] = 1;
        assert!(!is_zero(&buf));
        buf[4098] = 0;
        buf[3] = 1;
        assert!(!is_zero(&buf));
    }

    #[tokio::test]
    async fn test_copy_range_copies_and_marks() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(4)));
        let target = Arc::new(MemoryDevice::new("dst", 4 * CLUSTER));
        let engine = engine(&source, &target, ErrorPolicy::default());

        let copied = engine.copy_range(CLUSTER + 10, CLUSTER).await.unwrap();
        assert_eq!(copied, 2 * CLUSTER);
        assert!(!engine.bitmap().is_copied(0));
        assert!(engine.bitmap().is_copied(1));
        assert!(engine.bitmap().is_copied(2));
        assert_eq!(engine.bytes_copied(), 2 * CLUSTER);

        let contents = target.contents();
        let middle = CLUSTER as usize..3 * CLUSTER as usize;
        assert_eq!(&contents[middle.clone()], &patterned(4)[middle]);
        assert!(engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_second_copy_is_noop() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(2)));
        let target = Arc::new(MemoryDevice::new("dst", 2 * CLUSTER));
        let engine = engine(&source, &target, ErrorPolicy::default());

        engine.copy_range(0, CLUSTER).await.unwrap();
        let reads = source.stats().reads.load(Ordering::Relaxed);
        let writes = target.stats().writes.load(Ordering::Relaxed);

        assert_eq!(engine.copy_range(0, CLUSTER).await.unwrap(), 0);
        assert_eq!(source.stats().reads.load(Ordering::Relaxed), reads);
        assert_eq!(target.stats().writes.load(Ordering::Relaxed), writes);
    }

    #[tokio::test]
    async fn test_zero_cluster_uses_write_zeroes() {
        let mut data = patterned(3);
        data[CLUSTER as usize..2 * CLUSTER as usize].fill(0);
        let source = Arc::new(MemoryDevice::with_data("src", data));
        let target = Arc::new(MemoryDevice::with_data("dst", vec![0xFF; 3 * CLUSTER as usize]));
        let engine = engine(&source, &target, ErrorPolicy::default());

        engine.copy_range(0, 3 * CLUSTER).await.unwrap();
        assert_eq!(target.stats().write_zeroes.load(Ordering::Relaxed), 1);
        assert_eq!(target.stats().writes.load(Ordering::Relaxed), 2);
        assert_eq!(engine.zero_clusters(), 1);
        assert!(target.contents()[CLUSTER as usize..2 * CLUSTER as usize].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_partial_last_cluster() {
        let len = 2 * CLUSTER + 4096;
        let source = Arc::new(MemoryDevice::with_data("src", vec![7u8; len as usize]));
        let target = Arc::new(MemoryDevice::new("dst", len));
        let engine = engine(&source, &target, ErrorPolicy::default());

        assert_eq!(engine.copy_range(0, len).await.unwrap(), len);
        assert!(engine.bitmap().is_complete());
        assert_eq!(target.contents(), source.contents());
    }

    #[tokio::test]
    async fn test_read_error_report_leaves_cluster_unmarked() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(2)));
        let target = Arc::new(MemoryDevice::new("dst", 2 * CLUSTER));
        source.inject_fault(FaultOp::Read, CLUSTER..2 * CLUSTER, None, io::ErrorKind::Other);
        let engine = engine(&source, &target, ErrorPolicy::default());

        let failure = engine.copy_range(0, 2 * CLUSTER).await.unwrap_err();
        assert!(failure.is_read());
        assert_eq!(failure.action, ErrorAction::Abort);
        assert_eq!(failure.error.cluster(), Some(1));
        assert!(engine.bitmap().is_copied(0));
        assert!(!engine.bitmap().is_copied(1));
        assert!(engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_ignore_marks_and_records_skip() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(3)));
        let target = Arc::new(MemoryDevice::new("dst", 3 * CLUSTER));
        target.inject_fault(FaultOp::Write, CLUSTER..2 * CLUSTER, None, io::ErrorKind::Other);
        let engine = engine(&source, &target, ErrorPolicy::new(OnError::Report, OnError::Ignore));

        let copied = engine.copy_range(0, 3 * CLUSTER).await.unwrap();
        assert_eq!(copied, 2 * CLUSTER);
        assert!(engine.bitmap().is_complete());
        assert_eq!(engine.skipped_clusters(), vec![1]);
    }

    #[tokio::test]
    async fn test_enospc_pauses() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(1)));
        let target = Arc::new(MemoryDevice::new("dst", CLUSTER));
        target.inject_fault(FaultOp::Write, 0..CLUSTER, Some(1), io::ErrorKind::StorageFull);
        let engine = engine(&source, &target, ErrorPolicy::new(OnError::Report, OnError::Enospc));

        let failure = engine.copy_range(0, CLUSTER).await.unwrap_err();
        assert_eq!(failure.side, IoSide::Target);
        assert_eq!(failure.action, ErrorAction::PauseForIntervention);
        assert_eq!(failure.into_io_error().kind(), io::ErrorKind::StorageFull);

        // Retrying the same cluster succeeds once the fault is gone
        assert_eq!(engine.copy_range(0, CLUSTER).await.unwrap(), CLUSTER);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_copies_transfer_once() {
        let source = Arc::new(
            MemoryDevice::with_data("src", patterned(8)).with_io_delay(Duration::from_millis(2)),
        );
        let target = Arc::new(MemoryDevice::new("dst", 8 * CLUSTER));
        let engine = Arc::new(engine(&source, &target, ErrorPolicy::default()));

        let tasks: Vec<_> = (0..24u64)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.copy_range((i % 8) * CLUSTER, 2 * CLUSTER).await })
            })
            .collect();
        for t in futures::future::join_all(tasks).await {
            t.unwrap().unwrap();
        }

        assert_eq!(source.max_overlapping_reads(), 1);
        assert_eq!(source.stats().reads.load(Ordering::Relaxed), 8);
        assert_eq!(engine.bytes_copied(), 8 * CLUSTER);
        assert_eq!(target.contents(), source.contents());
    }

    #[tokio::test]
    async fn test_drain_closes_engine() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(2)));
        let target = Arc::new(MemoryDevice::new("dst", 2 * CLUSTER));
        let engine = engine(&source, &target, ErrorPolicy::default());

        engine.drain().await;
        assert!(engine.is_drained().await);
        assert_eq!(engine.copy_range(0, 2 * CLUSTER).await.unwrap(), 0);
        assert_eq!(source.stats().reads.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_running_copy() {
        let source = Arc::new(
            MemoryDevice::with_data("src", patterned(1)).with_io_delay(Duration::from_millis(50)),
        );
        let target = Arc::new(MemoryDevice::new("dst", CLUSTER));
        let engine = Arc::new(engine(&source, &target, ErrorPolicy::default()));

        let copy = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.copy_range(0, CLUSTER).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.drain().await;
        // The copy that was running when the drain began has completed
        assert!(engine.bitmap().is_copied(0));
        assert_eq!(copy.await.unwrap().unwrap(), CLUSTER);
    }

    #[tokio::test]
    async fn test_interceptor_copies_before_write() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(4)));
        let target = Arc::new(MemoryDevice::new("dst", 4 * CLUSTER));
        let engine = Arc::new(engine(&source, &target, ErrorPolicy::default()));

        let id = source
            .register_write_interceptor(Arc::new(CowInterceptor::new(&engine)))
            .unwrap();
        source.write_at(2 * CLUSTER + 100, &[0xAA; 512]).await.unwrap();

        assert!(engine.bitmap().is_copied(2));
        assert_eq!(engine.bitmap().count_copied(), 1);
        // Target holds the pre-write content
        assert!(target.contents()[2 * CLUSTER as usize..3 * CLUSTER as usize]
            .iter()
            .all(|&b| b == 3));
        assert!(source.unregister_write_interceptor(id));
    }

    #[tokio::test]
    async fn test_interceptor_fails_write_on_abort() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(2)));
        let target = Arc::new(MemoryDevice::new("dst", 2 * CLUSTER));
        target.inject_fault(FaultOp::Write, 0..CLUSTER, None, io::ErrorKind::Other);
        let engine = Arc::new(engine(&source, &target, ErrorPolicy::default()));

        source
            .register_write_interceptor(Arc::new(CowInterceptor::new(&engine)))
            .unwrap();
        assert!(source.write_at(0, &[0xAA; 512]).await.is_err());
        // The source write was not applied
        assert_eq!(source.contents()[0], 1);
        assert!(!engine.bitmap().is_copied(0));
    }
}
