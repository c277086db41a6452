//! Backup job orchestration
//!
//! [`start_backup`] validates the request, hooks the source's write path and
//! spawns the background scan. The scan walks every cluster once, throttled
//! by [`RateLimit`], and hands each uncopied cluster to the [`CopyEngine`].
//! Live writes to the source go through the same engine via the hook, so a
//! cluster is never transferred twice.
//!
//! When the scan ends (finished, failed or cancelled) the job removes the
//! hook, drains in-flight copies and only then reports, exactly once,
//! through the completion callback and [`BackupJobHandle::wait`].

use super::copier::{CopyEngine, CopyFailure, CowInterceptor, DEFAULT_CLUSTER_SIZE};
use super::policy::{ErrorAction, ErrorPolicy, IoSide};
use super::throttle::RateLimit;
use crate::config::{validate_cluster_size, OnError};
use crate::device::{BlockDevice, InterceptorId, IoStatus};
use crate::error::{BackupError, IoResultExt, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Parameters of a backup job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOptions {
    /// Scan speed in bytes per second (0 = unlimited, negative is rejected)
    pub speed: i64,
    /// Action on source read errors
    pub on_source_error: OnError,
    /// Action on target write errors
    pub on_target_error: OnError,
    /// Copy granularity in bytes
    pub cluster_size: u64,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            speed: 0,
            on_source_error: OnError::Report,
            on_target_error: OnError::Report,
            cluster_size: DEFAULT_CLUSTER_SIZE,
        }
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Validated, scan not yet running
    Starting,
    /// Scanning
    Running,
    /// Suspended by the user or by an error policy
    Paused,
    /// Scan over, waiting for in-flight copies
    Draining,
    /// Every cluster copied
    Completed,
    /// Stopped by an error
    Failed,
    /// Cancelled before the scan finished
    Cancelled,
}

impl JobState {
    /// Whether the job has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Final status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Every cluster copied
    Completed,
    /// Stopped by an error
    Failed,
    /// Cancelled before the scan finished
    Cancelled,
}

impl From<JobStatus> for JobState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// Snapshot of a running job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    /// Always `"backup"`
    #[serde(rename = "type")]
    pub job_type: String,
    /// Source device name
    pub device: String,
    /// Bytes to copy
    pub len: u64,
    /// Bytes copied so far
    pub offset: u64,
    /// Configured speed in bytes per second
    pub speed: u64,
    /// Current state
    pub state: JobState,
    /// Whether the job is doing I/O rather than sleeping or paused
    pub busy: bool,
    /// Whether the job is paused
    pub paused: bool,
    /// Error status recorded by the last error-policy pause
    pub io_status: IoStatus,
}

/// Final result of a job, delivered once it has drained
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// Terminal status
    pub status: JobStatus,
    /// Error message for failed jobs
    pub error: Option<String>,
    /// OS error code of the failure, when there is one
    pub error_code: Option<i32>,
    /// Source device name
    pub source: String,
    /// Target device name
    pub target: String,
    /// Source length captured at start
    pub len: u64,
    /// Bytes written to the target (offset)
    pub bytes_copied: u64,
    /// Cluster size in bytes
    pub cluster_size: u64,
    /// Number of clusters in the volume
    pub clusters_total: u64,
    /// Clusters marked copied, including skipped ones
    pub clusters_copied: u64,
    /// Clusters written as zeroes
    pub zero_clusters: u64,
    /// Clusters skipped after an ignored error
    pub skipped_clusters: Vec<u64>,
    /// When the job started
    pub started_at: DateTime<Utc>,
    /// When the job reached its terminal state
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    /// Whether every cluster was copied without error
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// A completed job with no skipped clusters is a point-in-time copy
    pub fn is_consistent(&self) -> bool {
        self.is_success() && self.skipped_clusters.is_empty()
    }

    /// Wall-clock duration of the job
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    /// Average throughput in bytes per second
    pub fn throughput(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            self.bytes_copied as f64 / secs
        } else {
            0.0
        }
    }

    /// Print summary to console
    pub fn print_summary(&self) {
        println!("\n=== Backup Summary ===");
        println!("Status:          {:?}", self.status);
        println!("Source:          {}", self.source);
        println!("Target:          {}", self.target);
        println!("Volume size:     {}", humansize::format_size(self.len, humansize::BINARY));
        println!(
            "Bytes copied:    {}",
            humansize::format_size(self.bytes_copied, humansize::BINARY)
        );
        println!(
            "Clusters:        {}/{} ({} zero)",
            self.clusters_copied, self.clusters_total, self.zero_clusters
        );
        println!(
            "Duration:        {}",
            humantime::format_duration(round_to_millis(self.duration()))
        );
        println!(
            "Throughput:      {}/s",
            humansize::format_size(self.throughput() as u64, humansize::BINARY)
        );

        if !self.skipped_clusters.is_empty() {
            println!(
                "\nSkipped clusters: {} (backup is NOT consistent)",
                self.skipped_clusters.len()
            );
            for cluster in self.skipped_clusters.iter().take(16) {
                println!("  cluster {} (offset {})", cluster, cluster * self.cluster_size);
            }
            if self.skipped_clusters.len() > 16 {
                println!("  ...");
            }
        }

        if let Some(error) = &self.error {
            println!("\nError: {}", error);
        }
    }
}

fn round_to_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

/// State shared between the handle and the scan task
struct JobShared {
    engine: Arc<CopyEngine>,
    state: Mutex<JobState>,
    io_status: Mutex<IoStatus>,
    speed: AtomicU64,
    cancelled: AtomicBool,
    paused: AtomicBool,
    busy: AtomicBool,
    /// Wakes the scan task on cancel, pause, resume and speed changes
    control: Notify,
}

impl JobShared {
    fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: JobState) {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            state,
        );
        if previous != state {
            tracing::info!(
                "Backup of '{}': {} -> {}",
                self.engine.source().name(),
                previous,
                state
            );
        }
    }

    fn set_io_status(&self, status: IoStatus) {
        *self.io_status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn io_status(&self) -> IoStatus {
        *self.io_status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn speed(&self) -> u64 {
        self.speed.load(Ordering::SeqCst)
    }
}

/// Handle to a running backup job
#[derive(Clone)]
pub struct BackupJobHandle {
    shared: Arc<JobShared>,
    report: watch::Receiver<Option<JobReport>>,
}

impl BackupJobHandle {
    /// Request cancellation; copies already running finish first
    pub fn cancel(&self) {
        if self.shared.state().is_terminal() {
            return;
        }
        tracing::info!("Cancelling backup of '{}'", self.shared.engine.source().name());
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.control.notify_waiters();
    }

    /// Change the scan speed in bytes per second (0 = unlimited)
    pub fn set_speed(&self, bytes_per_second: i64) -> Result<()> {
        let speed = u64::try_from(bytes_per_second)
            .map_err(|_| BackupError::invalid_parameter("speed", "must not be negative"))?;
        if self.shared.state().is_terminal() {
            return Err(BackupError::JobFinished);
        }
        self.shared.speed.store(speed, Ordering::SeqCst);
        self.shared.control.notify_waiters();
        Ok(())
    }

    /// Suspend the scan at its next checkpoint
    pub fn pause(&self) -> Result<()> {
        if self.shared.state().is_terminal() {
            return Err(BackupError::JobFinished);
        }
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.control.notify_waiters();
        Ok(())
    }

    /// Lift a user pause or an error-policy pause
    pub fn resume(&self) -> Result<()> {
        if self.shared.state().is_terminal() {
            return Err(BackupError::JobFinished);
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.control.notify_waiters();
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    /// Query the job
    pub fn info(&self) -> JobInfo {
        let shared = &self.shared;
        let state = shared.state();
        JobInfo {
            job_type: "backup".to_string(),
            device: shared.engine.source().name().to_string(),
            len: shared.engine.len(),
            offset: shared.engine.bytes_copied(),
            speed: shared.speed(),
            state,
            busy: shared.busy.load(Ordering::SeqCst),
            paused: state == JobState::Paused,
            io_status: shared.io_status(),
        }
    }

    /// Copy engine of this job (bitmap, counters)
    pub fn engine(&self) -> &Arc<CopyEngine> {
        &self.shared.engine
    }

    /// Final report, if the job has finished
    pub fn report(&self) -> Option<JobReport> {
        self.report.borrow().clone()
    }

    /// Wait for the job to finish and drain
    pub async fn wait(&self) -> Result<JobReport> {
        let mut rx = self.report.clone();
        let report = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BackupError::Cancelled)?;
        report.clone().ok_or(BackupError::Cancelled)
    }
}

/// Start a backup of `source` into `target`.
///
/// Configuration problems are returned before anything is allocated or
/// hooked. `on_complete` runs exactly once, after the job has drained.
pub async fn start_backup<F>(
    source: Arc<dyn BlockDevice>,
    target: Arc<dyn BlockDevice>,
    options: BackupOptions,
    on_complete: F,
) -> Result<BackupJobHandle>
where
    F: FnOnce(&JobReport) + Send + 'static,
{
    let speed = u64::try_from(options.speed)
        .map_err(|_| BackupError::invalid_parameter("speed", "must not be negative"))?;
    validate_cluster_size(options.cluster_size)?;

    if options.on_source_error.requires_io_status() && !source.supports_io_status() {
        return Err(BackupError::IoStatusUnsupported {
            param: "on-source-error",
            device: source.name().to_string(),
        });
    }
    if options.on_target_error.requires_io_status() && !target.supports_io_status() {
        return Err(BackupError::IoStatusUnsupported {
            param: "on-target-error",
            device: target.name().to_string(),
        });
    }

    let len = source.length().await.with_device(source.name())?;
    let target_len = target.length().await.with_device(target.name())?;
    if target_len < len {
        return Err(BackupError::TargetTooSmall {
            source_len: len,
            target_len,
        });
    }

    let policy = ErrorPolicy::new(options.on_source_error, options.on_target_error);
    let engine = Arc::new(CopyEngine::new(
        Arc::clone(&source),
        Arc::clone(&target),
        len,
        options.cluster_size,
        policy,
    ));

    let interceptor = source
        .register_write_interceptor(Arc::new(CowInterceptor::new(&engine)))
        .map_err(|e| {
            BackupError::config(format!(
                "source '{}' cannot intercept writes: {}",
                source.name(),
                e
            ))
        })?;
    target.set_io_status_tracking(true);
    let track_source = options.on_source_error.requires_io_status();
    if track_source {
        source.set_io_status_tracking(true);
    }

    tracing::info!(
        "Starting backup of '{}' ({} bytes, {} clusters) to '{}'",
        source.name(),
        len,
        engine.bitmap().total_clusters(),
        target.name()
    );

    let shared = Arc::new(JobShared {
        engine,
        state: Mutex::new(JobState::Starting),
        io_status: Mutex::new(IoStatus::Ok),
        speed: AtomicU64::new(speed),
        cancelled: AtomicBool::new(false),
        paused: AtomicBool::new(false),
        busy: AtomicBool::new(false),
        control: Notify::new(),
    });
    let (report_tx, report_rx) = watch::channel(None);

    let job = BackupJob {
        shared: Arc::clone(&shared),
        interceptor,
        track_source,
        limit: RateLimit::new(speed),
        started_at: Utc::now(),
    };
    tokio::spawn(async move {
        let report = job.run().await;
        on_complete(&report);
        report_tx.send_replace(Some(report));
    });

    Ok(BackupJobHandle {
        shared,
        report: report_rx,
    })
}

/// How the scan loop ended
enum ScanOutcome {
    Finished,
    Cancelled,
    Failed(CopyFailure),
}

/// The scan task's own state
struct BackupJob {
    shared: Arc<JobShared>,
    interceptor: InterceptorId,
    track_source: bool,
    limit: RateLimit,
    started_at: DateTime<Utc>,
}

impl BackupJob {
    async fn run(mut self) -> JobReport {
        self.shared.set_state(JobState::Running);
        self.shared.busy.store(true, Ordering::SeqCst);

        let outcome = self.scan().await;

        self.shared.busy.store(false, Ordering::SeqCst);
        self.shared.set_state(JobState::Draining);
        let flush_error = self.drain().await;

        let (status, error) = match outcome {
            ScanOutcome::Failed(failure) => (JobStatus::Failed, Some(failure.error)),
            ScanOutcome::Cancelled => (JobStatus::Cancelled, None),
            ScanOutcome::Finished => match flush_error {
                Some(e) => (JobStatus::Failed, Some(e)),
                None => (JobStatus::Completed, None),
            },
        };

        let report = self.build_report(status, error);
        self.shared.set_state(status.into());
        match status {
            JobStatus::Completed => tracing::info!(
                "Backup of '{}' completed: {} bytes copied",
                report.source,
                report.bytes_copied
            ),
            JobStatus::Cancelled => tracing::info!(
                "Backup of '{}' cancelled after {} of {} bytes",
                report.source,
                report.bytes_copied,
                report.len
            ),
            JobStatus::Failed => tracing::warn!(
                "Backup of '{}' failed: {}",
                report.source,
                report.error.as_deref().unwrap_or("unknown error")
            ),
        }
        report
    }

    async fn scan(&mut self) -> ScanOutcome {
        let engine = Arc::clone(&self.shared.engine);
        let cluster_size = engine.cluster_size();
        let total = engine.bitmap().total_clusters();
        let mut pending = 0u64;
        let mut cluster = 0u64;

        while cluster < total {
            if self.shared.is_cancelled() {
                return ScanOutcome::Cancelled;
            }
            if self.shared.is_paused() {
                if !self.park().await {
                    return ScanOutcome::Cancelled;
                }
                continue;
            }

            let speed = self.shared.speed();
            if speed != self.limit.speed() {
                self.limit.set_speed(speed);
            }
            let delay = self.limit.calculate_delay(pending);
            pending = 0;
            self.throttle(delay, speed).await;

            if self.shared.is_cancelled() {
                return ScanOutcome::Cancelled;
            }
            if engine.bitmap().is_copied(cluster) {
                cluster += 1;
                continue;
            }

            match engine.copy_range(cluster * cluster_size, cluster_size).await {
                Ok(copied) => {
                    pending += copied;
                    cluster += 1;
                }
                Err(failure) if failure.action == ErrorAction::PauseForIntervention => {
                    self.pause_on_error(&failure);
                    if !self.park().await {
                        return ScanOutcome::Cancelled;
                    }
                    // Retry the same cluster; it may have been copied meanwhile
                }
                Err(failure) => return ScanOutcome::Failed(failure),
            }
        }

        ScanOutcome::Finished
    }

    /// Sleep for the rate-limit delay; cancellation and speed changes cut it short
    async fn throttle(&self, delay: Duration, speed: u64) {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }

        self.shared.busy.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            let notified = self.shared.control.notified();
            if self.shared.is_cancelled() || self.shared.speed() != speed {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = notified => {}
            }
        }
        self.shared.busy.store(true, Ordering::SeqCst);
    }

    fn pause_on_error(&self, failure: &CopyFailure) {
        let engine = &self.shared.engine;
        let device = match failure.side {
            IoSide::Source => Some(Arc::clone(engine.source())),
            IoSide::Target => engine.target(),
        };
        if let Some(e) = failure.io_error() {
            if let Some(device) = device {
                device.record_io_error(e);
            }
            self.shared.set_io_status(IoStatus::from_error(e));
        }
        tracing::warn!("Pausing backup for intervention: {}", failure.error);
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Wait while paused; returns false if cancelled instead of resumed
    async fn park(&self) -> bool {
        self.shared.set_state(JobState::Paused);
        self.shared.busy.store(false, Ordering::SeqCst);

        loop {
            // Registered before the check so a resume in between is not lost
            let notified = self.shared.control.notified();
            if self.shared.is_cancelled() || !self.shared.is_paused() {
                break;
            }
            notified.await;
        }

        self.shared.busy.store(true, Ordering::SeqCst);
        if self.shared.is_cancelled() {
            return false;
        }

        let engine = &self.shared.engine;
        engine.source().reset_io_status();
        if let Some(target) = engine.target() {
            target.reset_io_status();
        }
        self.shared.set_io_status(IoStatus::Ok);
        self.shared.set_state(JobState::Running);
        true
    }

    /// Unhook the source, wait for in-flight copies and release the target
    async fn drain(&self) -> Option<BackupError> {
        let engine = &self.shared.engine;
        engine.source().unregister_write_interceptor(self.interceptor);
        engine.drain().await;

        if self.track_source {
            engine.source().set_io_status_tracking(false);
        }
        let target = engine.release_target()?;
        target.set_io_status_tracking(false);
        target.flush().await.with_device(target.name()).err()
    }

    fn build_report(&self, status: JobStatus, error: Option<BackupError>) -> JobReport {
        let engine = &self.shared.engine;
        JobReport {
            status,
            error_code: error.as_ref().and_then(BackupError::raw_os_error),
            error: error.map(|e| e.to_string()),
            source: engine.source().name().to_string(),
            target: engine.target_name().to_string(),
            len: engine.len(),
            bytes_copied: engine.bytes_copied(),
            cluster_size: engine.cluster_size(),
            clusters_total: engine.bitmap().total_clusters(),
            clusters_copied: engine.bitmap().count_copied(),
            zero_clusters: engine.zero_clusters(),
            skipped_clusters: engine.skipped_clusters(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FaultOp, MemoryDevice};
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const CLUSTER: u64 = 64 * 1024;

    fn patterned(clusters: u64) -> Vec<u8> {
        (0..clusters * CLUSTER).map(|i| (i / CLUSTER + 1) as u8).collect()
    }

    fn devices(data: Vec<u8>) -> (Arc<MemoryDevice>, Arc<MemoryDevice>) {
        let len = data.len() as u64;
        (
            Arc::new(MemoryDevice::with_data("src", data)),
            Arc::new(MemoryDevice::new("dst", len)),
        )
    }

    async fn start(
        source: &Arc<MemoryDevice>,
        target: &Arc<MemoryDevice>,
        options: BackupOptions,
    ) -> (BackupJobHandle, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = start_backup(source.clone(), target.clone(), options, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        (handle, calls)
    }

    async fn finish(handle: &BackupJobHandle) -> JobReport {
        tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("job should finish")
            .unwrap()
    }

    async fn wait_for_state(handle: &BackupJobHandle, state: JobState) {
        for _ in 0..2000 {
            if handle.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never reached {:?} (now {:?})", state, handle.state());
    }

    fn throttled(clusters_per_second: u64) -> BackupOptions {
        BackupOptions {
            speed: (clusters_per_second * CLUSTER) as i64,
            ..BackupOptions::default()
        }
    }

    #[tokio::test]
    async fn test_full_backup() {
        let mut data = patterned(10);
        data[3 * CLUSTER as usize..4 * CLUSTER as usize].fill(0);
        let (source, target) = devices(data);

        let (handle, calls) = start(&source, &target, BackupOptions::default()).await;
        let report = finish(&handle).await;

        assert_eq!(report.status, JobStatus::Completed);
        assert!(report.is_consistent());
        assert_eq!(report.clusters_total, 10);
        assert_eq!(report.clusters_copied, 10);
        assert_eq!(report.zero_clusters, 1);
        assert_eq!(report.bytes_copied, 10 * CLUSTER);
        assert_eq!(target.contents(), source.contents());
        assert_eq!(target.stats().write_zeroes.load(Ordering::Relaxed), 1);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), JobState::Completed);
        assert_eq!(source.interceptor_count(), 0);
        assert_eq!(handle.engine().in_flight(), 0);
        assert!(handle.engine().is_drained().await);

        // The finished job no longer holds the target
        assert!(handle.engine().target().is_none());
        assert_eq!(Arc::strong_count(&target), 1);
        assert_eq!(report.target, "dst");
    }

    #[tokio::test]
    async fn test_live_write_copies_cluster_first() {
        // 640 KiB volume, 10 clusters
        let (source, target) = devices(patterned(10));
        let (handle, _) = start(&source, &target, throttled(10)).await;

        source.write_at(7 * CLUSTER + 100, &[0xEE; 4096]).await.unwrap();
        assert!(handle.engine().bitmap().is_copied(7));
        handle.set_speed(0).unwrap();

        let report = finish(&handle).await;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.clusters_copied, 10);
        assert_eq!(handle.info().offset, 640 * 1024);

        // Each cluster was read exactly once: the scan's pass over 7 was a no-op
        assert_eq!(source.stats().reads.load(Ordering::Relaxed), 10);
        // The target holds the content from before the write
        assert_eq!(target.contents(), patterned(10));
        assert_eq!(source.contents()[(7 * CLUSTER + 100) as usize], 0xEE);
    }

    #[tokio::test]
    async fn test_empty_source_completes() {
        let (source, target) = devices(Vec::new());
        let (handle, calls) = start(&source, &target, BackupOptions::default()).await;
        let report = finish(&handle).await;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.clusters_total, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_speed_rejected() {
        let (source, target) = devices(patterned(2));
        let options = BackupOptions {
            speed: -1,
            ..BackupOptions::default()
        };
        let err = start_backup(source.clone(), target.clone(), options, |_| {})
            .await
            .err()
            .unwrap();
        assert!(err.is_config_error());
        assert_eq!(source.interceptor_count(), 0);

        let (handle, _) = start(&source, &target, throttled(1)).await;
        assert!(handle.set_speed(-5).unwrap_err().is_config_error());
        handle.cancel();
        finish(&handle).await;
    }

    #[tokio::test]
    async fn test_stop_policy_needs_io_status() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(2)));
        let target = Arc::new(MemoryDevice::new("dst", 2 * CLUSTER).with_io_status_support(false));
        let options = BackupOptions {
            on_target_error: OnError::Stop,
            ..BackupOptions::default()
        };

        let err = start_backup(source.clone(), target.clone(), options, |_| {})
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackupError::IoStatusUnsupported { param: "on-target-error", .. }));
        assert_eq!(source.interceptor_count(), 0);
    }

    #[tokio::test]
    async fn test_target_too_small() {
        let source = Arc::new(MemoryDevice::with_data("src", patterned(4)));
        let target = Arc::new(MemoryDevice::new("dst", 3 * CLUSTER));
        let err = start_backup(source.clone(), target, BackupOptions::default(), |_| {})
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackupError::TargetTooSmall { .. }));
        assert_eq!(source.interceptor_count(), 0);
    }

    #[tokio::test]
    async fn test_read_error_report_fails_job() {
        let (source, target) = devices(patterned(6));
        source.inject_fault(FaultOp::Read, 4 * CLUSTER..5 * CLUSTER, None, io::ErrorKind::Other);

        let (handle, calls) = start(&source, &target, BackupOptions::default()).await;
        let report = finish(&handle).await;

        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("cluster 4"));
        assert_eq!(report.clusters_copied, 4);
        assert!(!handle.engine().bitmap().is_copied(4));
        assert_eq!(handle.engine().in_flight(), 0);
        assert_eq!(source.interceptor_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_ignore_policy_completes_inconsistent() {
        let (source, target) = devices(patterned(4));
        source.inject_fault(FaultOp::Read, 2 * CLUSTER..3 * CLUSTER, None, io::ErrorKind::Other);
        let options = BackupOptions {
            on_source_error: OnError::Ignore,
            ..BackupOptions::default()
        };

        let (handle, _) = start(&source, &target, options).await;
        let report = finish(&handle).await;

        assert_eq!(report.status, JobStatus::Completed);
        assert!(!report.is_consistent());
        assert_eq!(report.skipped_clusters, vec![2]);
        assert_eq!(report.clusters_copied, 4);
        assert_eq!(report.bytes_copied, 3 * CLUSTER);
    }

    #[tokio::test]
    async fn test_enospc_pauses_until_resumed() {
        let (source, target) = devices(patterned(6));
        target.inject_fault(
            FaultOp::Write,
            3 * CLUSTER..4 * CLUSTER,
            None,
            io::ErrorKind::StorageFull,
        );
        let options = BackupOptions {
            on_target_error: OnError::Enospc,
            ..BackupOptions::default()
        };

        let (handle, calls) = start(&source, &target, options).await;
        wait_for_state(&handle, JobState::Paused).await;

        let info = handle.info();
        assert!(info.paused);
        assert!(!info.busy);
        assert_eq!(info.io_status, IoStatus::NoSpace);
        assert_eq!(target.io_status(), IoStatus::NoSpace);
        assert!(!handle.engine().bitmap().is_copied(3));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Space freed up: retry the same cluster
        target.clear_faults();
        handle.resume().unwrap();
        let report = finish(&handle).await;

        assert_eq!(report.status, JobStatus::Completed);
        assert!(report.is_consistent());
        assert_eq!(target.contents(), source.contents());
        assert_eq!(handle.info().io_status, IoStatus::Ok);
    }

    #[tokio::test]
    async fn test_cancel_while_error_paused() {
        let (source, target) = devices(patterned(4));
        source.inject_fault(FaultOp::Read, CLUSTER..2 * CLUSTER, None, io::ErrorKind::Other);
        let options = BackupOptions {
            on_source_error: OnError::Stop,
            ..BackupOptions::default()
        };

        let (handle, calls) = start(&source, &target, options).await;
        wait_for_state(&handle, JobState::Paused).await;
        assert_eq!(source.io_status(), IoStatus::Failed);
        // Reported even though the target itself is healthy
        assert_eq!(handle.info().io_status, IoStatus::Failed);
        assert_eq!(target.io_status(), IoStatus::Ok);

        handle.cancel();
        let report = finish(&handle).await;
        assert_eq!(report.status, JobStatus::Cancelled);
        assert_eq!(report.clusters_copied, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_scan() {
        let (source, target) = devices(patterned(32));
        let (handle, calls) = start(&source, &target, throttled(20)).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.cancel();
        let report = finish(&handle).await;

        assert_eq!(report.status, JobStatus::Cancelled);
        assert!(report.clusters_copied > 0);
        assert!(report.clusters_copied < 32);
        assert_eq!(report.bytes_copied, report.clusters_copied * CLUSTER);
        assert_eq!(handle.engine().in_flight(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Later control calls are rejected, cancel is a no-op
        handle.cancel();
        assert!(matches!(handle.pause(), Err(BackupError::JobFinished)));
    }

    #[tokio::test]
    async fn test_user_pause_and_resume() {
        let (source, target) = devices(patterned(16));
        let (handle, _) = start(&source, &target, throttled(20)).await;

        handle.pause().unwrap();
        wait_for_state(&handle, JobState::Paused).await;
        let copied = handle.info().offset;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.info().offset, copied);

        handle.set_speed(0).unwrap();
        handle.resume().unwrap();
        let report = finish(&handle).await;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(target.contents(), source.contents());
    }

    #[tokio::test]
    async fn test_speed_limit_slows_scan() {
        // 4 clusters per 100ms slice
        let (source, target) = devices(patterned(16));
        let started = Instant::now();
        let (handle, _) = start(&source, &target, throttled(40)).await;
        let report = finish(&handle).await;

        assert_eq!(report.status, JobStatus::Completed);
        assert!(started.elapsed() >= Duration::from_millis(250), "took {:?}", started.elapsed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_never_double_copy() {
        let source = Arc::new(
            MemoryDevice::with_data("src", patterned(32)).with_io_delay(Duration::from_millis(1)),
        );
        let target = Arc::new(MemoryDevice::new("dst", 32 * CLUSTER));
        let (handle, _) = start(&source, &target, BackupOptions::default()).await;

        let writers: Vec<_> = (0..16u64)
            .map(|i| {
                let source = Arc::clone(&source);
                tokio::spawn(async move {
                    // Straddle two clusters
                    let offset = ((i * 7) % 31) * CLUSTER + CLUSTER - 512;
                    source.write_at(offset, &[0xCC; 1024]).await
                })
            })
            .collect();
        for w in futures::future::join_all(writers).await {
            w.unwrap().unwrap();
        }

        let report = finish(&handle).await;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(source.max_overlapping_reads(), 1);
        assert_eq!(source.stats().reads.load(Ordering::Relaxed), 32);
        assert_eq!(target.contents(), patterned(32));
    }
}
