//! Progress reporter implementation
//!
//! A status spinner shows the job state and a byte bar shows how much of
//! the volume has reached the target, with throughput and ETA.

use crate::core::{BackupJobHandle, JobInfo, JobReport, JobState};
use crate::device::IoStatus;
use crate::error::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

/// How often a followed job is polled
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Progress display for one backup job
pub struct ProgressReporter {
    multi: MultiProgress,
    status: ProgressBar,
    bytes_bar: ProgressBar,
    start_time: Instant,
    enabled: bool,
}

impl ProgressReporter {
    /// Create a reporter for a volume of `total_bytes`
    pub fn new(total_bytes: u64) -> Self {
        let multi = MultiProgress::new();

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        status.enable_steady_tick(Duration::from_millis(120));

        let bytes_bar = multi.add(ProgressBar::new(total_bytes));
        bytes_bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bytes_bar.set_prefix("Backup");

        Self {
            multi,
            status,
            bytes_bar,
            start_time: Instant::now(),
            enabled: true,
        }
    }

    /// Create a reporter that draws nothing (quiet mode, JSON output)
    pub fn disabled() -> Self {
        let mut reporter = Self::new(0);
        reporter.enabled = false;
        reporter.status.disable_steady_tick();
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// Whether anything is drawn
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Refresh from a job snapshot
    pub fn update(&self, info: &JobInfo) {
        self.bytes_bar.set_length(info.len);
        self.bytes_bar.set_position(info.offset);
        self.status.set_message(status_line(info));
    }

    /// Bytes shown as done
    pub fn position(&self) -> u64 {
        self.bytes_bar.position()
    }

    /// Elapsed time since the reporter was created
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finish progress with success message
    pub fn finish_success(&self, message: &str) {
        self.status.finish_with_message(format!("✓ {}", message));
        self.bytes_bar.finish();
    }

    /// Finish progress with error message
    pub fn finish_error(&self, message: &str) {
        self.status.finish_with_message(format!("✗ {}", message));
        self.bytes_bar.abandon();
    }

    /// Finish according to a job's final report
    pub fn finish_with_report(&self, report: &JobReport) {
        let copied = humansize::format_size(report.bytes_copied, humansize::BINARY);
        match (&report.error, report.is_consistent()) {
            (Some(error), _) => self.finish_error(error),
            (None, true) => self.finish_success(&format!("Backup complete, {} copied", copied)),
            (None, false) if report.is_success() => self.finish_error(&format!(
                "Backup complete with {} skipped cluster(s)",
                report.skipped_clusters.len()
            )),
            (None, false) => self.finish_error(&format!("Backup cancelled after {}", copied)),
        }
    }
}

fn status_line(info: &JobInfo) -> String {
    let speed = if info.speed == 0 {
        "unlimited".to_string()
    } else {
        format!("{}/s", humansize::format_size(info.speed, humansize::BINARY))
    };
    let mut line = format!("{} [{}] speed {}", info.device, info.state, speed);
    if info.state == JobState::Paused && info.io_status != IoStatus::Ok {
        line.push_str(&format!(", waiting for intervention ({:?})", info.io_status));
    }
    line
}

/// Poll `handle` into `reporter` until the job has drained, then return its report
pub async fn follow_job(
    handle: &BackupJobHandle,
    reporter: &ProgressReporter,
) -> Result<JobReport> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let finished = handle.wait();
    tokio::pin!(finished);

    loop {
        tokio::select! {
            report = &mut finished => {
                let report = report?;
                reporter.update(&handle.info());
                reporter.finish_with_report(&report);
                return Ok(report);
            }
            _ = ticker.tick() => reporter.update(&handle.info()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{start_backup, BackupOptions};
    use crate::device::MemoryDevice;
    use std::sync::Arc;

    fn info(state: JobState, io_status: IoStatus) -> JobInfo {
        JobInfo {
            job_type: "backup".to_string(),
            device: "vda".to_string(),
            len: 1000,
            offset: 250,
            speed: 0,
            state,
            busy: true,
            paused: state == JobState::Paused,
            io_status,
        }
    }

    #[test]
    fn test_update_sets_position() {
        let reporter = ProgressReporter::disabled();
        assert!(!reporter.is_enabled());
        reporter.update(&info(JobState::Running, IoStatus::Ok));
        assert_eq!(reporter.position(), 250);
    }

    #[test]
    fn test_status_line() {
        let line = status_line(&info(JobState::Running, IoStatus::Ok));
        assert_eq!(line, "vda [running] speed unlimited");

        let line = status_line(&info(JobState::Paused, IoStatus::NoSpace));
        assert!(line.contains("waiting for intervention"));
    }

    #[tokio::test]
    async fn test_follow_job_reaches_end() {
        let source = Arc::new(MemoryDevice::with_data("src", vec![3u8; 256 * 1024]));
        let target = Arc::new(MemoryDevice::new("dst", 256 * 1024));
        let handle = start_backup(source, target, BackupOptions::default(), |_| {})
            .await
            .unwrap();

        let reporter = ProgressReporter::disabled();
        let report = follow_job(&handle, &reporter).await.unwrap();
        assert!(report.is_success());
        assert_eq!(reporter.position(), 256 * 1024);
    }
}
