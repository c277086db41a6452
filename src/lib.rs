//! # BlockBackup - Live Copy-on-Write Backup of Block Volumes
//!
//! BlockBackup copies a block volume to a target while the volume stays in
//! use, and still produces the volume exactly as it was when the backup
//! started.
//!
//! ## How it works
//!
//! - **Background scan**: walks every cluster of the source once, throttled
//!   to a configurable speed
//! - **Copy-on-write hook**: every write to the source first pushes the old
//!   content of the clusters it touches to the target
//! - **Dirty bitmap**: records which clusters are on the target so each one
//!   is copied once, whichever path gets there first
//! - **In-flight registry**: overlapping copies wait for each other instead
//!   of transferring the same cluster twice
//! - **Error policies**: per-side `report`, `ignore`, `stop` or `enospc`
//! - **Zero detection**: all-zero clusters become zero writes on the target
//!
//! ## Quick Start
//!
//! ```no_run
//! use blockbackup::core::{start_backup, BackupOptions};
//! use blockbackup::device::FileDevice;
//! use std::sync::Arc;
//!
//! # async fn example() -> blockbackup::Result<()> {
//! let source = Arc::new(FileDevice::open("/var/lib/images/vm.img")?);
//! let target = Arc::new(FileDevice::create("/backup/vm.img", 10 << 30)?);
//!
//! let handle = start_backup(source, target, BackupOptions::default(), |report| {
//!     println!("backup finished: {:?}", report.status);
//! })
//! .await?;
//!
//! let report = handle.wait().await?;
//! report.print_summary();
//! # Ok(())
//! # }
//! ```
//!
//! ## Throttling and Control
//!
//! ```no_run
//! use blockbackup::config::OnError;
//! use blockbackup::core::{start_backup, BackupOptions};
//! use blockbackup::device::MemoryDevice;
//! use std::sync::Arc;
//!
//! # async fn example() -> blockbackup::Result<()> {
//! let source = Arc::new(MemoryDevice::new("vda", 64 << 20));
//! let target = Arc::new(MemoryDevice::new("backup", 64 << 20));
//!
//! let options = BackupOptions {
//!     speed: 10 << 20,
//!     on_target_error: OnError::Enospc,
//!     ..Default::default()
//! };
//! let handle = start_backup(source, target, options, |_| {}).await?;
//!
//! println!("{:?}", handle.info());
//! handle.set_speed(0)?;
//! handle.wait().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod hash;
pub mod progress;

// Re-export commonly used types
pub use config::{BackupConfig, HashAlgorithm, OnError};
pub use core::{start_backup, BackupJobHandle, BackupOptions, JobReport, JobStatus};
pub use error::{BackupError, Result};
pub use progress::ProgressReporter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use blockbackup::prelude::*;
    //! ```

    pub use crate::config::{BackupConfig, HashAlgorithm, OnError};
    pub use crate::core::{
        start_backup, BackupJobHandle, BackupOptions, JobInfo, JobReport, JobState, JobStatus,
    };
    pub use crate::device::{BlockDevice, FileDevice, IoStatus, MemoryDevice, WriteInterceptor};
    pub use crate::error::{BackupError, Result};
    pub use crate::hash::{verify_volumes, VerifyReport};
    pub use crate::progress::{follow_job, ProgressReporter};
}
