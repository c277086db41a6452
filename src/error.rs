//! Error types for BlockBackup
//!
//! Configuration problems are reported synchronously to whoever starts or
//! reconfigures a job. I/O failures during a cluster copy travel back up as
//! values and are mapped to a terminal status by the job orchestrator only.

use std::io;
use thiserror::Error;

/// Main error type for BlockBackup operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// A parameter was out of range (e.g. negative speed)
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An error policy needs I/O status tracking the device cannot provide
    #[error("Invalid parameter '{param}': device '{device}' does not support I/O status tracking")]
    IoStatusUnsupported { param: &'static str, device: String },

    /// Target cannot hold the source
    #[error("Target too small: source is {source_len} bytes, target is {target_len} bytes")]
    TargetTooSmall { source_len: u64, target_len: u64 },

    /// Reading a cluster from the source failed
    #[error("Read error on source at cluster {cluster} (offset {offset}): {source}")]
    SourceRead {
        cluster: u64,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// Writing a cluster to the target failed
    #[error("Write error on target at cluster {cluster} (offset {offset}): {source}")]
    TargetWrite {
        cluster: u64,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// Device-level error outside a cluster copy (length query, open, ...)
    #[error("Device error on '{device}': {source}")]
    Device {
        device: String,
        #[source]
        source: io::Error,
    },

    /// Job already reached a terminal state
    #[error("Backup job has already finished")]
    JobFinished,

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Source and target digests differ after a backup
    #[error("Verification failed: {mismatched} of {clusters} clusters differ")]
    VerifyMismatch { clusters: u64, mismatched: u64 },
}

impl BackupError {
    /// Create an invalid parameter error
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a device error
    pub fn device(device: impl Into<String>, source: io::Error) -> Self {
        Self::Device {
            device: device.into(),
            source,
        }
    }

    /// True for errors raised while reading the source volume
    pub fn is_read_error(&self) -> bool {
        matches!(self, Self::SourceRead { .. })
    }

    /// True for errors rejected up-front at start or reconfiguration
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameter { .. }
                | Self::ConfigError(_)
                | Self::IoStatusUnsupported { .. }
                | Self::TargetTooSmall { .. }
        )
    }

    /// Underlying I/O error, if any
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::SourceRead { source, .. }
            | Self::TargetWrite { source, .. }
            | Self::Device { source, .. } => Some(source),
            _ => None,
        }
    }

    /// OS error code of the underlying failure, if there is one
    pub fn raw_os_error(&self) -> Option<i32> {
        self.io_error().and_then(io::Error::raw_os_error)
    }

    /// Cluster index the error is attached to
    pub fn cluster(&self) -> Option<u64> {
        match self {
            Self::SourceRead { cluster, .. } | Self::TargetWrite { cluster, .. } => Some(*cluster),
            _ => None,
        }
    }
}

/// Result type alias for BlockBackup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Extension trait for adding device context to std::io::Result
pub trait IoResultExt<T> {
    /// Add device context to an I/O error
    fn with_device(self, device: impl Into<String>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_device(self, device: impl Into<String>) -> Result<T> {
        self.map_err(|e| BackupError::device(device, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_device() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "no such volume");
        let result: io::Result<()> = Err(io_err);
        let err = result.with_device("disk0").unwrap_err();
        assert!(err.to_string().contains("disk0"));
        assert!(err.io_error().is_some());
    }

    #[test]
    fn test_error_classification() {
        let read = BackupError::SourceRead {
            cluster: 3,
            offset: 3 * 65536,
            source: io::Error::from_raw_os_error(5),
        };
        assert!(read.is_read_error());
        assert!(!read.is_config_error());
        assert_eq!(read.raw_os_error(), Some(5));
        assert_eq!(read.cluster(), Some(3));

        let speed = BackupError::invalid_parameter("speed", "must not be negative");
        assert!(speed.is_config_error());
        assert_eq!(speed.raw_os_error(), None);
    }
}
