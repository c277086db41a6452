//! Block device abstraction consumed by the backup engine
//!
//! The engine only needs a narrow surface from its storage collaborators:
//! positioned reads and writes, zero writes, the device length, a hook that
//! runs before every write to the source, and optional I/O status tracking.
//! [`MemoryDevice`] and [`FileDevice`] are the two backends shipped here.

mod file;
mod memory;

pub use file::{volume_length, FileDevice};
pub use memory::{DeviceStats, FaultOp, MemoryDevice};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Callback run by a device before a write is applied.
///
/// The write does not proceed until `before_write` returns; an error fails
/// the write without touching the device.
#[async_trait]
pub trait WriteInterceptor: Send + Sync {
    /// Called with the byte range about to be overwritten
    async fn before_write(&self, offset: u64, len: u64) -> io::Result<()>;
}

/// Storage backend the backup job reads from or writes to
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Current length in bytes
    async fn length(&self) -> io::Result<u64>;

    /// Read exactly `buf.len()` bytes at `offset`
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `data` at `offset`, running registered interceptors first
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Make `len` bytes at `offset` read back as zero
    async fn write_zeroes(&self, offset: u64, len: u64) -> io::Result<()>;

    /// Flush pending writes to stable storage
    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Register a hook run before every write to this device
    fn register_write_interceptor(
        &self,
        _interceptor: Arc<dyn WriteInterceptor>,
    ) -> io::Result<InterceptorId> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "device does not support write interception",
        ))
    }

    /// Remove a hook; returns false if it was not registered
    fn unregister_write_interceptor(&self, _id: InterceptorId) -> bool {
        false
    }

    /// Whether this device can track an I/O error status
    fn supports_io_status(&self) -> bool {
        false
    }

    /// Enable or disable I/O status tracking
    fn set_io_status_tracking(&self, _enabled: bool) {}

    /// Current I/O status
    fn io_status(&self) -> IoStatus {
        IoStatus::Ok
    }

    /// Record a failure in the I/O status (no-op when tracking is off)
    fn record_io_error(&self, _error: &io::Error) {}

    /// Clear a recorded failure
    fn reset_io_status(&self) {}
}

/// Handle returned by [`BlockDevice::register_write_interceptor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

/// Ordered list of write interceptors owned by a device.
///
/// Devices embed one of these and call [`InterceptorRegistry::run_before_write`]
/// at the top of their write paths.
#[derive(Default)]
pub struct InterceptorRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<(InterceptorId, Arc<dyn WriteInterceptor>)>>,
}

impl InterceptorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interceptor
    pub fn register(&self, interceptor: Arc<dyn WriteInterceptor>) -> InterceptorId {
        let id = InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, interceptor));
        id
    }

    /// Remove an interceptor by id
    pub fn unregister(&self, id: InterceptorId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of registered interceptors
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every interceptor in registration order, stopping at the first error
    pub async fn run_before_write(&self, offset: u64, len: u64) -> io::Result<()> {
        let snapshot: Vec<Arc<dyn WriteInterceptor>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, interceptor)| Arc::clone(interceptor))
            .collect();

        for interceptor in snapshot {
            interceptor.before_write(offset, len).await?;
        }
        Ok(())
    }
}

/// Device I/O error status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IoStatus {
    /// No failure recorded
    #[default]
    Ok,
    /// An I/O operation failed
    Failed,
    /// The device ran out of space
    NoSpace,
}

impl IoStatus {
    /// Classify an I/O error
    pub fn from_error(error: &io::Error) -> Self {
        if error.kind() == io::ErrorKind::StorageFull {
            Self::NoSpace
        } else {
            Self::Failed
        }
    }
}

/// Reusable I/O status state for device implementations
#[derive(Debug, Default)]
pub struct IoStatusTracker {
    enabled: AtomicBool,
    status: Mutex<IoStatus>,
}

impl IoStatusTracker {
    /// Create a disabled tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable tracking; disabling clears the status
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.reset();
        }
    }

    /// Whether tracking is on
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Current status
    pub fn status(&self) -> IoStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an error; the first failure sticks until reset
    pub fn record(&self, error: &io::Error) {
        if !self.is_enabled() {
            return;
        }
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == IoStatus::Ok {
            *status = IoStatus::from_error(error);
        }
    }

    /// Clear the status
    pub fn reset(&self) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = IoStatus::Ok;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl WriteInterceptor for Counting {
        async fn before_write(&self, _offset: u64, _len: u64) -> io::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(io::Error::new(io::ErrorKind::Other, "refused"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_registry_runs_and_unregisters() {
        let registry = InterceptorRegistry::new();
        let hook = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let id = registry.register(hook.clone());
        registry.run_before_write(0, 512).await.unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());

        registry.run_before_write(0, 512).await.unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_propagates_error() {
        let registry = InterceptorRegistry::new();
        registry.register(Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        }));
        assert!(registry.run_before_write(4096, 4096).await.is_err());
    }

    #[test]
    fn test_io_status_tracker() {
        let tracker = IoStatusTracker::new();
        let nospace = io::Error::from(io::ErrorKind::StorageFull);

        tracker.record(&nospace);
        assert_eq!(tracker.status(), IoStatus::Ok, "disabled tracker ignores errors");

        tracker.set_enabled(true);
        tracker.record(&nospace);
        tracker.record(&io::Error::from(io::ErrorKind::Other));
        assert_eq!(tracker.status(), IoStatus::NoSpace);

        tracker.reset();
        assert_eq!(tracker.status(), IoStatus::Ok);
    }
}
