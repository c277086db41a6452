//! In-memory block device
//!
//! Backs a volume with a `Vec<u8>`. Besides being a real backend for small
//! volumes it carries the hooks tests need: fault injection, per-operation
//! counters, artificial latency and a probe that records how many reads of
//! the same offset were ever in flight at once.

use super::{
    BlockDevice, InterceptorId, InterceptorRegistry, IoStatus, IoStatusTracker, WriteInterceptor,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Which operation an injected fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    /// `read_at`
    Read,
    /// `write_at` and `write_zeroes`
    Write,
}

#[derive(Debug)]
struct Fault {
    op: FaultOp,
    range: Range<u64>,
    remaining: Option<u32>,
    kind: io::ErrorKind,
}

/// Operation counters
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Completed reads
    pub reads: AtomicU64,
    /// Completed data writes
    pub writes: AtomicU64,
    /// Completed zero writes
    pub write_zeroes: AtomicU64,
    /// Bytes written through `write_at`
    pub bytes_written: AtomicU64,
}

/// Volume held in memory
pub struct MemoryDevice {
    name: String,
    data: Mutex<Vec<u8>>,
    interceptors: InterceptorRegistry,
    io_status: IoStatusTracker,
    io_status_supported: bool,
    io_delay: Option<Duration>,
    faults: Mutex<Vec<Fault>>,
    stats: DeviceStats,
    active_reads: Mutex<HashMap<u64, usize>>,
    max_overlapping_reads: AtomicUsize,
}

impl MemoryDevice {
    /// Create a zero-filled device of `len` bytes
    pub fn new(name: impl Into<String>, len: u64) -> Self {
        Self::with_data(name, vec![0u8; len as usize])
    }

    /// Create a device holding `data`
    pub fn with_data(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(data),
            interceptors: InterceptorRegistry::new(),
            io_status: IoStatusTracker::new(),
            io_status_supported: true,
            io_delay: None,
            faults: Mutex::new(Vec::new()),
            stats: DeviceStats::default(),
            active_reads: Mutex::new(HashMap::new()),
            max_overlapping_reads: AtomicUsize::new(0),
        }
    }

    /// Declare whether I/O status tracking is available
    pub fn with_io_status_support(mut self, supported: bool) -> Self {
        self.io_status_supported = supported;
        self
    }

    /// Add latency to every read and write
    pub fn with_io_delay(mut self, delay: Duration) -> Self {
        self.io_delay = Some(delay);
        self
    }

    /// Fail `op` on any access overlapping `range`.
    ///
    /// `times = None` fails forever, otherwise the fault disarms after that
    /// many hits.
    pub fn inject_fault(
        &self,
        op: FaultOp,
        range: Range<u64>,
        times: Option<u32>,
        kind: io::ErrorKind,
    ) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Fault {
                op,
                range,
                remaining: times,
                kind,
            });
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Operation counters
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Highest number of reads of one offset that were in flight together
    pub fn max_overlapping_reads(&self) -> usize {
        self.max_overlapping_reads.load(Ordering::SeqCst)
    }

    /// Copy of the current contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of write interceptors currently registered
    pub fn interceptor_count(&self) -> usize {
        self.interceptors.len()
    }

    fn check_fault(&self, op: FaultOp, offset: u64, len: u64) -> io::Result<()> {
        let end = offset.saturating_add(len);
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let hit = faults.iter_mut().find(|f| {
            f.op == op && f.range.start < end && offset < f.range.end && f.remaining != Some(0)
        });

        match hit {
            Some(fault) => {
                if let Some(remaining) = fault.remaining.as_mut() {
                    *remaining -= 1;
                }
                Err(io::Error::new(
                    fault.kind,
                    format!("injected {:?} fault at offset {}", op, offset),
                ))
            }
            None => Ok(()),
        }
    }

    fn check_bounds(&self, offset: u64, len: u64) -> io::Result<()> {
        let size = self.data.lock().unwrap_or_else(PoisonError::into_inner).len() as u64;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("access out of bounds: offset={} len={} size={}", offset, len, size),
            )),
        }
    }

    async fn simulate_latency(&self) {
        match self.io_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }

    fn begin_read(&self, offset: u64) {
        let mut active = self.active_reads.lock().unwrap_or_else(PoisonError::into_inner);
        let count = active.entry(offset).or_insert(0);
        *count += 1;
        self.max_overlapping_reads.fetch_max(*count, Ordering::SeqCst);
    }

    fn end_read(&self, offset: u64) {
        let mut active = self.active_reads.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = active.get_mut(&offset) {
            *count -= 1;
            if *count == 0 {
                active.remove(&offset);
            }
        }
    }
}

#[async_trait]
impl BlockDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn length(&self) -> io::Result<u64> {
        Ok(self.data.lock().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let len = buf.len() as u64;
        self.check_bounds(offset, len)?;

        self.begin_read(offset);
        self.simulate_latency().await;
        self.end_read(offset);

        self.check_fault(FaultOp::Read, offset, len)?;

        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let len = data.len() as u64;
        self.check_bounds(offset, len)?;
        self.interceptors.run_before_write(offset, len).await?;

        self.simulate_latency().await;
        self.check_fault(FaultOp::Write, offset, len)?;

        let mut contents = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        contents[start..start + data.len()].copy_from_slice(data);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, len: u64) -> io::Result<()> {
        self.check_bounds(offset, len)?;
        self.interceptors.run_before_write(offset, len).await?;

        self.simulate_latency().await;
        self.check_fault(FaultOp::Write, offset, len)?;

        let mut contents = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        contents[start..start + len as usize].fill(0);
        self.stats.write_zeroes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn register_write_interceptor(
        &self,
        interceptor: Arc<dyn WriteInterceptor>,
    ) -> io::Result<InterceptorId> {
        Ok(self.interceptors.register(interceptor))
    }

    fn unregister_write_interceptor(&self, id: InterceptorId) -> bool {
        self.interceptors.unregister(id)
    }

    fn supports_io_status(&self) -> bool {
        self.io_status_supported
    }

    fn set_io_status_tracking(&self, enabled: bool) {
        if self.io_status_supported {
            self.io_status.set_enabled(enabled);
        }
    }

    fn io_status(&self) -> IoStatus {
        self.io_status.status()
    }

    fn record_io_error(&self, error: &io::Error) {
        self.io_status.record(error);
    }

    fn reset_io_status(&self) {
        self.io_status.reset();
    }
}
