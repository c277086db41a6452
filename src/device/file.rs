//! File-backed block device
//!
//! Uses positioned I/O (`pread`/`pwrite` semantics) on a shared file handle.
//! Blocking calls run on tokio's blocking pool so the job task never stalls
//! the runtime.

use super::{
    BlockDevice, InterceptorId, InterceptorRegistry, IoStatus, IoStatusTracker, WriteInterceptor,
};
use crate::error::{IoResultExt, Result};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Chunk size used when zeroes have to be written out explicitly
const ZERO_CHUNK: usize = 1024 * 1024;

/// Image file or block special file used as a volume
pub struct FileDevice {
    name: String,
    path: PathBuf,
    file: Arc<File>,
    writable: bool,
    interceptors: InterceptorRegistry,
    io_status: IoStatusTracker,
}

impl FileDevice {
    /// Open an existing file, read-write if possible, otherwise read-only
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| OpenOptions::new().read(true).open(path).map(|file| (file, false)))
            .with_device(path.display().to_string())?;

        Ok(Self::from_file(path, file, writable))
    }

    /// Create (or truncate) a file of exactly `len` bytes
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_device(name.clone())?;
        file.set_len(len).with_device(name)?;

        Ok(Self::from_file(path, file, true))
    }

    fn from_file(path: &Path, file: File, writable: bool) -> Self {
        Self {
            name: path.display().to_string(),
            path: path.to_path_buf(),
            file: Arc::new(file),
            writable,
            interceptors: InterceptorRegistry::new(),
            io_status: IoStatusTracker::new(),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file was opened for writing
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn ensure_writable(&self) -> io::Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("'{}' is opened read-only", self.name),
            ))
        }
    }

    async fn blocking<T, F>(&self, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("I/O worker failed: {}", e)))?
    }
}

/// Length of an open volume.
///
/// Seeks to the end instead of reading `st_size`, which is 0 for block
/// special files. Positioned I/O ignores the cursor this moves.
pub fn volume_length(mut file: &File) -> io::Result<u64> {
    file.seek(SeekFrom::End(0))
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            n => {
                data = &data[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

/// Deallocate a range, keeping the file size
#[cfg(target_os = "linux")]
fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &File, _offset: u64, _len: u64) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

fn write_zero_chunks(file: &File, mut offset: u64, len: u64) -> io::Result<()> {
    let zeroes = vec![0u8; ZERO_CHUNK.min(len as usize)];
    let end = offset + len;
    while offset < end {
        let n = ((end - offset) as usize).min(zeroes.len());
        write_all_at(file, &zeroes[..n], offset)?;
        offset += n as u64;
    }
    Ok(())
}

#[async_trait]
impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn length(&self) -> io::Result<u64> {
        self.blocking(volume_length).await
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let len = buf.len();
        let data = self
            .blocking(move |file| {
                let mut data = vec![0u8; len];
                read_exact_at(file, &mut data, offset)?;
                Ok(data)
            })
            .await?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.ensure_writable()?;
        self.interceptors.run_before_write(offset, data.len() as u64).await?;

        let data = data.to_vec();
        self.blocking(move |file| write_all_at(file, &data, offset)).await
    }

    async fn write_zeroes(&self, offset: u64, len: u64) -> io::Result<()> {
        self.ensure_writable()?;
        self.interceptors.run_before_write(offset, len).await?;

        self.blocking(move |file| match punch_hole(file, offset, len) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::trace!("hole punching unavailable ({}), writing zeroes", e);
                write_zero_chunks(file, offset, len)
            }
        })
        .await
    }

    async fn flush(&self) -> io::Result<()> {
        self.blocking(|file| file.sync_data()).await
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
        true
    }

    fn set_io_status_tracking(&self, enabled: bool) {
        self.io_status.set_enabled(enabled);
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
