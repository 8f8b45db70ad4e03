//! Random-access storage backing a single open `Transfer`, behind an
//! atomic-swap wrapper.
//!
//! Grounded on `transfer.go`'s `replaceableBackend` (the mutex + waitgroup
//! dance that lets in-flight reads/writes finish against the old backend
//! after a swap) and on the teacher's `StreamFile`/`tempfile::NamedTempFile`
//! reopen pattern in `stream_storage.rs` for the concrete cache backend.

use std::{
    fs::File,
    io,
    path::Path,
    sync::{Arc, Mutex},
};

use crossbeam_utils::sync::WaitGroup;
use tempfile::NamedTempFile;

/// Capabilities a Transfer needs from its backing storage.
pub trait Backend: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    fn close(&self) -> io::Result<()>;
}

/// A temp file stretched to the remote file's full size up front, so reads
/// and writes can freely seek within it while data trickles in out of
/// order. This is the default backend for a freshly opened remote file.
pub struct TempFileBackend {
    file: File,
    _tmp: NamedTempFile,
}

impl TempFileBackend {
    pub fn new(total_size: u64) -> io::Result<Self> {
        let tmp = NamedTempFile::new()?;
        tmp.as_file().set_len(total_size)?;
        let file = tmp.reopen()?;
        Ok(TempFileBackend { file, _tmp: tmp })
    }
}

impl Backend for TempFileBackend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        read_at(&self.file, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        write_at(&self.file, buf, offset)
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A read-only file on local disk, used either to open an already-local
/// share, or to substitute in for a remote file once a byte-identical
/// local copy is discovered (see `Transfer::set_local_file`).
pub struct LocalFileBackend {
    file: File,
}

impl LocalFileBackend {
    pub fn open(path: &Path) -> io::Result<(Self, u64)> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok((LocalFileBackend { file }, size))
    }
}

impl Backend for LocalFileBackend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        read_at(&self.file, buf, offset)
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "local backing file is read-only",
        ))
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)?;
    Ok(buf.len())
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(not(unix))]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;
    Ok(buf.len())
}

#[cfg(not(unix))]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.write(buf)
}

struct Inner {
    backend: Arc<dyn Backend>,
    outstanding: WaitGroup,
}

/// Wraps a `Backend` so it can be swapped out from under concurrent
/// readers/writers without interrupting them: operations already in
/// flight hold a clone of the old backend's refcount and finish against
/// it, while `replace` installs the new backend for anyone arriving after
/// the swap. The old backend is closed once the last outstanding op
/// against it completes.
pub struct ReplaceableStorage {
    inner: Mutex<Inner>,
}

impl ReplaceableStorage {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        ReplaceableStorage {
            inner: Mutex::new(Inner {
                backend,
                outstanding: WaitGroup::new(),
            }),
        }
    }

    fn snapshot(&self) -> (Arc<dyn Backend>, WaitGroup) {
        let inner = self.inner.lock().expect("storage lock poisoned");
        (inner.backend.clone(), inner.outstanding.clone())
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let (backend, _guard) = self.snapshot();
        backend.read_at(buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let (backend, _guard) = self.snapshot();
        backend.write_at(buf, offset)
    }

    /// Atomically install `new`, returning the strong-count handle that the
    /// caller can use to wait out in-flight operations against the old
    /// backend before closing it.
    pub fn replace(&self, new: Arc<dyn Backend>) {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        let old_backend = std::mem::replace(&mut inner.backend, new);
        let old_outstanding = std::mem::replace(&mut inner.outstanding, WaitGroup::new());
        drop(inner);

        std::thread::spawn(move || {
            // Block until every read_at/write_at that grabbed a clone of
            // `old_outstanding` before the swap has dropped its clone.
            old_outstanding.wait();
            if let Err(err) = old_backend.close() {
                log::warn!("failed to close replaced storage backend: {err}");
            }
        });
    }

    /// Close the *current* backend only.
    pub fn close(&self) -> io::Result<()> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        inner.backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        closed: Arc<AtomicUsize>,
        data: Mutex<Vec<u8>>,
    }

    impl Backend for CountingBackend {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let data = self.data.lock().unwrap();
            let offset = offset as usize;
            let n = buf.len().min(data.len().saturating_sub(offset));
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
            let mut data = self.data.lock().unwrap();
            let offset = offset as usize;
            if data.len() < offset + buf.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn close(&self) -> io::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn read_write_round_trip() {
        let closed = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(CountingBackend {
            closed: closed.clone(),
            data: Mutex::new(vec![0; 16]),
        });
        let storage = ReplaceableStorage::new(backend);
        storage.write_at(b"hello", 0).unwrap();
        let mut buf = [0u8; 5];
        storage.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn replace_eventually_closes_old_backend() {
        let closed = Arc::new(AtomicUsize::new(0));
        let old = Arc::new(CountingBackend {
            closed: closed.clone(),
            data: Mutex::new(vec![0; 4]),
        });
        let storage = ReplaceableStorage::new(old);

        let new_closed = Arc::new(AtomicUsize::new(0));
        let new_backend = Arc::new(CountingBackend {
            closed: new_closed.clone(),
            data: Mutex::new(vec![0; 4]),
        });
        storage.replace(new_backend);

        for _ in 0..200 {
            if closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
