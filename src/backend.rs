//! Positional byte-addressable storage. One host file maps to one `StorageBackend`; the
//! qcow2 image may use a second one for an external data file.

use crate::error::{DiskError, Result};
use std::fs::File;
use std::path::Path;

pub trait StorageBackend: Send {
    fn len(&mut self) -> Result<u64>;
    fn set_len(&mut self, len: u64) -> Result<()>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

fn bounds_check(offset: u64, len: usize, capacity: u64) -> Result<usize> {
    let offset_usize: usize = offset.try_into().map_err(|_| DiskError::OffsetOverflow)?;
    let end = offset_usize
        .checked_add(len)
        .ok_or(DiskError::OffsetOverflow)?;
    if end as u64 > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(offset_usize)
}

/// In-memory backend. Used by tests and as the building block for the consistency checker's
/// scratch buffers.
#[derive(Debug, Default, Clone)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Result<Self> {
        let len: usize = len.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        Ok(Self {
            data: vec![0u8; len],
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl StorageBackend for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len: usize = len.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = bounds_check(offset, buf.len(), self.data.len() as u64)?;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let offset_usize: usize = offset.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        let end = offset_usize
            .checked_add(buf.len())
            .ok_or(DiskError::OffsetOverflow)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset_usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Real-file backend using positional (pread/pwrite-style) I/O, so it never disturbs a shared
/// file cursor and is safe to call from multiple call sites without external seeking.
pub struct StdFileBackend {
    file: File,
}

impl StdFileBackend {
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut backend = Self { file };
        backend.set_len(len)?;
        Ok(backend)
    }

    pub fn open_read_write(path: &Path) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let file = File::options().read(true).open(path)?;
        Ok(Self { file })
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

#[cfg(unix)]
mod platform {
    use super::*;
    use std::os::unix::fs::FileExt;

    pub fn pread(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        file.read_exact_at(buf, offset)
    }

    pub fn pwrite(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        file.write_all_at(buf, offset)
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::os::windows::fs::FileExt;

    pub fn pread(file: &File, mut offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.seek_read(&mut buf[filled..], offset)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
            }
            filled += n;
            offset += n as u64;
        }
        Ok(())
    }

    pub fn pwrite(file: &File, mut offset: u64, buf: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = file.seek_write(&buf[written..], offset)?;
            written += n;
            offset += n as u64;
        }
        Ok(())
    }
}

impl StorageBackend for StdFileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let capacity = self.len()?;
        bounds_check(offset, buf.len(), capacity)?;
        platform::pread(&self.file, offset, buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let needed = offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        if needed > self.len()? {
            self.set_len(needed)?;
        }
        platform::pwrite(&self.file, offset, buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Wraps a backend so every mutating call fails; used to expose a backing/parent image's
/// metadata file without risking an accidental write through a shared handle.
pub struct ReadOnlyBackend<B> {
    inner: B,
}

impl<B: StorageBackend> ReadOnlyBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

impl<B: StorageBackend> StorageBackend for ReadOnlyBackend<B> {
    fn len(&mut self) -> Result<u64> {
        self.inner.len()
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(DiskError::Unsupported("read-only"))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, _offset: u64, _buf: &[u8]) -> Result<()> {
        Err(DiskError::Unsupported("read-only"))
    }

    fn flush(&mut self) -> Result<()> {
        Err(DiskError::Unsupported("read-only"))
    }
}
