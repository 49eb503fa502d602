//! The backing-store abstraction shared by qcow2 parents and plain raw parents, plus the raw
//! implementation itself.

use crate::backend::StorageBackend;
use crate::error::Result;

/// What a parent image must provide to serve a child's unallocated reads. Both `Image` and
/// `RawDisk` implement this; the backing chain only ever sees this trait, never the concrete
/// type, so a qcow2-on-raw or qcow2-on-qcow2 chain look identical to the child.
pub trait BackingStore: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn virtual_size(&self) -> u64;
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A flat, uncompressed, unstructured virtual disk: byte offset `v` maps directly to host
/// offset `v`. Used as a parent when the backing file isn't qcow2 (format `"raw"`).
pub struct RawDisk {
    backend: std::sync::Mutex<Box<dyn StorageBackend>>,
    size: u64,
}

impl RawDisk {
    pub fn new(mut backend: Box<dyn StorageBackend>) -> Result<Self> {
        let size = backend.len()?;
        Ok(Self {
            backend: std::sync::Mutex::new(backend),
            size,
        })
    }

    pub fn with_size(backend: Box<dyn StorageBackend>, size: u64) -> Self {
        Self {
            backend: std::sync::Mutex::new(backend),
            size,
        }
    }
}

impl BackingStore for RawDisk {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut backend = self.backend.lock().unwrap();
        let capacity = self.size;
        if offset >= capacity {
            buf.fill(0);
            return Ok(buf.len());
        }
        let avail = (capacity - offset).min(buf.len() as u64) as usize;
        backend.read_at(offset, &mut buf[..avail])?;
        if avail < buf.len() {
            buf[avail..].fill(0);
        }
        Ok(buf.len())
    }

    fn virtual_size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    #[test]
    fn raw_disk_reads_through_and_pads_past_eof() {
        let mut mem = MemBackend::with_len(16).unwrap();
        mem.write_at(0, &[1, 2, 3, 4]).unwrap();
        let disk = RawDisk::new(Box::new(mem)).unwrap();
        let mut buf = [0xffu8; 20];
        let n = disk.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 20);
        assert_eq!(&buf[0..4], &[1, 2, 3, 4]);
        assert_eq!(buf[19], 0);
    }
}
