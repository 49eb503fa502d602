//! Cluster allocation. The current policy is the minimal one the spec calls out: round the
//! file up to a cluster boundary and extend by one cluster. A future policy could instead
//! scan the refcount table for a free entry and reuse it; nothing in the caller depends on
//! which policy is used, so swapping it in later is a self-contained change.

use crate::backend::StorageBackend;
use crate::error::Result;
use crate::header::SECTOR_SIZE;

pub struct ClusterAllocator {
    cluster_size: u64,
}

impl ClusterAllocator {
    pub fn new(cluster_size: u64) -> Self {
        Self { cluster_size }
    }

    fn align_up(&self, len: u64) -> u64 {
        let mask = self.cluster_size - 1;
        (len + mask) & !mask
    }

    /// Allocates a new cluster-aligned cluster at the end of `backend`, extending it.
    pub fn allocate_cluster(&self, backend: &mut dyn StorageBackend) -> Result<u64> {
        let len = backend.len()?;
        let aligned = self.align_up(len);
        let new_len = aligned + self.cluster_size;
        backend.set_len(new_len)?;
        Ok(aligned)
    }

    /// Allocates `n` bytes at the end of `backend` at a byte-aligned (not cluster-aligned)
    /// offset, for compressed cluster storage. The caller pads to a 512-byte sector boundary.
    pub fn allocate_bytes(&self, backend: &mut dyn StorageBackend, n: u64) -> Result<u64> {
        let len = backend.len()?;
        let mask = SECTOR_SIZE - 1;
        let padded_n = (n + mask) & !mask;
        backend.set_len(len + padded_n)?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    #[test]
    fn allocate_cluster_extends_and_aligns() {
        let alloc = ClusterAllocator::new(4096);
        let mut backend = MemBackend::with_len(100).unwrap();
        let off = alloc.allocate_cluster(&mut backend).unwrap();
        assert_eq!(off, 4096);
        assert_eq!(backend.len().unwrap(), 8192);
    }

    #[test]
    fn allocate_bytes_pads_to_sector() {
        let alloc = ClusterAllocator::new(4096);
        let mut backend = MemBackend::with_len(1000).unwrap();
        let off = alloc.allocate_bytes(&mut backend, 100).unwrap();
        assert_eq!(off, 1000);
        assert_eq!(backend.len().unwrap(), 1000 + 512);
    }
}
