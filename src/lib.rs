//! A sparse, copy-on-write virtual-disk engine implementing the QCOW2 on-disk format.
//!
//! [`Image`] owns a host file (plus, optionally, an external data file and a read-only
//! backing chain), translates virtual byte offsets through a two-level L1/L2 cluster
//! indirection table, allocates storage on demand, and maintains the refcount table that
//! makes snapshots and backing chains safe to share. See the module docs for the pieces:
//! [`header`] (on-disk layout), [`translate`] (bit-level entry codec), [`refcount`] (sharing
//! accounting), [`cache`] (L2/refcount-block LRUs), [`snapshot`] (point-in-time L1 clones),
//! and [`check`] (the consistency walk that backs `Image::check`/`repair`).

pub mod allocator;
pub mod backend;
pub mod cache;
pub mod check;
pub mod codec;
pub mod error;
pub mod header;
pub mod image;
pub mod options;
pub mod raw;
pub mod refcount;
pub mod snapshot;
pub mod translate;

pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use codec::{CompressionCodec, SectorDecryptor};
pub use error::{DiskError, Result};
pub use header::SECTOR_SIZE;
pub use image::{Image, MAX_BACKING_DEPTH};
pub use options::{CreateOptions, OpenOptions, WriteBarrierMode, ZeroMode};
pub use raw::{BackingStore, RawDisk};
pub use snapshot::Snapshot;
