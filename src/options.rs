//! Caller-facing configuration: what to create, how to open, and how durable a write must
//! be before the call returns.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteBarrierMode {
    /// No syncs at all. Unsafe; intended for throwaway scratch images and tests.
    None,
    /// No per-write sync; `flush()` issues one sync covering everything pending.
    Batched,
    /// Sync after every L1/L2/refcount metadata block update. Default.
    #[default]
    Metadata,
    /// Sync after every data write and every metadata update.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroMode {
    /// Record the region as reading zero without discarding any existing allocation.
    ZeroPreallocated,
    /// Record the region as reading zero and drop its backing allocation where possible.
    ZeroPlain,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub read_only: bool,
    pub l2_cache_entries: usize,
    pub refcount_cache_entries: usize,
    pub compressed_cache_entries: usize,
    pub write_barrier_mode: WriteBarrierMode,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            l2_cache_entries: 32,
            refcount_cache_entries: 16,
            compressed_cache_entries: 16,
            write_barrier_mode: WriteBarrierMode::Metadata,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub size: u64,
    pub cluster_bits: u32,
    pub version: u32,
    pub lazy_refcounts: bool,
    pub backing_file: Option<String>,
    pub backing_format: Option<String>,
}

impl CreateOptions {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            cluster_bits: 16,
            version: 3,
            lazy_refcounts: false,
            backing_file: None,
            backing_format: None,
        }
    }
}
