//! Error taxonomy for the qcow2 engine. Variants are grouped, in comments only, the way
//! the spec groups them: format, structural, refcount, I/O, state.

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    // --- format ---
    #[error("invalid qcow2 magic")]
    InvalidMagic,
    #[error("unsupported qcow2 version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid cluster_bits {0}")]
    InvalidClusterBits(u32),
    #[error("header too short")]
    HeaderTooShort,
    #[error("malformed header extension: {0}")]
    ExtensionMalformed(String),
    #[error("corrupt bit set: {0}")]
    CorruptBitSet(&'static str),
    #[error("unsupported incompatible feature bits: {0:#x}")]
    UnsupportedIncompatFeatures(u64),
    #[error("unsupported compression type {0}")]
    UnsupportedCompression(u32),
    #[error("unsupported encryption method {0}")]
    UnsupportedEncryption(u32),
    #[error("writes to extended L2 images are not supported")]
    ExtendedL2NotWritable,

    // --- structural ---
    #[error("corrupt image: {0}")]
    CorruptImage(String),
    #[error("offset {offset} len {len} exceeds capacity {capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },
    #[error("offset arithmetic overflowed")]
    OffsetOverflow,
    #[error("backing chain exceeds maximum depth")]
    BackingChainTooDeep,
    #[error("backing chain contains a cycle")]
    BackingChainCycle,
    #[error("backing file missing: {0}")]
    BackingFileMissing(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("snapshot name already exists: {0}")]
    SnapshotNameExists(String),
    #[error("snapshot L1 size does not match the current image")]
    SnapshotL1SizeMismatch,

    // --- refcount ---
    #[error("refcount overflow")]
    RefcountOverflow,
    #[error("refcount underflow")]
    RefcountUnderflow,
    #[error("corrupt refcount block: {0}")]
    RefcountBlockCorrupt(String),

    // --- generic / grab-bag, used for conditions that abort an operation outright ---
    #[error("{0}")]
    Unsupported(&'static str),

    // --- I/O ---
    #[error("io error: {0}")]
    Io(String),

    // --- state ---
    #[error("image is read-only")]
    ReadOnly,
    #[error("image is dirty; open with repair or lazy-refcount rebuild before writing")]
    ImageDirty,
    #[error("compression did not shrink the cluster")]
    CompressionNotBeneficial,
}

impl From<std::io::Error> for DiskError {
    fn from(e: std::io::Error) -> Self {
        DiskError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
