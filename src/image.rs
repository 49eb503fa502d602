//! The central `Image` type: owns the backend(s), the in-memory L1 table, the refcount engine
//! and caches, and orchestrates read/write/COW, snapshots, and consistency checking.

use crate::allocator::ClusterAllocator;
use crate::backend::{ReadOnlyBackend, StdFileBackend, StorageBackend};
use crate::cache::{L2Cache, SingleLru};
use crate::check::{classify, CheckResult, Corruption, MetadataRole};
use crate::codec::{CompressionCodec, SectorDecryptor};
use crate::error::{DiskError, Result};
use crate::header::{
    CompressionType, EncryptionMethod, Extension, Header, AUTOCLEAR_BITMAPS,
    COMPAT_LAZY_REFCOUNTS, INCOMPAT_DIRTY, V2_HEADER_LEN, V3_HEADER_LEN,
};
use crate::options::{CreateOptions, OpenOptions, WriteBarrierMode, ZeroMode};
use crate::raw::BackingStore;
use crate::refcount::RefcountEngine;
use crate::snapshot::{self, Snapshot};
use crate::translate::{
    decode_l1_entry, decode_l2_entry, encode_l1_entry, encode_l2_entry_compressed,
    encode_l2_entry_normal, encode_l2_entry_zero_preallocated, ClusterGeometry, ClusterLocation,
    L2_ZERO_PLAIN_ENTRY,
};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

pub const MAX_BACKING_DEPTH: u32 = 64;

pub struct Image {
    backend: Mutex<Box<dyn StorageBackend>>,
    data_backend: Option<Mutex<Box<dyn StorageBackend>>>,
    header: RwLock<Header>,
    cluster_bits: u32,
    cluster_size: u64,
    extended_l2: bool,
    l1: RwLock<Vec<u64>>,
    l2_cache: L2Cache,
    compressed_cache: SingleLru<u64, Vec<u8>>,
    refcount: RefcountEngine,
    allocator: ClusterAllocator,
    write_mutex: Mutex<()>,
    parent: Option<Arc<dyn BackingStore>>,
    snapshots: Mutex<Vec<Snapshot>>,
    read_only: bool,
    barrier: WriteBarrierMode,
    codec: Mutex<Option<Arc<dyn CompressionCodec>>>,
    encryption_method: EncryptionMethod,
    decryptor: Mutex<Option<Arc<dyn SectorDecryptor>>>,
    #[allow(dead_code)]
    depth: u32,
    #[allow(dead_code)]
    base_dir: Option<PathBuf>,
}

fn align_down(v: u64, cluster_size: u64) -> u64 {
    v - (v % cluster_size)
}

fn resolve_backing_path(base_dir: &Option<PathBuf>, name: &str) -> PathBuf {
    let p = Path::new(name);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match base_dir {
        Some(d) => d.join(p),
        None => p.to_path_buf(),
    }
}

fn next_snapshot_id(existing: &[Snapshot]) -> String {
    let max = existing
        .iter()
        .filter_map(|s| s.id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

fn load_snapshots(backend: &mut dyn StorageBackend, offset: u64, count: u32) -> Result<Vec<Snapshot>> {
    let mut out = Vec::with_capacity(count as usize);
    let mut pos = offset;
    for _ in 0..count {
        let mut head = [0u8; snapshot::FIXED_RECORD_LEN];
        backend.read_at(pos, &mut head)?;
        let id_len = u16::from_be_bytes(head[12..14].try_into().unwrap()) as usize;
        let name_len = u16::from_be_bytes(head[14..16].try_into().unwrap()) as usize;
        let extra_len = u32::from_be_bytes(head[36..40].try_into().unwrap()) as usize;
        let body_len = snapshot::FIXED_RECORD_LEN + extra_len + id_len + name_len;
        let padded_len = (body_len + 7) & !7;
        let mut full = vec![0u8; padded_len];
        backend.read_at(pos, &mut full)?;
        let (snap, consumed) = Snapshot::parse_one(&full)?;
        pos += consumed as u64;
        out.push(snap);
    }
    Ok(out)
}

impl Image {
    // ---- opening and creation ----------------------------------------------------------

    pub fn open(path: &Path, options: OpenOptions) -> Result<Self> {
        Self::open_internal(path, options, 0, Vec::new())
    }

    fn open_internal(
        path: &Path,
        options: OpenOptions,
        depth: u32,
        mut visited: Vec<PathBuf>,
    ) -> Result<Self> {
        if depth > MAX_BACKING_DEPTH {
            return Err(DiskError::BackingChainTooDeep);
        }
        let canon = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if visited.contains(&canon) {
            return Err(DiskError::BackingChainCycle);
        }
        visited.push(canon);

        let mut backend: Box<dyn StorageBackend> = if options.read_only {
            Box::new(ReadOnlyBackend::new(StdFileBackend::open_read_only(path)?))
        } else {
            Box::new(StdFileBackend::open_read_write(path)?)
        };
        let base_dir = path.parent().map(|p| p.to_path_buf());

        let peek_len = backend.len()?.min(4096) as usize;
        let mut raw = vec![0u8; peek_len];
        backend.read_at(0, &mut raw)?;
        let header = Header::parse(&raw)?;
        if header.is_corrupt() {
            return Err(DiskError::CorruptImage("incompatible CORRUPT bit is set".into()));
        }

        let parent: Option<Arc<dyn BackingStore>> = match &header.backing_file_name {
            Some(name) => {
                let backing_path = resolve_backing_path(&base_dir, name);
                Some(Self::open_parent_auto(&backing_path, depth + 1, visited.clone())?)
            }
            None => None,
        };

        let data_backend: Option<Box<dyn StorageBackend>> = if header.has_external_data_file() {
            let name = header
                .extensions
                .iter()
                .find_map(|e| match e {
                    Extension::ExternalDataFile(n) => Some(n.clone()),
                    _ => None,
                })
                .ok_or_else(|| {
                    DiskError::ExtensionMalformed("external-data-file bit set without extension".into())
                })?;
            let data_path = resolve_backing_path(&base_dir, &name);
            let b: Box<dyn StorageBackend> = if options.read_only {
                Box::new(ReadOnlyBackend::new(StdFileBackend::open_read_only(&data_path)?))
            } else {
                Box::new(StdFileBackend::open_read_write(&data_path)?)
            };
            Some(b)
        } else {
            None
        };

        Self::from_parts(backend, data_backend, parent, header, options, depth, base_dir)
    }

    fn open_parent_auto(path: &Path, depth: u32, visited: Vec<PathBuf>) -> Result<Arc<dyn BackingStore>> {
        if depth > MAX_BACKING_DEPTH {
            return Err(DiskError::BackingChainTooDeep);
        }
        let mut probe = StdFileBackend::open_read_only(path)
            .map_err(|_| DiskError::BackingFileMissing(path.display().to_string()))?;
        let len = probe.len()?;
        let is_qcow2 = if len >= 4 {
            let mut magic = [0u8; 4];
            probe.read_at(0, &mut magic).is_ok() && u32::from_be_bytes(magic) == crate::header::MAGIC
        } else {
            false
        };

        if is_qcow2 {
            let opts = OpenOptions {
                read_only: true,
                ..Default::default()
            };
            let img = Self::open_internal(path, opts, depth, visited)?;
            Ok(Arc::new(img))
        } else {
            Ok(Arc::new(crate::raw::RawDisk::new(Box::new(probe))?))
        }
    }

    fn from_parts(
        mut backend: Box<dyn StorageBackend>,
        data_backend: Option<Box<dyn StorageBackend>>,
        parent: Option<Arc<dyn BackingStore>>,
        header: Header,
        options: OpenOptions,
        depth: u32,
        base_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let cluster_bits = header.cluster_bits;
        let cluster_size = header.cluster_size();
        let extended_l2 = header.has_extended_l2();
        let is_dirty = header.is_dirty();
        let is_lazy = header.lazy_refcounts();

        let l1_bytes = header.l1_size as u64 * 8;
        let mut l1_raw = vec![0u8; l1_bytes as usize];
        if l1_bytes > 0 {
            backend.read_at(header.l1_table_offset, &mut l1_raw)?;
        }
        let l1: Vec<u64> = l1_raw
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();

        let refcount = RefcountEngine::load(
            backend.as_mut(),
            header.refcount_table_offset,
            header.refcount_table_clusters,
            cluster_size,
            header.refcount_bits(),
            options.refcount_cache_entries,
        )?;

        let snapshots = if header.nb_snapshots > 0 {
            load_snapshots(backend.as_mut(), header.snapshots_offset, header.nb_snapshots)?
        } else {
            Vec::new()
        };

        let read_only = options.read_only;
        let barrier = options.write_barrier_mode;
        let encryption_method = header.encryption_method;

        let image = Self {
            backend: Mutex::new(backend),
            data_backend: data_backend.map(Mutex::new),
            header: RwLock::new(header),
            cluster_bits,
            cluster_size,
            extended_l2,
            l1: RwLock::new(l1),
            l2_cache: L2Cache::new(options.l2_cache_entries),
            compressed_cache: SingleLru::new(options.compressed_cache_entries),
            refcount,
            allocator: ClusterAllocator::new(cluster_size),
            write_mutex: Mutex::new(()),
            parent,
            snapshots: Mutex::new(snapshots),
            read_only,
            barrier,
            codec: Mutex::new(None),
            encryption_method,
            decryptor: Mutex::new(None),
            depth,
            base_dir,
        };

        if !read_only {
            if is_dirty && is_lazy {
                image.rebuild_from_metadata()?;
            }
            image.set_dirty(true)?;
        }

        Ok(image)
    }

    /// Lays out a brand-new image's metadata clusters on an already-truncated backend and
    /// returns the header that now describes it. Shared by `create` (file path) and
    /// `create_with_backend` (explicit backend, mainly for tests).
    fn format_backend(backend: &mut dyn StorageBackend, opts: &CreateOptions) -> Result<Header> {
        if !(9..=21).contains(&opts.cluster_bits) {
            return Err(DiskError::InvalidClusterBits(opts.cluster_bits));
        }
        let cluster_size = 1u64 << opts.cluster_bits;
        let entries_per_l2 = cluster_size / 8;
        let coverage = entries_per_l2 * cluster_size;
        let l1_size = opts.size.div_ceil(coverage).max(1) as u32;

        let allocator = ClusterAllocator::new(cluster_size);
        let header_cluster = allocator.allocate_cluster(backend)?;
        let refcount_table_cluster = allocator.allocate_cluster(backend)?;
        let l1_clusters = (l1_size as u64 * 8).div_ceil(cluster_size).max(1);
        let mut l1_cluster_offsets = Vec::new();
        for _ in 0..l1_clusters {
            l1_cluster_offsets.push(allocator.allocate_cluster(backend)?);
        }
        let l1_offset = l1_cluster_offsets[0];
        let refcount_block_cluster = allocator.allocate_cluster(backend)?;

        backend.write_at(l1_offset, &vec![0u8; (l1_clusters * cluster_size) as usize])?;

        let mut rt = vec![0u8; cluster_size as usize];
        rt[0..8].copy_from_slice(&refcount_block_cluster.to_be_bytes());
        backend.write_at(refcount_table_cluster, &rt)?;

        let refcount_bits = 16u32;
        let mut rb = vec![0u8; cluster_size as usize];
        let meta_clusters: Vec<u64> = std::iter::once(header_cluster)
            .chain(std::iter::once(refcount_table_cluster))
            .chain(l1_cluster_offsets.iter().copied())
            .chain(std::iter::once(refcount_block_cluster))
            .collect();
        for &c in &meta_clusters {
            let idx = c / cluster_size;
            crate::refcount::set_field(&mut rb, idx, refcount_bits, 1);
        }
        backend.write_at(refcount_block_cluster, &rb)?;

        let mut header = Header {
            version: opts.version,
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits: opts.cluster_bits,
            virtual_size: opts.size,
            encryption_method: EncryptionMethod::None,
            l1_size,
            l1_table_offset: l1_offset,
            refcount_table_offset: refcount_table_cluster,
            refcount_table_clusters: 1,
            nb_snapshots: 0,
            snapshots_offset: 0,
            incompatible_features: 0,
            compatible_features: if opts.lazy_refcounts { COMPAT_LAZY_REFCOUNTS } else { 0 },
            autoclear_features: 0,
            refcount_order: 4,
            header_length: if opts.version == 3 {
                V3_HEADER_LEN as u32
            } else {
                V2_HEADER_LEN as u32
            },
            compression_type: CompressionType::Zlib,
            extensions: Vec::new(),
            backing_file_name: None,
        };

        if let Some(backing) = &opts.backing_file {
            let cluster_bytes = cluster_size as usize;
            let mut reserved_for_name = cluster_bytes - header.header_length as usize - 8;
            if let Some(fmt) = &opts.backing_format {
                let fmt_bytes = fmt.as_bytes();
                let padded = (fmt_bytes.len() + 7) & !7;
                reserved_for_name = reserved_for_name.saturating_sub(8 + padded);
                header.extensions.push(Extension::BackingFormat(fmt.clone()));
            }
            let name_bytes = backing.as_bytes();
            if name_bytes.len() > reserved_for_name {
                return Err(DiskError::Unsupported("backing file name too long for header cluster"));
            }
            header.backing_file_offset = (cluster_bytes - name_bytes.len()) as u64;
            header.backing_file_size = name_bytes.len() as u32;
            header.backing_file_name = Some(backing.clone());
        }

        let header_bytes = header.serialize(cluster_size);
        backend.write_at(header_cluster, &header_bytes)?;
        Ok(header)
    }

    pub fn create(path: &Path, opts: CreateOptions) -> Result<Self> {
        let mut backend = StdFileBackend::create(path, 0)?;
        Self::format_backend(&mut backend, &opts)?;
        backend.flush()?;
        drop(backend);
        Self::open_internal(path, OpenOptions::default(), 0, Vec::new())
    }

    pub fn create_with_backend(
        mut backend: Box<dyn StorageBackend>,
        opts: CreateOptions,
        parent: Option<Arc<dyn BackingStore>>,
    ) -> Result<Self> {
        let header = Self::format_backend(backend.as_mut(), &opts)?;
        backend.flush()?;
        Self::from_parts(backend, None, parent, header, OpenOptions::default(), 0, None)
    }

    pub fn open_with_backend(
        mut backend: Box<dyn StorageBackend>,
        parent: Option<Arc<dyn BackingStore>>,
        options: OpenOptions,
    ) -> Result<Self> {
        let peek_len = backend.len()?.min(4096) as usize;
        let mut raw = vec![0u8; peek_len];
        backend.read_at(0, &mut raw)?;
        let header = Header::parse(&raw)?;
        if header.is_corrupt() {
            return Err(DiskError::CorruptImage("incompatible CORRUPT bit is set".into()));
        }
        Self::from_parts(backend, None, parent, header, options, 0, None)
    }

    pub fn create_overlay(path: &Path, backing_path: &Path) -> Result<Self> {
        let probe_opts = OpenOptions {
            read_only: true,
            ..Default::default()
        };
        let virtual_size = match Self::open(backing_path, probe_opts) {
            Ok(probe) => {
                let vs = probe.virtual_size();
                probe.close()?;
                vs
            }
            Err(_) => {
                let mut b = StdFileBackend::open_read_only(backing_path)?;
                b.len()?
            }
        };
        let mut create_opts = CreateOptions::new(virtual_size);
        create_opts.backing_file = Some(backing_path.display().to_string());
        Self::create(path, create_opts)
    }

    pub fn set_codec(&self, codec: Arc<dyn CompressionCodec>) {
        *self.codec.lock().unwrap() = Some(codec);
    }

    /// Wires in the legacy AES-CBC sector transformer. Only needed for reading images created
    /// with `encryption_method == Aes`; the core has no encrypt-side contract (see §6), so
    /// writes to such an image are always refused regardless of whether a decryptor is set.
    pub fn set_decryptor(&self, decryptor: Arc<dyn SectorDecryptor>) {
        *self.decryptor.lock().unwrap() = Some(decryptor);
    }

    pub fn virtual_size(&self) -> u64 {
        self.header.read().unwrap().virtual_size
    }

    /// Snapshots currently recorded in the snapshot table, in on-disk order. Needed to obtain
    /// a `Snapshot` value for [`Image::read_at_snapshot`] (e.g. after reopening an image whose
    /// snapshots were created in a previous session).
    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    /// Looks up a single snapshot by id or name, as `delete_snapshot`/`revert_to_snapshot` do.
    pub fn find_snapshot(&self, id_or_name: &str) -> Option<Snapshot> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id_or_name || s.name == id_or_name)
            .cloned()
    }

    fn is_encrypted(&self) -> bool {
        matches!(self.encryption_method, EncryptionMethod::Aes)
    }

    /// Decrypts `buf` (a full, cluster-aligned host cluster read from `host_offset`) in place,
    /// one 512-byte sector at a time, using the configured `SectorDecryptor`. `sector_number`
    /// is the absolute host sector index, matching the codec module's documented contract.
    fn decrypt_cluster_in_place(&self, host_offset: u64, buf: &mut [u8]) -> Result<()> {
        if !self.is_encrypted() {
            return Ok(());
        }
        let decryptor = self
            .decryptor
            .lock()
            .unwrap()
            .clone()
            .ok_or(DiskError::Unsupported("no AES sector decryptor configured"))?;
        const SECTOR_BYTES: usize = crate::header::SECTOR_SIZE as usize;
        let mut sector_number = host_offset / crate::header::SECTOR_SIZE;
        for chunk in buf.chunks_mut(SECTOR_BYTES) {
            let ciphertext: [u8; SECTOR_BYTES] = chunk.try_into().map_err(|_| {
                DiskError::CorruptImage("encrypted cluster is not a whole number of sectors".into())
            })?;
            let plain = decryptor.decrypt_sector(&ciphertext, sector_number)?;
            chunk.copy_from_slice(&plain);
            sector_number += 1;
        }
        Ok(())
    }

    /// Reads one full cluster from `host_offset` and decrypts it if the image uses legacy AES
    /// encryption; used wherever the write path needs a COW source cluster (plain reads go
    /// through [`Image::decrypt_cluster_in_place`] directly so they can avoid the full-cluster
    /// read when the image isn't encrypted).
    fn read_and_decrypt_cluster(&self, host_offset: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.cluster_size as usize];
        self.with_data_backend(|b| b.read_at(host_offset, &mut buf))?;
        self.decrypt_cluster_in_place(host_offset, &mut buf)?;
        Ok(buf)
    }

    // ---- geometry / backend plumbing ---------------------------------------------------

    fn geo(&self) -> ClusterGeometry {
        ClusterGeometry {
            cluster_bits: self.cluster_bits,
        }
    }

    fn split(&self, v: u64) -> (u64, u64, u64) {
        let entries = self.cluster_size / if self.extended_l2 { 16 } else { 8 };
        self.geo().split(entries, v)
    }

    fn with_meta_backend<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StorageBackend) -> Result<T>,
    {
        let mut guard = self.backend.lock().unwrap();
        f(guard.as_mut())
    }

    fn with_data_backend<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StorageBackend) -> Result<T>,
    {
        if let Some(db) = &self.data_backend {
            let mut guard = db.lock().unwrap();
            f(guard.as_mut())
        } else {
            self.with_meta_backend(f)
        }
    }

    fn allocate_meta_cluster(&self) -> Result<u64> {
        self.with_meta_backend(|b| self.allocator.allocate_cluster(b))
    }

    fn allocate_data_cluster(&self) -> Result<u64> {
        self.with_data_backend(|b| self.allocator.allocate_cluster(b))
    }

    fn refcount_update(&self, host_offset: u64, delta: i64) -> Result<()> {
        let relocated =
            self.with_meta_backend(|b| self.refcount.update(b, &self.allocator, host_offset, delta))?;
        if let Some(r) = relocated {
            {
                let mut h = self.header.write().unwrap();
                h.refcount_table_offset = r.offset;
                h.refcount_table_clusters = r.clusters;
            }
            self.write_header()?;
        }
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let bytes = {
            let h = self.header.read().unwrap();
            h.serialize(self.cluster_size)
        };
        self.with_meta_backend(|b| b.write_at(0, &bytes))
    }

    fn set_dirty(&self, dirty: bool) -> Result<()> {
        {
            let mut h = self.header.write().unwrap();
            if dirty {
                h.incompatible_features |= INCOMPAT_DIRTY;
            } else {
                h.incompatible_features &= !INCOMPAT_DIRTY;
            }
        }
        self.write_header()?;
        self.sync_metadata_if_needed()
    }

    fn sync_metadata_if_needed(&self) -> Result<()> {
        if matches!(self.barrier, WriteBarrierMode::Metadata | WriteBarrierMode::Full) {
            self.with_meta_backend(|b| b.flush())?;
        }
        Ok(())
    }

    fn sync_data_if_needed(&self) -> Result<()> {
        if matches!(self.barrier, WriteBarrierMode::Full) {
            self.with_data_backend(|b| b.flush())?;
        }
        Ok(())
    }

    /// §4.8: a bitmaps extension's autoclear bit marks the persistent dirty-tracking bitmaps
    /// it points at as still valid; the core never maintains them incrementally, so the first
    /// write to the image must invalidate them by clearing that bit. Idempotent past the first
    /// call since it only touches disk when the bit is still set.
    fn invalidate_bitmaps_on_first_write(&self) -> Result<()> {
        let still_set = self.header.read().unwrap().autoclear_features & AUTOCLEAR_BITMAPS != 0;
        if !still_set {
            return Ok(());
        }
        {
            let mut h = self.header.write().unwrap();
            h.autoclear_features &= !AUTOCLEAR_BITMAPS;
        }
        self.write_header()?;
        self.sync_metadata_if_needed()
    }

    fn persist_l1_entry(&self, l1_idx: u64, entry: u64) -> Result<()> {
        let l1_table_offset = self.header.read().unwrap().l1_table_offset;
        let addr = l1_table_offset + l1_idx * 8;
        self.with_meta_backend(|b| b.write_at(addr, &entry.to_be_bytes()))
    }

    fn get_l2_bytes(&self, l2_offset: u64) -> Result<Vec<u8>> {
        if let Some(bytes) = self.l2_cache.get(l2_offset) {
            return Ok(bytes);
        }
        let mut buf = vec![0u8; self.cluster_size as usize];
        self.with_meta_backend(|b| b.read_at(l2_offset, &mut buf))?;
        self.l2_cache.put(l2_offset, buf.clone());
        Ok(buf)
    }

    fn metadata_ranges(&self) -> Vec<(u64, u64)> {
        let h = self.header.read().unwrap();
        let cs = self.cluster_size;
        let l1_bytes = self.l1.read().unwrap().len() as u64 * 8;
        vec![
            (0, cs),
            (h.l1_table_offset, l1_bytes.div_ceil(cs) * cs),
            (h.refcount_table_offset, h.refcount_table_clusters as u64 * cs),
        ]
    }

    fn check_not_metadata(&self, offset: u64) -> Result<()> {
        for (start, len) in self.metadata_ranges() {
            if len > 0 && offset >= start && offset < start + len {
                return Err(DiskError::CorruptImage(format!(
                    "data cluster at {offset:#x} overlaps a reserved metadata region"
                )));
            }
        }
        Ok(())
    }

    // ---- address translation ------------------------------------------------------------

    fn translate(&self, v: u64) -> Result<ClusterLocation> {
        let (l1_idx, l2_idx, _intra) = self.split(v);
        let entry = {
            let l1 = self.l1.read().unwrap();
            match l1.get(l1_idx as usize) {
                Some(e) => *e,
                None => return Ok(ClusterLocation::Unallocated),
            }
        };
        let (_, l2_offset) = decode_l1_entry(entry);
        if l2_offset == 0 {
            return Ok(ClusterLocation::Unallocated);
        }
        let l2_bytes = self.get_l2_bytes(l2_offset)?;
        let entry_size = if self.extended_l2 { 16 } else { 8 };
        let off = (l2_idx * entry_size) as usize;
        let raw = u64::from_be_bytes(l2_bytes[off..off + 8].try_into().unwrap());
        let loc = decode_l2_entry(raw, &self.geo())?;
        if let ClusterLocation::Normal { host_offset, .. } = loc {
            self.check_not_metadata(host_offset)?;
        }
        Ok(loc)
    }

    fn translate_extended(&self, v: u64) -> Result<crate::translate::ExtendedL2Entry> {
        let (l1_idx, l2_idx, _intra) = self.split(v);
        let entry = {
            let l1 = self.l1.read().unwrap();
            l1.get(l1_idx as usize).copied().unwrap_or(0)
        };
        let (_, l2_offset) = decode_l1_entry(entry);
        if l2_offset == 0 {
            return Ok(crate::translate::ExtendedL2Entry {
                location: ClusterLocation::Unallocated,
                subcluster_allocated: 0,
            });
        }
        let bytes = self.get_l2_bytes(l2_offset)?;
        let off = (l2_idx * 16) as usize;
        let standard = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
        let bitmap = u32::from_be_bytes(bytes[off + 8..off + 12].try_into().unwrap());
        crate::translate::decode_extended_l2_entry(standard, bitmap, &self.geo())
    }

    /// Returns the location to serve for the chunk starting at `v`, and the maximum number of
    /// bytes from `v` that chunk covers (a whole cluster, or one subcluster when the image uses
    /// extended L2 entries).
    fn locate_chunk(&self, v: u64) -> Result<(ClusterLocation, u64)> {
        let (_, _, intra) = self.split(v);
        if !self.extended_l2 {
            let loc = self.translate(v)?;
            return Ok((loc, self.cluster_size - intra));
        }
        let ext = self.translate_extended(v)?;
        let subcluster_size = self.cluster_size / crate::translate::SUBCLUSTERS_PER_CLUSTER as u64;
        let sub_idx = (intra / subcluster_size) as u32;
        let remaining = subcluster_size - (intra % subcluster_size);
        let loc = match ext.location {
            ClusterLocation::Normal { host_offset, copied } => {
                if (ext.subcluster_allocated >> sub_idx) & 1 == 1 {
                    ClusterLocation::Normal { host_offset, copied }
                } else {
                    ClusterLocation::Unallocated
                }
            }
            other => other,
        };
        Ok((loc, remaining))
    }

    // ---- read path -------------------------------------------------------------------------

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let virtual_size = self.virtual_size();
        if offset >= virtual_size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(virtual_size - offset) as usize;
        let mut done = 0usize;
        while done < len {
            let v = offset + done as u64;
            let (loc, chunk_cap) = self.locate_chunk(v)?;
            let n = ((len - done) as u64).min(chunk_cap) as usize;
            let (_, _, intra) = self.split(v);
            let dest = &mut buf[done..done + n];
            match loc {
                ClusterLocation::Normal { host_offset, .. } => {
                    if self.is_encrypted() {
                        let cluster = self.read_and_decrypt_cluster(host_offset)?;
                        dest.copy_from_slice(&cluster[intra as usize..intra as usize + n]);
                    } else {
                        self.with_data_backend(|b| b.read_at(host_offset + intra, dest))?;
                    }
                }
                ClusterLocation::ZeroPreallocated { .. } | ClusterLocation::Zero => dest.fill(0),
                ClusterLocation::Unallocated => {
                    if let Some(parent) = &self.parent {
                        parent.read_at(dest, v)?;
                    } else {
                        dest.fill(0);
                    }
                }
                ClusterLocation::Compressed { host_offset, sectors } => {
                    let cluster = self.read_compressed_cluster(host_offset, sectors)?;
                    dest.copy_from_slice(&cluster[intra as usize..intra as usize + n]);
                }
            }
            done += n;
        }
        Ok(done)
    }

    fn read_compressed_cluster(&self, host_offset: u64, sectors: u32) -> Result<Vec<u8>> {
        if let Some(cached) = self.compressed_cache.get(&host_offset) {
            return Ok(cached);
        }
        let codec = self
            .codec
            .lock()
            .unwrap()
            .clone()
            .ok_or(DiskError::Unsupported("no compression codec configured"))?;
        let nbytes = sectors as usize * crate::header::SECTOR_SIZE as usize;
        let mut raw = vec![0u8; nbytes];
        self.with_data_backend(|b| b.read_at(host_offset, &mut raw))?;
        let cluster = crate::codec::decompress_into_cluster(codec.as_ref(), &raw, self.cluster_size as usize)?;
        self.compressed_cache.put(host_offset, cluster.clone());
        Ok(cluster)
    }

    // ---- write path & COW -----------------------------------------------------------------

    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        if self.extended_l2 {
            return Err(DiskError::ExtendedL2NotWritable);
        }
        if self.is_encrypted() {
            return Err(DiskError::Unsupported(
                "writes to legacy AES-encrypted images are not supported; the core only implements the decrypt side of the codec contract",
            ));
        }
        self.invalidate_bitmaps_on_first_write()?;
        let virtual_size = self.virtual_size();
        if offset >= virtual_size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(virtual_size - offset) as usize;
        let _guard = self.write_mutex.lock().unwrap();
        let mut done = 0usize;
        while done < len {
            let v = offset + done as u64;
            let (l1_idx, l2_idx, intra) = self.split(v);
            let n = ((len - done) as u64).min(self.cluster_size - intra) as usize;
            let src = &buf[done..done + n];
            self.write_one_cluster(v, l1_idx, l2_idx, intra, src)?;
            done += n;
        }
        Ok(done)
    }

    fn write_one_cluster(&self, v: u64, l1_idx: u64, l2_idx: u64, intra: u64, src: &[u8]) -> Result<()> {
        let old_loc = self.translate(v)?;

        if let ClusterLocation::Normal { host_offset, copied: true } = old_loc {
            self.with_data_backend(|b| b.write_at(host_offset + intra, src))?;
            self.sync_data_if_needed()?;
            return Ok(());
        }

        let new_phys = self.allocate_data_cluster()?;
        self.refcount_update(new_phys, 1)?;

        let mut cluster_buf = vec![0u8; self.cluster_size as usize];
        match old_loc {
            ClusterLocation::Normal { host_offset, .. } => {
                cluster_buf = self.read_and_decrypt_cluster(host_offset)?;
            }
            ClusterLocation::Compressed { host_offset, sectors } => {
                cluster_buf = self.read_compressed_cluster(host_offset, sectors)?;
            }
            ClusterLocation::Unallocated => {
                if let Some(parent) = &self.parent {
                    let cluster_start = v - intra;
                    parent.read_at(&mut cluster_buf, cluster_start)?;
                }
            }
            ClusterLocation::Zero | ClusterLocation::ZeroPreallocated { .. } => {}
        }
        cluster_buf[intra as usize..intra as usize + src.len()].copy_from_slice(src);

        self.with_data_backend(|b| b.write_at(new_phys, &cluster_buf))?;
        self.sync_data_if_needed()?;

        let new_entry = encode_l2_entry_normal(new_phys, true);
        self.ensure_l2_and_set(l1_idx, l2_idx, new_entry)?;
        self.sync_metadata_if_needed()?;

        let old_host_to_release = match old_loc {
            ClusterLocation::Normal { host_offset, .. } => Some(host_offset),
            ClusterLocation::ZeroPreallocated { host_offset } => Some(host_offset),
            _ => None,
        };
        if let Some(old_host) = old_host_to_release {
            self.refcount_update(old_host, -1)?;
        }
        Ok(())
    }

    /// Allocates an L2 table for `l1_idx` if one doesn't already exist, then writes `new_entry`
    /// at `l2_idx` within it, through the L2 cache and straight to disk.
    fn ensure_l2_and_set(&self, l1_idx: u64, l2_idx: u64, new_entry: u64) -> Result<()> {
        let existing = {
            let l1 = self.l1.read().unwrap();
            l1[l1_idx as usize]
        };
        let (_, mut l2_offset) = decode_l1_entry(existing);

        if l2_offset == 0 {
            let off = self.allocate_meta_cluster()?;
            self.refcount_update(off, 1)?;
            let zeros = vec![0u8; self.cluster_size as usize];
            self.with_meta_backend(|b| b.write_at(off, &zeros))?;
            self.l2_cache.put(off, zeros);

            {
                let mut l1 = self.l1.write().unwrap();
                l1[l1_idx as usize] = encode_l1_entry(off, true);
            }
            self.persist_l1_entry(l1_idx, encode_l1_entry(off, true))?;
            self.sync_metadata_if_needed()?;
            l2_offset = off;
        }

        let mut l2_bytes = self.get_l2_bytes(l2_offset)?;
        let entry_size = if self.extended_l2 { 16 } else { 8 };
        let off_in_table = (l2_idx * entry_size) as usize;
        l2_bytes[off_in_table..off_in_table + 8].copy_from_slice(&new_entry.to_be_bytes());
        self.with_meta_backend(|b| {
            b.write_at(l2_offset + off_in_table as u64, &l2_bytes[off_in_table..off_in_table + 8])
        })?;
        self.l2_cache.put(l2_offset, l2_bytes);
        Ok(())
    }

    pub fn write_zero_at(&self, offset: u64, len: u64, mode: ZeroMode) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        if self.extended_l2 {
            return Err(DiskError::ExtendedL2NotWritable);
        }
        if self.is_encrypted() {
            return Err(DiskError::Unsupported(
                "writes to legacy AES-encrypted images are not supported; the core only implements the decrypt side of the codec contract",
            ));
        }
        self.invalidate_bitmaps_on_first_write()?;
        let virtual_size = self.virtual_size();
        let end = offset.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
        if end > virtual_size {
            return Err(DiskError::OutOfBounds {
                offset,
                len: len as usize,
                capacity: virtual_size,
            });
        }
        let _guard = self.write_mutex.lock().unwrap();
        let mut done = 0u64;
        while done < len {
            let v = offset + done;
            let (l1_idx, l2_idx, intra) = self.split(v);
            let n = (len - done).min(self.cluster_size - intra);
            if intra == 0 && n == self.cluster_size {
                let old_loc = self.translate(v)?;
                let new_entry = match (mode, old_loc) {
                    (ZeroMode::ZeroPreallocated, ClusterLocation::Normal { host_offset, .. }) => {
                        encode_l2_entry_zero_preallocated(host_offset)
                    }
                    _ => L2_ZERO_PLAIN_ENTRY,
                };
                self.ensure_l2_and_set(l1_idx, l2_idx, new_entry)?;
                self.sync_metadata_if_needed()?;
                if mode == ZeroMode::ZeroPlain {
                    if let ClusterLocation::Normal { host_offset, .. } = old_loc {
                        self.refcount_update(host_offset, -1)?;
                    }
                }
            } else {
                let zeros = vec![0u8; n as usize];
                self.write_one_cluster(v, l1_idx, l2_idx, intra, &zeros)?;
            }
            done += n;
        }
        Ok(())
    }

    pub fn write_at_compressed(&self, buf: &[u8], offset: u64) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        if self.extended_l2 {
            return Err(DiskError::ExtendedL2NotWritable);
        }
        if self.is_encrypted() {
            return Err(DiskError::Unsupported(
                "writes to legacy AES-encrypted images are not supported; the core only implements the decrypt side of the codec contract",
            ));
        }
        self.invalidate_bitmaps_on_first_write()?;
        if buf.len() as u64 != self.cluster_size {
            return Err(DiskError::Unsupported("write_at_compressed requires exactly one cluster"));
        }
        let (l1_idx, l2_idx, intra) = self.split(offset);
        if intra != 0 {
            return Err(DiskError::Unsupported("write_at_compressed must target a cluster boundary"));
        }
        if self.data_backend.is_some() {
            return Err(DiskError::Unsupported("compression is incompatible with an external data file"));
        }

        let codec = self.codec.lock().unwrap().clone();
        let codec = match codec {
            Some(c) => c,
            None => {
                self.write_at(buf, offset)?;
                return Ok(());
            }
        };
        let compressed = codec.compress(buf, 6)?;
        if !crate::codec::is_beneficial(compressed.len(), self.cluster_size as usize) {
            self.write_at(buf, offset)?;
            return Ok(());
        }

        let _guard = self.write_mutex.lock().unwrap();
        let old_loc = self.translate(offset)?;
        let sectors = (compressed.len() as u64).div_ceil(crate::header::SECTOR_SIZE) as u32;
        let new_phys = self.with_meta_backend(|b| self.allocator.allocate_bytes(b, compressed.len() as u64))?;
        // Compressed allocations are byte-packed; several may share one host cluster. We bump
        // the containing cluster's refcount on every allocation rather than tracking exact
        // sharing, matching the spec's explicit call to leave this approximate (see check.rs).
        self.refcount_update(align_down(new_phys, self.cluster_size), 1)?;

        self.with_meta_backend(|b| b.write_at(new_phys, &compressed))?;
        self.sync_data_if_needed()?;

        let new_entry = encode_l2_entry_compressed(new_phys, sectors, &self.geo());
        self.ensure_l2_and_set(l1_idx, l2_idx, new_entry)?;
        self.sync_metadata_if_needed()?;

        let old_host_to_release = match old_loc {
            ClusterLocation::Normal { host_offset, .. } => Some(host_offset),
            ClusterLocation::ZeroPreallocated { host_offset } => Some(host_offset),
            _ => None,
        };
        if let Some(old_host) = old_host_to_release {
            self.refcount_update(old_host, -1)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.with_meta_backend(|b| b.flush())?;
        if let Some(db) = &self.data_backend {
            db.lock().unwrap().flush()?;
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        if !self.read_only {
            self.set_dirty(false)?;
        }
        self.flush()?;
        if let Some(parent) = &self.parent {
            parent.close()?;
        }
        Ok(())
    }

    // ---- snapshot engine -------------------------------------------------------------------

    pub fn create_snapshot(&self, name: &str) -> Result<Snapshot> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        if name.is_empty() {
            return Err(DiskError::Unsupported("snapshot name must not be empty"));
        }
        let _guard = self.write_mutex.lock().unwrap();
        let cs = self.cluster_size;
        let old_snapshots = self.snapshots.lock().unwrap().clone();
        if old_snapshots.iter().any(|s| s.name == name) {
            return Err(DiskError::SnapshotNameExists(name.to_string()));
        }

        let working_l1 = self.l1.read().unwrap().clone();
        let l1_clusters = (working_l1.len() as u64 * 8).div_ceil(cs).max(1);

        let mut clone_offsets = Vec::with_capacity(l1_clusters as usize);
        for _ in 0..l1_clusters {
            let off = self.allocate_meta_cluster()?;
            self.refcount_update(off, 1)?;
            clone_offsets.push(off);
        }
        let clone_l1: Vec<u64> = working_l1
            .iter()
            .map(|&e| {
                let (_, off) = decode_l1_entry(e);
                encode_l1_entry(off, false)
            })
            .collect();
        let mut clone_bytes = vec![0u8; (l1_clusters * cs) as usize];
        for (i, e) in clone_l1.iter().enumerate() {
            clone_bytes[i * 8..i * 8 + 8].copy_from_slice(&e.to_be_bytes());
        }
        for (i, &off) in clone_offsets.iter().enumerate() {
            let start = i * cs as usize;
            self.with_meta_backend(|b| b.write_at(off, &clone_bytes[start..start + cs as usize]))?;
        }

        {
            let mut w = self.l1.write().unwrap();
            *w = clone_l1.clone();
        }
        for (idx, &e) in clone_l1.iter().enumerate() {
            self.persist_l1_entry(idx as u64, e)?;
        }
        self.sync_metadata_if_needed()?;

        for &entry in &clone_l1 {
            let (_, l2_offset) = decode_l1_entry(entry);
            if l2_offset == 0 {
                continue;
            }
            self.refcount_update(l2_offset, 1)?;
            self.clear_l2_copied_and_bump_refs(l2_offset)?;
        }

        let snap = Snapshot {
            id: next_snapshot_id(&old_snapshots),
            name: name.to_string(),
            l1_table_offset: clone_offsets[0],
            l1_size: working_l1.len() as u32,
            date_sec: 0,
            date_nsec: 0,
            vm_clock_nsec: 0,
            vm_state_size: 0,
            extra_data: if self.header.read().unwrap().version == 3 {
                vec![0; 16]
            } else {
                Vec::new()
            },
        };

        let old_offset = self.header.read().unwrap().snapshots_offset;
        let old_clusters = if old_snapshots.is_empty() {
            0
        } else {
            (snapshot::serialize_table(&old_snapshots).len() as u64).div_ceil(cs).max(1)
        };

        let mut new_snapshots = old_snapshots;
        new_snapshots.push(snap.clone());
        let table_bytes = snapshot::serialize_table(&new_snapshots);
        let new_clusters = (table_bytes.len() as u64).div_ceil(cs).max(1);
        let mut new_offset = 0u64;
        for i in 0..new_clusters {
            let off = self.allocate_meta_cluster()?;
            self.refcount_update(off, 1)?;
            if i == 0 {
                new_offset = off;
            }
        }
        let mut padded = table_bytes;
        padded.resize((new_clusters * cs) as usize, 0);
        self.with_meta_backend(|b| b.write_at(new_offset, &padded))?;

        {
            let mut h = self.header.write().unwrap();
            h.snapshots_offset = new_offset;
            h.nb_snapshots = new_snapshots.len() as u32;
        }
        self.write_header()?;
        self.sync_metadata_if_needed()?;
        *self.snapshots.lock().unwrap() = new_snapshots;

        for i in 0..old_clusters {
            self.refcount_update(old_offset + i * cs, -1)?;
        }

        Ok(snap)
    }

    /// For every non-unallocated, non-compressed entry in the L2 table at `l2_offset`: bumps
    /// the data cluster's refcount and clears its COPIED flag, rewriting the entry if it
    /// changed.
    fn clear_l2_copied_and_bump_refs(&self, l2_offset: u64) -> Result<()> {
        let mut bytes = self.get_l2_bytes(l2_offset)?;
        let entry_size = if self.extended_l2 { 16 } else { 8 };
        let n = (self.cluster_size / entry_size) as usize;
        let geo = self.geo();
        let mut changed = false;
        for i in 0..n {
            let off = i * entry_size as usize;
            let raw = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
            match decode_l2_entry(raw, &geo) {
                Ok(ClusterLocation::Normal { host_offset, copied }) => {
                    self.refcount_update(host_offset, 1)?;
                    if copied {
                        let new_raw = encode_l2_entry_normal(host_offset, false);
                        bytes[off..off + 8].copy_from_slice(&new_raw.to_be_bytes());
                        self.with_meta_backend(|b| b.write_at(l2_offset + off as u64, &new_raw.to_be_bytes()))?;
                        changed = true;
                    }
                }
                Ok(ClusterLocation::ZeroPreallocated { host_offset }) => {
                    self.refcount_update(host_offset, 1)?;
                }
                _ => {}
            }
        }
        if changed {
            self.l2_cache.put(l2_offset, bytes);
        }
        Ok(())
    }

    fn decrement_l1_tree(&self, l1: &[u64]) -> Result<()> {
        let entry_size = if self.extended_l2 { 16 } else { 8 };
        let n = (self.cluster_size / entry_size) as usize;
        let geo = self.geo();
        for &entry in l1 {
            let (_, l2_offset) = decode_l1_entry(entry);
            if l2_offset == 0 {
                continue;
            }
            let bytes = self.get_l2_bytes(l2_offset)?;
            for i in 0..n {
                let off = i * entry_size as usize;
                let raw = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
                match decode_l2_entry(raw, &geo) {
                    Ok(ClusterLocation::Normal { host_offset, .. }) => {
                        self.refcount_update(host_offset, -1)?;
                    }
                    Ok(ClusterLocation::ZeroPreallocated { host_offset }) => {
                        self.refcount_update(host_offset, -1)?;
                    }
                    _ => {}
                }
            }
            self.refcount_update(l2_offset, -1)?;
        }
        Ok(())
    }

    fn load_l1_table(&self, offset: u64, size: u32) -> Result<Vec<u64>> {
        let mut raw = vec![0u8; size as usize * 8];
        self.with_meta_backend(|b| b.read_at(offset, &mut raw))?;
        Ok(raw
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect())
    }

    pub fn delete_snapshot(&self, id_or_name: &str) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        let _guard = self.write_mutex.lock().unwrap();
        let cs = self.cluster_size;
        let snapshots = self.snapshots.lock().unwrap().clone();
        let idx = snapshots
            .iter()
            .position(|s| s.id == id_or_name || s.name == id_or_name)
            .ok_or_else(|| DiskError::SnapshotNotFound(id_or_name.to_string()))?;
        let target = snapshots[idx].clone();

        let target_l1 = self.load_l1_table(target.l1_table_offset, target.l1_size)?;
        self.decrement_l1_tree(&target_l1)?;
        let l1_clusters = target.l1_clusters(cs);
        for i in 0..l1_clusters {
            self.refcount_update(target.l1_table_offset + i * cs, -1)?;
        }

        let mut remaining = snapshots.clone();
        remaining.remove(idx);
        let old_offset = self.header.read().unwrap().snapshots_offset;
        let old_clusters = (snapshot::serialize_table(&snapshots).len() as u64).div_ceil(cs).max(1);

        let new_offset;
        if remaining.is_empty() {
            new_offset = 0;
        } else {
            let table_bytes = snapshot::serialize_table(&remaining);
            let new_clusters = (table_bytes.len() as u64).div_ceil(cs).max(1);
            let mut off0 = 0u64;
            for i in 0..new_clusters {
                let off = self.allocate_meta_cluster()?;
                self.refcount_update(off, 1)?;
                if i == 0 {
                    off0 = off;
                }
            }
            let mut padded = table_bytes;
            padded.resize((new_clusters * cs) as usize, 0);
            self.with_meta_backend(|b| b.write_at(off0, &padded))?;
            new_offset = off0;
        }

        {
            let mut h = self.header.write().unwrap();
            h.snapshots_offset = new_offset;
            h.nb_snapshots = remaining.len() as u32;
        }
        self.write_header()?;
        self.sync_metadata_if_needed()?;
        *self.snapshots.lock().unwrap() = remaining;

        for i in 0..old_clusters {
            self.refcount_update(old_offset + i * cs, -1)?;
        }

        self.fix_copied_flags()?;
        Ok(())
    }

    pub fn revert_to_snapshot(&self, id_or_name: &str) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        let _guard = self.write_mutex.lock().unwrap();
        let snapshots = self.snapshots.lock().unwrap().clone();
        let snap = snapshots
            .iter()
            .find(|s| s.id == id_or_name || s.name == id_or_name)
            .cloned()
            .ok_or_else(|| DiskError::SnapshotNotFound(id_or_name.to_string()))?;

        let working_l1 = self.l1.read().unwrap().clone();
        if snap.l1_size as usize != working_l1.len() {
            return Err(DiskError::SnapshotL1SizeMismatch);
        }

        self.decrement_l1_tree(&working_l1)?;

        let snap_l1 = self.load_l1_table(snap.l1_table_offset, snap.l1_size)?;
        for &entry in &snap_l1 {
            let (_, l2_offset) = decode_l1_entry(entry);
            if l2_offset == 0 {
                continue;
            }
            self.refcount_update(l2_offset, 1)?;
            let bytes = self.get_l2_bytes(l2_offset)?;
            let entry_size = if self.extended_l2 { 16 } else { 8 };
            let n = (self.cluster_size / entry_size) as usize;
            let geo = self.geo();
            for i in 0..n {
                let off = i * entry_size as usize;
                let raw = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
                match decode_l2_entry(raw, &geo) {
                    Ok(ClusterLocation::Normal { host_offset, .. }) => {
                        self.refcount_update(host_offset, 1)?;
                    }
                    Ok(ClusterLocation::ZeroPreallocated { host_offset }) => {
                        self.refcount_update(host_offset, 1)?;
                    }
                    _ => {}
                }
            }
        }

        {
            let mut w = self.l1.write().unwrap();
            *w = snap_l1.clone();
        }
        for (idx, &e) in snap_l1.iter().enumerate() {
            self.persist_l1_entry(idx as u64, e)?;
        }
        self.sync_metadata_if_needed()?;
        self.l2_cache.clear();

        self.fix_copied_flags()?;
        Ok(())
    }

    pub fn read_at_snapshot(&self, buf: &mut [u8], offset: u64, snap: &Snapshot) -> Result<usize> {
        let cs = self.cluster_size;
        let snap_l1 = self.load_l1_table(snap.l1_table_offset, snap.l1_size)?;

        let virtual_size = self.virtual_size();
        if offset >= virtual_size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(virtual_size - offset) as usize;
        let mut done = 0usize;
        while done < len {
            let v = offset + done as u64;
            let (l1_idx, l2_idx, intra) = self.split(v);
            let n = ((len - done) as u64).min(cs - intra) as usize;
            let dest = &mut buf[done..done + n];
            let entry = snap_l1.get(l1_idx as usize).copied().unwrap_or(0);
            let (_, l2_offset) = decode_l1_entry(entry);
            let loc = if l2_offset == 0 {
                ClusterLocation::Unallocated
            } else {
                let bytes = self.get_l2_bytes(l2_offset)?;
                let entry_size = if self.extended_l2 { 16 } else { 8 };
                let off = (l2_idx * entry_size) as usize;
                let raw = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
                decode_l2_entry(raw, &self.geo())?
            };
            match loc {
                ClusterLocation::Normal { host_offset, .. } => {
                    if self.is_encrypted() {
                        let cluster = self.read_and_decrypt_cluster(host_offset)?;
                        dest.copy_from_slice(&cluster[intra as usize..intra as usize + n]);
                    } else {
                        self.with_data_backend(|b| b.read_at(host_offset + intra, dest))?;
                    }
                }
                ClusterLocation::ZeroPreallocated { .. } | ClusterLocation::Zero => dest.fill(0),
                ClusterLocation::Unallocated => {
                    if let Some(parent) = &self.parent {
                        parent.read_at(dest, v)?;
                    } else {
                        dest.fill(0);
                    }
                }
                ClusterLocation::Compressed { host_offset, sectors } => {
                    let cluster = self.read_compressed_cluster(host_offset, sectors)?;
                    dest.copy_from_slice(&cluster[intra as usize..intra as usize + n]);
                }
            }
            done += n;
        }
        Ok(done)
    }

    fn fix_copied_flags(&self) -> Result<()> {
        let l1_snapshot = self.l1.read().unwrap().clone();
        let entry_size = if self.extended_l2 { 16 } else { 8 };
        let n_entries = (self.cluster_size / entry_size) as usize;
        let geo = self.geo();

        for (l1_idx, entry) in l1_snapshot.iter().enumerate() {
            let (_, l2_offset) = decode_l1_entry(*entry);
            if l2_offset == 0 {
                continue;
            }
            let l2_rc = self.with_meta_backend(|b| self.refcount.get_refcount(b, l2_offset))?;
            let want_l1_copied = l2_rc == 1;
            let new_l1_entry = encode_l1_entry(l2_offset, want_l1_copied);
            if new_l1_entry != *entry {
                {
                    let mut l1 = self.l1.write().unwrap();
                    l1[l1_idx] = new_l1_entry;
                }
                self.persist_l1_entry(l1_idx as u64, new_l1_entry)?;
            }

            let mut l2_bytes = self.get_l2_bytes(l2_offset)?;
            let mut changed = false;
            for i in 0..n_entries {
                let off = i * entry_size as usize;
                let raw = u64::from_be_bytes(l2_bytes[off..off + 8].try_into().unwrap());
                if let Ok(ClusterLocation::Normal { host_offset, copied }) = decode_l2_entry(raw, &geo) {
                    let rc = self.with_meta_backend(|b| self.refcount.get_refcount(b, host_offset))?;
                    let want = rc == 1;
                    if want != copied {
                        let new_raw = encode_l2_entry_normal(host_offset, want);
                        l2_bytes[off..off + 8].copy_from_slice(&new_raw.to_be_bytes());
                        self.with_meta_backend(|b| b.write_at(l2_offset + off as u64, &new_raw.to_be_bytes()))?;
                        changed = true;
                    }
                }
            }
            if changed {
                self.l2_cache.put(l2_offset, l2_bytes);
            }
        }
        Ok(())
    }

    // ---- consistency checker ---------------------------------------------------------------

    /// Records `role` for `offset` in `roles`, pushing an overlap `Corruption` into `overlaps`
    /// if a different role was already recorded for the same host cluster (§4.10: "any cluster
    /// claimed by two roles is a corruption").
    fn record_role(
        roles: &mut BTreeMap<u64, MetadataRole>,
        overlaps: &mut Vec<Corruption>,
        cluster_size: u64,
        offset: u64,
        role: MetadataRole,
    ) {
        match roles.entry(offset) {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(role);
            }
            std::collections::btree_map::Entry::Occupied(o) => {
                if *o.get() != role {
                    overlaps.push(Corruption {
                        cluster_index: offset / cluster_size,
                        expected: 0,
                        found: 0,
                        note: format!("cluster claimed by both {:?} and {:?}", o.get(), role),
                    });
                }
            }
        }
    }

    fn walk_l1(
        &self,
        l1: &[u64],
        map: &mut BTreeMap<u64, u64>,
        approximate: &mut BTreeSet<u64>,
        roles: &mut BTreeMap<u64, MetadataRole>,
        overlaps: &mut Vec<Corruption>,
    ) -> Result<()> {
        let cs = self.cluster_size;
        let entry_size = if self.extended_l2 { 16 } else { 8 };
        let n_entries = (cs / entry_size) as usize;
        let geo = self.geo();
        for &entry in l1 {
            let (_, l2_offset) = decode_l1_entry(entry);
            if l2_offset == 0 {
                continue;
            }
            *map.entry(l2_offset).or_insert(0) += 1;
            Self::record_role(roles, overlaps, cs, l2_offset, MetadataRole::L2Table);
            let mut bytes = vec![0u8; cs as usize];
            self.with_meta_backend(|b| b.read_at(l2_offset, &mut bytes))?;
            for i in 0..n_entries {
                let off = i * entry_size as usize;
                let raw = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
                let loc = match decode_l2_entry(raw, &geo) {
                    Ok(l) => l,
                    Err(_) => continue,
                };
                match loc {
                    ClusterLocation::Normal { host_offset, .. } => {
                        *map.entry(host_offset).or_insert(0) += 1;
                        Self::record_role(roles, overlaps, cs, host_offset, MetadataRole::Data);
                    }
                    ClusterLocation::ZeroPreallocated { host_offset } => {
                        *map.entry(host_offset).or_insert(0) += 1;
                        Self::record_role(roles, overlaps, cs, host_offset, MetadataRole::Data);
                    }
                    ClusterLocation::Compressed { host_offset, .. } => {
                        let base = align_down(host_offset, cs);
                        let e = map.entry(base).or_insert(0);
                        if *e == 0 {
                            *e = 1;
                        }
                        approximate.insert(base);
                        Self::record_role(roles, overlaps, cs, base, MetadataRole::Data);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn expected_refcounts(&self) -> Result<(BTreeMap<u64, u64>, BTreeSet<u64>, Vec<Corruption>)> {
        let mut map: BTreeMap<u64, u64> = BTreeMap::new();
        let mut roles: BTreeMap<u64, MetadataRole> = BTreeMap::new();
        let mut overlaps: Vec<Corruption> = Vec::new();
        let cs = self.cluster_size;
        *map.entry(0).or_insert(0) += 1; // header cluster
        roles.insert(0, MetadataRole::Header);

        let h = self.header.read().unwrap().clone();
        let l1_clusters = (h.l1_size as u64 * 8).div_ceil(cs).max(1);
        for i in 0..l1_clusters {
            let off = h.l1_table_offset + i * cs;
            *map.entry(off).or_insert(0) += 1;
            Self::record_role(&mut roles, &mut overlaps, cs, off, MetadataRole::L1Table);
        }
        for i in 0..h.refcount_table_clusters as u64 {
            let off = h.refcount_table_offset + i * cs;
            *map.entry(off).or_insert(0) += 1;
            Self::record_role(&mut roles, &mut overlaps, cs, off, MetadataRole::RefcountTable);
        }
        for ptr in self.refcount.top_pointers() {
            if ptr != 0 {
                *map.entry(ptr).or_insert(0) += 1;
                Self::record_role(&mut roles, &mut overlaps, cs, ptr, MetadataRole::RefcountBlock);
            }
        }

        let snapshots = self.snapshots.lock().unwrap().clone();
        if !snapshots.is_empty() {
            let bytes = snapshot::serialize_table(&snapshots).len() as u64;
            let clusters = bytes.div_ceil(cs).max(1);
            for i in 0..clusters {
                let off = h.snapshots_offset + i * cs;
                *map.entry(off).or_insert(0) += 1;
                Self::record_role(&mut roles, &mut overlaps, cs, off, MetadataRole::SnapshotTable);
            }
        }

        let mut approximate = BTreeSet::new();

        let l1 = self.l1.read().unwrap().clone();
        self.walk_l1(&l1, &mut map, &mut approximate, &mut roles, &mut overlaps)?;

        for snap in &snapshots {
            let clusters = snap.l1_clusters(cs);
            for i in 0..clusters {
                let off = snap.l1_table_offset + i * cs;
                *map.entry(off).or_insert(0) += 1;
                Self::record_role(&mut roles, &mut overlaps, cs, off, MetadataRole::SnapshotTable);
            }
            let snap_l1 = self.load_l1_table(snap.l1_table_offset, snap.l1_size)?;
            self.walk_l1(&snap_l1, &mut map, &mut approximate, &mut roles, &mut overlaps)?;
        }

        Ok((map, approximate, overlaps))
    }

    /// Diagnostic utility (§4.10): classifies which metadata category a given host byte offset
    /// belongs to, or reports it as plain cluster data. Walks the same structures `check`/
    /// `repair` do, but only far enough to answer for the one offset asked about.
    pub fn check_overlap(&self, host_offset: u64) -> Result<MetadataRole> {
        let cs = self.cluster_size;
        let aligned = align_down(host_offset, cs);
        if aligned == 0 {
            return Ok(MetadataRole::Header);
        }
        let h = self.header.read().unwrap().clone();
        let l1_clusters = (h.l1_size as u64 * 8).div_ceil(cs).max(1);
        if aligned >= h.l1_table_offset && aligned < h.l1_table_offset + l1_clusters * cs {
            return Ok(MetadataRole::L1Table);
        }
        if aligned >= h.refcount_table_offset
            && aligned < h.refcount_table_offset + h.refcount_table_clusters as u64 * cs
        {
            return Ok(MetadataRole::RefcountTable);
        }
        if self.refcount.top_pointers().iter().any(|&p| p == aligned) {
            return Ok(MetadataRole::RefcountBlock);
        }
        let snapshots = self.snapshots.lock().unwrap().clone();
        if !snapshots.is_empty() {
            let bytes = snapshot::serialize_table(&snapshots).len() as u64;
            let clusters = bytes.div_ceil(cs).max(1);
            if aligned >= h.snapshots_offset && aligned < h.snapshots_offset + clusters * cs {
                return Ok(MetadataRole::SnapshotTable);
            }
        }
        for snap in &snapshots {
            let clusters = snap.l1_clusters(cs);
            if aligned >= snap.l1_table_offset && aligned < snap.l1_table_offset + clusters * cs {
                return Ok(MetadataRole::SnapshotTable);
            }
        }
        let l1 = self.l1.read().unwrap().clone();
        if l1.iter().any(|&e| decode_l1_entry(e).1 == aligned) {
            return Ok(MetadataRole::L2Table);
        }
        for snap in &snapshots {
            let snap_l1 = self.load_l1_table(snap.l1_table_offset, snap.l1_size)?;
            if snap_l1.iter().any(|&e| decode_l1_entry(e).1 == aligned) {
                return Ok(MetadataRole::L2Table);
            }
        }
        Ok(MetadataRole::Data)
    }

    pub fn rebuild_from_metadata(&self) -> Result<()> {
        self.with_meta_backend(|b| self.refcount.zero_all_blocks(b))?;
        let (expected, _approximate, _overlaps) = self.expected_refcounts()?;
        for (&off, &count) in expected.iter() {
            self.refcount_update(off, count as i64)?;
        }
        Ok(())
    }

    pub fn check(&self) -> Result<CheckResult> {
        let (expected, approximate, overlaps) = self.expected_refcounts()?;
        let cs = self.cluster_size;
        let file_len = self.with_meta_backend(|b| b.len())?;
        let n_clusters = file_len / cs;

        let mut stored = BTreeMap::new();
        let mut allocated_clusters = 0u64;
        for idx in 0..n_clusters {
            let host_offset = idx * cs;
            let rc = self.with_meta_backend(|b| self.refcount.get_refcount(b, host_offset))?;
            if rc > 0 {
                allocated_clusters += 1;
                stored.insert(host_offset, rc);
            }
        }

        let referenced_clusters = expected.len() as u64;
        let (mut corruptions, leaks, leaked_bytes) = classify(&expected, &stored, &approximate, cs);
        corruptions.extend(overlaps);
        Ok(CheckResult {
            referenced_clusters,
            allocated_clusters,
            corruptions,
            leaks,
            leaked_bytes,
            errors: Vec::new(),
        })
    }

    pub fn repair(&self) -> Result<CheckResult> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        let before = self.check()?;
        if !before.is_clean() {
            self.rebuild_from_metadata()?;
            self.fix_copied_flags()?;
        }
        self.check()
    }
}

impl BackingStore for Image {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Image::read_at(self, buf, offset)
    }

    fn virtual_size(&self) -> u64 {
        Image::virtual_size(self)
    }

    fn close(&self) -> Result<()> {
        Image::flush(self)
    }
}
