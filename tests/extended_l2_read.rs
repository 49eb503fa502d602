//! Reading an extended-L2 image (§4.8): per-subcluster allocation resolution, and the
//! write-side refusal for such images (§7 `ExtendedL2NotWritable`).

use qcow2_core::{DiskError, Image, MemBackend, OpenOptions, StorageBackend};

const CLUSTER_BITS: u32 = 16;
const CLUSTER_SIZE: u64 = 1 << CLUSTER_BITS;
const MAGIC: u32 = 0x5146_49fb;
const INCOMPAT_EXTENDED_L2: u64 = 1 << 4;

/// Hand-crafts a minimal one-cluster-L1, one-cluster-L2, two-subcluster-data extended-L2
/// image directly in a `MemBackend`, bypassing `Image::create` (which never produces
/// extended-L2 images, matching the spec's write-side restriction).
fn build_extended_l2_image() -> MemBackend {
    let cs = CLUSTER_SIZE;
    // Cluster layout: 0 = header, 1 = refcount table, 2 = refcount block, 3 = L1 table,
    // 4 = L2 table, 5 = data cluster (one full cluster backing two subclusters).
    let header_off = 0u64;
    let refcount_table_off = cs;
    let refcount_block_off = cs * 2;
    let l1_off = cs * 3;
    let l2_off = cs * 4;
    let data_off = cs * 5;

    let mut mem = MemBackend::with_len(cs * 6).unwrap();

    // refcount table -> one pointer to the refcount block.
    let mut rt = vec![0u8; cs as usize];
    rt[0..8].copy_from_slice(&refcount_block_off.to_be_bytes());
    mem.write_at(refcount_table_off, &rt).unwrap();

    // refcount block: 16-bit entries, give every cluster we used refcount 1.
    let mut rb = vec![0u8; cs as usize];
    for cluster_idx in 0..6u64 {
        let off = (cluster_idx as usize) * 2;
        rb[off..off + 2].copy_from_slice(&1u16.to_be_bytes());
    }
    mem.write_at(refcount_block_off, &rb).unwrap();

    // L1 table: one entry pointing at the L2 table (not COPIED -- irrelevant for reads).
    let mut l1 = vec![0u8; cs as usize];
    l1[0..8].copy_from_slice(&l2_off.to_be_bytes());
    mem.write_at(l1_off, &l1).unwrap();

    // Extended L2 table: 16-byte entries. Entry 0 -> data_off, with only subclusters 0 and 1
    // (of 32) marked allocated; the rest of the table stays zeroed (unallocated entries).
    let mut l2 = vec![0u8; cs as usize];
    l2[0..8].copy_from_slice(&data_off.to_be_bytes());
    let bitmap: u32 = 0b11; // subclusters 0, 1 allocated
    l2[8..12].copy_from_slice(&bitmap.to_be_bytes());
    mem.write_at(l2_off, &l2).unwrap();

    // Data cluster: fill with a recognizable pattern so subcluster 0's bytes are distinct
    // from the rest of the cluster.
    let mut data = vec![0x00u8; cs as usize];
    let subcluster_size = (cs / 32) as usize;
    data[0..subcluster_size].fill(0x5A);
    mem.write_at(data_off, &data).unwrap();

    // Header.
    let mut h = vec![0u8; cs as usize];
    h[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    h[4..8].copy_from_slice(&3u32.to_be_bytes()); // version 3
    h[20..24].copy_from_slice(&CLUSTER_BITS.to_be_bytes());
    h[24..32].copy_from_slice(&(cs * 32).to_be_bytes()); // virtual_size: one L2's worth of subclusters
    h[36..40].copy_from_slice(&1u32.to_be_bytes()); // l1_size
    h[40..48].copy_from_slice(&l1_off.to_be_bytes());
    h[48..56].copy_from_slice(&refcount_table_off.to_be_bytes());
    h[56..60].copy_from_slice(&1u32.to_be_bytes()); // refcount_table_clusters
    h[72..80].copy_from_slice(&INCOMPAT_EXTENDED_L2.to_be_bytes());
    h[96..100].copy_from_slice(&4u32.to_be_bytes()); // refcount_order -> 16-bit entries
    h[100..104].copy_from_slice(&104u32.to_be_bytes());
    mem.write_at(header_off, &h).unwrap();

    mem
}

#[test]
fn extended_l2_resolves_allocated_subclusters_and_zero_fills_the_rest() {
    let mem = build_extended_l2_image();
    let img = Image::open_with_backend(
        Box::new(mem),
        None,
        OpenOptions {
            read_only: true,
            ..Default::default()
        },
    )
    .unwrap();

    let subcluster_size = (CLUSTER_SIZE / 32) as usize;

    // Subcluster 0 is allocated and holds the 0x5A pattern.
    let mut buf = vec![0u8; subcluster_size];
    img.read_at(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0x5A));

    // Subcluster 1 is allocated but its backing bytes are zero.
    let mut buf = vec![0u8; subcluster_size];
    img.read_at(&mut buf, subcluster_size as u64).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    // Subcluster 2 is unallocated (bit clear in the bitmap) and has no parent, so it also
    // reads as zero -- but through the unallocated path rather than the allocated-zero path.
    let mut buf = vec![0u8; subcluster_size];
    img.read_at(&mut buf, (subcluster_size * 2) as u64).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn extended_l2_images_refuse_writes() {
    let mem = build_extended_l2_image();
    let img = Image::open_with_backend(Box::new(mem), None, OpenOptions::default()).unwrap();

    let err = img.write_at(&[1u8; 16], 0).unwrap_err();
    assert!(matches!(err, DiskError::ExtendedL2NotWritable));
}
