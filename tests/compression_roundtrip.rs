//! Exercises `write_at_compressed`/read-back against a stand-in `CompressionCodec`. The core
//! never links a real zlib/zstd crate (see `codec.rs`); callers plug one in at this seam.

use std::sync::Arc;

use qcow2_core::{CompressionCodec, CreateOptions, DiskError, Image, Result};

/// Minimal byte-oriented RLE, good enough to shrink a highly repetitive test cluster and
/// exercise the compressed-entry bit-split / decompressed-cluster cache without pulling in a
/// real codec dependency.
struct RleCodec;

impl CompressionCodec for RleCodec {
    fn compress(&self, cluster_bytes: &[u8], _level: u32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < cluster_bytes.len() {
            let b = cluster_bytes[i];
            let mut run = 1usize;
            while i + run < cluster_bytes.len() && cluster_bytes[i + run] == b && run < 255 {
                run += 1;
            }
            out.push(run as u8);
            out.push(b);
            i += run;
        }
        Ok(out)
    }

    fn decompress(&self, bytes: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_size);
        for pair in bytes.chunks_exact(2) {
            out.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
        }
        Ok(out)
    }
}

#[test]
fn compressed_cluster_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let img = Image::create(&dir.path().join("a.qcow2"), CreateOptions::new(1024 * 1024)).unwrap();
    img.set_codec(Arc::new(RleCodec));

    let cluster = vec![0x5Au8; 65536];
    img.write_at_compressed(&cluster, 0).unwrap();

    let mut back = vec![0u8; 65536];
    img.read_at(&mut back, 0).unwrap();
    assert_eq!(back, cluster);
}

#[test]
fn write_at_compressed_requires_a_whole_cluster_at_a_cluster_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let img = Image::create(&dir.path().join("a.qcow2"), CreateOptions::new(1024 * 1024)).unwrap();
    img.set_codec(Arc::new(RleCodec));

    let short = vec![0u8; 100];
    let err = img.write_at_compressed(&short, 0).unwrap_err();
    assert!(matches!(err, DiskError::Unsupported(_)));

    let cluster = vec![0u8; 65536];
    let err = img.write_at_compressed(&cluster, 10).unwrap_err();
    assert!(matches!(err, DiskError::Unsupported(_)));
}

#[test]
fn write_at_compressed_falls_back_to_plain_write_without_a_codec() {
    let dir = tempfile::tempdir().unwrap();
    let img = Image::create(&dir.path().join("a.qcow2"), CreateOptions::new(1024 * 1024)).unwrap();

    let cluster = vec![0x11u8; 65536];
    img.write_at_compressed(&cluster, 0).unwrap();

    let mut back = vec![0u8; 65536];
    img.read_at(&mut back, 0).unwrap();
    assert_eq!(back, cluster);
}
