//! Interfaces for the external collaborators the spec carves out of the core: compression
//! back-ends and the legacy AES-CBC sector transformer. The core never implements a real
//! codec; it only defines the contract and drives it at the right points in the read/write
//! path.

use crate::error::Result;

/// `compress`/`decompress` as pure functions over whole cluster buffers. A back-end is
/// "beneficial" when `ceil(compressed_len / 512) < cluster_size / 512`; callers that get a
/// non-beneficial result fall back to an uncompressed write.
pub trait CompressionCodec: Send + Sync {
    fn compress(&self, cluster_bytes: &[u8], level: u32) -> Result<Vec<u8>>;
    fn decompress(&self, bytes: &[u8], expected_size: usize) -> Result<Vec<u8>>;
}

/// A sector-level transformer for legacy AES-128-CBC encrypted images. `sector_number` is
/// the absolute host sector index; the IV is the sector number, little-endian, zero-padded
/// to 16 bytes, and the key is the user's password truncated/zero-padded to 16 bytes.
pub trait SectorDecryptor: Send + Sync {
    fn decrypt_sector(&self, ciphertext: &[u8; 512], sector_number: u64) -> Result<[u8; 512]>;
}

/// Decompresses into a full cluster buffer, zero-padding if the codec returns fewer bytes
/// than `cluster_size` (the spec calls this out as a defensive pad, not an error).
pub fn decompress_into_cluster(
    codec: &dyn CompressionCodec,
    bytes: &[u8],
    cluster_size: usize,
) -> Result<Vec<u8>> {
    let mut out = codec.decompress(bytes, cluster_size)?;
    if out.len() < cluster_size {
        out.resize(cluster_size, 0);
    } else if out.len() > cluster_size {
        out.truncate(cluster_size);
    }
    Ok(out)
}

/// Returns whether a compressed result is worth keeping over the plain write.
pub fn is_beneficial(compressed_len: usize, cluster_size: usize) -> bool {
    compressed_len.div_ceil(512) < cluster_size / 512
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullCodec;
    impl CompressionCodec for NullCodec {
        fn compress(&self, cluster_bytes: &[u8], _level: u32) -> Result<Vec<u8>> {
            Ok(cluster_bytes.to_vec())
        }
        fn decompress(&self, bytes: &[u8], _expected_size: usize) -> Result<Vec<u8>> {
            Ok(bytes.to_vec())
        }
    }

    #[test]
    fn decompress_pads_short_results() {
        let codec = NullCodec;
        let out = decompress_into_cluster(&codec, &[1, 2, 3], 8).unwrap();
        assert_eq!(out, vec![1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn beneficial_threshold_matches_spec_formula() {
        assert!(is_beneficial(100, 4096));
        assert!(!is_beneficial(4096, 4096));
    }
}
