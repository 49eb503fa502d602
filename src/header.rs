//! Fixed header parsing and the header-extension list.

use crate::error::{DiskError, Result};

pub const MAGIC: u32 = 0x5146_49fb;
pub const V2_HEADER_LEN: u64 = 72;
pub const V3_HEADER_LEN: u64 = 104;

/// Sector size assumed throughout the format: compressed-cluster lengths are counted in
/// sectors, and the legacy AES-CBC transformer operates sector-at-a-time.
pub const SECTOR_SIZE: u64 = 512;

pub const INCOMPAT_DIRTY: u64 = 1 << 0;
pub const INCOMPAT_CORRUPT: u64 = 1 << 1;
pub const INCOMPAT_EXTERNAL_DATA: u64 = 1 << 2;
pub const INCOMPAT_COMPRESSION: u64 = 1 << 3;
pub const INCOMPAT_EXTENDED_L2: u64 = 1 << 4;
const KNOWN_INCOMPAT: u64 = INCOMPAT_DIRTY
    | INCOMPAT_CORRUPT
    | INCOMPAT_EXTERNAL_DATA
    | INCOMPAT_COMPRESSION
    | INCOMPAT_EXTENDED_L2;

pub const COMPAT_LAZY_REFCOUNTS: u64 = 1 << 0;
pub const AUTOCLEAR_BITMAPS: u64 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    None,
    Aes,
    Luks,
}

impl EncryptionMethod {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(EncryptionMethod::None),
            1 => Ok(EncryptionMethod::Aes),
            2 => Ok(EncryptionMethod::Luks),
            other => Err(DiskError::UnsupportedEncryption(other)),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            EncryptionMethod::None => 0,
            EncryptionMethod::Aes => 1,
            EncryptionMethod::Luks => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    Zlib,
    Zstd,
}

impl CompressionType {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(CompressionType::Zlib),
            1 => Ok(CompressionType::Zstd),
            other => Err(DiskError::UnsupportedCompression(other)),
        }
    }
}

/// A parsed extension record. Unknown types are preserved verbatim so a faithful rewrite of
/// the extension list is possible (not attempted by the core today, but nothing discards them).
#[derive(Debug, Clone)]
pub enum Extension {
    BackingFormat(String),
    FeatureNameTable(Vec<FeatureName>),
    Bitmaps { offset: u64, count: u32 },
    ExternalDataFile(String),
    FullDiskEncryptionHeader { offset: u64, length: u64 },
    Unknown { kind: u32, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct FeatureName {
    pub kind: u8,
    pub bit: u8,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Header {
    pub version: u32,
    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub cluster_bits: u32,
    pub virtual_size: u64,
    pub encryption_method: EncryptionMethod,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_length: u32,
    pub compression_type: CompressionType,
    pub extensions: Vec<Extension>,
    pub backing_file_name: Option<String>,
}

fn be_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn be_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}

impl Header {
    pub fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }

    pub fn refcount_bits(&self) -> u32 {
        1u32 << self.refcount_order
    }

    pub fn is_dirty(&self) -> bool {
        self.incompatible_features & INCOMPAT_DIRTY != 0
    }

    pub fn is_corrupt(&self) -> bool {
        self.incompatible_features & INCOMPAT_CORRUPT != 0
    }

    pub fn has_external_data_file(&self) -> bool {
        self.incompatible_features & INCOMPAT_EXTERNAL_DATA != 0
    }

    pub fn has_extended_l2(&self) -> bool {
        self.incompatible_features & INCOMPAT_EXTENDED_L2 != 0
    }

    pub fn lazy_refcounts(&self) -> bool {
        self.compatible_features & COMPAT_LAZY_REFCOUNTS != 0
    }

    pub fn l2_entry_size(&self) -> u64 {
        if self.has_extended_l2() {
            16
        } else {
            8
        }
    }

    pub fn l2_entries_per_table(&self) -> u64 {
        self.cluster_size() / self.l2_entry_size()
    }

    /// Parses the fixed header prefix plus the extension list that follows it.
    ///
    /// `raw` must contain at least `header_length` bytes (v3) or 72 bytes (v2), and enough
    /// trailing bytes to cover the extension list up to its first cluster boundary; callers
    /// typically hand in one full cluster's worth of bytes read from offset 0.
    pub fn parse(raw: &[u8]) -> Result<Header> {
        if raw.len() < V2_HEADER_LEN as usize {
            return Err(DiskError::HeaderTooShort);
        }
        if be_u32(raw, 0) != MAGIC {
            return Err(DiskError::InvalidMagic);
        }
        let version = be_u32(raw, 4);
        if version != 2 && version != 3 {
            return Err(DiskError::UnsupportedVersion(version));
        }

        let backing_file_offset = be_u64(raw, 8);
        let backing_file_size = be_u32(raw, 16);
        let cluster_bits = be_u32(raw, 20);
        if !(9..=21).contains(&cluster_bits) {
            return Err(DiskError::InvalidClusterBits(cluster_bits));
        }
        let virtual_size = be_u64(raw, 24);
        let encryption_method = EncryptionMethod::from_u32(be_u32(raw, 32))?;
        let l1_size = be_u32(raw, 36);
        let l1_table_offset = be_u64(raw, 40);
        let refcount_table_offset = be_u64(raw, 48);
        let refcount_table_clusters = be_u32(raw, 56);
        let nb_snapshots = be_u32(raw, 60);
        let snapshots_offset = be_u64(raw, 64);

        let (
            incompatible_features,
            compatible_features,
            autoclear_features,
            refcount_order,
            header_length,
            compression_type,
        ) = if version == 3 {
            if raw.len() < V3_HEADER_LEN as usize {
                return Err(DiskError::HeaderTooShort);
            }
            let incompat = be_u64(raw, 72);
            if incompat & !KNOWN_INCOMPAT != 0 {
                return Err(DiskError::UnsupportedIncompatFeatures(incompat));
            }
            let compat = be_u64(raw, 80);
            let autoclear = be_u64(raw, 88);
            let refcount_order = be_u32(raw, 96);
            if refcount_order > 6 {
                return Err(DiskError::CorruptBitSet("refcount_order out of range"));
            }
            let header_length = be_u32(raw, 100);
            if (header_length as u64) < V3_HEADER_LEN {
                return Err(DiskError::HeaderTooShort);
            }
            let compression_type = if incompat & INCOMPAT_COMPRESSION != 0 {
                if raw.len() > 104 {
                    CompressionType::from_u32(raw[104] as u32)?
                } else {
                    CompressionType::Zlib
                }
            } else {
                CompressionType::Zlib
            };
            (
                incompat,
                compat,
                autoclear,
                refcount_order,
                header_length,
                compression_type,
            )
        } else {
            // v2: fixed 4-byte refcount entries, no incompatible feature bits, no dirty bit.
            (0, 0, 0, 4, V2_HEADER_LEN as u32, CompressionType::Zlib)
        };

        let ext_start = if version == 3 {
            header_length as u64
        } else {
            V2_HEADER_LEN
        };
        let extensions = parse_extensions(raw, ext_start)?;

        let mut backing_file_name = None;
        if backing_file_offset != 0 {
            let start: usize = backing_file_offset
                .try_into()
                .map_err(|_| DiskError::OffsetOverflow)?;
            let end = start
                .checked_add(backing_file_size as usize)
                .ok_or(DiskError::OffsetOverflow)?;
            if end > raw.len() {
                return Err(DiskError::ExtensionMalformed(
                    "backing file name extends past header cluster".into(),
                ));
            }
            backing_file_name =
                Some(String::from_utf8_lossy(&raw[start..end]).into_owned());
        }

        Ok(Header {
            version,
            backing_file_offset,
            backing_file_size,
            cluster_bits,
            virtual_size,
            encryption_method,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            nb_snapshots,
            snapshots_offset,
            incompatible_features,
            compatible_features,
            autoclear_features,
            refcount_order,
            header_length,
            compression_type,
            extensions,
            backing_file_name,
        })
    }

    /// Serializes the fixed prefix, the backing-file name (at `backing_file_offset`), and a
    /// minimal extension list (currently: backing-format, when set) into a single buffer sized
    /// to one cluster. The caller writes this verbatim over the image's header cluster.
    pub fn serialize(&self, cluster_size: u64) -> Vec<u8> {
        let len = (self.header_length as u64).max(V2_HEADER_LEN);
        let mut buf = vec![0u8; cluster_size as usize];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..16].copy_from_slice(&self.backing_file_offset.to_be_bytes());
        buf[16..20].copy_from_slice(&self.backing_file_size.to_be_bytes());
        buf[20..24].copy_from_slice(&self.cluster_bits.to_be_bytes());
        buf[24..32].copy_from_slice(&self.virtual_size.to_be_bytes());
        buf[32..36].copy_from_slice(&self.encryption_method.to_u32().to_be_bytes());
        buf[36..40].copy_from_slice(&self.l1_size.to_be_bytes());
        buf[40..48].copy_from_slice(&self.l1_table_offset.to_be_bytes());
        buf[48..56].copy_from_slice(&self.refcount_table_offset.to_be_bytes());
        buf[56..60].copy_from_slice(&self.refcount_table_clusters.to_be_bytes());
        buf[60..64].copy_from_slice(&self.nb_snapshots.to_be_bytes());
        buf[64..72].copy_from_slice(&self.snapshots_offset.to_be_bytes());
        if self.version == 3 {
            buf[72..80].copy_from_slice(&self.incompatible_features.to_be_bytes());
            buf[80..88].copy_from_slice(&self.compatible_features.to_be_bytes());
            buf[88..96].copy_from_slice(&self.autoclear_features.to_be_bytes());
            buf[96..100].copy_from_slice(&self.refcount_order.to_be_bytes());
            buf[100..104].copy_from_slice(&self.header_length.to_be_bytes());
        }

        let mut ext_pos = len as usize;
        if let Some(format) = self.extensions.iter().find_map(|e| match e {
            Extension::BackingFormat(s) => Some(s.clone()),
            _ => None,
        }) {
            let data = format.into_bytes();
            let padded = (data.len() + 7) & !7usize;
            buf[ext_pos..ext_pos + 4].copy_from_slice(&0xE2792ACAu32.to_be_bytes());
            buf[ext_pos + 4..ext_pos + 8].copy_from_slice(&(data.len() as u32).to_be_bytes());
            buf[ext_pos + 8..ext_pos + 8 + data.len()].copy_from_slice(&data);
            ext_pos += 8 + padded;
        }
        // End-of-extensions marker (type = 0) is implied by the zeroed buffer.
        let _ = ext_pos;

        if let Some(name) = &self.backing_file_name {
            let start = self.backing_file_offset as usize;
            let bytes = name.as_bytes();
            buf[start..start + bytes.len()].copy_from_slice(bytes);
        }
        buf
    }
}

fn parse_extensions(raw: &[u8], mut pos: u64) -> Result<Vec<Extension>> {
    let mut out = Vec::new();
    loop {
        let p: usize = pos.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        if p + 8 > raw.len() {
            break;
        }
        let kind = be_u32(raw, p);
        let length = be_u32(raw, p + 4) as usize;
        if kind == 0 {
            break;
        }
        let data_start = p + 8;
        let data_end = data_start
            .checked_add(length)
            .ok_or(DiskError::OffsetOverflow)?;
        if data_end > raw.len() {
            return Err(DiskError::ExtensionMalformed(format!(
                "extension type {kind:#x} length {length} overruns header cluster"
            )));
        }
        let data = raw[data_start..data_end].to_vec();
        let ext = match kind {
            0xE2792ACA => Extension::BackingFormat(String::from_utf8_lossy(&data).into_owned()),
            0x6803F857 => Extension::FeatureNameTable(parse_feature_name_table(&data)),
            0x23852875 => {
                if data.len() < 12 {
                    return Err(DiskError::ExtensionMalformed("bitmaps extension too short".into()));
                }
                Extension::Bitmaps {
                    offset: be_u64(&data, 0),
                    count: be_u32(&data, 8),
                }
            }
            0x44415441 => {
                Extension::ExternalDataFile(String::from_utf8_lossy(&data).into_owned())
            }
            0x0537BE77 => {
                if data.len() < 16 {
                    return Err(DiskError::ExtensionMalformed(
                        "encryption header extension too short".into(),
                    ));
                }
                Extension::FullDiskEncryptionHeader {
                    offset: be_u64(&data, 0),
                    length: be_u64(&data, 8),
                }
            }
            other => Extension::Unknown { kind: other, data },
        };
        out.push(ext);

        let padded = (length + 7) & !7usize;
        pos = pos
            .checked_add(8)
            .and_then(|v| v.checked_add(padded as u64))
            .ok_or(DiskError::OffsetOverflow)?;
    }
    Ok(out)
}

fn parse_feature_name_table(data: &[u8]) -> Vec<FeatureName> {
    data.chunks_exact(48)
        .map(|rec| {
            let kind = rec[0];
            let bit = rec[1];
            let name_bytes = &rec[2..48];
            let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(46);
            FeatureName {
                kind,
                bit,
                name: String::from_utf8_lossy(&name_bytes[..end]).into_owned(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_header(version: u32) -> Vec<u8> {
        let len = if version == 3 { 104 } else { 72 };
        let mut h = vec![0u8; len];
        h[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        h[4..8].copy_from_slice(&version.to_be_bytes());
        h[20..24].copy_from_slice(&16u32.to_be_bytes());
        h[24..32].copy_from_slice(&(1u64 << 20).to_be_bytes());
        h[36..40].copy_from_slice(&1u32.to_be_bytes());
        h[40..48].copy_from_slice(&(1u64 << 16).to_be_bytes());
        if version == 3 {
            h[96..100].copy_from_slice(&4u32.to_be_bytes());
            h[100..104].copy_from_slice(&104u32.to_be_bytes());
        }
        h
    }

    #[test]
    fn rejects_bad_magic() {
        let mut h = base_header(3);
        h[0] = 0;
        assert!(matches!(Header::parse(&h), Err(DiskError::InvalidMagic)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut h = base_header(3);
        h[4..8].copy_from_slice(&7u32.to_be_bytes());
        assert!(matches!(
            Header::parse(&h),
            Err(DiskError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn rejects_cluster_bits_out_of_range() {
        let mut h = base_header(3);
        h[20..24].copy_from_slice(&8u32.to_be_bytes());
        assert!(matches!(
            Header::parse(&h),
            Err(DiskError::InvalidClusterBits(8))
        ));
    }

    #[test]
    fn parses_v2_minimal_header() {
        let h = base_header(2);
        let parsed = Header::parse(&h).unwrap();
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.cluster_bits, 16);
        assert_eq!(parsed.refcount_bits(), 16);
    }

    #[test]
    fn rejects_unknown_incompatible_bit() {
        let mut h = base_header(3);
        h[72..80].copy_from_slice(&(1u64 << 63).to_be_bytes());
        assert!(matches!(
            Header::parse(&h),
            Err(DiskError::UnsupportedIncompatFeatures(_))
        ));
    }

    #[test]
    fn parses_nonzero_snapshot_count_without_error() {
        let mut h = base_header(3);
        h[60..64].copy_from_slice(&2u32.to_be_bytes());
        let parsed = Header::parse(&h).unwrap();
        assert_eq!(parsed.nb_snapshots, 2);
    }
}
