//! Snapshot record (de)serialization. The snapshot table itself is a flat run of these
//! records; the engine treats a full serialize-and-rewrite of the table as the atomic unit
//! of mutation (see `Image::create_snapshot`/`delete_snapshot`), never patching one entry
//! in place.

use crate::error::{DiskError, Result};

pub const FIXED_RECORD_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub l1_table_offset: u64,
    pub l1_size: u32,
    pub date_sec: u32,
    pub date_nsec: u32,
    pub vm_clock_nsec: u64,
    pub vm_state_size: u32,
    /// Opaque v3 "extra data" trailer (large vm_state_size + disk size, when present).
    pub extra_data: Vec<u8>,
}

fn be_u16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(b[off..off + 2].try_into().unwrap())
}
fn be_u32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(b[off..off + 4].try_into().unwrap())
}
fn be_u64(b: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(b[off..off + 8].try_into().unwrap())
}

impl Snapshot {
    pub fn serialize(&self) -> Vec<u8> {
        let id_bytes = self.id.as_bytes();
        let name_bytes = self.name.as_bytes();
        let body_len = FIXED_RECORD_LEN + self.extra_data.len() + id_bytes.len() + name_bytes.len();
        let padded_len = (body_len + 7) & !7;
        let mut buf = vec![0u8; padded_len];

        buf[0..8].copy_from_slice(&self.l1_table_offset.to_be_bytes());
        buf[8..12].copy_from_slice(&self.l1_size.to_be_bytes());
        buf[12..14].copy_from_slice(&(id_bytes.len() as u16).to_be_bytes());
        buf[14..16].copy_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        buf[16..20].copy_from_slice(&self.date_sec.to_be_bytes());
        buf[20..24].copy_from_slice(&self.date_nsec.to_be_bytes());
        buf[24..32].copy_from_slice(&self.vm_clock_nsec.to_be_bytes());
        buf[32..36].copy_from_slice(&self.vm_state_size.to_be_bytes());
        buf[36..40].copy_from_slice(&(self.extra_data.len() as u32).to_be_bytes());

        let mut pos = FIXED_RECORD_LEN;
        buf[pos..pos + self.extra_data.len()].copy_from_slice(&self.extra_data);
        pos += self.extra_data.len();
        buf[pos..pos + id_bytes.len()].copy_from_slice(id_bytes);
        pos += id_bytes.len();
        buf[pos..pos + name_bytes.len()].copy_from_slice(name_bytes);

        buf
    }

    /// Parses one record starting at `buf[0..]`, returning the record and the number of
    /// bytes it (including 8-byte padding) occupied.
    pub fn parse_one(buf: &[u8]) -> Result<(Snapshot, usize)> {
        if buf.len() < FIXED_RECORD_LEN {
            return Err(DiskError::CorruptImage("snapshot record truncated".into()));
        }
        let l1_table_offset = be_u64(buf, 0);
        let l1_size = be_u32(buf, 8);
        let id_len = be_u16(buf, 12) as usize;
        let name_len = be_u16(buf, 14) as usize;
        let date_sec = be_u32(buf, 16);
        let date_nsec = be_u32(buf, 20);
        let vm_clock_nsec = be_u64(buf, 24);
        let vm_state_size = be_u32(buf, 32);
        let extra_len = be_u32(buf, 36) as usize;

        let mut pos = FIXED_RECORD_LEN;
        let extra_end = pos
            .checked_add(extra_len)
            .ok_or(DiskError::OffsetOverflow)?;
        if extra_end > buf.len() {
            return Err(DiskError::CorruptImage("snapshot extra_data truncated".into()));
        }
        let extra_data = buf[pos..extra_end].to_vec();
        pos = extra_end;

        let id_end = pos.checked_add(id_len).ok_or(DiskError::OffsetOverflow)?;
        if id_end > buf.len() {
            return Err(DiskError::CorruptImage("snapshot id truncated".into()));
        }
        let id = String::from_utf8_lossy(&buf[pos..id_end]).into_owned();
        pos = id_end;

        let name_end = pos.checked_add(name_len).ok_or(DiskError::OffsetOverflow)?;
        if name_end > buf.len() {
            return Err(DiskError::CorruptImage("snapshot name truncated".into()));
        }
        let name = String::from_utf8_lossy(&buf[pos..name_end]).into_owned();
        pos = name_end;

        let body_len = pos;
        let padded_len = (body_len + 7) & !7;

        Ok((
            Snapshot {
                id,
                name,
                l1_table_offset,
                l1_size,
                date_sec,
                date_nsec,
                vm_clock_nsec,
                vm_state_size,
                extra_data,
            },
            padded_len,
        ))
    }

    pub fn l1_clusters(&self, cluster_size: u64) -> u64 {
        let bytes = self.l1_size as u64 * 8;
        bytes.div_ceil(cluster_size)
    }
}

/// Parses a flat run of `count` snapshot records starting at `buf[0..]`.
pub fn parse_table(buf: &[u8], count: u32) -> Result<Vec<Snapshot>> {
    let mut out = Vec::with_capacity(count as usize);
    let mut pos = 0usize;
    for _ in 0..count {
        let (snap, len) = Snapshot::parse_one(&buf[pos..])?;
        pos += len;
        out.push(snap);
    }
    Ok(out)
}

/// Serializes the full table, suitable for a single atomic rewrite.
pub fn serialize_table(snapshots: &[Snapshot]) -> Vec<u8> {
    let mut out = Vec::new();
    for s in snapshots {
        out.extend_from_slice(&s.serialize());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_roundtrips_through_serialize_parse() {
        let snap = Snapshot {
            id: "1".into(),
            name: "before-upgrade".into(),
            l1_table_offset: 4096 * 10,
            l1_size: 4,
            date_sec: 1_700_000_000,
            date_nsec: 123,
            vm_clock_nsec: 0,
            vm_state_size: 0,
            extra_data: vec![0; 16],
        };
        let bytes = snap.serialize();
        assert_eq!(bytes.len() % 8, 0);
        let (parsed, len) = Snapshot::parse_one(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed, snap);
    }

    #[test]
    fn table_roundtrips_multiple_records() {
        let snaps = vec![
            Snapshot {
                id: "1".into(),
                name: "a".into(),
                l1_table_offset: 4096,
                l1_size: 1,
                date_sec: 1,
                date_nsec: 0,
                vm_clock_nsec: 0,
                vm_state_size: 0,
                extra_data: vec![],
            },
            Snapshot {
                id: "2".into(),
                name: "b-longer-name".into(),
                l1_table_offset: 8192,
                l1_size: 2,
                date_sec: 2,
                date_nsec: 0,
                vm_clock_nsec: 0,
                vm_state_size: 0,
                extra_data: vec![],
            },
        ];
        let bytes = serialize_table(&snaps);
        let parsed = parse_table(&bytes, 2).unwrap();
        assert_eq!(parsed, snaps);
    }
}
