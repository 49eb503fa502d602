//! Data types returned by `Image::check`/`repair`. The walk that builds the expected-refcount
//! map lives on `Image` itself (it needs the L1 table, the L2 cache, and the refcount engine
//! all at once); this module only holds the result shapes and the classification step.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataRole {
    Header,
    L1Table,
    RefcountTable,
    RefcountBlock,
    L2Table,
    SnapshotTable,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    pub cluster_index: u64,
    pub expected: u64,
    pub found: u64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leak {
    pub cluster_index: u64,
    pub expected: u64,
    pub found: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    pub referenced_clusters: u64,
    pub allocated_clusters: u64,
    pub corruptions: Vec<Corruption>,
    pub leaks: Vec<Leak>,
    pub leaked_bytes: u64,
    pub errors: Vec<String>,
}

impl CheckResult {
    pub fn is_clean(&self) -> bool {
        self.corruptions.is_empty() && self.leaks.is_empty() && self.errors.is_empty()
    }
}

/// Compares the walk-derived expectation against what's actually stored on disk, classifying
/// each discrepancy as a leak (stored > expected) or a corruption (stored < expected).
///
/// `approximate` marks cluster indices (compressed-data host clusters) where the walk can only
/// promise `expected >= 1`, not an exact count; a stored refcount above that floor is reported
/// as a leak rather than treated as exact-match, matching the spec's call to not attempt
/// sharing accounting for compressed clusters.
pub fn classify(
    expected: &BTreeMap<u64, u64>,
    stored: &BTreeMap<u64, u64>,
    approximate: &std::collections::BTreeSet<u64>,
    cluster_size: u64,
) -> (Vec<Corruption>, Vec<Leak>, u64) {
    let mut corruptions = Vec::new();
    let mut leaks = Vec::new();
    let mut leaked_bytes = 0u64;

    let mut all_idx: std::collections::BTreeSet<u64> = expected.keys().copied().collect();
    all_idx.extend(stored.keys().copied());

    for idx in all_idx {
        let exp = expected.get(&idx).copied().unwrap_or(0);
        let found = stored.get(&idx).copied().unwrap_or(0);
        if approximate.contains(&idx) {
            if found < exp {
                corruptions.push(Corruption {
                    cluster_index: idx,
                    expected: exp,
                    found,
                    note: "compressed-cluster host below floor".into(),
                });
            } else if found > exp {
                leaked_bytes += cluster_size;
                leaks.push(Leak {
                    cluster_index: idx,
                    expected: exp,
                    found,
                });
            }
            continue;
        }
        match found.cmp(&exp) {
            std::cmp::Ordering::Greater => {
                leaked_bytes += cluster_size;
                leaks.push(Leak {
                    cluster_index: idx,
                    expected: exp,
                    found,
                });
            }
            std::cmp::Ordering::Less => corruptions.push(Corruption {
                cluster_index: idx,
                expected: exp,
                found,
                note: String::new(),
            }),
            std::cmp::Ordering::Equal => {}
        }
    }

    (corruptions, leaks, leaked_bytes)
}
