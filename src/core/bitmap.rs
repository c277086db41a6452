//! Dirty-cluster bitmap
//!
//! One bit per cluster, set once the cluster has been copied to the target.
//! Bits only ever go from clear to set, and a bit is only set by whoever
//! holds the cluster's in-flight registration, so relaxed atomics are enough.

use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: u64 = u64::BITS as u64;

/// Copied-cluster tracking for one backup job
#[derive(Debug)]
pub struct DirtyBitmap {
    cluster_size: u64,
    total_clusters: u64,
    words: Vec<AtomicU64>,
}

impl DirtyBitmap {
    /// Allocate a bitmap covering `volume_len` bytes.
    ///
    /// `cluster_size` must be a power of two.
    pub fn new(volume_len: u64, cluster_size: u64) -> Self {
        debug_assert!(cluster_size.is_power_of_two());
        let total_clusters = volume_len.div_ceil(cluster_size);
        let words = (0..total_clusters.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();

        Self {
            cluster_size,
            total_clusters,
            words,
        }
    }

    /// Cluster size in bytes
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// Number of clusters covered
    pub fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    /// Whether `cluster` has been copied. Out-of-range clusters read as copied.
    pub fn is_copied(&self, cluster: u64) -> bool {
        if cluster >= self.total_clusters {
            return true;
        }
        let word = self.words[(cluster / BITS_PER_WORD) as usize].load(Ordering::Acquire);
        word & (1 << (cluster % BITS_PER_WORD)) != 0
    }

    /// Mark `cluster` as copied; returns false if it already was
    pub fn mark_copied(&self, cluster: u64) -> bool {
        if cluster >= self.total_clusters {
            return false;
        }
        let mask = 1 << (cluster % BITS_PER_WORD);
        let prev = self.words[(cluster / BITS_PER_WORD) as usize].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    /// Number of clusters marked copied
    pub fn count_copied(&self) -> u64 {
        self.words
            .iter()
            .map(|w| u64::from(w.load(Ordering::Acquire).count_ones()))
            .sum()
    }

    /// True once every cluster is marked
    pub fn is_complete(&self) -> bool {
        self.count_copied() == self.total_clusters
    }

    /// Half-open cluster range covering the byte range `[offset, offset + len)`
    pub fn cluster_range(&self, offset: u64, len: u64) -> (u64, u64) {
        let start = offset / self.cluster_size;
        let end = offset.saturating_add(len).div_ceil(self.cluster_size);
        (start, end.min(self.total_clusters).max(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CLUSTER: u64 = 64 * 1024;

    #[test]
    fn test_sizing_rounds_up() {
        assert_eq!(DirtyBitmap::new(640 * 1024, CLUSTER).total_clusters(), 10);
        assert_eq!(DirtyBitmap::new(640 * 1024 + 1, CLUSTER).total_clusters(), 11);
        assert_eq!(DirtyBitmap::new(0, CLUSTER).total_clusters(), 0);
    }

    #[test]
    fn test_mark_is_sticky() {
        let bitmap = DirtyBitmap::new(200 * CLUSTER, CLUSTER);
        assert!(!bitmap.is_copied(130));
        assert!(bitmap.mark_copied(130));
        assert!(!bitmap.mark_copied(130));
        assert!(bitmap.is_copied(130));
        assert!(!bitmap.is_copied(129));
        assert_eq!(bitmap.count_copied(), 1);
    }

    #[test]
    fn test_cluster_range() {
        let bitmap = DirtyBitmap::new(10 * CLUSTER, CLUSTER);
        assert_eq!(bitmap.cluster_range(0, 1), (0, 1));
        assert_eq!(bitmap.cluster_range(CLUSTER - 1, 2), (0, 2));
        assert_eq!(bitmap.cluster_range(7 * CLUSTER + 100, 512), (7, 8));
        // Clamped to the volume
        assert_eq!(bitmap.cluster_range(9 * CLUSTER, 4 * CLUSTER), (9, 10));
        assert_eq!(bitmap.cluster_range(20 * CLUSTER, CLUSTER), (20, 20));
    }

    proptest! {
        #[test]
        fn prop_marked_set_matches(clusters in proptest::collection::btree_set(0u64..500, 0..100)) {
            let bitmap = DirtyBitmap::new(500 * CLUSTER, CLUSTER);
            for &c in &clusters {
                bitmap.mark_copied(c);
            }
            prop_assert_eq!(bitmap.count_copied(), clusters.len() as u64);
            for c in 0..500 {
                prop_assert_eq!(bitmap.is_copied(c), clusters.contains(&c));
            }
        }
    }
}
