//! Cluster-by-cluster comparison of two volumes
//!
//! Only meaningful once nothing writes to the source any more: a live
//! writer changes the source after its old content went to the target.

use super::digest::{Digest, Hasher};
use crate::config::HashAlgorithm;
use crate::device::BlockDevice;
use crate::error::{BackupError, IoResultExt, Result};
use serde::{Deserialize, Serialize};

/// Outcome of comparing a target with its source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Algorithm used for every digest
    pub algorithm: HashAlgorithm,
    /// Bytes compared (the source length)
    pub len: u64,
    /// Comparison granularity
    pub cluster_size: u64,
    /// Clusters compared
    pub clusters: u64,
    /// Clusters whose digests differ
    pub mismatched: Vec<u64>,
    /// Digest of the whole source
    pub source_digest: Digest,
    /// Digest of the first `len` bytes of the target
    pub target_digest: Digest,
}

impl VerifyReport {
    /// True when every cluster matched
    pub fn is_match(&self) -> bool {
        self.mismatched.is_empty()
    }

    /// Turn a mismatch into an error
    pub fn into_result(self) -> Result<Self> {
        if self.is_match() {
            Ok(self)
        } else {
            Err(BackupError::VerifyMismatch {
                clusters: self.clusters,
                mismatched: self.mismatched.len() as u64,
            })
        }
    }

    /// Print summary to console
    pub fn print_summary(&self) {
        println!("\n=== Verification ({}) ===", self.algorithm.name());
        println!("Compared:        {}", humansize::format_size(self.len, humansize::BINARY));
        println!("Clusters:        {}", self.clusters);
        println!("Source digest:   {}", self.source_digest);
        println!("Target digest:   {}", self.target_digest);
        if self.is_match() {
            println!("Result:          MATCH");
        } else {
            println!("Result:          {} cluster(s) differ", self.mismatched.len());
            for cluster in self.mismatched.iter().take(16) {
                println!("  cluster {} (offset {})", cluster, cluster * self.cluster_size);
            }
        }
    }
}

/// Compare `target` against `source` cluster by cluster.
///
/// Both devices are read concurrently for each cluster. The target may be
/// longer than the source; only the source's length is compared.
pub async fn verify_volumes(
    source: &dyn BlockDevice,
    target: &dyn BlockDevice,
    cluster_size: u64,
    algorithm: HashAlgorithm,
) -> Result<VerifyReport> {
    let len = source.length().await.with_device(source.name())?;
    let target_len = target.length().await.with_device(target.name())?;
    if target_len < len {
        return Err(BackupError::TargetTooSmall {
            source_len: len,
            target_len,
        });
    }

    let clusters = len.div_ceil(cluster_size);
    let mut source_buf = vec![0u8; cluster_size as usize];
    let mut target_buf = vec![0u8; cluster_size as usize];
    let mut source_volume = Hasher::new(algorithm);
    let mut target_volume = Hasher::new(algorithm);
    let mut mismatched = Vec::new();

    for cluster in 0..clusters {
        let offset = cluster * cluster_size;
        let valid = cluster_size.min(len - offset) as usize;
        let src = &mut source_buf[..valid];
        let dst = &mut target_buf[..valid];

        futures::try_join!(
            async { source.read_at(offset, &mut *src).await.with_device(source.name()) },
            async { target.read_at(offset, &mut *dst).await.with_device(target.name()) },
        )?;

        source_volume.update(src);
        target_volume.update(dst);
        if cluster_digest(src, algorithm) != cluster_digest(dst, algorithm) {
            tracing::debug!("Cluster {} differs", cluster);
            mismatched.push(cluster);
        }
    }

    let report = VerifyReport {
        algorithm,
        len,
        cluster_size,
        clusters,
        mismatched,
        source_digest: source_volume.finalize(),
        target_digest: target_volume.finalize(),
    };
    tracing::info!(
        "Verified {} clusters of '{}' against '{}': {} mismatched",
        clusters,
        source.name(),
        target.name(),
        report.mismatched.len()
    );
    Ok(report)
}

fn cluster_digest(data: &[u8], algorithm: HashAlgorithm) -> Digest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}
