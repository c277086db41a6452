//! Cluster digests and volume verification
//!
//! Used after a backup to confirm the target matches the source. Supports
//! XXHash3, XXHash64, BLAKE3 and SHA-256.

mod digest;
mod verify;

pub use digest::*;
pub use verify::*;
