//! Backup engine core
//!
//! Leaf-first: the copied-cluster bitmap, the in-flight range registry,
//! the scan rate limiter, the error policy, the cluster copy engine and
//! the job orchestrator that ties them together.

mod bitmap;
mod copier;
mod job;
mod policy;
mod range_lock;
mod throttle;

pub use bitmap::*;
pub use copier::*;
pub use job::*;
pub use policy::*;
pub use range_lock::*;
pub use throttle::*;
