//! Progress reporting module
//!
//! Renders a running backup job as an indicatif progress bar, fed by
//! polling the job's [`JobInfo`](crate::core::JobInfo).

mod reporter;

pub use reporter::*;
