//! Configuration module for BlockBackup
//!
//! Provides CLI arguments, size parsing and the runtime settings
//! a backup job is started with.

mod settings;

pub use settings::*;
