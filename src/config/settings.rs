//! Configuration settings for BlockBackup
//!
//! Defines the CLI arguments, the runtime configuration derived from them,
//! and the value enums shared with the engine.

use crate::core::{BackupOptions, DEFAULT_CLUSTER_SIZE};
use crate::error::{BackupError, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// BlockBackup - live incremental copy-on-write backup of block volumes
#[derive(Parser, Debug, Clone)]
#[command(name = "blockbackup")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(args_conflicts_with_subcommands = true)]
#[command(about = "Point-in-time backup of a block volume that stays in use")]
#[command(long_about = r#"
BlockBackup copies a block volume (image file or block device) to a target
while the source keeps being written. Every cluster that exists when the job
starts is copied exactly once: writes to the source first push the old
content of the clusters they touch to the target.

Examples:
  blockbackup disk.img backup.img --create-target    # Full backup
  blockbackup /dev/vdb backup.img --speed 50M -p     # Throttled, with progress
  blockbackup disk.img backup.img --verify blake3    # Backup then verify
  blockbackup verify disk.img backup.img             # Compare two volumes
"#)]
pub struct CliArgs {
    /// Source volume (image file or block device)
    #[arg(value_name = "SOURCE")]
    pub source: Option<PathBuf>,

    /// Target volume
    #[arg(value_name = "TARGET")]
    pub target: Option<PathBuf>,

    /// Scan speed limit in bytes per second (e.g. 50M, 0 = unlimited)
    #[arg(short = 's', long, default_value = "0", value_name = "RATE")]
    pub speed: String,

    /// Action on source read errors
    #[arg(long, value_enum, default_value = "report", value_name = "ACTION")]
    pub on_source_error: OnError,

    /// Action on target write errors
    #[arg(long, value_enum, default_value = "report", value_name = "ACTION")]
    pub on_target_error: OnError,

    /// Copy granularity (power of two, at least 512)
    #[arg(long, default_value = "64K", value_name = "SIZE")]
    pub cluster_size: String,

    /// Create the target, or grow it to the source length
    #[arg(long)]
    pub create_target: bool,

    /// Verify the target against the source after the backup
    #[arg(
        long,
        value_enum,
        value_name = "ALGO",
        num_args = 0..=1,
        default_missing_value = "xxhash3"
    )]
    pub verify: Option<HashAlgorithm>,

    /// Show a progress bar
    #[arg(short = 'p', long)]
    pub progress: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Output format for the final report
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormat,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Compare two volumes cluster by cluster
    #[command(name = "verify")]
    Verify {
        /// Source volume
        source: PathBuf,
        /// Target volume
        target: PathBuf,
        /// Hash algorithm
        #[arg(long, value_enum, default_value = "xxhash3")]
        algorithm: HashAlgorithm,
        /// Comparison granularity
        #[arg(long, default_value = "64K", value_name = "SIZE")]
        cluster_size: String,
    },

    /// Show the size and cluster layout of a volume
    #[command(name = "info")]
    Info {
        /// Volume path
        path: PathBuf,
        /// Cluster size used for the layout
        #[arg(long, default_value = "64K", value_name = "SIZE")]
        cluster_size: String,
    },
}

/// Per-side reaction to an I/O error during a cluster copy
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Fail the job with the error
    #[default]
    #[value(name = "report")]
    Report,
    /// Skip the cluster and keep going (the backup becomes inconsistent)
    #[value(name = "ignore")]
    Ignore,
    /// Pause the job until it is resumed or cancelled
    #[value(name = "stop")]
    Stop,
    /// Pause on out-of-space errors, report anything else
    #[value(name = "enospc")]
    Enospc,
}

impl OnError {
    /// Pausing actions need the device to track its I/O status
    pub fn requires_io_status(&self) -> bool {
        matches!(self, Self::Stop | Self::Enospc)
    }

    /// Lowercase name as accepted on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Ignore => "ignore",
            Self::Stop => "stop",
            Self::Enospc => "enospc",
        }
    }
}

/// Hash algorithm for post-backup verification
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// XXHash3 - Ultra fast, non-cryptographic (128-bit)
    #[default]
    #[value(name = "xxhash3")]
    XXHash3,
    /// XXHash64 - Fast, non-cryptographic (64-bit)
    #[value(name = "xxhash64")]
    XXHash64,
    /// BLAKE3 - Fast and cryptographically secure
    #[value(name = "blake3")]
    Blake3,
    /// SHA-256 - Standard cryptographic hash
    #[value(name = "sha256")]
    Sha256,
}

impl HashAlgorithm {
    /// Digest size in bytes
    pub fn output_size(&self) -> usize {
        match self {
            Self::XXHash3 => 16,
            Self::XXHash64 => 8,
            Self::Blake3 | Self::Sha256 => 32,
        }
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::XXHash3 => "XXHash3",
            Self::XXHash64 => "XXHash64",
            Self::Blake3 => "BLAKE3",
            Self::Sha256 => "SHA-256",
        }
    }
}

/// Output format for reports
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON format
    Json,
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Source volume path
    pub source: PathBuf,
    /// Target volume path
    pub target: PathBuf,
    /// Scan speed in bytes per second (0 = unlimited)
    pub speed: u64,
    /// Action on source read errors
    pub on_source_error: OnError,
    /// Action on target write errors
    pub on_target_error: OnError,
    /// Cluster size in bytes
    pub cluster_size: u64,
    /// Create or grow the target before starting
    pub create_target: bool,
    /// Verification after the backup
    pub verify: Option<HashAlgorithm>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            target: PathBuf::new(),
            speed: 0,
            on_source_error: OnError::Report,
            on_target_error: OnError::Report,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            create_target: false,
            verify: None,
        }
    }
}

impl BackupConfig {
    /// Create config from CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let source = args
            .source
            .clone()
            .ok_or_else(|| BackupError::config("source volume required"))?;
        let target = args
            .target
            .clone()
            .ok_or_else(|| BackupError::config("target volume required"))?;

        if source == target {
            return Err(BackupError::config(format!(
                "source and target are the same path: {}",
                source.display()
            )));
        }

        let speed = parse_speed(&args.speed)
            .map_err(|reason| BackupError::invalid_parameter("speed", reason))?;
        let cluster_size = parse_cluster_size(&args.cluster_size)?;

        Ok(Self {
            source,
            target,
            speed,
            on_source_error: args.on_source_error,
            on_target_error: args.on_target_error,
            cluster_size,
            create_target: args.create_target,
            verify: args.verify,
        })
    }

    /// Options handed to the engine when the job starts
    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            speed: i64::try_from(self.speed).unwrap_or(i64::MAX),
            on_source_error: self.on_source_error,
            on_target_error: self.on_target_error,
            cluster_size: self.cluster_size,
        }
    }
}

/// Parse human-readable size string to bytes.
///
/// Accepts an optional `K`, `M`, `G` or `T` binary suffix, optionally
/// followed by `B`, and fractional numbers such as `1.5M`.
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let upper = size.trim().to_uppercase();
    if upper.is_empty() {
        return Err("Empty size string".to_string());
    }

    let digits = upper.strip_suffix('B').unwrap_or(&upper);
    let (number, multiplier) = match digits.chars().last() {
        Some('K') => (&digits[..digits.len() - 1], 1u64 << 10),
        Some('M') => (&digits[..digits.len() - 1], 1u64 << 20),
        Some('G') => (&digits[..digits.len() - 1], 1u64 << 30),
        Some('T') => (&digits[..digits.len() - 1], 1u64 << 40),
        _ => (digits, 1u64),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", number.trim()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("Size must not be negative: {}", size.trim()));
    }

    let bytes = value * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return Err(format!("Size too large: {}", size.trim()));
    }
    Ok(bytes as u64)
}

/// Parse a speed limit: a size per second, `0` or `unlimited`
pub fn parse_speed(speed: &str) -> std::result::Result<u64, String> {
    let speed = speed.trim();
    if speed.eq_ignore_ascii_case("unlimited") {
        return Ok(0);
    }
    let per_second = speed
        .strip_suffix("/s")
        .or_else(|| speed.strip_suffix("/S"))
        .unwrap_or(speed);
    parse_size(per_second)
}

/// Parse and validate a cluster size
pub fn parse_cluster_size(size: &str) -> Result<u64> {
    let bytes =
        parse_size(size).map_err(|reason| BackupError::invalid_parameter("cluster-size", reason))?;
    validate_cluster_size(bytes)?;
    Ok(bytes)
}

/// Cluster sizes must be powers of two of at least 512 bytes
pub fn validate_cluster_size(bytes: u64) -> Result<()> {
    if bytes < 512 || !bytes.is_power_of_two() {
        return Err(BackupError::invalid_parameter(
            "cluster-size",
            format!("{} is not a power of two of at least 512 bytes", bytes),
        ));
    }
    Ok(())
}
