//! BlockBackup CLI - point-in-time backup of a block volume

use anyhow::Context;
use blockbackup::config::{
    parse_cluster_size, BackupConfig, CliArgs, Commands, HashAlgorithm, OutputFormat,
};
use blockbackup::core::{start_backup, JobReport};
use blockbackup::device::{volume_length, BlockDevice, FileDevice};
use blockbackup::hash::{verify_volumes, VerifyReport};
use blockbackup::progress::{follow_job, ProgressReporter};
use clap::Parser;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging(&args);

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so JSON output on stdout stays parseable.
/// `RUST_LOG` overrides the level picked from `-v`/`-q`.
fn init_logging(args: &CliArgs) {
    let level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn run(args: CliArgs) -> anyhow::Result<ExitCode> {
    if let Some(cmd) = &args.command {
        return handle_command(cmd, &args);
    }

    if args.source.is_none() || args.target.is_none() {
        eprintln!("Usage: blockbackup <SOURCE> <TARGET> [OPTIONS]");
        eprintln!("       blockbackup verify <SOURCE> <TARGET>");
        eprintln!("       blockbackup info <PATH>");
        eprintln!("\nRun 'blockbackup --help' for more information.");
        return Ok(ExitCode::FAILURE);
    }

    let config = BackupConfig::from_cli(&args)?;
    if args.verbose > 0 && args.output_format == OutputFormat::Text {
        print_config(&config);
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(run_backup(&args, &config))
}

fn handle_command(cmd: &Commands, args: &CliArgs) -> anyhow::Result<ExitCode> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;

    match cmd {
        Commands::Verify {
            source,
            target,
            algorithm,
            cluster_size,
        } => {
            let cluster_size = parse_cluster_size(cluster_size)?;
            let source = FileDevice::open(source)?;
            let target = FileDevice::open(target)?;

            let report =
                runtime.block_on(verify_volumes(&source, &target, cluster_size, *algorithm))?;
            match args.output_format {
                OutputFormat::Text => report.print_summary(),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }

            Ok(if report.is_match() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Info { path, cluster_size } => {
            let cluster_size = parse_cluster_size(cluster_size)?;
            let device = FileDevice::open(path)?;
            let info = runtime.block_on(volume_info(&device, cluster_size))?;

            match args.output_format {
                OutputFormat::Text => {
                    println!("=== Volume ===");
                    println!("Path:            {}", path.display());
                    println!(
                        "Size:            {} ({} bytes)",
                        humansize::format_size(info.len, humansize::BINARY),
                        info.len
                    );
                    println!(
                        "Cluster size:    {}",
                        humansize::format_size(info.cluster_size, humansize::BINARY)
                    );
                    println!("Clusters:        {}", info.clusters);
                    println!("Zero clusters:   {}", info.zero_clusters);
                    println!("Writable:        {}", device.is_writable());
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_backup(args: &CliArgs, config: &BackupConfig) -> anyhow::Result<ExitCode> {
    let source = Arc::new(FileDevice::open(&config.source)?);
    let len = source
        .length()
        .await
        .with_context(|| format!("failed to read length of {}", config.source.display()))?;

    let target = Arc::new(open_target(&config.target, len, config.create_target)?);

    let reporter = if args.progress && !args.quiet && args.output_format == OutputFormat::Text {
        ProgressReporter::new(len)
    } else {
        ProgressReporter::disabled()
    };

    let handle = start_backup(source.clone(), target.clone(), config.backup_options(), |report| {
        tracing::debug!("Completion callback: {:?}", report.status);
    })
    .await?;

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling backup");
            interrupt.cancel();
        }
    });

    let report = follow_job(&handle, &reporter).await?;

    let verification = match config.verify {
        Some(algorithm) if report.is_success() => Some(
            verify_target(
                source.as_ref(),
                target.as_ref(),
                config.cluster_size,
                algorithm,
            )
            .await?,
        ),
        _ => None,
    };

    print_results(args, config, &report, verification.as_ref())?;

    let verified = verification.as_ref().map_or(true, VerifyReport::is_match);
    Ok(if report.is_success() && verified {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Open the target, creating or growing it to `len` when allowed
fn open_target(path: &Path, len: u64, create: bool) -> anyhow::Result<FileDevice> {
    if !create {
        return Ok(FileDevice::open(path)?);
    }

    if !path.exists() {
        tracing::info!("Creating target {} ({} bytes)", path.display(), len);
        return Ok(FileDevice::create(path, len)?);
    }

    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let current = volume_length(&file)?;
    // Block devices cannot be resized; start_backup rejects one that is too small
    if current < len && file.metadata()?.is_file() {
        tracing::info!("Growing target {} from {} to {} bytes", path.display(), current, len);
        file.set_len(len)
            .with_context(|| format!("failed to grow {}", path.display()))?;
    }
    drop(file);

    Ok(FileDevice::open(path)?)
}

async fn verify_target(
    source: &dyn BlockDevice,
    target: &dyn BlockDevice,
    cluster_size: u64,
    algorithm: HashAlgorithm,
) -> anyhow::Result<VerifyReport> {
    tracing::info!("Verifying target with {}", algorithm.name());
    let report = verify_volumes(source, target, cluster_size, algorithm)
        .await
        .context("verification failed")?;
    if !report.is_match() {
        tracing::error!("{} cluster(s) differ after backup", report.mismatched.len());
    }
    Ok(report)
}

#[derive(Serialize)]
struct BackupOutput<'a> {
    config: &'a BackupConfig,
    report: &'a JobReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification: Option<&'a VerifyReport>,
}

fn print_results(
    args: &CliArgs,
    config: &BackupConfig,
    report: &JobReport,
    verification: Option<&VerifyReport>,
) -> anyhow::Result<()> {
    match args.output_format {
        OutputFormat::Json => {
            let output = BackupOutput {
                config,
                report,
                verification,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            if !args.quiet || !report.is_success() {
                report.print_summary();
            }
            if let Some(verification) = verification {
                verification.print_summary();
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct VolumeInfo {
    len: u64,
    cluster_size: u64,
    clusters: u64,
    zero_clusters: u64,
}

async fn volume_info(device: &dyn BlockDevice, cluster_size: u64) -> anyhow::Result<VolumeInfo> {
    let len = device.length().await?;
    let clusters = len.div_ceil(cluster_size);
    let mut buf = vec![0u8; cluster_size as usize];
    let mut zero_clusters = 0;

    for cluster in 0..clusters {
        let offset = cluster * cluster_size;
        let valid = cluster_size.min(len - offset) as usize;
        device
            .read_at(offset, &mut buf[..valid])
            .await
            .with_context(|| format!("failed to read cluster {}", cluster))?;
        if buf[..valid].iter().all(|&b| b == 0) {
            zero_clusters += 1;
        }
    }

    Ok(VolumeInfo {
        len,
        cluster_size,
        clusters,
        zero_clusters,
    })
}

fn print_config(config: &BackupConfig) {
    let speed = if config.speed == 0 {
        "unlimited".to_string()
    } else {
        format!("{}/s", humansize::format_size(config.speed, humansize::BINARY))
    };

    println!("=== Configuration ===");
    println!("Source:          {}", config.source.display());
    println!("Target:          {}", config.target.display());
    println!("Speed:           {}", speed);
    println!("Cluster size:    {}", humansize::format_size(config.cluster_size, humansize::BINARY));
    println!("On source error: {}", config.on_source_error.name());
    println!("On target error: {}", config.on_target_error.name());
    println!("Create target:   {}", config.create_target);
    println!(
        "Verify:          {}",
        config.verify.map_or("disabled", |algorithm| algorithm.name())
    );
    println!();
}
