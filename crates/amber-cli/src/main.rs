#![forbid(unsafe_code)]

use amber::{Blobfs, DirCookie, FormatOptions, MountOptions};
use amber_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use amber_types::Digest;
use anyhow::{bail, Context, Result};
use asupersync::Cx;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

fn cli_cx() -> Cx {
    Cx::for_request()
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "amber", about = "amberfs — content-addressed blob store toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format an image file as an empty filesystem.
    Mkfs {
        /// Path to the image file (must already exist and be block-sized).
        image: PathBuf,
        /// Node table capacity.
        #[arg(long, default_value_t = 512)]
        inodes: u64,
        /// Journal size in blocks.
        #[arg(long, default_value_t = 128)]
        journal_blocks: u64,
    },
    /// Print superblock geometry and usage.
    Inspect {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List stored blobs by digest.
    Ls { image: PathBuf },
    /// Add a blob from a file (or stdin with `-`), printing its digest.
    Add {
        image: PathBuf,
        /// Source path, or `-` for stdin.
        source: PathBuf,
    },
    /// Write a blob's contents to stdout.
    Cat {
        image: PathBuf,
        /// 64-hex-digit blob digest.
        digest: String,
    },
    /// Delete a blob.
    Rm {
        image: PathBuf,
        digest: String,
    },
    /// Run a read-only consistency check.
    Check {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
        /// Also read and verify every blob's contents.
        #[arg(long)]
        deep: bool,
    },
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    data_blocks: u64,
    journal_blocks: u64,
    inode_capacity: u64,
    allocated_blocks: u64,
    allocated_inodes: u64,
    slice_backed: bool,
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    blobs: u64,
    clean: bool,
    errors: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn open_device(image: &PathBuf) -> Result<Arc<dyn BlockDevice>> {
    let file = FileByteDevice::open(image)
        .with_context(|| format!("opening image {}", image.display()))?;
    let device = ByteBlockDevice::new(file).context("image is not block-aligned")?;
    Ok(Arc::new(device))
}

fn mount(image: &PathBuf, readonly: bool) -> Result<Arc<Blobfs>> {
    let device = open_device(image)?;
    let options = MountOptions {
        readonly,
        ..MountOptions::default()
    };
    Blobfs::mount(&cli_cx(), device, options, None).context("mount failed")
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let cx = cli_cx();

    match cli.command {
        Command::Mkfs {
            image,
            inodes,
            journal_blocks,
        } => {
            let device = open_device(&image)?;
            let sb = amber::format(
                &cx,
                device.as_ref(),
                FormatOptions {
                    inode_count: inodes,
                    journal_blocks,
                },
            )?;
            println!(
                "formatted: {} data blocks, {} inodes, {} journal blocks",
                sb.data_block_count, sb.inode_count, sb.journal_block_count
            );
            Ok(())
        }
        Command::Inspect { image, json } => {
            let fs = mount(&image, true)?;
            let sb = fs.info();
            let output = InspectOutput {
                block_size: sb.block_size,
                data_blocks: sb.data_block_count,
                journal_blocks: sb.journal_block_count,
                inode_capacity: sb.inode_count,
                allocated_blocks: sb.alloc_block_count,
                allocated_inodes: sb.alloc_inode_count,
                slice_backed: sb.is_fvm(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("block size:       {}", output.block_size);
                println!("data blocks:      {}", output.data_blocks);
                println!("journal blocks:   {}", output.journal_blocks);
                println!("inode capacity:   {}", output.inode_capacity);
                println!("allocated blocks: {}", output.allocated_blocks);
                println!("allocated inodes: {}", output.allocated_inodes);
                println!("slice backed:     {}", output.slice_backed);
            }
            fs.shutdown(&cx)?;
            Ok(())
        }
        Command::Ls { image } => {
            let fs = mount(&image, true)?;
            let mut cookie = DirCookie::default();
            loop {
                let entries = fs.readdir(&mut cookie, 64)?;
                if entries.is_empty() {
                    break;
                }
                for name in entries {
                    println!("{name}");
                }
            }
            fs.shutdown(&cx)?;
            Ok(())
        }
        Command::Add { image, source } => {
            let mut payload = Vec::new();
            if source.as_os_str() == "-" {
                std::io::stdin().read_to_end(&mut payload)?;
            } else {
                payload = std::fs::read(&source)
                    .with_context(|| format!("reading {}", source.display()))?;
            }

            let digest = amber_merkle_root(&payload)?;
            let fs = mount(&image, false)?;
            let blob = fs.new_blob(digest)?;
            blob.space_allocate(&cx, payload.len() as u64)?;
            blob.write_all(&cx, &payload)?;
            drop(blob);
            fs.sync(&cx)?;
            fs.shutdown(&cx)?;
            println!("{digest}");
            Ok(())
        }
        Command::Cat { image, digest } => {
            let digest: Digest = digest.parse().map_err(|_| {
                anyhow::anyhow!("digest must be 64 hex digits")
            })?;
            let fs = mount(&image, true)?;
            let blob = fs.open_blob(digest)?;
            let size = blob.size();
            let mut out = std::io::stdout().lock();
            let mut offset = 0_u64;
            let mut buf = vec![0_u8; 1 << 16];
            while offset < size {
                let read = blob.read_at(&cx, &mut buf, offset)?;
                if read == 0 {
                    bail!("short read at offset {offset}");
                }
                out.write_all(&buf[..usize::try_from(read)?])?;
                offset += read;
            }
            drop(blob);
            fs.shutdown(&cx)?;
            Ok(())
        }
        Command::Rm { image, digest } => {
            let digest: Digest = digest.parse().map_err(|_| {
                anyhow::anyhow!("digest must be 64 hex digits")
            })?;
            let fs = mount(&image, false)?;
            fs.unlink_blob(&digest)?;
            fs.sync(&cx)?;
            fs.shutdown(&cx)?;
            Ok(())
        }
        Command::Check { image, json, deep } => {
            let fs = mount(&image, true)?;
            let mut report = fs.fsck(&cx)?;
            if deep {
                let inode_count = fs.info().inode_count;
                for index in 0..inode_count {
                    let node = amber_types::NodeIndex(u32::try_from(index)?);
                    match fs.verify_blob(&cx, node) {
                        Ok(()) => {}
                        Err(amber_error::AmberError::NotFound(_)) => {}
                        Err(err) => report.errors.push(format!("node {index}: {err}")),
                    }
                }
            }
            let output = CheckOutput {
                blobs: report.blobs,
                clean: report.is_clean(),
                errors: report.errors.clone(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("blobs: {}", output.blobs);
                for error in &output.errors {
                    println!("error: {error}");
                }
                println!("status: {}", if output.clean { "clean" } else { "corrupt" });
            }
            fs.shutdown(&cx)?;
            if output.clean {
                Ok(())
            } else {
                bail!("filesystem is corrupt")
            }
        }
    }
}

/// Digest of a payload, computed the way the filesystem names blobs.
fn amber_merkle_root(payload: &[u8]) -> Result<Digest> {
    amber_merkle::root_digest(payload).map_err(|err| anyhow::anyhow!("digest failed: {err}"))
}
