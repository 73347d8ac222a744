//! Blob storage inspection tool
//!
//! Opens a storage file with either the page-cache or the memory-mapped
//! engine and runs one command against it.

use anyhow::{bail, Context};
use blobstore_rs::{
    BlobStorage, MappedBlobStorage, PagedBlobStorage, RecordId, StorageConfig, NULL_ID,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "blobstore")]
#[command(about = "Inspect and edit blob storage files")]
struct Args {
    /// Path to the storage file
    #[arg(short = 's', long)]
    storage: PathBuf,

    /// TOML storage configuration (page size, byte order, allocation)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Use the memory-mapped engine instead of the page cache
    #[arg(long)]
    mmap: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print header counters as JSON
    Info,
    /// List records in file order
    Scan {
        /// Stop after this many records
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Include moved and deleted records
        #[arg(short = 'a', long)]
        all: bool,
    },
    /// Write a record's payload to stdout or a file
    Get {
        id: RecordId,
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// Insert a new record, or replace an existing one with --id
    Put {
        #[arg(long)]
        id: Option<RecordId>,
        /// Read the payload from a file instead of stdin
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
        /// Keep the old id resolvable if the record has to move
        #[arg(long)]
        leave_redirect: bool,
    },
    /// Tombstone a record
    Delete { id: RecordId },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StorageConfig> {
    match path {
        Some(path) => StorageConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(StorageConfig::default()),
    }
}

fn read_payload(file: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    let mut payload = Vec::new();
    match file {
        Some(path) => {
            payload = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
        }
        None => {
            std::io::stdin().read_to_end(&mut payload)?;
        }
    }
    Ok(payload)
}

fn run<S: BlobStorage>(storage: &mut S, engine: &str, args: &Args) -> anyhow::Result<()> {
    match &args.command {
        Command::Info => {
            let stats = storage.stats();
            let report = json!({
                "storage": args.storage,
                "engine": engine,
                "storage_version": storage.storage_version()?,
                "data_format_version": storage.data_format_version()?,
                "size_in_bytes": storage.size_in_bytes(),
                "max_payload": storage.max_payload_supported(),
                "stats": stats,
                "utilization_percent": stats.utilization(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Scan { limit, all } => {
            let limit = limit.unwrap_or(usize::MAX);
            let mut shown = 0usize;
            storage.for_each(|record| {
                if record.is_actual() || *all {
                    println!(
                        "{:>10}  capacity={:<8} length={}",
                        record.id, record.capacity, record.length
                    );
                    shown += 1;
                }
                shown < limit
            })?;
        }
        Command::Get { id, output } => {
            let payload = storage.read_to_vec(*id)?;
            match output {
                Some(path) => std::fs::write(path, &payload)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => std::io::stdout().write_all(&payload)?,
            }
        }
        Command::Put {
            id,
            file,
            leave_redirect,
        } => {
            let payload = read_payload(file.as_deref())?;
            if payload.len() > storage.max_payload_supported() {
                bail!(
                    "payload of {} bytes exceeds the {} byte limit",
                    payload.len(),
                    storage.max_payload_supported()
                );
            }
            let written = match id {
                Some(id) if *id != NULL_ID => storage.update(*id, &payload, *leave_redirect)?,
                _ => storage.insert(&payload)?,
            };
            println!("{}", written);
        }
        Command::Delete { id } => {
            storage.delete_record(*id)?;
            info!(id, "deleted record");
        }
    }
    storage.close()?;
    Ok(())
}

fn execute(args: &Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;

    if args.mmap {
        let mut storage = MappedBlobStorage::open(&args.storage, &config)
            .with_context(|| format!("failed to open {}", args.storage.display()))?;
        run(&mut storage, "mmap", args)
    } else {
        let mut storage = PagedBlobStorage::open(&args.storage, &config)
            .with_context(|| format!("failed to open {}", args.storage.display()))?;
        run(&mut storage, "paged", args)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    execute(&Args::parse())
}
