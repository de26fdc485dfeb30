#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use snapstore_block::{ByteDevice, FileByteDevice};
use snapstore_core::{journal, leaf, FormatOptions, SnapStore};
use snapstore_server::Server;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snapstore", about = "Copy-on-write block snapshot store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a snapshot store on the given devices.
    Format {
        /// Metadata device or image file.
        #[arg(long)]
        meta: PathBuf,
        /// Snapshot-data device; may equal the metadata device.
        #[arg(long)]
        snap: PathBuf,
        /// Origin volume being snapshotted.
        #[arg(long)]
        origin: PathBuf,
        /// Metadata chunk size, log2 bytes.
        #[arg(long, default_value = "12")]
        meta_chunk_bits: u32,
        /// Snapshot-data chunk size, log2 bytes (split devices only).
        #[arg(long, default_value = "12")]
        snap_chunk_bits: u32,
        /// Journal size in bytes; accepts k/m/g suffixes.
        #[arg(long, default_value = "1m")]
        journal_size: String,
    },
    /// Run the snapshot daemon on a Unix socket.
    Serve {
        #[arg(long)]
        meta: PathBuf,
        #[arg(long)]
        snap: PathBuf,
        #[arg(long)]
        origin: PathBuf,
        /// Server socket path.
        #[arg(long)]
        socket: PathBuf,
    },
    /// Print the exception tree and journal of an offline store.
    Dump {
        #[arg(long)]
        meta: PathBuf,
        #[arg(long)]
        snap: PathBuf,
        #[arg(long)]
        origin: PathBuf,
        /// Show the exception tree leaves.
        #[arg(long)]
        tree: bool,
        /// Show the journal ring.
        #[arg(long)]
        journal: bool,
    },
}

/// Parse a byte count with an optional k/m/g suffix.
fn parse_bytes(text: &str) -> Result<u32> {
    let text = text.trim();
    let (digits, shift) = match text.as_bytes().last() {
        Some(b'k' | b'K') => (&text[..text.len() - 1], 10),
        Some(b'm' | b'M') => (&text[..text.len() - 1], 20),
        Some(b'g' | b'G') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    let base: u32 = digits.parse().context("invalid byte count")?;
    base.checked_shl(shift)
        .filter(|bytes| *bytes > 0)
        .with_context(|| format!("byte count out of range: {text}"))
}

/// Open the three devices; a shared path means one device and one
/// allocator space.
fn open_devices(
    meta: &PathBuf,
    snap: &PathBuf,
    origin: &PathBuf,
) -> Result<(Arc<dyn ByteDevice>, Arc<dyn ByteDevice>, Arc<dyn ByteDevice>)> {
    let metadev: Arc<dyn ByteDevice> = Arc::new(
        FileByteDevice::open(meta).with_context(|| format!("open {}", meta.display()))?,
    );
    let snapdev: Arc<dyn ByteDevice> = if snap == meta {
        Arc::clone(&metadev)
    } else {
        Arc::new(FileByteDevice::open(snap).with_context(|| format!("open {}", snap.display()))?)
    };
    let orgdev: Arc<dyn ByteDevice> = Arc::new(
        FileByteDevice::open(origin).with_context(|| format!("open {}", origin.display()))?,
    );
    Ok((metadev, snapdev, orgdev))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .compact()
        .init();

    match Cli::parse().command {
        Command::Format {
            meta,
            snap,
            origin,
            meta_chunk_bits,
            snap_chunk_bits,
            journal_size,
        } => {
            let (metadev, snapdev, orgdev) = open_devices(&meta, &snap, &origin)?;
            let journal_bytes = parse_bytes(&journal_size)?;
            let store = SnapStore::format(
                metadev,
                snapdev,
                orgdev,
                FormatOptions {
                    meta_chunksize_bits: meta_chunk_bits,
                    snap_chunksize_bits: snap_chunk_bits,
                    journal_bytes,
                },
            )
            .context("format snapshot store")?;
            info!(
                journal_size = store.image.journal_size,
                orgsectors = store.image.orgsectors,
                "snapshot store initialized"
            );
            Ok(())
        }
        Command::Serve {
            meta,
            snap,
            origin,
            socket,
        } => {
            let (metadev, snapdev, orgdev) = open_devices(&meta, &snap, &origin)?;
            let store =
                SnapStore::open(metadev, snapdev, orgdev).context("load snapshot store")?;
            let mut server = Server::bind(store, &socket).context("bind server socket")?;
            server.run().context("snapshot server")?;
            Ok(())
        }
        Command::Dump {
            meta,
            snap,
            origin,
            tree,
            journal,
        } => {
            let (metadev, snapdev, orgdev) = open_devices(&meta, &snap, &origin)?;
            let mut store =
                SnapStore::open(metadev, snapdev, orgdev).context("load snapshot store")?;
            if !tree && !journal {
                bail!("nothing to dump; pass --tree and/or --journal");
            }
            if tree {
                println!(
                    "etree: root {:#x}, {} level(s)",
                    store.image.etree_root.0, store.image.etree_levels
                );
                let mut lines = Vec::new();
                store
                    .traverse_leaves(&mut |block| lines.push(leaf::format_leaf(block)))
                    .context("walk exception tree")?;
                for line in lines {
                    println!("  {line}");
                }
            }
            if journal {
                println!(
                    "journal: base {:#x}, {} slots, next {}",
                    store.image.journal_base.0, store.image.journal_size, store.image.journal_next
                );
                for slot in 0..store.image.journal_size {
                    let sector = store.journal_sector(slot);
                    let buffer = store.cache.bread(sector).context("read journal slot")?;
                    println!("  {}", journal::format_slot(slot, &buffer.data()));
                }
            }
            Ok(())
        }
    }
}
