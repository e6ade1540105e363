//! BlockIO CLI - Short-circuit read debugging
//!
//! This binary serves a local block file through an in-process storage node
//! and reads it back with a short-circuit block stream.

use anyhow::{Context, Result, bail};
use blockio_client::{LocalBlockInStream, LocalWorkerContext};
use blockio_common::{BlockId, BufferType, Config, InStreamOptions, WorkerNetAddress};
use blockio_storage::BlockWorker;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "blockio-cli")]
#[command(about = "BlockIO short-circuit read CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "BLOCKIO_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a byte range of a block file to stdout
    Read {
        /// Backing file of the block
        #[arg(long)]
        block_file: PathBuf,

        /// Block ID
        #[arg(long)]
        block_id: u64,

        /// First byte to read
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Bytes to read (default: to the end of the block)
        #[arg(long)]
        length: Option<u64>,

        /// Packet size in bytes (overrides the config file)
        #[arg(long)]
        packet_size: Option<usize>,

        /// Packet memory (overrides the config file)
        #[arg(long, value_enum)]
        buffer: Option<BufferArg>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BufferArg {
    Heap,
    Direct,
}

impl From<BufferArg> for BufferType {
    fn from(arg: BufferArg) -> Self {
        match arg {
            BufferArg::Heap => Self::Heap,
            BufferArg::Direct => Self::Direct,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&log_level, args.json_logs);

    match args.command {
        Commands::Read {
            block_file,
            block_id,
            offset,
            length,
            packet_size,
            buffer,
        } => {
            let mut config = config;
            if let Some(packet_size) = packet_size {
                config.short_circuit.packet_size = packet_size;
            }
            if let Some(buffer) = buffer {
                config.short_circuit.buffer_type = buffer.into();
            }
            config.validate()?;
            read_block(&config, &block_file, BlockId::new(block_id), offset, length)
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(log_level: &str, json: bool) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| log_level.into()),
    );
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn read_block(
    config: &Config,
    block_file: &Path,
    block_id: BlockId,
    offset: u64,
    length: Option<u64>,
) -> Result<()> {
    if !config.short_circuit.enabled {
        bail!("short-circuit reads are disabled in the configuration");
    }

    let address = WorkerNetAddress::new("localhost", 29999, 29998);
    let worker = Arc::new(BlockWorker::new(address.clone()));
    let block_size = worker
        .add_block(block_id, block_file)
        .with_context(|| format!("failed to register {}", block_file.display()))?;
    if offset > block_size {
        bail!("offset {offset} is past the end of block {block_id} ({block_size} bytes)");
    }

    let context = LocalWorkerContext::new();
    context.register_worker(Arc::clone(&worker));

    let options = InStreamOptions::from_config(config)?;
    let mut stream = LocalBlockInStream::open(block_id, block_size, &address, &context, &options)?;
    debug!(
        block_id = %block_id,
        lock_id = stream.lock_id(),
        path = %stream.block_path().display(),
        "block locked"
    );

    stream.seek(offset)?;
    let length = length.map_or(stream.remaining(), |len| len.min(stream.remaining()));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let copied = std::io::copy(&mut stream.by_ref().take(length), &mut out);
    let closed = stream.close();
    let copied = copied.context("failed to copy block data")?;
    out.flush()?;
    closed?;

    let stats = stream.allocator_stats();
    info!(
        block_id = %block_id,
        offset,
        bytes = copied,
        packets = stats.allocated.load(Ordering::Relaxed),
        packet_size = options.packet_size(),
        buffer_type = ?options.buffer_type(),
        "read complete"
    );
    info!(
        locks_granted = worker.stats().locks_granted.load(Ordering::Relaxed),
        unlocks = worker.stats().unlocks.load(Ordering::Relaxed),
        "lock statistics"
    );
    worker.log_summary();
    Ok(())
}
