//! Full NBD server CLI: file, memory, or kernel-device backed exports,
//! with an optional TLS listener and a demonstration logging filter.

use std::fs::File;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use nbd::backend::{Backend, FileBlocks, LoggingFilter, MemBlocks};
use nbd::config::{ConnectArgs, DebugArgs};
use nbd::handshake::SingleExport;
use nbd::server::Server;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    connect: ConnectArgs,

    #[command(flatten)]
    debug: DebugArgs,

    /// Wrap the export in the demonstration logging filter.
    #[arg(long)]
    log_requests: bool,

    #[command(subcommand)]
    subcommand: Subcommands,
}

const DEFAULT_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Spawn a server backed by memory
    Memory {
        /// Size of backing storage
        #[arg(short, long, default_value_t = DEFAULT_SIZE)]
        size: u64,
    },
    /// Spawn a server backed by a file
    File {
        /// Size of backing storage
        #[arg(short, long, default_value_t = DEFAULT_SIZE)]
        size: u64,

        /// Don't create/truncate existing file
        #[arg(long)]
        no_create: bool,

        /// Path to the backing file
        path: String,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let debug = args.debug.parsed();

    let backend: Arc<dyn Backend> = match args.subcommand {
        Subcommands::Memory { size } => Arc::new(MemBlocks::new("default", size)),
        Subcommands::File {
            size,
            no_create,
            path,
        } => {
            let file = File::options()
                .read(true)
                .write(true)
                .create(!no_create)
                .truncate(!no_create)
                .open(&path)?;
            file.set_len(size)?;
            Arc::new(FileBlocks::new("default", file))
        }
    };

    let backend: Arc<dyn Backend> = if args.log_requests {
        let level = debug
            .get("loggingfilter", "level")
            .and_then(|v| v.parse().ok())
            .unwrap_or(log::Level::Debug);
        Arc::new(LoggingFilter::with_level(backend, level))
    } else {
        backend
    };

    let model = backend.thread_model();
    let resolver = SingleExport::new("default", backend)?;
    debug.warn_unused();
    Server::new(resolver, model).start(&args.connect.host, args.connect.port)
}
