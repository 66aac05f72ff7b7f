//! Spawn a server backed by a single file or in-memory export, for quick
//! testing; `nbd-server` (in `src/bin/server.rs`) is the full CLI with
//! filter and TLS support.

use std::fs::OpenOptions;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;

use nbd::backend::{Backend, FileBlocks, MemBlocks};
use nbd::concurrency::ThreadModel;
use nbd::config::ConnectArgs;
use nbd::handshake::SingleExport;
use nbd::server::Server;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    connect: ConnectArgs,

    #[clap(long)]
    no_create: bool,

    #[clap(short, long, default_value_t = 10)]
    size: usize,

    #[clap(short, long)]
    mem: bool,

    #[clap(default_value = "disk.img")]
    filename: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let create = !args.no_create;
    let size_bytes = args.size as u64 * 1024 * 1024;

    let backend: Arc<dyn Backend> = if args.mem {
        Arc::new(MemBlocks::new("default", size_bytes))
    } else {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&args.filename)?;
        file.set_len(size_bytes)?;
        Arc::new(FileBlocks::new("default", file))
    };

    let resolver = SingleExport::new("default", backend)?;
    Server::new(resolver, ThreadModel::Parallel).start(&args.connect.host, args.connect.port)
}
