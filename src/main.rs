#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use janus_proxy::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "janus-proxy",
    about = "Hostname-transforming reverse proxy for test-site traffic"
)]
struct Cli {
    /// Optional dotenv-style file merged under the process environment
    #[arg(short, long)]
    env_file: Option<PathBuf>,

    /// Admin API listen address (health/metrics/rules)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        env_file: cli.env_file,
        admin_listen: cli.admin_listen,
    }))
}
