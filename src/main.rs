#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use proxyguard::server::bootstrap;

#[derive(Parser)]
#[command(
    name = "proxyguard",
    about = "Authenticating CONNECT proxy fronting a pool of upstream proxies"
)]
struct Cli {
    /// Proxy listen address (overrides PROXY_PORT)
    #[arg(short, long)]
    listen: Option<String>,

    /// Operator API listen address (overrides METRICS_PORT)
    #[arg(long)]
    metrics_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        listen: cli.listen,
        metrics_listen: cli.metrics_listen,
    }))
}
