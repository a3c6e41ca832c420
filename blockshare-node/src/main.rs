// BlockShare node: serves a folder to peers and downloads files from them.

mod config;
mod console;

use std::path::PathBuf;

use anyhow::{bail, Context};
use blockshare_core::WorkFolder;
use blockshare_node::Node;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: blockshare <port> <folder>";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("blockshare {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let [port, folder] = args.as_slice() else {
        bail!(USAGE);
    };
    let port: u16 = port.parse().with_context(|| format!("invalid port: {port}"))?;
    let folder = PathBuf::from(folder);

    let cfg = config::load();
    let core_cfg = cfg.core();
    let catalog = WorkFolder::open(&folder, &core_cfg)
        .with_context(|| format!("cannot open folder {}", folder.display()))?;
    info!(files = catalog.entries().len(), "catalog indexed");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::net::lookup_host((cfg.host.as_str(), port))
            .await
            .with_context(|| format!("unknown host: {}", cfg.host))?;
        let node = Node::bind(cfg.host.clone(), port, catalog, core_cfg)
            .await
            .with_context(|| format!("cannot listen on port {port}"))?;
        node.start_server_async();
        tokio::select! {
            r = console::run(node.clone()) => r?,
            r = shutdown_signal() => r?,
        }
        node.shutdown();
        info!("node stopped");
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
