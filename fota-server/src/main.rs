// fota-server: firmware repository daemon. Serves the artifacts listed in
// <repository_root>/repository.repo to nodes over UDP.

mod config;
mod transport;

use std::path::PathBuf;

use anyhow::Context;
use fota_core::{ArtifactDirectory, ChunkServer};
use tokio::net::UdpSocket;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: fota-server [--config <file.toml>] [--version]";

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fota-server {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            "--config" | "-c" => {
                config_path = Some(args.next().context("--config needs a path")?.into());
            }
            other => anyhow::bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fota_server=info,fota_core=info".into()),
        )
        .init();

    let cfg = config::load(config_path.as_deref());
    let directory = ArtifactDirectory::load(&cfg.repository_root)
        .with_context(|| format!("repository {}", cfg.repository_root.display()))?;
    info!(
        root = %cfg.repository_root.display(),
        artifacts = directory.len(),
        "manifest loaded"
    );
    let mut server = ChunkServer::new(directory, cfg.server_options());

    // one thread: datagrams are handled strictly in arrival order
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let addr = cfg.listen_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        info!(%addr, "listening");
        tokio::select! {
            r = transport::run(&socket, &mut server) => r.context("transport failed")?,
            r = shutdown_signal() => {
                r?;
                info!("shutting down");
            }
        }
        Ok(())
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
