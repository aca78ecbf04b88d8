// fota-fetch: download an artifact from a repository server and store it in a
// file and/or install it into a flash image.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use fota_core::client::DEFAULT_MAX_RETRIES;
use fota_core::ArtifactFetch;
use fota_tools::{
    install_image, load_layout, open_flash, parse_hex_u16, parse_hex_u32, parse_server_addr,
    run_fetch, DEFAULT_TIMEOUT,
};
use tokio::net::UdpSocket;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: fota-fetch <server[:port]> <artifact> [--out <file>] \
[--flash <image> [--layout <file.toml>] [--fw-version <hex>] [--uuid <hex>]] \
[--listen <addr:port>] [--timeout-ms <n>] [--retries <n>]";

struct Options {
    server: SocketAddr,
    artifact: String,
    out: Option<PathBuf>,
    flash: Option<PathBuf>,
    layout: Option<PathBuf>,
    fw_version: u16,
    uuid: u32,
    listen: SocketAddr,
    timeout: Duration,
    retries: u32,
}

enum Parsed {
    Run(Options),
    Exit,
}

fn parse_args() -> anyhow::Result<Parsed> {
    let mut positional = Vec::new();
    let mut out = None;
    let mut flash = None;
    let mut layout = None;
    let mut fw_version = 0;
    let mut uuid = 0;
    let mut listen: SocketAddr = "[::]:0".parse()?;
    let mut timeout = DEFAULT_TIMEOUT;
    let mut retries = DEFAULT_MAX_RETRIES;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().with_context(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fota-fetch {}", VERSION);
                return Ok(Parsed::Exit);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(Parsed::Exit);
            }
            "--out" | "-o" => out = Some(PathBuf::from(value("--out")?)),
            "--flash" => flash = Some(PathBuf::from(value("--flash")?)),
            "--layout" => layout = Some(PathBuf::from(value("--layout")?)),
            "--fw-version" => fw_version = parse_hex_u16(&value("--fw-version")?)?,
            "--uuid" => uuid = parse_hex_u32(&value("--uuid")?)?,
            "--listen" => {
                let s = value("--listen")?;
                listen = s.parse().with_context(|| format!("bad listen address {s:?}"))?;
            }
            "--timeout-ms" => {
                let ms: u64 = value("--timeout-ms")?.parse().context("--timeout-ms")?;
                timeout = Duration::from_millis(ms);
            }
            "--retries" => retries = value("--retries")?.parse().context("--retries")?,
            _ => positional.push(arg),
        }
    }
    let [server, artifact] = positional.as_slice() else {
        bail!("{USAGE}");
    };
    if out.is_none() && flash.is_none() {
        bail!("nothing to do: give --out and/or --flash\n{USAGE}");
    }
    Ok(Parsed::Run(Options {
        server: parse_server_addr(server)?,
        artifact: artifact.clone(),
        out,
        flash,
        layout,
        fw_version,
        uuid,
        listen,
        timeout,
        retries,
    }))
}

fn main() -> anyhow::Result<()> {
    fota_tools::init_tracing();
    let opts = match parse_args()? {
        Parsed::Run(opts) => opts,
        Parsed::Exit => return Ok(()),
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let image = rt.block_on(async {
        // redirects are sent to the node port; bind it with --listen to follow them
        let socket = UdpSocket::bind(opts.listen)
            .await
            .with_context(|| format!("bind {}", opts.listen))?;
        info!(server = %opts.server, artifact = %opts.artifact, "fetching");
        let mut fetch = ArtifactFetch::new(opts.server, &opts.artifact).with_max_retries(opts.retries);
        tokio::select! {
            r = run_fetch(&socket, &mut fetch, opts.timeout) => r,
            _ = tokio::signal::ctrl_c() => bail!("interrupted"),
        }
    })?;
    println!("Received {} ({} bytes)", opts.artifact, image.len());

    if let Some(path) = &opts.out {
        std::fs::write(path, &image).with_context(|| format!("write {}", path.display()))?;
        println!("Written to {}", path.display());
    }
    if let Some(path) = &opts.flash {
        let layout = load_layout(opts.layout.as_deref())?;
        let mut slots = open_flash(path, layout)?;
        let slot = install_image(&mut slots, &image, opts.fw_version, opts.uuid)?;
        println!("Installed in slot {slot} of {}", path.display());
    }
    Ok(())
}
