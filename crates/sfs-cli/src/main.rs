#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sfs_block::{
    available_memory, cache_budget, FileProvider, Handshake, HostRequestProvider, HostSender,
};
use sfs_fuse::{MetricsSnapshot, MountConfig};
use sfs_session::{
    CommandHooks, CommandInstaller, RecoveryUi, ResultCode, SideloadConfig, SideloadController,
};
use sfs_types::{FileExtent, DAEMON_MODE_FLAG, DEFAULT_BLOCK_SIZE, EXIT_HOST_TOO_OLD};
use std::env;
use std::fs::File;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Serialize)]
struct ServeReport {
    mountpoint: PathBuf,
    file_size: u64,
    block_size: u32,
    cache_budget: usize,
    metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
struct SessionReport {
    result: ResultCode,
    wipe_cache: bool,
}

/// Prints progress messages on stdout.
struct ConsoleUi;

impl RecoveryUi for ConsoleUi {
    fn print(&self, message: &str) {
        if let Err(err) = write_progress(&mut std::io::stdout().lock(), message) {
            debug!(error = %err, "progress message not written");
        }
    }
}

fn write_progress(out: &mut impl Write, message: &str) -> std::io::Result<()> {
    out.write_all(message.as_bytes())?;
    out.flush()
}

fn main() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

/// Pull `--flag <value>` out of `args`.
fn take_option(args: &mut Vec<String>, flag: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{flag} requires a value");
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

fn block_size_arg(args: &mut Vec<String>) -> Result<u32> {
    match take_option(args, "--block-size")? {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid --block-size {raw:?}")),
        None => Ok(DEFAULT_BLOCK_SIZE),
    }
}

fn load_config(path: Option<&str>) -> Result<SideloadConfig> {
    match path {
        Some(path) => {
            SideloadConfig::load(path).with_context(|| format!("failed to load config {path}"))
        }
        None => Ok(SideloadConfig::default()),
    }
}

fn run() -> Result<i32> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return Ok(0);
    }
    let command = args.remove(0);

    match command.as_str() {
        DAEMON_MODE_FLAG => {
            let config_path = take_option(&mut args, "--config")?;
            let config = load_config(config_path.as_deref())?;
            daemon(&config)
        }
        "wait-for-package" => {
            let config_path = take_option(&mut args, "--config")?;
            let wipe_cache = take_flag(&mut args, "--wipe-cache");
            let json = take_flag(&mut args, "--json");
            let mut config = load_config(config_path.as_deref())?;
            if let (Some(path), None) = (&config_path, &config.companion_program) {
                // The companion re-reads the same file.
                config.companion_args.push("--config".to_owned());
                config.companion_args.push(path.clone());
            }
            wait_for_package(config, wipe_cache, json)
        }
        "serve-file" => {
            let mountpoint = take_option(&mut args, "--mountpoint")?;
            let block_size = block_size_arg(&mut args)?;
            let json = take_flag(&mut args, "--json");
            let Some(package) = args.first() else {
                bail!("serve-file requires <package>");
            };
            let mountpoint = mountpoint
                .map_or_else(|| SideloadConfig::default().mountpoint, PathBuf::from);
            serve_file(Path::new(package), &mountpoint, block_size, json)
        }
        "host-send" => {
            let block_size = block_size_arg(&mut args)?;
            let (Some(package), Some(addr)) = (args.first(), args.get(1)) else {
                bail!("host-send requires <package> <device-addr>");
            };
            host_send(Path::new(package), addr, block_size)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(0)
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("sideload\n");
    println!("USAGE:");
    println!("  sideload wait-for-package [--config <toml>] [--wipe-cache] [--json]");
    println!("  sideload serve-file <package> [--mountpoint <dir>] [--block-size <n>] [--json]");
    println!("  sideload host-send <package> <device-addr> [--block-size <n>]");
    println!("  sideload {DAEMON_MODE_FLAG} [--config <toml>]");
}

fn cache_budget_for(extent: FileExtent, reserve: u64) -> usize {
    match available_memory() {
        Ok(available) => cache_budget(available, reserve, extent),
        Err(err) => {
            warn!(error = %err, "cannot read available memory, caching disabled");
            0
        }
    }
}

fn mount_config(config: &SideloadConfig, cache_budget: usize) -> MountConfig {
    MountConfig {
        mountpoint: config.mountpoint.clone(),
        package_name: config.package_name.clone(),
        exit_name: config.exit_name.clone(),
        cache_budget,
        ..MountConfig::default()
    }
}

fn ensure_mountpoint(mountpoint: &Path) -> Result<()> {
    std::fs::create_dir_all(mountpoint)
        .with_context(|| format!("failed to create mountpoint {}", mountpoint.display()))
}

/// Companion mode: accept one host, then serve its package until the exit
/// sentinel is looked up.
fn daemon(config: &SideloadConfig) -> Result<i32> {
    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "waiting for host connection");
    let (mut stream, peer) = listener.accept().context("accept failed")?;
    drop(listener);
    stream.set_nodelay(true).context("set_nodelay failed")?;

    let handshake = Handshake::read_from(&mut stream).context("bad host handshake")?;
    info!(%peer, ?handshake, "host connected");
    if let Handshake::Legacy { file_size } = handshake {
        warn!(file_size, "host cannot serve blocks on request");
        return Ok(EXIT_HOST_TOO_OLD);
    }
    let extent = handshake.extent()?;

    ensure_mountpoint(&config.mountpoint)?;
    let budget = cache_budget_for(extent, config.memory_reserve);
    let metrics = sfs_fuse::serve(
        HostRequestProvider::new(stream),
        extent,
        &mount_config(config, budget),
    )
    .context("sideload mount failed")?;
    info!(?metrics, "host session complete");
    Ok(0)
}

fn wait_for_package(config: SideloadConfig, wipe_cache: bool, json: bool) -> Result<i32> {
    let installer = Arc::new(CommandInstaller::new(config.installer_command.clone()));
    let hooks = Box::new(CommandHooks::from_config(&config));
    let install_log = config.install_log.clone();
    let mut controller = SideloadController::new(config, installer, hooks);

    let mut wipe_cache = wipe_cache;
    let mut session = controller
        .start(Arc::new(ConsoleUi), &mut wipe_cache, install_log)
        .context("failed to start sideload session")?;
    let result = session.wait();
    drop(session);
    let report = SessionReport { result, wipe_cache };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("result: {:?}", report.result);
        if report.wipe_cache {
            println!("cache wipe requested");
        }
    }
    Ok(match report.result {
        ResultCode::Success => 0,
        ResultCode::Error => 1,
        ResultCode::None => 2,
    })
}

fn serve_file(package: &Path, mountpoint: &Path, block_size: u32, json: bool) -> Result<i32> {
    let provider = FileProvider::open(package, block_size)
        .with_context(|| format!("failed to open {}", package.display()))?;
    let extent = FileExtent::new(provider.len_bytes(), block_size)
        .with_context(|| format!("unusable package geometry for {}", package.display()))?;

    ensure_mountpoint(mountpoint)?;
    let budget = cache_budget_for(extent, SideloadConfig::default().memory_reserve);
    let mut mount = mount_config(&SideloadConfig::default(), budget);
    mount.mountpoint = mountpoint.to_owned();
    println!(
        "serving {} at {} (look up {} to finish)",
        package.display(),
        mount.package_path().display(),
        mount.exit_path().display()
    );

    let metrics = sfs_fuse::serve(provider, extent, &mount)
        .with_context(|| format!("failed to serve at {}", mountpoint.display()))?;
    let report = ServeReport {
        mountpoint: mountpoint.to_owned(),
        file_size: extent.file_size(),
        block_size,
        cache_budget: budget,
        metrics,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("requests:           {}", report.metrics.requests_total);
        println!("failed requests:    {}", report.metrics.requests_err);
        println!("bytes served:       {}", report.metrics.bytes_read);
        println!("integrity failures: {}", report.metrics.integrity_failures);
    }
    Ok(0)
}

fn host_send(package: &Path, addr: &str, block_size: u32) -> Result<i32> {
    let file =
        File::open(package).with_context(|| format!("failed to open {}", package.display()))?;
    let stream = TcpStream::connect(addr).with_context(|| format!("failed to connect to {addr}"))?;
    stream.set_nodelay(true).context("set_nodelay failed")?;

    let mut sender = HostSender::new(file, block_size, stream)?;
    let extent = sender.extent();
    println!(
        "sending {} ({} bytes, {} blocks of {})",
        package.display(),
        extent.file_size(),
        extent.file_blocks(),
        extent.block_size()
    );
    let served = sender.run().context("transfer failed")?;
    println!("served {served} block requests");
    Ok(0)
}
