//! A daemon that tunnels BitTorrent traffic over murk onion circuits.
//!
//! murkd joins the overlay, keeps a pool of circuits warm, and serves
//! SOCKS5 on localhost, one instance per hop count.  Point a torrent
//! client at the first instance for one hop of cover, at the second for
//! two, and so on.  Hidden seeding and anonymous downloads ride the
//! rendezvous machinery in `murk-rend`.
//!
//! # Configuration
//!
//! A TOML file, passed with `--config`; every key is optional:
//!
//! ```toml
//! hops = 2
//! socks_listen_ports = [1080, 1081]
//! extend_timeout = "10s"
//! max_circuit_age = "30m"
//! state_dir = "/var/lib/murkd"
//! log_filter = "info"
//!
//! [[bootstrap]]
//! addr = "192.0.2.10:7000"
//! tunnel_key = "…64 hex digits…"
//! ```
//!
//! Exit status: 0 on a clean shutdown, 1 for a configuration problem,
//! 2 when a socket cannot be bound.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::semicolon_if_nothing_returned)]
// This is the binary; talking to the terminal is its job.
#![allow(clippy::print_stderr)]

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use murk_proto::TunnelKeypair;
use murk_rend::InMemoryDht;

use crate::config::MurkConfig;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "murkd",
    version,
    about = "Anonymous tunneling daemon: a local SOCKS5 front over onion circuits"
)]
struct Args {
    /// Path to the TOML configuration file; defaults apply without one.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured tracing filter.
    #[arg(short, long, value_name = "FILTER")]
    log_filter: Option<String>,
}

/// A failure main translates into a distinct exit status.
#[derive(Debug, thiserror::Error)]
enum Fatal {
    /// The configuration cannot be served.
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),
    /// A socket could not be bound.
    #[error("{0:#}")]
    Bind(anyhow::Error),
}

impl Fatal {
    /// The exit status this failure maps to.
    fn exit_code(&self) -> u8 {
        match self {
            Fatal::Config(_) => 1,
            Fatal::Bind(_) => 2,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("murkd: {e:#}");
            match e.downcast_ref::<Fatal>() {
                Some(fatal) => ExitCode::from(fatal.exit_code()),
                None => ExitCode::FAILURE,
            }
        }
    }
}

/// Load and check the configuration, then hand off to the runtime.
fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_deref())
        .and_then(|c| c.validate().map(|()| c))
        .map_err(|e| anyhow::Error::from(Fatal::Config(e)))?;

    let (filter, source) = match args.log_filter.as_deref() {
        Some(f) => (f, "--log-filter"),
        None => (config.log_filter.as_str(), "the log_filter option"),
    };
    setup_logging(filter, source);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

/// Read the configuration file, or fall back to the defaults.
fn load_config(path: Option<&Path>) -> Result<MurkConfig> {
    let Some(path) = path else {
        return Ok(MurkConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))
}

/// As [`EnvFilter::new`], but complain about invalid directives instead
/// of silently dropping them.
fn build_filter(directives: &str, source: &str) -> EnvFilter {
    match EnvFilter::try_new(directives) {
        Ok(filter) => filter,
        Err(_) => {
            eprintln!("murkd: invalid tracing directives in {source}: {directives:?}");
            EnvFilter::new("info")
        }
    }
}

/// Install the global tracing subscriber.
fn setup_logging(directives: &str, source: &str) {
    tracing_subscriber::registry()
        .with(fmt::Layer::default())
        .with(build_filter(directives, source))
        .init();
}

/// Bring the whole stack up and run until interrupted.
async fn serve(config: MurkConfig) -> Result<()> {
    let keypair = load_or_create_identity(config.state_dir.as_deref())?;
    info!(
        peer = %keypair.peer_id(),
        "murkd {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let handles = match murk_community::launch(config.community_config(), keypair).await {
        Ok(handles) => handles,
        Err(e @ murk_community::Error::Bind { .. }) => {
            return Err(Fatal::Bind(e.into()).into());
        }
        Err(e) => return Err(e.into()),
    };
    let community = handles.community;
    info!(addr = %community.local_descriptor().addr, "overlay socket bound");

    for desc in config.bootstrap_descriptors()? {
        community.add_candidate(desc);
    }

    let rend = murk_rend::launch(
        community.clone(),
        config.rend_config(),
        Arc::new(InMemoryDht::new()),
        handles.rend_events,
    );

    let proxy = match murk_proxy::launch(
        community.clone(),
        config.proxy_config(),
        handles.inbound,
        handles.circuit_events,
    )
    .await
    {
        Ok(proxy) => proxy,
        Err(e @ murk_proxy::Error::Bind { .. }) => {
            return Err(Fatal::Bind(e.into()).into());
        }
        Err(e) => return Err(e.into()),
    };
    for (i, addr) in proxy.listen_addrs().iter().enumerate() {
        info!(hops = i + 1, %addr, "SOCKS instance ready");
    }

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for interrupts")?;
    info!("interrupt received; shutting down");
    proxy.shutdown();
    rend.shutdown();
    community.shutdown();
    Ok(())
}

/// Load the persisted identity key, or mint one.
///
/// The key lives at `identity.key` under the state directory as hex.
/// Without a state directory every run gets a fresh identity.
fn load_or_create_identity(state_dir: Option<&Path>) -> Result<TunnelKeypair> {
    let Some(dir) = state_dir else {
        let mut rng = rand::thread_rng();
        return Ok(TunnelKeypair::generate(&mut rng));
    };
    let path = dir.join("identity.key");
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let bytes = hex::decode(text.trim())
                .map_err(|_| anyhow!("{} is not valid hex", path.display()))?;
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow!("{} must hold a 32 byte key", path.display()))?;
            Ok(TunnelKeypair::from_secret_bytes(secret))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
            let keypair = {
                let mut rng = rand::thread_rng();
                TunnelKeypair::generate(&mut rng)
            };
            write_identity(&path, &keypair)?;
            info!(path = %path.display(), "minted a new identity key");
            Ok(keypair)
        }
        Err(e) => {
            Err(anyhow::Error::from(e).context(format!("cannot read {}", path.display())))
        }
    }
}

/// Write the identity key with owner-only permissions.
fn write_identity(path: &Path, keypair: &TunnelKeypair) -> Result<()> {
    std::fs::write(path, hex::encode(keypair.secret_bytes()))
        .with_context(|| format!("cannot write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("cannot restrict {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn cli_declaration_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn exit_codes_distinguish_failures() {
        assert_eq!(Fatal::Config(anyhow!("x")).exit_code(), 1);
        assert_eq!(Fatal::Bind(anyhow!("x")).exit_code(), 2);
    }

    #[test]
    fn identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_identity(Some(dir.path())).unwrap();
        let second = load_or_create_identity(Some(dir.path())).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.public_bytes(), second.public_bytes());
    }

    #[test]
    fn corrupt_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("identity.key"), "not hex").unwrap();
        assert!(load_or_create_identity(Some(dir.path())).is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(Some(Path::new("/does/not/exist.toml"))).is_err());
    }
}
