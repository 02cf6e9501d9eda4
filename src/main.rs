//! Wookiee Unicaster CLI.
//!
//! Parses the operator flags and the optional settings file, assembles the
//! immutable run configuration, and drives the engine for the selected
//! role until SIGINT/SIGTERM.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use wookiee_unicaster::config::{
    self, RelayConfig, Role, RoleConfig, Settings, DEFAULT_CLIENT_RELAY_BASE_PORT,
    DEFAULT_SERVER_RELAY_BASE_PORT,
};
use wookiee_unicaster::{ClientEngine, RelayError, RelayStats, ServerEngine};

/// Settings file probed when `--config` is not given.
const DEFAULT_SETTINGS_PATH: &str = "wookiee-unicaster.toml";

/// Process-wide stopping flag. Raised by the signal handler, checked by the
/// engine loop on every tick.
static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(
    name = "wookiee-unicaster",
    version,
    about = "Relays UDP traffic between remote peers and a LAN game server \
             through a public IP host, for playing Direct IP games over the internet"
)]
struct Cli {
    /// Run location: server (public relay host) or client (game LAN host)
    #[arg(short, long, value_enum)]
    mode: Role,

    /// Local network interface to bind (its first IPv4 address is used)
    #[arg(short = 'e', long, conflicts_with = "local_ip")]
    interface: Option<String>,

    /// Local IPv4 address to bind
    #[arg(short, long)]
    local_ip: Option<Ipv4Addr>,

    /// Port the server listens on for remote peer traffic
    #[arg(short, long)]
    iport: Option<u16>,

    /// Game server port the client delivers traffic to
    #[arg(short, long)]
    oport: Option<u16>,

    /// Public IP of the relay server (client mode)
    #[arg(short = 's', long)]
    source_ip: Option<Ipv4Addr>,

    /// LAN IP of the game server (client mode)
    #[arg(short = 'd', long)]
    dest_ip: Option<Ipv4Addr>,

    /// Number of remote peers to relay, identical on both endpoints
    #[arg(short, long, default_value_t = 1)]
    peers: u8,

    /// First relay port; slot i uses this port + i on both endpoints
    #[arg(long, default_value_t = DEFAULT_SERVER_RELAY_BASE_PORT)]
    server_relay_base_port: u16,

    /// First client-side source port toward the game server
    #[arg(long, default_value_t = DEFAULT_CLIENT_RELAY_BASE_PORT)]
    client_relay_base_port: u16,

    /// Settings file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Suppress all non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("wookiee-unicaster: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<(), RelayError> {
    let (settings, unknown_keys) = load_settings(cli.config.as_deref())?;

    let level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        settings.logging.level.to_filter()
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.to_string()),
    )
    .init();

    for key in &unknown_keys {
        log::warn!("ignoring unknown settings key '{}'", key);
    }

    let cfg = build_config(&cli, &settings)?;
    cfg.validate()?;

    install_signal_handlers();

    let stats = Arc::new(RelayStats::new());
    match cfg.role {
        RoleConfig::Server { .. } => ServerEngine::new(cfg, Arc::clone(&stats))?.run(&STOP)?,
        RoleConfig::Client { .. } => ClientEngine::new(cfg, Arc::clone(&stats))?.run(&STOP)?,
    }

    stats.log_summary();
    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<(Settings, Vec<String>), RelayError> {
    match path {
        Some(path) => Settings::load(path),
        None => {
            let default = Path::new(DEFAULT_SETTINGS_PATH);
            if default.exists() {
                Settings::load(default)
            } else {
                Ok((Settings::default(), Vec::new()))
            }
        }
    }
}

/// Merge CLI flags and file settings into the immutable run configuration.
fn build_config(cli: &Cli, settings: &Settings) -> Result<RelayConfig, RelayError> {
    let local_ip = match (&cli.interface, cli.local_ip) {
        (Some(name), None) => config::interface_ipv4(name).ok_or_else(|| {
            RelayError::Config(format!("interface '{}' has no usable IPv4 address", name))
        })?,
        (None, Some(ip)) => ip,
        _ => {
            return Err(RelayError::Config(
                "exactly one of --interface or --local-ip must be given".into(),
            ))
        }
    };

    let role = match cli.mode {
        Role::Server => RoleConfig::Server {
            public_port: cli.iport.ok_or_else(|| {
                RelayError::Config("server mode requires --iport".into())
            })?,
        },
        Role::Client => RoleConfig::Client {
            server_ip: cli.source_ip.ok_or_else(|| {
                RelayError::Config("client mode requires --source-ip".into())
            })?,
            game_ip: cli.dest_ip.ok_or_else(|| {
                RelayError::Config("client mode requires --dest-ip".into())
            })?,
            game_port: cli.oport.ok_or_else(|| {
                RelayError::Config("client mode requires --oport".into())
            })?,
        },
    };

    let conn = &settings.connection;
    let ka = &settings.keep_alive;
    Ok(RelayConfig {
        role,
        local_ip,
        peer_count: cli.peers,
        server_relay_base: cli.server_relay_base_port,
        client_relay_base: cli.client_relay_base_port,
        receive_buffer_size: conn.receive_buffer_size,
        packet_queue_size: conn.packet_queue_size,
        client_connection_timeout: Duration::from_secs(conn.client_connection_timeout),
        server_connection_timeout: Duration::from_secs(conn.server_connection_timeout),
        server_peer_connection_timeout: Duration::from_secs(conn.server_peer_connection_timeout),
        ping_interval: Duration::from_secs(ka.ping_interval),
        ping_timeout: Duration::from_secs(ka.ping_timeout),
        quiet: cli.quiet,
    })
}

#[cfg(unix)]
fn install_signal_handlers() {
    extern "C" fn on_signal(_sig: i32) {
        STOP.store(true, Ordering::Relaxed);
    }
    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}
