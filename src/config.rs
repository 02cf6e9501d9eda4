//! Engine configuration.
//!
//! The immutable [`RelayConfig`] is assembled in `main` from the CLI flags
//! plus an optional TOML settings file, validated once, and never mutated
//! after the engine starts.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

/// Default relay port reached by the CLIENT on the SERVER host.
pub const DEFAULT_SERVER_RELAY_BASE_PORT: u16 = 23000;

/// Default local source port used toward the game server on the CLIENT host.
pub const DEFAULT_CLIENT_RELAY_BASE_PORT: u16 = 23100;

/// Lowest operator-assignable port. Everything below is reserved.
pub const MIN_PORT: u16 = 1024;

// ============================================================================
// Run Configuration
// ============================================================================

/// Which end of the relay this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    /// Public-IP relay host.
    Server,
    /// Game-LAN host behind NAT.
    Client,
}

/// Role-specific addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleConfig {
    /// SERVER: listen for remote peers on this public UDP port.
    Server { public_port: u16 },
    /// CLIENT: deliver tunneled traffic to the game server.
    Client {
        /// SERVER public IP the relay flows are sent to.
        server_ip: Ipv4Addr,
        /// Game server IP on the local LAN.
        game_ip: Ipv4Addr,
        /// Game server UDP port.
        game_port: u16,
    },
}

/// Immutable engine configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub role: RoleConfig,
    /// Local IPv4 all engine sockets bind to.
    pub local_ip: Ipv4Addr,
    /// Number of peer slots N. Identical on both endpoints.
    pub peer_count: u8,
    /// First relay port; slot i uses `server_relay_base + i` on both ends.
    pub server_relay_base: u16,
    /// First CLIENT-side source port toward the game server.
    pub client_relay_base: u16,
    pub receive_buffer_size: usize,
    pub packet_queue_size: usize,
    pub client_connection_timeout: Duration,
    pub server_connection_timeout: Duration,
    pub server_peer_connection_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub quiet: bool,
}

impl RelayConfig {
    /// Relay port carrying slot `i` between the two engines.
    pub fn relay_port(&self, slot: usize) -> u16 {
        self.server_relay_base + slot as u16
    }

    /// CLIENT-side source port delivering slot `i` to the game server.
    pub fn game_side_port(&self, slot: usize) -> u16 {
        self.client_relay_base + slot as u16
    }

    /// Validate ranges and cross-field constraints. Fatal before startup.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.peer_count == 0 {
            return Err(RelayError::Config("peer count must be at least 1".into()));
        }
        let n = self.peer_count as u32 - 1;

        check_port("server relay base port", self.server_relay_base)?;
        check_port("client relay base port", self.client_relay_base)?;
        for (name, base) in [
            ("server relay", self.server_relay_base),
            ("client relay", self.client_relay_base),
        ] {
            if base as u32 + n > u16::MAX as u32 {
                return Err(RelayError::Config(format!(
                    "{} range {}..={} exceeds the valid port space",
                    name,
                    base,
                    base as u32 + n
                )));
            }
        }

        let server_range = self.server_relay_base..=self.server_relay_base + n as u16;
        let client_range = self.client_relay_base..=self.client_relay_base + n as u16;
        if server_range.contains(client_range.start())
            || client_range.contains(server_range.start())
        {
            return Err(RelayError::Config(format!(
                "server relay ports {:?} overlap client relay ports {:?}",
                server_range, client_range
            )));
        }

        match self.role {
            RoleConfig::Server { public_port } => {
                check_port("listening port", public_port)?;
                if server_range.contains(&public_port) {
                    return Err(RelayError::Config(format!(
                        "listening port {} falls inside the relay port range {:?}",
                        public_port, server_range
                    )));
                }
            }
            RoleConfig::Client { game_port, .. } => {
                check_port("destination port", game_port)?;
            }
        }

        if self.receive_buffer_size == 0 {
            return Err(RelayError::Config("receive buffer size must be non-zero".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(RelayError::Config("ping interval must be non-zero".into()));
        }
        Ok(())
    }
}

fn check_port(name: &str, port: u16) -> Result<(), RelayError> {
    if port < MIN_PORT {
        return Err(RelayError::Config(format!(
            "{} {} is below the minimum of {}",
            name, port, MIN_PORT
        )));
    }
    Ok(())
}

// ============================================================================
// Settings File
// ============================================================================

/// Logging verbosity names accepted in the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    /// Mapped to `error`; the `log` crate has no separate critical level.
    Critical,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Error | LogLevel::Critical => log::LevelFilter::Error,
        }
    }
}

/// Tunables loaded from the optional TOML settings file.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default, rename = "keep-alive")]
    pub keep_alive: KeepAliveSection,
}

/// The `[logging]` section.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

/// The `[connection]` section.
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    /// Bytes per datagram receive. Receives that fill it are discarded as
    /// truncated.
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// Bounded depth of each slot queue; producers drop when full.
    #[serde(default = "default_packet_queue_size")]
    pub packet_queue_size: usize,
    /// CLIENT: seconds of game-side silence before a slot resets.
    #[serde(default = "default_connection_timeout")]
    pub client_connection_timeout: u64,
    /// SERVER: seconds of CLIENT silence before a slot resets.
    #[serde(default = "default_connection_timeout")]
    pub server_connection_timeout: u64,
    /// SERVER: seconds of silence from every remote peer before the whole
    /// peer table is purged.
    #[serde(default = "default_peer_connection_timeout")]
    pub server_peer_connection_timeout: u64,
}

/// The `[keep-alive]` section.
#[derive(Debug, Deserialize)]
pub struct KeepAliveSection {
    /// Seconds between HELLO/KA transmissions per slot.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Seconds to wait for a KA-ACK before falling back to HELLO.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_receive_buffer_size() -> usize {
    2048
}

fn default_packet_queue_size() -> usize {
    256
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_peer_connection_timeout() -> u64 {
    120
}

fn default_ping_interval() -> u64 {
    1
}

fn default_ping_timeout() -> u64 {
    2
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            receive_buffer_size: default_receive_buffer_size(),
            packet_queue_size: default_packet_queue_size(),
            client_connection_timeout: default_connection_timeout(),
            server_connection_timeout: default_connection_timeout(),
            server_peer_connection_timeout: default_peer_connection_timeout(),
        }
    }
}

impl Default for KeepAliveSection {
    fn default() -> Self {
        Self {
            ping_interval: default_ping_interval(),
            ping_timeout: default_ping_timeout(),
        }
    }
}

impl Settings {
    /// Load a settings file.
    ///
    /// Returns the parsed settings plus the list of unrecognized keys; the
    /// caller warns about those once logging is up (unknown keys are
    /// ignored, not fatal).
    pub fn load(path: &Path) -> Result<(Self, Vec<String>), RelayError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse settings from a TOML string.
    pub fn parse(content: &str) -> Result<(Self, Vec<String>), RelayError> {
        let unknown = unknown_keys(content)?;
        let settings = toml::from_str(content)
            .map_err(|e| RelayError::Config(format!("failed to parse settings: {}", e)))?;
        Ok((settings, unknown))
    }
}

/// Collect dotted paths of keys the engine does not understand.
fn unknown_keys(content: &str) -> Result<Vec<String>, RelayError> {
    const SECTIONS: [(&str, &[&str]); 3] = [
        ("logging", &["level"]),
        (
            "connection",
            &[
                "receive_buffer_size",
                "packet_queue_size",
                "client_connection_timeout",
                "server_connection_timeout",
                "server_peer_connection_timeout",
            ],
        ),
        ("keep-alive", &["ping_interval", "ping_timeout"]),
    ];

    let value: toml::Value = content
        .parse()
        .map_err(|e| RelayError::Config(format!("failed to parse settings: {}", e)))?;
    let mut unknown = Vec::new();
    let Some(table) = value.as_table() else {
        return Ok(unknown);
    };
    for (section, entry) in table {
        match SECTIONS.iter().find(|(name, _)| *name == section.as_str()) {
            None => unknown.push(section.clone()),
            Some((_, keys)) => {
                if let Some(section_table) = entry.as_table() {
                    for key in section_table.keys() {
                        if !keys.contains(&key.as_str()) {
                            unknown.push(format!("{}.{}", section, key));
                        }
                    }
                }
            }
        }
    }
    Ok(unknown)
}

// ============================================================================
// Interface Lookup
// ============================================================================

/// Resolve a network interface name to its first IPv4 address.
#[cfg(unix)]
pub fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    use std::ffi::CStr;

    let mut found = None;

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return None;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                let ifname = CStr::from_ptr(ifa.ifa_name);
                let family = (*ifa.ifa_addr).sa_family as i32;
                if family == libc::AF_INET && ifname.to_bytes() == name.as_bytes() {
                    let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                    let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                    found = Some(Ipv4Addr::new(
                        ip_bytes[0],
                        ip_bytes[1],
                        ip_bytes[2],
                        ip_bytes[3],
                    ));
                    break;
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    found
}

#[cfg(not(unix))]
pub fn interface_ipv4(_name: &str) -> Option<Ipv4Addr> {
    // Binding is by explicit IP on non-Unix platforms.
    None
}
