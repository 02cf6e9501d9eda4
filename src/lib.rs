//! Wookiee Unicaster relay engine.
//!
//! A bidirectional UDP relay that lets Direct-IP LAN games be played over
//! the internet:
//! - the SERVER engine runs on a public-IP host and multiplexes remote
//!   peers onto per-peer relay flows;
//! - the CLIENT engine runs next to the game server, punches through its
//!   NAT by originating keep-alive flows to the SERVER, and bridges the
//!   relayed traffic to the game.
//!
//! The binary in `main.rs` wires CLI + settings into one of the two
//! engines; everything else lives here so tests can run real engines
//! in-process.

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod peers;
pub mod server;
pub mod socket;
pub mod stats;

pub use client::ClientEngine;
pub use config::{RelayConfig, Role, RoleConfig, Settings};
pub use error::RelayError;
pub use server::ServerEngine;
pub use stats::RelayStats;
