//! CLIENT role engine.
//!
//! Runs on the game-LAN host. Each slot keeps an outbound keep-alive flow
//! to the SERVER's matching relay port, which is what holds the NAT mapping
//! open, and bridges tunneled peer traffic to the local game server through
//! a paired game-side socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use crate::config::{RelayConfig, RoleConfig};
use crate::control::{self, ControlMessage, Opcode};
use crate::error::RelayError;
use crate::socket::{self, IoClass};
use crate::stats::RelayStats;

/// Poll timeout; the tick on which the keep-alive clock, timers, and the
/// stopping flag are observed.
const TICK: Duration = Duration::from_millis(100);

/// Bring-up state of one slot's relay flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    /// Sending HELLO at the ping interval, waiting for the first ack.
    Greeting,
    /// Acked; steady-state keep-alives flow.
    Established,
}

struct ClientSlot {
    /// Faces the SERVER: bound to `server_relay_base + i`.
    relay_socket: UdpSocket,
    /// Faces the game server: bound to `client_relay_base + i`, the stable
    /// source address the game replies to.
    game_socket: UdpSocket,
    phase: LinkPhase,
    /// Last HELLO or KA transmission, for pacing.
    last_ping_sent: Option<Instant>,
    /// Set when a KA goes out unacknowledged; cleared by the ack.
    awaiting_ack_since: Option<Instant>,
    /// Last datagram from the game server on the game-side socket.
    last_game_traffic: Option<Instant>,
}

pub struct ClientEngine {
    cfg: RelayConfig,
    server_ip: std::net::Ipv4Addr,
    game_addr: SocketAddr,
    poll: Poll,
    slots: Vec<ClientSlot>,
    stats: Arc<RelayStats>,
    recv_buf: Vec<u8>,
}

impl ClientEngine {
    pub fn new(cfg: RelayConfig, stats: Arc<RelayStats>) -> Result<Self, RelayError> {
        let RoleConfig::Client {
            server_ip,
            game_ip,
            game_port,
        } = cfg.role
        else {
            return Err(RelayError::Config(
                "client engine started with server configuration".into(),
            ));
        };

        let poll = Poll::new()?;
        let mut slots = Vec::with_capacity(cfg.peer_count as usize);
        for i in 0..cfg.peer_count as usize {
            let mut relay_socket = socket::bind_udp((cfg.local_ip, cfg.relay_port(i)).into())?;
            poll.registry()
                .register(&mut relay_socket, Token(i * 2), Interest::READABLE)?;

            let mut game_socket = socket::bind_udp((cfg.local_ip, cfg.game_side_port(i)).into())?;
            poll.registry()
                .register(&mut game_socket, Token(i * 2 + 1), Interest::READABLE)?;

            log::debug!(
                "slot {} bound: relay port {}, game-side port {}",
                i,
                cfg.relay_port(i),
                cfg.game_side_port(i)
            );

            slots.push(ClientSlot {
                relay_socket,
                game_socket,
                phase: LinkPhase::Greeting,
                last_ping_sent: None,
                awaiting_ack_since: None,
                last_game_traffic: None,
            });
        }

        log::info!(
            "relaying {} slot(s) between server {} and game server {}:{}",
            cfg.peer_count,
            server_ip,
            game_ip,
            game_port
        );

        let recv_buf = vec![0u8; cfg.receive_buffer_size];
        Ok(ClientEngine {
            cfg,
            server_ip,
            game_addr: (game_ip, game_port).into(),
            poll,
            slots,
            stats,
            recv_buf,
        })
    }

    /// SERVER-side relay endpoint for a slot.
    fn server_addr(&self, index: usize) -> SocketAddr {
        (self.server_ip, self.cfg.relay_port(index)).into()
    }

    /// Run until the stopping flag is raised.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), RelayError> {
        let mut events = Events::with_capacity(1024);

        while !stop.load(Ordering::Relaxed) {
            self.keepalive_tick();

            match self.poll.poll(&mut events, Some(TICK)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                let Token(t) = event.token();
                let index = t / 2;
                if t % 2 == 0 {
                    self.drain_relay(index);
                } else {
                    self.drain_game(index);
                }
            }

            self.check_timers();
        }

        self.shutdown();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Keep-alive clock
    // ------------------------------------------------------------------

    fn keepalive_tick(&mut self) {
        let now = Instant::now();
        for index in 0..self.slots.len() {
            let due = match self.slots[index].last_ping_sent {
                None => true,
                Some(at) => now.duration_since(at) >= self.cfg.ping_interval,
            };
            if !due {
                continue;
            }

            let opcode = match self.slots[index].phase {
                LinkPhase::Greeting => Opcode::Hello,
                LinkPhase::Established => Opcode::KeepAlive,
            };
            self.send_control(index, opcode);
            let slot = &mut self.slots[index];
            slot.last_ping_sent = Some(now);
            if opcode == Opcode::KeepAlive && slot.awaiting_ack_since.is_none() {
                slot.awaiting_ack_since = Some(now);
            }
        }
    }

    fn send_control(&mut self, index: usize, opcode: Opcode) {
        let frame = control::encode(opcode, index as u8);
        let dest = self.server_addr(index);
        if let Err(e) = self.slots[index].relay_socket.send_to(&frame, dest) {
            match socket::classify(&e) {
                IoClass::Transient => log::debug!("slot {} control send fault: {}", index, e),
                IoClass::Fatal => log::error!("slot {} control send fault: {}", index, e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Relay socket: SERVER control + tunneled peer payload
    // ------------------------------------------------------------------

    fn drain_relay(&mut self, index: usize) {
        loop {
            match socket::try_recv_from(&self.slots[index].relay_socket, &mut self.recv_buf) {
                Ok(None) => break,
                Ok(Some((len, from))) => {
                    if from != self.server_addr(index) {
                        log::warn!(
                            "dropping datagram on slot {} from unexpected source {}",
                            index,
                            from
                        );
                        continue;
                    }
                    if len >= self.cfg.receive_buffer_size {
                        log::warn!(
                            "discarding truncated {}-byte datagram on slot {}",
                            len,
                            index
                        );
                        self.stats.truncation_drops.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    match control::decode(&self.recv_buf[..len]) {
                        Some(Ok(msg)) => self.handle_control(index, msg),
                        Some(Err(anomaly)) => {
                            log::warn!("bad control frame on slot {}: {:?}", index, anomaly);
                            self.stats.control_anomalies.fetch_add(1, Ordering::Relaxed);
                        }
                        None => self.forward_to_game(index, len),
                    }
                }
                Err(e) => {
                    match socket::classify(&e) {
                        IoClass::Transient => log::debug!("slot {} relay recv fault: {}", index, e),
                        IoClass::Fatal => log::error!("slot {} relay recv fault: {}", index, e),
                    }
                    break;
                }
            }
        }
    }

    fn handle_control(&mut self, index: usize, msg: ControlMessage) {
        if msg.slot as usize != index {
            log::warn!(
                "control frame for slot {} arrived on slot {} socket, dropping",
                msg.slot,
                index
            );
            self.stats.control_anomalies.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match msg.opcode {
            Opcode::KeepAliveAck => {
                let slot = &mut self.slots[index];
                slot.awaiting_ack_since = None;
                if slot.phase == LinkPhase::Greeting {
                    slot.phase = LinkPhase::Established;
                    slot.last_game_traffic = Some(Instant::now());
                    log::info!("slot {} relay flow established", index);
                }
            }
            Opcode::Reset => {
                log::info!("slot {} reset by server, re-greeting", index);
                self.reset_slot(index);
            }
            Opcode::Hello | Opcode::KeepAlive => {
                log::debug!(
                    "ignoring {:?} on slot {} (server-bound opcode)",
                    msg.opcode,
                    index
                );
            }
        }
    }

    fn forward_to_game(&mut self, index: usize, len: usize) {
        let slot = &self.slots[index];
        match slot.game_socket.send_to(&self.recv_buf[..len], self.game_addr) {
            Ok(_) => self.stats.count_ingress(len),
            Err(e) => match socket::classify(&e) {
                IoClass::Transient => log::debug!("slot {} game send fault: {}", index, e),
                IoClass::Fatal => log::error!("slot {} game send fault: {}", index, e),
            },
        }
    }

    // ------------------------------------------------------------------
    // Game-side socket: return traffic
    // ------------------------------------------------------------------

    fn drain_game(&mut self, index: usize) {
        loop {
            match socket::try_recv_from(&self.slots[index].game_socket, &mut self.recv_buf) {
                Ok(None) => break,
                Ok(Some((len, from))) => {
                    if from.ip() != self.game_addr.ip() {
                        log::warn!(
                            "dropping game-side datagram on slot {} from unexpected source {}",
                            index,
                            from
                        );
                        continue;
                    }
                    if len >= self.cfg.receive_buffer_size {
                        log::warn!(
                            "discarding truncated {}-byte game datagram on slot {}",
                            len,
                            index
                        );
                        self.stats.truncation_drops.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    self.slots[index].last_game_traffic = Some(Instant::now());
                    let dest = self.server_addr(index);
                    match self.slots[index].relay_socket.send_to(&self.recv_buf[..len], dest) {
                        Ok(_) => self.stats.count_egress(len),
                        Err(e) => match socket::classify(&e) {
                            IoClass::Transient => {
                                log::debug!("slot {} relay send fault: {}", index, e)
                            }
                            IoClass::Fatal => log::error!("slot {} relay send fault: {}", index, e),
                        },
                    }
                }
                Err(e) => {
                    match socket::classify(&e) {
                        IoClass::Transient => log::debug!("slot {} game recv fault: {}", index, e),
                        IoClass::Fatal => log::error!("slot {} game recv fault: {}", index, e),
                    }
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers, resets, shutdown
    // ------------------------------------------------------------------

    fn check_timers(&mut self) {
        let now = Instant::now();
        for index in 0..self.slots.len() {
            let (phase, awaiting, last_game) = {
                let slot = &self.slots[index];
                (slot.phase, slot.awaiting_ack_since, slot.last_game_traffic)
            };
            if phase != LinkPhase::Established {
                continue;
            }
            if let Some(ka_sent) = awaiting {
                if now.duration_since(ka_sent) > self.cfg.ping_timeout {
                    // The server may have reset the slot; keep-alives will
                    // not revive it, only a fresh HELLO does.
                    log::info!("slot {} keep-alive unacknowledged, re-greeting", index);
                    self.reset_slot(index);
                    continue;
                }
            }
            if let Some(last) = last_game {
                if now.duration_since(last) > self.cfg.client_connection_timeout {
                    log::info!("slot {} reset after game server silence", index);
                    self.reset_slot(index);
                }
            }
        }
    }

    /// Return the slot to bring-up; the next clock tick sends HELLO.
    fn reset_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.phase = LinkPhase::Greeting;
        slot.last_ping_sent = None;
        slot.awaiting_ack_since = None;
        slot.last_game_traffic = None;
    }

    /// Tell the SERVER to purge our slots, then let the sockets close.
    fn shutdown(&mut self) {
        for index in 0..self.slots.len() {
            self.send_control(index, Opcode::Reset);
        }
        log::info!("stopping relay client");
    }
}
