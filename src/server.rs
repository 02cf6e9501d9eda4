//! SERVER role engine.
//!
//! Runs on the public-IP relay host. One listener socket receives traffic
//! from every remote peer; the peer registry multiplexes it onto per-slot
//! relay sockets toward the CLIENT, and return traffic flows back out of
//! the listener to the address each slot has bound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use crate::config::{RelayConfig, RoleConfig};
use crate::control::{self, ControlMessage, Opcode};
use crate::error::RelayError;
use crate::peers::{Ingress, PeerRegistry};
use crate::socket::{self, IoClass};
use crate::stats::RelayStats;

/// mio token for the public listener socket.
const LISTENER_TOKEN: Token = Token(0);

/// Poll timeout; the tick on which timers and the stopping flag are observed.
const TICK: Duration = Duration::from_millis(100);

pub struct ServerEngine {
    cfg: RelayConfig,
    poll: Poll,
    /// Public listener. Declared before the slot sockets: struct fields
    /// drop in order, closing the listener first on shutdown.
    listener: UdpSocket,
    /// One relay socket per slot, bound to `server_relay_base + i`.
    slot_sockets: Vec<UdpSocket>,
    registry: PeerRegistry,
    stats: Arc<RelayStats>,
    recv_buf: Vec<u8>,
    /// Last datagram from any remote peer, for the global purge timer.
    last_peer_traffic: Instant,
}

impl ServerEngine {
    pub fn new(cfg: RelayConfig, stats: Arc<RelayStats>) -> Result<Self, RelayError> {
        let RoleConfig::Server { public_port } = cfg.role else {
            return Err(RelayError::Config(
                "server engine started with client configuration".into(),
            ));
        };

        let poll = Poll::new()?;

        let mut listener = socket::bind_udp((cfg.local_ip, public_port).into())?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        log::info!(
            "listening for remote peers on {}:{}",
            cfg.local_ip,
            public_port
        );

        let mut slot_sockets = Vec::with_capacity(cfg.peer_count as usize);
        for i in 0..cfg.peer_count as usize {
            let mut sock = socket::bind_udp((cfg.local_ip, cfg.relay_port(i)).into())?;
            poll.registry()
                .register(&mut sock, Token(i + 1), Interest::READABLE)?;
            log::debug!("slot {} relay socket bound to port {}", i, cfg.relay_port(i));
            slot_sockets.push(sock);
        }

        let registry = PeerRegistry::new(cfg.peer_count, cfg.packet_queue_size);
        let recv_buf = vec![0u8; cfg.receive_buffer_size];

        Ok(ServerEngine {
            cfg,
            poll,
            listener,
            slot_sockets,
            registry,
            stats,
            recv_buf,
            last_peer_traffic: Instant::now(),
        })
    }

    /// Run until the stopping flag is raised.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), RelayError> {
        let mut events = Events::with_capacity(1024);

        while !stop.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(TICK)) {
                Ok(()) => {}
                // Signal delivery interrupts the poll; the loop condition
                // re-checks the stopping flag.
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.drain_listener(),
                    Token(t) => self.drain_slot(t - 1),
                }
            }

            self.flush_queues();
            self.check_timers();
        }

        log::info!("stopping relay server");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public listener: remote peer ingress
    // ------------------------------------------------------------------

    fn drain_listener(&mut self) {
        loop {
            match socket::try_recv_from(&self.listener, &mut self.recv_buf) {
                Ok(None) => break,
                Ok(Some((len, from))) => self.handle_peer_datagram(len, from),
                Err(e) => {
                    match socket::classify(&e) {
                        IoClass::Transient => log::debug!("listener recv fault: {}", e),
                        IoClass::Fatal => log::error!("listener recv fault: {}", e),
                    }
                    break;
                }
            }
        }
    }

    fn handle_peer_datagram(&mut self, len: usize, from: std::net::SocketAddr) {
        let now = Instant::now();
        self.last_peer_traffic = now;

        if len >= self.cfg.receive_buffer_size {
            log::warn!(
                "discarding truncated {}-byte datagram from {} (receive buffer is {})",
                len,
                from,
                self.cfg.receive_buffer_size
            );
            self.stats
                .truncation_drops
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let index = match self.registry.route_ingress(from, now) {
            Ingress::Existing(i) => i,
            Ingress::Assigned(i) => {
                log::info!("peer {} assigned to slot {}", from, i);
                i
            }
            Ingress::TableFull => {
                log::warn!("dropping datagram from {}: all peer slots taken", from);
                self.stats.table_full_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let datagram = self.recv_buf[..len].to_vec();
        if !self.registry.slot_mut(index).queue.push(datagram) {
            log::warn!("slot {} queue full, dropping datagram from {}", index, from);
            self.stats.queue_full_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.count_ingress(len);
        self.flush_slot(index);
    }

    // ------------------------------------------------------------------
    // Slot sockets: CLIENT control + return payload
    // ------------------------------------------------------------------

    fn drain_slot(&mut self, index: usize) {
        loop {
            match socket::try_recv_from(&self.slot_sockets[index], &mut self.recv_buf) {
                Ok(None) => break,
                Ok(Some((len, from))) => {
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
                        Some(Ok(msg)) => self.handle_control(index, msg, from),
                        Some(Err(anomaly)) => {
                            log::warn!("bad control frame on slot {}: {:?}", index, anomaly);
                            self.stats.control_anomalies.fetch_add(1, Ordering::Relaxed);
                        }
                        None => self.handle_client_payload(index, len, from),
                    }
                }
                Err(e) => {
                    match socket::classify(&e) {
                        IoClass::Transient => log::debug!("slot {} recv fault: {}", index, e),
                        IoClass::Fatal => log::error!("slot {} recv fault: {}", index, e),
                    }
                    break;
                }
            }
        }
    }

    fn handle_control(&mut self, index: usize, msg: ControlMessage, from: std::net::SocketAddr) {
        if msg.slot as usize != index {
            log::warn!(
                "control frame for slot {} arrived on slot {} socket, dropping",
                msg.slot,
                index
            );
            self.stats.control_anomalies.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let now = Instant::now();
        match msg.opcode {
            Opcode::Hello | Opcode::KeepAlive => {
                if self.registry.set_client(index, from, now) {
                    log::info!("client endpoint for slot {} is {}", index, from);
                }
                let ack = control::encode(Opcode::KeepAliveAck, msg.slot);
                if let Err(e) = self.slot_sockets[index].send_to(&ack, from) {
                    log::debug!("slot {} keep-alive ack send fault: {}", index, e);
                }
                // The endpoint may have just become known: release anything
                // buffered while the slot was assigning.
                self.flush_slot(index);
            }
            Opcode::Reset => {
                let dropped = self.registry.reset_slot(index);
                log::info!(
                    "slot {} reset by client ({} queued datagrams dropped)",
                    index,
                    dropped
                );
            }
            Opcode::KeepAliveAck => {
                log::debug!("ignoring keep-alive ack on slot {} (client-bound opcode)", index);
            }
        }
    }

    fn handle_client_payload(&mut self, index: usize, len: usize, from: std::net::SocketAddr) {
        let slot = self.registry.slot(index);
        if slot.client_addr != Some(from) {
            log::warn!(
                "dropping payload on slot {} from unknown source {}",
                index,
                from
            );
            return;
        }
        let Some(peer) = slot.peer_addr else {
            log::debug!("dropping return payload on slot {}: no peer bound", index);
            return;
        };

        self.registry.set_client(index, from, Instant::now());

        match self.listener.send_to(&self.recv_buf[..len], peer) {
            Ok(_) => self.stats.count_egress(len),
            Err(e) => match socket::classify(&e) {
                IoClass::Transient => log::debug!("egress send fault to {}: {}", peer, e),
                IoClass::Fatal => log::error!("egress send fault to {}: {}", peer, e),
            },
        }
    }

    // ------------------------------------------------------------------
    // Queue flushing and timers
    // ------------------------------------------------------------------

    fn flush_queues(&mut self) {
        for index in 0..self.slot_sockets.len() {
            self.flush_slot(index);
        }
    }

    /// Send queued peer datagrams for a slot to the CLIENT endpoint, in
    /// arrival order, until the queue empties or the socket pushes back.
    fn flush_slot(&mut self, index: usize) {
        loop {
            let send_result = {
                let slot = self.registry.slot(index);
                let (Some(client), Some(front)) = (slot.client_addr, slot.queue.front()) else {
                    break;
                };
                self.slot_sockets[index].send_to(front, client)
            };
            match send_result {
                Ok(_) => {
                    self.registry.slot_mut(index).queue.pop_front();
                }
                Err(e) if socket::classify(&e) == IoClass::Transient => break,
                Err(e) => {
                    // Drop the head so one unsendable datagram cannot wedge
                    // the slot.
                    log::error!("slot {} relay send fault: {}", index, e);
                    self.registry.slot_mut(index).queue.pop_front();
                }
            }
        }
    }

    fn check_timers(&mut self) {
        let now = Instant::now();

        for index in 0..self.registry.len() {
            let slot = self.registry.slot(index);
            // Silence is measured from the last CLIENT datagram, or from
            // peer assignment when the CLIENT has never spoken on this
            // slot; a slot stuck assigning must still reclaim.
            let Some(baseline) = slot.last_client_seen.or(slot.assigned_at) else {
                continue;
            };
            if now.duration_since(baseline) <= self.cfg.server_connection_timeout {
                continue;
            }

            let client = slot.client_addr;
            let dropped = self.registry.reset_slot(index);
            log::info!(
                "slot {} reset after client silence ({} queued datagrams dropped)",
                index,
                dropped
            );
            if let Some(client) = client {
                let reset = control::encode(Opcode::Reset, index as u8);
                if let Err(e) = self.slot_sockets[index].send_to(&reset, client) {
                    log::debug!("slot {} reset notification fault: {}", index, e);
                }
            }
        }

        if self.registry.assigned_count() > 0
            && now.duration_since(self.last_peer_traffic) > self.cfg.server_peer_connection_timeout
        {
            let dropped = self.registry.purge_peers();
            log::info!(
                "purged all peer slots after global peer silence ({} queued datagrams dropped)",
                dropped
            );
        }
    }
}
