//! Peer registry for the SERVER role.
//!
//! A fixed table of peer slots maps the observed (IP, port) of each remote
//! peer to a slot index and back. The registry holds pure state; sockets
//! stay with the engine loop, which is the single owner mutating this
//! structure, so no locking is needed.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

// ============================================================================
// Packet Queue
// ============================================================================

/// Bounded FIFO of datagrams awaiting the next hop.
///
/// When full, the producer drops the new datagram instead of blocking.
#[derive(Debug)]
pub struct PacketQueue {
    items: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Append a datagram. Returns `false` when the queue was full and the
    /// datagram was dropped.
    pub fn push(&mut self, datagram: Vec<u8>) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push_back(datagram);
        true
    }

    pub fn front(&self) -> Option<&[u8]> {
        self.items.front().map(|d| d.as_slice())
    }

    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        self.items.pop_front()
    }

    /// Drop everything queued, returning how many datagrams were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
// Peer Slot
// ============================================================================

/// Slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No peer bound.
    Unassigned,
    /// Peer bound, CLIENT endpoint for the slot not yet known; ingress
    /// buffers in the slot queue.
    Assigning,
    /// Peer bound and CLIENT endpoint known; traffic flows both ways.
    Active,
}

/// State for one multiplexing slot.
#[derive(Debug)]
pub struct PeerSlot {
    pub state: SlotState,
    /// Remote peer bound to this slot, as observed on the public listener.
    pub peer_addr: Option<SocketAddr>,
    /// CLIENT endpoint for this slot's relay flow, learned from HELLO/KA.
    pub client_addr: Option<SocketAddr>,
    /// When the current peer was bound. Set once at assignment and never
    /// refreshed; the reclamation timer falls back to it while the CLIENT
    /// has not yet spoken on the slot.
    pub assigned_at: Option<Instant>,
    /// Last datagram from the bound peer.
    pub last_peer_seen: Option<Instant>,
    /// Last HELLO/KA/payload from the CLIENT on this slot.
    pub last_client_seen: Option<Instant>,
    /// Peer payloads awaiting delivery to the CLIENT.
    pub queue: PacketQueue,
}

impl PeerSlot {
    fn new(queue_capacity: usize) -> Self {
        Self {
            state: SlotState::Unassigned,
            peer_addr: None,
            client_addr: None,
            assigned_at: None,
            last_peer_seen: None,
            last_client_seen: None,
            queue: PacketQueue::new(queue_capacity),
        }
    }

    fn activate_if_ready(&mut self) {
        if self.peer_addr.is_some() && self.client_addr.is_some() {
            self.state = SlotState::Active;
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Outcome of routing a public-listener datagram through the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingress {
    /// Source was already bound to this slot.
    Existing(usize),
    /// Source is new and was bound to this previously free slot.
    Assigned(usize),
    /// Every slot is bound to some other peer; the datagram is dropped.
    TableFull,
}

/// Fixed-size table mapping remote peers to slots.
pub struct PeerRegistry {
    slots: Vec<PeerSlot>,
    by_addr: HashMap<SocketAddr, usize>,
}

impl PeerRegistry {
    pub fn new(peer_count: u8, queue_capacity: usize) -> Self {
        Self {
            slots: (0..peer_count as usize)
                .map(|_| PeerSlot::new(queue_capacity))
                .collect(),
            by_addr: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &PeerSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut PeerSlot {
        &mut self.slots[index]
    }

    /// Number of slots with a peer bound.
    pub fn assigned_count(&self) -> usize {
        self.slots.iter().filter(|s| s.peer_addr.is_some()).count()
    }

    /// Route one datagram source address through the table.
    ///
    /// Binding the same address twice lands on the same slot; a new address
    /// takes the lowest-index free slot; a full table drops. Never evicts.
    pub fn route_ingress(&mut self, from: SocketAddr, now: Instant) -> Ingress {
        if let Some(&index) = self.by_addr.get(&from) {
            self.slots[index].last_peer_seen = Some(now);
            return Ingress::Existing(index);
        }

        let Some(index) = self
            .slots
            .iter()
            .position(|s| s.state == SlotState::Unassigned)
        else {
            return Ingress::TableFull;
        };

        let slot = &mut self.slots[index];
        slot.peer_addr = Some(from);
        slot.assigned_at = Some(now);
        slot.last_peer_seen = Some(now);
        slot.state = SlotState::Assigning;
        slot.activate_if_ready();
        self.by_addr.insert(from, index);
        Ingress::Assigned(index)
    }

    /// Slot index bound to this peer address, if any.
    pub fn lookup(&self, addr: SocketAddr) -> Option<usize> {
        self.by_addr.get(&addr).copied()
    }

    /// Record or refresh the CLIENT endpoint for a slot.
    ///
    /// Returns `true` when the endpoint was newly learned or changed (the
    /// CLIENT's NAT may rebind mid-run).
    pub fn set_client(&mut self, index: usize, addr: SocketAddr, now: Instant) -> bool {
        let slot = &mut self.slots[index];
        slot.last_client_seen = Some(now);
        let changed = slot.client_addr != Some(addr);
        slot.client_addr = Some(addr);
        slot.activate_if_ready();
        changed
    }

    /// Reset one slot: unbind the peer, forget the CLIENT endpoint, drain
    /// the queue. The slot's sockets stay open for the next assignment.
    ///
    /// Returns the number of queued datagrams discarded. Resetting an
    /// unassigned slot is a no-op.
    pub fn reset_slot(&mut self, index: usize) -> usize {
        let slot = &mut self.slots[index];
        if let Some(addr) = slot.peer_addr.take() {
            self.by_addr.remove(&addr);
        }
        slot.client_addr = None;
        slot.assigned_at = None;
        slot.last_peer_seen = None;
        slot.last_client_seen = None;
        slot.state = SlotState::Unassigned;
        slot.queue.clear()
    }

    /// Global reset: unbind every peer and wipe the address map.
    ///
    /// CLIENT endpoints are kept: the CLIENT engine is still alive and
    /// keep-alive traffic continues to refresh them; only the remote peers
    /// went silent.
    pub fn purge_peers(&mut self) -> usize {
        self.by_addr.clear();
        let mut dropped = 0;
        for slot in &mut self.slots {
            slot.peer_addr = None;
            slot.assigned_at = None;
            slot.last_peer_seen = None;
            dropped += slot.queue.clear();
            slot.state = SlotState::Unassigned;
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last_octet: u8, port: u16) -> SocketAddr {
        format!("10.0.{}.1:{}", last_octet, port).parse().unwrap()
    }

    fn registry(peers: u8) -> PeerRegistry {
        PeerRegistry::new(peers, 4)
    }

    #[test]
    fn test_first_free_slot_ascending() {
        let mut reg = registry(3);
        let now = Instant::now();
        assert_eq!(reg.route_ingress(addr(1, 55000), now), Ingress::Assigned(0));
        assert_eq!(reg.route_ingress(addr(2, 55000), now), Ingress::Assigned(1));
        assert_eq!(reg.route_ingress(addr(3, 55000), now), Ingress::Assigned(2));
    }

    #[test]
    fn test_binding_is_idempotent() {
        let mut reg = registry(2);
        let now = Instant::now();
        assert_eq!(reg.route_ingress(addr(1, 55000), now), Ingress::Assigned(0));
        assert_eq!(reg.route_ingress(addr(1, 55000), now), Ingress::Existing(0));
        assert_eq!(reg.lookup(addr(1, 55000)), Some(0));
    }

    #[test]
    fn test_assignment_timestamp_set_once() {
        let mut reg = registry(1);
        let first = Instant::now();
        let later = first + std::time::Duration::from_secs(5);

        reg.route_ingress(addr(1, 55000), first);
        assert_eq!(reg.slot(0).assigned_at, Some(first));

        // Further ingress refreshes last_peer_seen but not the assignment
        // baseline.
        reg.route_ingress(addr(1, 55000), later);
        assert_eq!(reg.slot(0).assigned_at, Some(first));
        assert_eq!(reg.slot(0).last_peer_seen, Some(later));

        reg.reset_slot(0);
        assert_eq!(reg.slot(0).assigned_at, None);
    }

    #[test]
    fn test_distinct_slots_hold_distinct_peers() {
        let mut reg = registry(2);
        let now = Instant::now();
        reg.route_ingress(addr(1, 55000), now);
        reg.route_ingress(addr(2, 55000), now);
        assert_eq!(reg.slot(0).peer_addr, Some(addr(1, 55000)));
        assert_eq!(reg.slot(1).peer_addr, Some(addr(2, 55000)));
        assert_ne!(reg.slot(0).peer_addr, reg.slot(1).peer_addr);
    }

    #[test]
    fn test_full_table_drops_without_eviction() {
        let mut reg = registry(1);
        let now = Instant::now();
        assert_eq!(reg.route_ingress(addr(1, 55000), now), Ingress::Assigned(0));
        assert_eq!(reg.route_ingress(addr(2, 55000), now), Ingress::TableFull);
        // The incumbent is untouched.
        assert_eq!(reg.slot(0).peer_addr, Some(addr(1, 55000)));
        assert_eq!(reg.lookup(addr(2, 55000)), None);
    }

    #[test]
    fn test_same_ip_new_port_is_a_new_peer() {
        let mut reg = registry(2);
        let now = Instant::now();
        assert_eq!(reg.route_ingress(addr(1, 55000), now), Ingress::Assigned(0));
        assert_eq!(reg.route_ingress(addr(1, 55001), now), Ingress::Assigned(1));
    }

    #[test]
    fn test_activation_requires_both_endpoints() {
        let mut reg = registry(1);
        let now = Instant::now();
        reg.route_ingress(addr(1, 55000), now);
        assert_eq!(reg.slot(0).state, SlotState::Assigning);
        assert!(reg.set_client(0, addr(9, 23000), now));
        assert_eq!(reg.slot(0).state, SlotState::Active);
        // Refreshing the same endpoint reports no change.
        assert!(!reg.set_client(0, addr(9, 23000), now));
    }

    #[test]
    fn test_client_endpoint_before_first_peer() {
        let mut reg = registry(1);
        let now = Instant::now();
        reg.set_client(0, addr(9, 23000), now);
        assert_eq!(reg.slot(0).state, SlotState::Unassigned);
        assert_eq!(reg.route_ingress(addr(1, 55000), now), Ingress::Assigned(0));
        assert_eq!(reg.slot(0).state, SlotState::Active);
    }

    #[test]
    fn test_reset_clears_binding_and_queue() {
        let mut reg = registry(1);
        let now = Instant::now();
        reg.route_ingress(addr(1, 55000), now);
        reg.slot_mut(0).queue.push(vec![1, 2, 3]);
        reg.slot_mut(0).queue.push(vec![4]);

        assert_eq!(reg.reset_slot(0), 2);
        assert_eq!(reg.slot(0).state, SlotState::Unassigned);
        assert_eq!(reg.slot(0).peer_addr, None);
        assert_eq!(reg.slot(0).client_addr, None);
        assert!(reg.slot(0).queue.is_empty());
        assert_eq!(reg.lookup(addr(1, 55000)), None);

        // The slot is immediately reusable by a new peer.
        assert_eq!(reg.route_ingress(addr(2, 55000), now), Ingress::Assigned(0));
        assert!(reg.slot(0).queue.is_empty());
    }

    #[test]
    fn test_reset_unassigned_slot_is_noop() {
        let mut reg = registry(1);
        assert_eq!(reg.reset_slot(0), 0);
        assert_eq!(reg.slot(0).state, SlotState::Unassigned);
    }

    #[test]
    fn test_purge_unbinds_peers_but_keeps_client_endpoints() {
        let mut reg = registry(2);
        let now = Instant::now();
        reg.set_client(0, addr(9, 23000), now);
        reg.set_client(1, addr(9, 23001), now);
        reg.route_ingress(addr(1, 55000), now);
        reg.route_ingress(addr(2, 55000), now);
        reg.slot_mut(0).queue.push(vec![0xDE, 0xAD]);

        assert_eq!(reg.purge_peers(), 1);
        assert_eq!(reg.assigned_count(), 0);
        assert_eq!(reg.lookup(addr(1, 55000)), None);
        assert_eq!(reg.lookup(addr(2, 55000)), None);
        assert_eq!(reg.slot(0).client_addr, Some(addr(9, 23000)));

        // A returning peer re-activates instantly on the kept endpoint.
        assert_eq!(reg.route_ingress(addr(2, 55000), now), Ingress::Assigned(0));
        assert_eq!(reg.slot(0).state, SlotState::Active);
    }

    #[test]
    fn test_queue_drops_when_full() {
        let mut q = PacketQueue::new(2);
        assert!(q.push(vec![1]));
        assert!(q.push(vec![2]));
        assert!(!q.push(vec![3]));
        assert_eq!(q.len(), 2);
        // FIFO order preserved for what was kept.
        assert_eq!(q.pop_front(), Some(vec![1]));
        assert_eq!(q.pop_front(), Some(vec![2]));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn test_zero_capacity_queue_always_drops() {
        let mut q = PacketQueue::new(0);
        assert!(!q.push(vec![1]));
        assert!(q.is_empty());
    }
}
