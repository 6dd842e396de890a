//! Per-neighbor transmit queues, packet pool and CSMA backoff state.
//!
//! Two sentinel neighbors always exist: the enhanced-beacon queue (frames
//! the node advertises) and the broadcast queue. Data packets live in a
//! fixed pool; per-neighbor queues hold pool indices in small rings, so a
//! packet removed from a queue stays readable until the foreground has
//! processed its transmission outcome and releases it.
//!
//! Foreground mutation of anything here must happen under the engine lock;
//! the slot engine touches it only from interrupt context.

use heapless::Deque;

use ieee802154::mac::{Address, AddressMode, ShortAddress};

use rand_core::RngCore;

use crate::error::QueueError;
use crate::schedule::Link;
use crate::{MacTxStatus, PACKET_MAX_LEN};

/// Neighbor table capacity, including the two sentinel entries
pub const QUEUE_MAX_NEIGHBORS: usize = 8;
/// Packet pool capacity
pub const QUEUE_NUM_PACKETS: usize = 8;
/// Per-neighbor queue capacity, power of two
pub const QUEUE_PER_NEIGHBOR: usize = 8;

/// Handle to a neighbor table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborId(pub(crate) usize);

/// Handle to a pooled outgoing packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketId(pub(crate) usize);

/// The all-nodes broadcast link address
pub fn broadcast_address() -> Address {
    Address::broadcast(&AddressMode::Short)
}

fn is_broadcast_addr(addr: &Address) -> bool {
    match addr {
        Address::Short(_, short) => *short == ShortAddress::broadcast(),
        _ => false,
    }
}

/// An outgoing frame owned by a neighbor queue
#[derive(Debug, Clone)]
pub struct TschPacket {
    frame: [u8; PACKET_MAX_LEN],
    len: usize,
    /// MAC header length, the boundary security treats as cleartext
    pub header_len: usize,
    /// Offset of the Sync-IE time fields inside an enhanced beacon
    pub sync_ie_offset: Option<usize>,
    pub security_level: u8,
    pub dest: Address,
    /// Attempts so far; the packet is dropped after `max_frame_retries + 1`
    pub transmissions: u8,
    /// Outcome of the most recent attempt
    pub ret: Option<MacTxStatus>,
}

impl TschPacket {
    pub fn frame(&self) -> &[u8] {
        &self.frame[..self.len]
    }

    pub(crate) fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.frame[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Neighbor table entry: link address, role flags, CSMA backoff state and
/// the queue of pool indices awaiting transmission
#[derive(Debug)]
pub struct Neighbor {
    pub addr: Address,
    pub is_broadcast: bool,
    pub is_time_source: bool,
    backoff_exponent: u8,
    backoff_window: u8,
    tx_queue: Deque<PacketId, QUEUE_PER_NEIGHBOR>,
}

impl Neighbor {
    fn new(addr: Address, is_broadcast: bool, min_be: u8) -> Self {
        Self {
            addr,
            is_broadcast,
            is_time_source: false,
            backoff_exponent: min_be,
            backoff_window: 0,
            tx_queue: Deque::new(),
        }
    }

    pub fn backoff_exponent(&self) -> u8 {
        self.backoff_exponent
    }

    pub fn backoff_window(&self) -> u8 {
        self.backoff_window
    }

    /// Head of this neighbor's transmit queue
    fn first_packet(&self) -> Option<PacketId> {
        self.tx_queue.front().copied()
    }

    fn queue_len(&self) -> usize {
        self.tx_queue.len()
    }
}

/// Neighbor table and outgoing packet store
pub struct TschQueue<G> {
    neighbors: [Option<Neighbor>; QUEUE_MAX_NEIGHBORS],
    pool: [Option<TschPacket>; QUEUE_NUM_PACKETS],
    min_be: u8,
    max_be: u8,
    rng: G,
}

const EB_NEIGHBOR: NeighborId = NeighborId(0);
const BROADCAST_NEIGHBOR: NeighborId = NeighborId(1);

impl<G: RngCore> TschQueue<G> {
    pub fn new(rng: G, min_be: u8, max_be: u8) -> Self {
        const NO_NEIGHBOR: Option<Neighbor> = None;
        const NO_PACKET: Option<TschPacket> = None;

        let mut neighbors = [NO_NEIGHBOR; QUEUE_MAX_NEIGHBORS];
        neighbors[EB_NEIGHBOR.0] = Some(Neighbor::new(Address::None, true, min_be));
        neighbors[BROADCAST_NEIGHBOR.0] = Some(Neighbor::new(broadcast_address(), true, min_be));

        Self {
            neighbors,
            pool: [NO_PACKET; QUEUE_NUM_PACKETS],
            min_be,
            max_be,
            rng,
        }
    }

    /// Sentinel queue for outgoing enhanced beacons
    pub fn eb_neighbor(&self) -> NeighborId {
        EB_NEIGHBOR
    }

    /// Sentinel queue for broadcast frames
    pub fn broadcast_neighbor(&self) -> NeighborId {
        BROADCAST_NEIGHBOR
    }

    pub fn neighbor(&self, id: NeighborId) -> Option<&Neighbor> {
        self.neighbors.get(id.0).and_then(|n| n.as_ref())
    }

    fn neighbor_mut(&mut self, id: NeighborId) -> Option<&mut Neighbor> {
        self.neighbors.get_mut(id.0).and_then(|n| n.as_mut())
    }

    /// Look a neighbor up by link address
    pub fn get_nbr(&self, addr: &Address) -> Option<NeighborId> {
        self.neighbors
            .iter()
            .position(|n| matches!(n, Some(n) if n.addr == *addr))
            .map(NeighborId)
    }

    /// Fetch or create the neighbor entry for an address
    pub fn add_nbr(&mut self, addr: Address) -> Result<NeighborId, QueueError> {
        if let Some(id) = self.get_nbr(&addr) {
            return Ok(id);
        }

        let slot = self
            .neighbors
            .iter()
            .position(|n| n.is_none())
            .ok_or(QueueError::NeighborTableFull)?;

        let is_broadcast = is_broadcast_addr(&addr) || addr == Address::None;
        self.neighbors[slot] = Some(Neighbor::new(addr, is_broadcast, self.min_be));
        Ok(NeighborId(slot))
    }

    /// Make `addr` the sole time-source neighbor.
    ///
    /// Returns the neighbor handle, creating the entry if needed.
    pub fn set_time_source(&mut self, addr: &Address) -> Result<NeighborId, QueueError> {
        let id = self.add_nbr(*addr)?;
        for n in self.neighbors.iter_mut().flatten() {
            n.is_time_source = false;
        }
        if let Some(n) = self.neighbor_mut(id) {
            n.is_time_source = true;
        }
        Ok(id)
    }

    pub fn packet(&self, id: PacketId) -> Option<&TschPacket> {
        self.pool.get(id.0).and_then(|p| p.as_ref())
    }

    pub(crate) fn packet_mut(&mut self, id: PacketId) -> Option<&mut TschPacket> {
        self.pool.get_mut(id.0).and_then(|p| p.as_mut())
    }

    /// Queue an encoded frame for transmission to `dest`.
    ///
    /// `dest` of [`Address::None`] targets the enhanced-beacon queue,
    /// the broadcast address the broadcast queue.
    pub fn add_packet(
        &mut self,
        dest: Address,
        frame: &[u8],
        header_len: usize,
        sync_ie_offset: Option<usize>,
        security_level: u8,
    ) -> Result<PacketId, QueueError> {
        if frame.len() > PACKET_MAX_LEN {
            return Err(QueueError::PayloadTooLong);
        }

        let nbr = self.add_nbr(dest)?;

        let slot = self
            .pool
            .iter()
            .position(|p| p.is_none())
            .ok_or(QueueError::Full)?;

        let n = self.neighbor_mut(nbr).ok_or(QueueError::NotFound)?;
        if n.tx_queue.is_full() {
            return Err(QueueError::Full);
        }

        let mut packet = TschPacket {
            frame: [0u8; PACKET_MAX_LEN],
            len: frame.len(),
            header_len,
            sync_ie_offset,
            security_level,
            dest,
            transmissions: 0,
            ret: None,
        };
        packet.frame[..frame.len()].copy_from_slice(frame);

        n.tx_queue
            .push_back(PacketId(slot))
            .map_err(|_| QueueError::Full)?;

        self.pool[slot] = Some(packet);
        Ok(PacketId(slot))
    }

    /// Release a pool entry once the foreground has consumed its outcome
    pub fn free_packet(&mut self, id: PacketId) {
        if let Some(p) = self.pool.get_mut(id.0) {
            *p = None;
        }
    }

    /// Head packet for a neighbor, honoring CSMA backoff on shared links
    pub fn get_packet_for_nbr(&self, id: NeighborId, link: Option<&Link>) -> Option<PacketId> {
        let n = self.neighbor(id)?;
        let is_shared_link = link.map(|l| l.options.shared()).unwrap_or(false);

        if n.queue_len() == 0 {
            return None;
        }
        if is_shared_link && !self.backoff_expired(id) {
            // Shared cell and this neighbor is still backing off
            return None;
        }
        n.first_packet()
    }

    /// Any pending unicast packet, for serving broadcast cells that have
    /// no broadcast traffic queued
    pub fn get_unicast_packet_for_any(&self, link: Option<&Link>) -> Option<(PacketId, NeighborId)> {
        for (i, n) in self.neighbors.iter().enumerate() {
            if let Some(n) = n {
                if n.is_broadcast {
                    continue;
                }
                let id = NeighborId(i);
                if let Some(p) = self.get_packet_for_nbr(id, link) {
                    return Some((p, id));
                }
            }
        }
        None
    }

    /// Detach the head packet from a neighbor queue.
    ///
    /// The pool entry stays allocated; pair with [`Self::free_packet`]
    /// after foreground processing.
    pub fn remove_first(&mut self, id: NeighborId) -> Option<PacketId> {
        self.neighbor_mut(id)?.tx_queue.pop_front()
    }

    pub fn is_empty(&self, id: NeighborId) -> bool {
        self.neighbor(id).map(|n| n.queue_len() == 0).unwrap_or(true)
    }

    pub fn backoff_expired(&self, id: NeighborId) -> bool {
        self.neighbor(id).map(|n| n.backoff_window == 0).unwrap_or(true)
    }

    pub fn backoff_reset(&mut self, id: NeighborId) {
        let min_be = self.min_be;
        if let Some(n) = self.neighbor_mut(id) {
            n.backoff_window = 0;
            n.backoff_exponent = min_be;
        }
    }

    /// Increase the backoff exponent and draw a fresh contention window,
    /// uniform in `0..2^BE`
    pub fn backoff_inc(&mut self, id: NeighborId) {
        let max_be = self.max_be;
        let draw = self.rng.next_u32();
        if let Some(n) = self.neighbor_mut(id) {
            n.backoff_exponent = core::cmp::min(n.backoff_exponent + 1, max_be);
            n.backoff_window = (draw % (1u32 << n.backoff_exponent)) as u8;
        }
    }

    /// After a shared TX slot, let every neighbor eligible on that cell
    /// make progress through its contention window
    pub fn update_all_backoff_windows(&mut self, addr: &Address) {
        let to_all = is_broadcast_addr(addr);
        for n in self.neighbors.iter_mut().flatten() {
            if n.backoff_window != 0 && (to_all || n.addr == *addr) {
                n.backoff_window -= 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schedule::{LinkOptions, LinkType};

    use ieee802154::mac::{ExtendedAddress, PanId};
    use rand::rngs::mock::StepRng;

    fn queue() -> TschQueue<StepRng> {
        TschQueue::new(StepRng::new(7, 13), 1, 7)
    }

    fn nbr_addr(id: u64) -> Address {
        Address::Extended(PanId(0x0100), ExtendedAddress(id))
    }

    fn shared_link(addr: Address) -> Link {
        Link {
            options: LinkOptions::TX | LinkOptions::SHARED,
            link_type: LinkType::Normal,
            addr,
            channel_offset: 0,
        }
    }

    #[test]
    fn sentinels_exist() {
        let q = queue();

        let eb = q.neighbor(q.eb_neighbor()).unwrap();
        assert!(eb.is_broadcast);
        assert_eq!(eb.addr, Address::None);

        let bcast = q.neighbor(q.broadcast_neighbor()).unwrap();
        assert!(bcast.is_broadcast);
        assert_eq!(q.get_nbr(&broadcast_address()), Some(q.broadcast_neighbor()));
    }

    #[test]
    fn add_and_remove_in_order() {
        let mut q = queue();
        let addr = nbr_addr(1);

        let p1 = q.add_packet(addr, &[1, 2, 3], 2, None, 0).unwrap();
        let p2 = q.add_packet(addr, &[4, 5, 6], 2, None, 0).unwrap();

        let n = q.get_nbr(&addr).unwrap();
        assert!(!q.is_empty(n));
        assert_eq!(q.get_packet_for_nbr(n, None), Some(p1));

        assert_eq!(q.remove_first(n), Some(p1));
        assert_eq!(q.get_packet_for_nbr(n, None), Some(p2));

        // Pool entry survives queue removal until freed
        assert_eq!(q.packet(p1).unwrap().frame(), &[1, 2, 3]);
        q.free_packet(p1);
        assert!(q.packet(p1).is_none());
    }

    #[test]
    fn backoff_gates_shared_links_only() {
        let mut q = queue();
        let addr = nbr_addr(2);
        let link = shared_link(addr);

        let p = q.add_packet(addr, &[0; 8], 2, None, 0).unwrap();
        let n = q.get_nbr(&addr).unwrap();

        q.backoff_inc(n);
        assert!(!q.backoff_expired(n));

        // Backing off on the shared cell, free on a dedicated one
        assert_eq!(q.get_packet_for_nbr(n, Some(&link)), None);
        assert_eq!(q.get_packet_for_nbr(n, None), Some(p));

        // Window drains one shared slot at a time
        while !q.backoff_expired(n) {
            q.update_all_backoff_windows(&broadcast_address());
        }
        assert_eq!(q.get_packet_for_nbr(n, Some(&link)), Some(p));
    }

    #[test]
    fn backoff_exponent_saturates() {
        let mut q = queue();
        let n = q.add_nbr(nbr_addr(3)).unwrap();

        assert_eq!(q.neighbor(n).unwrap().backoff_exponent(), 1);

        for _ in 0..10 {
            q.backoff_inc(n);
            let nbr = q.neighbor(n).unwrap();
            assert!(nbr.backoff_exponent() <= 7);
            assert!((nbr.backoff_window() as u32) < 1 << nbr.backoff_exponent());
        }
        assert_eq!(q.neighbor(n).unwrap().backoff_exponent(), 7);

        q.backoff_reset(n);
        assert_eq!(q.neighbor(n).unwrap().backoff_exponent(), 1);
        assert!(q.backoff_expired(n));
    }

    #[test]
    fn unicast_fallback_skips_broadcast_queues() {
        let mut q = queue();

        q.add_packet(broadcast_address(), &[0; 4], 2, None, 0).unwrap();
        assert_eq!(q.get_unicast_packet_for_any(None), None);

        let addr = nbr_addr(4);
        let p = q.add_packet(addr, &[0; 4], 2, None, 0).unwrap();
        let n = q.get_nbr(&addr).unwrap();
        assert_eq!(q.get_unicast_packet_for_any(None), Some((p, n)));
    }

    #[test]
    fn time_source_is_exclusive() {
        let mut q = queue();

        let a = q.set_time_source(&nbr_addr(5)).unwrap();
        assert!(q.neighbor(a).unwrap().is_time_source);

        let b = q.set_time_source(&nbr_addr(6)).unwrap();
        assert!(!q.neighbor(a).unwrap().is_time_source);
        assert!(q.neighbor(b).unwrap().is_time_source);
    }
}
