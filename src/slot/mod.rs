//! TSCH slot operation engine.
//!
//! [`SlotEngine`] runs one timeslot at a time from timer-interrupt context
//! as an explicit, resumable state machine: every timed wait arms the
//! one-shot rtimer a guard interval early and returns out of the
//! interrupt; the next timer fire re-enters
//! [`SlotEngine::slot_operation`], which busy-waits to the exact tick and
//! resumes at the recorded phase. State that must survive a yield lives in
//! the engine's [`TxContext`]/[`RxContext`], never on the stack.
//!
//! Foreground code interacts with the engine through the lock protocol
//! (`get_lock`/`release_lock`) for schedule/queue mutation, and through the
//! published rings (`process_pending_input`, `process_pending_dequeued`,
//! `flush_logs`) for everything the interrupt context hands off.

use ieee802154::mac::Address;

use rand_core::RngCore;

use crate::asn::Asn;
use crate::config::{Config, SlotTiming};
use crate::error::QueueError;
use crate::frames::{FrameCodec, ParsedFrame, SecurityCodec};
use crate::lock::LockArbiter;
use crate::log::debug;
use crate::logging::{SlotLog, SlotLogEntry};
use crate::queue::{NeighborId, PacketId, TschPacket, TschQueue, QUEUE_NUM_PACKETS};
use crate::ringbuf::RingIndex;
use crate::schedule::{Link, LinkType, Schedule};
use crate::time::{
    check_timer_miss, packet_duration, rtimer_guard, ticks_to_us, us_to_ticks, us_to_ticks_signed,
};
use crate::timesync::TimeSync;
use crate::{MacTxStatus, SlotClock, SlotRadio, TickDelta, Ticks, PACKET_MAX_LEN};

mod tx;

mod rx;

#[cfg(test)]
mod test;

/// Capacity of the incoming packet ring, power of two
pub const MAX_INCOMING_PACKETS: usize = 4;

/// Capacity of the dequeued packet ring, power of two and at least the
/// packet pool size so every in-flight packet has somewhere to land
pub const DEQUEUED_RING_SIZE: usize = 16;

const _: () = assert!(DEQUEUED_RING_SIZE >= QUEUE_NUM_PACKETS);

/// First byte of a guard-beacon frame
pub const GUARD_BEACON_MARKER: u8 = 0xb7;

/// Guard-beacon repeat tags, in transmission order
pub const GUARD_BEACON_TAGS: [u8; 3] = [0x11, 0x22, 0x33];

/// A received frame as published to the foreground
#[derive(Debug, Clone, Copy)]
pub struct InputPacket {
    pub payload: [u8; PACKET_MAX_LEN],
    pub len: usize,
    pub rx_asn: Asn,
    pub rssi: i8,
    pub channel: u8,
}

impl InputPacket {
    const fn empty() -> Self {
        Self {
            payload: [0u8; PACKET_MAX_LEN],
            len: 0,
            rx_asn: Asn { ls4b: 0, ms1b: 0 },
            rssi: 0,
            channel: 0,
        }
    }

    pub fn frame(&self) -> &[u8] {
        &self.payload[..self.len]
    }
}

/// What the host should do after a timer fire returned
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SlotEvents {
    /// Published packets or log records await foreground processing
    pub poll_foreground: bool,
    /// The engine lost synchronization and left the network
    pub disassociated: bool,
}

/// Radio power-up sites, matched against the power policy
#[derive(Debug, Clone, Copy, PartialEq)]
enum RadioOn {
    StartOfTimeslot,
    WithinTimeslot,
    #[allow(dead_code)]
    Force,
}

/// Radio power-down sites
#[derive(Debug, Clone, Copy, PartialEq)]
enum RadioOff {
    EndOfTimeslot,
    WithinTimeslot,
    Force,
}

/// Resumption point of the slot state machine
#[derive(Debug, Clone, Copy, PartialEq)]
enum SlotState {
    /// Between slots; the timer is armed for the next slot start
    Idle,
    TxCca,
    TxTransmit,
    TxAckListen,
    RxListen,
    RxAckTransmit,
}

/// Transmit-slot state surviving yields
struct TxContext {
    status: MacTxStatus,
    dequeued_index: usize,
    seqno: u8,
    is_broadcast: bool,
    orig_len: usize,
    frame_len: usize,
    header_len: usize,
    security_level: u8,
    use_scratch: bool,
    scratch: [u8; PACKET_MAX_LEN],
    tx_start_time: Ticks,
    tx_duration: Ticks,
    gb_burst: bool,
    gb_stage: usize,
}

impl TxContext {
    const fn clear() -> Self {
        Self {
            // Left in place when the frame never makes it to the air
            status: MacTxStatus::Err,
            dequeued_index: 0,
            seqno: 0,
            is_broadcast: false,
            orig_len: 0,
            frame_len: 0,
            header_len: 0,
            security_level: 0,
            use_scratch: false,
            scratch: [0u8; PACKET_MAX_LEN],
            tx_start_time: 0,
            tx_duration: 0,
            gb_burst: false,
            gb_stage: 0,
        }
    }
}

/// Receive-slot state surviving yields
struct RxContext {
    input_index: usize,
    expected_rx_time: Ticks,
    rx_start_time: Ticks,
    packet_duration: Ticks,
    frame: Option<ParsedFrame>,
    estimated_drift: TickDelta,
    is_eb: bool,
    is_gb: bool,
    gb_tag: u8,
    ack_buf: [u8; PACKET_MAX_LEN],
    ack_len: usize,
}

impl RxContext {
    const fn clear() -> Self {
        Self {
            input_index: 0,
            expected_rx_time: 0,
            rx_start_time: 0,
            packet_duration: 0,
            frame: None,
            estimated_drift: 0,
            is_eb: false,
            is_gb: false,
            gb_tag: 0,
            ack_buf: [0u8; PACKET_MAX_LEN],
            ack_len: 0,
        }
    }
}

/// The per-timeslot operation engine.
///
/// Generic over the radio (R), rtimer clock (C), schedule store (S), frame
/// and security codec (F), adaptive timesync filter (H) and the backoff
/// RNG (G).
pub struct SlotEngine<R, C, S, F, H, G> {
    pub(crate) address: Address,
    pub(crate) config: Config,
    pub(crate) timing: SlotTiming,

    pub(crate) radio: R,
    pub(crate) clock: C,
    pub(crate) schedule: S,
    pub(crate) codec: F,
    pub(crate) timesync: H,

    pub(crate) queue: TschQueue<G>,
    pub(crate) lock: LockArbiter,
    pub(crate) slot_log: SlotLog,

    pub(crate) asn: Asn,
    pub(crate) last_sync_asn: Asn,
    pub(crate) associated: bool,

    state: SlotState,
    wait_ref: Ticks,
    wait_offset: Ticks,

    pub(crate) current_slot_start: Ticks,
    pub(crate) current_link: Option<Link>,
    pub(crate) backup_link: Option<Link>,
    pub(crate) current_packet: Option<PacketId>,
    pub(crate) current_neighbor: Option<NeighborId>,
    pub(crate) current_channel: u8,

    pub(crate) drift_correction: TickDelta,
    pub(crate) drift_correction_used: bool,
    pub(crate) last_timesource: Option<NeighborId>,

    input_ring: RingIndex<MAX_INCOMING_PACKETS>,
    input_array: [InputPacket; MAX_INCOMING_PACKETS],
    pub(crate) input_queue_drop: u16,

    dequeued_ring: RingIndex<DEQUEUED_RING_SIZE>,
    dequeued_array: [Option<PacketId>; DEQUEUED_RING_SIZE],

    tx: TxContext,
    rx: RxContext,
}

impl<R, C, S, F, H, G> SlotEngine<R, C, S, F, H, G>
where
    R: SlotRadio,
    C: SlotClock,
    S: Schedule,
    F: FrameCodec + SecurityCodec,
    H: TimeSync,
    G: RngCore,
{
    pub fn new(
        address: Address,
        config: Config,
        timing: SlotTiming,
        radio: R,
        clock: C,
        schedule: S,
        codec: F,
        timesync: H,
        rng: G,
    ) -> Self {
        const EMPTY_INPUT: InputPacket = InputPacket::empty();

        let queue = TschQueue::new(
            rng,
            config.min_backoff_exponent,
            config.max_backoff_exponent,
        );

        debug!("Setup slot engine with address {:?}", address);

        Self {
            address,
            config,
            timing,

            radio,
            clock,
            schedule,
            codec,
            timesync,

            queue,
            lock: LockArbiter::new(),
            slot_log: SlotLog::new(),

            asn: Asn::default(),
            last_sync_asn: Asn::default(),
            associated: false,

            state: SlotState::Idle,
            wait_ref: 0,
            wait_offset: 0,

            current_slot_start: 0,
            current_link: None,
            backup_link: None,
            current_packet: None,
            current_neighbor: None,
            current_channel: 0,

            drift_correction: 0,
            drift_correction_used: false,
            last_timesource: None,

            input_ring: RingIndex::new(),
            input_array: [EMPTY_INPUT; MAX_INCOMING_PACKETS],
            input_queue_drop: 0,

            dequeued_ring: RingIndex::new(),
            dequeued_array: [None; DEQUEUED_RING_SIZE],

            tx: TxContext::clear(),
            rx: RxContext::clear(),
        }
    }

    /// Adopt a time base: the tick of an upcoming slot boundary and the
    /// network ASN of that slot. Called once the node has associated.
    pub fn sync(&mut self, next_slot_start: Ticks, next_slot_asn: Asn) {
        self.current_slot_start = next_slot_start;
        self.asn = next_slot_asn;
        self.last_sync_asn = next_slot_asn;
        self.current_link = None;
        self.backup_link = None;
        self.state = SlotState::Idle;
        self.associated = true;
    }

    /// Arm the timer for the first slot, skipping forward past any slots
    /// whose deadline already passed
    pub fn start(&mut self) {
        loop {
            let timeslot_diff = match self.schedule.next_active_link(&self.asn) {
                Some(next) => {
                    self.current_link = Some(next.link);
                    self.backup_link = next.backup;
                    next.timeslot_diff
                }
                None => {
                    self.current_link = None;
                    self.backup_link = None;
                    1
                }
            };
            self.asn.increment(timeslot_diff);

            let time_to_next = (timeslot_diff as Ticks).wrapping_mul(self.timing.timeslot_length);
            let prev_slot_start = self.current_slot_start;
            self.current_slot_start = prev_slot_start.wrapping_add(time_to_next);

            if self.schedule_slot_operation(prev_slot_start, time_to_next) {
                break;
            }
        }
    }

    /// Timer interrupt entry point: resume the slot state machine.
    ///
    /// Returns what the host shim should signal to the foreground.
    pub fn slot_operation(&mut self) -> SlotEvents {
        let mut ev = SlotEvents::default();

        match self.state {
            SlotState::Idle => self.slot_begin(&mut ev),
            SlotState::TxCca => {
                self.finish_wait();
                self.tx_cca(&mut ev);
            }
            SlotState::TxTransmit => {
                self.finish_wait();
                self.tx_transmit(&mut ev);
            }
            SlotState::TxAckListen => {
                self.finish_wait();
                self.tx_ack_listen(&mut ev);
            }
            SlotState::RxListen => {
                self.finish_wait();
                self.rx_listen(&mut ev);
            }
            SlotState::RxAckTransmit => {
                self.finish_wait();
                self.rx_ack_transmit(&mut ev);
            }
        }

        ev
    }

    /// Start-of-slot: refuse when the foreground wants the lock, select
    /// packet and neighbor, hop channel and dispatch TX or RX
    fn slot_begin(&mut self, ev: &mut SlotEvents) {
        if !self.associated {
            return;
        }

        if self.current_link.is_none() || self.lock.is_lock_requested() || self.lock.is_locked() {
            let no_link = self.current_link.is_none();
            self.log_slot_message(
                "!skipped slot",
                (self.lock.is_lock_requested() || self.lock.is_locked()) as i32,
                no_link as i32,
            );
            ev.poll_foreground = true;
            self.slot_end(ev);
            return;
        }

        self.lock.set_in_slot_operation(true);
        self.drift_correction = 0;
        self.drift_correction_used = false;

        let link = match self.current_link {
            Some(link) => link,
            None => {
                self.lock.set_in_slot_operation(false);
                return;
            }
        };

        let (mut packet, mut neighbor) = self.packet_and_neighbor_for_link(&link);

        // Nothing to send and no RX on this cell: rebind to the RX-capable
        // backup link if the schedule provided one
        if packet.is_none() && !link.options.rx() {
            if let Some(backup) = self.backup_link {
                self.current_link = Some(backup);
                let (p, n) = self.packet_and_neighbor_for_link(&backup);
                packet = p;
                neighbor = n;
            }
        }

        self.current_packet = packet;
        self.current_neighbor = neighbor;

        let link = match self.current_link {
            Some(link) => link,
            None => {
                self.lock.set_in_slot_operation(false);
                return;
            }
        };

        let is_active = self.current_packet.is_some() || link.options.rx();
        if is_active {
            self.current_channel = self.config.hopping.channel(&self.asn, link.channel_offset);
            self.radio.set_channel(self.current_channel);
            self.radio_on(RadioOn::StartOfTimeslot);

            if self.current_packet.is_some() {
                self.tx_slot(ev);
            } else {
                self.rx_slot(ev);
            }
        } else {
            self.slot_end(ev);
        }
    }

    /// Link/packet selection: enhanced beacons on advertising cells, then
    /// the cell neighbor's queue, then any unicast on a broadcast cell
    fn packet_and_neighbor_for_link(
        &mut self,
        link: &Link,
    ) -> (Option<PacketId>, Option<NeighborId>) {
        let mut packet = None;
        let mut neighbor = None;

        if !link.options.tx() {
            return (packet, neighbor);
        }

        if matches!(
            link.link_type,
            LinkType::Advertising | LinkType::AdvertisingOnly
        ) {
            let eb = self.queue.eb_neighbor();
            neighbor = Some(eb);
            packet = self.queue.get_packet_for_nbr(eb, Some(link));
        }

        if link.link_type != LinkType::AdvertisingOnly && packet.is_none() {
            neighbor = self.queue.get_nbr(&link.addr);
            if let Some(n) = neighbor {
                packet = self.queue.get_packet_for_nbr(n, Some(link));
            }
            if packet.is_none() && neighbor == Some(self.queue.broadcast_neighbor()) {
                if let Some((p, n)) = self.queue.get_unicast_packet_for_any(Some(link)) {
                    packet = Some(p);
                    neighbor = Some(n);
                }
            }
        }

        (packet, neighbor)
    }

    /// End-of-slot: desynchronization check, then schedule the next slot,
    /// advancing the ASN slot by slot past any missed deadlines
    fn slot_end(&mut self, ev: &mut SlotEvents) {
        if !self.config.coordinator
            && self.asn.diff(&self.last_sync_asn) > self.desync_timeout_slots()
        {
            self.log_slot_message(
                "!leaving the network, last sync",
                self.asn.diff(&self.last_sync_asn),
                0,
            );
            ev.poll_foreground = true;
            ev.disassociated = true;

            self.last_timesource = None;
            self.associated = false;
            self.current_link = None;
            self.lock.set_in_slot_operation(false);
            self.state = SlotState::Idle;
            return;
        }

        loop {
            if let Some(link) = self.current_link {
                if link.options.tx() && link.options.shared() {
                    // Let every neighbor contending on this cell make
                    // progress through its backoff window
                    self.queue.update_all_backoff_windows(&link.addr);
                }
            }

            let timeslot_diff = match self.schedule.next_active_link(&self.asn) {
                Some(next) => {
                    self.current_link = Some(next.link);
                    self.backup_link = next.backup;
                    next.timeslot_diff
                }
                None => {
                    // Empty schedule: wake at the next slot anyway
                    self.current_link = None;
                    self.backup_link = None;
                    1
                }
            };
            self.asn.increment(timeslot_diff);

            let time_to_next = (timeslot_diff as Ticks)
                .wrapping_mul(self.timing.timeslot_length)
                .wrapping_add(self.drift_correction as Ticks);
            self.drift_correction = 0;
            self.drift_correction_used = false;

            let prev_slot_start = self.current_slot_start;
            self.current_slot_start = prev_slot_start.wrapping_add(time_to_next);
            let compensation = self.timesync.adaptive_compensate(time_to_next);
            self.current_slot_start = self.current_slot_start.wrapping_add(compensation as Ticks);

            if self.schedule_slot_operation(prev_slot_start, time_to_next) {
                break;
            }
        }

        self.lock.set_in_slot_operation(false);
        self.state = SlotState::Idle;
    }

    /// Arm the timer `offset` ticks after `ref_time`. Returns false on a
    /// missed deadline (nothing armed; the caller skips or catches up).
    fn schedule_slot_operation(&mut self, ref_time: Ticks, offset: Ticks) -> bool {
        let now = self.clock.now();

        // The timer cannot be armed closer than the guard interval
        if check_timer_miss(ref_time, offset.wrapping_sub(self.guard()), now) {
            return false;
        }

        self.clock.arm(ref_time.wrapping_add(offset)).is_ok()
    }

    /// Yield until `ref_time + offset`: arm the timer a guard interval
    /// early and suspend if possible (returns true; the caller must
    /// return), otherwise busy-wait to the target and continue inline.
    fn yield_until(&mut self, ref_time: Ticks, offset: Ticks, resume: SlotState) -> bool {
        if self.schedule_slot_operation(ref_time, offset.wrapping_sub(self.guard())) {
            self.wait_ref = ref_time;
            self.wait_offset = offset;
            self.state = resume;
            true
        } else {
            self.busy_wait_until(ref_time, offset);
            false
        }
    }

    /// After a timer wake, spin out the remaining guard interval so the
    /// phase starts on its exact tick
    fn finish_wait(&mut self) {
        let (ref_time, offset) = (self.wait_ref, self.wait_offset);
        self.busy_wait_until(ref_time, offset);
    }

    fn busy_wait_until(&mut self, ref_time: Ticks, offset: Ticks) {
        while !check_timer_miss(ref_time, offset, self.clock.now()) {
            core::hint::spin_loop();
        }
    }

    /// Busy-wait until the radio condition holds or the absolute deadline
    /// `ref_time + offset` passes; returns the final condition value
    fn busy_wait_radio(
        &mut self,
        ref_time: Ticks,
        offset: Ticks,
        mut cond: impl FnMut(&mut R) -> bool,
    ) -> bool {
        loop {
            if cond(&mut self.radio) {
                return true;
            }
            if check_timer_miss(ref_time, offset, self.clock.now()) {
                return cond(&mut self.radio);
            }
            core::hint::spin_loop();
        }
    }

    fn radio_on(&mut self, cmd: RadioOn) {
        let do_it = match cmd {
            RadioOn::StartOfTimeslot => self.config.radio_on_during_timeslot,
            RadioOn::WithinTimeslot => !self.config.radio_on_during_timeslot,
            RadioOn::Force => true,
        };
        if do_it {
            self.radio.on();
        }
    }

    fn radio_off(&mut self, cmd: RadioOff) {
        let do_it = match cmd {
            RadioOff::EndOfTimeslot => self.config.radio_on_during_timeslot,
            RadioOff::WithinTimeslot => !self.config.radio_on_during_timeslot,
            RadioOff::Force => true,
        };
        if do_it {
            self.radio.off();
        }
    }

    fn log_slot_message(&mut self, text: &'static str, arg0: i32, arg1: i32) {
        self.slot_log.add(SlotLogEntry::message(
            self.asn,
            self.current_channel,
            text,
            arg0,
            arg1,
        ));
    }

    fn guard(&self) -> Ticks {
        rtimer_guard(self.config.rtimer_second)
    }

    fn duration(&self, len: usize) -> Ticks {
        packet_duration(len, self.config.rtimer_second)
    }

    pub(crate) fn us_to_ticks(&self, us: u32) -> Ticks {
        us_to_ticks(us, self.config.rtimer_second)
    }

    pub(crate) fn us_to_ticks_i(&self, us: i32) -> TickDelta {
        us_to_ticks_signed(us, self.config.rtimer_second)
    }

    pub(crate) fn ticks_to_us(&self, ticks: TickDelta) -> i32 {
        ticks_to_us(ticks, self.config.rtimer_second)
    }

    /// Slots without a time-source exchange after which the node leaves
    /// the network
    fn desync_timeout_slots(&self) -> i32 {
        (100 * ((self.config.desync_threshold / 100) / self.timing.timeslot_length)) as i32
    }

    // Foreground surface

    /// Take the engine lock from foreground context; no slot starts while
    /// it is held. Required around any schedule/queue/neighbor mutation.
    pub fn get_lock(&self) -> bool {
        self.lock.acquire()
    }

    /// Release the engine lock
    pub fn release_lock(&self) {
        self.lock.release()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn is_associated(&self) -> bool {
        self.associated
    }

    pub fn asn(&self) -> Asn {
        self.asn
    }

    /// Neighbor and packet store. Mutation requires the lock.
    pub fn queue(&self) -> &TschQueue<G> {
        &self.queue
    }

    /// Mutable neighbor and packet store access. Hold the lock.
    pub fn queue_mut(&mut self) -> &mut TschQueue<G> {
        &mut self.queue
    }

    /// Mutable schedule access. Hold the lock.
    pub fn schedule_mut(&mut self) -> &mut S {
        &mut self.schedule
    }

    /// Make `addr` the time source for drift corrections and keepalives
    pub fn update_time_source(&mut self, addr: &Address) -> Result<NeighborId, QueueError> {
        let id = self.queue.set_time_source(addr)?;
        self.last_timesource = Some(id);
        Ok(id)
    }

    /// Drain received frames published by RX slots. Foreground only; each
    /// frame is handed out before its ring slot is released.
    pub fn process_pending_input(&mut self, mut f: impl FnMut(&InputPacket)) -> usize {
        let mut count = 0;
        while let Some(index) = self.input_ring.peek_get() {
            f(&self.input_array[index]);
            self.input_ring.get();
            count += 1;
        }
        count
    }

    /// Drain transmitted/dropped packets published by TX slots, releasing
    /// their pool entries after the callback. Foreground only.
    pub fn process_pending_dequeued(&mut self, mut f: impl FnMut(&TschPacket)) -> usize {
        let mut count = 0;
        while let Some(index) = self.dequeued_ring.peek_get() {
            if let Some(id) = self.dequeued_array[index].take() {
                if let Some(packet) = self.queue.packet(id) {
                    f(packet);
                }
                self.queue.free_packet(id);
                count += 1;
            }
            self.dequeued_ring.get();
        }
        count
    }

    /// Render and drain the slot log ring. Foreground only.
    pub fn flush_logs(&mut self) {
        self.slot_log.flush()
    }
}
