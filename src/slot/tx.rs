//! Transmit slot execution: optional CCA, transmission at the slot TX
//! offset, the enhanced-ACK window for unicasts, drift extraction from the
//! ACK time-correction IE, retry/backoff accounting and publication of
//! dequeued packets to the foreground.

use ieee802154::mac::Address;

use rand_core::RngCore;

use crate::frames::{FrameCodec, SecurityCodec};
use crate::logging::{SlotLogEntry, SlotLogKind, TxLog};
use crate::queue::{NeighborId, PacketId};
use crate::schedule::Schedule;
use crate::timesync::TimeSync;
use crate::{MacTxStatus, SlotClock, SlotRadio, PACKET_MAX_LEN};

use super::{RadioOff, RadioOn, SlotEngine, SlotEvents, SlotState, TxContext, GUARD_BEACON_TAGS};

impl<R, C, S, F, H, G> SlotEngine<R, C, S, F, H, G>
where
    R: SlotRadio,
    C: SlotClock,
    S: Schedule,
    F: FrameCodec + SecurityCodec,
    H: TimeSync,
    G: RngCore,
{
    /// Enter a transmit slot: stage the frame into the radio and yield
    /// until CCA or transmission time
    pub(super) fn tx_slot(&mut self, ev: &mut SlotEvents) {
        self.tx = TxContext::clear();

        // Reserve the outcome slot first: with nowhere to publish a
        // success or a drop, no transmission is attempted at all
        let dequeued_index = match self.dequeued_ring.peek_put() {
            Some(index) => index,
            None => {
                self.log_tx_record(MacTxStatus::ErrFatal, ev);
                self.radio_off(RadioOff::EndOfTimeslot);
                self.slot_end(ev);
                return;
            }
        };
        self.tx.dequeued_index = dequeued_index;

        let (packet_id, neighbor_id) = match (self.current_packet, self.current_neighbor) {
            (Some(p), Some(n)) => (p, n),
            _ => {
                self.tx.status = MacTxStatus::ErrFatal;
                self.tx_slot_finish(ev);
                return;
            }
        };

        let meta = self
            .queue
            .packet(packet_id)
            .map(|p| (p.len(), p.header_len, p.sync_ie_offset, p.security_level));
        let (orig_len, header_len, sync_ie_offset, security_level) = match meta {
            Some((len, header_len, sync_ie, level)) if len > 0 => {
                (len, header_len, sync_ie, level)
            }
            _ => {
                // The queued buffer went missing under us
                self.tx.status = MacTxStatus::ErrFatal;
                self.tx_slot_finish(ev);
                return;
            }
        };

        self.tx.orig_len = orig_len;
        self.tx.frame_len = orig_len;
        self.tx.header_len = header_len;
        self.tx.security_level = security_level;
        self.tx.is_broadcast = self
            .queue
            .neighbor(neighbor_id)
            .map(|n| n.is_broadcast)
            .unwrap_or(false);
        self.tx.seqno = self
            .queue
            .packet(packet_id)
            .filter(|p| p.len() > 2)
            .map(|p| p.frame()[2])
            .unwrap_or(0);

        // Refresh the Sync-IE of an outgoing enhanced beacon with the
        // current ASN
        let mut packet_ready = true;
        if neighbor_id == self.queue.eb_neighbor() {
            if let Some(offset) = sync_ie_offset {
                let asn = self.asn;
                let SlotEngine { queue, codec, .. } = self;
                if let Some(p) = queue.packet_mut(packet_id) {
                    packet_ready = codec.update_eb(p.frame_mut(), offset, &asn);
                }
            }
        }

        // Secure a scratch copy, leaving the queued frame pristine for
        // retransmissions
        if self.config.security_enabled {
            let asn = self.asn;
            let SlotEngine { queue, codec, tx, .. } = self;
            if let Some(p) = queue.packet(packet_id) {
                tx.scratch[..orig_len].copy_from_slice(p.frame());
                let added = codec.secure_frame(&mut tx.scratch, orig_len, header_len, &asn);
                tx.frame_len = orig_len + added;
                tx.use_scratch = true;
            }
        }

        self.tx.gb_burst = self.config.guard_beacon
            && self.config.coordinator
            && self.tx.is_broadcast
            && orig_len <= 1;

        // Guard bursts stage their own frame per repetition
        let prepared = if self.tx.gb_burst {
            packet_ready
        } else {
            packet_ready && self.prepare_current_frame(packet_id)
        };
        if !prepared {
            // The radio refused the frame: no air activity this slot
            self.tx_slot_finish(ev);
            return;
        }

        let t = self.timing;
        let slot_start = self.current_slot_start;

        if self.tx.gb_burst {
            let first = t
                .tx_offset
                .wrapping_sub(R::DELAY_BEFORE_TX)
                .wrapping_sub(self.us_to_ticks(self.config.guard_beacon_time_us));
            if self.yield_until(slot_start, first, SlotState::TxTransmit) {
                return;
            }
            self.tx_transmit(ev);
        } else if self.config.cca_enabled {
            if self.yield_until(slot_start, t.cca_offset, SlotState::TxCca) {
                return;
            }
            self.tx_cca(ev);
        } else {
            let offset = t.tx_offset.wrapping_sub(R::DELAY_BEFORE_TX);
            if self.yield_until(slot_start, offset, SlotState::TxTransmit) {
                return;
            }
            self.tx_transmit(ev);
        }
    }

    fn prepare_current_frame(&mut self, packet_id: PacketId) -> bool {
        let SlotEngine {
            radio, queue, tx, ..
        } = self;

        let frame: &[u8] = if tx.use_scratch {
            &tx.scratch[..tx.frame_len]
        } else {
            match queue.packet(packet_id) {
                Some(p) => p.frame(),
                None => return false,
            }
        };

        radio.prepare(frame).is_ok()
    }

    /// Clear channel assessment: sample until the channel reads clear or
    /// the assessment window closes
    pub(super) fn tx_cca(&mut self, ev: &mut SlotEvents) {
        let t = self.timing;
        let slot_start = self.current_slot_start;

        self.radio_on(RadioOn::WithinTimeslot);
        let clear = self.busy_wait_radio(slot_start, t.cca_offset.wrapping_add(t.cca), |r| {
            r.channel_clear()
        });
        // Not enough time to power the radio down before transmitting

        if !clear {
            self.tx.status = MacTxStatus::Collision;
            self.tx_slot_finish(ev);
            return;
        }

        let offset = t.tx_offset.wrapping_sub(R::DELAY_BEFORE_TX);
        if self.yield_until(slot_start, offset, SlotState::TxTransmit) {
            return;
        }
        self.tx_transmit(ev);
    }

    /// Fire the prepared frame at the TX offset, then either finish
    /// (broadcast) or open the enhanced-ACK window (unicast)
    pub(super) fn tx_transmit(&mut self, ev: &mut SlotEvents) {
        if self.tx.gb_burst {
            self.tx_transmit_guard(ev);
            return;
        }

        // A lone guard frame still carries the first repeat tag
        if self.config.guard_beacon && self.tx.is_broadcast && self.tx.orig_len <= 1 {
            if !self.stage_guard_frame(GUARD_BEACON_TAGS[0]) {
                self.tx.status = MacTxStatus::ErrFatal;
                self.tx_slot_finish(ev);
                return;
            }
        }

        let sent = self.radio.transmit(self.tx.frame_len).is_ok();

        self.tx.tx_start_time = self.current_slot_start.wrapping_add(self.timing.tx_offset);
        self.tx.tx_duration = self.duration(self.tx.frame_len).min(self.timing.max_tx);
        // Off now; powered up again for the ACK if one is expected
        self.radio_off(RadioOff::WithinTimeslot);

        if !sent {
            self.tx.status = MacTxStatus::Err;
            self.tx_slot_finish(ev);
            return;
        }
        if self.tx.is_broadcast {
            self.tx.status = MacTxStatus::Ok;
            self.tx_slot_finish(ev);
            return;
        }

        if self.config.hw_frame_filtering {
            // The E-ACK carries no destination address; go promiscuous
            self.radio.set_frame_filtering(false);
        }

        let offset = self
            .timing
            .tx_offset
            .wrapping_add(self.tx.tx_duration)
            .wrapping_add(self.timing.rx_ack_delay)
            .wrapping_sub(R::DELAY_BEFORE_RX);
        if self.yield_until(self.current_slot_start, offset, SlotState::TxAckListen) {
            return;
        }
        self.tx_ack_listen(ev);
    }

    /// Guard-beacon burst: the coordinator repeats the tagged marker frame
    /// at -T, 0 and +T around the nominal TX offset
    fn tx_transmit_guard(&mut self, ev: &mut SlotEvents) {
        let stage = self.tx.gb_stage;
        let tag = GUARD_BEACON_TAGS[stage.min(GUARD_BEACON_TAGS.len() - 1)];

        let sent = self.stage_guard_frame(tag) && self.radio.transmit(self.tx.frame_len).is_ok();
        self.tx.status = if sent { MacTxStatus::Ok } else { MacTxStatus::Err };
        self.tx.gb_stage += 1;

        let t = self.timing;
        let slot_start = self.current_slot_start;
        let guard_time = self.us_to_ticks(self.config.guard_beacon_time_us);
        let nominal = t.tx_offset.wrapping_sub(R::DELAY_BEFORE_TX);

        match stage {
            0 => {
                if self.yield_until(slot_start, nominal, SlotState::TxTransmit) {
                    return;
                }
                self.tx_transmit(ev);
            }
            1 => {
                if self.yield_until(
                    slot_start,
                    nominal.wrapping_add(guard_time),
                    SlotState::TxTransmit,
                ) {
                    return;
                }
                self.tx_transmit(ev);
            }
            _ => {
                self.tx.tx_start_time =
                    self.current_slot_start.wrapping_add(self.timing.tx_offset);
                self.tx.tx_duration = self.duration(self.tx.frame_len).min(t.max_tx);
                self.radio_off(RadioOff::WithinTimeslot);
                // Guard bursts are broadcast: nothing to wait for
                self.tx_slot_finish(ev);
            }
        }
    }

    /// Copy the queued guard frame into scratch with the repeat tag
    /// appended, and stage it into the radio
    fn stage_guard_frame(&mut self, tag: u8) -> bool {
        let packet_id = match self.current_packet {
            Some(p) => p,
            None => return false,
        };

        let SlotEngine {
            radio, queue, tx, ..
        } = self;

        let packet = match queue.packet(packet_id) {
            Some(p) => p,
            None => return false,
        };
        let len = packet.len();
        if len + 1 > tx.scratch.len() {
            return false;
        }

        tx.scratch[..len].copy_from_slice(packet.frame());
        tx.scratch[len] = tag;
        tx.frame_len = len + 1;
        tx.use_scratch = true;

        radio.prepare(&tx.scratch[..tx.frame_len]).is_ok()
    }

    /// Await, read and validate the enhanced ACK; extract the drift
    /// correction when it came from our time source
    pub(super) fn tx_ack_listen(&mut self, ev: &mut SlotEvents) {
        let t = self.timing;

        self.radio_on(RadioOn::WithinTimeslot);

        // Wait for the ACK to start, referenced to the actual TX time
        let detect_offset = self
            .tx
            .tx_duration
            .wrapping_add(t.rx_ack_delay)
            .wrapping_add(t.ack_wait)
            .wrapping_add(R::DELAY_BEFORE_DETECT);
        let tx_start = self.tx.tx_start_time;
        self.busy_wait_radio(tx_start, detect_offset, |r| r.receiving_packet());

        let ack_start = self.clock.now().wrapping_sub(R::DELAY_BEFORE_DETECT);

        // Wait for the ACK to end
        self.busy_wait_radio(ack_start, t.max_ack, |r| !r.receiving_packet());
        self.radio_off(RadioOff::WithinTimeslot);

        if self.config.hw_frame_filtering {
            self.radio.set_frame_filtering(true);
        }

        let mut ack_buf = [0u8; PACKET_MAX_LEN];
        let ack_len = self.radio.read(&mut ack_buf);

        let mut accepted = None;
        if ack_len > 0 {
            match self.codec.parse_eack(&ack_buf[..ack_len], self.tx.seqno) {
                Some((frame, ies)) => {
                    let mut authentic = true;
                    if self.config.security_enabled {
                        let mic = self.codec.mic_len(&frame);
                        let data_len = ack_len.saturating_sub(frame.header_len + mic);
                        let source = self
                            .current_neighbor
                            .and_then(|n| self.queue.neighbor(n))
                            .map(|n| n.addr)
                            .unwrap_or(Address::None);
                        if !self.codec.verify_frame(
                            &ack_buf[..ack_len],
                            frame.header_len,
                            data_len,
                            &frame,
                            &source,
                            &self.asn,
                        ) {
                            self.log_slot_message("!failed to authenticate ACK", 0, 0);
                            authentic = false;
                        }
                    }
                    if authentic {
                        accepted = Some(ies);
                    }
                }
                None => {
                    self.log_slot_message("!failed to parse ACK", ack_len as i32, 0);
                }
            }
        }

        match accepted {
            Some(ies) => {
                let is_time_source = self
                    .current_neighbor
                    .and_then(|n| self.queue.neighbor(n))
                    .map(|n| n.is_time_source)
                    .unwrap_or(false);
                if is_time_source {
                    self.apply_ack_correction(ies.time_correction_us);
                }
                self.tx.status = MacTxStatus::Ok;
            }
            None => self.tx.status = MacTxStatus::NoAck,
        }

        self.tx_slot_finish(ev);
    }

    /// Clamp and apply the time correction carried by a time-source ACK
    fn apply_ack_correction(&mut self, correction_us: i16) {
        let correction = self.us_to_ticks_i(correction_us as i32);
        let since_last = self.asn.diff(&self.last_sync_asn);
        let bound = self.timing.sync_ie_bound();
        let clamped = correction.clamp(-bound, bound);

        self.drift_correction = if self.config.drift_from_ack_enabled {
            clamped
        } else {
            // Beacon-only timesync: the IE is processed but the clock is
            // not steered from ACKs
            0
        };
        if self.drift_correction != correction {
            self.log_slot_message("!truncated dr", correction, self.drift_correction);
        }
        self.drift_correction_used = true;

        if let Some(neighbor) = self.current_neighbor {
            self.timesync.update(neighbor, since_last, self.drift_correction);
        }
        self.last_sync_asn = self.asn;
        self.timesync.schedule_keepalive();
    }

    /// Common TX tail: retry accounting, queue/backoff update, dequeued
    /// publication and the per-attempt log record
    fn tx_slot_finish(&mut self, ev: &mut SlotEvents) {
        self.radio_off(RadioOff::EndOfTimeslot);

        let status = self.tx.status;
        let (packet_id, neighbor_id) = match (self.current_packet, self.current_neighbor) {
            (Some(p), Some(n)) => (p, n),
            _ => {
                self.log_tx_record(status, ev);
                self.slot_end(ev);
                return;
            }
        };

        if let Some(p) = self.queue.packet_mut(packet_id) {
            p.transmissions += 1;
            p.ret = Some(status);
        }

        let in_queue = self.update_neighbor_state(neighbor_id, packet_id, status);
        if !in_queue {
            self.dequeued_array[self.tx.dequeued_index] = Some(packet_id);
            self.dequeued_ring.put();
        }

        self.log_tx_record(status, ev);
        self.slot_end(ev);
    }

    /// Post-TX queue and CSMA state update; returns whether the packet is
    /// still queued
    fn update_neighbor_state(
        &mut self,
        neighbor: NeighborId,
        packet: PacketId,
        status: MacTxStatus,
    ) -> bool {
        let is_shared_link = self
            .current_link
            .map(|l| l.options.shared())
            .unwrap_or(false);
        let is_unicast = !self
            .queue
            .neighbor(neighbor)
            .map(|n| n.is_broadcast)
            .unwrap_or(true);

        if status == MacTxStatus::Ok {
            self.queue.remove_first(neighbor);
            if is_unicast && (is_shared_link || self.queue.is_empty(neighbor)) {
                // Shared cells reset backoff on success; dedicated ones
                // only once the queue drains
                self.queue.backoff_reset(neighbor);
            }
            return false;
        }

        let attempts = self
            .queue
            .packet(packet)
            .map(|p| p.transmissions)
            .unwrap_or(0);
        let mut in_queue = true;
        if attempts >= self.config.max_frame_retries.saturating_add(1) {
            self.queue.remove_first(neighbor);
            in_queue = false;
        }

        // Dedicated-cell failures leave window and exponent untouched
        if is_unicast && is_shared_link {
            self.queue.backoff_inc(neighbor);
        }

        in_queue
    }

    fn log_tx_record(&mut self, status: MacTxStatus, ev: &mut SlotEvents) {
        let (attempts, datalen, dest, is_data) = self
            .current_packet
            .and_then(|p| self.queue.packet(p))
            .map(|p| {
                let is_data = p.frame().first().map(|b| (b & 7) == 1).unwrap_or(false);
                (p.transmissions, p.len(), p.dest, is_data)
            })
            .unwrap_or((0, 0, Address::None, false));

        self.slot_log.add(SlotLogEntry {
            asn: self.asn,
            channel: self.current_channel,
            kind: SlotLogKind::Tx(TxLog {
                status,
                attempts,
                datalen,
                drift_us: self.ticks_to_us(self.drift_correction),
                drift_used: self.drift_correction_used,
                is_data,
                security_level: self.tx.security_level,
                dest,
            }),
        });
        ev.poll_foreground = true;
    }
}
