//! Receive slot execution: the guard-time listen window, frame capture and
//! validation, enhanced-ACK response, drift estimation from the frame
//! arrival time and resynchronization on beacons from the time source.

use ieee802154::mac::Address;

use rand_core::RngCore;

use crate::frames::{FrameCodec, FrameKind, SecurityCodec};
use crate::logging::{RxLog, SlotLogEntry, SlotLogKind};
use crate::queue::{broadcast_address, NeighborId};
use crate::schedule::Schedule;
use crate::timesync::TimeSync;
use crate::{SlotClock, SlotRadio, TickDelta, PACKET_MAX_LEN};

use super::{RadioOff, RadioOn, RxContext, SlotEngine, SlotEvents, SlotState, GUARD_BEACON_MARKER};

impl<R, C, S, F, H, G> SlotEngine<R, C, S, F, H, G>
where
    R: SlotRadio,
    C: SlotClock,
    S: Schedule,
    F: FrameCodec + SecurityCodec,
    H: TimeSync,
    G: RngCore,
{
    /// Enter a receive slot: reserve an input ring entry, flush stale
    /// frames and yield until just before the listen window
    pub(super) fn rx_slot(&mut self, ev: &mut SlotEvents) {
        self.rx = RxContext::clear();

        let input_index = match self.input_ring.peek_put() {
            Some(index) => index,
            None => {
                // Nowhere to land a frame: count the drop, sit the slot out
                self.input_queue_drop += 1;
                self.radio_off(RadioOff::EndOfTimeslot);
                self.slot_end(ev);
                return;
            }
        };
        self.rx.input_index = input_index;

        self.rx.expected_rx_time = self.current_slot_start.wrapping_add(self.timing.tx_offset);
        self.rx.rx_start_time = self.rx.expected_rx_time;

        // Flush anything stale left in the radio receive buffer
        let mut scratch = [0u8; PACKET_MAX_LEN];
        while self.radio.pending_packet() {
            let _ = self.radio.read(&mut scratch);
        }

        let offset = self.timing.rx_offset.wrapping_sub(R::DELAY_BEFORE_RX);
        if self.yield_until(self.current_slot_start, offset, SlotState::RxListen) {
            return;
        }
        self.rx_listen(ev);
    }

    /// Listen over the guard window; on frame detection wait out the
    /// reception and process the captured frame
    pub(super) fn rx_listen(&mut self, ev: &mut SlotEvents) {
        let t = self.timing;
        let slot_start = self.current_slot_start;

        self.radio_on(RadioOn::WithinTimeslot);

        let mut packet_seen = self.radio.receiving_packet() || self.radio.pending_packet();
        if !packet_seen {
            let detect_offset = t
                .rx_offset
                .wrapping_add(t.rx_wait)
                .wrapping_add(R::DELAY_BEFORE_DETECT);
            self.busy_wait_radio(slot_start, detect_offset, |r| r.receiving_packet());
            packet_seen = self.radio.receiving_packet() || self.radio.pending_packet();
        }

        if !packet_seen {
            // Nothing on the air this slot
            self.radio_off(RadioOff::Force);
            self.rx_slot_finish(ev);
            return;
        }

        self.rx.rx_start_time = self.clock.now().wrapping_sub(R::DELAY_BEFORE_DETECT);

        // Wait until the frame has fully arrived
        let end_offset = t
            .rx_offset
            .wrapping_add(t.rx_wait)
            .wrapping_add(t.max_tx);
        self.busy_wait_radio(slot_start, end_offset, |r| !r.receiving_packet());
        self.radio_off(RadioOff::WithinTimeslot);

        if !self.radio.pending_packet() {
            self.radio_off(RadioOff::EndOfTimeslot);
            self.rx_slot_finish(ev);
            return;
        }

        self.rx_process(ev);
    }

    /// Read, validate and react to a captured frame
    fn rx_process(&mut self, ev: &mut SlotEvents) {
        let asn = self.asn;
        let index = self.rx.input_index;

        {
            let SlotEngine {
                radio, input_array, ..
            } = self;
            let input = &mut input_array[index];
            input.len = radio.read(&mut input.payload);
            input.rssi = radio.last_rssi();
            input.rx_asn = asn;
        }
        self.input_array[index].channel = self.current_channel;

        if self.input_array[index].len == 0 {
            self.radio_off(RadioOff::EndOfTimeslot);
            self.rx_slot_finish(ev);
            return;
        }

        // Guard-beacon detection: record and strip the repeat tag, leaving
        // the marker frame itself in the input entry
        if self.config.guard_beacon {
            let len = self.input_array[index].len;
            if len >= 2 && self.input_array[index].payload[len - 2] == GUARD_BEACON_MARKER {
                self.rx.is_gb = true;
                self.rx.gb_tag = self.input_array[index].payload[len - 1];
                self.input_array[index].len = len - 1;
            }
        }

        if !self.rx.is_gb {
            let SlotEngine {
                codec,
                input_array,
                rx,
                ..
            } = self;
            rx.frame = codec.parse(input_array[index].frame());
        }
        self.rx.is_eb = self.rx.frame.map(|f| f.is_eb()).unwrap_or(false);

        if self.config.resync_with_sfd_timestamps {
            // The radio's SFD capture beats detection-loop timing
            self.rx.rx_start_time = self.radio.last_packet_timestamp();
        }
        self.rx.packet_duration = self.duration(self.input_array[index].len);

        let mut frame_valid = self.rx.frame.is_some();
        if self.config.security_enabled {
            if let Some(frame) = self.rx.frame {
                let mic = self.codec.mic_len(&frame);
                let len = self.input_array[index].len;
                let data_len = len.saturating_sub(frame.header_len + mic);
                let authentic = {
                    let SlotEngine {
                        codec, input_array, ..
                    } = self;
                    codec.verify_frame(
                        input_array[index].frame(),
                        frame.header_len,
                        data_len,
                        &frame,
                        &frame.src,
                        &asn,
                    )
                };
                if authentic {
                    self.input_array[index].len = len.saturating_sub(mic);
                } else {
                    self.log_slot_message("!failed to authenticate frame", len as i32, 0);
                    frame_valid = false;
                }
            } else if !self.rx.is_gb {
                self.log_slot_message(
                    "!failed to parse frame",
                    self.input_array[index].len as i32,
                    0,
                );
            }
        }

        if !frame_valid && !self.rx.is_gb {
            self.radio_off(RadioOff::EndOfTimeslot);
            self.rx_slot_finish(ev);
            return;
        }

        // Accept frames addressed to us, to broadcast, or carrying no
        // destination (beacons). Guard beacons are broadcast by nature.
        let for_us = if self.rx.is_gb {
            true
        } else {
            self.rx
                .frame
                .map(|f| {
                    f.dst == self.address
                        || f.dst == Address::None
                        || f.dst == broadcast_address()
                })
                .unwrap_or(false)
        };
        if !for_us {
            // Not ours to publish, but there are log records to drain
            ev.poll_foreground = true;
            self.radio_off(RadioOff::EndOfTimeslot);
            self.rx_slot_finish(ev);
            return;
        }

        // Drift of the sender against our slot grid
        let mut drift = self
            .rx
            .expected_rx_time
            .wrapping_sub(self.rx.rx_start_time) as TickDelta;
        if self.config.timesync_remove_jitter {
            let error = self.us_to_ticks(self.config.timesync_measurement_error_us) as TickDelta;
            drift = if drift.abs() <= error {
                0
            } else if drift > 0 {
                drift - error
            } else {
                drift + error
            };
        }
        self.rx.estimated_drift = drift;

        if let Some(frame) = self.rx.frame {
            if !self.rx.is_gb && frame.ack_required {
                let do_nack = match self.current_link {
                    Some(link) => self.schedule.do_nack(&link, &frame.src, &frame.dst),
                    None => false,
                };

                let correction_us = self
                    .ticks_to_us(self.rx.estimated_drift)
                    .clamp(i16::MIN as i32, i16::MAX as i32) as i16;

                let ack_len = {
                    let SlotEngine { codec, rx, .. } = self;
                    codec.create_eack(&mut rx.ack_buf, &frame.src, frame.seq, correction_us, do_nack)
                };

                if ack_len > 0 {
                    let mut ack_len = ack_len;
                    if self.config.security_enabled {
                        // ACKs are header and IEs only: zero-length payload
                        let SlotEngine { codec, rx, .. } = self;
                        ack_len += codec.secure_frame(&mut rx.ack_buf, ack_len, ack_len, &asn);
                    }
                    self.rx.ack_len = ack_len;

                    let prepared = {
                        let SlotEngine { radio, rx, .. } = self;
                        radio.prepare(&rx.ack_buf[..ack_len]).is_ok()
                    };
                    if prepared {
                        let offset = self
                            .rx
                            .packet_duration
                            .wrapping_add(self.timing.tx_ack_delay)
                            .wrapping_sub(R::DELAY_BEFORE_TX);
                        let rx_start = self.rx.rx_start_time;
                        if self.yield_until(rx_start, offset, SlotState::RxAckTransmit) {
                            return;
                        }
                        self.rx_ack_transmit(ev);
                        return;
                    }
                }
            }
        }

        self.rx_conclude(ev);
    }

    /// Send the prepared enhanced ACK at the ACK turnaround time
    pub(super) fn rx_ack_transmit(&mut self, ev: &mut SlotEvents) {
        let _ = self.radio.transmit(self.rx.ack_len);
        self.radio_off(RadioOff::WithinTimeslot);
        self.rx_conclude(ev);
    }

    /// Post-ACK tail: resynchronize on time-source beacons, publish the
    /// input entry and record the reception
    fn rx_conclude(&mut self, ev: &mut SlotEvents) {
        if self.config.guard_beacon {
            self.rx_guard_beacon_sync();
        } else if self.rx.is_eb {
            if let Some(frame) = self.rx.frame {
                if let Some(neighbor) = self.queue.get_nbr(&frame.src) {
                    let is_time_source = self
                        .queue
                        .neighbor(neighbor)
                        .map(|n| n.is_time_source)
                        .unwrap_or(false);
                    if is_time_source {
                        self.apply_rx_sync(neighbor);
                    }
                }
            }
        }

        self.input_ring.put();

        let datalen = self.input_array[self.rx.input_index].len;
        let (src, is_unicast, is_data, security_level) = match self.rx.frame {
            Some(f) => (f.src, f.ack_required, f.kind == FrameKind::Data, f.security_level),
            None => (Address::None, false, false, 0),
        };
        self.slot_log.add(SlotLogEntry {
            asn: self.asn,
            channel: self.current_channel,
            kind: SlotLogKind::Rx(RxLog {
                src,
                is_unicast,
                datalen,
                drift_us: self.ticks_to_us(self.drift_correction),
                drift_used: self.drift_correction_used,
                is_data,
                security_level,
                estimated_drift_us: self.ticks_to_us(self.rx.estimated_drift),
            }),
        });
        ev.poll_foreground = true;

        self.radio_off(RadioOff::EndOfTimeslot);
        self.rx_slot_finish(ev);
    }

    /// Guard-beacon resynchronization: de-skew the drift estimate by the
    /// repeat tag, then steer the clock if the last sync has aged out
    fn rx_guard_beacon_sync(&mut self) {
        if !self.rx.is_gb {
            return;
        }

        if !self.config.coordinator {
            let shift = self.us_to_ticks(self.config.guard_beacon_time_us) as TickDelta;
            match self.rx.gb_tag {
                0x11 => self.rx.estimated_drift -= shift,
                0x22 => (),
                0x33 => self.rx.estimated_drift += shift,
                _ => (),
            }
        }

        // Guard beacons only steer the clock from the adopted time source
        if let Some(neighbor) = self.last_timesource {
            if self.asn.diff(&self.last_sync_asn) > self.config.guard_beacon_min_sync_age {
                self.apply_rx_sync(neighbor);
            }
        }
    }

    /// Adopt the measured arrival offset as the next slot's drift
    /// correction and feed the adaptive filter
    fn apply_rx_sync(&mut self, neighbor: NeighborId) {
        let since_last = self.asn.diff(&self.last_sync_asn);
        self.last_sync_asn = self.asn;

        self.drift_correction = -self.rx.estimated_drift;
        self.drift_correction_used = true;

        self.timesync.update(neighbor, since_last, -self.rx.estimated_drift);
        self.timesync.schedule_keepalive();
    }

    /// Common RX tail: report deferred input drops, then schedule the
    /// next slot
    fn rx_slot_finish(&mut self, ev: &mut SlotEvents) {
        if self.input_queue_drop != 0 {
            self.log_slot_message("!queue full skipped", self.input_queue_drop as i32, 0);
            ev.poll_foreground = true;
            self.input_queue_drop = 0;
        }
        self.slot_end(ev);
    }
}
