use std::vec::Vec;

use rand::rngs::mock::StepRng;

use crate::config::{Config, SlotTiming};
use crate::hopping::HoppingSequence;
use crate::logging::SlotLogKind;
use crate::mock::*;
use crate::queue::broadcast_address;
use crate::schedule::{Link, LinkOptions, LinkType};
use crate::time::mock::MockClock;

use super::*;

// 1 MHz test rtimer: ticks are microseconds, guard is 10 ticks
const RTS: u32 = 1_000_000;

const SLOT_LEN: Ticks = 10_000;
const TX_OFFSET: Ticks = 2120;

const START: Ticks = 50_000;

type Engine = SlotEngine<MockRadio, MockClock, FixedSchedule, TestCodec, RecordingTimesync, StepRng>;

fn init_log() {
    let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
}

fn test_config() -> Config {
    Config {
        rtimer_second: RTS,
        hopping: HoppingSequence(&[26, 25, 20, 15]),
        ..Default::default()
    }
}

fn tx_link(addr: Address) -> Link {
    Link {
        options: LinkOptions::TX,
        link_type: LinkType::Normal,
        addr,
        channel_offset: 0,
    }
}

fn shared_tx_link(addr: Address) -> Link {
    Link {
        options: LinkOptions::TX | LinkOptions::SHARED,
        link_type: LinkType::Normal,
        addr,
        channel_offset: 0,
    }
}

fn rx_link() -> Link {
    Link {
        options: LinkOptions::RX,
        link_type: LinkType::Normal,
        addr: broadcast_address(),
        channel_offset: 0,
    }
}

/// Engine synced so that the first executed slot starts at `START +
/// SLOT_LEN` with the given ASN
fn engine(config: Config, schedule: FixedSchedule, first_asn: u64) -> (Engine, MockClock) {
    init_log();

    let clock = MockClock::new(1);
    let radio = MockRadio::new(clock.clone());

    let mut e = SlotEngine::new(
        short_addr(1),
        config,
        SlotTiming::template_10ms(RTS),
        radio,
        clock.clone(),
        schedule,
        TestCodec,
        RecordingTimesync::default(),
        StepRng::new(0x1234_5678, 0x9e37_79b9),
    );

    e.sync(START, Asn::new(first_asn - 1));
    clock.set(START);
    e.start();

    (e, clock)
}

/// Fire the armed timer until the engine is back between slots
fn run_slot(e: &mut Engine, clock: &MockClock) -> SlotEvents {
    let mut ev = SlotEvents::default();

    for _ in 0..16 {
        let at = clock.take_armed().expect("timer should be armed");
        clock.set(at);

        let step = e.slot_operation();
        ev.poll_foreground |= step.poll_foreground;
        ev.disassociated |= step.disassociated;

        if e.state == SlotState::Idle {
            return ev;
        }
    }
    panic!("slot did not complete");
}

fn log_messages(e: &mut Engine) -> Vec<&'static str> {
    let mut texts = Vec::new();
    while let Some(entry) = e.slot_log.pop() {
        if let SlotLogKind::Message(m) = entry.kind {
            texts.push(m.text);
        }
    }
    texts
}

#[test]
fn unicast_tx_with_eack_and_drift() {
    let peer = short_addr(2);
    let (mut e, clock) = engine(test_config(), FixedSchedule::every_slot(tx_link(peer)), 8);

    let neighbor = e.update_time_source(&peer).unwrap();

    assert!(e.get_lock());
    let frame = data_frame(1, 2, 42, true, &[0xaa, 0xbb, 0xcc]);
    e.queue_mut()
        .add_packet(peer, &frame, TEST_HEADER_LEN, None, 0)
        .unwrap();
    e.release_lock();

    // E-ACK carrying +120 us, starting shortly into the ACK window
    let slot_start = START + SLOT_LEN;
    let tx_duration = 32 * (frame.len() as u32 + 1);
    let ack_window = slot_start + TX_OFFSET + tx_duration + 800;
    e.radio
        .schedule_incoming(ack_window + 28, ack_window + 88, eack_frame(42, 120, false));

    let ev = run_slot(&mut e, &clock);
    assert!(ev.poll_foreground);
    assert!(!ev.disassociated);

    // ASN 8 with a 4-channel sequence hops to channel 26
    assert_eq!(e.radio.channel, 26);

    // One transmission of the untouched frame, fired at the TX offset
    assert_eq!(e.radio.transmits.len(), 1);
    let record = &e.radio.transmits[0];
    assert_eq!(record.frame, frame);
    assert_eq!(e.tx.tx_start_time, slot_start + TX_OFFSET);
    assert!(record.at >= slot_start + TX_OFFSET && record.at < slot_start + TX_OFFSET + 8);

    // Success: removed from the queue, published exactly once
    let nbr = e.queue().get_nbr(&peer).unwrap();
    assert!(e.queue().is_empty(nbr));
    let mut statuses = Vec::new();
    let drained = e.process_pending_dequeued(|p| statuses.push((p.ret, p.transmissions)));
    assert_eq!(drained, 1);
    assert_eq!(statuses, [(Some(MacTxStatus::Ok), 1)]);

    // Time-source exchange: drift stored and applied to the next slot
    assert_eq!(e.last_sync_asn, Asn::new(8));
    assert_eq!(e.timesync.updates, [(neighbor, 1, 120)]);
    assert_eq!(e.timesync.keepalives, 1);
    assert_eq!(clock.take_armed(), Some(slot_start + SLOT_LEN + 120));
}

#[test]
fn shared_link_collision_backs_off() {
    let peer = short_addr(2);
    let mut config = test_config();
    config.cca_enabled = true;

    let (mut e, clock) = engine(config, FixedSchedule::every_slot(shared_tx_link(peer)), 4);
    e.radio.channel_clear = false;

    e.queue_mut()
        .add_packet(peer, &data_frame(1, 2, 7, true, &[0]), TEST_HEADER_LEN, None, 0)
        .unwrap();

    run_slot(&mut e, &clock);

    // Busy channel throughout CCA: no transmission at all
    assert!(e.radio.transmits.is_empty());

    // Packet stays queued with one attempt recorded as a collision
    let nbr = e.queue().get_nbr(&peer).unwrap();
    assert!(!e.queue().is_empty(nbr));
    assert_eq!(e.process_pending_dequeued(|_| ()), 0);

    let p = e.queue().get_packet_for_nbr(nbr, None).unwrap();
    assert_eq!(e.queue().packet(p).unwrap().ret, Some(MacTxStatus::Collision));
    assert_eq!(e.queue().packet(p).unwrap().transmissions, 1);

    // Backoff exponent grew and a fresh window was drawn within the
    // contention range
    let n = e.queue().neighbor(nbr).unwrap();
    assert_eq!(n.backoff_exponent(), 2);
    assert!((n.backoff_window() as u32) < (1 << 2));
}

#[test]
fn rx_slot_idle_powers_down() {
    let (mut e, clock) = engine(test_config(), FixedSchedule::every_slot(rx_link()), 4);

    run_slot(&mut e, &clock);

    assert!(e.radio.transmits.is_empty());
    assert_eq!(e.process_pending_input(|_| ()), 0);
    assert!(!e.radio.is_on);
    assert_eq!(e.radio.on_count, 1);
    assert_eq!(e.input_queue_drop, 0);
}

#[test]
fn rx_eb_from_time_source_resyncs() {
    let source = short_addr(5);
    let (mut e, clock) = engine(test_config(), FixedSchedule::every_slot(rx_link()), 4);

    let neighbor = e.update_time_source(&source).unwrap();

    // Beacon arriving 45 ticks late
    let slot_start = START + SLOT_LEN;
    let frame = beacon_frame(5, 3, &[0; 5]);
    let duration = 32 * (frame.len() as u32 + 1);
    let sfd = slot_start + TX_OFFSET + 45;
    e.radio.schedule_incoming(sfd, sfd + duration, frame.clone());

    let ev = run_slot(&mut e, &clock);
    assert!(ev.poll_foreground);

    // Frame published with reception metadata
    let mut received = Vec::new();
    e.process_pending_input(|p| received.push((p.frame().to_vec(), p.rx_asn, p.channel)));
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, frame);
    assert_eq!(received[0].1, Asn::new(4));
    assert_eq!(received[0].2, 26);

    // estimated_drift = -45, so the next slot moves 45 ticks earlier
    assert_eq!(e.timesync.updates, [(neighbor, 1, 45)]);
    assert_eq!(e.timesync.keepalives, 1);
    assert_eq!(e.last_sync_asn, Asn::new(4));
    assert_eq!(clock.take_armed(), Some(slot_start + SLOT_LEN + 45));
}

#[test]
fn rx_unicast_sends_eack_with_correction() {
    let (mut e, clock) = engine(test_config(), FixedSchedule::every_slot(rx_link()), 4);

    // Data frame to us, 45 ticks late, requesting an ACK
    let slot_start = START + SLOT_LEN;
    let frame = data_frame(7, 1, 3, true, &[1]);
    let duration = 32 * (frame.len() as u32 + 1);
    let sfd = slot_start + TX_OFFSET + 45;
    e.radio.schedule_incoming(sfd, sfd + duration, frame);

    run_slot(&mut e, &clock);

    assert_eq!(e.process_pending_input(|_| ()), 1);

    // The enhanced ACK echoes the sequence number and reports our
    // measured drift (-45 us at 1 MHz) back to the sender
    assert_eq!(e.radio.transmits.len(), 1);
    let ack = &e.radio.transmits[0];
    let expected_at = sfd + duration + 1000;
    assert!(ack.at >= expected_at && ack.at < expected_at + 8);
    assert_eq!(ack.frame, eack_frame(3, -45, false));

    // Not a time source: the local clock is not steered
    assert!(e.timesync.updates.is_empty());
    assert_eq!(clock.take_armed(), Some(slot_start + SLOT_LEN));
}

#[test]
fn broadcast_tx_skips_ack_wait() {
    let (mut e, clock) = engine(
        test_config(),
        FixedSchedule::every_slot(tx_link(broadcast_address())),
        4,
    );

    let frame = data_frame(1, 0xffff, 9, false, &[5, 6]);
    e.queue_mut()
        .add_packet(broadcast_address(), &frame, TEST_HEADER_LEN, None, 0)
        .unwrap();

    run_slot(&mut e, &clock);

    assert_eq!(e.radio.transmits.len(), 1);
    assert_eq!(e.radio.transmits[0].frame, frame);

    let mut statuses = Vec::new();
    assert_eq!(e.process_pending_dequeued(|p| statuses.push(p.ret)), 1);
    assert_eq!(statuses, [Some(MacTxStatus::Ok)]);

    // No ACK wait: next slot scheduled with no drift
    assert!(e.timesync.updates.is_empty());
    assert_eq!(clock.take_armed(), Some(START + 2 * SLOT_LEN));
}

#[test]
fn unacked_unicast_drops_after_max_retries() {
    let peer = short_addr(2);
    let mut config = test_config();
    config.max_frame_retries = 1;

    let (mut e, clock) = engine(config, FixedSchedule::every_slot(tx_link(peer)), 4);
    e.queue_mut()
        .add_packet(peer, &data_frame(1, 2, 11, true, &[0]), TEST_HEADER_LEN, None, 0)
        .unwrap();

    // First attempt: no ACK arrives, packet stays queued
    run_slot(&mut e, &clock);
    let nbr = e.queue().get_nbr(&peer).unwrap();
    assert!(!e.queue().is_empty(nbr));
    assert_eq!(e.process_pending_dequeued(|_| ()), 0);

    // Second attempt exhausts the retry allowance: dropped and published
    run_slot(&mut e, &clock);
    assert!(e.queue().is_empty(nbr));

    let mut dropped = Vec::new();
    assert_eq!(
        e.process_pending_dequeued(|p| dropped.push((p.ret, p.transmissions))),
        1
    );
    assert_eq!(dropped, [(Some(MacTxStatus::NoAck), 2)]);
}

#[test]
fn eack_correction_is_clamped_to_sync_bound() {
    let peer = short_addr(2);
    let (mut e, clock) = engine(test_config(), FixedSchedule::every_slot(tx_link(peer)), 4);

    let neighbor = e.update_time_source(&peer).unwrap();
    let frame = data_frame(1, 2, 21, true, &[]);
    e.queue_mut()
        .add_packet(peer, &frame, TEST_HEADER_LEN, None, 0)
        .unwrap();

    // 2000 us exceeds SYNC_IE_BOUND = rx_wait / 4 = 550 ticks
    let slot_start = START + SLOT_LEN;
    let tx_duration = 32 * (frame.len() as u32 + 1);
    let ack_window = slot_start + TX_OFFSET + tx_duration + 800;
    e.radio
        .schedule_incoming(ack_window + 30, ack_window + 90, eack_frame(21, 2000, false));

    run_slot(&mut e, &clock);

    assert_eq!(e.timesync.updates, [(neighbor, 1, 550)]);
    assert!(log_messages(&mut e).contains(&"!truncated dr"));
    assert_eq!(clock.take_armed(), Some(slot_start + SLOT_LEN + 550));
}

#[test]
fn ack_drift_ignored_when_beacon_only_timesync() {
    let peer = short_addr(2);
    let mut config = test_config();
    config.drift_from_ack_enabled = false;

    let (mut e, clock) = engine(config, FixedSchedule::every_slot(tx_link(peer)), 4);

    let neighbor = e.update_time_source(&peer).unwrap();
    let frame = data_frame(1, 2, 21, true, &[]);
    e.queue_mut()
        .add_packet(peer, &frame, TEST_HEADER_LEN, None, 0)
        .unwrap();

    let slot_start = START + SLOT_LEN;
    let tx_duration = 32 * (frame.len() as u32 + 1);
    let ack_window = slot_start + TX_OFFSET + tx_duration + 800;
    e.radio
        .schedule_incoming(ack_window + 30, ack_window + 90, eack_frame(21, 120, false));

    run_slot(&mut e, &clock);

    // The IE is processed (sync time advances, keepalive armed) but the
    // clock is not steered from the ACK
    assert_eq!(e.timesync.updates, [(neighbor, 1, 0)]);
    assert_eq!(e.last_sync_asn, Asn::new(4));
    assert_eq!(clock.take_armed(), Some(slot_start + SLOT_LEN));
}

#[test]
fn lock_request_skips_slots_until_released() {
    let peer = short_addr(2);
    let (mut e, clock) = engine(test_config(), FixedSchedule::every_slot(tx_link(peer)), 4);

    e.queue_mut()
        .add_packet(peer, &data_frame(1, 2, 1, false, &[]), TEST_HEADER_LEN, None, 0)
        .unwrap();

    assert!(e.get_lock());
    let ev = run_slot(&mut e, &clock);
    assert!(ev.poll_foreground);

    // Slot skipped while the foreground holds the lock
    assert!(e.radio.transmits.is_empty());
    assert!(log_messages(&mut e).contains(&"!skipped slot"));

    e.release_lock();
    run_slot(&mut e, &clock);
    assert_eq!(e.radio.transmits.len(), 1);
}

#[test]
fn rx_ring_overflow_drops_and_recovers() {
    let (mut e, clock) = engine(test_config(), FixedSchedule::every_slot(rx_link()), 4);

    // Fill every input entry without draining
    for n in 0..MAX_INCOMING_PACKETS as u32 {
        let slot_start = START + (n + 1) * SLOT_LEN;
        let sfd = slot_start + TX_OFFSET + 10;
        e.radio
            .schedule_incoming(sfd, sfd + 352, data_frame(7, 1, n as u8, false, &[0, 1, 2]));
        run_slot(&mut e, &clock);
    }

    // Ring full: the next frame is dropped before any air activity
    let slot_start = START + (MAX_INCOMING_PACKETS as u32 + 1) * SLOT_LEN;
    let sfd = slot_start + TX_OFFSET + 10;
    e.radio
        .schedule_incoming(sfd, sfd + 352, data_frame(7, 1, 99, false, &[0, 1, 2]));
    run_slot(&mut e, &clock);
    assert_eq!(e.input_queue_drop, 1);

    // Drain, then the next reception publishes again and reports the
    // earlier drop
    assert_eq!(e.process_pending_input(|_| ()), MAX_INCOMING_PACKETS);

    let slot_start = START + (MAX_INCOMING_PACKETS as u32 + 2) * SLOT_LEN;
    let sfd = slot_start + TX_OFFSET + 10;
    e.radio
        .schedule_incoming(sfd, sfd + 352, data_frame(7, 1, 100, false, &[0, 1, 2]));
    run_slot(&mut e, &clock);

    assert_eq!(e.process_pending_input(|_| ()), 1);
    assert_eq!(e.input_queue_drop, 0);
    assert!(log_messages(&mut e).contains(&"!queue full skipped"));
}

#[test]
fn missed_deadline_catches_up_slot_by_slot() {
    let (mut e, clock) = engine(test_config(), FixedSchedule::every_slot(rx_link()), 4);

    run_slot(&mut e, &clock);
    assert_eq!(e.asn, Asn::new(5));
    let armed = clock.take_armed().unwrap();
    assert_eq!(armed, START + 2 * SLOT_LEN);

    // Fire the next slot 25 ms late: two slot deadlines are unreachable
    clock.set(armed + 25_000);
    e.slot_operation();

    assert_eq!(e.state, SlotState::Idle);
    assert_eq!(e.asn, Asn::new(8));
    assert_eq!(clock.take_armed(), Some(START + 5 * SLOT_LEN));
}

#[test]
fn desync_leaves_the_network() {
    let mut config = test_config();
    // One slot without a time-source exchange is already too many
    config.desync_threshold = 300_000;

    let (mut e, clock) = engine(config, FixedSchedule::every_slot(rx_link()), 4);
    e.update_time_source(&short_addr(5)).unwrap();

    let ev = run_slot(&mut e, &clock);

    assert!(ev.disassociated);
    assert!(!e.is_associated());
    assert_eq!(e.last_timesource, None);
    assert!(log_messages(&mut e).contains(&"!leaving the network, last sync"));

    // Loop exited: nothing further is scheduled
    assert_eq!(clock.take_armed(), None);
}

#[test]
fn tx_only_link_falls_back_to_rx_backup() {
    let mut schedule = FixedSchedule::every_slot(tx_link(short_addr(9)));
    schedule.backup = Some(rx_link());

    let (mut e, clock) = engine(test_config(), schedule, 4);

    // Nothing queued for the TX link: the backup link listens instead
    let slot_start = START + SLOT_LEN;
    let sfd = slot_start + TX_OFFSET + 5;
    e.radio
        .schedule_incoming(sfd, sfd + 352, data_frame(7, 1, 2, false, &[3]));

    run_slot(&mut e, &clock);

    assert_eq!(e.process_pending_input(|_| ()), 1);
    assert!(e.radio.transmits.is_empty());
}

#[test]
fn secured_tx_keeps_queued_frame_pristine() {
    let peer = short_addr(2);
    let mut config = test_config();
    config.security_enabled = true;

    let (mut e, clock) = engine(config, FixedSchedule::every_slot(tx_link(peer)), 4);

    let frame = with_security_level(data_frame(1, 2, 42, false, &[1, 2, 3]), 5);
    let packet = e
        .queue_mut()
        .add_packet(peer, &frame, TEST_HEADER_LEN, None, 5)
        .unwrap();

    run_slot(&mut e, &clock);

    // On-air frame carries the MIC; the queued copy does not
    assert_eq!(e.radio.transmits.len(), 1);
    let sent = &e.radio.transmits[0].frame;
    assert_eq!(sent.len(), frame.len() + TEST_MIC_LEN);
    assert_eq!(&sent[..frame.len()], &frame[..]);
    assert_eq!(e.queue().packet(packet).unwrap().frame(), &frame[..]);
    assert_eq!(e.queue().packet(packet).unwrap().transmissions, 1);
}

#[test]
fn rx_strips_mic_from_authentic_frames() {
    let mut config = test_config();
    config.security_enabled = true;

    let (mut e, clock) = engine(config, FixedSchedule::every_slot(rx_link()), 4);

    let frame = with_security_level(data_frame(7, 1, 3, false, &[9]), 5);
    let wire = secured(frame.clone(), &Asn::new(4));

    let slot_start = START + SLOT_LEN;
    let sfd = slot_start + TX_OFFSET + 10;
    let duration = 32 * (wire.len() as u32 + 1);
    e.radio.schedule_incoming(sfd, sfd + duration, wire);

    run_slot(&mut e, &clock);

    let mut received = Vec::new();
    e.process_pending_input(|p| received.push(p.frame().to_vec()));
    assert_eq!(received, [frame]);
}

#[test]
fn rx_drops_frames_that_fail_authentication() {
    let mut config = test_config();
    config.security_enabled = true;

    let (mut e, clock) = engine(config, FixedSchedule::every_slot(rx_link()), 4);

    // Secured frame with a corrupt MIC
    let mut frame = with_security_level(data_frame(7, 1, 3, false, &[9]), 5);
    frame.extend_from_slice(&[0, 0, 0, 0]);

    let slot_start = START + SLOT_LEN;
    let sfd = slot_start + TX_OFFSET + 10;
    let duration = 32 * (frame.len() as u32 + 1);
    e.radio.schedule_incoming(sfd, sfd + duration, frame);

    run_slot(&mut e, &clock);

    assert_eq!(e.process_pending_input(|_| ()), 0);
    assert!(log_messages(&mut e).contains(&"!failed to authenticate frame"));
}

#[test]
fn coordinator_guard_beacon_burst() {
    let mut config = test_config();
    config.guard_beacon = true;
    config.coordinator = true;

    let (mut e, clock) = engine(
        config,
        FixedSchedule::every_slot(tx_link(broadcast_address())),
        4,
    );

    e.queue_mut()
        .add_packet(broadcast_address(), &[GUARD_BEACON_MARKER], 0, None, 0)
        .unwrap();

    run_slot(&mut e, &clock);

    // Three tagged repetitions at -T, 0, +T around the TX offset
    assert_eq!(e.radio.transmits.len(), 3);
    let slot_start = START + SLOT_LEN;
    let expected = [
        (slot_start + TX_OFFSET - 1000, GUARD_BEACON_TAGS[0]),
        (slot_start + TX_OFFSET, GUARD_BEACON_TAGS[1]),
        (slot_start + TX_OFFSET + 1000, GUARD_BEACON_TAGS[2]),
    ];
    for (record, (at, tag)) in e.radio.transmits.iter().zip(expected.iter()) {
        assert!(record.at >= *at && record.at < *at + 8);
        assert_eq!(record.frame, [GUARD_BEACON_MARKER, *tag]);
    }

    // Broadcast burst completes without an ACK wait
    let mut statuses = Vec::new();
    assert_eq!(e.process_pending_dequeued(|p| statuses.push(p.ret)), 1);
    assert_eq!(statuses, [Some(MacTxStatus::Ok)]);
}

#[test]
fn guard_beacon_rx_shifts_drift_by_tag() {
    let mut config = test_config();
    config.guard_beacon = true;

    let (mut e, clock) = engine(config, FixedSchedule::every_slot(rx_link()), 30);

    let neighbor = e.update_time_source(&short_addr(5)).unwrap();
    // Age the last sync past the guard-beacon gate
    e.last_sync_asn = Asn::new(0);

    // First repetition (tag 0x11) transmitted T early, arriving 45 ticks
    // late relative to its early offset
    let slot_start = START + SLOT_LEN;
    let sfd = slot_start + TX_OFFSET - 1000 + 45;
    e.radio.schedule_incoming(
        sfd,
        sfd + 96,
        std::vec![GUARD_BEACON_MARKER, GUARD_BEACON_TAGS[0]],
    );

    run_slot(&mut e, &clock);

    // Raw drift +955 de-skewed by the tag to -45; clock pulled 45 early
    assert_eq!(e.timesync.updates, [(neighbor, 30, 45)]);
    assert_eq!(e.last_sync_asn, Asn::new(30));
    assert_eq!(clock.take_armed(), Some(slot_start + SLOT_LEN + 45));

    // The marker frame itself is published
    let mut received = Vec::new();
    e.process_pending_input(|p| received.push(p.frame().to_vec()));
    assert_eq!(received, [std::vec![GUARD_BEACON_MARKER]]);
}
