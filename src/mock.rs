//! Mock collaborators for driving the slot engine in tests: a scripted
//! radio sharing the mock clock, a fixed single-cell schedule, a compact
//! test frame codec and a recording timesync sink.

use std::collections::VecDeque;
use std::vec::Vec;

use ieee802154::mac::{Address, PanId, ShortAddress};

use crate::asn::Asn;
use crate::frames::{EackIes, FrameCodec, FrameKind, ParsedFrame, SecurityCodec};
use crate::queue::{broadcast_address, NeighborId};
use crate::schedule::{Link, NextActiveLink, Schedule};
use crate::time::mock::MockClock;
use crate::timesync::TimeSync;
use crate::{SlotRadio, TickDelta, Ticks};

/// One recorded transmission
#[derive(Debug, Clone, PartialEq)]
pub struct TxRecord {
    /// Clock reading when `transmit` was called
    pub at: Ticks,
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Incoming {
    air_start: Ticks,
    air_end: Ticks,
    frame: Vec<u8>,
}

/// Scripted radio.
///
/// Incoming frames are scheduled with absolute on-air windows against the
/// shared [`MockClock`]; `receiving_packet`/`pending_packet` answer from
/// the current clock reading without advancing it.
pub struct MockRadio {
    clock: MockClock,

    pub is_on: bool,
    pub on_count: usize,
    pub off_count: usize,
    pub channel: u8,
    pub channel_clear: bool,
    pub frame_filtering: bool,
    pub rssi: i8,
    pub transmits: Vec<TxRecord>,

    prepared: Vec<u8>,
    incoming: VecDeque<Incoming>,
    last_sfd: Ticks,
}

impl MockRadio {
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            is_on: false,
            on_count: 0,
            off_count: 0,
            channel: 0,
            channel_clear: true,
            frame_filtering: true,
            rssi: -60,
            transmits: Vec::new(),
            prepared: Vec::new(),
            incoming: VecDeque::new(),
            last_sfd: 0,
        }
    }

    /// Script a frame on the air over `[air_start, air_end)`, readable
    /// once the window has passed
    pub fn schedule_incoming(&mut self, air_start: Ticks, air_end: Ticks, frame: Vec<u8>) {
        self.incoming.push_back(Incoming {
            air_start,
            air_end,
            frame,
        });
    }

    fn front_active(&self) -> Option<&Incoming> {
        self.incoming.front()
    }
}

impl SlotRadio for MockRadio {
    type Error = ();

    fn prepare(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
        self.prepared = frame.to_vec();
        Ok(())
    }

    fn transmit(&mut self, len: usize) -> Result<(), Self::Error> {
        let len = len.min(self.prepared.len());
        self.transmits.push(TxRecord {
            at: self.clock.peek(),
            frame: self.prepared[..len].to_vec(),
        });
        Ok(())
    }

    fn on(&mut self) {
        self.is_on = true;
        self.on_count += 1;
    }

    fn off(&mut self) {
        self.is_on = false;
        self.off_count += 1;
    }

    fn receiving_packet(&mut self) -> bool {
        let now = self.clock.peek();
        self.front_active()
            .map(|i| now >= i.air_start && now < i.air_end)
            .unwrap_or(false)
    }

    fn pending_packet(&mut self) -> bool {
        let now = self.clock.peek();
        self.front_active().map(|i| now >= i.air_end).unwrap_or(false)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let now = self.clock.peek();
        match self.incoming.front() {
            Some(i) if now >= i.air_end => {
                let i = self.incoming.pop_front().unwrap();
                let len = i.frame.len().min(buf.len());
                buf[..len].copy_from_slice(&i.frame[..len]);
                self.last_sfd = i.air_start;
                len
            }
            _ => 0,
        }
    }

    fn channel_clear(&mut self) -> bool {
        self.channel_clear
    }

    fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    fn last_rssi(&mut self) -> i8 {
        self.rssi
    }

    fn last_packet_timestamp(&mut self) -> Ticks {
        self.last_sfd
    }

    fn set_frame_filtering(&mut self, enabled: bool) {
        self.frame_filtering = enabled;
    }
}

/// Schedule with one repeating cell (and optional backup), every `period`
/// slots
#[derive(Debug, Clone, PartialEq)]
pub struct FixedSchedule {
    pub link: Option<Link>,
    pub backup: Option<Link>,
    pub period: u16,
    pub nack: bool,
}

impl FixedSchedule {
    pub fn every_slot(link: Link) -> Self {
        Self {
            link: Some(link),
            backup: None,
            period: 1,
            nack: false,
        }
    }

    pub fn empty() -> Self {
        Self {
            link: None,
            backup: None,
            period: 1,
            nack: false,
        }
    }
}

impl Schedule for FixedSchedule {
    fn next_active_link(&mut self, _asn: &Asn) -> Option<NextActiveLink> {
        self.link.map(|link| NextActiveLink {
            link,
            timeslot_diff: self.period,
            backup: self.backup,
        })
    }

    fn do_nack(&mut self, _link: &Link, _src: &Address, _dst: &Address) -> bool {
        self.nack
    }
}

/// Records every timesync interaction
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecordingTimesync {
    pub updates: Vec<(NeighborId, i32, TickDelta)>,
    pub keepalives: usize,
    pub compensation: TickDelta,
}

impl TimeSync for RecordingTimesync {
    fn adaptive_compensate(&mut self, _dt: Ticks) -> TickDelta {
        self.compensation
    }

    fn update(&mut self, neighbor: NeighborId, since_last_sync: i32, correction: TickDelta) {
        self.updates.push((neighbor, since_last_sync, correction));
    }

    fn schedule_keepalive(&mut self) {
        self.keepalives += 1;
    }
}

// Compact test frame format:
//   [0] frame kind (802.15.4 FCF type bits)
//   [1] flags: 0x01 ack request, 0x02 2015 version, bits 4..6 security level
//   [2] sequence number
//   [3..5] source short address, LE
//   [5..7] destination short address, LE (0xfffe = no address)
// Enhanced ACKs: [kind, flags, seq, correction LE i16, nack]

pub const TEST_PAN: PanId = PanId(0x0100);
pub const TEST_HEADER_LEN: usize = 7;
pub const TEST_EACK_LEN: usize = 6;
pub const TEST_MIC_LEN: usize = 4;

const KIND_BEACON: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_ACK: u8 = 2;
const KIND_COMMAND: u8 = 3;

const FLAG_ACK_REQUEST: u8 = 0x01;
const FLAG_VERSION_2015: u8 = 0x02;

const NO_ADDRESS: u16 = 0xfffe;

/// Short address in the test PAN
pub fn short_addr(value: u16) -> Address {
    Address::Short(TEST_PAN, ShortAddress(value))
}

fn decode_addr(value: u16) -> Address {
    match value {
        NO_ADDRESS => Address::None,
        0xffff => broadcast_address(),
        v => short_addr(v),
    }
}

fn checksum_mic(frame: &[u8], asn: &Asn) -> [u8; TEST_MIC_LEN] {
    let sum = frame
        .iter()
        .fold(asn.ls4b as u8, |acc, b| acc.wrapping_add(*b));
    [sum, sum ^ 0x5a, frame.len() as u8, 0xa5]
}

/// Build a test data frame
pub fn data_frame(src: u16, dst: u16, seq: u8, ack_request: bool, payload: &[u8]) -> Vec<u8> {
    let mut flags = FLAG_VERSION_2015;
    if ack_request {
        flags |= FLAG_ACK_REQUEST;
    }
    let mut frame = std::vec![KIND_DATA, flags, seq];
    frame.extend_from_slice(&src.to_le_bytes());
    frame.extend_from_slice(&dst.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build a test enhanced beacon (no destination, no ACK request)
pub fn beacon_frame(src: u16, seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = std::vec![KIND_BEACON, FLAG_VERSION_2015, seq];
    frame.extend_from_slice(&src.to_le_bytes());
    frame.extend_from_slice(&NO_ADDRESS.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build a test enhanced ACK as a peer would send it
pub fn eack_frame(seq: u8, time_correction_us: i16, nack: bool) -> Vec<u8> {
    let mut frame = std::vec![KIND_ACK, FLAG_VERSION_2015, seq];
    frame.extend_from_slice(&time_correction_us.to_le_bytes());
    frame.push(nack as u8);
    frame
}

/// Stateless codec for the test frame format
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct TestCodec;

impl FrameCodec for TestCodec {
    fn parse(&mut self, frame: &[u8]) -> Option<ParsedFrame> {
        if frame.len() < TEST_HEADER_LEN {
            return None;
        }
        let kind = match frame[0] & 7 {
            KIND_BEACON => FrameKind::Beacon,
            KIND_DATA => FrameKind::Data,
            KIND_COMMAND => FrameKind::Command,
            _ => return None,
        };
        let flags = frame[1];
        Some(ParsedFrame {
            kind,
            version_2015: flags & FLAG_VERSION_2015 != 0,
            seq: frame[2],
            header_len: TEST_HEADER_LEN,
            src: decode_addr(u16::from_le_bytes([frame[3], frame[4]])),
            dst: decode_addr(u16::from_le_bytes([frame[5], frame[6]])),
            ack_required: flags & FLAG_ACK_REQUEST != 0,
            security_level: (flags >> 4) & 7,
        })
    }

    fn parse_eack(&mut self, frame: &[u8], expected_seqno: u8) -> Option<(ParsedFrame, EackIes)> {
        if frame.len() < TEST_EACK_LEN || frame[0] & 7 != KIND_ACK {
            return None;
        }
        if frame[2] != expected_seqno {
            return None;
        }
        let flags = frame[1];
        let parsed = ParsedFrame {
            kind: FrameKind::Ack,
            version_2015: true,
            seq: frame[2],
            header_len: TEST_EACK_LEN,
            src: Address::None,
            dst: Address::None,
            ack_required: false,
            security_level: (flags >> 4) & 7,
        };
        let ies = EackIes {
            time_correction_us: i16::from_le_bytes([frame[3], frame[4]]),
            nack: frame[5] != 0,
        };
        Some((parsed, ies))
    }

    fn create_eack(
        &mut self,
        buf: &mut [u8],
        _dst: &Address,
        seqno: u8,
        time_correction_us: i16,
        nack: bool,
    ) -> usize {
        if buf.len() < TEST_EACK_LEN {
            return 0;
        }
        buf[0] = KIND_ACK;
        buf[1] = FLAG_VERSION_2015;
        buf[2] = seqno;
        buf[3..5].copy_from_slice(&time_correction_us.to_le_bytes());
        buf[5] = nack as u8;
        TEST_EACK_LEN
    }

    fn update_eb(&mut self, frame: &mut [u8], sync_ie_offset: usize, asn: &Asn) -> bool {
        if frame.len() < sync_ie_offset + 5 {
            return false;
        }
        frame[sync_ie_offset..sync_ie_offset + 4].copy_from_slice(&asn.ls4b.to_le_bytes());
        frame[sync_ie_offset + 4] = asn.ms1b;
        true
    }
}

impl SecurityCodec for TestCodec {
    fn secure_frame(
        &mut self,
        buf: &mut [u8],
        frame_len: usize,
        _header_len: usize,
        asn: &Asn,
    ) -> usize {
        let mic = {
            let frame = &buf[..frame_len];
            checksum_mic(frame, asn)
        };
        buf[frame_len..frame_len + TEST_MIC_LEN].copy_from_slice(&mic);
        TEST_MIC_LEN
    }

    fn verify_frame(
        &mut self,
        frame: &[u8],
        header_len: usize,
        data_len: usize,
        parsed: &ParsedFrame,
        _src: &Address,
        asn: &Asn,
    ) -> bool {
        if parsed.security_level == 0 {
            return true;
        }
        let protected = header_len + data_len;
        if frame.len() < protected + TEST_MIC_LEN {
            return false;
        }
        let expected = checksum_mic(&frame[..protected], asn);
        frame[protected..protected + TEST_MIC_LEN] == expected
    }

    fn mic_len(&self, parsed: &ParsedFrame) -> usize {
        if parsed.security_level > 0 {
            TEST_MIC_LEN
        } else {
            0
        }
    }
}

/// Mark a test frame as secured at the given level
pub fn with_security_level(mut frame: Vec<u8>, level: u8) -> Vec<u8> {
    frame[1] |= (level & 7) << 4;
    frame
}

/// Append a matching MIC to a test frame, as a secured peer would
pub fn secured(mut frame: Vec<u8>, asn: &Asn) -> Vec<u8> {
    let mic = checksum_mic(&frame, asn);
    frame.extend_from_slice(&mic);
    frame
}
