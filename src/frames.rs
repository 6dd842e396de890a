//! Frame and security codec interfaces.
//!
//! The slot engine never interprets 802.15.4 bytes itself: parsing,
//! enhanced-ACK construction, beacon Sync-IE patching and link-layer
//! security are performed by collaborator codecs behind these traits.
//! Parse and authentication failures are expected flow (the frame is
//! dropped with a log record), so the fallible operations return `Option`
//! rather than errors.

use ieee802154::mac::Address;

use crate::asn::Asn;

/// Frame classes relevant to slot operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Beacon,
    Data,
    Ack,
    Command,
}

/// Header summary of a validated incoming frame.
///
/// Produced only when the header decodes, the destination PAN matches and
/// source/destination link addresses could be extracted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedFrame {
    pub kind: FrameKind,
    /// Frame version is 802.15.4e-2012/2015 (enhanced beacons, IEs)
    pub version_2015: bool,
    pub seq: u8,
    pub header_len: usize,
    pub src: Address,
    pub dst: Address,
    pub ack_required: bool,
    pub security_level: u8,
}

impl ParsedFrame {
    /// Is this an enhanced beacon?
    pub fn is_eb(&self) -> bool {
        self.version_2015 && self.kind == FrameKind::Beacon
    }
}

/// Information elements carried by an enhanced ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EackIes {
    /// Time correction reported by the receiver, in microseconds
    pub time_correction_us: i16,
    pub nack: bool,
}

/// 802.15.4 frame codec
pub trait FrameCodec {
    /// Parse and validate an incoming frame header
    fn parse(&mut self, frame: &[u8]) -> Option<ParsedFrame>;

    /// Parse an enhanced ACK, requiring its sequence number to match the
    /// transmitted frame
    fn parse_eack(&mut self, frame: &[u8], expected_seqno: u8) -> Option<(ParsedFrame, EackIes)>;

    /// Encode an enhanced ACK into `buf`, returning its length (0 on
    /// failure, e.g. insufficient capacity)
    fn create_eack(
        &mut self,
        buf: &mut [u8],
        dst: &Address,
        seqno: u8,
        time_correction_us: i16,
        nack: bool,
    ) -> usize;

    /// Refresh the Sync-IE of a queued enhanced beacon in place with the
    /// current ASN. Returns false if the frame is no longer coherent.
    fn update_eb(&mut self, frame: &mut [u8], sync_ie_offset: usize, asn: &Asn) -> bool;
}

/// Link-layer security codec
pub trait SecurityCodec {
    /// Secure an outgoing frame in place: encrypt the payload after
    /// `header_len` if the level asks for it and append the MIC.
    /// `buf[..frame_len]` holds the frame; returns the bytes added.
    fn secure_frame(
        &mut self,
        buf: &mut [u8],
        frame_len: usize,
        header_len: usize,
        asn: &Asn,
    ) -> usize;

    /// Authenticate (and decrypt) an incoming frame against its claimed
    /// source address and the current ASN
    fn verify_frame(
        &mut self,
        frame: &[u8],
        header_len: usize,
        data_len: usize,
        parsed: &ParsedFrame,
        src: &Address,
        asn: &Asn,
    ) -> bool;

    /// MIC length implied by a frame's security level
    fn mic_len(&self, parsed: &ParsedFrame) -> usize;
}
