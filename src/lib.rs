//! Time-Slotted Channel Hopping (TSCH) MAC slot engine for IEEE 802.15.4-2015
//! low-power wireless networks.
//!
//! The crate implements the per-timeslot operation machinery of a TSCH MAC:
//! a slot-operation state machine driven from a high-resolution timer
//! interrupt, channel hopping, per-slot transmit/receive sequencing with
//! enhanced-acknowledgment handling, drift estimation against a time-source
//! neighbor, CSMA backoff for shared cells, and the interrupt/foreground
//! ring-buffer hand-off. Schedule storage, frame codecs, security and the
//! adaptive timesync filter are collaborators behind traits.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

#![no_std]

use core::fmt::Debug;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod asn;

pub mod time;

pub mod lock;

pub mod ringbuf;

pub mod hopping;

pub mod schedule;

pub mod queue;

pub mod frames;

pub mod timesync;

pub mod logging;

pub mod config;

pub mod error;

pub mod slot;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;

pub mod prelude;

use crate::error::TimerError;

/// High resolution timer ticks, wrapping 32-bit
pub type Ticks = u32;

/// Signed tick quantities (drift corrections, time deltas)
pub type TickDelta = i32;

/// Maximum length of a frame handled by the slot engine
pub const PACKET_MAX_LEN: usize = 127;

/// Per-transmission outcome, reported on every attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MacTxStatus {
    /// Frame sent, and acknowledged where an ACK was required
    Ok,
    /// No (valid) acknowledgment received within the ACK window
    NoAck,
    /// Channel was busy during clear channel assessment
    Collision,
    /// The radio driver failed the transmission
    Err,
    /// No buffer for the frame, or nowhere to publish the outcome
    ErrFatal,
}

/// Radio driver contract consumed by the slot engine.
///
/// The engine owns the radio for the duration of a slot and sequences it
/// against absolute tick deadlines, so the driver surface is split into
/// `prepare` (copy to the radio buffer) and `transmit` (fire what was
/// prepared), with separate "energy on air" and "frame ready" queries.
pub trait SlotRadio {
    type Error: Debug;

    /// Ticks between `transmit()` and the first symbol on air
    const DELAY_BEFORE_TX: Ticks = 0;
    /// Ticks between `on()` and the receiver actually listening
    const DELAY_BEFORE_RX: Ticks = 0;
    /// Ticks between SFD on air and `receiving_packet()` reporting it
    const DELAY_BEFORE_DETECT: Ticks = 0;

    /// Copy a frame into the radio transmit buffer
    fn prepare(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    /// Transmit the prepared frame, blocking until it has left the air
    fn transmit(&mut self, len: usize) -> Result<(), Self::Error>;

    /// Power the receiver/transmitter up
    fn on(&mut self);

    /// Power the radio down
    fn off(&mut self);

    /// Is a frame currently being received (preamble/SFD seen)?
    fn receiving_packet(&mut self) -> bool;

    /// Is a complete received frame waiting to be read?
    fn pending_packet(&mut self) -> bool;

    /// Read a pending frame, returning its length (0 if none)
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Sample clear channel assessment once
    fn channel_clear(&mut self) -> bool;

    /// Select the physical channel (11..=26 for 2.4 GHz O-QPSK)
    fn set_channel(&mut self, channel: u8);

    /// RSSI of the last received frame, in dBm
    fn last_rssi(&mut self) -> i8;

    /// SFD timestamp of the last received frame, in rtimer ticks
    fn last_packet_timestamp(&mut self) -> Ticks;

    /// Enable or disable hardware address filtering.
    ///
    /// Filtering is dropped around the E-ACK window so enhanced ACKs
    /// (which carry no destination address) are not discarded by hardware.
    fn set_frame_filtering(&mut self, enabled: bool) {
        let _ = enabled;
    }
}

/// High-resolution timer contract.
///
/// `now` must be monotonic modulo 32-bit wraparound and tick at
/// [`config::Config::rtimer_second`] Hz. `arm` programs a one-shot compare;
/// the host wires the resulting interrupt to
/// [`slot::SlotEngine::slot_operation`].
pub trait SlotClock {
    /// Current time in rtimer ticks
    fn now(&self) -> Ticks;

    /// Arm the one-shot timer for an absolute tick value
    fn arm(&mut self, at: Ticks) -> Result<(), TimerError>;
}

// Wrap log macros to support switching between defmt and standard logging

#[cfg(feature = "defmt")]
mod log {
    pub use defmt::{trace, debug, info, warn, error};

    pub trait FmtError: core::fmt::Debug + defmt::Format {}
    impl<T: core::fmt::Debug + defmt::Format> FmtError for T {}
}
#[cfg(not(feature = "defmt"))]
mod log {
    pub use log::{trace, debug, info, warn, error};

    pub trait FmtError: core::fmt::Debug {}
    impl<T: core::fmt::Debug> FmtError for T {}
}
