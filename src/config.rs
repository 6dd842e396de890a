//! Slot engine configuration and timeslot timing template.

use crate::hopping::HoppingSequence;
use crate::time::us_to_ticks;
use crate::Ticks;

/// Per-slot timing template, in rtimer ticks.
///
/// All offsets are relative to the slot start; receive-side offsets centre
/// the guard window on the transmitter's TX offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotTiming {
    /// Start of clear channel assessment
    pub cca_offset: Ticks,
    /// CCA sampling window
    pub cca: Ticks,
    /// First symbol of the frame leaves the antenna
    pub tx_offset: Ticks,
    /// Receiver starts listening
    pub rx_offset: Ticks,
    /// Transmitter turnaround from end of frame to ACK listen
    pub rx_ack_delay: Ticks,
    /// Receiver turnaround from end of frame to ACK transmit
    pub tx_ack_delay: Ticks,
    /// Receive guard window
    pub rx_wait: Ticks,
    /// How long the transmitter waits for the ACK to start
    pub ack_wait: Ticks,
    /// RX/TX turnaround of the transceiver
    pub rx_tx: Ticks,
    /// Maximum ACK airtime
    pub max_ack: Ticks,
    /// Maximum frame airtime
    pub max_tx: Ticks,
    /// Total timeslot duration
    pub timeslot_length: Ticks,
}

impl SlotTiming {
    /// The IEEE 802.15.4-2015 10 ms timeslot template
    pub const fn template_10ms(rtimer_second: u32) -> Self {
        Self {
            cca_offset: us_to_ticks(1800, rtimer_second),
            cca: us_to_ticks(128, rtimer_second),
            tx_offset: us_to_ticks(2120, rtimer_second),
            rx_offset: us_to_ticks(1120, rtimer_second),
            rx_ack_delay: us_to_ticks(800, rtimer_second),
            tx_ack_delay: us_to_ticks(1000, rtimer_second),
            rx_wait: us_to_ticks(2200, rtimer_second),
            ack_wait: us_to_ticks(400, rtimer_second),
            rx_tx: us_to_ticks(192, rtimer_second),
            max_ack: us_to_ticks(2400, rtimer_second),
            max_tx: us_to_ticks(4256, rtimer_second),
            timeslot_length: us_to_ticks(10000, rtimer_second),
        }
    }

    /// Truncation bound for received time-correction IEs: half the guard
    /// time, i.e. a quarter of the receive window
    pub fn sync_ie_bound(&self) -> i32 {
        (self.rx_wait / 4) as i32
    }
}

impl Default for SlotTiming {
    fn default() -> Self {
        Self::template_10ms(32_768)
    }
}

/// Slot engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Acting as the PAN coordinator (never desynchronizes)
    pub coordinator: bool,

    /// Rtimer frequency in Hz; must be at least 32 kHz
    pub rtimer_second: u32,

    /// Network-wide channel hopping sequence
    pub hopping: HoppingSequence,

    /// Keep the radio powered for whole active slots rather than toggling
    /// it around each air activity
    pub radio_on_during_timeslot: bool,

    /// Assess the channel before transmitting
    pub cca_enabled: bool,

    /// The PAN uses link-layer security: secure outgoing frames and ACKs,
    /// authenticate incoming ones
    pub security_enabled: bool,

    /// Drop hardware address filtering around the E-ACK window
    pub hw_frame_filtering: bool,

    /// Use the radio's SFD timestamp for drift estimation instead of the
    /// detection-time reading
    pub resync_with_sfd_timestamps: bool,

    /// Apply a dead band of `timesync_measurement_error_us` to estimated
    /// drift to remove measurement jitter
    pub timesync_remove_jitter: bool,

    /// Apply drift corrections carried by enhanced ACKs. When disabled the
    /// correction IE is still parsed and reported, but the local clock is
    /// only steered by beacon arrival times.
    pub drift_from_ack_enabled: bool,

    /// Guard-beacon mode: the coordinator repeats marker beacons around
    /// the TX offset and receivers de-skew their drift estimate by the
    /// repeat tag
    pub guard_beacon: bool,

    /// Retries before an unacknowledged packet is dropped
    pub max_frame_retries: u8,

    /// Minimum CSMA backoff exponent
    pub min_backoff_exponent: u8,
    /// Maximum CSMA backoff exponent
    pub max_backoff_exponent: u8,

    /// Desynchronization threshold in rtimer ticks: leave the network when
    /// no time-source exchange happened for this long
    pub desync_threshold: Ticks,

    /// Expected magnitude of drift measurement jitter, in microseconds
    pub timesync_measurement_error_us: u32,

    /// Guard-beacon repeat offset, in microseconds
    pub guard_beacon_time_us: u32,

    /// Minimum slots since the last sync before a guard beacon may steer
    /// the clock again
    pub guard_beacon_min_sync_age: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: false,
            rtimer_second: 32_768,
            hopping: HoppingSequence::default(),

            radio_on_during_timeslot: true,
            cca_enabled: false,
            security_enabled: false,
            hw_frame_filtering: false,
            resync_with_sfd_timestamps: false,
            timesync_remove_jitter: false,
            drift_from_ack_enabled: true,
            guard_beacon: false,

            max_frame_retries: 8,
            min_backoff_exponent: 1,
            max_backoff_exponent: 7,

            // Four missed 60 s keepalive periods
            desync_threshold: 240 * 32_768,

            timesync_measurement_error_us: 32,
            guard_beacon_time_us: 1000,
            guard_beacon_min_sync_age: 21,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn template_scales_with_clock() {
        let us = SlotTiming::template_10ms(1_000_000);
        assert_eq!(us.tx_offset, 2120);
        assert_eq!(us.timeslot_length, 10_000);

        let ticks = SlotTiming::template_10ms(32_768);
        assert_eq!(ticks.timeslot_length, 328);
        assert!(ticks.tx_offset < ticks.timeslot_length);
    }

    #[test]
    fn sync_bound_is_quarter_rx_wait() {
        let t = SlotTiming::template_10ms(1_000_000);
        assert_eq!(t.sync_ie_bound(), 550);
    }
}
