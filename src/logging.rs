//! Structured per-slot logging.
//!
//! Slot execution happens in interrupt context where formatting is off the
//! table, so the engine records fixed-size entries into a ring; the
//! foreground drains the ring and renders entries through the crate log
//! facade. Entries are dropped (and counted) rather than blocking a slot.

use ieee802154::mac::Address;

use crate::asn::Asn;
use crate::log::{info, warn};
use crate::ringbuf::RingIndex;
use crate::MacTxStatus;

pub const SLOT_LOG_CAPACITY: usize = 16;

/// Outcome record of one transmit attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxLog {
    pub status: MacTxStatus,
    pub attempts: u8,
    pub datalen: usize,
    pub drift_us: i32,
    pub drift_used: bool,
    pub is_data: bool,
    pub security_level: u8,
    pub dest: Address,
}

/// Record of one received frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxLog {
    pub src: Address,
    pub is_unicast: bool,
    pub datalen: usize,
    pub drift_us: i32,
    pub drift_used: bool,
    pub is_data: bool,
    pub security_level: u8,
    pub estimated_drift_us: i32,
}

/// Tagged event with up to two numeric arguments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessageLog {
    pub text: &'static str,
    pub arg0: i32,
    pub arg1: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotLogKind {
    Tx(TxLog),
    Rx(RxLog),
    Message(MessageLog),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotLogEntry {
    pub asn: Asn,
    pub channel: u8,
    pub kind: SlotLogKind,
}

/// Interrupt-to-foreground log ring
pub struct SlotLog {
    ring: RingIndex<SLOT_LOG_CAPACITY>,
    entries: [Option<SlotLogEntry>; SLOT_LOG_CAPACITY],
    dropped: u16,
}

impl SlotLog {
    pub const fn new() -> Self {
        const NO_ENTRY: Option<SlotLogEntry> = None;
        Self {
            ring: RingIndex::new(),
            entries: [NO_ENTRY; SLOT_LOG_CAPACITY],
            dropped: 0,
        }
    }

    /// Record an entry; counts a drop when the ring is full
    pub fn add(&mut self, entry: SlotLogEntry) -> bool {
        match self.ring.peek_put() {
            Some(index) => {
                self.entries[index] = Some(entry);
                self.ring.put();
                true
            }
            None => {
                self.dropped = self.dropped.saturating_add(1);
                false
            }
        }
    }

    pub fn pop(&mut self) -> Option<SlotLogEntry> {
        let index = self.ring.peek_get()?;
        let entry = self.entries[index].take();
        self.ring.get();
        entry
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Render and drain all pending entries. Foreground only.
    pub fn flush(&mut self) {
        while let Some(entry) = self.pop() {
            entry.render();
        }
        if self.dropped > 0 {
            warn!("slot log overflow, {} records lost", self.dropped);
            self.dropped = 0;
        }
    }
}

impl SlotLogEntry {
    pub fn message(asn: Asn, channel: u8, text: &'static str, arg0: i32, arg1: i32) -> Self {
        Self {
            asn,
            channel,
            kind: SlotLogKind::Message(MessageLog { text, arg0, arg1 }),
        }
    }

    fn render(&self) {
        match &self.kind {
            SlotLogKind::Tx(tx) => info!(
                "{} ch {} | tx {:?} to {:?} len {} attempt {} drift {}us (used {}) sec {}",
                self.asn.value(),
                self.channel,
                tx.status,
                tx.dest,
                tx.datalen,
                tx.attempts,
                tx.drift_us,
                tx.drift_used,
                tx.security_level,
            ),
            SlotLogKind::Rx(rx) => info!(
                "{} ch {} | rx from {:?} len {} unicast {} drift {}us (used {}, estimated {}us) sec {}",
                self.asn.value(),
                self.channel,
                rx.src,
                rx.datalen,
                rx.is_unicast,
                rx.drift_us,
                rx.drift_used,
                rx.estimated_drift_us,
                rx.security_level,
            ),
            SlotLogKind::Message(m) => {
                info!("{} ch {} | {} {} {}", self.asn.value(), self.channel, m.text, m.arg0, m.arg1)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn message(i: i32) -> SlotLogEntry {
        SlotLogEntry::message(Asn::new(i as u64), 20, "!test", i, 0)
    }

    #[test]
    fn records_drain_in_order() {
        let mut log = SlotLog::new();

        log.add(message(1));
        log.add(message(2));

        assert!(matches!(
            log.pop().unwrap().kind,
            SlotLogKind::Message(MessageLog { arg0: 1, .. })
        ));
        assert!(matches!(
            log.pop().unwrap().kind,
            SlotLogKind::Message(MessageLog { arg0: 2, .. })
        ));
        assert!(log.pop().is_none());
    }

    #[test]
    fn overflow_counts_drops() {
        let mut log = SlotLog::new();

        for i in 0..SLOT_LOG_CAPACITY as i32 {
            assert!(log.add(message(i)));
        }
        assert!(!log.add(message(99)));
        assert_eq!(log.dropped, 1);

        log.flush();
        assert!(log.is_empty());
        assert_eq!(log.dropped, 0);
    }
}
