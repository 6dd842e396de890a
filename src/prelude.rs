//! TSCH crate prelude
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

pub use crate::{MacTxStatus, SlotClock, SlotRadio, TickDelta, Ticks, PACKET_MAX_LEN};

pub use crate::asn::Asn;

pub use crate::config::{Config, SlotTiming};

pub use crate::hopping::HoppingSequence;

pub use crate::schedule::{Link, LinkOptions, LinkType, NextActiveLink, Schedule};

pub use crate::queue::{broadcast_address, NeighborId, PacketId, TschPacket, TschQueue};

pub use crate::frames::{EackIes, FrameCodec, FrameKind, ParsedFrame, SecurityCodec};

pub use crate::timesync::TimeSync;

pub use crate::slot::{InputPacket, SlotEngine, SlotEvents};

pub use crate::error::{QueueError, TimerError};

pub use ieee802154::mac::{Address as MacAddress, AddressMode, ExtendedAddress, PanId, ShortAddress};
