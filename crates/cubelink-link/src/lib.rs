// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Link layer of a CubeSat / ground station radio pair.
//!
//! Fixed-layout wire records, the command checksum, bounded ring buffers,
//! modem profiles, the transport driver seam, the modem arbiter and the
//! ranging coordinator. Nothing here blocks: every timed behavior is a
//! deadline compared against the `now` passed in by the caller.

pub mod error;
pub use error::*;

pub mod arbiter;
pub mod checksum;
pub mod modem;
pub mod packet;
pub mod ranging;
pub mod ringbuf;
pub mod transport;

pub use arbiter::{
    Arbiter, ArbiterConfig, BulkSource, ModemSlot, PowerState, Release, TrafficClass,
};
pub use checksum::checksum;
pub use modem::{
    lora24_bandwidth_khz, lora24_spreading_factor, FieldKind, ModemField, ModemProfile,
    ModemProfiles, TransportId, LORA_24_BW_0200, LORA_24_BW_0400, LORA_24_BW_0800,
    LORA_24_BW_1600, MODEM_PROFILE_LEN,
};
pub use packet::*;
pub use ranging::{
    min_packet_ms, Calibration, RangingConfig, RangingCoordinator, RangingEvent, RangingRole,
    RangingSummary,
};
pub use ringbuf::{OverflowPolicy, RingBuffer};
pub use transport::{Received, SimStats, SimulatedTransport, Transport, TransportSet};
