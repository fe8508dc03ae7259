// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

pub mod beacon;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod lrucache;
pub mod settings;
pub mod station;
pub mod storage;
pub mod transfer;

pub use beacon::{BeaconGenerator, BeaconReport, Sensors, StatusRecord, Telemetry};
pub use clock::Clock;
pub use command::{codes, dispatch, DispatchState, Dispatcher};
pub use config::{Role, StationConfig};
pub use error::*;
pub use lrucache::LruCache;
pub use settings::Settings;
pub use station::{Action, BlinkTarget, Inbound, Station, Subsystem, SystemState};
pub use storage::{DirStorage, MemStorage, Storage, StoredFile};
pub use transfer::{
    MissingRequest, NextChunk, ReassemblyState, TransferManager, TransferMeta,
};
