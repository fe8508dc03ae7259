// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use cubelink_link::{
    ArbiterConfig, RangingConfig, TransportId, ADDR_BROADCAST, ADDR_GROUND, ADDR_RANGING,
    ADDR_SPACECRAFT, KEY_LEN,
};

use crate::{StationError, StationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Spacecraft,
    Ground,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub role: Role,
    pub local_address: u8,
    pub peer_address: u8,
    /// received-frame ring, oldest entries are overwritten
    pub rx_capacity: usize,
    /// bulk outbox, new chunks are rejected when full
    pub outbox_capacity: usize,
    pub max_file_size: usize,
    pub dedup_window: usize,
    pub missing_retry_ms: u64,
    /// every Nth beacon is a long one, the rest are short
    pub long_beacon_every: u32,
    /// beacon_interval_ms and sleep_to_off_ms are replaced by the Setting
    /// once a station is up
    pub arbiter: ArbiterConfig,
    pub ranging: RangingConfig,
    pub key: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self::spacecraft()
    }
}

impl StationConfig {
    pub fn spacecraft() -> Self {
        StationConfig {
            role: Role::Spacecraft,
            local_address: ADDR_SPACECRAFT,
            peer_address: ADDR_GROUND,
            rx_capacity: 20,
            outbox_capacity: 200,
            max_file_size: 256 * 1024,
            dedup_window: 32,
            missing_retry_ms: 60_000,
            long_beacon_every: 2,
            arbiter: ArbiterConfig::default(),
            ranging: RangingConfig::default(),
            key: "AAA".to_string(),
        }
    }

    pub fn ground_station() -> Self {
        StationConfig {
            role: Role::Ground,
            local_address: ADDR_GROUND,
            peer_address: ADDR_SPACECRAFT,
            rx_capacity: 40,
            arbiter: ArbiterConfig {
                rotation: vec![TransportId::Lora433],
                ..Default::default()
            },
            ranging: RangingConfig {
                count: 6,
                ..Default::default()
            },
            ..Self::spacecraft()
        }
    }

    pub fn from_json(json: &str) -> StationResult<Self> {
        let config: StationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> StationResult<Self> {
        let path = path.as_ref();
        info!("loading station config from {}", path.display());
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> StationResult<()> {
        let reserved = [ADDR_BROADCAST, ADDR_RANGING];
        if reserved.contains(&self.local_address) || reserved.contains(&self.peer_address) {
            return Err(StationError::invalid_argument(
                "station addresses may not be broadcast or ranging",
            ));
        }
        if self.local_address == self.peer_address {
            return Err(StationError::invalid_argument(
                "local and peer address are the same",
            ));
        }
        if self.arbiter.rotation.is_empty() {
            return Err(StationError::invalid_argument("empty modem rotation"));
        }
        if self.long_beacon_every == 0 {
            return Err(StationError::invalid_argument("long_beacon_every must be > 0"));
        }
        self.key_bytes()?;
        Ok(())
    }

    pub fn key_bytes(&self) -> StationResult<[u8; KEY_LEN]> {
        self.key.as_bytes().try_into().map_err(|_| {
            StationError::invalid_argument(format!("key must be {} bytes", KEY_LEN))
        })
    }
}
