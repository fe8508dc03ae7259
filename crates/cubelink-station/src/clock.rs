// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use log::*;

use cubelink_link::DateTime;

use crate::{StationError, StationResult};

/// The uplinked DateTime carries no year.
pub const REFERENCE_YEAR: i32 = 2024;

/// Wall clock set by command, advanced by the monotonic tick time.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    anchor: Option<(NaiveDateTime, u64)>,
}

impl Clock {
    pub fn set(&mut self, dt: DateTime, now: u64) -> StationResult<()> {
        let wall = NaiveDate::from_ymd_opt(REFERENCE_YEAR, dt.month as u32, dt.day as u32)
            .and_then(|date| date.and_hms_opt(dt.hour as u32, dt.minute as u32, 0))
            .ok_or_else(|| StationError::invalid_argument(format!("bad date/time {:?}", dt)))?;
        info!("clock set to {}", wall);
        self.anchor = Some((wall, now));
        Ok(())
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }

    pub fn is_set(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn wall(&self, now: u64) -> Option<NaiveDateTime> {
        let (base, at) = self.anchor?;
        let elapsed = TimeDelta::try_milliseconds(now.saturating_sub(at) as i64)?;
        base.checked_add_signed(elapsed)
    }

    /// Current time as carried in beacons, zeros while unset.
    pub fn date_time(&self, now: u64) -> DateTime {
        match self.wall(now) {
            Some(wall) => DateTime {
                month: wall.month() as u8,
                day: wall.day() as u8,
                hour: wall.hour() as u8,
                minute: wall.minute() as u8,
            },
            None => DateTime::default(),
        }
    }
}
