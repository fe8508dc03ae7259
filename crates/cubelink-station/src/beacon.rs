// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;

use cubelink_link::{
    AirFrame, DateTime, DecodeError, LinkFrame, MsgType, ShortBeacon, TransportId, WireRecord,
    ADDR_BROADCAST, DATE_TIME_LEN,
};

pub const STATUS_RECORD_LEN: usize = 20;

/// Housekeeping readings supplied by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sensors {
    pub battery_mv: u16,
    pub battery_ma: i16,
    pub temp1: i8,
    pub temp2: i8,
}

/// Payload of a long beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRecord {
    pub date_time: DateTime,
    pub oper_time_s: u32,
    pub sensors: Sensors,
    pub received_count: u16,
    pub pending_outbox: u16,
    pub transport: u8,
    pub stop_tx: bool,
}

impl WireRecord for StatusRecord {
    const LEN: usize = STATUS_RECORD_LEN;

    fn write_to(&self, out: &mut [u8]) {
        self.date_time.write_to(&mut out[..DATE_TIME_LEN]);
        out[4..8].copy_from_slice(&self.oper_time_s.to_le_bytes());
        out[8..10].copy_from_slice(&self.sensors.battery_mv.to_le_bytes());
        out[10..12].copy_from_slice(&self.sensors.battery_ma.to_le_bytes());
        out[12] = self.sensors.temp1 as u8;
        out[13] = self.sensors.temp2 as u8;
        out[14..16].copy_from_slice(&self.received_count.to_le_bytes());
        out[16..18].copy_from_slice(&self.pending_outbox.to_le_bytes());
        out[18] = self.transport;
        out[19] = self.stop_tx as u8;
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        if block.len() != Self::LEN {
            return Err(DecodeError::size_mismatch(Self::LEN, block.len()));
        }
        let u16_at = |at: usize| u16::from_le_bytes([block[at], block[at + 1]]);
        Ok(StatusRecord {
            date_time: DateTime::read_from(&block[..DATE_TIME_LEN])?,
            oper_time_s: u32::from_le_bytes([block[4], block[5], block[6], block[7]]),
            sensors: Sensors {
                battery_mv: u16_at(8),
                battery_ma: u16_at(10) as i16,
                temp1: block[12] as i8,
                temp2: block[13] as i8,
            },
            received_count: u16_at(14),
            pending_outbox: u16_at(16),
            transport: block[18],
            stop_tx: block[19] != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconReport {
    Short(ShortBeacon),
    Long(StatusRecord),
}

/// A beacon heard from another station.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub source: u8,
    pub transport: TransportId,
    pub rssi: i32,
    pub snr: f32,
    pub report: BeaconReport,
}

/// Alternates long and short beacons.
#[derive(Debug)]
pub struct BeaconGenerator {
    long_every: u32,
    sent: u32,
    sensors: Sensors,
}

impl BeaconGenerator {
    pub fn new(long_every: u32) -> Self {
        BeaconGenerator {
            long_every: long_every.max(1),
            sent: 0,
            sensors: Sensors::default(),
        }
    }

    pub fn set_sensors(&mut self, sensors: Sensors) {
        self.sensors = sensors;
    }

    pub fn sensors(&self) -> Sensors {
        self.sensors
    }

    /// The scheduled beacon: every `long_every`th one is long.
    pub fn next(&mut self, local_address: u8, status: StatusRecord) -> Result<AirFrame, DecodeError> {
        let long = self.sent % self.long_every == 0;
        self.sent = self.sent.wrapping_add(1);
        if long {
            self.long(local_address, status)
        } else {
            Ok(AirFrame::Short(self.short(local_address, &status)))
        }
    }

    pub fn long(&self, local_address: u8, status: StatusRecord) -> Result<AirFrame, DecodeError> {
        let status = StatusRecord {
            sensors: self.sensors,
            ..status
        };
        trace!("long beacon: {:?}", status);
        Ok(AirFrame::Long(LinkFrame::wrap(
            local_address,
            ADDR_BROADCAST,
            MsgType::Beacon,
            &status,
        )?))
    }

    /// A short beacon outside the long/short alternation.
    pub fn short(&self, local_address: u8, status: &StatusRecord) -> ShortBeacon {
        ShortBeacon {
            local_address,
            pending_outbox_count: status.pending_outbox.min(u8::MAX as u16) as u8,
            received_count: status.received_count.min(u8::MAX as u16) as u8,
            msg_index: 0,
            battery_mv: self.sensors.battery_mv,
            battery_ma: self.sensors.battery_ma,
            temp1: self.sensors.temp1,
            temp2: self.sensors.temp2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubelink_link::ADDR_SPACECRAFT;

    fn status() -> StatusRecord {
        StatusRecord {
            date_time: DateTime {
                month: 6,
                day: 1,
                hour: 12,
                minute: 5,
            },
            oper_time_s: 3600,
            received_count: 300,
            pending_outbox: 4,
            transport: TransportId::Fsk433 as u8,
            stop_tx: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_status_record_layout() {
        let record = StatusRecord {
            sensors: Sensors {
                battery_mv: 3700,
                battery_ma: -120,
                temp1: -5,
                temp2: 21,
            },
            stop_tx: true,
            ..status()
        };
        let mut buf = [0u8; STATUS_RECORD_LEN];
        record.write_to(&mut buf);
        assert_eq!(
            hex::encode(buf),
            "06010c05100e0000740e88fffb152c0104000101"
        );
        assert_eq!(StatusRecord::read_from(&buf).unwrap(), record);
        assert!(StatusRecord::read_from(&buf[..19]).is_err());
    }

    #[test]
    fn test_long_short_alternation() {
        let mut beacons = BeaconGenerator::new(2);
        beacons.set_sensors(Sensors {
            battery_mv: 3900,
            battery_ma: 250,
            temp1: 10,
            temp2: 11,
        });
        let kinds: Vec<MsgType> = (0..4)
            .map(|_| beacons.next(ADDR_SPACECRAFT, status()).unwrap().msg_type())
            .collect();
        assert_eq!(
            kinds,
            vec![
                MsgType::Beacon,
                MsgType::ShortBeacon,
                MsgType::Beacon,
                MsgType::ShortBeacon
            ]
        );

        match beacons.next(ADDR_SPACECRAFT, status()).unwrap() {
            AirFrame::Long(frame) => {
                assert_eq!(frame.destination, ADDR_BROADCAST);
                let record: StatusRecord = frame.record().unwrap();
                assert_eq!(record.sensors.battery_mv, 3900);
                assert_eq!(record.oper_time_s, 3600);
            }
            other => panic!("expected long beacon, got {:?}", other),
        }
        match beacons.next(ADDR_SPACECRAFT, status()).unwrap() {
            AirFrame::Short(short) => {
                // counts saturate in the short layout
                assert_eq!(short.received_count, 255);
                assert_eq!(short.pending_outbox_count, 4);
                assert_eq!(short.temp2, 11);
            }
            other => panic!("expected short beacon, got {:?}", other),
        }
    }
}
