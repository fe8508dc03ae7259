// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

use crate::{
    packet::{check_len, ByteReader, ByteWriter},
    DecodeError, LinkError, LinkResult, WireRecord,
};

pub const MODEM_PROFILE_LEN: usize = 24;

/// One physical radio transport.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportId {
    Lora433 = 0,
    Fsk433 = 1,
    Lora24 = 2,
}

impl TransportId {
    pub const ALL: [TransportId; 3] = [TransportId::Lora433, TransportId::Fsk433, TransportId::Lora24];
}

impl TryFrom<u8> for TransportId {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransportId::Lora433),
            1 => Ok(TransportId::Fsk433),
            2 => Ok(TransportId::Lora24),
            other => Err(DecodeError::InvalidField {
                field: "transport_id",
                value: other as u32,
            }),
        }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportId::Lora433 => "lora433",
            TransportId::Fsk433 => "fsk433",
            TransportId::Lora24 => "lora24",
        };
        write!(f, "{}", name)
    }
}

// Bandwidth table for the sub-GHz LoRa modem, indexed by the `bw` byte.
const LORA_433_BW_KHZ: [f64; 9] = [7.8, 10.4, 15.6, 20.8, 31.25, 41.7, 62.5, 125.0, 250.0];

// 2.4 GHz LoRa bandwidth register codes.
pub const LORA_24_BW_0200: u8 = 0x34;
pub const LORA_24_BW_0400: u8 = 0x26;
pub const LORA_24_BW_0800: u8 = 0x18;
pub const LORA_24_BW_1600: u8 = 0x0A;

/// Bandwidth in kHz for a 2.4 GHz LoRa bandwidth code.
pub fn lora24_bandwidth_khz(code: u8) -> Option<f64> {
    match code {
        LORA_24_BW_0200 => Some(203.125),
        LORA_24_BW_0400 => Some(406.25),
        LORA_24_BW_0800 => Some(812.5),
        LORA_24_BW_1600 => Some(1625.0),
        _ => None,
    }
}

/// 2.4 GHz spreading factor codes carry the SF in the high nibble.
pub fn lora24_spreading_factor(code: u8) -> Option<u8> {
    match code {
        0x50 | 0x60 | 0x70 | 0x80 | 0x90 | 0xA0 | 0xB0 | 0xC0 => Some(code >> 4),
        _ => None,
    }
}

/// Modulation parameters handed to a transport driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModemProfile {
    pub bw: u8,
    pub cr: u8,
    pub sf: u8,
    pub tx_power: i8,
    pub ldro: u8,
    pub preamble: u8,
    pub crc: u8,
    pub shaping: u8,
    pub sync_word: u32,
    pub frequency: u32,
    /// frequency offset, or deviation for FSK
    pub offset: i32,
    /// kbps, FSK only
    pub bit_rate: f32,
}

impl ModemProfile {
    pub fn default_for(id: TransportId) -> ModemProfile {
        match id {
            TransportId::Lora433 => ModemProfile {
                bw: 6,
                cr: 5,
                sf: 10,
                tx_power: 20,
                ldro: 0,
                preamble: 8,
                crc: 1,
                shaping: 0,
                sync_word: 0x2A,
                frequency: 437_250_000,
                offset: 0,
                bit_rate: 0.0,
            },
            TransportId::Fsk433 => ModemProfile {
                bw: 39,
                cr: 0,
                sf: 0,
                tx_power: 20,
                ldro: 0,
                preamble: 16,
                crc: 1,
                shaping: 2,
                sync_word: 0x2A,
                frequency: 437_250_000,
                offset: 5,
                bit_rate: 9.6,
            },
            TransportId::Lora24 => ModemProfile {
                bw: LORA_24_BW_0800,
                cr: 1,
                sf: 0xA0,
                tx_power: 13,
                ldro: 0,
                preamble: 12,
                crc: 1,
                shaping: 0,
                sync_word: 0x2A00_0000,
                frequency: 2_401_000_000,
                offset: 0,
                bit_rate: 0.0,
            },
        }
    }

    /// Bandwidth in kHz, where the transport has a LoRa bandwidth.
    pub fn bandwidth_khz(&self, id: TransportId) -> Option<f64> {
        match id {
            TransportId::Lora433 => LORA_433_BW_KHZ.get(self.bw as usize).copied(),
            TransportId::Fsk433 => Some(self.bw as f64),
            TransportId::Lora24 => lora24_bandwidth_khz(self.bw),
        }
    }

    pub fn validate(&self, id: TransportId) -> LinkResult<()> {
        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(LinkError::invalid_argument(format!(
                    "{} profile: bad {}",
                    id, what
                )))
            }
        };
        match id {
            TransportId::Lora433 => {
                check((self.bw as usize) < LORA_433_BW_KHZ.len(), "bandwidth")?;
                check((6..=12).contains(&self.sf), "spreading factor")?;
                check((5..=8).contains(&self.cr), "coding rate")?;
                check((2..=20).contains(&self.tx_power), "tx power")?;
                check(
                    (410_000_000..=525_000_000).contains(&self.frequency),
                    "frequency",
                )?;
            }
            TransportId::Fsk433 => {
                check(self.bw > 0, "bandwidth")?;
                check((-1..=20).contains(&self.tx_power), "tx power")?;
                check(self.shaping <= 3, "shaping")?;
                check(
                    self.bit_rate.is_finite() && self.bit_rate > 0.0 && self.bit_rate <= 300.0,
                    "bit rate",
                )?;
                check(
                    (410_000_000..=525_000_000).contains(&self.frequency),
                    "frequency",
                )?;
            }
            TransportId::Lora24 => {
                check(lora24_bandwidth_khz(self.bw).is_some(), "bandwidth")?;
                check(lora24_spreading_factor(self.sf).is_some(), "spreading factor")?;
                check((1..=7).contains(&self.cr), "coding rate")?;
                check((-18..=13).contains(&self.tx_power), "tx power")?;
                check(
                    (2_400_000_000..=2_500_000_000).contains(&self.frequency),
                    "frequency",
                )?;
            }
        }
        check(self.preamble > 0, "preamble")?;
        check(self.ldro <= 1 && self.crc <= 1, "flag")
    }

    /// Returns a validated copy with one field changed.
    pub fn apply(&self, id: TransportId, field: ModemField) -> LinkResult<ModemProfile> {
        let mut next = *self;
        match field {
            ModemField::Bandwidth(v) => next.bw = v,
            ModemField::CodingRate(v) => next.cr = v,
            ModemField::SpreadingFactor(v) => next.sf = v,
            ModemField::TxPower(v) => next.tx_power = v,
            ModemField::Ldro(v) => next.ldro = v,
            ModemField::Preamble(v) => next.preamble = v,
            ModemField::Crc(v) => next.crc = v,
            ModemField::Shaping(v) => next.shaping = v,
            ModemField::SyncWord(v) => next.sync_word = v,
            ModemField::Frequency(v) => next.frequency = v,
            ModemField::Offset(v) => next.offset = v,
            ModemField::BitRate(v) => next.bit_rate = v,
        }
        next.validate(id)?;
        Ok(next)
    }

    pub fn to_bytes(&self) -> [u8; MODEM_PROFILE_LEN] {
        let mut out = [0u8; MODEM_PROFILE_LEN];
        self.write_to(&mut out);
        out
    }
}

impl WireRecord for ModemProfile {
    const LEN: usize = MODEM_PROFILE_LEN;

    fn write_to(&self, out: &mut [u8]) {
        let mut w = ByteWriter::new(out);
        w.u8(self.bw);
        w.u8(self.cr);
        w.u8(self.sf);
        w.i8(self.tx_power);
        w.u8(self.ldro);
        w.u8(self.preamble);
        w.u8(self.crc);
        w.u8(self.shaping);
        w.u32(self.sync_word);
        w.u32(self.frequency);
        w.i32(self.offset);
        w.f32(self.bit_rate);
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        check_len(block, Self::LEN)?;
        let mut r = ByteReader::new(block);
        Ok(ModemProfile {
            bw: r.u8(),
            cr: r.u8(),
            sf: r.u8(),
            tx_power: r.i8(),
            ldro: r.u8(),
            preamble: r.u8(),
            crc: r.u8(),
            shaping: r.u8(),
            sync_word: r.u32(),
            frequency: r.u32(),
            offset: r.i32(),
            bit_rate: r.f32(),
        })
    }
}

/// Which profile field a single-field command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bandwidth,
    CodingRate,
    SpreadingFactor,
    TxPower,
    Ldro,
    Preamble,
    Crc,
    Shaping,
    SyncWord,
    Frequency,
    Offset,
    BitRate,
}

impl FieldKind {
    /// Encoded width of the value on the wire.
    pub fn width(self) -> usize {
        match self {
            FieldKind::SyncWord | FieldKind::Frequency | FieldKind::Offset | FieldKind::BitRate => 4,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModemField {
    Bandwidth(u8),
    CodingRate(u8),
    SpreadingFactor(u8),
    TxPower(i8),
    Ldro(u8),
    Preamble(u8),
    Crc(u8),
    Shaping(u8),
    SyncWord(u32),
    Frequency(u32),
    Offset(i32),
    BitRate(f32),
}

impl ModemField {
    /// Parses a little-endian field value of exactly `kind.width()` bytes.
    pub fn parse(kind: FieldKind, data: &[u8]) -> Result<ModemField, DecodeError> {
        check_len(data, kind.width())?;
        let mut r = ByteReader::new(data);
        Ok(match kind {
            FieldKind::Bandwidth => ModemField::Bandwidth(r.u8()),
            FieldKind::CodingRate => ModemField::CodingRate(r.u8()),
            FieldKind::SpreadingFactor => ModemField::SpreadingFactor(r.u8()),
            FieldKind::TxPower => ModemField::TxPower(r.i8()),
            FieldKind::Ldro => ModemField::Ldro(r.u8()),
            FieldKind::Preamble => ModemField::Preamble(r.u8()),
            FieldKind::Crc => ModemField::Crc(r.u8()),
            FieldKind::Shaping => ModemField::Shaping(r.u8()),
            FieldKind::SyncWord => ModemField::SyncWord(r.u32()),
            FieldKind::Frequency => ModemField::Frequency(r.u32()),
            FieldKind::Offset => ModemField::Offset(r.i32()),
            FieldKind::BitRate => ModemField::BitRate(r.f32()),
        })
    }
}

/// The current profile of every transport slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ModemProfiles {
    profiles: [ModemProfile; 3],
}

impl Default for ModemProfiles {
    fn default() -> Self {
        ModemProfiles {
            profiles: TransportId::ALL.map(ModemProfile::default_for),
        }
    }
}

impl ModemProfiles {
    pub fn get(&self, id: TransportId) -> &ModemProfile {
        &self.profiles[id as usize]
    }

    /// Validates and swaps in a whole profile.
    pub fn commit(&mut self, id: TransportId, profile: ModemProfile) -> LinkResult<()> {
        profile.validate(id)?;
        debug!("{}: profile committed: {:?}", id, profile);
        self.profiles[id as usize] = profile;
        Ok(())
    }

    pub fn apply(&mut self, id: TransportId, field: ModemField) -> LinkResult<()> {
        let next = self.get(id).apply(id, field)?;
        self.commit(id, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        for id in TransportId::ALL {
            ModemProfile::default_for(id).validate(id).unwrap();
        }
    }

    #[test]
    fn test_profile_layout() {
        let bytes = ModemProfile::default_for(TransportId::Lora24).to_bytes();
        assert_eq!(
            hex::encode(bytes),
            "1801a00d000c0100\
             0000002a\
             405a1c8f\
             00000000\
             00000000"
        );
        assert_eq!(
            ModemProfile::read_from(&bytes).unwrap(),
            ModemProfile::default_for(TransportId::Lora24)
        );
    }

    #[test]
    fn test_apply_validates_copy() {
        let mut profiles = ModemProfiles::default();
        profiles
            .apply(TransportId::Lora433, ModemField::SpreadingFactor(12))
            .unwrap();
        assert_eq!(profiles.get(TransportId::Lora433).sf, 12);

        let before = profiles.clone();
        assert!(profiles
            .apply(TransportId::Lora433, ModemField::SpreadingFactor(13))
            .is_err());
        assert_eq!(profiles, before);

        assert!(profiles
            .apply(TransportId::Lora24, ModemField::Bandwidth(0x11))
            .is_err());
        profiles
            .apply(TransportId::Lora24, ModemField::Bandwidth(LORA_24_BW_0400))
            .unwrap();
    }

    #[test]
    fn test_field_parse() {
        assert_eq!(
            ModemField::parse(FieldKind::Frequency, &437_000_000u32.to_le_bytes()).unwrap(),
            ModemField::Frequency(437_000_000)
        );
        assert_eq!(
            ModemField::parse(FieldKind::TxPower, &[0xF6]).unwrap(),
            ModemField::TxPower(-10)
        );
        assert!(ModemField::parse(FieldKind::SyncWord, &[1, 2]).is_err());
    }

    #[test]
    fn test_bandwidths() {
        let lora = ModemProfile::default_for(TransportId::Lora433);
        assert_eq!(lora.bandwidth_khz(TransportId::Lora433), Some(62.5));
        assert_eq!(lora24_bandwidth_khz(LORA_24_BW_0400), Some(406.25));
        assert_eq!(lora24_spreading_factor(0xA0), Some(10));
        assert_eq!(lora24_spreading_factor(0xA1), None);
    }

    #[test]
    fn test_transport_id() {
        assert_eq!(TransportId::try_from(2).unwrap(), TransportId::Lora24);
        assert!(TransportId::try_from(3).is_err());
        assert_eq!(TransportId::Fsk433.to_string(), "fsk433");
    }
}
