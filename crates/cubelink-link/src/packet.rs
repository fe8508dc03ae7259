// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Fixed-layout wire records.
//!
//! Every record has a compile-time length and an explicit little-endian
//! layout. Encoding writes into caller-provided or stack buffers, decoding
//! checks structure only (lengths, declared sizes, enum bytes) and leaves
//! semantic validation to the consumer.

use std::{convert::TryFrom, fmt};

use crate::{DecodeError, TransportId};

pub const LINK_FRAME_LEN: usize = 240;
pub const LINK_HEADER_LEN: usize = 9;
pub const LINK_PAYLOAD_LEN: usize = LINK_FRAME_LEN - LINK_HEADER_LEN;

pub const SHORT_BEACON_LEN: usize = 12;
pub const DATE_TIME_LEN: usize = 4;

pub const CHUNK_LEN: usize = 230;
pub const CHUNK_HEADER_LEN: usize = 6;
pub const CHUNK_PAYLOAD_LEN: usize = CHUNK_LEN - CHUNK_HEADER_LEN;

pub const CHUNK_META_LEN: usize = 230;
pub const CHUNK_META_HEADER_LEN: usize = 2;
pub const CHUNK_META_PAYLOAD_LEN: usize = CHUNK_META_LEN - CHUNK_META_HEADER_LEN;

pub const COMMAND_LEN: usize = 230;
pub const COMMAND_HEADER_LEN: usize = 4;
pub const COMMAND_PAYLOAD_LEN: usize = COMMAND_LEN - COMMAND_HEADER_LEN;

pub const SETTING_LEN: usize = 12;
pub const KEY_LEN: usize = 3;

pub const RECEIVED_ENVELOPE_LEN: usize = LINK_FRAME_LEN + 9;

// offset of msg_type in both the long and the short layouts
const MSG_TYPE_OFFSET: usize = 2;

pub const ADDR_SPACECRAFT: u8 = 0xA0;
pub const ADDR_GROUND: u8 = 0xE0;
pub const ADDR_BROADCAST: u8 = 0xFF;
pub const ADDR_RANGING: u8 = 0x0A;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Beacon = 0x00,
    Echo = 0x01,
    Ack = 0x02,
    Range = 0x03,
    Rpi = 0x04,
    Text = 0x05,
    ShortBeacon = 0x06,
    Command = 0x07,
    Setting = 0x08,
    None = 0x09,
    Mv = 0x0A,
    LargeData = 0x0B,
    Ranging = 0x0C,
}

impl TryFrom<u8> for MsgType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => MsgType::Beacon,
            0x01 => MsgType::Echo,
            0x02 => MsgType::Ack,
            0x03 => MsgType::Range,
            0x04 => MsgType::Rpi,
            0x05 => MsgType::Text,
            0x06 => MsgType::ShortBeacon,
            0x07 => MsgType::Command,
            0x08 => MsgType::Setting,
            0x09 => MsgType::None,
            0x0A => MsgType::Mv,
            0x0B => MsgType::LargeData,
            0x0C => MsgType::Ranging,
            other => return Err(DecodeError::UnknownType(other)),
        })
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Command record `type` byte values.
pub mod cmd_type {
    pub const NONE: u8 = 0x00;
    pub const PARAM: u8 = 0x01;
    pub const BIN: u8 = 0x02;
    pub const STR: u8 = 0x03;
}

/// Chunk `chunk_type` / meta `meta_type` values.
pub mod ld_type {
    pub const OTHER: u8 = 0x00;
    pub const IMAGE: u8 = 0x01;
    pub const META: u8 = 0x14;
    pub const STARS: u8 = 0x15;
    pub const TEXT: u8 = 0x16;
}

/// A record with a fixed over-the-air byte layout.
pub trait WireRecord: Sized {
    const LEN: usize;

    /// Writes exactly `Self::LEN` bytes into `out[..Self::LEN]`.
    fn write_to(&self, out: &mut [u8]);

    /// Decodes a block which must be exactly `Self::LEN` bytes long.
    fn read_from(block: &[u8]) -> Result<Self, DecodeError>;
}

pub(crate) struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter { buf, pos: 0 }
    }

    pub(crate) fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub(crate) fn u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    pub(crate) fn i8(&mut self, value: i8) {
        self.put(&value.to_le_bytes());
    }

    pub(crate) fn u16(&mut self, value: u16) {
        self.put(&value.to_le_bytes());
    }

    pub(crate) fn i16(&mut self, value: i16) {
        self.put(&value.to_le_bytes());
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    pub(crate) fn i32(&mut self, value: i32) {
        self.put(&value.to_le_bytes());
    }

    pub(crate) fn f32(&mut self, value: f32) {
        self.put(&value.to_le_bytes());
    }
}

pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub(crate) fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub(crate) fn u8(&mut self) -> u8 {
        let value = self.buf[self.pos];
        self.pos += 1;
        value
    }

    pub(crate) fn i8(&mut self) -> i8 {
        i8::from_le_bytes(self.array())
    }

    pub(crate) fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    pub(crate) fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.array())
    }

    pub(crate) fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    pub(crate) fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.array())
    }

    pub(crate) fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.array())
    }
}

pub(crate) fn check_len(block: &[u8], expected: usize) -> Result<(), DecodeError> {
    if block.len() != expected {
        return Err(DecodeError::size_mismatch(expected, block.len()));
    }
    Ok(())
}

// The declared size must cover every non-zero payload byte; encoders
// zero-fill the remainder.
fn check_occupied(payload: &[u8], size: usize) -> Result<(), DecodeError> {
    if size > payload.len() {
        return Err(DecodeError::size_mismatch(payload.len(), size));
    }
    let occupied = payload.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
    if occupied > size {
        return Err(DecodeError::size_mismatch(size, occupied));
    }
    Ok(())
}

fn fill<const N: usize>(data: &[u8]) -> Result<[u8; N], DecodeError> {
    if data.len() > N {
        return Err(DecodeError::PayloadTooLarge {
            len: data.len(),
            max: N,
        });
    }
    let mut payload = [0u8; N];
    payload[..data.len()].copy_from_slice(data);
    Ok(payload)
}

fn read_bool(value: u8, field: &'static str) -> Result<bool, DecodeError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(DecodeError::InvalidField {
            field,
            value: other as u32,
        }),
    }
}

/// General purpose envelope for every message type except the short beacon.
#[derive(Clone, PartialEq, Eq)]
pub struct LinkFrame {
    pub local_address: u8,
    pub destination: u8,
    pub msg_type: MsgType,
    pub msg_index: u16,
    pub msg_time: u16,
    pub ack_requested: bool,
    msg_size: u8,
    payload: [u8; LINK_PAYLOAD_LEN],
}

impl LinkFrame {
    pub fn new(
        local_address: u8,
        destination: u8,
        msg_type: MsgType,
        data: &[u8],
    ) -> Result<Self, DecodeError> {
        Ok(LinkFrame {
            local_address,
            destination,
            msg_type,
            msg_index: 0,
            msg_time: 0,
            ack_requested: false,
            msg_size: data.len().min(LINK_PAYLOAD_LEN) as u8,
            payload: fill(data)?,
        })
    }

    /// Wraps a fixed-layout record as the frame payload.
    pub fn wrap<R: WireRecord>(
        local_address: u8,
        destination: u8,
        msg_type: MsgType,
        record: &R,
    ) -> Result<Self, DecodeError> {
        if R::LEN > LINK_PAYLOAD_LEN {
            return Err(DecodeError::PayloadTooLarge {
                len: R::LEN,
                max: LINK_PAYLOAD_LEN,
            });
        }
        let mut buf = [0u8; LINK_PAYLOAD_LEN];
        record.write_to(&mut buf[..R::LEN]);
        Self::new(local_address, destination, msg_type, &buf[..R::LEN])
    }

    /// Decodes the payload as a fixed-layout record.
    pub fn record<R: WireRecord>(&self) -> Result<R, DecodeError> {
        R::read_from(self.data())
    }

    pub fn data(&self) -> &[u8] {
        &self.payload[..self.msg_size as usize]
    }

    pub fn msg_size(&self) -> u8 {
        self.msg_size
    }

    pub fn to_bytes(&self) -> [u8; LINK_FRAME_LEN] {
        let mut out = [0u8; LINK_FRAME_LEN];
        self.write_to(&mut out);
        out
    }
}

impl WireRecord for LinkFrame {
    const LEN: usize = LINK_FRAME_LEN;

    fn write_to(&self, out: &mut [u8]) {
        let mut w = ByteWriter::new(out);
        w.u8(self.local_address);
        w.u8(self.destination);
        w.u8(self.msg_type as u8);
        w.u8(self.msg_size);
        w.u16(self.msg_index);
        w.u16(self.msg_time);
        w.u8(self.ack_requested as u8);
        w.put(&self.payload);
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        check_len(block, Self::LEN)?;
        let mut r = ByteReader::new(block);
        let local_address = r.u8();
        let destination = r.u8();
        let msg_type = MsgType::try_from(r.u8())?;
        let msg_size = r.u8();
        let msg_index = r.u16();
        let msg_time = r.u16();
        let ack_requested = read_bool(r.u8(), "ack_requested")?;
        let payload: [u8; LINK_PAYLOAD_LEN] = r.array();
        check_occupied(&payload, msg_size as usize)?;
        Ok(LinkFrame {
            local_address,
            destination,
            msg_type,
            msg_index,
            msg_time,
            ack_requested,
            msg_size,
            payload,
        })
    }
}

impl fmt::Debug for LinkFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LinkFrame({:02x}->{:02x} {} #{} t={} ack={} sz={} {})",
            self.local_address,
            self.destination,
            self.msg_type,
            self.msg_index,
            self.msg_time,
            self.ack_requested,
            self.msg_size,
            hex::encode(&self.data()[..self.data().len().min(16)]),
        )
    }
}

/// Minimal periodic status broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShortBeacon {
    pub local_address: u8,
    pub pending_outbox_count: u8,
    pub received_count: u8,
    pub msg_index: u16,
    pub battery_mv: u16,
    pub battery_ma: i16,
    pub temp1: i8,
    pub temp2: i8,
}

impl ShortBeacon {
    pub fn to_bytes(&self) -> [u8; SHORT_BEACON_LEN] {
        let mut out = [0u8; SHORT_BEACON_LEN];
        self.write_to(&mut out);
        out
    }
}

impl WireRecord for ShortBeacon {
    const LEN: usize = SHORT_BEACON_LEN;

    fn write_to(&self, out: &mut [u8]) {
        let mut w = ByteWriter::new(out);
        w.u8(self.local_address);
        w.u8(self.pending_outbox_count);
        w.u8(MsgType::ShortBeacon as u8);
        w.u8(self.received_count);
        w.u16(self.msg_index);
        w.u16(self.battery_mv);
        w.i16(self.battery_ma);
        w.i8(self.temp1);
        w.i8(self.temp2);
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        check_len(block, Self::LEN)?;
        let mut r = ByteReader::new(block);
        let local_address = r.u8();
        let pending_outbox_count = r.u8();
        let msg_type = r.u8();
        if msg_type != MsgType::ShortBeacon as u8 {
            return Err(DecodeError::InvalidField {
                field: "msg_type",
                value: msg_type as u32,
            });
        }
        Ok(ShortBeacon {
            local_address,
            pending_outbox_count,
            received_count: r.u8(),
            msg_index: r.u16(),
            battery_mv: r.u16(),
            battery_ma: r.i16(),
            temp1: r.i8(),
            temp2: r.i8(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateTime {
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
}

impl DateTime {
    /// True when every field is inside its calendar range.
    pub fn is_valid(&self) -> bool {
        (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour < 24
            && self.minute < 60
    }
}

impl WireRecord for DateTime {
    const LEN: usize = DATE_TIME_LEN;

    fn write_to(&self, out: &mut [u8]) {
        let mut w = ByteWriter::new(out);
        w.u8(self.month);
        w.u8(self.day);
        w.u8(self.hour);
        w.u8(self.minute);
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        check_len(block, Self::LEN)?;
        Ok(DateTime {
            month: block[0],
            day: block[1],
            hour: block[2],
            minute: block[3],
        })
    }
}

/// One addressable unit of a chunked transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    pub file_seq: u16,
    pub file_index: u16,
    pub chunk_type: u8,
    chunk_size: u8,
    payload: [u8; CHUNK_PAYLOAD_LEN],
}

impl Chunk {
    pub fn new(
        file_seq: u16,
        file_index: u16,
        chunk_type: u8,
        data: &[u8],
    ) -> Result<Self, DecodeError> {
        Ok(Chunk {
            file_seq,
            file_index,
            chunk_type,
            chunk_size: data.len().min(CHUNK_PAYLOAD_LEN) as u8,
            payload: fill(data)?,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.payload[..self.chunk_size as usize]
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chunk({}:{} type={:02x} sz={})",
            self.file_seq, self.file_index, self.chunk_type, self.chunk_size
        )
    }
}

impl WireRecord for Chunk {
    const LEN: usize = CHUNK_LEN;

    fn write_to(&self, out: &mut [u8]) {
        let mut w = ByteWriter::new(out);
        w.u16(self.file_seq);
        w.u16(self.file_index);
        w.u8(self.chunk_type);
        w.u8(self.chunk_size);
        w.put(&self.payload);
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        check_len(block, Self::LEN)?;
        let mut r = ByteReader::new(block);
        let file_seq = r.u16();
        let file_index = r.u16();
        let chunk_type = r.u8();
        let chunk_size = r.u8();
        let payload: [u8; CHUNK_PAYLOAD_LEN] = r.array();
        check_occupied(&payload, chunk_size as usize)?;
        Ok(Chunk {
            file_seq,
            file_index,
            chunk_type,
            chunk_size,
            payload,
        })
    }
}

/// Out-of-band descriptor accompanying a chunk series.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub meta_type: u8,
    meta_size: u8,
    payload: [u8; CHUNK_META_PAYLOAD_LEN],
}

impl ChunkMeta {
    pub fn new(meta_type: u8, data: &[u8]) -> Result<Self, DecodeError> {
        Ok(ChunkMeta {
            meta_type,
            meta_size: data.len().min(CHUNK_META_PAYLOAD_LEN) as u8,
            payload: fill(data)?,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.payload[..self.meta_size as usize]
    }
}

impl fmt::Debug for ChunkMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChunkMeta(type={:02x} {})",
            self.meta_type,
            hex::encode(self.data())
        )
    }
}

impl WireRecord for ChunkMeta {
    const LEN: usize = CHUNK_META_LEN;

    fn write_to(&self, out: &mut [u8]) {
        let mut w = ByteWriter::new(out);
        w.u8(self.meta_type);
        w.u8(self.meta_size);
        w.put(&self.payload);
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        check_len(block, Self::LEN)?;
        let mut r = ByteReader::new(block);
        let meta_type = r.u8();
        let meta_size = r.u8();
        let payload: [u8; CHUNK_META_PAYLOAD_LEN] = r.array();
        check_occupied(&payload, meta_size as usize)?;
        Ok(ChunkMeta {
            meta_type,
            meta_size,
            payload,
        })
    }
}

/// A ground-to-spacecraft command, or the status reply to one.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    pub code: u8,
    pub cmd_type: u8,
    pub checksum: u8,
    size: u8,
    payload: [u8; COMMAND_PAYLOAD_LEN],
}

impl Command {
    /// Builds a sealed command, the checksum covers code, type, size and data.
    pub fn new(code: u8, cmd_type: u8, data: &[u8]) -> Result<Self, DecodeError> {
        let mut command = Command {
            code,
            cmd_type,
            checksum: 0,
            size: data.len().min(COMMAND_PAYLOAD_LEN) as u8,
            payload: fill(data)?,
        };
        command.seal();
        Ok(command)
    }

    pub fn data(&self) -> &[u8] {
        &self.payload[..self.size as usize]
    }

    pub fn size(&self) -> u8 {
        self.size
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command(code={:02x} type={:02x} sz={} chk={:02x} {})",
            self.code,
            self.cmd_type,
            self.size,
            self.checksum,
            hex::encode(self.data())
        )
    }
}

impl WireRecord for Command {
    const LEN: usize = COMMAND_LEN;

    fn write_to(&self, out: &mut [u8]) {
        let mut w = ByteWriter::new(out);
        w.u8(self.code);
        w.u8(self.cmd_type);
        w.u8(self.size);
        w.u8(self.checksum);
        w.put(&self.payload);
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        check_len(block, Self::LEN)?;
        let mut r = ByteReader::new(block);
        let code = r.u8();
        let cmd_type = r.u8();
        let size = r.u8();
        let checksum = r.u8();
        let payload: [u8; COMMAND_PAYLOAD_LEN] = r.array();
        check_occupied(&payload, size as usize)?;
        Ok(Command {
            code,
            cmd_type,
            checksum,
            size,
            payload,
        })
    }
}

/// Persisted configuration snapshot, units are seconds unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub loop_runtime: u8,
    /// hours
    pub log_threshold: u8,
    pub sleep_delay_panic: u8,
    pub sleep_delay_normal: u8,
    pub beacon_threshold: u8,
    pub inter_beacon_delay: u8,
    pub save_to_flash: u8,
    /// count of meta records kept for beacons
    pub meta_history_depth: u8,
    pub key: [u8; KEY_LEN],
}

pub const DEFAULT_KEY: [u8; KEY_LEN] = *b"AAA";

impl Default for Setting {
    fn default() -> Self {
        Setting {
            loop_runtime: 20,
            log_threshold: 1,
            sleep_delay_panic: 45,
            sleep_delay_normal: 30,
            beacon_threshold: 55,
            inter_beacon_delay: 5,
            save_to_flash: 1,
            meta_history_depth: 10,
            key: DEFAULT_KEY,
        }
    }
}

impl Setting {
    /// Number of fields addressable by index (the key is not one of them).
    pub const FIELD_COUNT: u8 = 8;

    /// Returns a copy with one field replaced, or an error for a bad index.
    pub fn with_field(&self, index: u8, value: u8) -> Result<Setting, DecodeError> {
        let mut next = *self;
        match index {
            0 => next.loop_runtime = value,
            1 => next.log_threshold = value,
            2 => next.sleep_delay_panic = value,
            3 => next.sleep_delay_normal = value,
            4 => next.beacon_threshold = value,
            5 => next.inter_beacon_delay = value,
            6 => next.save_to_flash = value,
            7 => next.meta_history_depth = value,
            _ => {
                return Err(DecodeError::InvalidField {
                    field: "setting_index",
                    value: index as u32,
                })
            }
        }
        Ok(next)
    }

    /// Semantic check used on load and before committing a change.
    pub fn is_valid(&self, key: &[u8; KEY_LEN]) -> bool {
        self.loop_runtime > 0
            && self.beacon_threshold > 0
            && self.sleep_delay_panic > 0
            && self.sleep_delay_normal > 0
            && self.save_to_flash <= 1
            && &self.key == key
    }

    pub fn to_bytes(&self) -> [u8; SETTING_LEN] {
        let mut out = [0u8; SETTING_LEN];
        self.write_to(&mut out);
        out
    }
}

impl WireRecord for Setting {
    const LEN: usize = SETTING_LEN;

    fn write_to(&self, out: &mut [u8]) {
        let mut w = ByteWriter::new(out);
        w.u8(self.loop_runtime);
        w.u8(self.log_threshold);
        w.u8(self.sleep_delay_panic);
        w.u8(self.sleep_delay_normal);
        w.u8(self.beacon_threshold);
        w.u8(self.inter_beacon_delay);
        w.u8(self.save_to_flash);
        w.u8(self.meta_history_depth);
        w.put(&self.key);
        w.u8(0); // struct padding
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        check_len(block, Self::LEN)?;
        let mut r = ByteReader::new(block);
        Ok(Setting {
            loop_runtime: r.u8(),
            log_threshold: r.u8(),
            sleep_delay_panic: r.u8(),
            sleep_delay_normal: r.u8(),
            beacon_threshold: r.u8(),
            inter_beacon_delay: r.u8(),
            save_to_flash: r.u8(),
            meta_history_depth: r.u8(),
            key: r.array(),
        })
    }
}

/// A received frame wrapped with link-quality metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEnvelope {
    pub frame: LinkFrame,
    pub rssi: i32,
    pub snr: f32,
    pub transport: TransportId,
}

impl WireRecord for ReceivedEnvelope {
    const LEN: usize = RECEIVED_ENVELOPE_LEN;

    fn write_to(&self, out: &mut [u8]) {
        self.frame.write_to(&mut out[..LINK_FRAME_LEN]);
        let mut w = ByteWriter::new(&mut out[LINK_FRAME_LEN..]);
        w.i32(self.rssi);
        w.f32(self.snr);
        w.u8(self.transport as u8);
    }

    fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        check_len(block, Self::LEN)?;
        let frame = LinkFrame::read_from(&block[..LINK_FRAME_LEN])?;
        let mut r = ByteReader::new(&block[LINK_FRAME_LEN..]);
        Ok(ReceivedEnvelope {
            frame,
            rssi: r.i32(),
            snr: r.f32(),
            transport: TransportId::try_from(r.u8())?,
        })
    }
}

/// Anything that can be put on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AirFrame {
    Long(LinkFrame),
    Short(ShortBeacon),
}

impl AirFrame {
    /// Decodes a raw block received from a transport driver. The expected
    /// length follows from the message type byte, which sits at the same
    /// offset in both layouts.
    pub fn decode(block: &[u8]) -> Result<AirFrame, DecodeError> {
        if block.len() <= MSG_TYPE_OFFSET {
            return Err(DecodeError::size_mismatch(SHORT_BEACON_LEN, block.len()));
        }
        match MsgType::try_from(block[MSG_TYPE_OFFSET])? {
            MsgType::ShortBeacon => Ok(AirFrame::Short(ShortBeacon::read_from(block)?)),
            _ => Ok(AirFrame::Long(LinkFrame::read_from(block)?)),
        }
    }

    /// Encodes into `buf`, returns the number of bytes used.
    pub fn encode_into(&self, buf: &mut [u8; LINK_FRAME_LEN]) -> usize {
        match self {
            AirFrame::Long(frame) => {
                frame.write_to(buf);
                LINK_FRAME_LEN
            }
            AirFrame::Short(beacon) => {
                beacon.write_to(&mut buf[..SHORT_BEACON_LEN]);
                SHORT_BEACON_LEN
            }
        }
    }

    pub fn msg_type(&self) -> MsgType {
        match self {
            AirFrame::Long(frame) => frame.msg_type,
            AirFrame::Short(_) => MsgType::ShortBeacon,
        }
    }

    pub fn source(&self) -> u8 {
        match self {
            AirFrame::Long(frame) => frame.local_address,
            AirFrame::Short(beacon) => beacon.local_address,
        }
    }

    pub fn msg_index(&self) -> u16 {
        match self {
            AirFrame::Long(frame) => frame.msg_index,
            AirFrame::Short(beacon) => beacon.msg_index,
        }
    }
}
