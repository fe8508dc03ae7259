// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Command dispatch.
//!
//! A command frame is validated, executed against the station state and
//! answered with exactly one Ack frame whose payload is a status Command
//! carrying `[command_code, data...]`. Every effect is computed on a copy
//! and only committed once it validates.

use log::*;
use sha2::{Digest, Sha256};

use cubelink_link::{
    cmd_type, Command, DateTime, FieldKind, LinkFrame, ModemField, ModemProfile, MsgType,
    Setting, TrafficClass, TransportId, WireRecord, ADDR_BROADCAST, COMMAND_PAYLOAD_LEN,
};

use crate::{
    storage::{self, FILE_LOG, FOLDER_OUTBOX, FOLDER_SENT},
    Action, BlinkTarget, LruCache, StationError, StationResult, Subsystem, SystemState,
};

pub mod codes {
    pub const CMD_COMPLETED: u8 = 0x00;
    pub const CMD_ERROR: u8 = 0xE0;
    pub const MSG_CHKSUM_ERR: u8 = 0xE1;

    pub const CPU_RESTART: u8 = 0x01;
    pub const RST_GPS: u8 = 0x02;
    pub const RST_MPU: u8 = 0x03;
    pub const RST_SETTING: u8 = 0x04;
    pub const RST_OUTBOX: u8 = 0x05;
    pub const RST_SENT: u8 = 0x06;
    pub const RST_SD_CARD: u8 = 0x07;
    pub const RST_OPER_TIME: u8 = 0x08;
    pub const RST_FULL: u8 = 0x09;
    pub const STRT_BLINK: u8 = 0x0A;
    pub const STRT_BLINK_X_MNT: u8 = 0x0B;
    pub const SEND_BEACON_433: u8 = 0x0C;
    pub const SEND_BEACON_24: u8 = 0x0D;
    pub const GET_LOG_LN: u8 = 0x0E;
    pub const ECHO_MESSAGE: u8 = 0x0F;
    pub const FAT_ON_OFF: u8 = 0x10;
    pub const CHG_SETTING: u8 = 0x11;
    pub const GET_SETTING: u8 = 0x12;
    pub const CHG_GLB_SET: u8 = 0x13;
    pub const STOP_TX: u8 = 0x14;
    pub const RESUME_TX: u8 = 0x15;
    pub const DEPLOY_ANT: u8 = 0x16;
    pub const STRT_BLINK_LED_LSR: u8 = 0x17;
    pub const GET_META: u8 = 0x18;
    pub const GET_FILE_PART: u8 = 0x19;
    pub const GET_FILE: u8 = 0x1A;
    pub const GET_LAST_FILE: u8 = 0x1B;
    pub const GET_OUTBOX: u8 = 0x1C;
    pub const GET_SENT: u8 = 0x1D;
    pub const SET_LORA_433_BSCP: u8 = 0x1F;
    pub const SET_LORA_24_BSCP: u8 = 0x20;
    pub const RANGING_SLAVE_24: u8 = 0x21;
    pub const STRT_BLINK_LSR: u8 = 0x22;
    pub const STRT_BLINK_LSR_X_MNT: u8 = 0x23;
    pub const RANGING_RUN: u8 = 0x24;
    pub const ECHO_MESSAGE_X_MNT: u8 = 0x25;
    pub const RANGING_CALIB: u8 = 0x26;
    pub const SET_DATE_TIME: u8 = 0x27;
    pub const RST_DATE_TIME: u8 = 0x28;
    pub const SEND_BEACON_FSK: u8 = 0x29;

    pub const SET_LORA_433_BW: u8 = 0x2A;
    pub const SET_LORA_433_SF: u8 = 0x2B;
    pub const SET_LORA_433_CR: u8 = 0x2C;
    pub const SET_LORA_433_PM: u8 = 0x2D;
    pub const SET_LORA_433_PL: u8 = 0x2E;
    pub const SET_LORA_433_LDRO: u8 = 0x2F;
    pub const SET_LORA_433_CRC: u8 = 0x30;
    pub const SET_LORA_433_SW: u8 = 0x3A;
    pub const SET_LORA_433_OFFSET: u8 = 0x3D;
    pub const SET_LORA_433_FREQUENCY: u8 = 0x3F;

    pub const SET_FSK_433_BW: u8 = 0x31;
    pub const SET_FSK_433_SF: u8 = 0x32;
    pub const SET_FSK_433_CR: u8 = 0x33;
    pub const SET_FSK_433_PM: u8 = 0x34;
    pub const SET_FSK_433_PL: u8 = 0x35;
    pub const SET_FSK_433_LDRO: u8 = 0x36;
    pub const SET_FSK_433_CRC: u8 = 0x37;
    pub const SET_FSK_433_DS: u8 = 0x38;
    pub const SET_FSK_433_BR: u8 = 0x39;
    pub const SET_FSK_433_SW: u8 = 0x3B;
    pub const SET_FSK_433_DEVIATION: u8 = 0x3C;
    pub const SET_FSK_433_FREQUENCY: u8 = 0x3E;

    pub const SET_LORA_433_STRUCT: u8 = 0x40;
    pub const SET_FSK_433_STRUCT: u8 = 0x41;
    pub const SET_LORA_24_STRUCT: u8 = 0x42;

    pub const SET_LORA_24_BW: u8 = 0x43;
    pub const SET_LORA_24_SF: u8 = 0x44;
    pub const SET_LORA_24_CR: u8 = 0x45;
    pub const SET_LORA_24_PM: u8 = 0x46;
    pub const SET_LORA_24_PL: u8 = 0x47;
    pub const SET_LORA_24_SW: u8 = 0x48;
    pub const SET_LORA_24_LDRO: u8 = 0x49;
    pub const SET_LORA_24_CRC: u8 = 0x4A;
    pub const SET_LORA_24_OFFSET: u8 = 0x4B;
    pub const SET_LORA_24_FREQUENCY: u8 = 0x4C;

    pub const SET_SAVE_TO_FLASH: u8 = 0x4D;
    pub const GET_OUTBOX_FS: u8 = 0x4E;
    pub const GET_SENT_FS: u8 = 0x4F;
    pub const SWITCH_MODEM: u8 = 0x50;
    pub const RST_TRANSFER: u8 = 0x51;
    pub const RST_RANGING: u8 = 0x52;
    pub const RPI_COMMAND: u8 = 0x55;
    pub const RPI_COMMAND_X_MNT: u8 = 0x56;
    pub const RST_FS: u8 = 0x60;
    pub const RST_OPER_TIME_FS: u8 = 0x61;
}

use codes::*;

// reply data after the echoed command code
const REPLY_DATA_LEN: usize = COMMAND_PAYLOAD_LEN - 1;
// indices per GET_FILE_PART after the u16 sequence number
pub const MAX_PART_INDICES: usize = (COMMAND_PAYLOAD_LEN - 2) / 2;
const MINUTE_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    AwaitingFrame,
    Validating,
    Executing,
    RepliedOk,
    RepliedError,
}

/// Work scheduled by the `_X_MNT` command variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    Echo { to: u8, text: Vec<u8> },
    Blink(BlinkTarget),
    Payload(Vec<u8>),
}

#[derive(Debug)]
pub struct Dispatcher {
    state: DispatchState,
    last_outcome: Option<(u8, DispatchState)>,
    // replies by (sender, msg_index), re-sent for retransmissions of the
    // same content
    replies: LruCache<(u8, u16), (Fingerprint, LinkFrame)>,
}

impl Dispatcher {
    pub fn new(dedup_window: usize) -> Self {
        Dispatcher {
            state: DispatchState::AwaitingFrame,
            last_outcome: None,
            replies: LruCache::new(dedup_window),
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Code and final state of the last handled command.
    pub fn last_outcome(&self) -> Option<(u8, DispatchState)> {
        self.last_outcome
    }

    fn transition(&mut self, next: DispatchState) {
        trace!("dispatch {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn finish(&mut self, code: u8, outcome: DispatchState) {
        self.transition(outcome);
        self.last_outcome = Some((code, outcome));
        self.transition(DispatchState::AwaitingFrame);
    }
}

/// Content identity of a frame, independent of where it was heard.
pub type Fingerprint = [u8; 8];

/// First eight bytes of a SHA-256 over type, send time and payload. A peer
/// that restarted reuses msg_index values, this tells its frames apart.
pub fn fingerprint(frame: &LinkFrame) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update([frame.msg_type as u8]);
    hasher.update(frame.msg_time.to_le_bytes());
    hasher.update(frame.data());
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

// control slots a command needs for its reply, plus one kept for RESUME_TX
// while transmission is stopped
fn reply_slots(code: u8, suppressed: bool) -> usize {
    1 + usize::from(code == ECHO_MESSAGE) + usize::from(suppressed && code != RESUME_TX)
}

/// Builds a sealed status reply.
pub fn reply_command(status: u8, code: u8, data: &[u8]) -> StationResult<Command> {
    let mut payload = Vec::with_capacity(1 + data.len());
    payload.push(code);
    payload.extend_from_slice(&data[..data.len().min(REPLY_DATA_LEN)]);
    Ok(Command::new(status, cmd_type::BIN, &payload)?)
}

/// Handles one command frame. Returns the reply to queue, or `None` when
/// the frame is not for us, is not a command at all, or its reply would not
/// fit the control queue.
pub fn dispatch(state: &mut SystemState, frame: &LinkFrame, now: u64) -> Option<LinkFrame> {
    let local = state.config.local_address;
    if frame.destination != local && frame.destination != ADDR_BROADCAST {
        debug!(
            "command for 0x{:02x} ignored, we are 0x{:02x}",
            frame.destination, local
        );
        return None;
    }
    let key = (frame.local_address, frame.msg_index);
    let print = fingerprint(frame);
    match state.dispatcher.replies.get(&key) {
        Some((seen, reply)) if *seen == print => {
            info!(
                "retransmitted command #{} from 0x{:02x}, resending reply",
                frame.msg_index, frame.local_address
            );
            return Some(reply.clone());
        }
        Some(_) => info!(
            "command #{} from 0x{:02x} differs from the cached one, peer restarted",
            frame.msg_index, frame.local_address
        ),
        None => {}
    }

    state.dispatcher.transition(DispatchState::Validating);
    let command: Command = match frame.record() {
        Ok(command) => command,
        Err(err) => {
            warn!("undecodable command from 0x{:02x}: {}", frame.local_address, err);
            state.dispatcher.transition(DispatchState::AwaitingFrame);
            return None;
        }
    };

    let code = command.code;
    let needed = reply_slots(code, state.arbiter.is_suppressed());
    let room = state.arbiter.room(TrafficClass::Control);
    if room < needed {
        // left unexecuted, the sender's retransmission gets another try
        warn!(
            "command 0x{:02x} #{} from 0x{:02x} not run, {} control slots free, {} needed",
            code, frame.msg_index, frame.local_address, room, needed
        );
        state.dispatcher.transition(DispatchState::AwaitingFrame);
        return None;
    }

    let reply = if !command.validate() {
        warn!(
            "command 0x{:02x}: checksum 0x{:02x}, expected 0x{:02x}",
            code,
            command.checksum,
            command.compute_checksum()
        );
        state.dispatcher.finish(code, DispatchState::RepliedError);
        reply_command(MSG_CHKSUM_ERR, code, &[])
    } else {
        state.dispatcher.transition(DispatchState::Executing);
        match execute(state, &command, frame.local_address, now) {
            Ok(data) => {
                debug!("command 0x{:02x} completed", code);
                state.dispatcher.finish(code, DispatchState::RepliedOk);
                reply_command(CMD_COMPLETED, code, &data)
            }
            Err(err) => {
                warn!("command 0x{:02x} failed: {}", code, err);
                state.dispatcher.finish(code, DispatchState::RepliedError);
                reply_command(CMD_ERROR, code, &[])
            }
        }
    };

    let reply = reply.and_then(|reply| {
        Ok(LinkFrame::wrap(
            local,
            frame.local_address,
            MsgType::Ack,
            &reply,
        )?)
    });
    match reply {
        Ok(reply) => {
            state.dispatcher.replies.insert(key, (print, reply.clone()));
            Some(reply)
        }
        Err(err) => {
            error!("command 0x{:02x}: reply not built: {}", code, err);
            None
        }
    }
}

fn expect_len(command: &Command, len: usize) -> StationResult<&[u8]> {
    let data = command.data();
    if data.len() != len {
        return Err(StationError::dispatch(format!(
            "command 0x{:02x} takes {} bytes, got {}",
            command.code,
            len,
            data.len()
        )));
    }
    Ok(data)
}

fn u16_at(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn flag(value: u8, what: &str) -> StationResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StationError::dispatch(format!("bad {}: {}", what, other))),
    }
}

/// Transport and field addressed by a single-field modem command.
fn modem_field(code: u8) -> Option<(TransportId, FieldKind)> {
    use FieldKind::*;
    use TransportId::*;
    let target = match code {
        SET_LORA_433_BW => (Lora433, Bandwidth),
        SET_LORA_433_SF => (Lora433, SpreadingFactor),
        SET_LORA_433_CR => (Lora433, CodingRate),
        SET_LORA_433_PM => (Lora433, TxPower),
        SET_LORA_433_PL => (Lora433, Preamble),
        SET_LORA_433_LDRO => (Lora433, Ldro),
        SET_LORA_433_CRC => (Lora433, Crc),
        SET_LORA_433_SW => (Lora433, SyncWord),
        SET_LORA_433_OFFSET => (Lora433, Offset),
        SET_LORA_433_FREQUENCY => (Lora433, Frequency),

        SET_FSK_433_BW => (Fsk433, Bandwidth),
        SET_FSK_433_SF => (Fsk433, SpreadingFactor),
        SET_FSK_433_CR => (Fsk433, CodingRate),
        SET_FSK_433_PM => (Fsk433, TxPower),
        SET_FSK_433_PL => (Fsk433, Preamble),
        SET_FSK_433_LDRO => (Fsk433, Ldro),
        SET_FSK_433_CRC => (Fsk433, Crc),
        SET_FSK_433_DS => (Fsk433, Shaping),
        SET_FSK_433_BR => (Fsk433, BitRate),
        SET_FSK_433_SW => (Fsk433, SyncWord),
        SET_FSK_433_DEVIATION => (Fsk433, Offset),
        SET_FSK_433_FREQUENCY => (Fsk433, Frequency),

        SET_LORA_24_BW => (Lora24, Bandwidth),
        SET_LORA_24_SF => (Lora24, SpreadingFactor),
        SET_LORA_24_CR => (Lora24, CodingRate),
        SET_LORA_24_PM => (Lora24, TxPower),
        SET_LORA_24_PL => (Lora24, Preamble),
        SET_LORA_24_SW => (Lora24, SyncWord),
        SET_LORA_24_LDRO => (Lora24, Ldro),
        SET_LORA_24_CRC => (Lora24, Crc),
        SET_LORA_24_OFFSET => (Lora24, Offset),
        SET_LORA_24_FREQUENCY => (Lora24, Frequency),
        _ => return None,
    };
    Some(target)
}

/// Runs the effect of a validated command, returns the reply data.
fn execute(
    state: &mut SystemState,
    command: &Command,
    sender: u8,
    now: u64,
) -> StationResult<Vec<u8>> {
    let code = command.code;
    if let Some((id, kind)) = modem_field(code) {
        let field = ModemField::parse(kind, expect_len(command, kind.width())?)?;
        let next = state.profiles.get(id).apply(id, field)?;
        state.commit_profile(id, next)?;
        return Ok(Vec::new());
    }

    match code {
        CPU_RESTART => {
            expect_len(command, 0)?;
            state.actions.push(Action::Restart);
        }
        RST_GPS | RST_MPU => {
            expect_len(command, 0)?;
            let subsystem = if code == RST_GPS {
                Subsystem::Gps
            } else {
                Subsystem::Mpu
            };
            state.actions.push(Action::ResetSubsystem(subsystem));
        }
        RST_SETTING => {
            expect_len(command, 0)?;
            state.settings.reset(state.storage.as_mut())?;
            state.apply_setting(now);
        }
        RST_OUTBOX | RST_SENT => {
            expect_len(command, 0)?;
            let folder = if code == RST_OUTBOX {
                FOLDER_OUTBOX
            } else {
                FOLDER_SENT
            };
            state.storage.remove_folder(folder)?;
        }
        RST_SD_CARD | RST_FS => {
            expect_len(command, 0)?;
            state.storage.wipe()?;
            // the live Setting survives a wipe
            state.settings.save(state.storage.as_mut())?;
        }
        RST_OPER_TIME | RST_OPER_TIME_FS => {
            expect_len(command, 0)?;
            state.oper_ms = 0;
            state.save_oper_time()?;
        }
        RST_FULL => {
            expect_len(command, 0)?;
            state.storage.wipe()?;
            state.settings.reset(state.storage.as_mut())?;
            state.apply_setting(now);
            state.oper_ms = 0;
            state.save_oper_time()?;
        }
        STRT_BLINK | STRT_BLINK_LED_LSR | STRT_BLINK_LSR => {
            expect_len(command, 0)?;
            let target = match code {
                STRT_BLINK => BlinkTarget::Led,
                STRT_BLINK_LSR => BlinkTarget::Laser,
                _ => BlinkTarget::Both,
            };
            state.actions.push(Action::Blink(target));
        }
        STRT_BLINK_X_MNT | STRT_BLINK_LSR_X_MNT => {
            let minutes = expect_len(command, 1)?[0];
            let target = if code == STRT_BLINK_X_MNT {
                BlinkTarget::Led
            } else {
                BlinkTarget::Laser
            };
            state.defer(now, minutes, Deferred::Blink(target));
        }
        SEND_BEACON_433 | SEND_BEACON_24 | SEND_BEACON_FSK => {
            expect_len(command, 0)?;
            let id = match code {
                SEND_BEACON_433 => TransportId::Lora433,
                SEND_BEACON_24 => TransportId::Lora24,
                _ => TransportId::Fsk433,
            };
            state.queue_long_beacon(id, now)?;
        }
        GET_LOG_LN => {
            expect_len(command, 0)?;
            let log = state.storage.read(FILE_LOG)?.unwrap_or_default();
            let line = log.split(|&b| b == b'\n').next().unwrap_or_default();
            return Ok(line.to_vec());
        }
        ECHO_MESSAGE => {
            state.echo(sender, command.data())?;
        }
        ECHO_MESSAGE_X_MNT => {
            let data = command.data();
            if data.is_empty() {
                return Err(StationError::dispatch("echo delay missing"));
            }
            state.defer(
                now,
                data[0],
                Deferred::Echo {
                    to: sender,
                    text: data[1..].to_vec(),
                },
            );
        }
        FAT_ON_OFF => {
            let data = expect_len(command, 2)?;
            let on = flag(data[1], "power state")?;
            state.actions.push(Action::Power {
                module: data[0],
                on,
            });
        }
        CHG_SETTING => {
            let data = expect_len(command, 2)?;
            state
                .settings
                .set_field(state.storage.as_mut(), data[0], data[1])?;
            state.apply_setting(now);
        }
        GET_SETTING => {
            expect_len(command, 0)?;
            return Ok(state.settings.current().to_bytes().to_vec());
        }
        CHG_GLB_SET => {
            let setting = Setting::read_from(command.data())?;
            state.settings.replace(state.storage.as_mut(), setting)?;
            state.apply_setting(now);
        }
        STOP_TX => {
            expect_len(command, 0)?;
            state.arbiter.stop_tx(now);
        }
        RESUME_TX => {
            expect_len(command, 0)?;
            state.arbiter.resume_tx();
        }
        DEPLOY_ANT => {
            expect_len(command, 0)?;
            state.actions.push(Action::DeployAntenna);
        }
        GET_META => {
            let file_seq = u16_at(expect_len(command, 2)?, 0);
            state.ensure_loaded(file_seq)?;
            state.transfer.queue_meta(file_seq)?;
        }
        GET_FILE_PART => {
            let data = command.data();
            if data.len() < 4 || data.len() % 2 != 0 {
                return Err(StationError::dispatch(format!(
                    "bad file part request of {} bytes",
                    data.len()
                )));
            }
            let file_seq = u16_at(data, 0);
            let indices: Vec<u16> = (2..data.len()).step_by(2).map(|at| u16_at(data, at)).collect();
            state.ensure_loaded(file_seq)?;
            let queued = state.transfer.resend(file_seq, &indices)?;
            return Ok((queued as u16).to_le_bytes().to_vec());
        }
        GET_FILE => {
            let file_seq = u16_at(expect_len(command, 2)?, 0);
            let file = storage::find_file(state.storage.as_ref(), file_seq)?
                .ok_or_else(|| StationError::dispatch(format!("no file {}", file_seq)))?;
            state
                .transfer
                .begin_transfer(file.file_seq, file.data, file.kind)?;
        }
        GET_LAST_FILE => {
            expect_len(command, 0)?;
            let file = storage::last_outbox_file(state.storage.as_ref())?
                .ok_or_else(|| StationError::dispatch("outbox is empty"))?;
            state
                .transfer
                .begin_transfer(file.file_seq, file.data, file.kind)?;
            return Ok(file.file_seq.to_le_bytes().to_vec());
        }
        GET_OUTBOX | GET_OUTBOX_FS | GET_SENT | GET_SENT_FS => {
            expect_len(command, 0)?;
            let folder = if matches!(code, GET_OUTBOX | GET_OUTBOX_FS) {
                FOLDER_OUTBOX
            } else {
                FOLDER_SENT
            };
            return Ok(listing(&state.storage.list(folder)?));
        }
        SET_LORA_433_BSCP | SET_LORA_24_BSCP => {
            let data = expect_len(command, 4)?;
            let id = if code == SET_LORA_433_BSCP {
                TransportId::Lora433
            } else {
                TransportId::Lora24
            };
            let next = ModemProfile {
                bw: data[0],
                sf: data[1],
                cr: data[2],
                tx_power: data[3] as i8,
                ..*state.profiles.get(id)
            };
            state.commit_profile(id, next)?;
        }
        SET_LORA_433_STRUCT | SET_FSK_433_STRUCT | SET_LORA_24_STRUCT => {
            let id = match code {
                SET_LORA_433_STRUCT => TransportId::Lora433,
                SET_FSK_433_STRUCT => TransportId::Fsk433,
                _ => TransportId::Lora24,
            };
            let profile = ModemProfile::read_from(command.data())?;
            state.commit_profile(id, profile)?;
        }
        RANGING_SLAVE_24 => {
            let secs = expect_len(command, 1)?[0];
            let window_ms = if secs == 0 {
                state.ranging.config().slave_window_ms
            } else {
                secs as u64 * 1000
            };
            state.ranging.start_slave(now, window_ms)?;
        }
        RANGING_RUN => {
            expect_len(command, 0)?;
            state.ranging.start(now)?;
            state.ranging_requester = Some(sender);
        }
        RANGING_CALIB => {
            let value = u16_at(expect_len(command, 2)?, 0);
            state.ranging.config_mut().set_calibration(value as i32);
        }
        SET_DATE_TIME => {
            let dt = DateTime::read_from(command.data())?;
            if !dt.is_valid() {
                return Err(StationError::dispatch(format!("invalid date/time {:?}", dt)));
            }
            state.clock.set(dt, now)?;
        }
        RST_DATE_TIME => {
            expect_len(command, 0)?;
            state.clock.reset();
        }
        SET_SAVE_TO_FLASH => {
            let value = expect_len(command, 1)?[0];
            flag(value, "save_to_flash")?;
            state
                .settings
                .set_field(state.storage.as_mut(), 6, value)?;
        }
        SWITCH_MODEM => {
            let data = expect_len(command, 2)?;
            let id = TransportId::try_from(data[0])?;
            let manual = flag(data[1], "override")?;
            if !manual {
                state.arbiter.clear_override();
            }
            state.arbiter.select(id, now, manual);
        }
        RST_TRANSFER => {
            let file_seq = u16_at(expect_len(command, 2)?, 0);
            let found = state.transfer.abort(file_seq);
            return Ok(vec![found as u8]);
        }
        RST_RANGING => {
            expect_len(command, 0)?;
            let was_active = state.ranging.abort();
            state.arbiter.clear_ranging();
            state.ranging_requester = None;
            return Ok(vec![was_active as u8]);
        }
        RPI_COMMAND => {
            state.actions.push(Action::Payload(command.data().to_vec()));
        }
        RPI_COMMAND_X_MNT => {
            let data = command.data();
            if data.is_empty() {
                return Err(StationError::dispatch("payload delay missing"));
            }
            state.defer(now, data[0], Deferred::Payload(data[1..].to_vec()));
        }
        other => {
            return Err(StationError::dispatch(format!(
                "unknown command 0x{:02x}",
                other
            )))
        }
    }
    Ok(Vec::new())
}

// file names separated by ';', cut at a name boundary
fn listing(names: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        let extra = name.len() + usize::from(!out.is_empty());
        if out.len() + extra > REPLY_DATA_LEN {
            break;
        }
        if !out.is_empty() {
            out.push(b';');
        }
        out.extend_from_slice(name.as_bytes());
    }
    out
}

/// Minutes until a deferred task runs, zero runs it on the next tick.
pub(crate) fn defer_delay_ms(minutes: u8) -> u64 {
    minutes as u64 * MINUTE_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemStorage, StationConfig};
    use cubelink_link::{
        ld_type, BulkSource, Chunk, ChunkMeta, TrafficClass, ADDR_GROUND, ADDR_SPACECRAFT,
        DEFAULT_KEY, SETTING_LEN,
    };
    use once_cell::sync::Lazy;
    use std::sync::atomic::{AtomicU16, Ordering};

    static NEXT_INDEX: AtomicU16 = AtomicU16::new(1);

    fn state() -> SystemState {
        Lazy::force(&crate::testlog::INIT);
        SystemState::new(StationConfig::spacecraft(), Box::new(MemStorage::new()), 0).unwrap()
    }

    fn frame(code: u8, data: &[u8], msg_index: u16) -> LinkFrame {
        let command = Command::new(code, cmd_type::BIN, data).unwrap();
        let mut frame =
            LinkFrame::wrap(ADDR_GROUND, ADDR_SPACECRAFT, MsgType::Command, &command).unwrap();
        frame.msg_index = msg_index;
        frame
    }

    fn run(state: &mut SystemState, code: u8, data: &[u8]) -> Command {
        let index = NEXT_INDEX.fetch_add(1, Ordering::Relaxed);
        let reply = dispatch(state, &frame(code, data, index), 1_000).unwrap();
        assert_eq!(reply.msg_type, MsgType::Ack);
        assert_eq!(reply.destination, ADDR_GROUND);
        let reply: Command = reply.record().unwrap();
        assert!(reply.validate());
        assert_eq!(reply.data()[0], code);
        reply
    }

    #[test]
    fn test_restart_completes() {
        let mut state = state();
        let reply = run(&mut state, CPU_RESTART, &[]);
        assert_eq!(reply.code, CMD_COMPLETED);
        assert_eq!(state.actions, vec![Action::Restart]);
        assert_eq!(
            state.dispatcher.last_outcome(),
            Some((CPU_RESTART, DispatchState::RepliedOk))
        );
        assert_eq!(state.dispatcher.state(), DispatchState::AwaitingFrame);
    }

    #[test]
    fn test_bad_checksum_has_no_effect() {
        let mut state = state();
        let mut command = Command::new(CPU_RESTART, cmd_type::BIN, &[]).unwrap();
        command.checksum = command.checksum.wrapping_add(1);
        let frame =
            LinkFrame::wrap(ADDR_GROUND, ADDR_SPACECRAFT, MsgType::Command, &command).unwrap();
        let reply: Command = dispatch(&mut state, &frame, 0).unwrap().record().unwrap();
        assert_eq!(reply.code, MSG_CHKSUM_ERR);
        assert!(state.actions.is_empty());
    }

    #[test]
    fn test_wrong_destination_is_ignored() {
        let mut state = state();
        let mut frame = frame(CPU_RESTART, &[], 1);
        frame.destination = 0x55;
        assert!(dispatch(&mut state, &frame, 0).is_none());
        frame.destination = ADDR_BROADCAST;
        assert!(dispatch(&mut state, &frame, 0).is_some());
    }

    #[test]
    fn test_non_command_payload_is_dropped() {
        let mut state = state();
        let frame = LinkFrame::new(ADDR_GROUND, ADDR_SPACECRAFT, MsgType::Command, b"junk").unwrap();
        assert!(dispatch(&mut state, &frame, 0).is_none());
    }

    #[test]
    fn test_retransmission_replays_reply() {
        let mut state = state();
        let frame = frame(CPU_RESTART, &[], 42);
        let first = dispatch(&mut state, &frame, 0).unwrap();
        let second = dispatch(&mut state, &frame, 10).unwrap();
        assert_eq!(first, second);
        assert_eq!(state.actions, vec![Action::Restart]);
    }

    #[test]
    fn test_reused_index_with_new_content_runs() {
        let mut state = state();
        let first = dispatch(&mut state, &frame(CPU_RESTART, &[], 42), 0).unwrap();
        // the peer restarted and counts from the same index again
        let reused = frame(RST_GPS, &[], 42);
        let second = dispatch(&mut state, &reused, 10).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.record::<Command>().unwrap().data()[0], RST_GPS);
        assert_eq!(
            state.actions,
            vec![Action::Restart, Action::ResetSubsystem(Subsystem::Gps)]
        );
        // while a real retransmission of it is still answered from cache
        assert_eq!(dispatch(&mut state, &reused, 20).unwrap(), second);
        assert_eq!(state.actions.len(), 2);
    }

    #[test]
    fn test_reply_room_checked_before_running() {
        let mut state = state();
        run(&mut state, STOP_TX, &[]);
        let filler = LinkFrame::new(ADDR_SPACECRAFT, ADDR_GROUND, MsgType::Text, b"x").unwrap();
        while state.arbiter.room(TrafficClass::Control) > 1 {
            state.queue_control(filler.clone()).unwrap();
        }

        // the last slot is kept for RESUME_TX
        assert!(dispatch(&mut state, &frame(CHG_SETTING, &[4, 9], 500), 0).is_none());
        assert_eq!(state.settings.current().beacon_threshold, 55);
        assert!(!state.dispatcher.replies.contains(&(ADDR_GROUND, 500)));
        assert_eq!(state.dispatcher.state(), DispatchState::AwaitingFrame);

        assert!(dispatch(&mut state, &frame(RESUME_TX, &[], 501), 0).is_some());
        assert!(!state.arbiter.is_suppressed());

        // an echo needs a second slot for the echoed text
        assert!(dispatch(&mut state, &frame(ECHO_MESSAGE, b"hi", 502), 0).is_none());
        assert_eq!(state.arbiter.room(TrafficClass::Control), 1);

        // the unanswered command runs once it is sent again
        assert!(dispatch(&mut state, &frame(CHG_SETTING, &[4, 9], 500), 0).is_some());
        assert_eq!(state.settings.current().beacon_threshold, 9);
    }

    #[test]
    fn test_wrong_size_is_error() {
        let mut state = state();
        assert_eq!(run(&mut state, CPU_RESTART, &[1]).code, CMD_ERROR);
        assert_eq!(run(&mut state, CHG_SETTING, &[4]).code, CMD_ERROR);
        assert_eq!(run(&mut state, 0x7F, &[]).code, CMD_ERROR);
        assert!(state.actions.is_empty());
        assert_eq!(
            state.dispatcher.last_outcome(),
            Some((0x7F, DispatchState::RepliedError))
        );
    }

    #[test]
    fn test_settings_commands() {
        let mut state = state();
        assert_eq!(run(&mut state, CHG_SETTING, &[4, 77]).code, CMD_COMPLETED);
        assert_eq!(state.arbiter.config().beacon_interval_ms, 77_000);
        assert_eq!(run(&mut state, CHG_SETTING, &[3, 12]).code, CMD_COMPLETED);
        assert_eq!(state.arbiter.config().sleep_to_off_ms, 12_000);
        let reply = run(&mut state, GET_SETTING, &[]);
        assert_eq!(reply.data().len(), 1 + SETTING_LEN);
        let setting = Setting::read_from(&reply.data()[1..]).unwrap();
        assert_eq!(setting.beacon_threshold, 77);

        // invalid values are refused and nothing changes
        assert_eq!(run(&mut state, CHG_SETTING, &[0, 0]).code, CMD_ERROR);
        let foreign = Setting {
            key: *b"ZZZ",
            ..Default::default()
        };
        assert_eq!(run(&mut state, CHG_GLB_SET, &foreign.to_bytes()).code, CMD_ERROR);
        assert_eq!(state.settings.current().beacon_threshold, 77);

        assert_eq!(run(&mut state, RST_SETTING, &[]).code, CMD_COMPLETED);
        assert_eq!(state.settings.current().beacon_threshold, 55);
        assert_eq!(state.arbiter.config().beacon_interval_ms, 55_000);

        assert_eq!(run(&mut state, SET_SAVE_TO_FLASH, &[2]).code, CMD_ERROR);
        assert_eq!(run(&mut state, SET_SAVE_TO_FLASH, &[0]).code, CMD_COMPLETED);
        assert_eq!(state.settings.current().save_to_flash, 0);
        assert_eq!(state.settings.current().key, DEFAULT_KEY);
    }

    #[test]
    fn test_modem_field_commands() {
        let mut state = state();
        assert_eq!(run(&mut state, SET_LORA_433_SF, &[12]).code, CMD_COMPLETED);
        assert_eq!(state.profiles.get(TransportId::Lora433).sf, 12);
        assert!(state.pending_configs.contains(&TransportId::Lora433));

        // out of range is rejected and the profile is untouched
        assert_eq!(run(&mut state, SET_LORA_433_SF, &[13]).code, CMD_ERROR);
        assert_eq!(state.profiles.get(TransportId::Lora433).sf, 12);

        let freq = 2_450_000_000u32.to_le_bytes();
        assert_eq!(run(&mut state, SET_LORA_24_FREQUENCY, &freq).code, CMD_COMPLETED);
        assert_eq!(state.profiles.get(TransportId::Lora24).frequency, 2_450_000_000);
        // four byte fields need four bytes
        assert_eq!(run(&mut state, SET_LORA_24_FREQUENCY, &[1]).code, CMD_ERROR);

        let rate = 4.8f32.to_le_bytes();
        assert_eq!(run(&mut state, SET_FSK_433_BR, &rate).code, CMD_COMPLETED);
        assert_eq!(state.profiles.get(TransportId::Fsk433).bit_rate, 4.8);
    }

    #[test]
    fn test_bscp_and_struct_commands() {
        let mut state = state();
        assert_eq!(
            run(&mut state, SET_LORA_433_BSCP, &[7, 9, 6, 17]).code,
            CMD_COMPLETED
        );
        let profile = state.profiles.get(TransportId::Lora433);
        assert_eq!((profile.bw, profile.sf, profile.cr, profile.tx_power), (7, 9, 6, 17));

        // one bad field rejects the whole set
        assert_eq!(
            run(&mut state, SET_LORA_433_BSCP, &[8, 10, 5, 30]).code,
            CMD_ERROR
        );
        assert_eq!(state.profiles.get(TransportId::Lora433).bw, 7);

        let mut profile = ModemProfile::default_for(TransportId::Fsk433);
        profile.preamble = 32;
        assert_eq!(
            run(&mut state, SET_FSK_433_STRUCT, &profile.to_bytes()).code,
            CMD_COMPLETED
        );
        assert_eq!(state.profiles.get(TransportId::Fsk433).preamble, 32);
        assert_eq!(run(&mut state, SET_LORA_24_STRUCT, &[0; 10]).code, CMD_ERROR);
    }

    #[test]
    fn test_storage_commands() {
        let mut state = state();
        state.storage.write("OUTB/1", b"one").unwrap();
        state.storage.write("OUTB/2.IMG", b"two").unwrap();
        state.storage.write("SENT/0", b"zero").unwrap();
        state.storage.write("LOG", b"first line\nsecond line\n").unwrap();

        let reply = run(&mut state, GET_OUTBOX, &[]);
        assert_eq!(&reply.data()[1..], b"1;2.IMG");
        assert_eq!(&run(&mut state, GET_LOG_LN, &[]).data()[1..], b"first line");

        run(&mut state, RST_OUTBOX, &[]);
        assert!(state.storage.list(FOLDER_OUTBOX).unwrap().is_empty());
        assert_eq!(state.storage.list(FOLDER_SENT).unwrap(), vec!["0"]);

        state.oper_ms = 90_000;
        run(&mut state, RST_OPER_TIME, &[]);
        assert_eq!(state.oper_ms, 0);

        run(&mut state, RST_SD_CARD, &[]);
        assert!(state.storage.list(FOLDER_SENT).unwrap().is_empty());
        // the setting is written back after the wipe
        assert!(state.storage.read(crate::storage::FILE_SETTING).unwrap().is_some());
    }

    #[test]
    fn test_listing_is_cut_at_name_boundary() {
        let names: Vec<String> = (1000..1100).map(|n| format!("{}.IMG", n)).collect();
        let out = listing(&names);
        assert!(out.len() <= REPLY_DATA_LEN);
        assert!(out.ends_with(b".IMG"));
    }

    #[test]
    fn test_file_commands() {
        let mut state = state();
        let data: Vec<u8> = (0..500).map(|i| i as u8).collect();
        state.storage.write("OUTB/9.TXT", &data).unwrap();

        assert_eq!(run(&mut state, GET_FILE, &9u16.to_le_bytes()).code, CMD_COMPLETED);
        assert_eq!(run(&mut state, GET_FILE, &8u16.to_le_bytes()).code, CMD_ERROR);
        let reply = run(&mut state, GET_LAST_FILE, &[]);
        assert_eq!(&reply.data()[1..], &9u16.to_le_bytes());

        // indices 0 and 2 of file 9, nothing is resent before it was sent
        let mut part = 9u16.to_le_bytes().to_vec();
        part.extend_from_slice(&0u16.to_le_bytes());
        part.extend_from_slice(&2u16.to_le_bytes());
        let reply = run(&mut state, GET_FILE_PART, &part);
        assert_eq!(reply.code, CMD_COMPLETED);
        assert_eq!(&reply.data()[1..], &0u16.to_le_bytes());
        assert_eq!(run(&mut state, GET_FILE_PART, &[9, 0, 1]).code, CMD_ERROR);

        assert_eq!(run(&mut state, GET_META, &9u16.to_le_bytes()).code, CMD_COMPLETED);
        let reply = run(&mut state, RST_TRANSFER, &9u16.to_le_bytes());
        assert_eq!(&reply.data()[1..], &[1]);
        let reply = run(&mut state, RST_TRANSFER, &9u16.to_le_bytes());
        assert_eq!(&reply.data()[1..], &[0]);
    }

    #[test]
    fn test_file_part_loads_from_sent() {
        let mut state = state();
        let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        state.storage.write("SENT/4.IMG", &data).unwrap();
        let mut part = 4u16.to_le_bytes().to_vec();
        part.extend_from_slice(&1u16.to_le_bytes());
        let reply = run(&mut state, GET_FILE_PART, &part);
        assert_eq!(&reply.data()[1..], &1u16.to_le_bytes());

        let frame = state.transfer.pop_bulk().unwrap();
        let chunk: Chunk = frame.record().unwrap();
        assert_eq!((chunk.file_seq, chunk.file_index), (4, 1));
        assert_eq!(chunk.chunk_type, ld_type::IMAGE);
        assert_eq!(chunk.data(), &data[224..]);

        run(&mut state, GET_META, &4u16.to_le_bytes());
        let frame = state.transfer.pop_bulk().unwrap();
        assert_eq!(frame.msg_type, MsgType::Mv);
        assert!(frame.record::<ChunkMeta>().is_ok());
    }

    #[test]
    fn test_tx_and_modem_commands() {
        let mut state = state();
        run(&mut state, STOP_TX, &[]);
        assert!(state.arbiter.is_suppressed());
        run(&mut state, RESUME_TX, &[]);
        assert!(!state.arbiter.is_suppressed());

        assert_eq!(run(&mut state, SWITCH_MODEM, &[2, 1]).code, CMD_COMPLETED);
        assert_eq!(state.arbiter.current(), TransportId::Lora24);
        assert_eq!(state.arbiter.manual_override(), Some(TransportId::Lora24));
        assert_eq!(run(&mut state, SWITCH_MODEM, &[3, 0]).code, CMD_ERROR);
        run(&mut state, SWITCH_MODEM, &[1, 0]);
        assert_eq!(state.arbiter.manual_override(), None);
        assert_eq!(state.arbiter.current(), TransportId::Fsk433);

        run(&mut state, SEND_BEACON_433, &[]);
        assert_eq!(state.arbiter.pending(TrafficClass::Beacon), 1);
    }

    #[test]
    fn test_ranging_commands() {
        let mut state = state();
        assert_eq!(run(&mut state, RANGING_SLAVE_24, &[30]).code, CMD_COMPLETED);
        assert!(state.ranging.accepts_request(1_000 + 29_000));
        assert!(!state.ranging.accepts_request(1_000 + 30_000));
        // no master session while a slave window is open
        assert_eq!(run(&mut state, RANGING_RUN, &[]).code, CMD_ERROR);
        let reply = run(&mut state, RST_RANGING, &[]);
        assert_eq!(&reply.data()[1..], &[1]);

        assert_eq!(run(&mut state, RANGING_RUN, &[]).code, CMD_COMPLETED);
        assert_eq!(state.ranging_requester, Some(ADDR_GROUND));

        run(&mut state, RANGING_CALIB, &13000u16.to_le_bytes());
        assert_eq!(state.ranging.config().calibration(), 13000);
    }

    #[test]
    fn test_deferred_and_action_commands() {
        let mut state = state();
        run(&mut state, STRT_BLINK_X_MNT, &[2]);
        run(&mut state, ECHO_MESSAGE_X_MNT, b"\x01hello");
        run(&mut state, RPI_COMMAND, b"snap");
        run(&mut state, FAT_ON_OFF, &[3, 1]);
        assert_eq!(run(&mut state, FAT_ON_OFF, &[3, 2]).code, CMD_ERROR);
        assert_eq!(
            state.actions,
            vec![
                Action::Payload(b"snap".to_vec()),
                Action::Power { module: 3, on: true }
            ]
        );
        assert_eq!(
            state.deferred,
            vec![
                (1_000 + 2 * MINUTE_MS, Deferred::Blink(BlinkTarget::Led)),
                (
                    1_000 + MINUTE_MS,
                    Deferred::Echo {
                        to: ADDR_GROUND,
                        text: b"hello".to_vec()
                    }
                ),
            ]
        );

        run(&mut state, ECHO_MESSAGE, b"ping");
        assert_eq!(state.arbiter.pending(TrafficClass::Control), 1);
    }

    #[test]
    fn test_date_time_commands() {
        let mut state = state();
        assert_eq!(run(&mut state, SET_DATE_TIME, &[7, 4, 10, 30]).code, CMD_COMPLETED);
        assert!(state.clock.is_set());
        assert_eq!(run(&mut state, SET_DATE_TIME, &[7, 4, 25, 0]).code, CMD_ERROR);
        run(&mut state, RST_DATE_TIME, &[]);
        assert!(!state.clock.is_set());
    }

    #[test]
    fn test_reply_command_truncates() {
        let reply = reply_command(CMD_COMPLETED, GET_OUTBOX, &[7u8; 400]).unwrap();
        assert_eq!(reply.size() as usize, COMMAND_PAYLOAD_LEN);
        assert!(reply.validate());
    }
}
