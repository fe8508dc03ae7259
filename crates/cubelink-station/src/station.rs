// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! The cooperative station loop.
//!
//! A `Station` owns every piece of link state for one end of the link and
//! advances it from `tick`, which the host calls with a monotonic
//! millisecond clock. Each tick receives, dispatches, schedules and then
//! releases at most one frame through the arbiter. Side effects that need
//! hardware are handed back to the host as `Action`s.

use log::*;

use cubelink_link::{
    cmd_type, AirFrame, Arbiter, ArbiterConfig, Chunk, ChunkMeta, Command, LinkFrame,
    ModemProfile, ModemProfiles, MsgType, OverflowPolicy, RangingCoordinator, RangingEvent,
    RangingRole, RangingSummary, ReceivedEnvelope, RingBuffer, Setting, TrafficClass,
    TransportId, TransportSet, ADDR_BROADCAST, ADDR_RANGING, KEY_LEN,
};

use crate::{
    command::{self, codes, defer_delay_ms, Deferred, Dispatcher, Fingerprint, MAX_PART_INDICES},
    storage::{self, FILE_LOG, FILE_OPER_TIME, FOLDER_OUTBOX, FOLDER_RECEIVED, FOLDER_SENT},
    BeaconGenerator, BeaconReport, Clock, LruCache, NextChunk, ReassemblyState, Role, Sensors, Settings,
    StationConfig, StationError, StationResult, StatusRecord, Storage, Telemetry,
    TransferError, TransferManager, TransferMeta,
};

const OPER_SAVE_EVERY_MS: u64 = 60_000;
const SECOND_MS: u64 = 1_000;
const HOUR_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Gps,
    Mpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlinkTarget {
    Led,
    Laser,
    Both,
}

/// Work for the host, returned from `Station::tick`.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Restart,
    ResetSubsystem(Subsystem),
    Blink(BlinkTarget),
    Power { module: u8, on: bool },
    DeployAntenna,
    /// Opaque command for the payload computer.
    Payload(Vec<u8>),
    Telemetry(Telemetry),
    CommandReply {
        from: u8,
        code: u8,
        status: u8,
        data: Vec<u8>,
    },
    FileReceived {
        file_seq: u16,
        kind: u8,
        name: String,
        size: usize,
    },
    RangingComplete(RangingSummary),
    Message {
        from: u8,
        msg_type: MsgType,
        data: Vec<u8>,
    },
}

/// A received frame waiting to be handled.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub frame: AirFrame,
    pub transport: TransportId,
    pub rssi: i32,
    pub snr: f32,
    pub ranging_raw: Option<i32>,
}

/// Everything a command may touch.
pub struct SystemState {
    pub(crate) config: StationConfig,
    pub(crate) settings: Settings,
    pub(crate) storage: Box<dyn Storage>,
    pub(crate) profiles: ModemProfiles,
    pub(crate) pending_configs: Vec<TransportId>,
    pub(crate) arbiter: Arbiter,
    pub(crate) ranging: RangingCoordinator,
    /// who asked for the running master session
    pub(crate) ranging_requester: Option<u8>,
    pub(crate) transfer: TransferManager,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) beacons: BeaconGenerator,
    pub(crate) clock: Clock,
    pub(crate) deferred: Vec<(u64, Deferred)>,
    pub(crate) oper_ms: u64,
    pub(crate) last_tick: u64,
    pub(crate) received_count: u16,
    /// content of recently handled non-command frames by (sender, msg_index)
    pub(crate) seen: LruCache<(u8, u16), Fingerprint>,
    /// short beacon due after a long one, and its transport
    pub(crate) follow_up: Option<(u64, TransportId)>,
    /// next status line in the log, none when logging is off
    pub(crate) next_log_ms: Option<u64>,
    pub(crate) rx: RingBuffer<Inbound>,
    pub(crate) actions: Vec<Action>,
}

fn load_oper_time(storage: &dyn Storage) -> StationResult<u64> {
    match storage.read(FILE_OPER_TIME)? {
        Some(bytes) if bytes.len() == 4 => {
            let secs = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            Ok(secs as u64 * 1000)
        }
        Some(bytes) => {
            warn!("{} has {} bytes, restarting at zero", FILE_OPER_TIME, bytes.len());
            Ok(0)
        }
        None => Ok(0),
    }
}

// beacon and sleep timing come from the Setting, the rest from the host
fn arbiter_config(base: &ArbiterConfig, setting: &Setting) -> ArbiterConfig {
    ArbiterConfig {
        beacon_interval_ms: setting.beacon_threshold as u64 * SECOND_MS,
        sleep_to_off_ms: setting.sleep_delay_normal as u64 * SECOND_MS,
        ..base.clone()
    }
}

/// Compact summary sent back to whoever asked for a ranging run:
/// attempts, replies, failures, then the mean distance in decimeters.
pub fn range_report(summary: &RangingSummary) -> Vec<u8> {
    let mean_dm = summary.mean_m().map_or(0, |m| (m * 10.0).round() as u32);
    let mut out = vec![summary.attempts, summary.replies, summary.failures];
    out.extend_from_slice(&mean_dm.to_le_bytes());
    out
}

impl SystemState {
    pub fn new(
        config: StationConfig,
        mut storage: Box<dyn Storage>,
        now: u64,
    ) -> StationResult<Self> {
        config.validate()?;
        let key: [u8; KEY_LEN] = config.key_bytes()?;
        let settings = Settings::load(storage.as_mut(), key)?;
        let oper_ms = load_oper_time(storage.as_ref())?;
        let arbiter = Arbiter::new(arbiter_config(&config.arbiter, settings.current()), now);
        let mut state = SystemState {
            settings,
            storage,
            profiles: ModemProfiles::default(),
            pending_configs: TransportId::ALL.to_vec(),
            arbiter,
            ranging: RangingCoordinator::new(config.ranging.clone()),
            ranging_requester: None,
            transfer: TransferManager::new(&config),
            dispatcher: Dispatcher::new(config.dedup_window),
            beacons: BeaconGenerator::new(config.long_beacon_every),
            clock: Clock::default(),
            deferred: Vec::new(),
            oper_ms,
            last_tick: now,
            received_count: 0,
            seen: LruCache::new(config.dedup_window),
            follow_up: None,
            next_log_ms: None,
            rx: RingBuffer::new("rx", config.rx_capacity, OverflowPolicy::OverwriteOldest),
            actions: Vec::new(),
            config,
        };
        let reset = if state.settings.was_reset() {
            ", setting reset"
        } else {
            ""
        };
        state.log_line(&format!(
            "boot {:?} 0x{:02x} oper {}s{}",
            state.config.role,
            state.config.local_address,
            state.oper_ms / 1000,
            reset
        ));
        state.apply_setting(now);
        Ok(state)
    }

    /// Pushes the live Setting into the schedules that follow it.
    pub(crate) fn apply_setting(&mut self, now: u64) {
        let setting = *self.settings.current();
        let timing = arbiter_config(self.arbiter.config(), &setting);
        self.arbiter.set_beacon_interval(timing.beacon_interval_ms, now);
        self.arbiter.set_sleep_to_off(timing.sleep_to_off_ms);
        let period = setting.log_threshold as u64 * HOUR_MS;
        self.next_log_ms = match (period, self.next_log_ms) {
            (0, _) => None,
            (period, Some(at)) => Some(at.min(now + period)),
            (period, None) => Some(now + period),
        };
        if setting.inter_beacon_delay == 0 {
            self.follow_up = None;
        }
    }

    pub(crate) fn log_line(&mut self, line: &str) {
        debug!("log: {}", line);
        if let Err(err) = self.storage.append(FILE_LOG, format!("{}\n", line).as_bytes()) {
            warn!("log line not written: {}", err);
        }
    }

    pub(crate) fn save_oper_time(&mut self) -> StationResult<()> {
        let secs = (self.oper_ms / 1000).min(u32::MAX as u64) as u32;
        self.storage.write(FILE_OPER_TIME, &secs.to_le_bytes())
    }

    pub fn status(&self, now: u64) -> StatusRecord {
        StatusRecord {
            date_time: self.clock.date_time(now),
            oper_time_s: (self.oper_ms / 1000).min(u32::MAX as u64) as u32,
            sensors: self.beacons.sensors(),
            received_count: self.received_count,
            pending_outbox: self.transfer.pending().min(u16::MAX as usize) as u16,
            transport: self.arbiter.current() as u8,
            stop_tx: self.arbiter.is_suppressed(),
        }
    }

    pub(crate) fn queue_control(&mut self, frame: LinkFrame) -> StationResult<()> {
        self.arbiter
            .enqueue(TrafficClass::Control, AirFrame::Long(frame), None)?;
        Ok(())
    }

    pub(crate) fn send_command(&mut self, to: u8, code: u8, data: &[u8]) -> StationResult<()> {
        let command = Command::new(code, cmd_type::BIN, data)?;
        let frame = LinkFrame::wrap(self.config.local_address, to, MsgType::Command, &command)?;
        debug!("command 0x{:02x} to 0x{:02x} queued", code, to);
        self.queue_control(frame)
    }

    pub(crate) fn echo(&mut self, to: u8, text: &[u8]) -> StationResult<()> {
        let frame = LinkFrame::new(self.config.local_address, to, MsgType::Echo, text)?;
        self.queue_control(frame)
    }

    pub(crate) fn queue_long_beacon(&mut self, via: TransportId, now: u64) -> StationResult<()> {
        let frame = self
            .beacons
            .long(self.config.local_address, self.status(now))?;
        self.arbiter
            .enqueue(TrafficClass::Beacon, frame, Some(via))?;
        Ok(())
    }

    pub(crate) fn commit_profile(
        &mut self,
        id: TransportId,
        profile: ModemProfile,
    ) -> StationResult<()> {
        self.profiles.commit(id, profile)?;
        if !self.pending_configs.contains(&id) {
            self.pending_configs.push(id);
        }
        Ok(())
    }

    pub(crate) fn defer(&mut self, now: u64, minutes: u8, task: Deferred) {
        let due = now + defer_delay_ms(minutes);
        debug!("deferred {:?} due at {}", task, due);
        self.deferred.push((due, task));
    }

    /// Makes a stored file available for meta and part requests.
    pub(crate) fn ensure_loaded(&mut self, file_seq: u16) -> StationResult<()> {
        if self.transfer.is_loaded(file_seq) {
            return Ok(());
        }
        let file = storage::find_file(self.storage.as_ref(), file_seq)?
            .ok_or_else(|| StationError::dispatch(format!("no file {}", file_seq)))?;
        self.transfer.load(file.file_seq, file.data, file.kind)?;
        Ok(())
    }

    fn account_oper_time(&mut self, now: u64) {
        let before = self.oper_ms / OPER_SAVE_EVERY_MS;
        self.oper_ms += now.saturating_sub(self.last_tick);
        self.last_tick = self.last_tick.max(now);
        if self.oper_ms / OPER_SAVE_EVERY_MS != before {
            if let Err(err) = self.save_oper_time() {
                warn!("operating time not saved: {}", err);
            }
        }
    }

    fn receive(&mut self, transports: &mut TransportSet) {
        for (transport, received) in transports.poll() {
            let frame = match AirFrame::decode(&received.bytes) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!("{}: undecodable block dropped: {}", transport, err);
                    continue;
                }
            };
            self.received_count = self.received_count.wrapping_add(1);
            self.rx.push(Inbound {
                frame,
                transport,
                rssi: received.rssi,
                snr: received.snr,
                ranging_raw: received.ranging_raw,
            });
        }
    }

    fn handle(&mut self, inbound: Inbound, now: u64) -> StationResult<()> {
        let envelope = match inbound.frame {
            AirFrame::Short(beacon) => {
                trace!("short beacon from 0x{:02x}", beacon.local_address);
                self.actions.push(Action::Telemetry(Telemetry {
                    source: beacon.local_address,
                    transport: inbound.transport,
                    rssi: inbound.rssi,
                    snr: inbound.snr,
                    report: BeaconReport::Short(beacon),
                }));
                return Ok(());
            }
            AirFrame::Long(frame) => ReceivedEnvelope {
                frame,
                rssi: inbound.rssi,
                snr: inbound.snr,
                transport: inbound.transport,
            },
        };
        let ranging_raw = inbound.ranging_raw;
        let frame = &envelope.frame;
        let local = self.config.local_address;
        let to_us = [local, ADDR_BROADCAST, ADDR_RANGING].contains(&frame.destination);
        if frame.msg_type != MsgType::Command && !to_us {
            trace!("{:?} for 0x{:02x} filtered", frame.msg_type, frame.destination);
            return Ok(());
        }
        if frame.msg_type != MsgType::Command {
            let key = (frame.local_address, frame.msg_index);
            let print = command::fingerprint(frame);
            if self.seen.get(&key) == Some(&print) {
                debug!(
                    "retransmitted {} #{} from 0x{:02x} dropped",
                    frame.msg_type, frame.msg_index, frame.local_address
                );
                return Ok(());
            }
            self.seen.insert(key, print);
        }
        match frame.msg_type {
            MsgType::Command => {
                if let Some(reply) = command::dispatch(self, frame, now) {
                    self.queue_control(reply)?;
                }
            }
            MsgType::Ack if frame.destination == local => {
                let reply: Command = frame.record()?;
                let (code, data) = match reply.data().split_first() {
                    Some((&code, data)) => (code, data.to_vec()),
                    None => (0, Vec::new()),
                };
                info!(
                    "reply 0x{:02x} to command 0x{:02x} from 0x{:02x}",
                    reply.code, code, frame.local_address
                );
                self.actions.push(Action::CommandReply {
                    from: frame.local_address,
                    code,
                    status: reply.code,
                    data,
                });
            }
            MsgType::Beacon => {
                let status: StatusRecord = frame.record()?;
                self.actions.push(Action::Telemetry(Telemetry {
                    source: frame.local_address,
                    transport: envelope.transport,
                    rssi: envelope.rssi,
                    snr: envelope.snr,
                    report: BeaconReport::Long(status),
                }));
            }
            MsgType::Mv => {
                let meta: ChunkMeta = frame.record()?;
                let info = TransferMeta::from_chunk_meta(&meta)?;
                let state = self.transfer.accept_meta(&meta, now)?;
                self.on_reassembly(info.file_seq, info.kind, state)?;
            }
            MsgType::LargeData => {
                let chunk: Chunk = frame.record()?;
                match self.transfer.accept_chunk(&chunk, now) {
                    Ok(state) => self.on_reassembly(chunk.file_seq, chunk.chunk_type, state)?,
                    Err(TransferError::DigestMismatch(seq)) => {
                        // everything has to come again
                        self.send_command(frame.local_address, codes::GET_META, &seq.to_le_bytes())?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            MsgType::Ranging => self.on_ranging_frame(&envelope, ranging_raw, now)?,
            MsgType::Ack => {}
            other => {
                self.actions.push(Action::Message {
                    from: frame.local_address,
                    msg_type: other,
                    data: frame.data().to_vec(),
                });
            }
        }
        Ok(())
    }

    fn on_reassembly(
        &mut self,
        file_seq: u16,
        kind: u8,
        state: ReassemblyState,
    ) -> StationResult<()> {
        match state {
            ReassemblyState::Complete(payload) => {
                let name = storage::file_name(file_seq, kind);
                self.storage
                    .write(&storage::in_folder(FOLDER_RECEIVED, &name), &payload)?;
                self.log_line(&format!("received {} {} bytes", name, payload.len()));
                self.actions.push(Action::FileReceived {
                    file_seq,
                    kind,
                    name,
                    size: payload.len(),
                });
            }
            ReassemblyState::Incomplete { missing } => {
                trace!("transfer {}: {} chunks missing", file_seq, missing.len());
            }
            ReassemblyState::Duplicate => {}
        }
        Ok(())
    }

    fn on_ranging_frame(
        &mut self,
        envelope: &ReceivedEnvelope,
        raw: Option<i32>,
        now: u64,
    ) -> StationResult<()> {
        let frame = &envelope.frame;
        let seq = frame.data().first().copied().unwrap_or_default();
        if frame.destination == ADDR_RANGING {
            if !self.ranging.accepts_request(now) {
                debug!("ranging request {} outside a slave window", seq);
                return Ok(());
            }
            let reply = LinkFrame::new(
                self.config.local_address,
                frame.local_address,
                MsgType::Ranging,
                &[seq],
            )?;
            self.arbiter.enqueue(
                TrafficClass::Ranging,
                AirFrame::Long(reply),
                Some(TransportId::Lora24),
            )?;
        } else if self.ranging.role() == RangingRole::Master {
            if let Some(event) = self.ranging.on_reply(now, seq, raw) {
                self.on_ranging_event(event)?;
            }
        }
        Ok(())
    }

    fn on_ranging_event(&mut self, event: RangingEvent) -> StationResult<()> {
        match event {
            RangingEvent::Request { seq } => {
                let request = LinkFrame::new(
                    self.config.local_address,
                    ADDR_RANGING,
                    MsgType::Ranging,
                    &[seq],
                )?;
                self.arbiter.enqueue(
                    TrafficClass::Ranging,
                    AirFrame::Long(request),
                    Some(TransportId::Lora24),
                )?;
            }
            RangingEvent::Finished(summary) => {
                self.log_line(&format!(
                    "ranging {}/{} mean {:.1} m",
                    summary.replies,
                    summary.attempts,
                    summary.mean_m().unwrap_or(0.0)
                ));
                if let Some(to) = self.ranging_requester.take() {
                    let report = LinkFrame::new(
                        self.config.local_address,
                        to,
                        MsgType::Range,
                        &range_report(&summary),
                    )?;
                    self.queue_control(report)?;
                }
                self.actions.push(Action::RangingComplete(summary));
            }
            RangingEvent::SlaveClosed => {}
        }
        Ok(())
    }

    fn run_deferred(&mut self, now: u64) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.deferred = waiting;
        for (_, task) in due {
            debug!("running deferred {:?}", task);
            match task {
                Deferred::Echo { to, text } => {
                    if let Err(err) = self.echo(to, &text) {
                        warn!("deferred echo failed: {}", err);
                    }
                }
                Deferred::Blink(target) => self.actions.push(Action::Blink(target)),
                Deferred::Payload(bytes) => self.actions.push(Action::Payload(bytes)),
            }
        }
    }

    fn run_ranging(&mut self, now: u64) {
        while let Some(event) = self.ranging.poll(now) {
            if let Err(err) = self.on_ranging_event(event) {
                warn!("ranging: {}", err);
            }
        }
        match (self.ranging.is_active(), self.arbiter.is_ranging_reserved()) {
            (true, false) => self.arbiter.reserve_ranging(now),
            (false, true) => self.arbiter.release_ranging(now),
            _ => {}
        }
    }

    fn run_beacon(&mut self, now: u64) -> StationResult<()> {
        if let Some((at, via)) = self.follow_up {
            if now >= at {
                self.follow_up = None;
                let beacon = self
                    .beacons
                    .short(self.config.local_address, &self.status(now));
                self.arbiter
                    .enqueue(TrafficClass::Beacon, AirFrame::Short(beacon), Some(via))?;
            }
        }
        let Some(via) = self.arbiter.beacon_due(now) else {
            return Ok(());
        };
        if self.config.role != Role::Spacecraft {
            return Ok(());
        }
        let frame = self
            .beacons
            .next(self.config.local_address, self.status(now))?;
        let long = matches!(frame, AirFrame::Long(_));
        self.arbiter.enqueue(TrafficClass::Beacon, frame, Some(via))?;
        // a long beacon is followed by a short one on the same modem
        let delay = self.settings.current().inter_beacon_delay;
        if long && delay > 0 {
            self.follow_up = Some((now + delay as u64 * SECOND_MS, via));
        }
        Ok(())
    }

    fn run_log(&mut self, now: u64) {
        match self.next_log_ms {
            Some(at) if now >= at => {}
            _ => return,
        }
        let period = self.settings.current().log_threshold as u64 * HOUR_MS;
        self.next_log_ms = (period > 0).then(|| now + period);
        let status = self.status(now);
        self.log_line(&format!(
            "status oper {}s rx {} outbox {} on {} stop_tx {}",
            status.oper_time_s,
            status.received_count,
            status.pending_outbox,
            self.arbiter.current(),
            status.stop_tx
        ));
    }

    fn request_missing(&mut self, now: u64) -> StationResult<()> {
        let peer = self.config.peer_address;
        for request in self.transfer.overdue_missing(now) {
            let seq = request.file_seq.to_le_bytes();
            if request.need_meta {
                info!("transfer {}: asking for the descriptor", request.file_seq);
                self.send_command(peer, codes::GET_META, &seq)?;
            } else if !request.missing.is_empty() {
                info!(
                    "transfer {}: asking for {} missing chunks",
                    request.file_seq,
                    request.missing.len()
                );
                let mut data = seq.to_vec();
                for index in request.missing.iter().take(MAX_PART_INDICES) {
                    data.extend_from_slice(&index.to_le_bytes());
                }
                self.send_command(peer, codes::GET_FILE_PART, &data)?;
            }
        }
        Ok(())
    }

    fn pump_transfers(&mut self) {
        loop {
            match self.transfer.next_chunk() {
                Ok(NextChunk::Chunk { chunk, last }) => {
                    if last {
                        self.archive_sent(chunk.file_seq, chunk.chunk_type);
                    }
                }
                Ok(NextChunk::Done) | Err(TransferError::QueueFull) => break,
                Err(err) => {
                    warn!("transfer pump: {}", err);
                    break;
                }
            }
        }
    }

    // a fully queued outbox file moves to SENT
    fn archive_sent(&mut self, file_seq: u16, kind: u8) {
        let name = storage::file_name(file_seq, kind);
        let from = storage::in_folder(FOLDER_OUTBOX, &name);
        let res = self.storage.read(&from).and_then(|data| match data {
            Some(data) => {
                self.storage
                    .write(&storage::in_folder(FOLDER_SENT, &name), &data)?;
                self.storage.remove(&from)
            }
            None => Ok(false),
        });
        match res {
            Ok(true) => debug!("{} moved to {}", from, FOLDER_SENT),
            Ok(false) => {}
            Err(err) => warn!("{} not archived: {}", from, err),
        }
    }

    fn configure_modems(&mut self, transports: &mut TransportSet) {
        let present = transports.ids();
        for id in std::mem::take(&mut self.pending_configs) {
            if !present.contains(&id) {
                trace!("{}: no driver to configure", id);
                continue;
            }
            if let Err(err) = transports.configure(id, self.profiles.get(id)) {
                warn!("{}: configure failed: {}", id, err);
            }
        }
    }

    fn tick(&mut self, now: u64, transports: &mut TransportSet) -> Vec<Action> {
        self.account_oper_time(now);

        self.receive(transports);
        while let Some(inbound) = self.rx.pop() {
            let (kind, from) = (inbound.frame.msg_type(), inbound.frame.source());
            if let Err(err) = self.handle(inbound, now) {
                warn!("{} from 0x{:02x}: {}", kind, from, err);
            }
        }

        self.run_deferred(now);
        self.run_ranging(now);
        if let Err(err) = self.run_beacon(now) {
            warn!("beacon: {}", err);
        }
        self.run_log(now);
        if let Err(err) = self.request_missing(now) {
            warn!("missing chunk request: {}", err);
        }
        self.pump_transfers();
        self.configure_modems(transports);

        if let Some(release) = self
            .arbiter
            .release(now, transports, &mut self.transfer)
        {
            if release.class == TrafficClass::Ranging && self.ranging.role() == RangingRole::Master
            {
                self.ranging.on_transmitted(now);
            }
        }
        std::mem::take(&mut self.actions)
    }
}

/// One end of the link.
pub struct Station {
    state: SystemState,
}

impl Station {
    pub fn new(config: StationConfig, storage: Box<dyn Storage>, now: u64) -> StationResult<Self> {
        let state = SystemState::new(config, storage, now)?;
        info!(
            "station 0x{:02x} up as {:?}",
            state.config.local_address, state.config.role
        );
        Ok(Station { state })
    }

    /// Advances the station to `now`, returns what the host must do.
    pub fn tick(&mut self, now: u64, transports: &mut TransportSet) -> Vec<Action> {
        self.state.tick(now, transports)
    }

    /// Queues a command for the peer.
    pub fn send_command(&mut self, code: u8, data: &[u8]) -> StationResult<()> {
        let peer = self.state.config.peer_address;
        self.state.send_command(peer, code, data)
    }

    /// Stores a payload in the outbox and starts sending it to the peer.
    pub fn begin_file(&mut self, file_seq: u16, payload: Vec<u8>, kind: u8) -> StationResult<()> {
        let name = storage::in_folder(FOLDER_OUTBOX, &storage::file_name(file_seq, kind));
        self.state.storage.write(&name, &payload)?;
        self.state.transfer.begin_transfer(file_seq, payload, kind)?;
        Ok(())
    }

    pub fn start_ranging(&mut self, now: u64) -> StationResult<()> {
        self.state.ranging.start(now)?;
        self.state.arbiter.reserve_ranging(now);
        Ok(())
    }

    pub fn start_ranging_slave(&mut self, now: u64, window_ms: u64) -> StationResult<()> {
        self.state.ranging.start_slave(now, window_ms)?;
        self.state.arbiter.reserve_ranging(now);
        Ok(())
    }

    pub fn set_sensors(&mut self, sensors: Sensors) {
        self.state.beacons.set_sensors(sensors);
    }

    pub fn status(&self, now: u64) -> StatusRecord {
        self.state.status(now)
    }

    pub fn config(&self) -> &StationConfig {
        &self.state.config
    }

    pub fn settings(&self) -> &Settings {
        &self.state.settings
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.state.arbiter
    }

    pub fn ranging(&self) -> &RangingCoordinator {
        &self.state.ranging
    }

    pub fn transfer(&self) -> &TransferManager {
        &self.state.transfer
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.state.dispatcher
    }

    pub fn clock(&self) -> &Clock {
        &self.state.clock
    }

    pub fn profiles(&self) -> &ModemProfiles {
        &self.state.profiles
    }

    pub fn oper_time_ms(&self) -> u64 {
        self.state.oper_ms
    }

    pub fn received_count(&self) -> u16 {
        self.state.received_count
    }

    pub fn storage(&self) -> &dyn Storage {
        self.state.storage.as_ref()
    }

    pub fn storage_mut(&mut self) -> &mut dyn Storage {
        self.state.storage.as_mut()
    }

    /// Shuts down, handing the storage back.
    pub fn into_storage(mut self) -> Box<dyn Storage> {
        if let Err(err) = self.state.save_oper_time() {
            warn!("operating time not saved: {}", err);
        }
        self.state.storage
    }
}
