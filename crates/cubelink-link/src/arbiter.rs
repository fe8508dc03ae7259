// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Every outbound frame goes through the arbiter:
//! - only the current transport transmits, and only once it is Active
//! - traffic classes are released by priority, one frame per tick
//! - ranging reserves the 2.4 GHz modem, beacons and bulk wait for it
//! - bulk chunks are spaced out to respect the power budget

use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    AirFrame, LinkError, LinkFrame, LinkResult, MsgType, OverflowPolicy, RingBuffer, TransportId,
    TransportSet, LINK_FRAME_LEN,
};

/// Release priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Control,
    Ranging,
    Beacon,
    Bulk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    Warming,
    Active,
    Sleeping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Transports visited by the automatic schedule, one step per beacon.
    pub rotation: Vec<TransportId>,
    pub beacon_interval_ms: u64,
    pub warmup_ms: u64,
    pub sleep_to_off_ms: u64,
    pub min_chunk_gap_ms: u64,
    pub stop_tx_expiry_ms: u64,
    pub control_capacity: usize,
    pub ranging_capacity: usize,
    pub beacon_capacity: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        ArbiterConfig {
            rotation: vec![TransportId::Lora433, TransportId::Fsk433, TransportId::Lora24],
            beacon_interval_ms: 30_000,
            warmup_ms: 20,
            sleep_to_off_ms: 5_000,
            min_chunk_gap_ms: 500,
            stop_tx_expiry_ms: 24 * 60 * 60 * 1000,
            control_capacity: 16,
            ranging_capacity: 4,
            beacon_capacity: 4,
        }
    }
}

/// Supplies bulk frames on demand, normally the transfer outbox.
pub trait BulkSource {
    fn has_bulk(&self) -> bool;
    fn pop_bulk(&mut self) -> Option<LinkFrame>;
    /// Puts back a frame whose transmission failed, ahead of the rest.
    fn requeue_bulk(&mut self, frame: LinkFrame);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Outbound {
    frame: AirFrame,
    via: Option<TransportId>,
}

/// Describes a frame that went on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub class: TrafficClass,
    pub transport: TransportId,
    pub msg_type: MsgType,
    pub msg_index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemSlot {
    pub id: TransportId,
    pub state: PowerState,
    /// Accumulated Warming + Active time.
    pub on_ms: u64,
    since_ms: u64,
    warm_until_ms: u64,
}

#[derive(Debug)]
pub struct Arbiter {
    config: ArbiterConfig,
    slots: Vec<ModemSlot>,
    current: TransportId,
    manual: Option<TransportId>,
    // selection to restore once the ranging session ends
    ranging_restore: Option<TransportId>,
    rotation_pos: usize,
    next_beacon_ms: u64,
    last_bulk_ms: Option<u64>,
    suppressed_until: Option<u64>,
    last_update_ms: u64,
    next_index: u16,
    control: RingBuffer<Outbound>,
    ranging: RingBuffer<Outbound>,
    beacon: RingBuffer<Outbound>,
    power_events: Vec<(TransportId, PowerState)>,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig, now: u64) -> Self {
        let current = config
            .rotation
            .first()
            .copied()
            .unwrap_or(TransportId::Lora433);
        let slots = TransportId::ALL
            .iter()
            .map(|&id| ModemSlot {
                id,
                state: if id == current {
                    PowerState::Active
                } else {
                    PowerState::Off
                },
                on_ms: 0,
                since_ms: now,
                warm_until_ms: now,
            })
            .collect();
        Arbiter {
            control: RingBuffer::new(
                "control",
                config.control_capacity,
                OverflowPolicy::RejectNewest,
            ),
            ranging: RingBuffer::new(
                "ranging",
                config.ranging_capacity,
                OverflowPolicy::RejectNewest,
            ),
            beacon: RingBuffer::new(
                "beacon",
                config.beacon_capacity,
                OverflowPolicy::OverwriteOldest,
            ),
            next_beacon_ms: now + config.beacon_interval_ms,
            config,
            slots,
            current,
            manual: None,
            ranging_restore: None,
            rotation_pos: 0,
            last_bulk_ms: None,
            suppressed_until: None,
            last_update_ms: now,
            next_index: 0,
            power_events: vec![(current, PowerState::Active)],
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// The authoritative transport for outbound traffic.
    pub fn current(&self) -> TransportId {
        self.current
    }

    pub fn manual_override(&self) -> Option<TransportId> {
        self.manual
    }

    pub fn slot(&self, id: TransportId) -> &ModemSlot {
        &self.slots[id as usize]
    }

    pub fn power_state(&self, id: TransportId) -> PowerState {
        self.slot(id).state
    }

    pub fn on_duration_ms(&self, id: TransportId) -> u64 {
        self.slot(id).on_ms
    }

    /// True for the one transport flagged for transmit. A transport that is
    /// still warming up holds the flag, its frames wait for Active.
    pub fn is_transmitter(&self, id: TransportId) -> bool {
        id == self.current
            && matches!(self.power_state(id), PowerState::Warming | PowerState::Active)
    }

    /// Free slots in a reject-newest queue.
    pub fn room(&self, class: TrafficClass) -> usize {
        match class {
            TrafficClass::Control => self.control.capacity() - self.control.len(),
            TrafficClass::Ranging => self.ranging.capacity() - self.ranging.len(),
            TrafficClass::Beacon => self.beacon.capacity() - self.beacon.len(),
            TrafficClass::Bulk => 0,
        }
    }

    /// Changes the beacon cadence. A pending beacon is pulled in when the
    /// new interval ends sooner.
    pub fn set_beacon_interval(&mut self, interval_ms: u64, now: u64) {
        if interval_ms != self.config.beacon_interval_ms {
            info!(
                "beacon interval {} -> {} ms",
                self.config.beacon_interval_ms, interval_ms
            );
            self.config.beacon_interval_ms = interval_ms;
        }
        self.next_beacon_ms = self.next_beacon_ms.min(now + interval_ms);
    }

    /// How long a sleeping modem stays powered before it is switched off.
    pub fn set_sleep_to_off(&mut self, sleep_to_off_ms: u64) {
        self.config.sleep_to_off_ms = sleep_to_off_ms;
    }

    pub fn pending(&self, class: TrafficClass) -> usize {
        match class {
            TrafficClass::Control => self.control.len(),
            TrafficClass::Ranging => self.ranging.len(),
            TrafficClass::Beacon => self.beacon.len(),
            TrafficClass::Bulk => 0,
        }
    }

    /// Makes `id` current. Returns false when it already was, so reissuing
    /// the same selection is a no-op. A manual selection pins the choice
    /// until `clear_override`.
    pub fn select(&mut self, id: TransportId, now: u64, manual: bool) -> bool {
        if manual {
            self.manual = Some(id);
        }
        if self.ranging_restore.is_some() {
            // applied when the ranging session releases the modem
            self.ranging_restore = Some(id);
            return false;
        }
        self.switch_to(id, now)
    }

    pub fn clear_override(&mut self) {
        if let Some(id) = self.manual.take() {
            info!("manual override of {} cleared", id);
        }
    }

    fn switch_to(&mut self, id: TransportId, now: u64) -> bool {
        if id == self.current {
            return false;
        }
        self.account(now);
        let previous = self.current;
        self.set_state(previous, PowerState::Sleeping, now);
        if self.config.warmup_ms == 0 {
            self.set_state(id, PowerState::Active, now);
        } else if self.power_state(id) != PowerState::Warming {
            self.set_state(id, PowerState::Warming, now);
            self.slots[id as usize].warm_until_ms = now + self.config.warmup_ms;
        }
        self.current = id;
        info!("current modem {} -> {}", previous, id);
        true
    }

    fn set_state(&mut self, id: TransportId, state: PowerState, now: u64) {
        let slot = &mut self.slots[id as usize];
        if slot.state != state {
            trace!("{}: {:?} -> {:?}", id, slot.state, state);
            slot.state = state;
            slot.since_ms = now;
            self.power_events.push((id, state));
        }
    }

    fn account(&mut self, now: u64) {
        let delta = now.saturating_sub(self.last_update_ms);
        for slot in self.slots.iter_mut() {
            if matches!(slot.state, PowerState::Warming | PowerState::Active) {
                slot.on_ms += delta;
            }
        }
        self.last_update_ms = self.last_update_ms.max(now);
    }

    /// Advances timers: warm-up, sleep-to-off and stop-TX expiry.
    pub fn update(&mut self, now: u64) {
        self.account(now);
        for id in TransportId::ALL {
            let slot = self.slot(id).clone();
            match slot.state {
                PowerState::Warming if now >= slot.warm_until_ms => {
                    self.set_state(id, PowerState::Active, now)
                }
                PowerState::Sleeping
                    if now.saturating_sub(slot.since_ms) >= self.config.sleep_to_off_ms =>
                {
                    self.set_state(id, PowerState::Off, now)
                }
                _ => {}
            }
        }
        if let Some(until) = self.suppressed_until {
            if now >= until {
                info!("stop-tx expired, transmitting again");
                self.suppressed_until = None;
            }
        }
    }

    /// Passes accumulated power transitions to the drivers.
    pub fn apply_power(&mut self, transports: &mut TransportSet) {
        for (id, state) in self.power_events.drain(..) {
            let res = match state {
                PowerState::Warming | PowerState::Active => transports.wake(id),
                PowerState::Sleeping => transports.sleep(id),
                PowerState::Off => Ok(()),
            };
            if let Err(err) = res {
                warn!("{}: power change to {:?} failed: {}", id, state, err);
            }
        }
    }

    /// Rotates the selection when a beacon is due and reports the transport
    /// the beacon should go out on.
    pub fn beacon_due(&mut self, now: u64) -> Option<TransportId> {
        if now < self.next_beacon_ms {
            return None;
        }
        self.next_beacon_ms = now + self.config.beacon_interval_ms;
        let rotation_len = self.config.rotation.len();
        if self.manual.is_none() && self.ranging_restore.is_none() && rotation_len > 1 {
            self.rotation_pos = (self.rotation_pos + 1) % rotation_len;
            let next = self.config.rotation[self.rotation_pos];
            self.switch_to(next, now);
        }
        Some(self.current)
    }

    /// Queues a frame. `via` asks for a specific transport; the arbiter
    /// switches to it unless an override or a ranging session is active.
    pub fn enqueue(
        &mut self,
        class: TrafficClass,
        frame: AirFrame,
        via: Option<TransportId>,
    ) -> LinkResult<()> {
        let item = Outbound { frame, via };
        let queue = match class {
            TrafficClass::Control => &mut self.control,
            TrafficClass::Ranging => &mut self.ranging,
            TrafficClass::Beacon => &mut self.beacon,
            TrafficClass::Bulk => {
                return Err(LinkError::invalid_argument(
                    "bulk frames come from the bulk source",
                ))
            }
        };
        match (queue.try_push(item), queue.policy()) {
            (Ok(()), _) => Ok(()),
            (Err(_), OverflowPolicy::OverwriteOldest) => {
                debug!("{} queue full, oldest evicted", queue.name());
                Ok(())
            }
            (Err(_), OverflowPolicy::RejectNewest) => Err(LinkError::BufferFull(queue.name())),
        }
    }

    pub fn stop_tx(&mut self, now: u64) {
        let until = now + self.config.stop_tx_expiry_ms;
        info!("transmit suppressed until {}", until);
        self.suppressed_until = Some(until);
    }

    pub fn resume_tx(&mut self) {
        if self.suppressed_until.take().is_some() {
            info!("transmit resumed");
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed_until.is_some()
    }

    /// Pins the 2.4 GHz modem until `release_ranging`.
    pub fn reserve_ranging(&mut self, now: u64) {
        if self.ranging_restore.is_none() {
            let previous = self.current;
            self.switch_to(TransportId::Lora24, now);
            self.ranging_restore = Some(previous);
            debug!("ranging reserved lora24, will restore {}", previous);
        }
    }

    pub fn release_ranging(&mut self, now: u64) {
        if let Some(previous) = self.ranging_restore.take() {
            let target = self.manual.unwrap_or(previous);
            self.switch_to(target, now);
            debug!("ranging released, back on {}", self.current);
        }
    }

    /// Drops queued ranging frames, used when a session is aborted.
    pub fn clear_ranging(&mut self) {
        self.ranging.clear();
    }

    pub fn is_ranging_reserved(&self) -> bool {
        self.ranging_restore.is_some()
    }

    fn bulk_ready(&self, now: u64, bulk: &dyn BulkSource) -> bool {
        bulk.has_bulk()
            && self
                .last_bulk_ms
                .map_or(true, |last| now >= last + self.config.min_chunk_gap_ms)
    }

    fn pick(&mut self, now: u64, bulk: &mut dyn BulkSource) -> Option<(TrafficClass, Outbound)> {
        if self.ranging_restore.is_some() {
            // ranging first, replies may share the reserved modem
            if let Some(item) = self.ranging.pop() {
                return Some((TrafficClass::Ranging, item));
            }
            return self.control.pop().map(|item| (TrafficClass::Control, item));
        }
        if let Some(item) = self.control.pop() {
            return Some((TrafficClass::Control, item));
        }
        if let Some(item) = self.ranging.pop() {
            return Some((TrafficClass::Ranging, item));
        }
        if let Some(item) = self.beacon.pop() {
            return Some((TrafficClass::Beacon, item));
        }
        if self.bulk_ready(now, bulk) {
            return bulk.pop_bulk().map(|frame| {
                (
                    TrafficClass::Bulk,
                    Outbound {
                        frame: AirFrame::Long(frame),
                        via: None,
                    },
                )
            });
        }
        None
    }

    fn requeue(&mut self, class: TrafficClass, item: Outbound, bulk: &mut dyn BulkSource) {
        let queue = match class {
            TrafficClass::Control => &mut self.control,
            TrafficClass::Ranging => &mut self.ranging,
            TrafficClass::Beacon => &mut self.beacon,
            TrafficClass::Bulk => {
                if let AirFrame::Long(frame) = item.frame {
                    bulk.requeue_bulk(frame);
                }
                return;
            }
        };
        if queue.push_front(item).is_err() {
            warn!("{} queue full, failed frame dropped", queue.name());
        }
    }

    /// Runs one scheduling step and transmits at most one frame.
    pub fn release(
        &mut self,
        now: u64,
        transports: &mut TransportSet,
        bulk: &mut dyn BulkSource,
    ) -> Option<Release> {
        self.update(now);
        self.apply_power(transports);
        if self.is_suppressed() {
            return None;
        }
        let transport = self.current;
        if self.power_state(transport) != PowerState::Active {
            return None;
        }
        let (class, mut item) = self.pick(now, bulk)?;

        if let Some(via) = item.via {
            if via != transport && self.manual.is_none() && self.ranging_restore.is_none() {
                self.requeue(class, item, bulk);
                self.switch_to(via, now);
                self.apply_power(transports);
                return None;
            }
        }

        let msg_index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        stamp(&mut item.frame, msg_index, now);

        let mut buf = [0u8; LINK_FRAME_LEN];
        let len = item.frame.encode_into(&mut buf);
        let msg_type = item.frame.msg_type();
        match transports.transmit(transport, &buf[..len]) {
            Ok(()) => {
                if class == TrafficClass::Bulk {
                    self.last_bulk_ms = Some(now);
                }
                debug!(
                    "released {:?} {} #{} on {}",
                    class, msg_type, msg_index, transport
                );
                Some(Release {
                    class,
                    transport,
                    msg_type,
                    msg_index,
                })
            }
            Err(err) => {
                warn!("transmit {:?} {} failed, will retry: {}", class, msg_type, err);
                self.requeue(class, item, bulk);
                None
            }
        }
    }
}

// msg_time is seconds since boot, wrapping
fn stamp(frame: &mut AirFrame, msg_index: u16, now: u64) {
    match frame {
        AirFrame::Long(frame) => {
            frame.msg_index = msg_index;
            frame.msg_time = (now / 1000) as u16;
        }
        AirFrame::Short(beacon) => beacon.msg_index = msg_index,
    }
}
