// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Two-way ranging over the 2.4 GHz modem.
//!
//! The master issues `count` request/response exchanges to the ranging
//! address. Every wait is a deadline checked by `poll`, so a silent slave
//! costs at most `count * (rx_timeout + inter-packet delay)`.

use log::*;
use serde::{Deserialize, Serialize};

use crate::{lora24_bandwidth_khz, LinkError, LinkResult, LORA_24_BW_0400};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    pub sf: u8,
    /// 2.4 GHz bandwidth code
    pub bw: u8,
    pub value: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangingConfig {
    pub count: u8,
    pub delay_ms: u64,
    pub rx_timeout_ms: u64,
    pub tx_timeout_ms: u64,
    pub distance_adjustment: f64,
    pub sf: u8,
    pub bw: u8,
    pub calibrations: Vec<Calibration>,
    pub slave_window_ms: u64,
}

impl Default for RangingConfig {
    fn default() -> Self {
        RangingConfig {
            count: 10,
            delay_ms: 275,
            rx_timeout_ms: 5_000,
            tx_timeout_ms: 5_000,
            distance_adjustment: 0.8967,
            sf: 10,
            bw: LORA_24_BW_0400,
            calibrations: vec![Calibration {
                sf: 10,
                bw: LORA_24_BW_0400,
                value: 12200,
            }],
            slave_window_ms: 60_000,
        }
    }
}

/// Air time floor for a ranging packet, in ms.
pub fn min_packet_ms(sf: u8, bw_khz: f64) -> u64 {
    (52.0 * 2f64.powi(sf as i32) / bw_khz).ceil() as u64
}

impl RangingConfig {
    pub fn bandwidth_khz(&self) -> f64 {
        lora24_bandwidth_khz(self.bw).unwrap_or(406.25)
    }

    /// Calibration for the configured SF/BW pair, zero when unknown.
    pub fn calibration(&self) -> i32 {
        self.calibrations
            .iter()
            .find(|c| c.sf == self.sf && c.bw == self.bw)
            .map_or(0, |c| c.value)
    }

    pub fn set_calibration(&mut self, value: i32) {
        let (sf, bw) = (self.sf, self.bw);
        match self.calibrations.iter_mut().find(|c| c.sf == sf && c.bw == bw) {
            Some(cal) => cal.value = value,
            None => self.calibrations.push(Calibration { sf, bw, value }),
        }
    }

    pub fn inter_packet_ms(&self) -> u64 {
        self.delay_ms
            .max(min_packet_ms(self.sf, self.bandwidth_khz()))
    }

    /// Distance in meters from a raw round-trip register value.
    pub fn distance_m(&self, raw: i32) -> f64 {
        let ticks = (raw as i64 - self.calibration() as i64).max(0) as f64;
        let bw_mhz = self.bandwidth_khz() / 1000.0;
        ticks * 150.0 / (4096.0 * bw_mhz) * self.distance_adjustment
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RangingSummary {
    pub attempts: u8,
    pub replies: u8,
    pub failures: u8,
    pub distances_m: Vec<f64>,
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl RangingSummary {
    pub fn mean_m(&self) -> Option<f64> {
        if self.distances_m.is_empty() {
            None
        } else {
            Some(self.distances_m.iter().sum::<f64>() / self.distances_m.len() as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RangingEvent {
    /// Send ranging request number `seq` now.
    Request { seq: u8 },
    Finished(RangingSummary),
    SlaveClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingRole {
    Idle,
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Pending { exchange: u8, at: u64 },
    Sending { exchange: u8, deadline: u64 },
    Awaiting { exchange: u8, deadline: u64 },
    Slave { until: u64 },
}

#[derive(Debug)]
pub struct RangingCoordinator {
    config: RangingConfig,
    phase: Phase,
    summary: RangingSummary,
    last: Option<RangingSummary>,
}

impl RangingCoordinator {
    pub fn new(config: RangingConfig) -> Self {
        RangingCoordinator {
            config,
            phase: Phase::Idle,
            summary: RangingSummary::default(),
            last: None,
        }
    }

    pub fn config(&self) -> &RangingConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RangingConfig {
        &mut self.config
    }

    pub fn role(&self) -> RangingRole {
        match self.phase {
            Phase::Idle => RangingRole::Idle,
            Phase::Slave { .. } => RangingRole::Slave,
            _ => RangingRole::Master,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn last_summary(&self) -> Option<&RangingSummary> {
        self.last.as_ref()
    }

    pub fn start(&mut self, now: u64) -> LinkResult<()> {
        if self.is_active() {
            return Err(LinkError::invalid_argument("ranging session already running"));
        }
        info!(
            "ranging master starting: {} exchanges, {} ms apart",
            self.config.count,
            self.config.inter_packet_ms()
        );
        self.summary = RangingSummary {
            started_ms: now,
            ..Default::default()
        };
        // an empty run finishes on the next poll
        self.phase = Phase::Pending {
            exchange: 0,
            at: now,
        };
        Ok(())
    }

    pub fn start_slave(&mut self, now: u64, window_ms: u64) -> LinkResult<()> {
        if self.role() == RangingRole::Master {
            return Err(LinkError::invalid_argument("ranging master session running"));
        }
        info!("ranging slave window open for {} ms", window_ms);
        self.phase = Phase::Slave {
            until: now + window_ms,
        };
        Ok(())
    }

    /// Drops the session without producing a summary.
    pub fn abort(&mut self) -> bool {
        let was_active = self.is_active();
        if was_active {
            info!("ranging session aborted");
        }
        self.phase = Phase::Idle;
        self.summary = RangingSummary::default();
        was_active
    }

    /// True while a slave window is open.
    pub fn accepts_request(&self, now: u64) -> bool {
        matches!(self.phase, Phase::Slave { until } if now < until)
    }

    /// The request went out on the air.
    pub fn on_transmitted(&mut self, now: u64) {
        if let Phase::Sending { exchange, .. } = self.phase {
            self.phase = Phase::Awaiting {
                exchange,
                deadline: now + self.config.rx_timeout_ms,
            };
        }
    }

    /// A reply arrived; `raw` is the driver's round-trip measurement.
    pub fn on_reply(&mut self, now: u64, seq: u8, raw: Option<i32>) -> Option<RangingEvent> {
        match self.phase {
            Phase::Awaiting { exchange, .. } if exchange == seq => {
                self.summary.replies += 1;
                if let Some(raw) = raw {
                    let distance = self.config.distance_m(raw);
                    debug!("ranging reply {}: raw {} -> {:.1} m", seq, raw, distance);
                    self.summary.distances_m.push(distance);
                }
                self.advance(exchange, now)
            }
            _ => {
                debug!("ranging reply {} ignored", seq);
                None
            }
        }
    }

    pub fn poll(&mut self, now: u64) -> Option<RangingEvent> {
        match self.phase {
            Phase::Pending { exchange, at } if now >= at && exchange >= self.config.count => {
                Some(self.finish(now))
            }
            Phase::Pending { exchange, at } if now >= at => {
                self.summary.attempts += 1;
                self.phase = Phase::Sending {
                    exchange,
                    deadline: now + self.config.tx_timeout_ms,
                };
                Some(RangingEvent::Request { seq: exchange })
            }
            Phase::Sending { exchange, deadline } if now >= deadline => {
                warn!("ranging request {} not sent in time", exchange);
                self.summary.failures += 1;
                self.advance(exchange, now)
            }
            Phase::Awaiting { exchange, deadline } if now >= deadline => {
                debug!("ranging request {} timed out", exchange);
                self.summary.failures += 1;
                self.advance(exchange, now)
            }
            Phase::Slave { until } if now >= until => {
                info!("ranging slave window closed");
                self.phase = Phase::Idle;
                Some(RangingEvent::SlaveClosed)
            }
            _ => None,
        }
    }

    fn advance(&mut self, exchange: u8, now: u64) -> Option<RangingEvent> {
        let next = exchange + 1;
        if next >= self.config.count {
            Some(self.finish(now))
        } else {
            self.phase = Phase::Pending {
                exchange: next,
                at: now + self.config.inter_packet_ms(),
            };
            None
        }
    }

    fn finish(&mut self, now: u64) -> RangingEvent {
        self.phase = Phase::Idle;
        self.summary.finished_ms = now;
        let summary = std::mem::take(&mut self.summary);
        info!(
            "ranging finished: {}/{} replies, mean {:?} m",
            summary.replies,
            summary.attempts,
            summary.mean_m()
        );
        self.last = Some(summary.clone());
        RangingEvent::Finished(summary)
    }
}
