// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;
use rand::{thread_rng, Rng};
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::{LinkError, LinkResult, ModemProfile, TransportId, LINK_FRAME_LEN};

/// One block handed up by a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub bytes: Vec<u8>,
    pub rssi: i32,
    pub snr: f32,
    /// Raw round-trip register value, present on ranging replies.
    pub ranging_raw: Option<i32>,
}

/// A radio driver. Every call polls, nothing blocks the loop.
pub trait Transport: Send {
    fn id(&self) -> TransportId;
    fn transmit(&mut self, bytes: &[u8]) -> LinkResult<()>;
    fn receive(&mut self) -> Option<Received>;
    fn configure(&mut self, profile: &ModemProfile) -> LinkResult<()>;
    fn sleep(&mut self) -> LinkResult<()>;
    fn wake(&mut self) -> LinkResult<()>;
}

/// The drivers a station owns, at most one per transport id.
#[derive(Default)]
pub struct TransportSet {
    transports: Vec<Box<dyn Transport>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a driver, replacing any previous one with the same id.
    pub fn insert(&mut self, transport: Box<dyn Transport>) {
        let id = transport.id();
        self.transports.retain(|t| t.id() != id);
        self.transports.push(transport);
    }

    pub fn ids(&self) -> Vec<TransportId> {
        self.transports.iter().map(|t| t.id()).collect()
    }

    pub fn get_mut(&mut self, id: TransportId) -> LinkResult<&mut Box<dyn Transport>> {
        self.transports
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or_else(|| LinkError::transport_error(id, "no driver"))
    }

    pub fn transmit(&mut self, id: TransportId, bytes: &[u8]) -> LinkResult<()> {
        self.get_mut(id)?.transmit(bytes)
    }

    pub fn configure(&mut self, id: TransportId, profile: &ModemProfile) -> LinkResult<()> {
        self.get_mut(id)?.configure(profile)
    }

    pub fn sleep(&mut self, id: TransportId) -> LinkResult<()> {
        self.get_mut(id)?.sleep()
    }

    pub fn wake(&mut self, id: TransportId) -> LinkResult<()> {
        self.get_mut(id)?.wake()
    }

    /// Drains whatever every driver has ready, in driver order.
    pub fn poll(&mut self) -> Vec<(TransportId, Received)> {
        let mut out = Vec::new();
        for transport in self.transports.iter_mut() {
            while let Some(received) = transport.receive() {
                out.push((transport.id(), received));
            }
        }
        out
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub sent: u64,
    pub dropped: u64,
    pub received: u64,
}

/// One end of an in-process radio link.
///
/// Frames travel over tokio unbounded channels and are polled with
/// `try_recv`, so no runtime is needed. A sleeping endpoint refuses to
/// transmit but still hears its peer.
pub struct SimulatedTransport {
    id: TransportId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    loss: f32,
    awake: bool,
    rssi: i32,
    snr: f32,
    ranging_raw: Option<i32>,
    profile: Option<ModemProfile>,
    stats: SimStats,
}

impl SimulatedTransport {
    pub fn pair(id: TransportId) -> (SimulatedTransport, SimulatedTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(id, a_tx, b_rx), Self::new(id, b_tx, a_rx))
    }

    fn new(
        id: TransportId,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        SimulatedTransport {
            id,
            tx,
            rx,
            loss: 0.0,
            awake: true,
            rssi: -90,
            snr: 8.0,
            ranging_raw: None,
            profile: None,
            stats: SimStats::default(),
        }
    }

    /// Probability in [0, 1] that a transmitted frame is lost.
    pub fn with_loss(mut self, loss: f32) -> Self {
        self.loss = loss.clamp(0.0, 1.0);
        self
    }

    /// Raw ranging value reported with every received block.
    pub fn with_ranging_raw(mut self, raw: i32) -> Self {
        self.ranging_raw = Some(raw);
        self
    }

    pub fn profile(&self) -> Option<&ModemProfile> {
        self.profile.as_ref()
    }

    pub fn is_awake(&self) -> bool {
        self.awake
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }
}

impl Transport for SimulatedTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn transmit(&mut self, bytes: &[u8]) -> LinkResult<()> {
        if !self.awake {
            return Err(LinkError::transport_error(self.id, "asleep"));
        }
        if bytes.len() > LINK_FRAME_LEN {
            return Err(LinkError::transport_error(
                self.id,
                format!("block too large: {}", bytes.len()),
            ));
        }
        if self.loss > 0.0 && thread_rng().gen::<f32>() < self.loss {
            self.stats.dropped += 1;
            debug!("{}: simulated loss of {} bytes", self.id, bytes.len());
            return Ok(());
        }
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| LinkError::transport_error(self.id, "peer gone"))?;
        self.stats.sent += 1;
        trace!("{}: sent {}", self.id, hex::encode(&bytes[..bytes.len().min(12)]));
        Ok(())
    }

    fn receive(&mut self) -> Option<Received> {
        match self.rx.try_recv() {
            Ok(bytes) => {
                self.stats.received += 1;
                Some(Received {
                    bytes,
                    rssi: self.rssi,
                    snr: self.snr,
                    ranging_raw: self.ranging_raw,
                })
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn configure(&mut self, profile: &ModemProfile) -> LinkResult<()> {
        profile.validate(self.id)?;
        self.profile = Some(*profile);
        Ok(())
    }

    fn sleep(&mut self) -> LinkResult<()> {
        self.awake = false;
        Ok(())
    }

    fn wake(&mut self) -> LinkResult<()> {
        self.awake = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_delivers_both_ways() {
        let (mut a, mut b) = SimulatedTransport::pair(TransportId::Lora433);
        a.transmit(&[1, 2, 3]).unwrap();
        b.transmit(&[4]).unwrap();
        assert_eq!(b.receive().unwrap().bytes, vec![1, 2, 3]);
        assert!(b.receive().is_none());
        assert_eq!(a.receive().unwrap().bytes, vec![4]);
        assert_eq!(a.stats().sent, 1);
        assert_eq!(b.stats().received, 1);
    }

    #[test]
    fn test_asleep_refuses_transmit() {
        let (mut a, mut b) = SimulatedTransport::pair(TransportId::Fsk433);
        a.sleep().unwrap();
        assert!(matches!(
            a.transmit(&[1]),
            Err(LinkError::TransportError(TransportId::Fsk433, _))
        ));
        b.transmit(&[9]).unwrap();
        assert!(a.receive().is_some());
        a.wake().unwrap();
        a.transmit(&[1]).unwrap();
    }

    #[test]
    fn test_full_loss() {
        let (a, mut b) = SimulatedTransport::pair(TransportId::Lora24);
        let mut a = a.with_loss(1.0);
        a.transmit(&[1]).unwrap();
        assert!(b.receive().is_none());
        assert_eq!(a.stats().dropped, 1);
    }

    #[test]
    fn test_set_routes_by_id() {
        let (a433, mut b433) = SimulatedTransport::pair(TransportId::Lora433);
        let (a24, b24) = SimulatedTransport::pair(TransportId::Lora24);
        let mut b24 = b24.with_ranging_raw(13000);
        let mut set = TransportSet::new();
        set.insert(Box::new(a433));
        set.insert(Box::new(a24));

        set.transmit(TransportId::Lora24, &[7]).unwrap();
        assert!(b433.receive().is_none());
        assert_eq!(b24.receive().unwrap().ranging_raw, Some(13000));
        assert!(set.transmit(TransportId::Fsk433, &[7]).is_err());

        b433.transmit(&[5]).unwrap();
        let polled = set.poll();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].0, TransportId::Lora433);
    }

    #[test]
    fn test_configure_validates() {
        let (mut a, _b) = SimulatedTransport::pair(TransportId::Lora433);
        let mut profile = ModemProfile::default_for(TransportId::Lora433);
        a.configure(&profile).unwrap();
        assert_eq!(a.profile(), Some(&profile));
        profile.sf = 40;
        assert!(a.configure(&profile).is_err());
    }
}
