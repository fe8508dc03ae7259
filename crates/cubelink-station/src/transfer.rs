// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Chunked transfer of file-like payloads.
//!
//! The sending side splits a payload into `Chunk` records preceded by a
//! `ChunkMeta` descriptor and feeds them into a bounded outbox which the
//! arbiter drains as bulk traffic. The receiving side reassembles, checks
//! the digest and reports what is still missing so it can be re-requested.

use log::*;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};

use cubelink_link::{
    ld_type, BulkSource, Chunk, ChunkMeta, LinkFrame, MsgType, OverflowPolicy, RingBuffer,
    CHUNK_PAYLOAD_LEN,
};

use crate::{StationConfig, TransferError};

pub const TRANSFER_META_LEN: usize = 17;
pub const DIGEST_LEN: usize = 8;

// completed inbound sessions remembered so late duplicates are ignored
const RECENTLY_COMPLETED: usize = 16;
const MAX_OUTBOUND_SESSIONS: usize = 8;
const MAX_INBOUND_SESSIONS: usize = 8;

/// Descriptor carried in the ChunkMeta ahead of a chunk series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferMeta {
    pub total_size: u32,
    pub total_chunks: u16,
    pub file_seq: u16,
    pub kind: u8,
    /// first bytes of the payload's SHA-256
    pub digest: [u8; DIGEST_LEN],
}

fn chunk_count(size: usize) -> usize {
    size.div_ceil(CHUNK_PAYLOAD_LEN)
}

fn digest_of(payload: &[u8]) -> [u8; DIGEST_LEN] {
    let hash = Sha256::digest(payload);
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&hash[..DIGEST_LEN]);
    digest
}

impl TransferMeta {
    pub fn for_payload(file_seq: u16, payload: &[u8], kind: u8) -> Self {
        TransferMeta {
            total_size: payload.len() as u32,
            total_chunks: chunk_count(payload.len()) as u16,
            file_seq,
            kind,
            digest: digest_of(payload),
        }
    }

    pub fn to_chunk_meta(&self) -> Result<ChunkMeta, TransferError> {
        let mut data = [0u8; TRANSFER_META_LEN];
        data[0..4].copy_from_slice(&self.total_size.to_le_bytes());
        data[4..6].copy_from_slice(&self.total_chunks.to_le_bytes());
        data[6..8].copy_from_slice(&self.file_seq.to_le_bytes());
        data[8] = self.kind;
        data[9..].copy_from_slice(&self.digest);
        ChunkMeta::new(ld_type::META, &data)
            .map_err(|err| TransferError::invalid_chunk(err.to_string()))
    }

    pub fn from_chunk_meta(meta: &ChunkMeta) -> Result<Self, TransferError> {
        if meta.meta_type != ld_type::META {
            return Err(TransferError::invalid_chunk(format!(
                "meta type 0x{:02x}",
                meta.meta_type
            )));
        }
        let data = meta.data();
        if data.len() != TRANSFER_META_LEN {
            return Err(TransferError::invalid_chunk(format!(
                "meta size {}",
                data.len()
            )));
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&data[9..]);
        let parsed = TransferMeta {
            total_size: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            total_chunks: u16::from_le_bytes([data[4], data[5]]),
            file_seq: u16::from_le_bytes([data[6], data[7]]),
            kind: data[8],
            digest,
        };
        if chunk_count(parsed.total_size as usize) != parsed.total_chunks as usize {
            return Err(TransferError::invalid_chunk(format!(
                "{} chunks cannot hold {} bytes",
                parsed.total_chunks, parsed.total_size
            )));
        }
        Ok(parsed)
    }

    /// Expected payload length of chunk `index`.
    fn chunk_len(&self, index: u16) -> usize {
        let start = index as usize * CHUNK_PAYLOAD_LEN;
        (self.total_size as usize - start).min(CHUNK_PAYLOAD_LEN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextChunk {
    /// A chunk went into the outbox; `last` marks the end of its session.
    Chunk { chunk: Chunk, last: bool },
    /// Every session is fully queued.
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyState {
    Incomplete { missing: Vec<u16> },
    Complete(Vec<u8>),
    /// The chunk belongs to a session that has already completed.
    Duplicate,
}

/// Chunk indices the receiver should ask for again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRequest {
    pub file_seq: u16,
    pub need_meta: bool,
    pub missing: Vec<u16>,
}

#[derive(Debug)]
struct OutboundSession {
    meta: TransferMeta,
    payload: Vec<u8>,
    next_index: u16,
}

impl OutboundSession {
    fn chunk(&self, index: u16) -> Result<Chunk, TransferError> {
        let start = index as usize * CHUNK_PAYLOAD_LEN;
        let end = start + self.meta.chunk_len(index);
        Chunk::new(
            self.meta.file_seq,
            index,
            self.meta.kind,
            &self.payload[start..end],
        )
        .map_err(|err| TransferError::invalid_chunk(err.to_string()))
    }

    fn is_queued(&self) -> bool {
        self.next_index >= self.meta.total_chunks
    }
}

#[derive(Debug)]
struct PartialTransfer {
    meta: Option<TransferMeta>,
    chunks: BTreeMap<u16, Vec<u8>>,
    retry_at: u64,
}

impl PartialTransfer {
    fn missing(&self) -> Option<Vec<u16>> {
        self.meta.map(|meta| {
            (0..meta.total_chunks)
                .filter(|index| !self.chunks.contains_key(index))
                .collect()
        })
    }

    fn chunk_fits(meta: &TransferMeta, index: u16, kind: u8, len: usize) -> bool {
        index < meta.total_chunks && kind == meta.kind && len == meta.chunk_len(index)
    }
}

/// Which transfer session a queued bulk frame belongs to.
fn session_of(frame: &LinkFrame) -> Option<u16> {
    match frame.msg_type {
        MsgType::LargeData => frame.record::<Chunk>().ok().map(|c| c.file_seq),
        MsgType::Mv => frame
            .record::<ChunkMeta>()
            .ok()
            .and_then(|m| TransferMeta::from_chunk_meta(&m).ok())
            .map(|m| m.file_seq),
        _ => None,
    }
}

#[derive(Debug)]
pub struct TransferManager {
    local_address: u8,
    peer_address: u8,
    max_file_size: usize,
    missing_retry_ms: u64,
    outbound: VecDeque<OutboundSession>,
    outbox: RingBuffer<LinkFrame>,
    partials: BTreeMap<u16, PartialTransfer>,
    completed: VecDeque<u16>,
}

impl TransferManager {
    pub fn new(config: &StationConfig) -> Self {
        TransferManager {
            local_address: config.local_address,
            peer_address: config.peer_address,
            max_file_size: config.max_file_size,
            missing_retry_ms: config.missing_retry_ms,
            outbound: VecDeque::new(),
            outbox: RingBuffer::new(
                "outbox",
                config.outbox_capacity,
                OverflowPolicy::RejectNewest,
            ),
            partials: BTreeMap::new(),
            completed: VecDeque::new(),
        }
    }

    /// Frames waiting in the outbox.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    pub fn is_sending(&self, file_seq: u16) -> bool {
        self.outbound
            .iter()
            .any(|s| s.meta.file_seq == file_seq && !s.is_queued())
    }

    /// Starts streaming `payload`. The descriptor goes to the head of the
    /// outbox, chunks follow through `next_chunk`.
    pub fn begin_transfer(
        &mut self,
        file_seq: u16,
        payload: Vec<u8>,
        kind: u8,
    ) -> Result<ChunkMeta, TransferError> {
        let meta = self.register(file_seq, payload, kind, 0)?;
        let chunk_meta = meta.to_chunk_meta()?;
        self.push_meta(&chunk_meta, true)?;
        info!(
            "transfer {} started: {} bytes in {} chunks",
            file_seq, meta.total_size, meta.total_chunks
        );
        Ok(chunk_meta)
    }

    /// Registers a payload for resends and meta requests without queuing
    /// anything.
    pub fn load(
        &mut self,
        file_seq: u16,
        payload: Vec<u8>,
        kind: u8,
    ) -> Result<TransferMeta, TransferError> {
        let total = chunk_count(payload.len()) as u16;
        self.register(file_seq, payload, kind, total)
    }

    pub fn is_loaded(&self, file_seq: u16) -> bool {
        self.outbound.iter().any(|s| s.meta.file_seq == file_seq)
    }

    fn register(
        &mut self,
        file_seq: u16,
        payload: Vec<u8>,
        kind: u8,
        next_index: u16,
    ) -> Result<TransferMeta, TransferError> {
        if payload.len() > self.max_file_size
            || chunk_count(payload.len()) > u16::MAX as usize
        {
            return Err(TransferError::TooLarge {
                size: payload.len(),
                max: self.max_file_size,
            });
        }
        if self.outbox.is_full() && next_index == 0 {
            return Err(TransferError::QueueFull);
        }
        self.drop_outbound(file_seq);
        if self.outbound.len() >= MAX_OUTBOUND_SESSIONS {
            if let Some(pos) = self.outbound.iter().position(|s| s.is_queued()) {
                if let Some(old) = self.outbound.remove(pos) {
                    debug!("transfer {} no longer retained", old.meta.file_seq);
                }
            }
        }
        let meta = TransferMeta::for_payload(file_seq, &payload, kind);
        self.outbound.push_back(OutboundSession {
            meta,
            payload,
            next_index: next_index.min(meta.total_chunks),
        });
        Ok(meta)
    }

    fn push_meta(&mut self, meta: &ChunkMeta, front: bool) -> Result<(), TransferError> {
        let frame = LinkFrame::wrap(self.local_address, self.peer_address, MsgType::Mv, meta)
            .map_err(|err| TransferError::invalid_chunk(err.to_string()))?;
        let res = if front {
            self.outbox.push_front(frame)
        } else {
            self.outbox.try_push(frame)
        };
        res.map_err(|_| TransferError::QueueFull)
    }

    fn push_chunk(&mut self, chunk: &Chunk) -> Result<(), TransferError> {
        let frame =
            LinkFrame::wrap(self.local_address, self.peer_address, MsgType::LargeData, chunk)
                .map_err(|err| TransferError::invalid_chunk(err.to_string()))?;
        self.outbox
            .try_push(frame)
            .map_err(|_| TransferError::QueueFull)
    }

    /// Queues the descriptor of a retained session again.
    pub fn queue_meta(&mut self, file_seq: u16) -> Result<ChunkMeta, TransferError> {
        let meta = self
            .outbound
            .iter()
            .find(|s| s.meta.file_seq == file_seq)
            .ok_or(TransferError::UnknownSession(file_seq))?
            .meta
            .to_chunk_meta()?;
        self.push_meta(&meta, true)?;
        Ok(meta)
    }

    /// Moves the next chunk of the oldest unfinished session into the
    /// outbox. A full outbox leaves the session where it was.
    pub fn next_chunk(&mut self) -> Result<NextChunk, TransferError> {
        let Some(pos) = self.outbound.iter().position(|s| !s.is_queued()) else {
            return Ok(NextChunk::Done);
        };
        if self.outbox.is_full() {
            return Err(TransferError::QueueFull);
        }
        let session = &self.outbound[pos];
        let chunk = session.chunk(session.next_index)?;
        self.push_chunk(&chunk)?;
        let session = &mut self.outbound[pos];
        session.next_index += 1;
        let last = session.is_queued();
        if last {
            debug!("transfer {} fully queued", session.meta.file_seq);
        }
        Ok(NextChunk::Chunk { chunk, last })
    }

    /// Queues the listed chunks again. Chunks still waiting in the outbox
    /// are not duplicated. Either every eligible chunk is queued or none
    /// is. Returns how many were queued.
    pub fn resend(&mut self, file_seq: u16, indices: &[u16]) -> Result<usize, TransferError> {
        let pos = self
            .outbound
            .iter()
            .position(|s| s.meta.file_seq == file_seq)
            .ok_or(TransferError::UnknownSession(file_seq))?;
        let waiting: Vec<u16> = self
            .outbox
            .iter()
            .filter(|f| f.msg_type == MsgType::LargeData)
            .filter_map(|f| f.record::<Chunk>().ok())
            .filter(|c| c.file_seq == file_seq)
            .map(|c| c.file_index)
            .collect();
        let session = &self.outbound[pos];
        let mut chunks = Vec::new();
        for &index in indices {
            if index >= session.meta.total_chunks {
                warn!("transfer {}: no chunk {}", file_seq, index);
                continue;
            }
            // not sent yet, already waiting, or listed twice
            if index >= session.next_index
                || waiting.contains(&index)
                || chunks.iter().any(|c: &Chunk| c.file_index == index)
            {
                continue;
            }
            chunks.push(session.chunk(index)?);
        }
        if self.outbox.capacity() - self.outbox.len() < chunks.len() {
            warn!(
                "transfer {}: no room to resend {} chunks",
                file_seq,
                chunks.len()
            );
            return Err(TransferError::QueueFull);
        }
        for chunk in &chunks {
            self.push_chunk(chunk)?;
        }
        debug!("transfer {}: {} chunks queued for resend", file_seq, chunks.len());
        Ok(chunks.len())
    }

    fn drop_outbound(&mut self, file_seq: u16) -> bool {
        let before = self.outbound.len();
        self.outbound.retain(|s| s.meta.file_seq != file_seq);
        let before_queue = self.outbox.len();
        self.outbox.retain(|f| session_of(f) != Some(file_seq));
        before != self.outbound.len() || before_queue != self.outbox.len()
    }

    /// Drops every trace of one session, in both directions.
    pub fn abort(&mut self, file_seq: u16) -> bool {
        let outbound = self.drop_outbound(file_seq);
        let inbound = self.partials.remove(&file_seq).is_some();
        if outbound || inbound {
            info!("transfer {} aborted", file_seq);
        }
        outbound || inbound
    }

    fn partial(&mut self, file_seq: u16, now: u64) -> &mut PartialTransfer {
        if !self.partials.contains_key(&file_seq) && self.partials.len() >= MAX_INBOUND_SESSIONS
        {
            let stalest = self
                .partials
                .iter()
                .min_by_key(|(_, p)| p.retry_at)
                .map(|(&seq, _)| seq);
            if let Some(seq) = stalest {
                warn!("transfer {}: partial evicted", seq);
                self.partials.remove(&seq);
            }
        }
        let retry_ms = self.missing_retry_ms;
        self.partials
            .entry(file_seq)
            .or_insert_with(|| PartialTransfer {
                meta: None,
                chunks: BTreeMap::new(),
                retry_at: now + retry_ms,
            })
    }

    pub fn accept_meta(
        &mut self,
        chunk_meta: &ChunkMeta,
        now: u64,
    ) -> Result<ReassemblyState, TransferError> {
        let meta = TransferMeta::from_chunk_meta(chunk_meta)?;
        let file_seq = meta.file_seq;
        // a descriptor reopens a session, the file may be sent again
        self.completed.retain(|&seq| seq != file_seq);
        let retry_ms = self.missing_retry_ms;
        let partial = self.partial(file_seq, now);
        if partial.meta.is_some_and(|known| known != meta) {
            info!("transfer {}: new descriptor, partial discarded", file_seq);
            partial.chunks.clear();
        }
        partial.meta = Some(meta);
        partial.retry_at = now + retry_ms;
        partial
            .chunks
            .retain(|&index, data| PartialTransfer::chunk_fits(&meta, index, meta.kind, data.len()));
        self.try_complete(file_seq)
    }

    pub fn accept_chunk(
        &mut self,
        chunk: &Chunk,
        now: u64,
    ) -> Result<ReassemblyState, TransferError> {
        let file_seq = chunk.file_seq;
        if self.completed.contains(&file_seq) && !self.partials.contains_key(&file_seq) {
            trace!("transfer {}: late chunk {}", file_seq, chunk.file_index);
            return Ok(ReassemblyState::Duplicate);
        }
        let retry_ms = self.missing_retry_ms;
        let partial = self.partial(file_seq, now);
        if let Some(meta) = partial.meta {
            let len = chunk.data().len();
            if !PartialTransfer::chunk_fits(&meta, chunk.file_index, chunk.chunk_type, len) {
                return Err(TransferError::invalid_chunk(format!(
                    "transfer {}: chunk {} ({} bytes, kind 0x{:02x}) does not fit",
                    file_seq, chunk.file_index, len, chunk.chunk_type
                )));
            }
        }
        partial.retry_at = now + retry_ms;
        if partial.chunks.contains_key(&chunk.file_index) {
            trace!("transfer {}: duplicate chunk {}", file_seq, chunk.file_index);
        } else {
            partial
                .chunks
                .insert(chunk.file_index, chunk.data().to_vec());
        }
        self.try_complete(file_seq)
    }

    fn try_complete(&mut self, file_seq: u16) -> Result<ReassemblyState, TransferError> {
        let Some(partial) = self.partials.get(&file_seq) else {
            return Err(TransferError::UnknownSession(file_seq));
        };
        let Some(meta) = partial.meta else {
            return Ok(ReassemblyState::Incomplete {
                missing: Vec::new(),
            });
        };
        let missing = partial.missing().unwrap_or_default();
        if !missing.is_empty() {
            return Ok(ReassemblyState::Incomplete { missing });
        }
        let mut payload = Vec::with_capacity(meta.total_size as usize);
        for data in partial.chunks.values() {
            payload.extend_from_slice(data);
        }
        self.partials.remove(&file_seq);
        if digest_of(&payload) != meta.digest {
            warn!("transfer {}: digest mismatch, partial reset", file_seq);
            return Err(TransferError::DigestMismatch(file_seq));
        }
        if self.completed.len() >= RECENTLY_COMPLETED {
            self.completed.pop_front();
        }
        self.completed.push_back(file_seq);
        info!("transfer {} complete: {} bytes", file_seq, payload.len());
        Ok(ReassemblyState::Complete(payload))
    }

    /// Missing chunk indices of an inbound session, once its size is known.
    pub fn missing(&self, file_seq: u16) -> Option<Vec<u16>> {
        self.partials.get(&file_seq).and_then(|p| p.missing())
    }

    /// Inbound sessions that have been quiet for the retry interval.
    pub fn overdue_missing(&mut self, now: u64) -> Vec<MissingRequest> {
        let mut requests = Vec::new();
        for (&file_seq, partial) in self.partials.iter_mut() {
            if now < partial.retry_at {
                continue;
            }
            partial.retry_at = now + self.missing_retry_ms;
            requests.push(MissingRequest {
                file_seq,
                need_meta: partial.meta.is_none(),
                missing: partial.missing().unwrap_or_default(),
            });
        }
        requests
    }
}

impl BulkSource for TransferManager {
    fn has_bulk(&self) -> bool {
        !self.outbox.is_empty()
    }

    fn pop_bulk(&mut self) -> Option<LinkFrame> {
        self.outbox.pop()
    }

    fn requeue_bulk(&mut self, frame: LinkFrame) {
        if self.outbox.push_front(frame).is_err() {
            warn!("outbox full, failed bulk frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubelink_link::ADDR_GROUND;
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    fn manager(outbox: usize) -> TransferManager {
        TransferManager::new(&StationConfig {
            outbox_capacity: outbox,
            max_file_size: 4096,
            missing_retry_ms: 1000,
            ..StationConfig::spacecraft()
        })
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    // everything the outbox holds, decoded
    fn drain(tm: &mut TransferManager) -> (Vec<ChunkMeta>, Vec<Chunk>) {
        let mut metas = Vec::new();
        let mut chunks = Vec::new();
        while let Some(frame) = tm.pop_bulk() {
            assert_eq!(frame.destination, ADDR_GROUND);
            match frame.msg_type {
                MsgType::Mv => metas.push(frame.record::<ChunkMeta>().unwrap()),
                MsgType::LargeData => chunks.push(frame.record::<Chunk>().unwrap()),
                other => panic!("unexpected {}", other),
            }
        }
        (metas, chunks)
    }

    #[test]
    fn test_meta_layout() {
        let data = payload(500);
        let meta = TransferMeta::for_payload(7, &data, ld_type::IMAGE);
        assert_eq!(meta.total_chunks, 3);
        let chunk_meta = meta.to_chunk_meta().unwrap();
        assert_eq!(chunk_meta.meta_type, 0x14);
        assert_eq!(chunk_meta.data().len(), 17);
        assert_eq!(&chunk_meta.data()[..9], &[0xf4, 0x01, 0, 0, 3, 0, 7, 0, 1]);
        assert_eq!(TransferMeta::from_chunk_meta(&chunk_meta).unwrap(), meta);

        let bad = ChunkMeta::new(ld_type::META, &chunk_meta.data()[..16]).unwrap();
        assert!(TransferMeta::from_chunk_meta(&bad).is_err());
    }

    #[test]
    fn test_too_large() {
        let mut tm = manager(10);
        assert_eq!(
            tm.begin_transfer(1, payload(4097), ld_type::OTHER),
            Err(TransferError::TooLarge {
                size: 4097,
                max: 4096
            })
        );
        assert!(!tm.has_bulk());
    }

    #[test]
    fn test_meta_first_then_increasing_chunks() {
        let mut tm = manager(10);
        tm.begin_transfer(3, payload(500), ld_type::TEXT).unwrap();
        let mut indices = Vec::new();
        loop {
            match tm.next_chunk().unwrap() {
                NextChunk::Chunk { chunk, last } => {
                    indices.push(chunk.file_index);
                    assert_eq!(chunk.chunk_type, ld_type::TEXT);
                    assert_eq!(last, chunk.file_index == 2);
                }
                NextChunk::Done => break,
            }
        }
        assert_eq!(indices, vec![0, 1, 2]);
        let first = tm.pop_bulk().unwrap();
        assert_eq!(first.msg_type, MsgType::Mv);
        let (_, chunks) = drain(&mut tm);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].data().len(), 500 - 2 * CHUNK_PAYLOAD_LEN);
    }

    #[test]
    fn test_queue_full_is_resumable() {
        let mut tm = manager(3);
        tm.begin_transfer(1, payload(1000), ld_type::OTHER).unwrap();
        assert!(matches!(tm.next_chunk(), Ok(NextChunk::Chunk { .. })));
        assert!(matches!(tm.next_chunk(), Ok(NextChunk::Chunk { .. })));
        assert_eq!(tm.next_chunk(), Err(TransferError::QueueFull));
        assert_eq!(tm.next_chunk(), Err(TransferError::QueueFull));

        let (metas, chunks) = drain(&mut tm);
        assert_eq!(metas.len(), 1);
        assert_eq!(chunks.len(), 2);
        match tm.next_chunk().unwrap() {
            NextChunk::Chunk { chunk, .. } => assert_eq!(chunk.file_index, 2),
            NextChunk::Done => panic!("session ended early"),
        }
    }

    #[test]
    fn test_roundtrip_with_loss_and_selective_resend() {
        let mut sender = manager(20);
        let mut receiver = manager(20);
        let data = payload(1000);
        sender.begin_transfer(9, data.clone(), ld_type::IMAGE).unwrap();
        while let NextChunk::Chunk { .. } = sender.next_chunk().unwrap() {}
        let (metas, chunks) = drain(&mut sender);

        let mut state = receiver.accept_meta(&metas[0], 0).unwrap();
        for chunk in chunks.iter().filter(|c| c.file_index != 1 && c.file_index != 3) {
            state = receiver.accept_chunk(chunk, 10).unwrap();
        }
        assert_eq!(
            state,
            ReassemblyState::Incomplete {
                missing: vec![1, 3]
            }
        );
        assert_eq!(receiver.missing(9), Some(vec![1, 3]));

        // nothing is overdue before the retry interval
        assert!(receiver.overdue_missing(500).is_empty());
        let requests = receiver.overdue_missing(1010);
        assert_eq!(
            requests,
            vec![MissingRequest {
                file_seq: 9,
                need_meta: false,
                missing: vec![1, 3]
            }]
        );
        assert!(receiver.overdue_missing(1500).is_empty());

        assert_eq!(sender.resend(9, &[1, 3]).unwrap(), 2);
        let (_, resent) = drain(&mut sender);
        let resent_indices: Vec<u16> = resent.iter().map(|c| c.file_index).collect();
        assert_eq!(resent_indices, vec![1, 3]);

        assert!(matches!(
            receiver.accept_chunk(&resent[0], 20).unwrap(),
            ReassemblyState::Incomplete { .. }
        ));
        assert_eq!(
            receiver.accept_chunk(&resent[1], 20).unwrap(),
            ReassemblyState::Complete(data)
        );
        // late duplicates are ignored
        assert_eq!(
            receiver.accept_chunk(&chunks[0], 30).unwrap(),
            ReassemblyState::Duplicate
        );
        assert_eq!(receiver.missing(9), None);
    }

    #[test]
    fn test_resend_is_all_or_nothing() {
        let mut tm = manager(4);
        tm.load(3, payload(2000), ld_type::OTHER).unwrap();
        tm.begin_transfer(1, payload(100), ld_type::OTHER).unwrap();
        tm.next_chunk().unwrap();
        // two of four slots taken, three chunks do not fit
        assert_eq!(tm.pending(), 2);
        assert_eq!(tm.resend(3, &[0, 4, 8]), Err(TransferError::QueueFull));
        assert_eq!(tm.pending(), 2);

        // duplicates in the request count once
        assert_eq!(tm.resend(3, &[4, 8, 4]).unwrap(), 2);
        let (_, chunks) = drain(&mut tm);
        let indices: Vec<(u16, u16)> = chunks.iter().map(|c| (c.file_seq, c.file_index)).collect();
        assert_eq!(indices, vec![(1, 0), (3, 4), (3, 8)]);
    }

    #[test]
    fn test_any_arrival_order() {
        let mut sender = manager(40);
        let data = payload(3000);
        sender.begin_transfer(21, data.clone(), ld_type::IMAGE).unwrap();
        while let NextChunk::Chunk { .. } = sender.next_chunk().unwrap() {}
        let (metas, chunks) = drain(&mut sender);
        assert_eq!(chunks.len(), 14);
        let digest = TransferMeta::from_chunk_meta(&metas[0]).unwrap().digest;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..20 {
            let mut receiver = manager(40);
            let mut order: Vec<Option<&Chunk>> = chunks.iter().map(Some).collect();
            // the descriptor and one repeated chunk land anywhere
            order.push(None);
            order.push(Some(&chunks[rng.gen_range(0..chunks.len())]));
            order.shuffle(&mut rng);

            let mut done = None;
            for (ii, item) in order.iter().enumerate() {
                let state = match item {
                    Some(chunk) => receiver.accept_chunk(chunk, ii as u64).unwrap(),
                    None => receiver.accept_meta(&metas[0], ii as u64).unwrap(),
                };
                match state {
                    ReassemblyState::Complete(payload) => {
                        assert!(done.is_none(), "completed twice");
                        done = Some(payload);
                    }
                    ReassemblyState::Incomplete { .. } => assert!(done.is_none()),
                    ReassemblyState::Duplicate => assert!(done.is_some()),
                }
            }
            let payload = done.expect("transfer never completed");
            assert_eq!(digest_of(&payload), digest);
            assert_eq!(payload, data);
        }
    }

    #[test]
    fn test_resend_skips_waiting_chunks() {
        let mut tm = manager(20);
        tm.begin_transfer(2, payload(700), ld_type::OTHER).unwrap();
        while let NextChunk::Chunk { .. } = tm.next_chunk().unwrap() {}
        // chunk 0..3 are all still waiting in the outbox
        assert_eq!(tm.resend(2, &[0, 3, 9]).unwrap(), 0);
        assert_eq!(tm.resend(5, &[0]), Err(TransferError::UnknownSession(5)));
    }

    #[test]
    fn test_chunks_before_meta() {
        let mut sender = manager(20);
        let mut receiver = manager(20);
        let data = payload(300);
        sender.begin_transfer(4, data.clone(), ld_type::OTHER).unwrap();
        while let NextChunk::Chunk { .. } = sender.next_chunk().unwrap() {}
        let (metas, chunks) = drain(&mut sender);

        for chunk in &chunks {
            assert_eq!(
                receiver.accept_chunk(chunk, 0).unwrap(),
                ReassemblyState::Incomplete { missing: vec![] }
            );
        }
        let requests = receiver.overdue_missing(1000);
        assert!(requests[0].need_meta);
        assert_eq!(
            receiver.accept_meta(&metas[0], 1001).unwrap(),
            ReassemblyState::Complete(data)
        );
    }

    #[test]
    fn test_digest_mismatch_resets_partial() {
        let mut receiver = manager(20);
        let data = payload(100);
        let mut meta = TransferMeta::for_payload(6, &data, ld_type::OTHER);
        meta.digest[0] ^= 0xff;
        let chunk = Chunk::new(6, 0, ld_type::OTHER, &data).unwrap();
        receiver.accept_meta(&meta.to_chunk_meta().unwrap(), 0).unwrap();
        assert_eq!(
            receiver.accept_chunk(&chunk, 1),
            Err(TransferError::DigestMismatch(6))
        );
        assert_eq!(receiver.missing(6), None);
    }

    #[test]
    fn test_rejects_misfit_chunk() {
        let mut receiver = manager(20);
        let data = payload(300);
        let meta = TransferMeta::for_payload(8, &data, ld_type::OTHER);
        receiver.accept_meta(&meta.to_chunk_meta().unwrap(), 0).unwrap();
        let short = Chunk::new(8, 0, ld_type::OTHER, &data[..10]).unwrap();
        assert!(matches!(
            receiver.accept_chunk(&short, 1),
            Err(TransferError::InvalidChunk(_))
        ));
        let beyond = Chunk::new(8, 5, ld_type::OTHER, &data[..10]).unwrap();
        assert!(receiver.accept_chunk(&beyond, 1).is_err());
        assert_eq!(receiver.missing(8), Some(vec![0, 1]));
    }

    #[test]
    fn test_abort_only_touches_one_session() {
        let mut tm = manager(20);
        tm.begin_transfer(1, payload(300), ld_type::OTHER).unwrap();
        tm.begin_transfer(2, payload(300), ld_type::OTHER).unwrap();
        for _ in 0..4 {
            tm.next_chunk().unwrap();
        }
        assert_eq!(tm.pending(), 6);
        assert!(tm.abort(1));
        assert!(!tm.abort(1));
        let (metas, chunks) = drain(&mut tm);
        assert_eq!(metas.len(), 1);
        assert!(chunks.iter().all(|c| c.file_seq == 2));
        assert!(matches!(tm.queue_meta(1), Err(TransferError::UnknownSession(1))));
        assert!(tm.queue_meta(2).is_ok());
    }

    #[test]
    fn test_load_registers_without_queuing() {
        let mut tm = manager(20);
        let meta = tm.load(11, payload(500), ld_type::IMAGE).unwrap();
        assert_eq!(meta.total_chunks, 3);
        assert!(!tm.has_bulk());
        assert_eq!(tm.next_chunk().unwrap(), NextChunk::Done);
        assert_eq!(tm.resend(11, &[2]).unwrap(), 1);
        let (_, chunks) = drain(&mut tm);
        assert_eq!(chunks[0].file_index, 2);
    }

    #[test]
    fn test_empty_payload() {
        let mut sender = manager(20);
        let mut receiver = manager(20);
        let meta = sender.begin_transfer(12, Vec::new(), ld_type::TEXT).unwrap();
        assert_eq!(sender.next_chunk().unwrap(), NextChunk::Done);
        assert_eq!(
            receiver.accept_meta(&meta, 0).unwrap(),
            ReassemblyState::Complete(Vec::new())
        );
    }
}
