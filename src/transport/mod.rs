//! C9 Chunk Transport ("Bifrost"): a binary, length-prefixed, big-endian envelope carried over
//! `/graphql/stream`'s WebSocket, distinct from the standard GraphQL-over-WebSocket protocol
//! served at `/graphql/ws`. Large responses are split into CRC-checked chunks, sent within a
//! bounded ACK window, retransmitted on NACK, and resumable after a reconnect — all so a
//! client on a flaky link never has to replay the whole query to recover a large result.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::CoreError;

pub const DEFAULT_CHUNK_THRESHOLD: usize = 65536;
pub const DEFAULT_WINDOW: usize = 8;
pub const DEFAULT_RETRANSMIT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Query = 1,
    Result = 2,
    Error = 3,
    Chunk = 4,
    ChunkAck = 5,
    Resume = 6,
    ResumeAck = 7,
    ChunkNack = 8,
}

impl MessageKind {
    fn from_u8(v: u8) -> Result<Self, CoreError> {
        Ok(match v {
            1 => MessageKind::Query,
            2 => MessageKind::Result,
            3 => MessageKind::Error,
            4 => MessageKind::Chunk,
            5 => MessageKind::ChunkAck,
            6 => MessageKind::Resume,
            7 => MessageKind::ResumeAck,
            8 => MessageKind::ChunkNack,
            other => return Err(CoreError::validation(format!("unknown bifrost message kind {other}"))),
        })
    }
}

/// One frame of the chunk transport's wire protocol. Not every field is meaningful for every
/// `kind` — e.g. `query`/`variables_json` only carry data on `Query`, `payload`/`chunk_*` only
/// on `Chunk`.
#[derive(Debug, Clone, Default)]
pub struct BifrostMessage {
    pub kind: u8,
    pub request_id: u32,
    pub chunk_sequence: u32,
    pub chunk_total: u32,
    pub chunk_offset: u64,
    pub total_bytes: u64,
    pub chunk_checksum: u32,
    pub last_sequence: u32,
    pub query: String,
    pub variables_json: String,
    pub payload: Vec<u8>,
}

impl BifrostMessage {
    pub fn kind(&self) -> Result<MessageKind, CoreError> {
        MessageKind::from_u8(self.kind)
    }

    /// Big-endian, length-prefixed binary encoding. Deliberately not JSON/bincode: the chunk
    /// payload itself can be arbitrarily large binary data, and this format lets a receiver
    /// validate the CRC before it has even finished reading the frame's body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(41 + self.query.len() + self.variables_json.len() + self.payload.len());
        buf.push(self.kind);
        buf.extend_from_slice(&self.request_id.to_be_bytes());
        buf.extend_from_slice(&self.chunk_sequence.to_be_bytes());
        buf.extend_from_slice(&self.chunk_total.to_be_bytes());
        buf.extend_from_slice(&self.chunk_offset.to_be_bytes());
        buf.extend_from_slice(&self.total_bytes.to_be_bytes());
        buf.extend_from_slice(&self.chunk_checksum.to_be_bytes());
        buf.extend_from_slice(&self.last_sequence.to_be_bytes());
        write_bytes(&mut buf, self.query.as_bytes());
        write_bytes(&mut buf, self.variables_json.as_bytes());
        write_bytes(&mut buf, &self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let mut r = Reader::new(bytes);
        let kind = r.u8()?;
        let request_id = r.u32()?;
        let chunk_sequence = r.u32()?;
        let chunk_total = r.u32()?;
        let chunk_offset = r.u64()?;
        let total_bytes = r.u64()?;
        let chunk_checksum = r.u32()?;
        let last_sequence = r.u32()?;
        let query = String::from_utf8(r.bytes()?.to_vec()).map_err(|e| CoreError::validation(e.to_string()))?;
        let variables_json = String::from_utf8(r.bytes()?.to_vec()).map_err(|e| CoreError::validation(e.to_string()))?;
        let payload = r.bytes()?.to_vec();
        Ok(Self {
            kind,
            request_id,
            chunk_sequence,
            chunk_total,
            chunk_offset,
            total_bytes,
            chunk_checksum,
            last_sequence,
            query,
            variables_json,
            payload,
        })
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        let end = self.pos + n;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| CoreError::validation("bifrost frame truncated"))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CoreError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CoreError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<&'a [u8], CoreError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

/// Whether a response of `payload_len` bytes needs to be split into chunks at all. Small
/// responses go out as a single `Result` message, bypassing the whole windowed protocol.
pub fn requires_chunking(payload_len: usize, threshold: usize) -> bool {
    payload_len > threshold
}

/// Split `payload` into `Chunk` messages of at most `chunk_size` bytes each, CRC-stamped.
pub fn split(request_id: u32, payload: &[u8], chunk_size: usize) -> Vec<BifrostMessage> {
    let total_bytes = payload.len() as u64;
    let chunk_total = payload.len().div_ceil(chunk_size.max(1)).max(1) as u32;
    payload
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(i, chunk)| BifrostMessage {
            kind: MessageKind::Chunk as u8,
            request_id,
            chunk_sequence: i as u32,
            chunk_total,
            chunk_offset: (i * chunk_size) as u64,
            total_bytes,
            chunk_checksum: crc32fast::hash(chunk),
            last_sequence: 0,
            query: String::new(),
            variables_json: String::new(),
            payload: chunk.to_vec(),
        })
        .collect()
}

/// Reassembles a response on the receiving side, validating each chunk's CRC as it arrives.
pub struct Reassembler {
    request_id: u32,
    chunk_total: u32,
    total_bytes: u64,
    received: HashMap<u32, Vec<u8>>,
}

impl Reassembler {
    pub fn new(request_id: u32, chunk_total: u32, total_bytes: u64) -> Self {
        Self { request_id, chunk_total, total_bytes, received: HashMap::new() }
    }

    /// Returns `true` once every distinct chunk sequence has arrived. Duplicate arrivals of an
    /// already-seen sequence are accepted idempotently (the first copy wins).
    pub fn accept(&mut self, msg: &BifrostMessage) -> Result<bool, CoreError> {
        if msg.chunk_sequence >= self.chunk_total {
            return Err(CoreError::validation(format!(
                "chunk sequence {} out of range for total {}",
                msg.chunk_sequence, self.chunk_total
            )));
        }
        if crc32fast::hash(&msg.payload) != msg.chunk_checksum {
            return Err(CoreError::CrcMismatch(self.request_id, msg.chunk_sequence));
        }
        self.received.entry(msg.chunk_sequence).or_insert_with(|| msg.payload.clone());
        Ok(self.received.len() as u32 == self.chunk_total)
    }

    pub fn missing_sequences(&self) -> Vec<u32> {
        (0..self.chunk_total).filter(|s| !self.received.contains_key(s)).collect()
    }

    pub fn reassemble(self) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::with_capacity(self.total_bytes as usize);
        for seq in 0..self.chunk_total {
            let chunk = self
                .received
                .get(&seq)
                .ok_or_else(|| CoreError::validation(format!("missing chunk {seq} at reassembly")))?;
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }
}

/// `Idle -> Splitting -> Windowed -> Draining -> Completed | Aborted`, modelled explicitly so
/// the transition rules can be unit-tested without spinning up a real WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Splitting,
    Windowed,
    Draining,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEvent {
    StartSplit,
    AllChunksQueued,
    LastAckReceived,
    AllOutstandingDrained,
    Abort,
}

impl SenderState {
    pub fn transition(self, event: SenderEvent) -> Self {
        use SenderEvent::*;
        use SenderState::*;
        match (self, event) {
            (_, Abort) => Aborted,
            (Idle, StartSplit) => Splitting,
            (Splitting, AllChunksQueued) => Windowed,
            (Windowed, LastAckReceived) => Draining,
            (Draining, AllOutstandingDrained) => Completed,
            (state, _) => state,
        }
    }
}

/// One buffered, not-yet-expired chunk the sender can retransmit on NACK.
struct BufferedChunk {
    message: BifrostMessage,
    inserted_at: Instant,
}

/// Drives the windowed send side of one request's chunk stream over a live WebSocket.
pub struct ChunkSender {
    window: usize,
    ttl: Duration,
    notify: Notify,
    buffer: Mutex<HashMap<u32, BufferedChunk>>,
}

impl ChunkSender {
    pub fn new(window: usize, ttl: Duration) -> Self {
        Self {
            window,
            ttl,
            notify: Notify::new(),
            buffer: Mutex::new(HashMap::new()),
        }
    }

    fn outstanding(&self) -> usize {
        self.buffer.lock().len()
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        self.buffer.lock().retain(|_, entry| now.duration_since(entry.inserted_at) < self.ttl);
    }

    pub fn ack(&self, sequence: u32) {
        self.buffer.lock().remove(&sequence);
        self.notify.notify_waiters();
    }

    /// Sends every chunk in `messages`, waiting for the ACK window to have room before each
    /// send and retransmitting on an explicit `ChunkNack`. `state` lets the caller observe the
    /// state-machine transitions this run drives.
    ///
    /// `sink` is generic over `Sink<Message>` rather than `WebSocket` directly so a caller that
    /// needs to read ACKs/NACKs concurrently can split the socket and hand us just the write
    /// half (axum's `WebSocket` has no separate read/write access once split).
    pub async fn send_all<S>(&self, sink: &mut S, messages: Vec<BifrostMessage>) -> Result<SenderState, CoreError>
    where
        S: Sink<Message, Error = axum::Error> + Unpin,
    {
        let mut state = SenderState::Idle.transition(SenderEvent::StartSplit);
        for message in &messages {
            while self.outstanding() >= self.window {
                self.sweep_expired();
                self.notify.notified().await;
            }
            sink.send(Message::Binary(message.encode().into())).await.map_err(|e| CoreError::Internal(e.into()))?;
            self.buffer.lock().insert(
                message.chunk_sequence,
                BufferedChunk { message: message.clone(), inserted_at: Instant::now() },
            );
        }
        state = state.transition(SenderEvent::AllChunksQueued);

        while self.outstanding() > 0 {
            self.sweep_expired();
            self.notify.notified().await;
        }
        state = state.transition(SenderEvent::LastAckReceived).transition(SenderEvent::AllOutstandingDrained);
        Ok(state)
    }

    /// Retransmit a specific chunk in response to a `ChunkNack`, if it's still buffered.
    pub async fn retransmit<S>(&self, sink: &mut S, sequence: u32) -> Result<bool, CoreError>
    where
        S: Sink<Message, Error = axum::Error> + Unpin,
    {
        let message = self.buffer.lock().get(&sequence).map(|e| e.message.clone());
        match message {
            Some(message) => {
                sink.send(Message::Binary(message.encode().into())).await.map_err(|e| CoreError::Internal(e.into()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resend everything from `last_sequence + 1` onward after a reconnect, or report the
    /// resume as expired if those chunks have already fallen out of the TTL buffer.
    pub async fn resume_from<S>(&self, sink: &mut S, request_id: u32, last_sequence: u32) -> Result<(), CoreError>
    where
        S: Sink<Message, Error = axum::Error> + Unpin,
    {
        self.sweep_expired();
        let buffer = self.buffer.lock();
        let mut pending: Vec<_> = buffer.values().filter(|e| e.message.chunk_sequence > last_sequence).map(|e| e.message.clone()).collect();
        drop(buffer);
        if pending.is_empty() {
            return Err(CoreError::ResumeExpired(request_id));
        }
        pending.sort_by_key(|m| m.chunk_sequence);
        for message in pending {
            sink.send(Message::Binary(message.encode().into())).await.map_err(|e| CoreError::Internal(e.into()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let msg = BifrostMessage {
            kind: MessageKind::Chunk as u8,
            request_id: 42,
            chunk_sequence: 3,
            chunk_total: 10,
            chunk_offset: 300,
            total_bytes: 1000,
            chunk_checksum: crc32fast::hash(b"hello"),
            last_sequence: 0,
            query: "query { Users { Id } }".to_string(),
            variables_json: "{}".to_string(),
            payload: b"hello".to_vec(),
        };
        let decoded = BifrostMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.request_id, 42);
        assert_eq!(decoded.chunk_sequence, 3);
        assert_eq!(decoded.payload, b"hello");
        assert_eq!(decoded.kind().unwrap(), MessageKind::Chunk);
    }

    #[test]
    fn split_then_reassemble_recovers_original_bytes() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let chunks = split(1, &payload, 777);
        let mut reassembler = Reassembler::new(1, chunks[0].chunk_total, payload.len() as u64);
        let mut done = false;
        for chunk in &chunks {
            done = reassembler.accept(chunk).unwrap();
        }
        assert!(done);
        assert_eq!(reassembler.reassemble().unwrap(), payload);
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let mut msg = split(1, b"some payload bytes", 4)[0].clone();
        msg.chunk_checksum ^= 0xFFFF_FFFF;
        let mut reassembler = Reassembler::new(1, msg.chunk_total, 18);
        let err = reassembler.accept(&msg).unwrap_err();
        assert_eq!(err.code(), "crc-mismatch");
    }

    #[test]
    fn sequence_out_of_range_is_a_validation_error() {
        let mut reassembler = Reassembler::new(1, 2, 10);
        let bad = BifrostMessage { chunk_sequence: 5, chunk_total: 2, payload: vec![1], chunk_checksum: crc32fast::hash(&[1]), ..Default::default() };
        let err = reassembler.accept(&bad).unwrap_err();
        assert_eq!(err.code(), "validation-error");
    }

    #[test]
    fn duplicate_sequence_is_idempotent() {
        let chunks = split(1, b"abcdefgh", 4);
        let mut reassembler = Reassembler::new(1, chunks[0].chunk_total, 8);
        reassembler.accept(&chunks[0]).unwrap();
        let still_ok = reassembler.accept(&chunks[0]).unwrap();
        assert!(!still_ok);
    }

    #[test]
    fn state_machine_follows_the_documented_chain() {
        let mut state = SenderState::Idle;
        state = state.transition(SenderEvent::StartSplit);
        assert_eq!(state, SenderState::Splitting);
        state = state.transition(SenderEvent::AllChunksQueued);
        assert_eq!(state, SenderState::Windowed);
        state = state.transition(SenderEvent::LastAckReceived);
        assert_eq!(state, SenderState::Draining);
        state = state.transition(SenderEvent::AllOutstandingDrained);
        assert_eq!(state, SenderState::Completed);
    }

    #[test]
    fn abort_is_reachable_from_any_state() {
        assert_eq!(SenderState::Windowed.transition(SenderEvent::Abort), SenderState::Aborted);
        assert_eq!(SenderState::Splitting.transition(SenderEvent::Abort), SenderState::Aborted);
    }
}
