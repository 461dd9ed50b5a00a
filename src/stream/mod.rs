//! Streams: ordered byte buffers with send/recv halves and flow control.
//!
//! A stream is one concrete value carrying up to two halves; bidirectional
//! streams have both, unidirectional streams one. Halves never point back at
//! the connection. The connection addresses them by stream id and supplies
//! whatever context an operation needs.

pub mod set;

use crate::error::{Error, Result};
use crate::flow_control::FlowControl;
use crate::types::{Role, INITIAL_MAX_STREAM_DATA};
use bytes::Bytes;
use tracing::{debug, trace};

/// Write slab size; larger writes are split into chunks of this many octets.
const WRITE_SLAB: usize = 1024;

// ============================================================================
// Stream identity
// ============================================================================

/// The four stream-type quadrants. "Local" always means initiated by this
/// endpoint, regardless of role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    BidiLocal,
    BidiRemote,
    UniLocal,
    UniRemote,
}

/// Classify a stream id from this endpoint's perspective. Bit 0 of the id
/// names the initiating role (0 = client), bit 1 unidirectionality.
pub fn stream_type_from_id(id: u64, role: Role) -> StreamType {
    let server_initiated = id & 0x1 != 0;
    let local = match role {
        Role::Client => !server_initiated,
        Role::Server => server_initiated,
    };
    let uni = id & 0x2 != 0;
    match (uni, local) {
        (false, true) => StreamType::BidiLocal,
        (false, false) => StreamType::BidiRemote,
        (true, true) => StreamType::UniLocal,
        (true, false) => StreamType::UniRemote,
    }
}

// ============================================================================
// Chunks
// ============================================================================

/// A contiguous run of stream octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub offset: u64,
    /// Final chunk of the stream.
    pub last: bool,
    pub data: Bytes,
}

impl StreamChunk {
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Insert a chunk keeping the list sorted by offset. Appending at the tail
/// is the overwhelmingly common case and skips the scan.
fn insert_sorted_chunk(chunks: &mut Vec<StreamChunk>, chunk: StreamChunk) {
    match chunks.last() {
        None => chunks.push(chunk),
        Some(tail) if chunk.offset > tail.offset => chunks.push(chunk),
        _ => {
            let at = chunks
                .iter()
                .position(|c| chunk.offset < c.offset)
                .unwrap_or(chunks.len());
            chunks.insert(at, chunk);
        }
    }
}

// ============================================================================
// Send half
// ============================================================================

/// States of a send half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStreamState {
    Open,
    Send,
    /// A final chunk is queued but has not gone to the wire yet.
    CloseQueued,
    DataSent,
    ResetSent,
}

/// The sending side of a stream.
#[derive(Debug)]
pub struct SendHalf {
    state: SendStreamState,
    /// Next write offset.
    offset: u64,
    chunks: Vec<StreamChunk>,
    /// Peer-granted credit; `used` is the highest offset handed to the wire.
    pub fc: FlowControl,
    /// STREAM_BLOCKED already reported once for the current stall.
    blocked_reported: bool,
}

impl SendHalf {
    pub fn new(initial_max: u64) -> Self {
        Self {
            state: SendStreamState::Open,
            offset: 0,
            chunks: Vec::new(),
            fc: FlowControl::new(initial_max),
            blocked_reported: false,
        }
    }

    pub fn state(&self) -> SendStreamState {
        self.state
    }

    fn set_state(&mut self, state: SendStreamState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "send half state");
            self.state = state;
        }
    }

    /// Queue `data` for transmission at the current write offset.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self.state {
            SendStreamState::Open => self.set_state(SendStreamState::Send),
            SendStreamState::Send => {}
            _ => return Err(Error::StreamClosed),
        }
        for slab in data.chunks(WRITE_SLAB) {
            insert_sorted_chunk(
                &mut self.chunks,
                StreamChunk {
                    offset: self.offset,
                    last: false,
                    data: Bytes::copy_from_slice(slab),
                },
            );
            self.offset += slab.len() as u64;
        }
        Ok(data.len())
    }

    /// Queue the end-of-stream marker.
    pub fn close(&mut self) {
        match self.state {
            SendStreamState::Open | SendStreamState::Send => {
                insert_sorted_chunk(
                    &mut self.chunks,
                    StreamChunk { offset: self.offset, last: true, data: Bytes::new() },
                );
                self.set_state(SendStreamState::CloseQueued);
            }
            _ => {}
        }
    }

    /// Abandon the half. The connection sends the RST_STREAM frame; the
    /// final offset it must carry is returned.
    pub fn reset(&mut self) -> u64 {
        self.chunks.clear();
        self.set_state(SendStreamState::ResetSent);
        self.offset
    }

    /// Pop every queued chunk flow control permits, in offset order. The
    /// second return is the one-shot blocked indication.
    pub fn output_writable(&mut self) -> (Vec<StreamChunk>, bool) {
        let mut out = Vec::new();
        let mut blocked = false;
        while let Some(chunk) = self.chunks.first() {
            if chunk.end() > self.fc.max {
                blocked = true;
                debug!(
                    max = self.fc.max,
                    offset = chunk.offset,
                    len = chunk.data.len(),
                    "stream blocked by flow control"
                );
                break;
            }
            let chunk = self.chunks.remove(0);
            if chunk.last {
                self.set_state(SendStreamState::DataSent);
            }
            if chunk.end() > self.fc.used {
                self.fc.used = chunk.end();
            }
            out.push(chunk);
        }

        // Report a stall only once until credit arrives again.
        if self.blocked_reported {
            blocked = false;
        } else {
            self.blocked_reported = blocked;
        }
        (out, blocked)
    }

    /// Account for handshake bytes that bypassed the chunk queue (the
    /// client hello travels inside the Initial, not through `write`).
    pub fn mark_consumed(&mut self, offset: u64) {
        debug_assert!(self.chunks.is_empty());
        self.offset = offset;
        if offset > self.fc.used {
            self.fc.used = offset;
        }
        if self.state == SendStreamState::Open {
            self.set_state(SendStreamState::Send);
        }
    }

    /// MAX_STREAM_DATA from the peer.
    pub fn process_max_stream_data(&mut self, maximum: u64) {
        if maximum < self.fc.max {
            return;
        }
        self.fc.update(maximum);
        self.blocked_reported = false;
    }

    /// Octets queued but not yet released to the wire.
    pub fn outstanding_queued_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }
}

// ============================================================================
// Recv half
// ============================================================================

/// States of a receive half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStreamState {
    Recv,
    SizeKnown,
    ResetRecvd,
    DataRead,
}

/// The receiving side of a stream.
#[derive(Debug)]
pub struct RecvHalf {
    state: RecvStreamState,
    /// Next offset the application will read.
    read_offset: u64,
    chunks: Vec<StreamChunk>,
    /// Credit we granted the peer; `used` tracks the highest received end.
    pub fc: FlowControl,
    /// Highest contiguous-or-not stream offset seen (final size once known).
    last_received: u64,
    readable: bool,
}

impl RecvHalf {
    pub fn new(initial_max: u64) -> Self {
        Self {
            state: RecvStreamState::Recv,
            read_offset: 0,
            chunks: Vec::new(),
            fc: FlowControl::new(initial_max),
            last_received: 0,
            readable: false,
        }
    }

    pub fn state(&self) -> RecvStreamState {
        self.state
    }

    fn set_state(&mut self, state: RecvStreamState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "recv half state");
            self.state = state;
        }
    }

    pub fn last_received(&self) -> u64 {
        self.last_received
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Account for handshake bytes consumed outside the chunk queue (the
    /// client hello is parsed straight out of the Initial).
    pub fn mark_consumed(&mut self, offset: u64) {
        debug_assert!(self.chunks.is_empty());
        self.read_offset = offset;
        if offset > self.last_received {
            self.last_received = offset;
        }
        if offset > self.fc.used {
            self.fc.used = offset;
        }
    }

    /// Take the readable flag, returning whether it was set.
    pub fn clear_readable(&mut self) -> bool {
        core::mem::take(&mut self.readable)
    }

    /// Ingest a STREAM frame. `conn_fc` is the connection-level receive
    /// window; both credit checks happen here so a violating frame leaves
    /// no partial state behind.
    pub fn new_frame_data(
        &mut self,
        offset: u64,
        last: bool,
        data: Bytes,
        conn_fc: &mut FlowControl,
    ) -> Result<()> {
        let end = offset + data.len() as u64;
        trace!(offset, len = data.len(), last, "new stream data");

        if end > self.fc.max {
            return Err(Error::FlowControl);
        }

        if last {
            if end < self.last_received {
                // The final offset cannot retract data already seen.
                return Err(Error::FinalOffset);
            }
            if self.state == RecvStreamState::SizeKnown && end != self.last_received {
                return Err(Error::FinalOffset);
            }
            self.account_new_bytes(end, conn_fc);
            if self.state == RecvStreamState::Recv {
                self.set_state(RecvStreamState::SizeKnown);
            }
        } else if end > self.last_received {
            if self.state != RecvStreamState::Recv {
                // Nothing may extend the stream once its size is known.
                return Err(Error::FinalOffset);
            }
            self.account_new_bytes(end, conn_fc);
        }

        if self.state != RecvStreamState::Recv && self.state != RecvStreamState::SizeKnown {
            // Reset or fully read; late data is dropped silently.
            return Ok(());
        }

        insert_sorted_chunk(&mut self.chunks, StreamChunk { offset, last, data });
        if self.chunks[0].offset <= self.read_offset {
            self.readable = true;
        }
        Ok(())
    }

    fn account_new_bytes(&mut self, end: u64, conn_fc: &mut FlowControl) {
        let fresh = end.saturating_sub(self.last_received);
        self.last_received = end;
        self.fc.used = self.fc.used.max(end);
        conn_fc.consume(fresh);
    }

    /// Read into `buf` in offset order. `Ok(0)` signals end of stream;
    /// `Err(WouldBlock)` signals no data yet.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0;

        loop {
            if read == buf.len() {
                break;
            }
            let Some(chunk) = self.chunks.first() else { break };
            if chunk.offset > self.read_offset {
                break; // gap
            }

            // A chunk whose octets were all delivered by earlier overlaps.
            if chunk.end() <= self.read_offset {
                let last = chunk.last;
                self.chunks.remove(0);
                if last {
                    self.set_state(RecvStreamState::DataRead);
                    self.chunks.clear();
                    break;
                }
                continue;
            }

            let skip = (self.read_offset - chunk.offset) as usize;
            let data = chunk.data.slice(skip..);
            let n = data.len().min(buf.len() - read);
            buf[read..read + n].copy_from_slice(&data[..n]);
            self.read_offset += n as u64;
            read += n;

            if self.read_offset >= chunk.end() {
                let last = chunk.last;
                self.chunks.remove(0);
                if last {
                    self.set_state(RecvStreamState::DataRead);
                    self.chunks.clear();
                    break;
                }
            } else {
                break; // buf full
            }
        }

        if read == 0 {
            return match self.state {
                RecvStreamState::Recv | RecvStreamState::SizeKnown => Err(Error::WouldBlock),
                RecvStreamState::DataRead => Ok(0),
                _ => Err(Error::StreamClosed),
            };
        }
        Ok(read)
    }

    /// RST_STREAM from the peer.
    pub fn handle_reset(&mut self, final_offset: u64) -> Result<()> {
        match self.state {
            RecvStreamState::Recv => {
                self.last_received = final_offset;
            }
            RecvStreamState::SizeKnown | RecvStreamState::DataRead => {
                if final_offset != self.last_received {
                    return Err(Error::ProtocolViolation);
                }
            }
            RecvStreamState::ResetRecvd => {}
        }
        self.set_state(RecvStreamState::ResetRecvd);
        self.chunks.clear();
        Ok(())
    }

    /// Decide whether to refresh the peer's credit. When the remaining
    /// window falls under half the initial allotment, widen it and return
    /// the new maximum to advertise.
    pub fn credit_max_stream_data(&mut self, force: bool) -> Option<u64> {
        let remaining = self.fc.max.saturating_sub(self.last_received);
        if !force && remaining >= INITIAL_MAX_STREAM_DATA / 2 {
            return None;
        }
        let new_max = self.fc.max.saturating_add(INITIAL_MAX_STREAM_DATA);
        self.fc.max = new_max;
        Some(new_max)
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A stream value: identity plus whichever halves its type grants.
#[derive(Debug)]
pub struct Stream {
    id: u64,
    send: Option<SendHalf>,
    recv: Option<RecvHalf>,
}

impl Stream {
    pub fn bidi(id: u64, send_max: u64, recv_max: u64) -> Self {
        Self {
            id,
            send: Some(SendHalf::new(send_max)),
            recv: Some(RecvHalf::new(recv_max)),
        }
    }

    pub fn send_only(id: u64, send_max: u64) -> Self {
        Self { id, send: Some(SendHalf::new(send_max)), recv: None }
    }

    pub fn recv_only(id: u64, recv_max: u64) -> Self {
        Self { id, send: None, recv: Some(RecvHalf::new(recv_max)) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self) -> Option<&SendHalf> {
        self.send.as_ref()
    }

    pub fn send_mut(&mut self) -> Option<&mut SendHalf> {
        self.send.as_mut()
    }

    pub fn recv(&self) -> Option<&RecvHalf> {
        self.recv.as_ref()
    }

    pub fn recv_mut(&mut self) -> Option<&mut RecvHalf> {
        self.recv.as_mut()
    }
}
