//! QUIC frame types and their wire encoding.
//!
//! One tagged variant per frame kind; matches are exhaustive everywhere a
//! frame is dispatched. Decoding lives in [`parse`].
//!
//! Queued frames ([`QueuedFrame`]) carry their wire encoding plus the
//! retransmission record: every packet number that carried the frame, the
//! subset of those considered lost, and the `needs_transmit` latch the flush
//! loop honors.

pub mod parse;

use crate::error::Result;
use crate::types::{ConnectionId, Instant, VarInt, RESET_TOKEN_LENGTH};
use bytes::Bytes;
use tinyvec::TinyVec;

// ============================================================================
// Frame type octets
// ============================================================================

pub const FRAME_TYPE_PADDING: u8 = 0x00;
pub const FRAME_TYPE_RST_STREAM: u8 = 0x01;
pub const FRAME_TYPE_CONNECTION_CLOSE: u8 = 0x02;
pub const FRAME_TYPE_MAX_DATA: u8 = 0x04;
pub const FRAME_TYPE_MAX_STREAM_DATA: u8 = 0x05;
pub const FRAME_TYPE_MAX_STREAM_ID: u8 = 0x06;
pub const FRAME_TYPE_PING: u8 = 0x07;
pub const FRAME_TYPE_BLOCKED: u8 = 0x08;
pub const FRAME_TYPE_STREAM_BLOCKED: u8 = 0x09;
pub const FRAME_TYPE_STREAM_ID_BLOCKED: u8 = 0x0a;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u8 = 0x0b;
pub const FRAME_TYPE_STOP_SENDING: u8 = 0x0c;
pub const FRAME_TYPE_ACK: u8 = 0x0d;
pub const FRAME_TYPE_PATH_CHALLENGE: u8 = 0x0e;
pub const FRAME_TYPE_PATH_RESPONSE: u8 = 0x0f;

/// STREAM frames occupy 0x10-0x17 with flags in the low bits.
pub const FRAME_TYPE_STREAM_BASE: u8 = 0x10;
pub const STREAM_BIT_FIN: u8 = 0x01;
pub const STREAM_BIT_LEN: u8 = 0x02;
pub const STREAM_BIT_OFF: u8 = 0x04;

// ============================================================================
// ACK ranges
// ============================================================================

/// A run of acknowledged packet numbers, named by its highest member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckRange {
    /// Highest packet number in the range.
    pub largest: u64,
    /// Total packets in the range (at least 1).
    pub count: u64,
}

impl AckRange {
    /// Lowest packet number in the range.
    pub fn smallest(&self) -> u64 {
        self.largest - (self.count - 1)
    }
}

/// Ranges in descending packet-number order.
pub type AckRanges = TinyVec<[AckRange; 8]>;

/// Decoded ACK frame contents.
///
/// Wire layout: `largest | ack-delay(us) | block-count | first-block |
/// (gap, length)*`, all varints. Blocks describe descending ranges:
/// `end = last - gap - 2`, `start = end - length` where `last` starts at the
/// first range's start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acked: u64,
    /// Microseconds between receiving `largest_acked` and sending this ACK.
    pub ack_delay: u64,
    /// Packets immediately below `largest_acked` also acked (count - 1).
    pub first_block: u64,
    pub blocks: TinyVec<[AckBlock; 8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckBlock {
    pub gap: u64,
    pub length: u64,
}

impl AckFrame {
    /// Build an ACK frame from descending ranges, consuming as many as fit
    /// in `room` encoded octets. Returns the frame and how many input
    /// ranges it covers; ranges not consumed stay pending for later ACKs.
    pub fn from_ranges(ranges: &[AckRange], ack_delay: u64, room: usize) -> Option<(AckFrame, usize)> {
        let first = ranges.first()?;
        let mut frame = AckFrame {
            largest_acked: first.largest,
            ack_delay,
            first_block: first.count - 1,
            blocks: TinyVec::new(),
        };
        let mut used = 1 + VarInt::size(first.largest) + VarInt::size(ack_delay)
            + VarInt::size(first.count - 1)
            + 8; // block count, worst case
        if used > room {
            return None;
        }

        let mut consumed = 1;
        let mut last_start = first.smallest();
        for range in &ranges[1..] {
            // Ranges are descending with at least one missing pn between
            // them, so the gap arithmetic cannot underflow.
            let gap = last_start - range.largest - 2;
            let length = range.count - 1;
            let cost = VarInt::size(gap) + VarInt::size(length);
            if used + cost > room {
                break;
            }
            frame.blocks.push(AckBlock { gap, length });
            used += cost;
            last_start = range.smallest();
            consumed += 1;
        }
        Some((frame, consumed))
    }

    /// Reconstruct the descending ranges this frame covers, applying the
    /// skip-but-advance rule to zero-length blocks.
    pub fn ranges(&self) -> AckRanges {
        let mut out: AckRanges = TinyVec::new();
        let end = self.largest_acked;
        let start = end - self.first_block;
        out.push(AckRange { largest: end, count: end - start + 1 });

        let mut last = start;
        for block in &self.blocks {
            if block.length == 0 {
                // Peer sent a pure gap; skip it but keep descending.
                last -= block.gap;
                continue;
            }
            let end = last - block.gap - 2;
            let start = end - block.length;
            out.push(AckRange { largest: end, count: end - start + 1 });
            last = start;
        }
        out
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Every frame kind this endpoint sends or accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    RstStream {
        stream_id: u64,
        error_code: u16,
        final_offset: u64,
    },
    ConnectionClose {
        error_code: u16,
        reason: Bytes,
    },
    MaxData {
        maximum: u64,
    },
    MaxStreamData {
        stream_id: u64,
        maximum: u64,
    },
    MaxStreamId {
        maximum: u64,
    },
    Ping,
    Blocked {
        offset: u64,
    },
    StreamBlocked {
        stream_id: u64,
        offset: u64,
    },
    StreamIdBlocked {
        stream_id: u64,
    },
    NewConnectionId {
        sequence: u64,
        connection_id: ConnectionId,
        reset_token: [u8; RESET_TOKEN_LENGTH],
    },
    StopSending {
        stream_id: u64,
        error_code: u16,
    },
    Ack(AckFrame),
    PathChallenge {
        data: [u8; 8],
    },
    PathResponse {
        data: [u8; 8],
    },
    Stream {
        stream_id: u64,
        offset: u64,
        fin: bool,
        data: Bytes,
    },
}

impl Frame {
    /// Serialize to the wire encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.rough_size());
        match self {
            Frame::Padding => out.push(FRAME_TYPE_PADDING),
            Frame::RstStream { stream_id, error_code, final_offset } => {
                out.push(FRAME_TYPE_RST_STREAM);
                VarInt::encode(*stream_id, &mut out)?;
                out.extend_from_slice(&error_code.to_be_bytes());
                VarInt::encode(*final_offset, &mut out)?;
            }
            Frame::ConnectionClose { error_code, reason } => {
                out.push(FRAME_TYPE_CONNECTION_CLOSE);
                out.extend_from_slice(&error_code.to_be_bytes());
                VarInt::encode(reason.len() as u64, &mut out)?;
                out.extend_from_slice(reason);
            }
            Frame::MaxData { maximum } => {
                out.push(FRAME_TYPE_MAX_DATA);
                VarInt::encode(*maximum, &mut out)?;
            }
            Frame::MaxStreamData { stream_id, maximum } => {
                out.push(FRAME_TYPE_MAX_STREAM_DATA);
                VarInt::encode(*stream_id, &mut out)?;
                VarInt::encode(*maximum, &mut out)?;
            }
            Frame::MaxStreamId { maximum } => {
                out.push(FRAME_TYPE_MAX_STREAM_ID);
                VarInt::encode(*maximum, &mut out)?;
            }
            Frame::Ping => out.push(FRAME_TYPE_PING),
            Frame::Blocked { offset } => {
                out.push(FRAME_TYPE_BLOCKED);
                VarInt::encode(*offset, &mut out)?;
            }
            Frame::StreamBlocked { stream_id, offset } => {
                out.push(FRAME_TYPE_STREAM_BLOCKED);
                VarInt::encode(*stream_id, &mut out)?;
                VarInt::encode(*offset, &mut out)?;
            }
            Frame::StreamIdBlocked { stream_id } => {
                out.push(FRAME_TYPE_STREAM_ID_BLOCKED);
                VarInt::encode(*stream_id, &mut out)?;
            }
            Frame::NewConnectionId { sequence, connection_id, reset_token } => {
                out.push(FRAME_TYPE_NEW_CONNECTION_ID);
                VarInt::encode(*sequence, &mut out)?;
                out.push(connection_id.len() as u8);
                out.extend_from_slice(connection_id.as_bytes());
                out.extend_from_slice(reset_token);
            }
            Frame::StopSending { stream_id, error_code } => {
                out.push(FRAME_TYPE_STOP_SENDING);
                VarInt::encode(*stream_id, &mut out)?;
                out.extend_from_slice(&error_code.to_be_bytes());
            }
            Frame::Ack(ack) => {
                out.push(FRAME_TYPE_ACK);
                VarInt::encode(ack.largest_acked, &mut out)?;
                VarInt::encode(ack.ack_delay, &mut out)?;
                VarInt::encode(ack.blocks.len() as u64, &mut out)?;
                VarInt::encode(ack.first_block, &mut out)?;
                for block in &ack.blocks {
                    VarInt::encode(block.gap, &mut out)?;
                    VarInt::encode(block.length, &mut out)?;
                }
            }
            Frame::PathChallenge { data } => {
                out.push(FRAME_TYPE_PATH_CHALLENGE);
                out.extend_from_slice(data);
            }
            Frame::PathResponse { data } => {
                out.push(FRAME_TYPE_PATH_RESPONSE);
                out.extend_from_slice(data);
            }
            Frame::Stream { stream_id, offset, fin, data } => {
                let mut ty = FRAME_TYPE_STREAM_BASE | STREAM_BIT_LEN;
                if *offset > 0 {
                    ty |= STREAM_BIT_OFF;
                }
                if *fin {
                    ty |= STREAM_BIT_FIN;
                }
                out.push(ty);
                VarInt::encode(*stream_id, &mut out)?;
                if *offset > 0 {
                    VarInt::encode(*offset, &mut out)?;
                }
                VarInt::encode(data.len() as u64, &mut out)?;
                out.extend_from_slice(data);
            }
        }
        Ok(out)
    }

    fn rough_size(&self) -> usize {
        match self {
            Frame::Stream { data, .. } => data.len() + 16,
            Frame::ConnectionClose { reason, .. } => reason.len() + 8,
            _ => 32,
        }
    }

    /// Frames whose receipt does not by itself justify path migration.
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            Frame::Padding
                | Frame::PathChallenge { .. }
                | Frame::PathResponse { .. }
                | Frame::NewConnectionId { .. }
        )
    }

    /// Only ACK frames are exempt from eliciting an acknowledgment.
    pub fn is_ack(&self) -> bool {
        matches!(self, Frame::Ack(_))
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Padding => "PADDING",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::ConnectionClose { .. } => "CONNECTION_CLOSE",
            Frame::MaxData { .. } => "MAX_DATA",
            Frame::MaxStreamData { .. } => "MAX_STREAM_DATA",
            Frame::MaxStreamId { .. } => "MAX_STREAM_ID",
            Frame::Ping => "PING",
            Frame::Blocked { .. } => "BLOCKED",
            Frame::StreamBlocked { .. } => "STREAM_BLOCKED",
            Frame::StreamIdBlocked { .. } => "STREAM_ID_BLOCKED",
            Frame::NewConnectionId { .. } => "NEW_CONNECTION_ID",
            Frame::StopSending { .. } => "STOP_SENDING",
            Frame::Ack(_) => "ACK",
            Frame::PathChallenge { .. } => "PATH_CHALLENGE",
            Frame::PathResponse { .. } => "PATH_RESPONSE",
            Frame::Stream { .. } => "STREAM",
        }
    }
}

// ============================================================================
// Queued frames
// ============================================================================

/// An outgoing frame waiting on one of the two output queues, together with
/// its retransmission record.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub frame: Frame,
    /// Wire encoding, computed once at enqueue time.
    pub encoded: Bytes,
    /// Packet numbers that have carried this frame.
    pub pns: Vec<u64>,
    /// Subset of `pns` the congestion controller declared lost.
    pub lost_pns: Vec<u64>,
    /// Include in the next flush regardless of retransmission age.
    pub needs_transmit: bool,
    /// When the frame last went on the wire.
    pub last_send: Option<Instant>,
}

impl QueuedFrame {
    pub fn new(frame: Frame) -> Result<Self> {
        let encoded = Bytes::from(frame.encode()?);
        Ok(Self {
            frame,
            encoded,
            pns: Vec::new(),
            lost_pns: Vec::new(),
            needs_transmit: true,
            last_send: None,
        })
    }

    pub fn wire_len(&self) -> usize {
        self.encoded.len()
    }

    /// Record that `pn` was declared lost. Returns true when every carrier
    /// of this frame is now lost and the frame flipped to `needs_transmit`.
    pub fn record_lost(&mut self, pn: u64) -> bool {
        if !self.pns.contains(&pn) || self.lost_pns.contains(&pn) {
            return false;
        }
        // Keep the pn in `pns`: the packet may still arrive late, and then
        // the ACK must be able to retire this frame.
        self.lost_pns.push(pn);
        if self.pns.len() == self.lost_pns.len() {
            self.needs_transmit = true;
            return true;
        }
        false
    }
}
