//! Core types shared across the endpoint.
//!
//! Connection identifiers, endpoint roles, the injectable clock, and the
//! variable-length integer codec every wire structure is built from.

use crate::error::{Error, Result};
use bytes::Bytes;
use core::time::Duration;
use rand::RngCore;

// ============================================================================
// Protocol constants
// ============================================================================

/// Default connection ID length chosen by this endpoint.
pub const CID_DEFAULT_LENGTH: usize = 8;

/// Minimum size of the client's first datagram.
pub const MIN_CLIENT_INITIAL_LENGTH: usize = 1200;

/// Long header length excluding both connection IDs.
pub const LONG_HEADER_LENGTH: usize = 12;

/// Initial path MTU (1280 minus UDP headers).
pub const INITIAL_MTU: usize = 1252;

/// Initial connection-level flow control window.
pub const INITIAL_MAX_DATA: u64 = 65536;

/// Initial per-stream flow control window.
pub const INITIAL_MAX_STREAM_DATA: u64 = 8192;

/// Remote-initiated stream concurrency granted at connection start.
pub const CONCURRENT_STREAMS_BIDI: u64 = 16;
pub const CONCURRENT_STREAMS_UNI: u64 = 16;

/// Ids granted per STREAM_ID credit issue.
pub const STREAM_ID_CREDIT_BATCH: u64 = 1;

/// Initial RTT estimate used for retransmission age before RTT samples.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(100);

/// Connection idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Packets an unverified path may carry before validation completes.
pub const UNVERIFIED_PATH_PACKETS: u64 = 10;

/// Worst-case ACK frame header used when budgeting packet space.
pub const MAX_ACK_HEADER_LENGTH: usize = 16;

/// Length of a stateless reset token.
pub const RESET_TOKEN_LENGTH: usize = 16;

// ============================================================================
// Role
// ============================================================================

/// Whether this endpoint opened the connection or accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn is_client(self) -> bool {
        matches!(self, Role::Client)
    }

    pub fn is_server(self) -> bool {
        matches!(self, Role::Server)
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

// ============================================================================
// Connection ID
// ============================================================================

/// Opaque routing identifier for a connection.
///
/// Valid lengths are 0 (absent) or 4 through 18 octets.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    pub const MIN_LENGTH: usize = 4;
    pub const MAX_LENGTH: usize = 18;

    /// Create a ConnectionId, validating its length.
    pub fn new(bytes: Bytes) -> Result<Self> {
        if !bytes.is_empty()
            && (bytes.len() < Self::MIN_LENGTH || bytes.len() > Self::MAX_LENGTH)
        {
            return Err(Error::Internal(format!(
                "connection id length {} out of range",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Create from a borrowed slice (copies data).
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        Self::new(Bytes::copy_from_slice(slice))
    }

    /// Generate a random ConnectionId of `len` octets.
    pub fn random(len: usize) -> Result<Self> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        Self::new(Bytes::from(buf))
    }

    /// The empty (zero-length) connection ID.
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Cid(")?;
        for b in &self.bytes[..] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for b in &self.bytes[..] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// ============================================================================
// Injectable clock
// ============================================================================

/// Monotonic timestamp fed into the endpoint by the host.
///
/// The endpoint never reads a system clock; every entry point that needs
/// time takes an `Instant`. Tests fabricate clocks with `from_nanos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { nanos: 0 };

    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Duration since `earlier`, saturating to zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }

    pub fn checked_add(&self, d: Duration) -> Option<Instant> {
        let add = u64::try_from(d.as_nanos()).ok()?;
        self.nanos.checked_add(add).map(|nanos| Instant { nanos })
    }

    /// `self + d`, saturating at the end of time.
    pub fn saturating_add(&self, d: Duration) -> Instant {
        self.checked_add(d).unwrap_or(Instant { nanos: u64::MAX })
    }
}

// ============================================================================
// Variable-length integers
// ============================================================================

/// Maximum value representable as a varint (2^62 - 1).
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// The 2-bit-prefixed variable-length integer codec used by all frames and
/// the long-header payload length.
pub struct VarInt;

impl VarInt {
    /// Decode a varint from the front of `buf`, returning (value, consumed).
    pub fn decode(buf: &[u8]) -> Result<(u64, usize)> {
        let first = *buf.first().ok_or(Error::FrameFormat)?;
        let len = 1usize << (first >> 6);
        if buf.len() < len {
            return Err(Error::FrameFormat);
        }
        let mut value = u64::from(first & 0x3f);
        for b in &buf[1..len] {
            value = (value << 8) | u64::from(*b);
        }
        Ok((value, len))
    }

    /// Append the varint encoding of `value` to `out`.
    pub fn encode(value: u64, out: &mut Vec<u8>) -> Result<()> {
        if value > VARINT_MAX {
            return Err(Error::Internal(format!("varint overflow: {value}")));
        }
        if value < 1 << 6 {
            out.push(value as u8);
        } else if value < 1 << 14 {
            out.push(0x40 | (value >> 8) as u8);
            out.push(value as u8);
        } else if value < 1 << 30 {
            out.push(0x80 | (value >> 24) as u8);
            out.push((value >> 16) as u8);
            out.push((value >> 8) as u8);
            out.push(value as u8);
        } else {
            out.push(0xc0 | (value >> 56) as u8);
            for shift in [48u32, 40, 32, 24, 16, 8, 0] {
                out.push((value >> shift) as u8);
            }
        }
        Ok(())
    }

    /// Encoded size in octets for `value`.
    pub fn size(value: u64) -> usize {
        if value < 1 << 6 {
            1
        } else if value < 1 << 14 {
            2
        } else if value < 1 << 30 {
            4
        } else {
            8
        }
    }
}
