//! Error types for the QUIC endpoint.
//!
//! Errors come in three severities. *Would-block* signals "try again later"
//! (empty stream reads, exhausted path budgets). *Non-fatal* covers
//! single-packet faults that are logged and dropped. *Fatal* errors kill the
//! connection: the state machine moves to `Error` and the error surfaces to
//! the host.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by connections, streams, and the server demultiplexer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operation cannot make progress right now; retry later.
    #[error("would block")]
    WouldBlock,

    /// The connection has reached `Closed` or `Error`.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The connection is in its draining period.
    #[error("connection is closing")]
    ConnectionClosing,

    /// The stream half has been closed or reset locally.
    #[error("stream is closed")]
    StreamClosed,

    /// A packet could not be decoded or failed AEAD verification.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// A frame violated its encoding rules.
    #[error("frame format error")]
    FrameFormat,

    /// The peer violated the protocol in a way we cannot recover from.
    #[error("protocol violation")]
    ProtocolViolation,

    /// A flow control limit was exceeded.
    #[error("flow control error")]
    FlowControl,

    /// A retroactive change to a stream's final offset.
    #[error("final offset error")]
    FinalOffset,

    /// A single-packet fault; the packet is dropped and the connection
    /// continues.
    #[error("non-fatal: {0}")]
    NonFatal(String),

    /// Internal invariant failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The server should tear down a connection that never completed its
    /// first Initial exchange.
    #[error("destroy connection")]
    DestroyConnection,

    /// A packet whose trailing bytes matched the stored reset token.
    /// Terminate immediately without emitting CONNECTION_CLOSE.
    #[error("stateless reset received")]
    StatelessReset,

    /// A version negotiation packet offered no mutually supported version.
    #[error("received version negotiation")]
    VersionNegotiation,
}

impl Error {
    /// Fatal errors terminate the connection and bubble out of
    /// `input`/`check_timer`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidPacket(_)
                | Error::ProtocolViolation
                | Error::FlowControl
                | Error::FinalOffset
                | Error::Internal(_)
                | Error::DestroyConnection
                | Error::StatelessReset
                | Error::VersionNegotiation
        )
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}

/// Wire-format transport error codes carried in CONNECTION_CLOSE and
/// RST_STREAM frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportError(pub u16);

impl TransportError {
    pub const NO_ERROR: TransportError = TransportError(0x0);
    pub const INTERNAL_ERROR: TransportError = TransportError(0x1);
    pub const FLOW_CONTROL_ERROR: TransportError = TransportError(0x3);
    pub const STREAM_ID_ERROR: TransportError = TransportError(0x4);
    pub const STREAM_STATE_ERROR: TransportError = TransportError(0x5);
    pub const FINAL_OFFSET_ERROR: TransportError = TransportError(0x6);
    pub const FRAME_FORMAT_ERROR: TransportError = TransportError(0x7);
    pub const TRANSPORT_PARAMETER_ERROR: TransportError = TransportError(0x8);
    pub const VERSION_NEGOTIATION_ERROR: TransportError = TransportError(0x9);
    pub const PROTOCOL_VIOLATION: TransportError = TransportError(0xa);

    pub fn to_wire(self) -> u16 {
        self.0
    }

    pub fn from_wire(code: u16) -> Self {
        TransportError(code)
    }
}

impl From<&Error> for TransportError {
    fn from(e: &Error) -> Self {
        match e {
            Error::FlowControl => TransportError::FLOW_CONTROL_ERROR,
            Error::FinalOffset => TransportError::FINAL_OFFSET_ERROR,
            Error::FrameFormat => TransportError::FRAME_FORMAT_ERROR,
            Error::ProtocolViolation => TransportError::PROTOCOL_VIOLATION,
            Error::Internal(_) => TransportError::INTERNAL_ERROR,
            _ => TransportError::NO_ERROR,
        }
    }
}
