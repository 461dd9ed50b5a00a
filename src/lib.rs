//! # minquic: a minimal sans-io QUIC endpoint
//!
//! A reliable, multiplexed, encrypted transport over an unreliable datagram
//! substrate, implementing the draft-11-era wire image: stream-0 TLS
//! carriage, long/short headers, ordered streams with flow control, loss
//! recovery, connection migration, and stateless reset.
//!
//! ## Architecture
//!
//! ```text
//! minquic/
//! ├── error        - unified error type with severity classification
//! ├── types        - connection ids, roles, varints, the injected clock
//! ├── version      - protocol version constants and grease
//! ├── frames       - the frame catalog, wire codec, queued-frame records
//! ├── packet       - header codec and packet-number reconstruction
//! ├── crypto       - AEAD key phases (cleartext + application)
//! ├── tls          - handshake oracle contract + deterministic test engine
//! ├── flow_control - (max, used) credit records
//! ├── tracker      - per-key-phase receive history and ACK preparation
//! ├── congestion   - congestion controller contract
//! ├── stream       - send/recv halves, reassembly, stream-id quadrants
//! ├── path         - per-address routes, validation, anti-amplification
//! ├── transport    - datagram substrate abstraction
//! ├── connection   - the connection state machine
//! └── server       - demultiplexer and stateless reset
//! ```
//!
//! ## Design
//!
//! The endpoint is a pure state machine. The host owns all I/O and time:
//! it delivers datagrams with [`Connection::input`] (or [`Server::input`]),
//! ticks [`Connection::check_timer`], and calls stream operations in
//! between. All callbacks fire synchronously inside those calls. Nothing
//! blocks, and nothing reads a clock or a socket behind the host's back.
//!
//! TLS is an external collaborator behind [`tls::HandshakeEngine`]: bytes
//! in, bytes out, exporter secrets at completion. [`tls::oracle`] ships a
//! deterministic engine good enough to drive the whole endpoint in tests
//! and examples.
//!
//! ## Usage sketch
//!
//! ```rust,ignore
//! let mut client = Connection::new_client(
//!     Box::new(udp_factory),
//!     server_addr,
//!     &tls_factory,
//!     Some(Box::new(handler)),
//!     ConnectionConfig::default(),
//!     clock.now(),
//! )?;
//!
//! client.check_timer(clock.now())?; // sends the Initial
//! loop {
//!     let datagram = socket.recv()?;
//!     client.input(datagram, clock.now())?;
//! }
//! ```

#![forbid(unsafe_code)]

pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod path;
pub mod server;
pub mod stream;
pub mod tls;
pub mod tracker;
pub mod transport;
pub mod types;
pub mod version;

pub use connection::{Connection, ConnectionConfig, ConnectionHandler, State};
pub use error::{Error, Result, TransportError};
pub use frames::Frame;
pub use server::{ConnHandle, Server, ServerHandler};
pub use stream::{RecvStreamState, SendStreamState};
pub use tls::{HandshakeEngine, HandshakeFactory, TransportParameters};
pub use transport::{Transport, TransportFactory, UdpPacket};
pub use types::{ConnectionId, Instant, Role};
pub use version::{VersionNumber, QUIC_VERSION};
