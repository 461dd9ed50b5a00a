//! The connection state machine.
//!
//! A connection is a pure state machine: the host delivers datagrams with
//! [`Connection::input`], drives time with [`Connection::check_timer`], and
//! uses the stream operations in between. Nothing here blocks and nothing
//! reads a clock; every entry point takes the current time.
//!
//! Inbound data flows header parse → decrypt → frame loop → stream/flow
//! updates; outbound data flows stream chunks → queued frames → packet
//! assembly → path send. Frames stay queued until an ACK retires them.

#[cfg(test)]
mod tests;

use crate::congestion::AlwaysAllow;
use crate::crypto::{
    CryptoState, CLIENT_APP_LABEL, CLIENT_CLEARTEXT_LABEL, SERVER_APP_LABEL,
    SERVER_CLEARTEXT_LABEL,
};
use crate::error::{Error, Result, TransportError};
use crate::flow_control::FlowControl;
use crate::frames::parse::decode_frame;
use crate::frames::{AckFrame, AckRanges, Frame, QueuedFrame};
use crate::packet::header::{self, PacketHeader};
use crate::packet::{number, PacketType};
use crate::path::Path;
use crate::stream::set::StreamSet;
use crate::stream::{
    stream_type_from_id, RecvHalf, RecvStreamState, SendHalf, SendStreamState, Stream,
    StreamChunk, StreamType,
};
use crate::tls::{HandshakeEngine, HandshakeFactory, TransportParameters};
use crate::tracker::{KeyPhase, ReceiveTracker};
use crate::transport::{TransportFactory, UdpPacket};
use crate::types::{
    ConnectionId, Instant, Role, CID_DEFAULT_LENGTH, DEFAULT_IDLE_TIMEOUT, DEFAULT_INITIAL_RTT,
    INITIAL_MAX_DATA, INITIAL_MAX_STREAM_DATA, INITIAL_MTU, LONG_HEADER_LENGTH,
    MAX_ACK_HEADER_LENGTH, MIN_CLIENT_INITIAL_LENGTH, RESET_TOKEN_LENGTH,
    STREAM_ID_CREDIT_BATCH, CONCURRENT_STREAMS_BIDI, CONCURRENT_STREAMS_UNI,
};
use crate::version::{self, VersionNumber, QUIC_VERSION};
use bytes::Bytes;
use core::time::Duration;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use tracing::{debug, trace, warn};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    WaitClientInitial,
    WaitServerFirstFlight,
    WaitClientSecondFlight,
    Established,
    Closing,
    Closed,
    Error,
}

/// Callbacks the connection fires synchronously from within `input` and
/// `check_timer`. Streams are named by id; fetch their data through the
/// connection.
pub trait ConnectionHandler {
    /// The connection changed state.
    fn state_changed(&mut self, _state: State) {}

    /// The peer opened a bidirectional stream.
    fn new_bidi_stream(&mut self, _stream_id: u64) {}

    /// The peer opened a unidirectional (receive-only for us) stream.
    fn new_recv_stream(&mut self, _stream_id: u64) {}

    /// A stream has data ready to read.
    fn stream_readable(&mut self, _stream_id: u64) {}
}

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Transport parameters advertised to the peer.
    pub local_params: TransportParameters,
    pub idle_timeout: Duration,
    pub mtu: usize,
    /// Age after which an unacked queued frame is retransmitted.
    pub retransmit_time: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            local_params: TransportParameters::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            mtu: INITIAL_MTU,
            retransmit_time: DEFAULT_INITIAL_RTT,
        }
    }
}

/// One QUIC connection, client or server side.
pub struct Connection {
    role: Role,
    state: State,
    version: VersionNumber,
    handler: Option<Box<dyn ConnectionHandler>>,
    tls: Box<dyn HandshakeEngine>,
    transport_factory: Box<dyn TransportFactory>,

    paths: HashMap<SocketAddr, Path>,
    current_addr: SocketAddr,

    write_clear: Option<CryptoState>,
    read_clear: Option<CryptoState>,
    write_protected: Option<CryptoState>,
    read_protected: Option<CryptoState>,

    next_send_packet: u64,
    largest_peer_acked: u64,
    mtu: usize,

    local_bidi: StreamSet,
    remote_bidi: StreamSet,
    local_uni: StreamSet,
    remote_uni: StreamSet,

    output_clear_q: Vec<QueuedFrame>,
    output_protected_q: Vec<QueuedFrame>,

    client_initial: Option<Vec<u8>>,
    recvd: ReceiveTracker,

    send_fc: FlowControl,
    recv_fc: FlowControl,
    amount_read: u64,
    sent_acks: HashMap<u64, (KeyPhase, AckRanges)>,

    now: Instant,
    last_input: Instant,
    idle_timeout: Duration,
    retransmit_time: Duration,
    closing_end: Option<Instant>,
    close_packet: Option<Vec<u8>>,

    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,
    /// Server side: key the demultiplexer uses for stateless reset tokens;
    /// lets this connection advertise the matching token.
    reset_key: Option<Vec<u8>>,
}

impl Connection {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Open a client connection toward `remote_addr`. The first Initial
    /// goes out on the first `check_timer` call.
    pub fn new_client(
        transport_factory: Box<dyn TransportFactory>,
        remote_addr: SocketAddr,
        tls_factory: &dyn HandshakeFactory,
        handler: Option<Box<dyn ConnectionHandler>>,
        config: ConnectionConfig,
        now: Instant,
    ) -> Result<Self> {
        Self::new(Role::Client, transport_factory, remote_addr, tls_factory, handler, config, None, now)
    }

    pub(crate) fn new_server(
        transport_factory: Box<dyn TransportFactory>,
        remote_addr: SocketAddr,
        tls_factory: &dyn HandshakeFactory,
        config: ConnectionConfig,
        reset_key: Option<Vec<u8>>,
        now: Instant,
    ) -> Result<Self> {
        Self::new(Role::Server, transport_factory, remote_addr, tls_factory, None, config, reset_key, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        role: Role,
        transport_factory: Box<dyn TransportFactory>,
        remote_addr: SocketAddr,
        tls_factory: &dyn HandshakeFactory,
        handler: Option<Box<dyn ConnectionHandler>>,
        config: ConnectionConfig,
        reset_key: Option<Vec<u8>>,
        now: Instant,
    ) -> Result<Self> {
        let transport = transport_factory.make_transport(remote_addr)?;
        let mut path = Path::new(remote_addr, transport, Box::new(AlwaysAllow), config.mtu);
        // The handshake itself validates the first path.
        path.set_verified();

        let mut tls = tls_factory.make(role);
        tls.set_local_parameters(config.local_params.clone());

        let mut conn = Self {
            role,
            state: if role.is_client() { State::Init } else { State::WaitClientInitial },
            version: QUIC_VERSION,
            handler,
            tls,
            transport_factory,
            paths: HashMap::new(),
            current_addr: remote_addr,
            write_clear: None,
            read_clear: None,
            write_protected: None,
            read_protected: None,
            // The first packet number is random in [0, 2^31).
            next_send_packet: u64::from(rand::thread_rng().gen::<u32>() >> 1),
            largest_peer_acked: 0,
            mtu: config.mtu,
            local_bidi: StreamSet::new(StreamType::BidiLocal, role, 1),
            remote_bidi: StreamSet::new(StreamType::BidiRemote, role, CONCURRENT_STREAMS_BIDI),
            local_uni: StreamSet::new(StreamType::UniLocal, role, 0),
            remote_uni: StreamSet::new(StreamType::UniRemote, role, CONCURRENT_STREAMS_UNI),
            output_clear_q: Vec::new(),
            output_protected_q: Vec::new(),
            client_initial: None,
            recvd: ReceiveTracker::new(),
            send_fc: FlowControl::new(0),
            recv_fc: FlowControl::new(INITIAL_MAX_DATA),
            amount_read: 0,
            sent_acks: HashMap::new(),
            now,
            last_input: now,
            idle_timeout: config.idle_timeout,
            retransmit_time: config.retransmit_time,
            closing_end: None,
            close_packet: None,
            local_params: config.local_params,
            peer_params: None,
            reset_key,
        };

        if role.is_client() {
            path.remote_cid = ConnectionId::random(CID_DEFAULT_LENGTH)?;
            path.local_cid = ConnectionId::random(CID_DEFAULT_LENGTH)?;
            conn.setup_cleartext_keys(&path.remote_cid.clone())?;
        }
        conn.paths.insert(remote_addr, path);

        // Stream 0 carries TLS and is exempt from flow control until the
        // handshake installs real limits.
        let stream0 = Stream::bidi(0, u64::MAX, u64::MAX);
        if role.is_client() {
            conn.local_bidi.adopt(stream0);
        } else {
            conn.remote_bidi.adopt(stream0);
        }

        Ok(conn)
    }

    pub fn set_handler(&mut self, handler: Box<dyn ConnectionHandler>) {
        self.handler = Some(handler);
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed | State::Error)
    }

    /// The connection identity chosen by the client.
    pub fn client_id(&self) -> ConnectionId {
        let path = &self.paths[&self.current_addr];
        if self.role.is_client() { path.local_cid.clone() } else { path.remote_cid.clone() }
    }

    /// The connection identity chosen by the server.
    pub fn server_id(&self) -> ConnectionId {
        let path = &self.paths[&self.current_addr];
        if self.role.is_server() { path.local_cid.clone() } else { path.remote_cid.clone() }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.current_addr
    }

    /// The reset token learned for the current path, if any.
    pub fn path_reset_token(&self) -> Option<[u8; RESET_TOKEN_LENGTH]> {
        self.paths.get(&self.current_addr).and_then(|p| p.reset_token)
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        debug!(role = %self.role, from = ?self.state, to = ?state, "connection state");
        self.state = state;
        if let Some(handler) = self.handler.as_mut() {
            handler.state_changed(state);
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Deliver one inbound datagram.
    pub fn input(&mut self, packet: UdpPacket, now: Instant) -> Result<()> {
        let result = self.input_inner(&packet, now);
        self.handle_error(result)
    }

    /// Drive timers: client initial (re)transmission, retransmits, idle
    /// timeout, and the draining period. Returns packets sent.
    pub fn check_timer(&mut self, now: Instant) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.now = now;

        if self.state == State::Closing {
            if self.closing_end.map_or(false, |end| now > end) {
                debug!("draining period over");
                self.set_state(State::Closed);
                return Err(Error::ConnectionClosed);
            }
            return Err(Error::ConnectionClosing);
        }

        if now > self.last_input.saturating_add(self.idle_timeout) {
            debug!(timeout = ?self.idle_timeout, "idle timeout");
            self.set_state(State::Closing);
            self.closing_end = Some(now);
            return Err(Error::ConnectionClosing);
        }

        // The client's first flight is special-cased: re-send it whole until
        // the server's first flight arrives.
        if self.role.is_client()
            && matches!(self.state, State::Init | State::WaitServerFirstFlight)
        {
            self.send_client_initial()?;
            return Ok(1);
        }

        match self.send_queued(false) {
            Ok(n) => Ok(n),
            Err(e) => self.handle_error(Err(e)).map(|_| 0),
        }
    }

    /// Begin a graceful close.
    pub fn close(&mut self) -> Result<()> {
        self.close_internal(TransportError::NO_ERROR, "kthxbye", true)
    }

    // ========================================================================
    // Error policy
    // ========================================================================

    /// Fatal errors kill the connection (best-effort CONNECTION_CLOSE, then
    /// `Error`); recoverable ones are logged and swallowed.
    fn handle_error(&mut self, result: Result<()>) -> Result<()> {
        let Err(e) = result else { return Ok(()) };

        if matches!(e, Error::ConnectionClosed | Error::ConnectionClosing) {
            return Err(e);
        }
        if e == Error::StatelessReset {
            // Terminate at once, emitting nothing.
            warn!("terminated by stateless reset");
            self.set_state(State::Closed);
            return Err(e);
        }
        if e.is_fatal() {
            warn!(error = %e, "fatal error, killing connection");
            if e != Error::DestroyConnection {
                let code = TransportError::from(&e);
                let _ = self.send_close_packet(code, "protocol error");
            }
            self.set_state(State::Error);
            return Err(e);
        }
        debug!(error = %e, "recoverable error, dropping packet");
        Ok(())
    }

    // ========================================================================
    // Input pipeline
    // ========================================================================

    fn input_inner(&mut self, packet: &UdpPacket, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        if self.state == State::Closing {
            // Re-emit the saved close once per inbound datagram.
            if let Some(close) = self.close_packet.clone() {
                if let Some(path) = self.paths.get_mut(&self.current_addr) {
                    let _ = path.transport.send(&close);
                }
            }
            return Err(Error::ConnectionClosing);
        }

        self.now = now;
        self.last_input = now;

        let data = &packet.payload;
        trace!(len = data.len(), "receiving datagram");

        let (hdr, hdrlen) = match PacketHeader::decode(data, CID_DEFAULT_LENGTH) {
            Ok(parsed) => parsed,
            Err(e) => {
                // A stateless reset is deliberately shaped like an
                // arbitrary short packet; it may not even parse.
                if self.matches_reset_token(data) {
                    return Err(Error::StatelessReset);
                }
                return Err(Error::NonFatal(format!("undecodable packet: {e}")));
            }
        };

        // Stateless resets masquerade as short-header packets; the trailing
        // token is the only reliable signal, so test it before duplicate
        // detection or decryption can swallow the datagram.
        if hdr.packet_type == PacketType::Short && self.matches_reset_token(data) {
            return Err(Error::StatelessReset);
        }

        if hdr.packet_type.is_long_header() && hdr.version != self.version {
            if hdr.packet_type == PacketType::VersionNegotiation {
                return self.process_version_negotiation(&data[hdrlen..]);
            }
            return match self.role {
                Role::Server => {
                    debug!(version = %hdr.version, "unsupported version");
                    self.send_version_negotiation(&hdr)?;
                    if self.state == State::WaitClientInitial {
                        Err(Error::DestroyConnection)
                    } else {
                        Ok(())
                    }
                }
                // A client chokes on unknown versions outside negotiation.
                Role::Client => Err(Error::InvalidPacket(format!(
                    "unexpected version {}",
                    hdr.version
                ))),
            };
        }

        if self.state == State::WaitClientInitial {
            if hdr.packet_type != PacketType::Initial {
                debug!("non-initial packet before client initial");
                return Err(Error::DestroyConnection);
            }
            // Handshake keys come from the client-chosen destination CID.
            self.setup_cleartext_keys(&hdr.dest_cid)?;
            let local_cid = ConnectionId::random(CID_DEFAULT_LENGTH)?;
            if let Some(key) = self.reset_key.clone() {
                self.local_params.stateless_reset_token =
                    Some(reset_token_for(&key, &local_cid));
                self.tls.set_local_parameters(self.local_params.clone());
            }
            let path = self.current_path_mut()?;
            path.local_cid = local_cid;
            path.remote_cid = hdr.src_cid.clone();
        }

        let protected = hdr.packet_type.is_protected();
        let phase = if protected { KeyPhase::Protected } else { KeyPhase::Cleartext };

        if protected && self.read_protected.is_none() {
            debug!("protected packet before keys are ready");
            return Ok(());
        }

        let pn = if self.recvd.initialized() {
            number::expand(hdr.packet_number, hdr.pn_length, self.recvd.max_received())
        } else {
            hdr.packet_number
        };
        trace!(pn, raw = hdr.packet_number, "packet number");

        if self.recvd.initialized() && self.recvd.is_duplicate(pn, phase) {
            return Err(Error::NonFatal(format!("duplicate packet {pn:#x}")));
        }

        let aead = if protected {
            self.read_protected.as_ref().expect("checked above")
        } else {
            self.read_clear
                .as_ref()
                .ok_or_else(|| Error::NonFatal("no cleartext keys yet".into()))?
        };
        let payload = match aead.open(pn, &data[..hdrlen], &data[hdrlen..]) {
            Ok(plain) => Bytes::from(plain),
            Err(_) => return Err(Error::NonFatal("undecryptable packet".into())),
        };

        // A Retry is processed before it can seed the receive tracker: the
        // client's numbering restarts the exchange.
        if hdr.packet_type == PacketType::Retry {
            return self.process_stateless_retry(&hdr, &payload);
        }

        if !self.recvd.initialized() {
            self.recvd.init(pn);
        }

        let previous_highest = self.recvd.max_received();
        let mut ack_only = true;
        let mut probing = true;

        match hdr.packet_type {
            PacketType::Initial => {
                probing = false;
                self.process_client_initial(&hdr, &payload)?;
            }
            PacketType::Handshake => {
                probing = false;
                self.process_cleartext(&hdr, &payload, &mut ack_only)?;
            }
            PacketType::Short => {
                self.process_protected(packet.src_addr, &payload, &mut ack_only, &mut probing)?;
            }
            other => {
                return Err(Error::NonFatal(format!("unsupported packet type {other:?}")));
            }
        }

        self.recvd.set_received(pn, phase, !ack_only);

        // A non-probing packet with the highest number seen, from a new
        // address, migrates the connection there.
        if self.state == State::Established
            && pn > previous_highest
            && !probing
            && packet.src_addr != self.current_addr
        {
            self.migrate(packet.src_addr)?;
        }

        self.fire_readable();

        // Flush: at minimum the packet just received may need an ACK.
        self.send_queued(true)?;
        Ok(())
    }

    fn matches_reset_token(&self, data: &[u8]) -> bool {
        let Some(token) = self.paths.get(&self.current_addr).and_then(|p| p.reset_token)
        else {
            return false;
        };
        if data.len() < RESET_TOKEN_LENGTH {
            return false;
        }
        let tail = &data[data.len() - RESET_TOKEN_LENGTH..];
        tail.ct_eq(&token).into()
    }

    fn process_version_negotiation(&mut self, payload: &[u8]) -> Result<()> {
        debug!("processing version negotiation");
        if self.recvd.initialized() {
            debug!("ignoring version negotiation after other packets");
            return Ok(());
        }
        let versions = header::decode_version_list(payload)?;
        if versions.contains(&self.version) {
            // The peer claims not to speak a version it just listed; treat
            // the packet as noise.
            return Ok(());
        }
        Err(Error::VersionNegotiation)
    }

    fn send_version_negotiation(&mut self, hdr: &PacketHeader) -> Result<()> {
        let versions = version::advertised_versions();
        // Amplification guard: answer only packets that claimed at least as
        // much payload as we are about to send.
        if hdr.payload_length < (versions.len() * 4) as u64 {
            return Ok(());
        }
        let packet = header::encode_version_negotiation(
            hdr.src_cid.clone(),
            hdr.dest_cid.clone(),
            &versions,
        )?;
        debug!("sending version negotiation");
        // Sent outside congestion accounting; this connection is going away.
        self.current_path_mut()?.transport.send(&packet)
    }

    /// Server side: the client's very first packet.
    fn process_client_initial(&mut self, hdr: &PacketHeader, payload: &Bytes) -> Result<()> {
        debug!("handling client initial");
        if self.role.is_client() {
            return Err(Error::NonFatal("client received an Initial".into()));
        }

        // Leading PADDING frames are allowed before the stream frame.
        let start = payload.iter().position(|b| *b != 0).unwrap_or(payload.len());
        let (frame, consumed) = decode_frame(payload, start)?;
        let Frame::Stream { stream_id, offset, data, .. } = frame else {
            return Err(Error::NonFatal("client initial without stream frame".into()));
        };
        if stream_id != 0 {
            return Err(Error::NonFatal(format!(
                "client initial on stream {stream_id}"
            )));
        }
        if offset != 0 {
            return Err(Error::NonFatal("client initial with nonzero offset".into()));
        }

        if self.state != State::WaitClientInitial {
            debug!(state = ?self.state, "stray client initial");
            return Ok(());
        }

        // Everything after the stream frame must be padding.
        if payload[start + consumed..].iter().any(|b| *b != 0) {
            return Err(Error::NonFatal("garbage after client hello".into()));
        }

        let flight = self.tls.drive(&data)?;

        if self.tls.wants_retry() {
            debug!("sending stateless retry");
            let retry = Frame::Stream {
                stream_id: 0,
                offset: 0,
                fin: false,
                data: Bytes::from(flight),
            };
            let encoded = retry.encode()?;
            self.send_packet_raw(
                PacketType::Retry,
                self.version,
                hdr.packet_number,
                &encoded,
                None,
                false,
            )?;
            return Ok(());
        }

        // The hello was consumed directly, not through the stream buffer;
        // bring stream 0's receive side up to date.
        let consumed_len = data.len() as u64;
        self.stream0_mut()?
            .recv_mut()
            .expect("stream 0 is bidirectional")
            .mark_consumed(consumed_len);

        self.install_peer_parameters();
        self.send_on_stream0(&flight)?;
        self.set_state(State::WaitClientSecondFlight);
        Ok(())
    }

    /// Handshake packets: stream 0 only, plus ACKs.
    fn process_cleartext(
        &mut self,
        hdr: &PacketHeader,
        payload: &Bytes,
        ack_only: &mut bool,
    ) -> Result<()> {
        trace!(state = ?self.state, "reading cleartext");
        *ack_only = true;
        let mut at = 0;

        while at < payload.len() {
            let (frame, consumed) = decode_frame(payload, at)?;
            at += consumed;
            let mut is_ack = false;

            match frame {
                Frame::Padding => {}

                Frame::MaxStreamData { stream_id, maximum } => {
                    if stream_id != 0 {
                        return Err(Error::ProtocolViolation);
                    }
                    if let Some(send) = self.stream0_mut()?.send_mut() {
                        send.process_max_stream_data(maximum);
                    }
                }

                Frame::Stream { stream_id, offset, fin, data } => {
                    let read_offset = self
                        .stream0_mut()?
                        .recv()
                        .map(|r| r.read_offset())
                        .unwrap_or(0);
                    // Duplicate handshake data; skip early.
                    if offset + data.len() as u64 <= read_offset {
                        continue;
                    }

                    match self.role {
                        Role::Client => {
                            if self.state != State::WaitServerFirstFlight {
                                debug!("handshake data after handshake finished");
                                return Ok(());
                            }
                            // First packet from the server: the Initial got
                            // through, and the server has picked its CID.
                            self.client_initial = None;
                            self.current_path_mut()?.remote_cid = hdr.src_cid.clone();
                        }
                        Role::Server => {
                            if self.state != State::WaitClientSecondFlight {
                                debug!("handshake data after handshake finished");
                                return Ok(());
                            }
                        }
                    }

                    if stream_id != 0 {
                        return Err(Error::NonFatal(
                            "cleartext stream frame off stream 0".into(),
                        ));
                    }

                    // Stream 0 ignores flow control during the handshake.
                    let mut unlimited = FlowControl::new(u64::MAX);
                    self.stream0_mut()?
                        .recv_mut()
                        .expect("stream 0 is bidirectional")
                        .new_frame_data(offset, fin, data, &mut unlimited)?;

                    let available = self.drain_stream0()?;
                    let flight = self.tls.drive(&available)?;

                    if self.tls.is_finished() {
                        self.handshake_complete()?;
                        self.install_peer_parameters();
                    }
                    if !flight.is_empty() {
                        self.send_on_stream0(&flight)?;
                    }
                }

                Frame::Ack(ack) => {
                    self.process_ack_frame(&ack, false)?;
                    is_ack = true;
                }

                Frame::ConnectionClose { .. } => {
                    debug!("close during handshake");
                    self.set_state(State::Closed);
                    return Err(Error::ConnectionClosed);
                }

                Frame::PathChallenge { data } => {
                    // Answer on the normal handshake queue; our address has
                    // not changed mid-handshake.
                    self.queue_clear_frame(Frame::PathResponse { data })?;
                }

                Frame::PathResponse { .. } => return Err(Error::ProtocolViolation),

                other => {
                    debug!(frame = other.name(), "unexpected cleartext frame");
                    return Err(Error::ProtocolViolation);
                }
            }
            if !is_ack {
                *ack_only = false;
            }
        }
        Ok(())
    }

    /// Short-header packets: the full frame catalog.
    fn process_protected(
        &mut self,
        src_addr: SocketAddr,
        payload: &Bytes,
        ack_only: &mut bool,
        probing: &mut bool,
    ) -> Result<()> {
        trace!(state = ?self.state, "reading protected payload");
        *ack_only = true;
        *probing = true;
        let mut at = 0;

        while at < payload.len() {
            let (frame, consumed) = decode_frame(payload, at)?;
            at += consumed;
            let mut is_ack = false;
            let is_probing = frame.is_probing();

            match frame {
                Frame::Padding => {}

                Frame::RstStream { stream_id, final_offset, .. } => {
                    debug!(stream_id, "received RST_STREAM");
                    if !self.ensure_recv_stream(stream_id)? {
                        return Err(Error::ProtocolViolation);
                    }
                    self.recv_half_mut(stream_id)
                        .expect("ensured above")
                        .handle_reset(final_offset)?;
                    self.issue_stream_id_credit(stream_type_from_id(stream_id, self.role))?;
                }

                Frame::StopSending { stream_id, .. } => {
                    debug!(stream_id, "received STOP_SENDING");
                    if !self.ensure_send_stream(stream_id)? {
                        return Err(Error::ProtocolViolation);
                    }
                    self.stream_reset(stream_id, TransportError::NO_ERROR.to_wire())?;
                }

                Frame::ConnectionClose { .. } => {
                    debug!("received CONNECTION_CLOSE");
                    // Straight to draining; no close packet of our own.
                    self.close_internal(TransportError::NO_ERROR, "received CONNECTION_CLOSE", false)?;
                    return Ok(());
                }

                Frame::MaxData { maximum } => {
                    self.send_fc.update(maximum);
                    self.update_blocked()?;
                }

                Frame::Blocked { offset } => {
                    debug!(offset, "peer is blocked");
                    // Receiving BLOCKED hints that a MAX_DATA was lost;
                    // recredit aggressively.
                    self.issue_credit(true)?;
                }

                Frame::MaxStreamData { stream_id, maximum } => {
                    if !self.ensure_send_stream(stream_id)? {
                        return Err(Error::ProtocolViolation);
                    }
                    self.send_half_mut(stream_id)
                        .expect("ensured above")
                        .process_max_stream_data(maximum);
                    self.update_stream_blocked(stream_id)?;
                }

                Frame::StreamBlocked { stream_id, offset } => {
                    if !self.ensure_recv_stream(stream_id)? {
                        return Err(Error::ProtocolViolation);
                    }
                    debug!(stream_id, offset, "peer stream is blocked");
                    self.issue_stream_credit(stream_id, true)?;
                }

                Frame::StreamIdBlocked { stream_id } => {
                    debug!(stream_id, "peer is out of stream ids");
                    self.issue_stream_id_credit(stream_type_from_id(stream_id, self.role))?;
                }

                Frame::MaxStreamId { maximum } => {
                    match stream_type_from_id(maximum, self.role) {
                        StreamType::BidiLocal => self.local_bidi.update_max(maximum)?,
                        StreamType::UniLocal => self.local_uni.update_max(maximum)?,
                        _ => return Err(Error::ProtocolViolation),
                    }
                }

                Frame::Ack(ack) => {
                    self.process_ack_frame(&ack, true)?;
                    is_ack = true;
                }

                Frame::Stream { stream_id, offset, fin, data } => {
                    trace!(stream_id, offset, len = data.len(), "stream data");
                    if !self.ensure_recv_stream(stream_id)? {
                        return Err(Error::ProtocolViolation);
                    }
                    let mut recv_fc = self.recv_fc;
                    let result = self
                        .recv_half_mut(stream_id)
                        .expect("ensured above")
                        .new_frame_data(offset, fin, data, &mut recv_fc);
                    self.recv_fc = recv_fc;
                    result?;

                    if stream_id == 0 {
                        // Post-handshake stream 0 is session tickets; feed
                        // TLS and never surface it.
                        let available = self.drain_stream0()?;
                        self.tls.read_post_handshake(&available)?;
                    }
                }

                Frame::PathChallenge { data } => {
                    debug!("received path challenge");
                    // The response goes back to wherever the challenge came
                    // from.
                    self.get_or_make_path(src_addr)?;
                    self.send_packet(
                        PacketType::Short,
                        &[Frame::PathResponse { data }],
                        Some(src_addr),
                        false,
                    )?;
                }

                Frame::PathResponse { data } => {
                    let verified = self
                        .paths
                        .get_mut(&src_addr)
                        .map(|p| p.verify_response(&data))
                        .unwrap_or(false);
                    debug!(verified, "received path response");
                }

                Frame::NewConnectionId { sequence, connection_id, reset_token } => {
                    trace!(sequence, "received NEW_CONNECTION_ID");
                    // Remember the token for the day this identity routes a
                    // reset our way.
                    if let Some(path) = self.paths.get_mut(&src_addr) {
                        if path.remote_cid != connection_id {
                            path.reset_token.get_or_insert(reset_token);
                        }
                    }
                }

                // PING carries nothing; it just elicits the ACK below.
                Frame::Ping => {}
            }

            if !is_probing {
                *probing = false;
            }
            if !is_ack {
                *ack_only = false;
            }
        }
        Ok(())
    }

    /// Client side: the server answered our Initial with a Retry.
    fn process_stateless_retry(&mut self, _hdr: &PacketHeader, payload: &Bytes) -> Result<()> {
        debug!("processing stateless retry");
        if self.recvd.initialized() {
            debug!("ignoring retry after other packets");
            return Ok(());
        }

        let (frame, consumed) = decode_frame(payload, 0)?;
        let Frame::Stream { stream_id, offset, data, .. } = frame else {
            return Err(Error::NonFatal("retry without stream frame".into()));
        };
        if consumed != payload.len() {
            return Err(Error::NonFatal("trailing bytes in retry".into()));
        }
        if stream_id != 0 || offset != 0 {
            return Err(Error::NonFatal("malformed retry stream frame".into()));
        }

        // The original destination CID stays in use: the re-sent Initial
        // must derive the same cleartext keys on both sides. The server's
        // chosen CID is adopted from its Handshake flight instead.
        let fresh_hello = self.tls.drive(&data)?;
        self.client_initial = Some(fresh_hello);
        self.send_client_initial()
    }

    // ========================================================================
    // Handshake plumbing
    // ========================================================================

    fn setup_cleartext_keys(&mut self, cid: &ConnectionId) -> Result<()> {
        let (send_label, recv_label) = match self.role {
            Role::Client => (CLIENT_CLEARTEXT_LABEL, SERVER_CLEARTEXT_LABEL),
            Role::Server => (SERVER_CLEARTEXT_LABEL, CLIENT_CLEARTEXT_LABEL),
        };
        self.write_clear = Some(CryptoState::cleartext(send_label, cid)?);
        self.read_clear = Some(CryptoState::cleartext(recv_label, cid)?);
        Ok(())
    }

    fn handshake_complete(&mut self) -> Result<()> {
        let (send_label, recv_label) = match self.role {
            Role::Client => (CLIENT_APP_LABEL, SERVER_APP_LABEL),
            Role::Server => (SERVER_APP_LABEL, CLIENT_APP_LABEL),
        };
        let send_secret = self.tls.export_secret(send_label)?;
        let recv_secret = self.tls.export_secret(recv_label)?;
        self.write_protected = Some(CryptoState::from_secret(send_label, &send_secret)?);
        self.read_protected = Some(CryptoState::from_secret(recv_label, &recv_secret)?);
        self.set_state(State::Established);
        Ok(())
    }

    fn install_peer_parameters(&mut self) {
        let Some(params) = self.tls.peer_parameters() else { return };
        debug!(?params, "installing peer transport parameters");

        // Stream 0 drops from its handshake exemption to the peer's window.
        if let Ok(stream0) = self.stream0_mut() {
            if let Some(send) = stream0.send_mut() {
                send.fc.max = params.initial_max_stream_data;
            }
        }
        self.send_fc.update(params.initial_max_data);
        self.local_bidi.set_max_streams(params.max_streams_bidi);
        self.local_uni.set_max_streams(params.max_streams_uni);

        if self.role.is_client() {
            if let Some(token) = params.stateless_reset_token {
                if let Some(path) = self.paths.get_mut(&self.current_addr) {
                    path.reset_token = Some(token);
                }
            }
        }
        self.peer_params = Some(params);
    }

    fn send_client_initial(&mut self) -> Result<()> {
        debug!("sending client initial");
        if self.client_initial.is_none() {
            self.client_initial = Some(self.tls.drive(&[])?);
        }
        let hello = self.client_initial.clone().expect("just set");

        let stream_frame = Frame::Stream {
            stream_id: 0,
            offset: 0,
            fin: false,
            data: Bytes::from(hello.clone()),
        };
        let frame_len = stream_frame.encode()?.len();

        // The first datagram must reach 1200 octets so the network path
        // proves it supports a useful MTU.
        let overhead = self.packet_overhead(PacketType::Initial)?;
        let to_pad = MIN_CLIENT_INITIAL_LENGTH.saturating_sub(frame_len + overhead);
        trace!(to_pad, "padding client initial");

        let mut frames = Vec::with_capacity(1 + to_pad);
        frames.push(stream_frame);
        frames.extend(std::iter::repeat(Frame::Padding).take(to_pad));

        // The hello bypassed the stream buffer; advance the send side so
        // later handshake writes land at the right offset.
        self.stream0_mut()?
            .send_mut()
            .expect("stream 0 is bidirectional")
            .mark_consumed(hello.len() as u64);

        self.set_state(State::WaitServerFirstFlight);
        self.send_packet(PacketType::Initial, &frames, None, false)?;
        Ok(())
    }

    /// Write handshake bytes on stream 0, temporarily lifting the
    /// connection-level window so the write cannot stall.
    fn send_on_stream0(&mut self, data: &[u8]) -> Result<()> {
        debug!(len = data.len(), "sending on stream 0");
        let saved = self.send_fc;
        self.send_fc.max = self.send_fc.max.saturating_add(data.len() as u64);
        let result = self
            .stream0_mut()?
            .send_mut()
            .expect("stream 0 is bidirectional")
            .write(data);
        self.send_fc = saved;
        result?;
        self.send_queued(false)?;
        Ok(())
    }

    /// Read everything currently buffered on stream 0.
    fn drain_stream0(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let recv = self
                .stream0_mut()?
                .recv_mut()
                .expect("stream 0 is bidirectional");
            match recv.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(Error::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn stream0_mut(&mut self) -> Result<&mut Stream> {
        let set = match self.role {
            Role::Client => &mut self.local_bidi,
            Role::Server => &mut self.remote_bidi,
        };
        set.get_mut(0)
            .ok_or_else(|| Error::Internal("stream 0 missing".into()))
    }

    // ========================================================================
    // Reliability engine
    // ========================================================================

    /// Enqueue whatever streams are allowed to send and flush both output
    /// queues. `bare_acks` permits an ACK-only packet when nothing else is
    /// pending.
    pub(crate) fn send_queued(&mut self, mut bare_acks: bool) -> Result<usize> {
        if matches!(self.state, State::Init | State::WaitClientInitial) {
            return Ok(0);
        }
        trace!(bare_acks, "send_queued");
        let mut sent = 0;

        self.queue_stream_frames(false)?;

        if self.state == State::Established {
            self.queue_stream_frames(true)?;
            sent += self.flush_queue(PacketType::Short, true, bare_acks)?;
            // Cleartext flushes below still run, but they no longer get to
            // emit bare ACKs of their own.
            bare_acks = false;
        }

        sent += self.flush_queue(PacketType::Handshake, false, bare_acks)?;
        Ok(sent)
    }

    /// Move stream chunks whose flow control permits transmission onto the
    /// right output queue.
    fn queue_stream_frames(&mut self, protected: bool) -> Result<()> {
        if !protected {
            let stream0 = self.stream0_mut()?;
            let Some(send) = stream0.send_mut() else { return Ok(()) };
            let (chunks, _) = send.output_writable();
            for chunk in chunks {
                self.queue_clear_frame(stream_chunk_frame(0, chunk))?;
            }
            return Ok(());
        }

        // Stage chunks first; the queues cannot be touched while the stream
        // sets are borrowed.
        let mut staged: Vec<(u64, StreamChunk)> = Vec::new();
        let mut stalled: Vec<(u64, u64)> = Vec::new();
        for set in [&mut self.local_bidi, &mut self.remote_bidi, &mut self.local_uni] {
            for stream in set.iter_mut() {
                if stream.id() == 0 {
                    continue;
                }
                let Some(send) = stream.send_mut() else { continue };
                let (chunks, blocked) = send.output_writable();
                let id = stream.id();
                staged.extend(chunks.into_iter().map(|c| (id, c)));
                if blocked {
                    stalled.push((id, stream.send().expect("just used").fc.used));
                }
            }
        }
        for (id, chunk) in staged {
            self.queue_protected_frame(stream_chunk_frame(id, chunk))?;
        }
        for (id, offset) in stalled {
            self.queue_protected_frame(Frame::StreamBlocked { stream_id: id, offset })?;
        }
        Ok(())
    }

    fn queue_clear_frame(&mut self, frame: Frame) -> Result<()> {
        self.output_clear_q.push(QueuedFrame::new(frame)?);
        Ok(())
    }

    fn queue_protected_frame(&mut self, frame: Frame) -> Result<()> {
        self.output_protected_q.push(QueuedFrame::new(frame)?);
        Ok(())
    }

    /// Queue a control frame and flush immediately.
    fn send_frame(&mut self, frame: Frame) -> Result<()> {
        if self.state != State::Established {
            return Err(Error::WouldBlock);
        }
        self.queue_protected_frame(frame)?;
        self.send_queued(false)?;
        Ok(())
    }

    /// Flush one queue into packets of `pt`, appending as many pending ACK
    /// ranges as fit into each packet.
    fn flush_queue(&mut self, pt: PacketType, protected: bool, bare_acks: bool) -> Result<usize> {
        let phase = if protected { KeyPhase::Protected } else { KeyPhase::Cleartext };
        let mut acks = self.recvd.prepare_ack_ranges(phase);
        let now = self.now;
        let tx_age = self.retransmit_time;
        let overhead = self.packet_overhead(pt)?;
        let mut cwnd = {
            let path = self.current_path_mut()?;
            path.congestion.bytes_allowed_to_send()
        };
        let mut sent = 0;

        // The queue is detached while packets go out; frames stay on it
        // after transmission until an ACK removes them.
        let mut queue = if protected {
            std::mem::take(&mut self.output_protected_q)
        } else {
            std::mem::take(&mut self.output_clear_q)
        };

        let mut space = self.mtu - overhead;
        cwnd = cwnd.saturating_sub(overhead);
        let mut pending: Vec<Bytes> = Vec::new();

        let mut flush_result: Result<()> = Ok(());
        for frame in queue.iter_mut() {
            let frame_len = frame.wire_len();

            if frame.needs_transmit {
                trace!(frame = frame.frame.name(), "frame requires transmission");
            } else if frame
                .last_send
                .map_or(false, |at| now.saturating_since(at) < tx_age)
            {
                continue;
            }

            if cwnd < frame_len {
                trace!("congestion window exhausted");
                break;
            }

            if space < frame_len {
                match self.send_combined_packet(pt, phase, &pending, &mut acks, space) {
                    Ok(()) => {}
                    Err(e) => {
                        flush_result = Err(e);
                        break;
                    }
                }
                sent += 1;
                pending.clear();
                space = self.mtu - overhead;
                cwnd = cwnd.saturating_sub(overhead);
            }

            frame.last_send = Some(now);
            frame.needs_transmit = false;
            frame.pns.push(self.next_send_packet);
            pending.push(frame.encoded.clone());
            space -= frame_len;
            cwnd = cwnd.saturating_sub(frame_len);
        }

        // Reattach before any early return; frames queued while the queue
        // was detached (none today, but cheap to be correct) stay behind.
        let queue_ref = if protected { &mut self.output_protected_q } else { &mut self.output_clear_q };
        let newcomers = std::mem::replace(queue_ref, queue);
        queue_ref.extend(newcomers);
        flush_result?;

        if !pending.is_empty() || (!acks.is_empty() && bare_acks) {
            self.send_combined_packet(pt, phase, &pending, &mut acks, space)?;
            sent += 1;
        } else if !acks.is_empty() {
            trace!("acks pending but suppressing bare ack packet");
        }

        Ok(sent)
    }

    /// Emit one packet: the staged frames plus whatever ACK ranges fit in
    /// `room`. Ranges actually sent are recorded against this packet number
    /// so a future ACK of it can retire them.
    fn send_combined_packet(
        &mut self,
        pt: PacketType,
        phase: KeyPhase,
        frames: &[Bytes],
        acks: &mut AckRanges,
        room: usize,
    ) -> Result<()> {
        let ack_only = frames.is_empty();
        let mut payload: Vec<u8> = Vec::with_capacity(self.mtu);
        for encoding in frames {
            payload.extend_from_slice(encoding);
        }

        if !acks.is_empty() && room >= MAX_ACK_HEADER_LENGTH {
            if let Some((ack_frame, consumed)) = AckFrame::from_ranges(&acks[..], 0, room) {
                payload.extend(Frame::Ack(ack_frame).encode()?);
                let sent_ranges: AckRanges = acks.drain(..consumed).collect();
                self.sent_acks
                    .insert(self.next_send_packet, (phase, sent_ranges));
            }
        }

        let pn = self.next_send_packet;
        self.next_send_packet += 1;
        self.send_packet_raw(pt, self.version, pn, &payload, None, ack_only)?;
        Ok(())
    }

    /// Encode, seal, and transmit a packet built from `frames`, consuming
    /// the next packet number.
    fn send_packet(
        &mut self,
        pt: PacketType,
        frames: &[Frame],
        path_addr: Option<SocketAddr>,
        ack_only: bool,
    ) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        for frame in frames {
            payload.extend(frame.encode()?);
        }
        let pn = self.next_send_packet;
        self.next_send_packet += 1;
        self.send_packet_raw(pt, self.version, pn, &payload, path_addr, ack_only)
    }

    fn send_packet_raw(
        &mut self,
        pt: PacketType,
        version: VersionNumber,
        pn: u64,
        payload: &[u8],
        path_addr: Option<SocketAddr>,
        ack_only: bool,
    ) -> Result<Vec<u8>> {
        let addr = path_addr.unwrap_or(self.current_addr);
        trace!(?pt, pn, len = payload.len(), "sending packet");

        let (remote_cid, local_cid) = {
            let path = self
                .paths
                .get(&addr)
                .ok_or_else(|| Error::Internal("no path for send".into()))?;
            (path.remote_cid.clone(), path.local_cid.clone())
        };

        let tag_len = self.write_aead(pt)?.overhead();
        let hdr = if pt.is_long_header() {
            PacketHeader::long(
                pt,
                version,
                remote_cid,
                local_cid,
                pn,
                (payload.len() + tag_len) as u64,
            )
        } else {
            let pn_len = number::wire_length(pn, self.largest_peer_acked);
            PacketHeader::short(remote_cid, number::truncate(pn, pn_len), pn_len)
        };
        let hdr_bytes = hdr.encode()?;

        let sealed = self.write_aead(pt)?.seal(pn, &hdr_bytes, payload)?;
        let mut packet = hdr_bytes;
        packet.extend_from_slice(&sealed);

        let path = self
            .paths
            .get_mut(&addr)
            .ok_or_else(|| Error::Internal("no path for send".into()))?;
        path.send(pn, &packet, ack_only)?;
        Ok(packet)
    }

    /// Pick the sealing keys for a packet type.
    fn write_aead(&self, pt: PacketType) -> Result<&CryptoState> {
        let clear = || {
            self.write_clear
                .as_ref()
                .ok_or_else(|| Error::Internal("cleartext keys not ready".into()))
        };
        match (self.role, pt) {
            (Role::Client, PacketType::Initial) | (_, PacketType::Handshake) => clear(),
            (Role::Server, PacketType::Retry) => clear(),
            (_, PacketType::Short) => self
                .write_protected
                .as_ref()
                .ok_or_else(|| Error::Internal("application keys not ready".into())),
            (role, pt) => Err(Error::Internal(format!("no aead for {role} {pt:?}"))),
        }
    }

    fn packet_overhead(&self, pt: PacketType) -> Result<usize> {
        let tag = self.write_aead(pt)?.overhead();
        let path = &self.paths[&self.current_addr];
        let header = if pt.is_long_header() {
            LONG_HEADER_LENGTH + path.local_cid.len()
        } else {
            5
        };
        Ok(tag + header + path.remote_cid.len())
    }

    // ========================================================================
    // ACK processing
    // ========================================================================

    fn process_ack_frame(&mut self, ack: &AckFrame, protected: bool) -> Result<()> {
        let ranges = ack.ranges();
        trace!(largest = ack.largest_acked, ranges = ranges.len(), "processing ack");

        if ack.largest_acked > self.largest_peer_acked {
            self.largest_peer_acked = ack.largest_acked;
        }

        for range in &ranges {
            self.process_ack_range(range.smallest(), range.largest, protected);
        }

        // Newly detected losses flip wholly-lost frames to retransmission.
        let ack_delay = Duration::from_micros(ack.ack_delay);
        let mut lost = Vec::new();
        for path in self.paths.values_mut() {
            lost.extend(path.congestion.on_ack_received(&ranges, ack_delay));
        }
        for pn in lost {
            self.handle_lost_packet(pn);
        }
        Ok(())
    }

    fn process_ack_range(&mut self, start: u64, end: u64, protected: bool) {
        debug_assert!(start <= end);
        trace!(start, end, "ack range");
        let mut pn = start;
        // Loop shape avoids overflow at the top of the space.
        loop {
            remove_acked_frames(pn, &mut self.output_clear_q);
            if protected {
                remove_acked_frames(pn, &mut self.output_protected_q);
            }

            // Double-ACK: the ACK ranges we sent in packet `pn` have been
            // seen, so the tracker can stop re-acking those numbers.
            if let Some((phase, ranges)) = self.sent_acks.remove(&pn) {
                for range in ranges {
                    if range.largest < self.recvd.min_not_acked2(phase) {
                        continue;
                    }
                    for i in 0..range.count {
                        self.recvd.set_acked2(range.largest - i, phase);
                    }
                }
            }

            if pn == end {
                break;
            }
            pn += 1;
        }
    }

    fn handle_lost_packet(&mut self, lost_pn: u64) {
        for queue in [&mut self.output_clear_q, &mut self.output_protected_q] {
            for frame in queue.iter_mut() {
                if frame.record_lost(lost_pn) {
                    debug!(pn = lost_pn, frame = frame.frame.name(), "frame needs retransmit");
                }
            }
        }
    }

    // ========================================================================
    // Flow control credit
    // ========================================================================

    /// Refresh the connection-level receive window when it runs low.
    fn issue_credit(&mut self, force: bool) -> Result<()> {
        if !force && self.recv_fc.remaining() > INITIAL_MAX_STREAM_DATA / 2 {
            return Ok(());
        }
        self.recv_fc.max = self.amount_read + INITIAL_MAX_DATA;
        let max = self.recv_fc.max;
        // Drop any stale MAX_DATA still queued; only the newest matters.
        self.output_protected_q
            .retain(|f| !matches!(f.frame, Frame::MaxData { .. }));
        debug!(max, "issuing connection credit");
        match self.send_frame(Frame::MaxData { maximum: max }) {
            Ok(()) | Err(Error::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Refresh one stream's receive window.
    fn issue_stream_credit(&mut self, stream_id: u64, force: bool) -> Result<()> {
        // Stream 0 gets no credit while the handshake still owns it.
        if stream_id == 0 && self.state != State::Established {
            return Ok(());
        }
        let Some(recv) = self.recv_half_mut(stream_id) else { return Ok(()) };
        let Some(max) = recv.credit_max_stream_data(force) else { return Ok(()) };

        // Strip the stale advertisement for this stream before queueing the
        // replacement.
        self.output_protected_q.retain(|f| {
            !matches!(&f.frame, Frame::MaxStreamData { stream_id: id, .. } if *id == stream_id)
        });
        debug!(stream_id, max, "issuing stream credit");
        match self.send_frame(Frame::MaxStreamData { stream_id, maximum: max }) {
            Ok(()) | Err(Error::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Grant the peer more stream ids in a remote-initiated quadrant.
    fn issue_stream_id_credit(&mut self, kind: StreamType) -> Result<()> {
        let max = match kind {
            StreamType::BidiRemote => self.remote_bidi.credit(STREAM_ID_CREDIT_BATCH),
            StreamType::UniRemote => self.remote_uni.credit(STREAM_ID_CREDIT_BATCH),
            _ => return Ok(()),
        };
        // Replace only the stale advertisement of the same directionality.
        let uni_bit = max & 0x2;
        self.output_protected_q.retain(|f| {
            !matches!(&f.frame, Frame::MaxStreamId { maximum } if maximum & 0x2 == uni_bit)
        });
        debug!(?kind, max, "issuing stream id credit");
        match self.send_frame(Frame::MaxStreamId { maximum: max }) {
            Ok(()) | Err(Error::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Tell the peer when connection-level credit has run dry.
    fn update_blocked(&mut self) -> Result<()> {
        self.output_protected_q
            .retain(|f| !matches!(f.frame, Frame::Blocked { .. }));
        if self.send_fc.remaining() > 0 {
            return Ok(());
        }
        let used = self.send_fc.used;
        debug!(used, "connection blocked");
        match self.send_frame(Frame::Blocked { offset: used }) {
            Ok(()) | Err(Error::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn update_stream_blocked(&mut self, stream_id: u64) -> Result<()> {
        self.output_protected_q.retain(|f| {
            !matches!(&f.frame, Frame::StreamBlocked { stream_id: id, .. } if *id == stream_id)
        });
        let Some(send) = self.send_half(stream_id) else { return Ok(()) };
        if send.fc.remaining() > 0 {
            return Ok(());
        }
        let offset = send.fc.used;
        debug!(stream_id, offset, "stream blocked");
        match self.send_frame(Frame::StreamBlocked { stream_id, offset }) {
            Ok(()) | Err(Error::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Stream plumbing
    // ========================================================================

    fn set_for(&mut self, kind: StreamType) -> &mut StreamSet {
        match kind {
            StreamType::BidiLocal => &mut self.local_bidi,
            StreamType::BidiRemote => &mut self.remote_bidi,
            StreamType::UniLocal => &mut self.local_uni,
            StreamType::UniRemote => &mut self.remote_uni,
        }
    }

    fn stream_mut(&mut self, id: u64) -> Option<&mut Stream> {
        let kind = stream_type_from_id(id, self.role);
        self.set_for(kind).get_mut(id)
    }

    fn send_half(&mut self, id: u64) -> Option<&SendHalf> {
        self.stream_mut(id).and_then(|s| s.send_mut().map(|h| &*h))
    }

    fn send_half_mut(&mut self, id: u64) -> Option<&mut SendHalf> {
        self.stream_mut(id).and_then(|s| s.send_mut())
    }

    fn recv_half_mut(&mut self, id: u64) -> Option<&mut RecvHalf> {
        self.stream_mut(id).and_then(|s| s.recv_mut())
    }

    /// Parameters for streams created after the handshake.
    fn stream_windows(&self) -> (u64, u64) {
        let send_max = self
            .peer_params
            .as_ref()
            .map(|p| p.initial_max_stream_data)
            .unwrap_or(INITIAL_MAX_STREAM_DATA);
        let recv_max = self.local_params.initial_max_stream_data;
        (send_max, recv_max)
    }

    /// Make sure a peer-named stream exists and can receive. Fires
    /// new-stream callbacks for anything created. Returns false when the id
    /// can never receive for us (our own unidirectional streams).
    fn ensure_recv_stream(&mut self, id: u64) -> Result<bool> {
        let (send_max, recv_max) = self.stream_windows();
        let mut created = Vec::new();
        let exists = match stream_type_from_id(id, self.role) {
            StreamType::BidiLocal => self.local_bidi.get_mut(id).is_some(),
            StreamType::BidiRemote => {
                self.remote_bidi
                    .ensure(id, |id| Stream::bidi(id, send_max, recv_max), |id| created.push(id))?;
                true
            }
            StreamType::UniRemote => {
                self.remote_uni
                    .ensure(id, |id| Stream::recv_only(id, recv_max), |id| created.push(id))?;
                true
            }
            StreamType::UniLocal => false,
        };

        let bidi = !created.is_empty() && id & 0x2 == 0;
        for new_id in created {
            debug!(stream_id = new_id, "peer created stream");
            if let Some(handler) = self.handler.as_mut() {
                if bidi {
                    handler.new_bidi_stream(new_id);
                } else {
                    handler.new_recv_stream(new_id);
                }
            }
        }
        Ok(exists)
    }

    /// Same for the sending direction.
    fn ensure_send_stream(&mut self, id: u64) -> Result<bool> {
        let (send_max, recv_max) = self.stream_windows();
        let mut created = Vec::new();
        let exists = match stream_type_from_id(id, self.role) {
            StreamType::BidiLocal => self.local_bidi.get_mut(id).is_some(),
            StreamType::BidiRemote => {
                self.remote_bidi
                    .ensure(id, |id| Stream::bidi(id, send_max, recv_max), |id| created.push(id))?;
                true
            }
            StreamType::UniLocal => self.local_uni.get_mut(id).is_some(),
            StreamType::UniRemote => false,
        };
        for new_id in created {
            debug!(stream_id = new_id, "peer created stream");
            if let Some(handler) = self.handler.as_mut() {
                handler.new_bidi_stream(new_id);
            }
        }
        Ok(exists)
    }

    fn fire_readable(&mut self) {
        let mut readable = Vec::new();
        for set in [&mut self.local_bidi, &mut self.remote_bidi, &mut self.remote_uni] {
            for stream in set.iter_mut() {
                if stream.id() == 0 {
                    continue;
                }
                if let Some(recv) = stream.recv_mut() {
                    if recv.clear_readable() {
                        readable.push(stream.id());
                    }
                }
            }
        }
        if let Some(handler) = self.handler.as_mut() {
            for id in readable {
                handler.stream_readable(id);
            }
        }
    }

    // ========================================================================
    // Stream API
    // ========================================================================

    /// Open a bidirectional stream. Fails with `WouldBlock` when the peer's
    /// stream-id credit is exhausted (a STREAM_ID_BLOCKED goes out).
    pub fn create_stream(&mut self) -> Result<u64> {
        let (send_max, recv_max) = self.stream_windows();
        if let Some(stream) = self.local_bidi.create(|id| Stream::bidi(id, send_max, recv_max)) {
            let id = stream.id();
            debug!(stream_id = id, "created stream");
            return Ok(id);
        }
        let next = self.local_bidi.next_id();
        let _ = self.send_frame(Frame::StreamIdBlocked { stream_id: next });
        Err(Error::WouldBlock)
    }

    /// Open a send-only stream.
    pub fn create_send_stream(&mut self) -> Result<u64> {
        let (send_max, _) = self.stream_windows();
        if let Some(stream) = self.local_uni.create(|id| Stream::send_only(id, send_max)) {
            let id = stream.id();
            debug!(stream_id = id, "created send stream");
            return Ok(id);
        }
        let next = self.local_uni.next_id();
        let _ = self.send_frame(Frame::StreamIdBlocked { stream_id: next });
        Err(Error::WouldBlock)
    }

    /// Queue stream data. Never blocks; data beyond flow-control credit
    /// waits in the stream buffer.
    pub fn stream_write(&mut self, id: u64, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if !self.ensure_send_stream(id)? {
            return Err(Error::StreamClosed);
        }
        let written = self
            .send_half_mut(id)
            .ok_or(Error::StreamClosed)?
            .write(data)?;
        self.send_queued(false)?;
        Ok(written)
    }

    /// Read ordered stream data. `Err(WouldBlock)` when nothing is ready,
    /// `Ok(0)` at end of stream.
    pub fn stream_read(&mut self, id: u64, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let read = self
            .recv_half_mut(id)
            .ok_or(Error::StreamClosed)?
            .read(buf)?;

        if read > 0 && id != 0 {
            self.amount_read += read as u64;
            self.issue_stream_credit(id, false)?;
            self.issue_credit(false)?;
        }
        Ok(read)
    }

    /// Finish the send side cleanly.
    pub fn stream_close(&mut self, id: u64) -> Result<()> {
        self.send_half_mut(id).ok_or(Error::StreamClosed)?.close();
        self.send_queued(false)?;
        Ok(())
    }

    /// Abandon the send side immediately.
    pub fn stream_reset(&mut self, id: u64, error_code: u16) -> Result<()> {
        let final_offset = self.send_half_mut(id).ok_or(Error::StreamClosed)?.reset();
        match self.send_frame(Frame::RstStream { stream_id: id, error_code, final_offset }) {
            Ok(()) | Err(Error::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Ask the peer to stop sending on a stream.
    pub fn stop_sending(&mut self, id: u64, error_code: u16) -> Result<()> {
        if self.recv_half_mut(id).is_none() {
            return Err(Error::StreamClosed);
        }
        self.send_frame(Frame::StopSending { stream_id: id, error_code })
    }

    pub fn stream_send_state(&mut self, id: u64) -> Option<SendStreamState> {
        self.send_half(id).map(|h| h.state())
    }

    pub fn stream_recv_state(&mut self, id: u64) -> Option<RecvStreamState> {
        self.stream_mut(id).and_then(|s| s.recv().map(|h| h.state()))
    }

    /// Total bytes the send side of stream 0 has committed to the wire.
    pub fn stream0_send_used(&mut self) -> u64 {
        self.stream0_mut()
            .ok()
            .and_then(|s| s.send().map(|h| h.fc.used))
            .unwrap_or(0)
    }

    // ========================================================================
    // Paths & migration
    // ========================================================================

    fn current_path_mut(&mut self) -> Result<&mut Path> {
        self.paths
            .get_mut(&self.current_addr)
            .ok_or_else(|| Error::Internal("current path missing".into()))
    }

    fn get_or_make_path(&mut self, remote_addr: SocketAddr) -> Result<()> {
        if self.paths.contains_key(&remote_addr) {
            return Ok(());
        }
        debug!(addr = %remote_addr, "opening new path");
        let transport = self.transport_factory.make_transport(remote_addr)?;
        let mut path = Path::new(remote_addr, transport, Box::new(AlwaysAllow), self.mtu);
        // The connection identity carries over to the new route.
        let current = &self.paths[&self.current_addr];
        path.local_cid = current.local_cid.clone();
        path.remote_cid = current.remote_cid.clone();
        path.reset_token = current.reset_token;
        self.paths.insert(remote_addr, path);
        Ok(())
    }

    /// Adopt `remote_addr` as the current path, challenging it if it has
    /// not been validated yet.
    fn migrate(&mut self, remote_addr: SocketAddr) -> Result<()> {
        debug!(addr = %remote_addr, "migrating");
        self.get_or_make_path(remote_addr)?;
        self.current_addr = remote_addr;

        let path = self.current_path_mut()?;
        if !path.is_verified() {
            let challenge = path.generate_challenge()?;
            self.send_packet(
                PacketType::Short,
                &[Frame::PathChallenge { data: challenge }],
                Some(remote_addr),
                false,
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // Closing
    // ========================================================================

    fn send_close_packet(&mut self, code: TransportError, reason: &str) -> Result<Vec<u8>> {
        let frame = Frame::ConnectionClose {
            error_code: code.to_wire(),
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        };
        let pt = if self.write_protected.is_some() {
            PacketType::Short
        } else {
            PacketType::Handshake
        };
        self.send_packet(pt, &[frame], None, false)
    }

    fn close_internal(&mut self, code: TransportError, reason: &str, save_packet: bool) -> Result<()> {
        if self.is_closed() || self.state == State::Closing {
            return Ok(());
        }
        let rto = self.current_path_mut()?.congestion.rto();
        self.closing_end = Some(self.now.saturating_add(3 * rto));
        self.set_state(State::Closing);

        let packet = self.send_close_packet(code, reason)?;
        if save_packet {
            self.close_packet = Some(packet);
        }
        Ok(())
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("addr", &self.current_addr)
            .finish()
    }
}

fn stream_chunk_frame(stream_id: u64, chunk: StreamChunk) -> Frame {
    Frame::Stream {
        stream_id,
        offset: chunk.offset,
        fin: chunk.last,
        data: chunk.data,
    }
}

/// Drop every queued frame that was carried by packet `pn`; its content has
/// arrived.
fn remove_acked_frames(pn: u64, queue: &mut Vec<QueuedFrame>) {
    queue.retain(|frame| {
        let acked = frame.pns.contains(&pn);
        if acked {
            trace!(pn, frame = frame.frame.name(), "retiring acked frame");
        }
        !acked
    });
}

/// Stateless reset token for `cid` under the server's reset key.
pub(crate) fn reset_token_for(key: &[u8], cid: &ConnectionId) -> [u8; RESET_TOKEN_LENGTH] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(cid.as_bytes());
    let tag = mac.finalize().into_bytes();
    let mut token = [0u8; RESET_TOKEN_LENGTH];
    token.copy_from_slice(&tag[..RESET_TOKEN_LENGTH]);
    token
}
