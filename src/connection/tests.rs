//! End-to-end scenarios: two endpoints wired through in-memory transports
//! with the deterministic handshake oracle.

use super::*;
use crate::server::{ConnHandle, Server};
use crate::tls::oracle::{OracleConfig, OracleFactory};
use crate::transport::testing::{addr, pair, PacketQueue, TestTransportFactory};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    State(State),
    NewBidi(u64),
    NewRecv(u64),
    Readable(u64),
}

#[derive(Default, Clone)]
struct Recorder(Rc<RefCell<Vec<Event>>>);

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    fn saw(&self, event: &Event) -> bool {
        self.0.borrow().contains(event)
    }
}

impl ConnectionHandler for Recorder {
    fn state_changed(&mut self, state: State) {
        self.0.borrow_mut().push(Event::State(state));
    }
    fn new_bidi_stream(&mut self, stream_id: u64) {
        self.0.borrow_mut().push(Event::NewBidi(stream_id));
    }
    fn new_recv_stream(&mut self, stream_id: u64) {
        self.0.borrow_mut().push(Event::NewRecv(stream_id));
    }
    fn stream_readable(&mut self, stream_id: u64) {
        self.0.borrow_mut().push(Event::Readable(stream_id));
    }
}

/// A client and a direct (demultiplexer-less) server connection, wired back
/// to back.
struct Pair {
    client: Connection,
    server: Connection,
    to_server: PacketQueue,
    to_client: PacketQueue,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    client_events: Recorder,
    server_events: Recorder,
    now: Instant,
}

fn wide_open_params() -> TransportParameters {
    TransportParameters {
        initial_max_stream_data: 1 << 20,
        initial_max_data: 1 << 24,
        ..TransportParameters::default()
    }
}

impl Pair {
    fn new(oracle: OracleConfig, client_params: TransportParameters, server_params: TransportParameters) -> Self {
        let (client_factory, server_factory, to_server, to_client) = pair();
        let client_addr = addr(5000);
        let server_addr = addr(4433);
        let now = Instant::from_nanos(1_000_000);

        let client_events = Recorder::default();
        let server_events = Recorder::default();

        let tls = OracleFactory::new(oracle);
        let client = Connection::new_client(
            Box::new(client_factory.clone()),
            server_addr,
            &tls,
            Some(Box::new(client_events.clone())),
            ConnectionConfig { local_params: client_params, ..ConnectionConfig::default() },
            now,
        )
        .unwrap();
        let mut server = Connection::new_server(
            Box::new(server_factory.clone()),
            client_addr,
            &tls,
            ConnectionConfig { local_params: server_params, ..ConnectionConfig::default() },
            None,
            now,
        )
        .unwrap();
        server.set_handler(Box::new(server_events.clone()));

        Self {
            client,
            server,
            to_server,
            to_client,
            client_addr,
            server_addr,
            client_events,
            server_events,
            now,
        }
    }

    fn defaults() -> Self {
        Self::new(OracleConfig::default(), wide_open_params(), wide_open_params())
    }

    fn tick(&mut self) -> Instant {
        self.now = self.now.saturating_add(Duration::from_millis(1));
        self.now
    }

    /// Drain the client→server queue into the server. Returns datagrams
    /// delivered; per-packet errors are returned to the caller.
    fn deliver_to_server(&mut self) -> Result<usize> {
        self.deliver_to_server_from(self.client_addr)
    }

    fn deliver_to_server_from(&mut self, src: SocketAddr) -> Result<usize> {
        let now = self.tick();
        let mut n = 0;
        while let Some(payload) = self.to_server.pop() {
            self.server.input(
                UdpPacket { dst_addr: self.server_addr, src_addr: src, payload },
                now,
            )?;
            n += 1;
        }
        Ok(n)
    }

    fn deliver_to_client(&mut self) -> Result<usize> {
        let now = self.tick();
        let mut n = 0;
        while let Some(payload) = self.to_client.pop() {
            self.client.input(
                UdpPacket { dst_addr: self.client_addr, src_addr: self.server_addr, payload },
                now,
            )?;
            n += 1;
        }
        Ok(n)
    }

    /// Run the whole handshake: Initial → server flight → client finished.
    fn handshake(&mut self) {
        let now = self.tick();
        assert_eq!(self.client.check_timer(now).unwrap(), 1);
        self.deliver_to_server().unwrap();
        self.deliver_to_client().unwrap();
        self.deliver_to_server().unwrap();
        assert_eq!(self.client.state(), State::Established);
        assert_eq!(self.server.state(), State::Established);
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn test_happy_handshake() {
    let mut pair = Pair::defaults();

    let now = pair.tick();
    assert_eq!(pair.client.state(), State::Init);
    assert_eq!(pair.server.state(), State::WaitClientInitial);
    assert_eq!(pair.client.check_timer(now).unwrap(), 1);
    assert_eq!(pair.client.state(), State::WaitServerFirstFlight);

    // The first client datagram is padded to at least 1200 octets.
    assert_eq!(pair.to_server.len(), 1);
    let initial = pair.to_server.pop().unwrap();
    assert!(initial.len() >= 1200, "initial is {} octets", initial.len());
    pair.to_server.push(initial);

    pair.deliver_to_server().unwrap();
    assert_eq!(pair.server.state(), State::WaitClientSecondFlight);

    pair.deliver_to_client().unwrap();
    assert_eq!(pair.client.state(), State::Established);

    pair.deliver_to_server().unwrap();
    assert_eq!(pair.server.state(), State::Established);

    // Stream 0 accounting lines up across the wire: everything each side
    // committed was consumed by its peer.
    let client_sent = pair.client.stream0_send_used();
    let server_sent = pair.server.stream0_send_used();
    assert!(client_sent > 0 && server_sent > 0);
    let server_consumed = pair
        .server
        .stream0_mut()
        .unwrap()
        .recv()
        .unwrap()
        .read_offset();
    let client_consumed = pair
        .client
        .stream0_mut()
        .unwrap()
        .recv()
        .unwrap()
        .read_offset();
    assert_eq!(client_sent, server_consumed);
    assert_eq!(server_sent, client_consumed);

    // Handler callbacks fired for every transition, in order.
    assert_eq!(
        pair.client_events.events(),
        vec![
            Event::State(State::WaitServerFirstFlight),
            Event::State(State::Established),
        ]
    );
    assert_eq!(
        pair.server_events.events(),
        vec![
            Event::State(State::WaitClientSecondFlight),
            Event::State(State::Established),
        ]
    );
}

#[test]
fn test_client_packet_numbers_ascend() {
    let mut pair = Pair::defaults();
    let now = pair.tick();
    pair.client.check_timer(now).unwrap();
    let first = pair.to_server.pop().unwrap();
    // Re-sent initial consumes the next packet number.
    let now = pair.tick();
    pair.client.check_timer(now).unwrap();
    let second = pair.to_server.pop().unwrap();

    let (h1, _) = PacketHeader::decode(&first, CID_DEFAULT_LENGTH).unwrap();
    let (h2, _) = PacketHeader::decode(&second, CID_DEFAULT_LENGTH).unwrap();
    assert_eq!(h2.packet_number, h1.packet_number + 1);
}

#[test]
fn test_stateless_retry_handshake() {
    let oracle = OracleConfig { force_retry: true };
    let mut pair = Pair::new(oracle, wide_open_params(), wide_open_params());

    let now = pair.tick();
    pair.client.check_timer(now).unwrap();
    pair.deliver_to_server().unwrap();
    // The server answered with a Retry and committed nothing.
    assert_eq!(pair.server.state(), State::WaitClientInitial);
    assert_eq!(pair.to_client.len(), 1);

    // The retry triggers a fresh, cookie-bearing Initial.
    pair.deliver_to_client().unwrap();
    assert_eq!(pair.client.state(), State::WaitServerFirstFlight);
    assert_eq!(pair.to_server.len(), 1);

    pair.deliver_to_server().unwrap();
    assert_eq!(pair.server.state(), State::WaitClientSecondFlight);
    pair.deliver_to_client().unwrap();
    pair.deliver_to_server().unwrap();

    assert_eq!(pair.client.state(), State::Established);
    assert_eq!(pair.server.state(), State::Established);
}

// ============================================================================
// Streams and data
// ============================================================================

#[test]
fn test_app_data_both_directions() {
    let mut pair = Pair::defaults();
    pair.handshake();

    // Client-initiated bidirectional stream.
    let id = pair.client.create_stream().unwrap();
    assert_eq!(id, 4);
    pair.client.stream_write(id, b"ping from client").unwrap();
    pair.deliver_to_server().unwrap();

    assert!(pair.server_events.saw(&Event::NewBidi(4)));
    assert!(pair.server_events.saw(&Event::Readable(4)));

    let mut buf = [0u8; 64];
    let n = pair.server.stream_read(id, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping from client");
    assert_eq!(pair.server.stream_read(id, &mut buf), Err(Error::WouldBlock));

    // Echo back on the same stream, then close it.
    pair.server.stream_write(id, b"pong from server").unwrap();
    pair.server.stream_close(id).unwrap();
    pair.deliver_to_client().unwrap();

    assert!(pair.client_events.saw(&Event::Readable(4)));
    let n = pair.client.stream_read(id, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong from server");
    // FIN consumed: end of stream.
    assert_eq!(pair.client.stream_read(id, &mut buf).unwrap(), 0);

    // Server-initiated stream shows up as a new bidi stream on the client.
    let sid = pair.server.create_stream().unwrap();
    assert_eq!(sid, 1);
    pair.server.stream_write(sid, b"server speaks first").unwrap();
    pair.deliver_to_client().unwrap();
    assert!(pair.client_events.saw(&Event::NewBidi(1)));
    let n = pair.client.stream_read(sid, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"server speaks first");
}

#[test]
fn test_unidirectional_stream() {
    let mut pair = Pair::defaults();
    pair.handshake();

    let id = pair.client.create_send_stream().unwrap();
    assert_eq!(id, 2);
    pair.client.stream_write(id, b"one way").unwrap();
    pair.client.stream_close(id).unwrap();
    pair.deliver_to_server().unwrap();

    assert!(pair.server_events.saw(&Event::NewRecv(2)));
    let mut buf = [0u8; 16];
    let n = pair.server.stream_read(id, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"one way");
    assert_eq!(pair.server.stream_read(id, &mut buf).unwrap(), 0);

    // The sender has no receive half there.
    assert_eq!(pair.client.stream_read(id, &mut buf), Err(Error::StreamClosed));
}

#[test]
fn test_stream_reset_propagates() {
    let mut pair = Pair::defaults();
    pair.handshake();

    let id = pair.client.create_stream().unwrap();
    pair.client.stream_write(id, b"doomed").unwrap();
    pair.deliver_to_server().unwrap();

    pair.client.stream_reset(id, 42).unwrap();
    assert_eq!(pair.client.stream_send_state(id), Some(SendStreamState::ResetSent));
    pair.deliver_to_server().unwrap();

    assert_eq!(pair.server.stream_recv_state(id), Some(RecvStreamState::ResetRecvd));
    let mut buf = [0u8; 8];
    assert_eq!(pair.server.stream_read(id, &mut buf), Err(Error::StreamClosed));
}

#[test]
fn test_stop_sending_resets_peer_send_half() {
    let mut pair = Pair::defaults();
    pair.handshake();

    let id = pair.client.create_stream().unwrap();
    pair.client.stream_write(id, b"unwanted").unwrap();
    pair.deliver_to_server().unwrap();

    pair.server.stop_sending(id, 0).unwrap();
    pair.deliver_to_client().unwrap();

    // STOP_SENDING turns around into RST_STREAM on the client's send half.
    assert_eq!(pair.client.stream_send_state(id), Some(SendStreamState::ResetSent));
    pair.deliver_to_server().unwrap();
    assert_eq!(pair.server.stream_recv_state(id), Some(RecvStreamState::ResetRecvd));
}

#[test]
fn test_stream_id_credit_cycle() {
    // Server grants only two client-initiated bidi streams (stream 0 plus
    // one application stream).
    let mut server_params = wide_open_params();
    server_params.max_streams_bidi = 2;
    let mut pair = Pair::new(OracleConfig::default(), wide_open_params(), server_params);
    pair.handshake();

    assert_eq!(pair.client.create_stream().unwrap(), 4);
    // Credit exhausted: STREAM_ID_BLOCKED goes to the server.
    assert_eq!(pair.client.create_stream(), Err(Error::WouldBlock));
    pair.deliver_to_server().unwrap();

    // The server reacts with MAX_STREAM_ID; creation then succeeds.
    pair.deliver_to_client().unwrap();
    assert_eq!(pair.client.create_stream().unwrap(), 8);
}

// ============================================================================
// Reliability
// ============================================================================

#[test]
fn test_lost_packets_retransmit_with_original_offsets() {
    let mut pair = Pair::defaults();
    pair.handshake();

    let id = pair.client.create_stream().unwrap();
    let chunk: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    for _ in 0..10 {
        pair.client.stream_write(id, &chunk).unwrap();
    }
    assert_eq!(pair.to_server.len(), 10);

    // Which packet numbers carried which frame, in emission order.
    let carried: Vec<u64> = pair
        .client
        .output_protected_q
        .iter()
        .filter(|f| matches!(f.frame, Frame::Stream { .. }))
        .map(|f| f.pns[0])
        .collect();
    assert_eq!(carried.len(), 10);
    let dropped: Vec<u64> = carried[2..5].to_vec();

    // Deliver everything except packets 3..=5.
    let now = pair.tick();
    let mut position = 0;
    while let Some(payload) = pair.to_server.pop() {
        if !(2..5).contains(&position) {
            pair.server
                .input(
                    UdpPacket {
                        dst_addr: pair.server_addr,
                        src_addr: pair.client_addr,
                        payload,
                    },
                    now,
                )
                .unwrap();
        }
        position += 1;
    }

    // The server ACKs what it saw; the ACK retires the delivered frames.
    pair.deliver_to_client().unwrap();
    let survivors: Vec<u64> = pair
        .client
        .output_protected_q
        .iter()
        .filter(|f| matches!(f.frame, Frame::Stream { .. }))
        .map(|f| f.pns[0])
        .collect();
    assert_eq!(survivors, dropped);

    // Declare the dropped packets lost: every surviving frame flips to
    // needs_transmit.
    for pn in &dropped {
        pair.client.handle_lost_packet(*pn);
    }
    for frame in pair
        .client
        .output_protected_q
        .iter()
        .filter(|f| matches!(f.frame, Frame::Stream { .. }))
    {
        assert!(frame.needs_transmit);
        assert_eq!(frame.lost_pns, frame.pns);
    }

    // The re-flush re-sends them at their original offsets; the server can
    // then read the full, contiguous stream.
    pair.client.send_queued(false).unwrap();
    assert_eq!(pair.to_server.len(), 3);
    pair.deliver_to_server().unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match pair.server.stream_read(id, &mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(Error::WouldBlock) => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(received.len(), 10_000);
    let expected: Vec<u8> = (0..10usize)
        .flat_map(|_| chunk.clone())
        .collect();
    assert_eq!(received, expected);
}

#[test]
fn test_duplicate_packet_is_noop() {
    let mut pair = Pair::defaults();
    pair.handshake();

    let id = pair.client.create_stream().unwrap();
    pair.client.stream_write(id, b"only once").unwrap();
    let payload = pair.to_server.pop().unwrap();

    let now = pair.tick();
    let packet = UdpPacket {
        dst_addr: pair.server_addr,
        src_addr: pair.client_addr,
        payload: payload.clone(),
    };
    pair.server.input(packet.clone(), now).unwrap();

    let mut buf = [0u8; 32];
    let n = pair.server.stream_read(id, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"only once");

    // The byte-identical datagram again: swallowed, nothing re-delivered.
    pair.server.input(packet, now).unwrap();
    assert_eq!(pair.server.state(), State::Established);
    assert_eq!(pair.server.stream_read(id, &mut buf), Err(Error::WouldBlock));
}

// ============================================================================
// Flow control
// ============================================================================

#[test]
fn test_flow_control_stall_and_refill() {
    // The server only grants 2048 octets per stream.
    let mut server_params = wide_open_params();
    server_params.initial_max_stream_data = 2048;
    let mut pair = Pair::new(OracleConfig::default(), wide_open_params(), server_params);
    pair.handshake();

    let id = pair.client.create_stream().unwrap();
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 241) as u8).collect();
    assert_eq!(pair.client.stream_write(id, &data).unwrap(), 4096);

    // Only the first 2048 octets may leave; the rest stalls locally.
    pair.deliver_to_server().unwrap();
    {
        let send = pair.client.send_half(id).unwrap();
        assert_eq!(send.fc.used, 2048);
    }
    assert_eq!(
        pair.client
            .send_half_mut(id)
            .unwrap()
            .outstanding_queued_bytes(),
        2048
    );

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match pair.server.stream_read(id, &mut buf) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(Error::WouldBlock) => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(received.len(), 2048);

    // Reading freed window; the server re-credits the stream, which lets
    // the remaining 2048 octets flush with their original offsets.
    pair.deliver_to_client().unwrap();
    pair.deliver_to_server().unwrap();
    loop {
        match pair.server.stream_read(id, &mut buf) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(Error::WouldBlock) => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(received, data);
}

#[test]
fn test_max_stream_data_queue_replacement() {
    let mut pair = Pair::defaults();
    pair.handshake();

    let id = pair.client.create_stream().unwrap();
    pair.client.stream_write(id, b"x").unwrap();
    pair.deliver_to_server().unwrap();

    // Force two credit issues back to back; only the newest advertisement
    // may remain queued.
    pair.server.issue_stream_credit(id, true).unwrap();
    pair.server.issue_stream_credit(id, true).unwrap();
    let advertisements: Vec<u64> = pair
        .server
        .output_protected_q
        .iter()
        .filter_map(|f| match &f.frame {
            Frame::MaxStreamData { stream_id, maximum } if *stream_id == id => Some(*maximum),
            _ => None,
        })
        .collect();
    assert_eq!(advertisements.len(), 1);
    let latest = pair.server.recv_half_mut(id).unwrap().fc.max;
    assert_eq!(advertisements[0], latest);
}

// ============================================================================
// Migration
// ============================================================================

#[test]
fn test_migration_to_new_address() {
    let mut pair = Pair::defaults();
    pair.handshake();
    assert_eq!(pair.server.remote_addr(), pair.client_addr);

    let id = pair.client.create_stream().unwrap();
    pair.client.stream_write(id, b"hello from elsewhere").unwrap();

    // The same datagram arrives from a different remote address (NAT
    // rebinding): the server migrates its current path.
    let new_addr = addr(7777);
    pair.deliver_to_server_from(new_addr).unwrap();
    assert_eq!(pair.server.remote_addr(), new_addr);

    let mut buf = [0u8; 32];
    let n = pair.server.stream_read(id, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello from elsewhere");

    // The unverified path got challenged; the response verifies it.
    assert!(!pair.server.paths[&new_addr].is_verified());
    pair.deliver_to_client().unwrap();
    pair.deliver_to_server_from(new_addr).unwrap();
    assert!(pair.server.paths[&new_addr].is_verified());

    // Replies flow over the new path.
    pair.server.stream_write(id, b"ack").unwrap();
    assert!(pair.to_client.len() > 0);
    pair.deliver_to_client().unwrap();
    let n = pair.client.stream_read(id, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ack");
}

#[test]
fn test_probing_frames_do_not_migrate() {
    let mut pair = Pair::defaults();
    pair.handshake();

    // A PATH_CHALLENGE alone is a probing packet; the path must not move.
    let challenge = Frame::PathChallenge { data: [7; 8] };
    pair.client
        .send_packet(PacketType::Short, &[challenge], None, false)
        .unwrap();
    let new_addr = addr(8888);
    pair.deliver_to_server_from(new_addr).unwrap();
    assert_eq!(pair.server.remote_addr(), pair.client_addr);
}

// ============================================================================
// Closing and errors
// ============================================================================

#[test]
fn test_close_and_draining_period() {
    let mut pair = Pair::defaults();
    pair.handshake();

    pair.client.close().unwrap();
    assert_eq!(pair.client.state(), State::Closing);
    assert_eq!(pair.to_server.len(), 1);

    // The peer drains when the close arrives.
    let result = pair.deliver_to_server();
    assert!(result.is_ok());
    assert_eq!(pair.server.state(), State::Closing);

    // Datagrams during the draining period re-trigger the saved close.
    let now = pair.tick();
    let junk = UdpPacket {
        dst_addr: pair.client_addr,
        src_addr: pair.server_addr,
        payload: bytes::Bytes::from_static(&[0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
    };
    assert_eq!(pair.client.input(junk, now), Err(Error::ConnectionClosing));
    assert_eq!(pair.to_server.len(), 1);

    // The draining period ends 3 RTOs after close.
    let later = pair.now.saturating_add(Duration::from_secs(2));
    assert_eq!(pair.client.check_timer(later), Err(Error::ConnectionClosed));
    assert_eq!(pair.client.state(), State::Closed);
    assert_eq!(
        pair.client.input(
            UdpPacket {
                dst_addr: pair.client_addr,
                src_addr: pair.server_addr,
                payload: bytes::Bytes::from_static(&[0x40, 0, 0]),
            },
            later,
        ),
        Err(Error::ConnectionClosed)
    );
}

#[test]
fn test_idle_timeout_closes() {
    let mut pair = Pair::defaults();
    pair.handshake();

    let idle = pair.now.saturating_add(Duration::from_secs(6));
    assert_eq!(pair.client.check_timer(idle), Err(Error::ConnectionClosing));
    assert_eq!(pair.client.state(), State::Closing);

    let later = idle.saturating_add(Duration::from_millis(1));
    assert_eq!(pair.client.check_timer(later), Err(Error::ConnectionClosed));
    assert_eq!(pair.client.state(), State::Closed);
}

#[test]
fn test_version_negotiation_mismatch() {
    let mut pair = Pair::defaults();
    // Make the client speak a version the server does not know.
    pair.client.version = VersionNumber(0xff00_0022);

    let now = pair.tick();
    pair.client.check_timer(now).unwrap();
    let result = pair.deliver_to_server();
    assert!(result.is_err());
    assert_eq!(pair.server.state(), State::Error);
    // One version negotiation packet went back.
    assert_eq!(pair.to_client.len(), 1);

    let result = pair.deliver_to_client();
    assert_eq!(result, Err(Error::VersionNegotiation));
    assert_eq!(pair.client.state(), State::Error);
}

// ============================================================================
// Server demultiplexer end-to-end
// ============================================================================

struct DemuxWorld {
    server: Server,
    client: Connection,
    to_server: PacketQueue,
    to_client: PacketQueue,
    server_factory: TestTransportFactory,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    now: Instant,
}

impl DemuxWorld {
    fn new() -> Self {
        let (client_factory, server_factory, to_server, to_client) = pair();
        let client_addr = addr(6000);
        let server_addr = addr(4433);
        let now = Instant::from_nanos(1_000_000);

        let tls = OracleFactory::new(OracleConfig::default());
        let server = Server::new(
            Rc::new(server_factory.clone()),
            Box::new(OracleFactory::new(OracleConfig::default())),
            ConnectionConfig { local_params: wide_open_params(), ..ConnectionConfig::default() },
            None,
        );
        let client = Connection::new_client(
            Box::new(client_factory),
            server_addr,
            &tls,
            None,
            ConnectionConfig { local_params: wide_open_params(), ..ConnectionConfig::default() },
            now,
        )
        .unwrap();

        Self { server, client, to_server, to_client, server_factory, client_addr, server_addr, now }
    }

    fn tick(&mut self) -> Instant {
        self.now = self.now.saturating_add(Duration::from_millis(1));
        self.now
    }

    fn pump_to_server(&mut self, src: SocketAddr) -> Result<Option<ConnHandle>> {
        let now = self.tick();
        let mut last = None;
        while let Some(payload) = self.to_server.pop() {
            let conn = self.server.input(
                UdpPacket { dst_addr: self.server_addr, src_addr: src, payload },
                now,
            )?;
            last = Some(conn);
        }
        Ok(last)
    }

    fn pump_to_client(&mut self) -> Result<usize> {
        let now = self.tick();
        let mut n = 0;
        while let Some(payload) = self.to_client.pop() {
            self.client.input(
                UdpPacket { dst_addr: self.client_addr, src_addr: self.server_addr, payload },
                now,
            )?;
            n += 1;
        }
        Ok(n)
    }

    fn connect(&mut self) -> ConnHandle {
        let now = self.tick();
        self.client.check_timer(now).unwrap();
        let c1 = self.pump_to_server(self.client_addr).unwrap().unwrap();
        self.pump_to_client().unwrap();
        let c2 = self.pump_to_server(self.client_addr).unwrap().unwrap();
        assert!(Rc::ptr_eq(&c1, &c2), "one connection object per client");
        assert_eq!(self.client.state(), State::Established);
        assert_eq!(c2.borrow().state(), State::Established);
        c2
    }
}

#[test]
fn test_server_demux_routes_by_cid() {
    let mut world = DemuxWorld::new();
    let conn = world.connect();
    assert_eq!(world.server.connection_count(), 1);

    // A second client behind its own queues and a different address.
    let (factory2, _unused_server_factory, to_server2, _to_client2) = pair();
    let tls = OracleFactory::new(OracleConfig::default());
    let mut client2 = Connection::new_client(
        Box::new(factory2),
        world.server_addr,
        &tls,
        None,
        ConnectionConfig { local_params: wide_open_params(), ..ConnectionConfig::default() },
        world.now,
    )
    .unwrap();
    let now = world.tick();
    client2.check_timer(now).unwrap();

    // Relay its Initial into the shared server by hand.
    let addr2 = addr(6001);
    let mut conn2 = None;
    while let Some(payload) = to_server2.pop() {
        conn2 = Some(
            world
                .server
                .input(
                    UdpPacket { dst_addr: world.server_addr, src_addr: addr2, payload },
                    now,
                )
                .unwrap(),
        );
    }
    let conn2 = conn2.expect("initial created a connection");
    assert!(!Rc::ptr_eq(&conn, &conn2));
    assert_eq!(world.server.connection_count(), 2);
}

#[test]
fn test_server_stateless_reset_end_to_end() {
    let mut world = DemuxWorld::new();
    let conn = world.connect();

    // The handshake delivered the server's reset token to the client.
    let token = world.client.path_reset_token().expect("client holds a reset token");
    let server_cid = world.client.server_id();

    // Close at the server, but keep the close packet from reaching the
    // client, then let the draining period expire so the server forgets
    // the connection entirely.
    world.server_factory.set_blackhole(true);
    conn.borrow_mut().close().unwrap();
    let later = world.now.saturating_add(Duration::from_secs(2));
    world.now = later;
    world.server.check_timer(later).unwrap();
    assert_eq!(world.server.connection_count(), 0);
    world.server_factory.set_blackhole(false);

    // A short-header packet for the forgotten CID earns a stateless reset
    // ending in the token.
    let mut orphan = vec![0x40u8];
    orphan.extend_from_slice(server_cid.as_bytes());
    orphan.extend_from_slice(&[0xab; 30]);
    let now = world.tick();
    let result = world.server.input(
        UdpPacket {
            dst_addr: world.server_addr,
            src_addr: world.client_addr,
            payload: bytes::Bytes::from(orphan),
        },
        now,
    );
    assert!(result.is_err());
    assert_eq!(world.to_client.len(), 1);
    let reset = world.to_client.pop().unwrap();
    assert_eq!(&reset[reset.len() - 16..], &token);

    // The client terminates immediately and silently on the token match.
    world.to_server.clear();
    let now = world.tick();
    let result = world.client.input(
        UdpPacket {
            dst_addr: world.client_addr,
            src_addr: world.server_addr,
            payload: reset,
        },
        now,
    );
    assert_eq!(result, Err(Error::StatelessReset));
    assert_eq!(world.client.state(), State::Closed);
    assert_eq!(world.to_server.len(), 0, "no CONNECTION_CLOSE may be sent");
}

#[test]
fn test_server_sweeps_idle_connections() {
    let mut world = DemuxWorld::new();
    let _conn = world.connect();
    assert_eq!(world.server.connection_count(), 1);

    // Push past the idle timeout, then past the draining period.
    let idle = world.now.saturating_add(Duration::from_secs(6));
    world.server.check_timer(idle).unwrap();
    assert_eq!(world.server.connection_count(), 1);

    let drained = idle.saturating_add(Duration::from_millis(1));
    world.server.check_timer(drained).unwrap();
    assert_eq!(world.server.connection_count(), 0);
}
