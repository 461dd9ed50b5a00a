//! The server demultiplexer.
//!
//! Routes inbound datagrams to connections by destination connection ID,
//! falling back to the remote address, creating server connections for new
//! long-header packets, and answering orphan short-header packets with a
//! stateless reset. Connections are published into the tables only after
//! their first Initial processed cleanly, because the server-chosen CID does
//! not exist before that.

use crate::connection::{reset_token_for, Connection, ConnectionConfig};
use crate::error::{Error, Result};
use crate::packet::header::{PacketHeader, LONG_HEADER_FLAG, SHORT_FIXED_BIT};
use crate::tls::HandshakeFactory;
use crate::transport::{Transport, TransportFactory, UdpPacket};
use crate::types::{ConnectionId, Instant, CID_DEFAULT_LENGTH, RESET_TOKEN_LENGTH};
use rand::RngCore;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, warn};

/// Shared handle to a server-side connection. The endpoint is
/// single-threaded cooperative, so connections live behind `Rc<RefCell>`.
pub type ConnHandle = Rc<RefCell<Connection>>;

/// Server event callbacks.
pub trait ServerHandler {
    /// A connection finished processing its first Initial and joined the
    /// tables.
    fn new_connection(&mut self, connection: ConnHandle);
}

/// A QUIC server: demultiplexer plus connection factory.
pub struct Server {
    handler: Option<Box<dyn ServerHandler>>,
    transport_factory: Rc<dyn TransportFactory>,
    tls_factory: Box<dyn HandshakeFactory>,
    config: ConnectionConfig,
    id_table: HashMap<ConnectionId, ConnHandle>,
    addr_table: HashMap<SocketAddr, ConnHandle>,
    /// Lazily generated key behind every stateless reset token this server
    /// hands out.
    reset_key: Option<Vec<u8>>,
}

impl Server {
    pub fn new(
        transport_factory: Rc<dyn TransportFactory>,
        tls_factory: Box<dyn HandshakeFactory>,
        config: ConnectionConfig,
        handler: Option<Box<dyn ServerHandler>>,
    ) -> Self {
        Self {
            handler,
            transport_factory,
            tls_factory,
            config,
            id_table: HashMap::new(),
            addr_table: HashMap::new(),
            reset_key: None,
        }
    }

    pub fn set_handler(&mut self, handler: Box<dyn ServerHandler>) {
        self.handler = Some(handler);
    }

    pub fn connection_count(&self) -> usize {
        self.id_table.len()
    }

    fn reset_key(&mut self) -> Vec<u8> {
        self.reset_key
            .get_or_insert_with(|| {
                let mut key = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                key
            })
            .clone()
    }

    /// Route one datagram. Returns the connection that consumed it.
    pub fn input(&mut self, packet: UdpPacket, now: Instant) -> Result<ConnHandle> {
        let addr = packet.src_addr;
        debug!(%addr, len = packet.payload.len(), "server datagram");

        let (hdr, _) = PacketHeader::decode(&packet.payload, CID_DEFAULT_LENGTH)
            .map_err(|e| Error::NonFatal(format!("undecodable datagram: {e}")))?;

        let mut conn = None;
        if !hdr.dest_cid.is_empty() {
            conn = self.id_table.get(&hdr.dest_cid).cloned();
            if conn.is_some() {
                debug!(cid = %hdr.dest_cid, "matched by connection id");
            }
        }
        if conn.is_none() {
            conn = self.addr_table.get(&addr).cloned();
        }

        if let Some(conn) = conn {
            let result = conn.borrow_mut().input(packet, now);
            return match result {
                Ok(()) => Ok(conn),
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "connection died, dropping from tables");
                    self.remove(&conn);
                    Err(e)
                }
                // Closing/closed/recoverable: the connection handled it.
                Err(_) => Ok(conn),
            };
        }

        if hdr.packet_type.is_long_header() {
            return self.accept(packet, now);
        }

        // Orphan short-header packet: answer with a stateless reset when the
        // datagram is big enough to have been a real packet.
        if packet.payload.len() >= 2 + hdr.dest_cid.len() + 1 + RESET_TOKEN_LENGTH {
            self.send_stateless_reset(addr, &hdr.dest_cid)?;
        } else {
            debug!("orphan runt packet, not resetting");
        }
        Err(Error::DestroyConnection)
    }

    /// Create a server connection for a first-contact long-header packet.
    fn accept(&mut self, packet: UdpPacket, now: Instant) -> Result<ConnHandle> {
        let addr = packet.src_addr;
        debug!(%addr, "new server connection");

        let reset_key = self.reset_key();
        let conn = Connection::new_server(
            Box::new(SharedFactory(self.transport_factory.clone())),
            addr,
            &*self.tls_factory,
            self.config.clone(),
            Some(reset_key),
            now,
        )?;
        let handle: ConnHandle = Rc::new(RefCell::new(conn));

        let result = handle.borrow_mut().input(packet, now);
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "connection died before publication");
                return Err(e);
            }
            Err(_) => {}
        }

        // Publication happens only now: the Initial has been handled, so the
        // server-chosen CID exists.
        let server_cid = handle.borrow().server_id();
        if !server_cid.is_empty() {
            self.id_table.insert(server_cid, handle.clone());
        }
        self.addr_table.insert(addr, handle.clone());
        if let Some(h) = self.handler.as_mut() {
            h.new_connection(handle.clone());
        }
        Ok(handle)
    }

    /// Drive every connection's timer, sweeping the dead.
    pub fn check_timer(&mut self, now: Instant) -> Result<()> {
        let mut dead = Vec::new();
        for conn in self.id_table.values() {
            let result = conn.borrow_mut().check_timer(now);
            if let Err(e) = result {
                if e == Error::ConnectionClosed || e.is_fatal() {
                    dead.push(conn.clone());
                }
            }
        }
        for conn in dead {
            debug!("sweeping dead connection");
            self.remove(&conn);
        }
        Ok(())
    }

    fn remove(&mut self, conn: &ConnHandle) {
        let (cid, addr) = {
            let c = conn.borrow();
            (c.server_id(), c.remote_addr())
        };
        self.id_table.remove(&cid);
        if let Some(entry) = self.addr_table.get(&addr) {
            if Rc::ptr_eq(entry, conn) {
                self.addr_table.remove(&addr);
            }
        }
    }

    /// One-shot datagram that tells a stateless peer to go away: random
    /// short-header-shaped bytes ending in the token its connection once
    /// advertised.
    fn send_stateless_reset(&mut self, addr: SocketAddr, cid: &ConnectionId) -> Result<()> {
        debug!(%addr, %cid, "sending stateless reset");
        let key = self.reset_key();
        let token = reset_token_for(&key, cid);

        let mut packet = vec![0u8; 21];
        rand::thread_rng().fill_bytes(&mut packet);
        packet[0] = (packet[0] & !LONG_HEADER_FLAG) | SHORT_FIXED_BIT;
        packet.extend_from_slice(&token);

        let mut transport = self.transport_factory.make_transport(addr)?;
        transport.send(&packet)
    }
}

/// Lets many connections share one factory.
struct SharedFactory(Rc<dyn TransportFactory>);

impl TransportFactory for SharedFactory {
    fn make_transport(&self, remote: SocketAddr) -> Result<Box<dyn Transport>> {
        self.0.make_transport(remote)
    }
}
