//! The datagram substrate.
//!
//! The endpoint never touches sockets. It sends through a [`Transport`]
//! bound to one remote address and receives whatever the host feeds into
//! `input`. A [`TransportFactory`] mints transports on demand, at connection
//! setup and whenever a new path appears.

use crate::error::Result;
use bytes::Bytes;
use std::net::SocketAddr;

/// One received datagram.
#[derive(Debug, Clone)]
pub struct UdpPacket {
    pub dst_addr: SocketAddr,
    pub src_addr: SocketAddr,
    pub payload: Bytes,
}

/// Write side of a datagram flow to a fixed remote address.
pub trait Transport {
    fn send(&mut self, packet: &[u8]) -> Result<()>;
}

/// Creates transports bound to specific remote addresses.
pub trait TransportFactory {
    fn make_transport(&self, remote: SocketAddr) -> Result<Box<dyn Transport>>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transports: each factory delivers into a shared queue the
    //! test (or the peer side) drains explicitly.

    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// A shared FIFO of datagrams.
    #[derive(Clone, Default)]
    pub struct PacketQueue {
        inner: Rc<RefCell<VecDeque<Bytes>>>,
    }

    impl PacketQueue {
        pub fn push(&self, packet: Bytes) {
            self.inner.borrow_mut().push_back(packet);
        }

        pub fn pop(&self) -> Option<Bytes> {
            self.inner.borrow_mut().pop_front()
        }

        pub fn len(&self) -> usize {
            self.inner.borrow().len()
        }

        pub fn clear(&self) {
            self.inner.borrow_mut().clear();
        }
    }

    /// Factory whose transports all feed one delivery queue.
    #[derive(Clone)]
    pub struct TestTransportFactory {
        delivery: PacketQueue,
        /// When set, sends vanish instead of being delivered.
        blackhole: Rc<Cell<bool>>,
    }

    impl TestTransportFactory {
        pub fn set_blackhole(&self, on: bool) {
            self.blackhole.set(on);
        }
    }

    struct TestTransport {
        delivery: PacketQueue,
        blackhole: Rc<Cell<bool>>,
    }

    impl Transport for TestTransport {
        fn send(&mut self, packet: &[u8]) -> Result<()> {
            if !self.blackhole.get() {
                self.delivery.push(Bytes::copy_from_slice(packet));
            }
            Ok(())
        }
    }

    impl TransportFactory for TestTransportFactory {
        fn make_transport(&self, _remote: SocketAddr) -> Result<Box<dyn Transport>> {
            Ok(Box::new(TestTransport {
                delivery: self.delivery.clone(),
                blackhole: self.blackhole.clone(),
            }))
        }
    }

    /// Two factories wired back to back. The first return is the client's
    /// factory, whose sends land in `to_server`; symmetrically for the
    /// server.
    pub fn pair() -> (TestTransportFactory, TestTransportFactory, PacketQueue, PacketQueue) {
        let to_server = PacketQueue::default();
        let to_client = PacketQueue::default();
        let client = TestTransportFactory {
            delivery: to_server.clone(),
            blackhole: Rc::new(Cell::new(false)),
        };
        let server = TestTransportFactory {
            delivery: to_client.clone(),
            blackhole: Rc::new(Cell::new(false)),
        };
        (client, server, to_server, to_client)
    }

    pub fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }
}
