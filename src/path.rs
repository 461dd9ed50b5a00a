//! Network paths.
//!
//! A path binds the pair of connection IDs to a transport, a congestion
//! controller, and the validation state for that remote address. Unverified
//! paths carry a finite packet budget so an endpoint cannot be used to blast
//! an address that never proved it is listening.

use crate::congestion::CongestionController;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::{ConnectionId, RESET_TOKEN_LENGTH, UNVERIFIED_PATH_PACKETS};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Path-challenge material: a keyed counter. Outstanding challenges need no
/// table; the response is re-derived and compared.
struct ChallengeState {
    key: [u8; 32],
    counter: u8,
}

impl ChallengeState {
    fn calculate(&self, counter: u8) -> [u8; 8] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&[counter]);
        let tag = mac.finalize().into_bytes();
        let mut out = [0u8; 8];
        out[0] = counter;
        out[1..].copy_from_slice(&tag[..7]);
        out
    }
}

/// One usable route to the peer.
pub struct Path {
    pub local_cid: ConnectionId,
    pub remote_cid: ConnectionId,
    pub remote_addr: SocketAddr,
    pub transport: Box<dyn Transport>,
    pub congestion: Box<dyn CongestionController>,
    /// Token whose appearance at the tail of a short packet means the peer
    /// lost its state for this connection.
    pub reset_token: Option<[u8; RESET_TOKEN_LENGTH]>,
    pub mtu: usize,
    /// Packets still allowed before validation; `u64::MAX` once verified.
    packets_allowed: u64,
    challenge: Option<ChallengeState>,
}

impl Path {
    pub fn new(
        remote_addr: SocketAddr,
        transport: Box<dyn Transport>,
        congestion: Box<dyn CongestionController>,
        mtu: usize,
    ) -> Self {
        Self {
            local_cid: ConnectionId::empty(),
            remote_cid: ConnectionId::empty(),
            remote_addr,
            transport,
            congestion,
            reset_token: None,
            mtu,
            packets_allowed: UNVERIFIED_PATH_PACKETS,
            challenge: None,
        }
    }

    /// Hand a finished packet to the transport. `ack_only` packets are not
    /// charged as in-flight by the congestion controller.
    pub fn send(&mut self, pn: u64, packet: &[u8], ack_only: bool) -> Result<()> {
        if self.packets_allowed == 0 {
            debug!(addr = %self.remote_addr, "unverified path out of packet budget");
            return Err(Error::WouldBlock);
        }
        self.congestion.on_packet_sent(pn, ack_only, packet.len());
        self.transport.send(packet)?;
        if self.packets_allowed != u64::MAX {
            self.packets_allowed -= 1;
        }
        Ok(())
    }

    /// Produce the 8-octet payload for a PATH_CHALLENGE on this path.
    pub fn generate_challenge(&mut self) -> Result<[u8; 8]> {
        let state = self.challenge.get_or_insert_with(|| {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            ChallengeState { key, counter: 0 }
        });
        if state.counter == u8::MAX {
            return Err(Error::Internal("path challenge counter exhausted".into()));
        }
        let challenge = state.calculate(state.counter);
        state.counter += 1;
        Ok(challenge)
    }

    /// Check a PATH_RESPONSE against our outstanding challenges; a match
    /// verifies the path.
    pub fn verify_response(&mut self, response: &[u8; 8]) -> bool {
        let Some(state) = &self.challenge else { return false };
        let expected = state.calculate(response[0]);
        if expected.ct_eq(response).into() {
            self.set_verified();
            true
        } else {
            false
        }
    }

    pub fn set_verified(&mut self) {
        self.packets_allowed = u64::MAX;
    }

    pub fn is_verified(&self) -> bool {
        self.packets_allowed == u64::MAX
    }
}

impl core::fmt::Debug for Path {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Path")
            .field("local_cid", &self.local_cid)
            .field("remote_cid", &self.remote_cid)
            .field("remote_addr", &self.remote_addr)
            .field("verified", &self.is_verified())
            .finish()
    }
}
