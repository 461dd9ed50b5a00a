//! The TLS handshake contract.
//!
//! The endpoint treats TLS as a byte-in / byte-out oracle riding stream 0:
//! feed it what the peer sent, transmit what it returns, and ask it for
//! exporter secrets once it reports completion. The oracle also carries the
//! opaque transport-parameters extension in both directions.
//!
//! [`oracle`] contains the deterministic engine the test suite (and any
//! embedding that does not bring a real TLS stack) uses.

use crate::error::{Error, Result};
use crate::types::{Role, RESET_TOKEN_LENGTH};
use crate::types::{CONCURRENT_STREAMS_BIDI, CONCURRENT_STREAMS_UNI, INITIAL_MAX_DATA,
    INITIAL_MAX_STREAM_DATA};

// ============================================================================
// Transport parameters
// ============================================================================

/// Values exchanged inside the TLS transport-parameters extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub initial_max_stream_data: u64,
    pub initial_max_data: u64,
    /// Highest stream count the peer may open, per direction.
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
    pub idle_timeout_secs: u16,
    /// Server only: the token its demultiplexer will use in stateless
    /// resets for this connection.
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_LENGTH]>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            initial_max_stream_data: INITIAL_MAX_STREAM_DATA,
            initial_max_data: INITIAL_MAX_DATA,
            max_streams_bidi: CONCURRENT_STREAMS_BIDI,
            max_streams_uni: CONCURRENT_STREAMS_UNI,
            idle_timeout_secs: 5,
            stateless_reset_token: None,
        }
    }
}

const TP_TAG_MAX_STREAM_DATA: u8 = 0x00;
const TP_TAG_MAX_DATA: u8 = 0x01;
const TP_TAG_MAX_STREAMS_BIDI: u8 = 0x02;
const TP_TAG_MAX_STREAMS_UNI: u8 = 0x03;
const TP_TAG_IDLE_TIMEOUT: u8 = 0x04;
const TP_TAG_RESET_TOKEN: u8 = 0x05;

impl TransportParameters {
    /// Encode as the flat tag/length/value list carried in the extension.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        let mut put = |tag: u8, value: &[u8]| {
            out.push(tag);
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        };
        put(TP_TAG_MAX_STREAM_DATA, &self.initial_max_stream_data.to_be_bytes());
        put(TP_TAG_MAX_DATA, &self.initial_max_data.to_be_bytes());
        put(TP_TAG_MAX_STREAMS_BIDI, &self.max_streams_bidi.to_be_bytes());
        put(TP_TAG_MAX_STREAMS_UNI, &self.max_streams_uni.to_be_bytes());
        put(TP_TAG_IDLE_TIMEOUT, &self.idle_timeout_secs.to_be_bytes());
        if let Some(token) = &self.stateless_reset_token {
            put(TP_TAG_RESET_TOKEN, token);
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let mut params = TransportParameters::default();
        while !buf.is_empty() {
            if buf.len() < 2 {
                return Err(Error::NonFatal("truncated transport parameter".into()));
            }
            let tag = buf[0];
            let len = buf[1] as usize;
            let value = buf
                .get(2..2 + len)
                .ok_or_else(|| Error::NonFatal("truncated transport parameter".into()))?;
            match tag {
                TP_TAG_MAX_STREAM_DATA => params.initial_max_stream_data = be_u64(value)?,
                TP_TAG_MAX_DATA => params.initial_max_data = be_u64(value)?,
                TP_TAG_MAX_STREAMS_BIDI => params.max_streams_bidi = be_u64(value)?,
                TP_TAG_MAX_STREAMS_UNI => params.max_streams_uni = be_u64(value)?,
                TP_TAG_IDLE_TIMEOUT => {
                    let v: [u8; 2] = value
                        .try_into()
                        .map_err(|_| Error::NonFatal("bad idle timeout".into()))?;
                    params.idle_timeout_secs = u16::from_be_bytes(v);
                }
                TP_TAG_RESET_TOKEN => {
                    let v: [u8; RESET_TOKEN_LENGTH] = value
                        .try_into()
                        .map_err(|_| Error::NonFatal("bad reset token".into()))?;
                    params.stateless_reset_token = Some(v);
                }
                // Unknown parameters are ignored for extensibility.
                _ => {}
            }
            buf = &buf[2 + len..];
        }
        Ok(params)
    }
}

fn be_u64(value: &[u8]) -> Result<u64> {
    let v: [u8; 8] = value
        .try_into()
        .map_err(|_| Error::NonFatal("bad transport parameter width".into()))?;
    Ok(u64::from_be_bytes(v))
}

// ============================================================================
// Handshake engine contract
// ============================================================================

/// Byte-in / byte-out handshake oracle.
///
/// The connection feeds every octet arriving on stream 0 (or inside Initial
/// and Retry packets) through `drive` and transmits whatever comes back.
pub trait HandshakeEngine {
    /// Process peer handshake bytes and return bytes to send. The client's
    /// first call passes an empty input to produce its first flight.
    fn drive(&mut self, input: &[u8]) -> Result<Vec<u8>>;

    /// True once the handshake has completed on this side.
    fn is_finished(&self) -> bool;

    /// Server only: the output of the last `drive` call is a stateless
    /// retry and no connection state should be committed for the client.
    fn wants_retry(&self) -> bool;

    /// Exporter secret for one of the application labels
    /// (`crypto::CLIENT_APP_LABEL` / `crypto::SERVER_APP_LABEL`).
    /// Only valid once finished.
    fn export_secret(&self, label: &str) -> Result<Vec<u8>>;

    /// Install the transport parameters this endpoint advertises.
    fn set_local_parameters(&mut self, params: TransportParameters);

    /// The peer's transport parameters, once its flight carried them.
    fn peer_parameters(&self) -> Option<TransportParameters>;

    /// Post-handshake handshake data (session tickets). Consumed, never
    /// surfaced to the application.
    fn read_post_handshake(&mut self, input: &[u8]) -> Result<()>;
}

/// Builds a handshake engine per connection.
pub trait HandshakeFactory {
    fn make(&self, role: Role) -> Box<dyn HandshakeEngine>;
}

// ============================================================================
// Deterministic oracle
// ============================================================================

pub mod oracle {
    //! A scripted handshake engine.
    //!
    //! Three flights: client hello (carrying the client's transport
    //! parameters and, after a retry, the echoed cookie), server hello
    //! (server parameters), client finished. Exporter secrets are derived
    //! from the shared message transcript, so both sides agree without any
    //! real key exchange. With `force_retry` the server answers the first
    //! hello with a retry carrying an 8-byte cookie and only proceeds once
    //! the hello echoes it.

    use super::*;
    use hkdf::Hkdf;
    use rand::RngCore;
    use sha2::Sha256;

    const MSG_CLIENT_HELLO: u8 = 0x01;
    const MSG_SERVER_HELLO: u8 = 0x02;
    const MSG_RETRY: u8 = 0x03;
    const MSG_FINISHED: u8 = 0x04;

    const COOKIE_LENGTH: usize = 8;

    /// Shared configuration for a client/server oracle pair.
    #[derive(Debug, Clone, Default)]
    pub struct OracleConfig {
        /// Server answers the first client hello with a stateless retry.
        pub force_retry: bool,
    }

    /// Factory handing out [`OracleEngine`] instances.
    pub struct OracleFactory {
        config: OracleConfig,
    }

    impl OracleFactory {
        pub fn new(config: OracleConfig) -> Self {
            Self { config }
        }
    }

    impl HandshakeFactory for OracleFactory {
        fn make(&self, role: Role) -> Box<dyn HandshakeEngine> {
            Box::new(OracleEngine::new(role, self.config.clone()))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Start,
        HelloSent,
        Finished,
    }

    /// The deterministic engine itself.
    pub struct OracleEngine {
        role: Role,
        config: OracleConfig,
        phase: Phase,
        local_params: TransportParameters,
        peer_params: Option<TransportParameters>,
        /// Every message this side produced or consumed, in order. Both
        /// sides accumulate the identical sequence, which makes the
        /// transcript a usable exporter base.
        transcript: Vec<u8>,
        /// Server: the cookie demanded from retried clients.
        cookie: [u8; COOKIE_LENGTH],
        /// Client: cookie learned from a retry.
        echo_cookie: Option<[u8; COOKIE_LENGTH]>,
        wants_retry: bool,
        /// Unconsumed partial message bytes.
        pending: Vec<u8>,
    }

    impl OracleEngine {
        pub fn new(role: Role, config: OracleConfig) -> Self {
            let mut cookie = [0u8; COOKIE_LENGTH];
            rand::thread_rng().fill_bytes(&mut cookie);
            Self {
                role,
                config,
                phase: Phase::Start,
                local_params: TransportParameters::default(),
                peer_params: None,
                transcript: Vec::new(),
                cookie,
                echo_cookie: None,
                wants_retry: false,
                pending: Vec::new(),
            }
        }

        fn frame(&mut self, msg_type: u8, body: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(3 + body.len());
            out.push(msg_type);
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
            out.extend_from_slice(body);
            self.transcript.extend_from_slice(&out);
            out
        }

        fn client_hello(&mut self) -> Vec<u8> {
            let mut body = Vec::new();
            match self.echo_cookie {
                Some(cookie) => {
                    body.push(COOKIE_LENGTH as u8);
                    body.extend_from_slice(&cookie);
                }
                None => body.push(0),
            }
            body.extend_from_slice(&self.local_params.encode());
            self.frame(MSG_CLIENT_HELLO, &body)
        }

        fn on_client_hello(&mut self, body: &[u8]) -> Result<Vec<u8>> {
            let cookie_len = *body.first().ok_or(Error::ProtocolViolation)? as usize;
            let cookie = body.get(1..1 + cookie_len).ok_or(Error::ProtocolViolation)?;
            let params = body.get(1 + cookie_len..).ok_or(Error::ProtocolViolation)?;

            if self.config.force_retry && cookie != self.cookie {
                self.wants_retry = true;
                let cookie = self.cookie;
                return Ok(self.frame(MSG_RETRY, &cookie));
            }

            self.peer_params = Some(TransportParameters::decode(params)?);
            self.phase = Phase::HelloSent;
            let body = self.local_params.encode();
            Ok(self.frame(MSG_SERVER_HELLO, &body))
        }

        fn on_server_hello(&mut self, body: &[u8]) -> Result<Vec<u8>> {
            self.peer_params = Some(TransportParameters::decode(body)?);
            self.phase = Phase::Finished;
            Ok(self.frame(MSG_FINISHED, &[]))
        }
    }

    impl HandshakeEngine for OracleEngine {
        fn drive(&mut self, input: &[u8]) -> Result<Vec<u8>> {
            self.wants_retry = false;
            self.pending.extend_from_slice(input);

            let mut output = Vec::new();

            if self.role.is_client() && self.phase == Phase::Start && self.pending.is_empty() {
                output.extend(self.client_hello());
                self.phase = Phase::HelloSent;
                return Ok(output);
            }

            // Consume every complete message buffered so far.
            while self.pending.len() >= 3 {
                let msg_type = self.pending[0];
                let len = u16::from_be_bytes([self.pending[1], self.pending[2]]) as usize;
                if self.pending.len() < 3 + len {
                    break;
                }
                let message: Vec<u8> = self.pending.drain(..3 + len).collect();
                self.transcript.extend_from_slice(&message);
                let body = &message[3..];

                match (self.role, msg_type) {
                    (Role::Server, MSG_CLIENT_HELLO) => {
                        output.extend(self.on_client_hello(body)?);
                    }
                    (Role::Server, MSG_FINISHED) => {
                        if self.phase != Phase::HelloSent {
                            return Err(Error::ProtocolViolation);
                        }
                        self.phase = Phase::Finished;
                    }
                    (Role::Client, MSG_RETRY) => {
                        let cookie: [u8; COOKIE_LENGTH] =
                            body.try_into().map_err(|_| Error::ProtocolViolation)?;
                        self.echo_cookie = Some(cookie);
                        output.extend(self.client_hello());
                    }
                    (Role::Client, MSG_SERVER_HELLO) => {
                        output.extend(self.on_server_hello(body)?);
                    }
                    _ => return Err(Error::ProtocolViolation),
                }
            }

            Ok(output)
        }

        fn is_finished(&self) -> bool {
            self.phase == Phase::Finished
        }

        fn wants_retry(&self) -> bool {
            self.wants_retry
        }

        fn export_secret(&self, label: &str) -> Result<Vec<u8>> {
            if !self.is_finished() {
                return Err(Error::Internal("exporter before handshake completion".into()));
            }
            let hk = Hkdf::<Sha256>::new(None, &self.transcript);
            let mut secret = vec![0u8; 32];
            hk.expand(label.as_bytes(), &mut secret)
                .map_err(|_| Error::Internal("exporter expand".into()))?;
            Ok(secret)
        }

        fn set_local_parameters(&mut self, params: TransportParameters) {
            self.local_params = params;
        }

        fn peer_parameters(&self) -> Option<TransportParameters> {
            self.peer_params.clone()
        }

        fn read_post_handshake(&mut self, _input: &[u8]) -> Result<()> {
            // Session tickets are accepted and dropped.
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::oracle::{OracleConfig, OracleEngine};
    use super::*;
    use crate::crypto::{CLIENT_APP_LABEL, SERVER_APP_LABEL};

    #[test]
    fn test_transport_parameters_round_trip() {
        let params = TransportParameters {
            initial_max_stream_data: 2048,
            initial_max_data: 1 << 20,
            max_streams_bidi: 7,
            max_streams_uni: 3,
            idle_timeout_secs: 30,
            stateless_reset_token: Some([0x5a; 16]),
        };
        let decoded = TransportParameters::decode(&params.encode()).unwrap();
        assert_eq!(decoded, params);

        let no_token = TransportParameters::default();
        assert_eq!(TransportParameters::decode(&no_token.encode()).unwrap(), no_token);
    }

    fn run_handshake(
        client: &mut OracleEngine,
        server: &mut OracleEngine,
    ) -> (Vec<u8>, Vec<u8>) {
        let ch = client.drive(&[]).unwrap();
        let sh = server.drive(&ch).unwrap();
        assert!(!server.wants_retry());
        let fin = client.drive(&sh).unwrap();
        assert!(client.is_finished());
        let done = server.drive(&fin).unwrap();
        assert!(done.is_empty());
        assert!(server.is_finished());
        (ch, sh)
    }

    #[test]
    fn test_oracle_handshake_completes_and_secrets_agree() {
        let mut client = OracleEngine::new(Role::Client, OracleConfig::default());
        let mut server = OracleEngine::new(Role::Server, OracleConfig::default());
        let mut server_params = TransportParameters::default();
        server_params.stateless_reset_token = Some([9; 16]);
        server.set_local_parameters(server_params.clone());

        run_handshake(&mut client, &mut server);

        assert_eq!(client.peer_parameters().unwrap(), server_params);
        assert!(server.peer_parameters().is_some());
        for label in [CLIENT_APP_LABEL, SERVER_APP_LABEL] {
            assert_eq!(
                client.export_secret(label).unwrap(),
                server.export_secret(label).unwrap(),
            );
        }
        assert_ne!(
            client.export_secret(CLIENT_APP_LABEL).unwrap(),
            client.export_secret(SERVER_APP_LABEL).unwrap(),
        );
    }

    #[test]
    fn test_oracle_forced_retry() {
        let config = OracleConfig { force_retry: true };
        let mut client = OracleEngine::new(Role::Client, config.clone());
        let mut server = OracleEngine::new(Role::Server, config);

        let ch1 = client.drive(&[]).unwrap();
        let retry = server.drive(&ch1).unwrap();
        assert!(server.wants_retry());
        assert!(!server.is_finished());

        // Client folds the cookie into a fresh hello.
        let ch2 = client.drive(&retry).unwrap();
        assert_ne!(ch1, ch2);
        let sh = server.drive(&ch2).unwrap();
        assert!(!server.wants_retry());
        let fin = client.drive(&sh).unwrap();
        server.drive(&fin).unwrap();
        assert!(client.is_finished() && server.is_finished());
        assert_eq!(
            client.export_secret(CLIENT_APP_LABEL).unwrap(),
            server.export_secret(CLIENT_APP_LABEL).unwrap(),
        );
    }

    #[test]
    fn test_oracle_handles_fragmented_input() {
        let mut client = OracleEngine::new(Role::Client, OracleConfig::default());
        let mut server = OracleEngine::new(Role::Server, OracleConfig::default());

        let ch = client.drive(&[]).unwrap();
        // Deliver the hello one byte at a time; output appears only once
        // the message completes.
        let mut sh = Vec::new();
        for b in &ch {
            sh = server.drive(&[*b]).unwrap();
        }
        assert!(!sh.is_empty());
        let fin = client.drive(&sh).unwrap();
        server.drive(&fin).unwrap();
        assert!(server.is_finished());
    }

    #[test]
    fn test_exporter_refused_before_completion() {
        let client = OracleEngine::new(Role::Client, OracleConfig::default());
        assert!(client.export_secret(CLIENT_APP_LABEL).is_err());
    }
}
