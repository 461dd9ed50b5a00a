//! Packet protection.
//!
//! One [`CryptoState`] per direction per key phase. Handshake-phase
//! ("cleartext") keys are derived from the client-chosen destination
//! connection ID with labeled HKDF; application keys come from TLS exporter
//! secrets. The suite is AES-128-GCM with SHA-256 derivation: 16-byte key,
//! 12-byte IV, 16-byte tag.

use crate::error::{Error, Result};
use crate::types::ConnectionId;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Salt mixed into the handshake-phase key derivation.
pub const HANDSHAKE_SALT: [u8; 20] = [
    0x9c, 0x10, 0x8f, 0x98, 0x52, 0x0a, 0x5c, 0x5c, 0x32, 0x96, 0x8e, 0x95, 0x0e, 0x8a, 0x2c,
    0x5f, 0xe0, 0x6d, 0x6c, 0x38,
];

/// The four secret labels an endpoint derives keys under.
pub const CLIENT_CLEARTEXT_LABEL: &str = "client-cleartext";
pub const SERVER_CLEARTEXT_LABEL: &str = "server-cleartext";
pub const CLIENT_APP_LABEL: &str = "client-app";
pub const SERVER_APP_LABEL: &str = "server-app";

const KEY_LENGTH: usize = 16;
const IV_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyMaterial {
    key: [u8; KEY_LENGTH],
    iv: [u8; IV_LENGTH],
}

/// AEAD state for one direction of one key phase.
pub struct CryptoState {
    label: &'static str,
    material: KeyMaterial,
    aead: Aes128Gcm,
}

impl CryptoState {
    /// Derive handshake-phase keys from the client's original destination
    /// connection ID.
    pub fn cleartext(label: &'static str, cid: &ConnectionId) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(&HANDSHAKE_SALT), cid.as_bytes());
        let mut secret = [0u8; 32];
        hk.expand(label.as_bytes(), &mut secret)
            .map_err(|_| Error::Internal("hkdf expand".into()))?;
        let state = Self::from_secret(label, &secret);
        secret.zeroize();
        state
    }

    /// Build keys from a secret (a TLS exporter secret for the application
    /// phase).
    pub fn from_secret(label: &'static str, secret: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut material = KeyMaterial { key: [0; KEY_LENGTH], iv: [0; IV_LENGTH] };
        hk.expand(b"key", &mut material.key)
            .map_err(|_| Error::Internal("hkdf expand key".into()))?;
        hk.expand(b"iv", &mut material.iv)
            .map_err(|_| Error::Internal("hkdf expand iv".into()))?;
        let aead = Aes128Gcm::new_from_slice(&material.key)
            .map_err(|_| Error::Internal("aead init".into()))?;
        Ok(Self { label, material, aead })
    }

    /// AEAD expansion added to every sealed payload.
    pub fn overhead(&self) -> usize {
        TAG_LENGTH
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Nonce for packet number `pn`: the IV XOR the big-endian packet
    /// number, left-padded to the IV width.
    fn nonce(&self, pn: u64) -> [u8; IV_LENGTH] {
        let mut nonce = self.material.iv;
        for (i, b) in pn.to_be_bytes().iter().enumerate() {
            nonce[IV_LENGTH - 8 + i] ^= b;
        }
        nonce
    }

    /// Protect `plaintext` under packet number `pn` with the encoded header
    /// as additional data.
    pub fn seal(&self, pn: u64, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(pn);
        self.aead
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: plaintext, aad: header },
            )
            .map_err(|_| Error::Internal("aead seal".into()))
    }

    /// Verify and decrypt `ciphertext`. Failure means the packet was not
    /// sealed under these keys (or was tampered with) and must be dropped.
    pub fn open(&self, pn: u64, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(pn);
        self.aead
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: ciphertext, aad: header },
            )
            .map_err(|_| Error::InvalidPacket(format!("aead open failed ({})", self.label)))
    }
}

impl core::fmt::Debug for CryptoState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("CryptoState").field("label", &self.label).finish()
    }
}
