//! Protocol version constants and negotiation helpers.

use rand::Rng;

/// A 32-bit QUIC version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionNumber(pub u32);

/// Draft number implemented by this endpoint.
pub const QUIC_DRAFT: u32 = 11;

/// The version this endpoint speaks: draft-numbered low byte.
pub const QUIC_VERSION: VersionNumber = VersionNumber(0xff00_0000 | QUIC_DRAFT);

/// Version zero marks a version negotiation packet.
pub const VERSION_NEGOTIATION: VersionNumber = VersionNumber(0);

/// Grease values injected into advertised version lists so peers do not
/// ossify on the set we offer.
pub const GREASE_VERSION_1: VersionNumber = VersionNumber(0x1a1a_1a1a);
pub const GREASE_VERSION_2: VersionNumber = VersionNumber(0x2a2a_2a2a);

/// ALPN token matching the draft number.
pub const ALPN_TOKEN: &str = "hq-11";

impl VersionNumber {
    pub fn is_supported(self) -> bool {
        self == QUIC_VERSION
    }

    pub fn is_negotiation(self) -> bool {
        self == VERSION_NEGOTIATION
    }
}

impl core::fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// The list a server advertises in version negotiation, with a grease entry
/// at a random position.
pub fn advertised_versions() -> Vec<VersionNumber> {
    let mut versions = vec![QUIC_VERSION, GREASE_VERSION_1];
    if rand::thread_rng().gen::<bool>() {
        versions.swap(0, 1);
    }
    versions
}
