//! Packet header encoding and decoding.
//!
//! Long headers carry both connection IDs, the version, a payload length and
//! a fixed 4-octet packet number. Short headers carry only the destination
//! CID (whose length each endpoint fixes out of band) and a truncated packet
//! number. Version negotiation packets are a long-header shell with version
//! zero.

use crate::error::{Error, Result};
use crate::types::{ConnectionId, VarInt};
use crate::version::{VersionNumber, VERSION_NEGOTIATION};
use rand::Rng;

/// Long-header form flag.
pub const LONG_HEADER_FLAG: u8 = 0x80;

/// Short-header fixed bit.
pub const SHORT_FIXED_BIT: u8 = 0x40;
/// Short-header spin bit (transmitted as zero).
pub const SHORT_SPIN_BIT: u8 = 0x20;
/// Short-header key phase bit.
pub const SHORT_KEY_PHASE_BIT: u8 = 0x10;
/// Short-header packet number length code mask.
pub const SHORT_PN_MASK: u8 = 0x03;

const LONG_TYPE_INITIAL: u8 = 0x7f;
const LONG_TYPE_RETRY: u8 = 0x7e;
const LONG_TYPE_HANDSHAKE: u8 = 0x7d;
const LONG_TYPE_ZERO_RTT: u8 = 0x7c;

/// The kinds of packet this endpoint can build or parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    Retry,
    Handshake,
    /// Reserved; never sent.
    ZeroRtt,
    /// Short-header application packet.
    Short,
    VersionNegotiation,
}

impl PacketType {
    pub fn is_long_header(self) -> bool {
        !matches!(self, PacketType::Short)
    }

    /// Packets protected under the application keys.
    pub fn is_protected(self) -> bool {
        matches!(self, PacketType::Short | PacketType::ZeroRtt)
    }

    fn long_type_code(self) -> Result<u8> {
        match self {
            PacketType::Initial => Ok(LONG_TYPE_INITIAL),
            PacketType::Retry => Ok(LONG_TYPE_RETRY),
            PacketType::Handshake => Ok(LONG_TYPE_HANDSHAKE),
            PacketType::ZeroRtt => Ok(LONG_TYPE_ZERO_RTT),
            _ => Err(Error::Internal("not a long header type".into())),
        }
    }

    fn from_long_type_code(code: u8) -> Result<Self> {
        match code {
            LONG_TYPE_INITIAL => Ok(PacketType::Initial),
            LONG_TYPE_RETRY => Ok(PacketType::Retry),
            LONG_TYPE_HANDSHAKE => Ok(PacketType::Handshake),
            LONG_TYPE_ZERO_RTT => Ok(PacketType::ZeroRtt),
            _ => Err(Error::InvalidPacket(format!("unknown long type {code:#x}"))),
        }
    }
}

/// A decoded (or to-be-encoded) packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    /// Wire version; zero for version negotiation, unused for short headers.
    pub version: VersionNumber,
    pub dest_cid: ConnectionId,
    /// Source CID; always empty on short headers.
    pub src_cid: ConnectionId,
    /// Long-header payload length field (payload + AEAD tag).
    pub payload_length: u64,
    /// Full packet number on long headers, truncated on short headers.
    pub packet_number: u64,
    /// Octets the packet number occupies on the wire.
    pub pn_length: usize,
    /// Short-header key phase bit.
    pub key_phase: bool,
}

impl PacketHeader {
    pub fn long(
        packet_type: PacketType,
        version: VersionNumber,
        dest_cid: ConnectionId,
        src_cid: ConnectionId,
        packet_number: u64,
        payload_length: u64,
    ) -> Self {
        Self {
            packet_type,
            version,
            dest_cid,
            src_cid,
            payload_length,
            packet_number,
            pn_length: 4,
            key_phase: false,
        }
    }

    pub fn short(dest_cid: ConnectionId, packet_number: u64, pn_length: usize) -> Self {
        Self {
            packet_type: PacketType::Short,
            version: VERSION_NEGOTIATION,
            dest_cid,
            src_cid: ConnectionId::empty(),
            payload_length: 0,
            packet_number,
            pn_length,
            key_phase: false,
        }
    }

    /// Serialize the header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(
            1 + 4 + 1 + self.dest_cid.len() + self.src_cid.len() + 8 + 4,
        );
        if self.packet_type.is_long_header() {
            let code = if self.packet_type == PacketType::VersionNegotiation {
                // The type octet of a version negotiation packet is random
                // apart from the form bit.
                rand::thread_rng().gen::<u8>() & !LONG_HEADER_FLAG
            } else {
                self.packet_type.long_type_code()?
            };
            out.push(LONG_HEADER_FLAG | code);
            out.extend_from_slice(&self.version.0.to_be_bytes());
            out.push(cid_len_nibble(&self.dest_cid)? << 4 | cid_len_nibble(&self.src_cid)?);
            out.extend_from_slice(self.dest_cid.as_bytes());
            out.extend_from_slice(self.src_cid.as_bytes());
            VarInt::encode(self.payload_length, &mut out)?;
            out.extend_from_slice(&(self.packet_number as u32).to_be_bytes());
        } else {
            let mut flags = SHORT_FIXED_BIT;
            if self.key_phase {
                flags |= SHORT_KEY_PHASE_BIT;
            }
            flags |= match self.pn_length {
                1 => 0,
                2 => 1,
                4 => 2,
                other => {
                    return Err(Error::Internal(format!("bad pn length {other}")))
                }
            };
            out.push(flags);
            out.extend_from_slice(self.dest_cid.as_bytes());
            match self.pn_length {
                1 => out.push(self.packet_number as u8),
                2 => out.extend_from_slice(&(self.packet_number as u16).to_be_bytes()),
                _ => out.extend_from_slice(&(self.packet_number as u32).to_be_bytes()),
            }
        }
        Ok(out)
    }

    /// Parse a header from the front of `buf`. Short headers need the
    /// statically configured CID length. Returns the header and its encoded
    /// length.
    pub fn decode(buf: &[u8], short_cid_len: usize) -> Result<(PacketHeader, usize)> {
        let first = *buf
            .first()
            .ok_or_else(|| Error::InvalidPacket("empty datagram".into()))?;

        if first & LONG_HEADER_FLAG != 0 {
            Self::decode_long(buf, first)
        } else {
            Self::decode_short(buf, first, short_cid_len)
        }
    }

    fn decode_long(buf: &[u8], first: u8) -> Result<(PacketHeader, usize)> {
        if buf.len() < 6 {
            return Err(Error::InvalidPacket("truncated long header".into()));
        }
        let version = VersionNumber(u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]));
        let dcil = cid_len_from_nibble(buf[5] >> 4);
        let scil = cid_len_from_nibble(buf[5] & 0x0f);
        let mut at = 6;

        let dest_cid = take_cid(buf, &mut at, dcil)?;
        let src_cid = take_cid(buf, &mut at, scil)?;

        let (payload_length, consumed) = VarInt::decode(
            buf.get(at..)
                .ok_or_else(|| Error::InvalidPacket("truncated long header".into()))?,
        )
        .map_err(|_| Error::InvalidPacket("bad payload length".into()))?;
        at += consumed;

        let pn_bytes = buf
            .get(at..at + 4)
            .ok_or_else(|| Error::InvalidPacket("truncated packet number".into()))?;
        let packet_number =
            u64::from(u32::from_be_bytes([pn_bytes[0], pn_bytes[1], pn_bytes[2], pn_bytes[3]]));
        at += 4;

        let packet_type = if version.is_negotiation() {
            PacketType::VersionNegotiation
        } else {
            PacketType::from_long_type_code(first & !LONG_HEADER_FLAG)?
        };

        Ok((
            PacketHeader {
                packet_type,
                version,
                dest_cid,
                src_cid,
                payload_length,
                packet_number,
                pn_length: 4,
                key_phase: false,
            },
            at,
        ))
    }

    fn decode_short(buf: &[u8], first: u8, short_cid_len: usize) -> Result<(PacketHeader, usize)> {
        let mut at = 1;
        let dest_cid = take_cid(buf, &mut at, short_cid_len)?;
        let pn_length = match first & SHORT_PN_MASK {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => return Err(Error::InvalidPacket("bad pn length code".into())),
        };
        let pn_bytes = buf
            .get(at..at + pn_length)
            .ok_or_else(|| Error::InvalidPacket("truncated packet number".into()))?;
        let mut packet_number = 0u64;
        for b in pn_bytes {
            packet_number = (packet_number << 8) | u64::from(*b);
        }
        at += pn_length;

        Ok((
            PacketHeader {
                packet_type: PacketType::Short,
                version: VERSION_NEGOTIATION,
                dest_cid,
                src_cid: ConnectionId::empty(),
                payload_length: 0,
                packet_number,
                pn_length,
                key_phase: first & SHORT_KEY_PHASE_BIT != 0,
            },
            at,
        ))
    }
}

/// Build a complete version negotiation datagram.
pub fn encode_version_negotiation(
    dest_cid: ConnectionId,
    src_cid: ConnectionId,
    versions: &[VersionNumber],
) -> Result<Vec<u8>> {
    let payload: Vec<u8> = versions
        .iter()
        .flat_map(|v| v.0.to_be_bytes())
        .collect();
    let hdr = PacketHeader::long(
        PacketType::VersionNegotiation,
        VERSION_NEGOTIATION,
        dest_cid,
        src_cid,
        0,
        payload.len() as u64,
    );
    let mut out = hdr.encode()?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Parse the version list out of a version negotiation payload.
pub fn decode_version_list(payload: &[u8]) -> Result<Vec<VersionNumber>> {
    if payload.len() % 4 != 0 {
        return Err(Error::InvalidPacket("ragged version list".into()));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| VersionNumber(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
        .collect())
}

fn cid_len_nibble(cid: &ConnectionId) -> Result<u8> {
    match cid.len() {
        0 => Ok(0),
        len @ 4..=18 => Ok((len - 3) as u8),
        len => Err(Error::Internal(format!("unencodable cid length {len}"))),
    }
}

fn cid_len_from_nibble(nibble: u8) -> usize {
    match nibble {
        0 => 0,
        n => n as usize + 3,
    }
}

fn take_cid(buf: &[u8], at: &mut usize, len: usize) -> Result<ConnectionId> {
    let slice = buf
        .get(*at..*at + len)
        .ok_or_else(|| Error::InvalidPacket("truncated connection id".into()))?;
    *at += len;
    ConnectionId::from_slice(slice).map_err(|_| Error::InvalidPacket("bad cid length".into()))
}
