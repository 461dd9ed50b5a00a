//! Frame decoding.
//!
//! Frames are decoded from the decrypted packet payload. Stream and close
//! payloads are sliced out of the shared `Bytes` buffer rather than copied.

use super::*;
use crate::error::{Error, Result};
use crate::types::{ConnectionId, VarInt};
use bytes::Bytes;
use tinyvec::TinyVec;

/// Cursor over a decrypted payload.
struct Cursor<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a Bytes, pos: usize) -> Self {
        Self { buf, pos }
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or(Error::FrameFormat)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, consumed) = VarInt::decode(&self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(value)
    }

    fn slice(&mut self, len: usize) -> Result<Bytes> {
        if self.pos + len > self.buf.len() {
            return Err(Error::FrameFormat);
        }
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&slice);
        Ok(out)
    }
}

/// Decode one frame starting at `pos`, returning it with the number of
/// octets consumed.
pub fn decode_frame(payload: &Bytes, pos: usize) -> Result<(Frame, usize)> {
    let mut cur = Cursor::new(payload, pos);
    let ty = cur.u8()?;

    let frame = match ty {
        FRAME_TYPE_PADDING => Frame::Padding,
        FRAME_TYPE_RST_STREAM => {
            let stream_id = cur.varint()?;
            let error_code = cur.u16()?;
            let final_offset = cur.varint()?;
            Frame::RstStream { stream_id, error_code, final_offset }
        }
        FRAME_TYPE_CONNECTION_CLOSE => {
            let error_code = cur.u16()?;
            let reason_len = cur.varint()? as usize;
            let reason = cur.slice(reason_len)?;
            Frame::ConnectionClose { error_code, reason }
        }
        FRAME_TYPE_MAX_DATA => Frame::MaxData { maximum: cur.varint()? },
        FRAME_TYPE_MAX_STREAM_DATA => {
            let stream_id = cur.varint()?;
            let maximum = cur.varint()?;
            Frame::MaxStreamData { stream_id, maximum }
        }
        FRAME_TYPE_MAX_STREAM_ID => Frame::MaxStreamId { maximum: cur.varint()? },
        FRAME_TYPE_PING => Frame::Ping,
        FRAME_TYPE_BLOCKED => Frame::Blocked { offset: cur.varint()? },
        FRAME_TYPE_STREAM_BLOCKED => {
            let stream_id = cur.varint()?;
            let offset = cur.varint()?;
            Frame::StreamBlocked { stream_id, offset }
        }
        FRAME_TYPE_STREAM_ID_BLOCKED => Frame::StreamIdBlocked { stream_id: cur.varint()? },
        FRAME_TYPE_NEW_CONNECTION_ID => {
            let sequence = cur.varint()?;
            let cid_len = cur.u8()? as usize;
            let cid_bytes = cur.slice(cid_len)?;
            let connection_id =
                ConnectionId::new(cid_bytes).map_err(|_| Error::FrameFormat)?;
            let reset_token = cur.array()?;
            Frame::NewConnectionId { sequence, connection_id, reset_token }
        }
        FRAME_TYPE_STOP_SENDING => {
            let stream_id = cur.varint()?;
            let error_code = cur.u16()?;
            Frame::StopSending { stream_id, error_code }
        }
        FRAME_TYPE_ACK => {
            let largest_acked = cur.varint()?;
            let ack_delay = cur.varint()?;
            let block_count = cur.varint()?;
            let first_block = cur.varint()?;
            if first_block > largest_acked {
                return Err(Error::FrameFormat);
            }
            let mut blocks: TinyVec<[AckBlock; 8]> = TinyVec::new();
            for _ in 0..block_count {
                let gap = cur.varint()?;
                let length = cur.varint()?;
                blocks.push(AckBlock { gap, length });
            }
            Frame::Ack(AckFrame { largest_acked, ack_delay, first_block, blocks })
        }
        FRAME_TYPE_PATH_CHALLENGE => Frame::PathChallenge { data: cur.array()? },
        FRAME_TYPE_PATH_RESPONSE => Frame::PathResponse { data: cur.array()? },
        _ if ty & !0x07 == FRAME_TYPE_STREAM_BASE => {
            let stream_id = cur.varint()?;
            let offset = if ty & STREAM_BIT_OFF != 0 { cur.varint()? } else { 0 };
            let data = if ty & STREAM_BIT_LEN != 0 {
                let len = cur.varint()? as usize;
                cur.slice(len)?
            } else {
                // No length field: the frame extends to the end of the packet.
                cur.slice(payload.len() - cur.pos)?
            };
            let fin = ty & STREAM_BIT_FIN != 0;
            Frame::Stream { stream_id, offset, fin, data }
        }
        _ => return Err(Error::FrameFormat),
    };

    Ok((frame, cur.pos - pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let encoded = Bytes::from(frame.encode().unwrap());
        let (decoded, consumed) = decode_frame(&encoded, 0).unwrap();
        assert_eq!(consumed, encoded.len(), "{} length", frame.name());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_round_trip_every_kind() {
        round_trip(Frame::Padding);
        round_trip(Frame::Ping);
        round_trip(Frame::RstStream { stream_id: 5, error_code: 0xa, final_offset: 70_000 });
        round_trip(Frame::ConnectionClose {
            error_code: 0x1,
            reason: Bytes::from_static(b"goodbye"),
        });
        round_trip(Frame::MaxData { maximum: 1 << 40 });
        round_trip(Frame::MaxStreamData { stream_id: 4, maximum: 65536 });
        round_trip(Frame::MaxStreamId { maximum: 20 });
        round_trip(Frame::Blocked { offset: 12345 });
        round_trip(Frame::StreamBlocked { stream_id: 8, offset: 2048 });
        round_trip(Frame::StreamIdBlocked { stream_id: 12 });
        round_trip(Frame::NewConnectionId {
            sequence: 3,
            connection_id: ConnectionId::from_slice(&[9; 8]).unwrap(),
            reset_token: [0xab; 16],
        });
        round_trip(Frame::StopSending { stream_id: 9, error_code: 0 });
        round_trip(Frame::PathChallenge { data: [1, 2, 3, 4, 5, 6, 7, 8] });
        round_trip(Frame::PathResponse { data: [8, 7, 6, 5, 4, 3, 2, 1] });
        round_trip(Frame::Ack(AckFrame {
            largest_acked: 0x3fff_ffff,
            ack_delay: 330,
            first_block: 2,
            blocks: [AckBlock { gap: 0, length: 4 }, AckBlock { gap: 7, length: 0 }]
                .into_iter()
                .collect(),
        }));
    }

    #[test]
    fn test_round_trip_stream_variants() {
        // Zero offset omits the OFF field.
        round_trip(Frame::Stream {
            stream_id: 0,
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"hello"),
        });
        round_trip(Frame::Stream {
            stream_id: 4,
            offset: 9999,
            fin: true,
            data: Bytes::from_static(b""),
        });
        round_trip(Frame::Stream {
            stream_id: 1 << 50,
            offset: 1 << 45,
            fin: true,
            data: Bytes::from_static(b"x"),
        });
    }

    #[test]
    fn test_stream_without_length_runs_to_end() {
        let payload = Bytes::from_static(&[
            FRAME_TYPE_STREAM_BASE, // no OFF, no LEN, no FIN
            0x04,                   // stream id 4
            b'a', b'b', b'c',
        ]);
        let (frame, consumed) = decode_frame(&payload, 0).unwrap();
        assert_eq!(consumed, payload.len());
        match frame {
            Frame::Stream { stream_id, offset, fin, data } => {
                assert_eq!(stream_id, 4);
                assert_eq!(offset, 0);
                assert!(!fin);
                assert_eq!(&data[..], b"abc");
            }
            other => panic!("expected stream frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // Unknown frame type.
        let payload = Bytes::from_static(&[0xfe]);
        assert!(decode_frame(&payload, 0).is_err());

        // Truncated RST_STREAM.
        let payload = Bytes::from_static(&[FRAME_TYPE_RST_STREAM, 0x04, 0x00]);
        assert!(decode_frame(&payload, 0).is_err());

        // ACK whose first block underflows the largest.
        let payload = Bytes::from_static(&[FRAME_TYPE_ACK, 0x02, 0x00, 0x00, 0x05]);
        assert!(decode_frame(&payload, 0).is_err());

        // Empty payload.
        assert!(decode_frame(&Bytes::new(), 0).is_err());
    }

    #[test]
    fn test_decode_consumes_mid_buffer() {
        let mut buf = Frame::Ping.encode().unwrap();
        buf.extend(Frame::MaxData { maximum: 7 }.encode().unwrap());
        let payload = Bytes::from(buf);

        let (first, n) = decode_frame(&payload, 0).unwrap();
        assert_eq!(first, Frame::Ping);
        let (second, m) = decode_frame(&payload, n).unwrap();
        assert_eq!(second, Frame::MaxData { maximum: 7 });
        assert_eq!(n + m, payload.len());
    }
}
