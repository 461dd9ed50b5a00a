//! Indexed collections of streams, one per type quadrant.
//!
//! Each set owns the streams of one `StreamType`, hands out the next id for
//! local creation, and enforces the id ceiling for remote creation. Stream
//! ids within a quadrant are spaced four apart.

use super::{stream_type_from_id, Stream, StreamType};
use crate::error::{Error, Result};
use crate::types::Role;

/// The streams of one quadrant.
#[derive(Debug)]
pub struct StreamSet {
    kind: StreamType,
    role: Role,
    streams: Vec<Stream>,
    /// How many streams this quadrant may hold. For local quadrants the
    /// peer grants this; for remote quadrants we do.
    max_streams: u64,
}

impl StreamSet {
    pub fn new(kind: StreamType, role: Role, max_streams: u64) -> Self {
        Self { kind, role, streams: Vec::new(), max_streams }
    }

    /// The two low id bits shared by every stream in this quadrant.
    fn base_id(&self) -> u64 {
        let initiator = match self.kind {
            StreamType::BidiLocal | StreamType::UniLocal => self.role,
            StreamType::BidiRemote | StreamType::UniRemote => self.role.peer(),
        };
        let initiator_bit = match initiator {
            Role::Client => 0,
            Role::Server => 1,
        };
        let uni_bit = match self.kind {
            StreamType::UniLocal | StreamType::UniRemote => 2,
            _ => 0,
        };
        initiator_bit | uni_bit
    }

    /// Stream id of slot `index`.
    pub fn id_of_index(&self, index: u64) -> u64 {
        index * 4 + self.base_id()
    }

    fn index_of_id(&self, id: u64) -> Result<u64> {
        if id & 0x3 != self.base_id() || stream_type_from_id(id, self.role) != self.kind {
            return Err(Error::Internal(format!("stream {id} not in {:?}", self.kind)));
        }
        Ok(id >> 2)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        let index = self.index_of_id(id).ok()?;
        self.streams.get_mut(index as usize)
    }

    /// Place an externally-built stream into its slot. Only used for the
    /// handshake carrier, which exists before any peer parameters do.
    pub fn adopt(&mut self, stream: Stream) {
        debug_assert_eq!(stream.id(), self.next_id());
        self.streams.push(stream);
    }

    /// Install the stream-count ceiling learned from the peer's transport
    /// parameters.
    pub fn set_max_streams(&mut self, n: u64) {
        if n > self.max_streams {
            self.max_streams = n;
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.iter_mut()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.streams.iter().map(|s| s.id()).collect()
    }

    /// Id the next local create would claim.
    pub fn next_id(&self) -> u64 {
        self.id_of_index(self.streams.len() as u64)
    }

    /// Create the next local stream if the peer's id credit allows it.
    pub fn create(&mut self, make: impl FnOnce(u64) -> Stream) -> Option<&mut Stream> {
        if (self.streams.len() as u64) >= self.max_streams {
            return None;
        }
        let id = self.next_id();
        self.streams.push(make(id));
        self.streams.last_mut()
    }

    /// Fetch `id`, creating it and every lower-numbered stream of the
    /// quadrant that does not exist yet (the peer may open ids out of
    /// order). `on_new` fires once per stream created.
    pub fn ensure(
        &mut self,
        id: u64,
        mut make: impl FnMut(u64) -> Stream,
        mut on_new: impl FnMut(u64),
    ) -> Result<&mut Stream> {
        let index = self.index_of_id(id)?;
        if index >= self.max_streams {
            return Err(Error::ProtocolViolation);
        }
        while (self.streams.len() as u64) <= index {
            let new_id = self.next_id();
            self.streams.push(make(new_id));
            on_new(new_id);
        }
        Ok(&mut self.streams[index as usize])
    }

    /// Raise the ceiling from a MAX_STREAM_ID frame naming the highest
    /// usable id.
    pub fn update_max(&mut self, max_id: u64) -> Result<()> {
        let index = self.index_of_id(max_id)?;
        if index + 1 > self.max_streams {
            self.max_streams = index + 1;
        }
        Ok(())
    }

    /// Grant the peer `n` more streams, returning the highest id now
    /// usable (the value a MAX_STREAM_ID frame advertises).
    pub fn credit(&mut self, n: u64) -> u64 {
        self.max_streams += n;
        self.id_of_index(self.max_streams - 1)
    }

    /// Highest id currently allowed in this quadrant.
    pub fn max_id(&self) -> u64 {
        self.id_of_index(self.max_streams.saturating_sub(1))
    }
}
