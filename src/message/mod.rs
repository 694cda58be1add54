//! Framed binary envelope: length-prefixed header plus payload, with two
//! fixed-capacity scratch chunks a Message cycles between as it moves
//! through receive, coder, and send stages.

use crate::error::{Result, SiphonError};

/// Which backing chunk a view currently points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Primary,
    Secondary,
}

/// Tracks where the header and payload currently live, per the three
/// states the wire framing can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Header and payload both in the primary chunk (just received).
    S00,
    /// Header in primary, payload in secondary (coder wrote a new payload).
    S01,
    /// Header did not fit next to payload in primary; header moved to
    /// secondary.
    S10,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub session_id: String,
    pub seq: u64,
    pub src: u32,
    pub dst: u32,
    pub timestamp: i64,
    pub payload_size: u32,
    pub ack: bool,
    pub coding_parameters: u32,
}

impl Header {
    pub fn new(session_id: impl Into<String>) -> Self {
        Header {
            session_id: session_id.into(),
            seq: 0,
            src: 0,
            dst: 0,
            timestamp: 0,
            payload_size: 0,
            ack: false,
            coding_parameters: 0,
        }
    }

    /// Host-endian fixed-schema serialization. Cross-host byte order is
    /// not guaranteed; see the Open Questions on wire framing.
    pub fn serialize(&self) -> Vec<u8> {
        let session_bytes = self.session_id.as_bytes();
        let mut buf = Vec::with_capacity(4 + session_bytes.len() + 8 + 4 + 4 + 8 + 4 + 1 + 4);
        buf.extend_from_slice(&(session_bytes.len() as u32).to_ne_bytes());
        buf.extend_from_slice(session_bytes);
        buf.extend_from_slice(&self.seq.to_ne_bytes());
        buf.extend_from_slice(&self.src.to_ne_bytes());
        buf.extend_from_slice(&self.dst.to_ne_bytes());
        buf.extend_from_slice(&self.timestamp.to_ne_bytes());
        buf.extend_from_slice(&self.payload_size.to_ne_bytes());
        buf.push(self.ack as u8);
        buf.extend_from_slice(&self.coding_parameters.to_ne_bytes());
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = 0usize;
        let read = |cursor: &mut usize, n: usize| -> Result<&[u8]> {
            let slice = buf.get(*cursor..*cursor + n).ok_or_else(|| {
                SiphonError::ProtocolViolation("header truncated".into())
            })?;
            *cursor += n;
            Ok(slice)
        };

        let session_len = u32::from_ne_bytes(read(&mut cursor, 4)?.try_into().unwrap()) as usize;
        let session_id = String::from_utf8(read(&mut cursor, session_len)?.to_vec())
            .map_err(|e| SiphonError::ProtocolViolation(format!("session_id not utf8: {e}")))?;
        let seq = u64::from_ne_bytes(read(&mut cursor, 8)?.try_into().unwrap());
        let src = u32::from_ne_bytes(read(&mut cursor, 4)?.try_into().unwrap());
        let dst = u32::from_ne_bytes(read(&mut cursor, 4)?.try_into().unwrap());
        let timestamp = i64::from_ne_bytes(read(&mut cursor, 8)?.try_into().unwrap());
        let payload_size = u32::from_ne_bytes(read(&mut cursor, 4)?.try_into().unwrap());
        let ack = read(&mut cursor, 1)?[0] != 0;
        let coding_parameters = u32::from_ne_bytes(read(&mut cursor, 4)?.try_into().unwrap());

        Ok((
            Header {
                session_id,
                seq,
                src,
                dst,
                timestamp,
                payload_size,
                ack,
                coding_parameters,
            },
            cursor,
        ))
    }
}

/// The four-slice wire form produced by [`Message::to_buffer`]: a scatter
/// write of size prefix, header-size prefix, header bytes, and payload.
pub struct WireSlices {
    pub message_size: [u8; 4],
    pub header_size: [u8; 2],
    pub header_bytes: Vec<u8>,
    pub payload: Vec<u8>,
}

impl WireSlices {
    /// Flattens the four slices into one contiguous frame, for transports
    /// (UDP) that send the whole datagram atomically.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.message_size.len() + self.header_size.len() + self.header_bytes.len() + self.payload.len(),
        );
        out.extend_from_slice(&self.message_size);
        out.extend_from_slice(&self.header_size);
        out.extend_from_slice(&self.header_bytes);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// A Message carries exactly one payload view over one of two owned,
/// fixed-capacity chunks. Non-copyable (no `Clone` impl): a Message moves
/// through the pipeline by ownership transfer, mirroring a Minion always
/// being carried by at most one stop.
pub struct Message {
    header: Header,
    primary: Vec<u8>,
    secondary: Vec<u8>,
    payload_chunk: Chunk,
    payload_range: (usize, usize),
    state: BufferState,
    max_size: usize,
}

impl Message {
    pub fn new(max_size: usize) -> Self {
        Message {
            header: Header::new(""),
            primary: Vec::with_capacity(max_size),
            secondary: Vec::with_capacity(max_size),
            payload_chunk: Chunk::Primary,
            payload_range: (0, 0),
            state: BufferState::S00,
            max_size,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn payload(&self) -> &[u8] {
        let (start, end) = self.payload_range;
        match self.payload_chunk {
            Chunk::Primary => &self.primary[start..end],
            Chunk::Secondary => &self.secondary[start..end],
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Scratch buffer the receive loop fills with `header_size_bytes ++
    /// header_bytes ++ payload_bytes` (the size prefix is consumed by the
    /// caller separately for TCP, or present-but-informational for UDP).
    pub fn primary_mut(&mut self) -> &mut Vec<u8> {
        &mut self.primary
    }

    /// Parses the header out of the front of `primary` and points the
    /// payload view at the remaining trailing bytes. `include_size_prefix`
    /// is true when `primary` still has the leading `u32 message_size`
    /// that the caller hasn't stripped (UDP datagrams read whole).
    pub fn from_buffer(&mut self, include_size_prefix: bool) -> Result<()> {
        let mut offset = 0usize;
        if include_size_prefix {
            offset += 4;
        }
        let header_size = u16::from_ne_bytes(
            self.primary
                .get(offset..offset + 2)
                .ok_or_else(|| SiphonError::ProtocolViolation("missing header_size".into()))?
                .try_into()
                .unwrap(),
        ) as usize;
        offset += 2;
        let header_bytes = self
            .primary
            .get(offset..offset + header_size)
            .ok_or_else(|| SiphonError::ProtocolViolation("header truncated".into()))?;
        let (header, consumed) = Header::deserialize(header_bytes)?;
        if consumed != header_size {
            return Err(SiphonError::ProtocolViolation(
                "header_size did not match parsed header length".into(),
            ));
        }
        let payload_start = offset + header_size;
        let payload_end = payload_start + header.payload_size as usize;
        if payload_end > self.primary.len() {
            return Err(SiphonError::ProtocolViolation("payload truncated".into()));
        }
        self.header = header;
        self.payload_chunk = Chunk::Primary;
        self.payload_range = (payload_start, payload_end);
        self.state = BufferState::S00;
        Ok(())
    }

    /// Serializes the current header, choosing the chunk that places it
    /// next to the payload when there's room (S00/S01), or spilling it
    /// into the secondary chunk when the payload occupies the whole of
    /// the primary chunk (S10).
    pub fn to_buffer(&mut self) -> WireSlices {
        let header_bytes = self.header.serialize();
        let header_size = header_bytes.len() as u16;

        let header_fits_in_primary = self.payload_chunk != Chunk::Primary
            || self.payload_range.0 >= header_bytes.len();

        self.state = match (self.payload_chunk, header_fits_in_primary) {
            (Chunk::Primary, true) => BufferState::S00,
            (Chunk::Secondary, _) => BufferState::S01,
            (Chunk::Primary, false) => BufferState::S10,
        };

        self.header.payload_size = self.payload().len() as u32;
        let payload = self.payload().to_vec();
        let message_size = (header_size as u32) + self.header.payload_size + 2;

        WireSlices {
            message_size: message_size.to_ne_bytes(),
            header_size: header_size.to_ne_bytes(),
            header_bytes,
            payload,
        }
    }

    /// Hands back a mutable view into the secondary chunk for a coder to
    /// write a new payload into. The caller must follow with
    /// [`Message::reset_payload`] pointing into that same chunk.
    pub fn allocate_buffer(&mut self) -> &mut Vec<u8> {
        self.secondary.clear();
        &mut self.secondary
    }

    pub fn reset_payload(&mut self, chunk_is_secondary: bool, range: (usize, usize)) {
        self.payload_chunk = if chunk_is_secondary {
            Chunk::Secondary
        } else {
            Chunk::Primary
        };
        self.payload_range = range;
    }

    /// Resets the payload view back to the (cleared) secondary chunk and
    /// leaves the header in the primary chunk, readying the Message for
    /// reuse by the pool. Does not zero memory.
    pub fn recycle(&mut self) {
        self.secondary.clear();
        self.payload_chunk = Chunk::Secondary;
        self.payload_range = (0, 0);
        self.state = BufferState::S01;
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
