//! Binary shard format: a fixed header followed by variable-length records.
//!
//! Header (16 bytes, little-endian):
//! `[magic: 4][version: u16][dimension: u16][live_count: u64]`
//!
//! Record (little-endian):
//! `[id_len: u16][flags: u16][id: id_len bytes][vector: f32 * dimension]`
//!
//! A record's length is fully determined by its own header and the shard
//! dimension, so a linear scan from `HEADER_LEN` walks every record.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"MSHD";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 16;
/// Byte position of the live-record count inside the header.
pub const LIVE_COUNT_OFFSET: u64 = 8;
pub const RECORD_HEADER_LEN: usize = 4;
pub const FLAG_TOMBSTONE: u16 = 0x0001;
const RESERVED_FLAGS: u16 = !FLAG_TOMBSTONE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("truncated {what} at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        offset: u64,
        needed: usize,
        available: usize,
    },
    #[error("reserved flag bits set on record at offset {offset}: {flags:#06x}")]
    ReservedFlags { offset: u64, flags: u16 },
    #[error("identifier at offset {0} is not valid UTF-8")]
    InvalidUtf8(u64),
    #[error("identifier is {0} bytes, longer than the format allows")]
    IdTooLong(usize),
    #[error("dimension {0} does not fit the format")]
    DimensionTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    pub dimension: u16,
    pub live_count: u64,
}

impl ShardHeader {
    pub fn new(dimension: usize) -> Result<Self, CodecError> {
        let dimension =
            u16::try_from(dimension).map_err(|_| CodecError::DimensionTooLarge(dimension))?;
        Ok(Self {
            dimension,
            live_count: 0,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u16_le(self.dimension);
        buf.put_u64_le(self.live_count);
        out
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                what: "shard header",
                offset: 0,
                needed: HEADER_LEN,
                available: data.len(),
            });
        }

        let mut magic = [0u8; 4];
        data.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let version = data.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        Ok(Self {
            dimension: data.get_u16_le(),
            live_count: data.get_u64_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub id_len: u16,
    pub flags: u16,
}

impl RecordHeader {
    pub fn is_tombstoned(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    pub fn tombstoned(self) -> Self {
        Self {
            flags: self.flags | FLAG_TOMBSTONE,
            ..self
        }
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut out = [0u8; RECORD_HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u16_le(self.id_len);
        buf.put_u16_le(self.flags);
        out
    }

    pub fn decode(mut data: &[u8], offset: u64) -> Result<Self, CodecError> {
        if data.len() < RECORD_HEADER_LEN {
            return Err(CodecError::Truncated {
                what: "record header",
                offset,
                needed: RECORD_HEADER_LEN,
                available: data.len(),
            });
        }
        let id_len = data.get_u16_le();
        let flags = data.get_u16_le();
        if flags & RESERVED_FLAGS != 0 {
            return Err(CodecError::ReservedFlags { offset, flags });
        }
        Ok(Self { id_len, flags })
    }
}

/// Total on-disk length of a record.
pub fn record_len(id_len: usize, dimension: usize) -> usize {
    RECORD_HEADER_LEN + id_len + dimension * 4
}

/// Encode a live record. The caller has already checked the vector length.
pub fn encode_record(id: &str, vector: &[f32]) -> Result<BytesMut, CodecError> {
    let id_len = u16::try_from(id.len()).map_err(|_| CodecError::IdTooLong(id.len()))?;
    let mut buf = BytesMut::with_capacity(record_len(id.len(), vector.len()));
    buf.put_slice(&RecordHeader { id_len, flags: 0 }.encode());
    buf.put_slice(id.as_bytes());
    put_vector(&mut buf, vector);
    Ok(buf)
}

pub fn put_vector(buf: &mut impl BufMut, vector: &[f32]) {
    for &v in vector {
        buf.put_f32_le(v);
    }
}

pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Borrowed view of one record inside a shard buffer.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub offset: u64,
    pub header: RecordHeader,
    pub id: &'a str,
    pub vector_bytes: &'a [u8],
}

impl RecordView<'_> {
    pub fn is_live(&self) -> bool {
        !self.header.is_tombstoned()
    }

    pub fn vector(&self) -> Vec<f32> {
        decode_vector(self.vector_bytes)
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.id.len() + self.vector_bytes.len()
    }
}

/// Decode the record starting at `offset` of a whole shard buffer.
pub fn decode_record_at(
    data: &[u8],
    offset: u64,
    dimension: usize,
) -> Result<RecordView<'_>, CodecError> {
    let start = offset as usize;
    let rest = data.get(start..).unwrap_or_default();
    let header = RecordHeader::decode(rest, offset)?;

    let id_len = header.id_len as usize;
    let body_len = id_len + dimension * 4;
    let body = &rest[RECORD_HEADER_LEN..];
    if body.len() < body_len {
        return Err(CodecError::Truncated {
            what: "record body",
            offset,
            needed: body_len,
            available: body.len(),
        });
    }

    let id = std::str::from_utf8(&body[..id_len]).map_err(|_| CodecError::InvalidUtf8(offset))?;
    Ok(RecordView {
        offset,
        header,
        id,
        vector_bytes: &body[id_len..body_len],
    })
}

/// Sequential walk over every record of a shard buffer, starting after the header.
pub struct RecordIter<'a> {
    data: &'a [u8],
    pos: usize,
    dimension: usize,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    pub fn new(data: &'a [u8], dimension: usize) -> Self {
        Self {
            data,
            pos: HEADER_LEN.min(data.len()),
            dimension,
            failed: false,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<RecordView<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        match decode_record_at(self.data, self.pos as u64, self.dimension) {
            Ok(view) => {
                self.pos += view.encoded_len();
                Some(Ok(view))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
