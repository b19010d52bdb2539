use bytes::{Buf, BufMut};

/// Schema identifier for the replication protocol. Bumped only on incompatible layout changes.
pub const SCHEMA_ID: u16 = 3;
/// Schema version. Decoders accept any version <= their own for forward-compatible parsing.
pub const SCHEMA_VERSION: u16 = 1;

/// Sentinel encoding for an absent fixed u64 field (position or term).
pub const NULL_U64: u64 = u64::MAX;

pub const HEADER_LENGTH: usize = 8;

/// MessageHeader precedes every frame: the fixed-size body length of the message that
/// follows, which message it is, and which schema/version wrote it.
///
/// All integers in the protocol are little-endian.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl MessageHeader {
    pub fn new(block_length: u16, template_id: u16) -> Self {
        MessageHeader {
            block_length,
            template_id,
            schema_id: SCHEMA_ID,
            version: SCHEMA_VERSION,
        }
    }

    pub fn write(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.block_length);
        dst.put_u16_le(self.template_id);
        dst.put_u16_le(self.schema_id);
        dst.put_u16_le(self.version);
    }

    pub fn read(src: &mut impl Buf) -> Result<Self, DecodeError> {
        if src.remaining() < HEADER_LENGTH {
            return Err(DecodeError::Truncated("message header"));
        }

        Ok(MessageHeader {
            block_length: src.get_u16_le(),
            template_id: src.get_u16_le(),
            schema_id: src.get_u16_le(),
            version: src.get_u16_le(),
        })
    }
}

/// A malformed inbound frame. The frame is dropped as a whole; no partially decoded
/// message is ever surfaced.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("buffer too short while reading {0}")]
    Truncated(&'static str),

    #[error("unsupported schema id {0}")]
    UnknownSchema(u16),

    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u16),

    #[error("unknown template id {0}")]
    UnknownTemplate(u16),

    #[error("frame declared {declared} bytes but decoder consumed {consumed}")]
    FrameLength { declared: usize, consumed: usize },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("illegal value for {0}")]
    InvalidValue(&'static str),
}

pub mod templates {
    pub const VOTE_REQUEST: u16 = 10;
    pub const VOTE_RESPONSE: u16 = 11;
    pub const POLL_REQUEST: u16 = 12;
    pub const POLL_RESPONSE: u16 = 13;
    pub const APPEND_REQUEST: u16 = 14;
    pub const APPEND_RESPONSE: u16 = 15;
    pub const CONFIGURE_REQUEST: u16 = 16;
    pub const CONFIGURE_RESPONSE: u16 = 17;
    pub const JOIN_REQUEST: u16 = 18;
    pub const LEAVE_RESPONSE: u16 = 19;
}
