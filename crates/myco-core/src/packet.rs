//! Myco wire format — the fixed-size datagram every node exchanges.
//!
//! These types ARE the protocol. Every field, every size, every reserved byte
//! is part of the wire format; changing anything here is a breaking change.
//!
//! All types are #[repr(C)] with explicit little-endian integer fields for
//! deterministic layout and use zerocopy derives for safe, allocation-free
//! serialization. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Packet magic, first two bytes of every datagram.
pub const MAGIC: u16 = 0x4D59;

/// Total packet size on the wire. Datagrams of any other length are not
/// Myco packets.
pub const PACKET_LEN: usize = 1024;

/// Current wire format version. A receiver seeing an unknown version
/// silently drops the packet.
pub const WIRE_VERSION: u8 = 0x01;

/// Maximum payload size in bytes. `payload_len` never exceeds this;
/// receivers truncate anything larger before dispatch.
pub const MAX_PAYLOAD: usize = 952;

/// Flag bit: the payload is compressed (see `compress`).
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Byte range of the authentication tag within the packet.
/// The MAC covers every packet byte outside this range.
pub const AUTH_TAG_OFFSET: usize = 54;
pub const AUTH_TAG_LEN: usize = 12;

/// The atomic unit of Myco communication.
///
/// Exactly 1024 bytes on the wire, always. A 72-byte header (including a
/// 6-byte reserved pad that keeps the payload 8-byte aligned) followed by a
/// 952-byte payload area of which the first `payload_len` bytes are
/// meaningful. Everything is little-endian.
///
/// The MAC profile is 8-byte nonce + 12-byte tag. The alternate 24/16
/// profile is not supported at this ABI; the size assertion below is the
/// enforcement point.
#[derive(Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct Packet {
    /// Always `MAGIC`.
    pub magic: U16<LittleEndian>,

    /// Wire format version, currently 0x01.
    pub version: u8,

    /// Message type discriminator, see [`MsgType`].
    pub msg_type: u8,

    /// Numeric id of the originating node.
    pub node_id: U16<LittleEndian>,

    /// Gossip zone. Reserved for zoned topologies, currently always 0.
    pub zone: u8,

    /// Bit flags. Bit 0x01 = payload is compressed.
    pub flags: u8,

    /// Revocation block. Reserved, currently always 0.
    pub revocation: U32<LittleEndian>,

    /// Number of meaningful payload bytes, at most `MAX_PAYLOAD`.
    /// Payload bytes beyond this are ignored by the receiver.
    pub payload_len: U16<LittleEndian>,

    /// X25519 public key of the sending node.
    pub sender: [u8; 32],

    /// Per-packet nonce, random.
    pub nonce: [u8; 8],

    /// Authentication tag over all other packet bytes.
    pub auth_tag: [u8; AUTH_TAG_LEN],

    /// Pad to an 8-byte payload boundary. Must be zero.
    reserved: [u8; 6],

    /// Payload area. Interpretation depends on `msg_type`.
    pub payload: [u8; MAX_PAYLOAD],
}

// Compile-time size guard. If this fails, the wire format has silently
// changed — or someone tried to switch MAC profiles.
assert_eq_size!(Packet, [u8; 1024]);

impl Packet {
    /// A fresh packet with the header identity fields filled in and
    /// everything else zeroed.
    pub fn new(msg_type: MsgType, node_id: u16, sender: [u8; 32]) -> Self {
        let mut p = Self::new_zeroed();
        p.magic = U16::new(MAGIC);
        p.version = WIRE_VERSION;
        p.msg_type = msg_type as u8;
        p.node_id = U16::new(node_id);
        p.sender = sender;
        p
    }

    /// The meaningful payload bytes, clamped to `MAX_PAYLOAD`.
    pub fn payload_bytes(&self) -> &[u8] {
        let len = (self.payload_len.get() as usize).min(MAX_PAYLOAD);
        &self.payload[..len]
    }

    /// Copy `bytes` into the payload area and set `payload_len`.
    /// Returns false if `bytes` does not fit.
    pub fn set_payload(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > MAX_PAYLOAD {
            return false;
        }
        self.payload[..bytes.len()].copy_from_slice(bytes);
        self.payload_len = U16::new(bytes.len() as u16);
        true
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Parse a packet from exactly `PACKET_LEN` raw bytes.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from(bytes)
    }

    /// The raw wire bytes, ready for a socket write.
    pub fn wire_bytes(&self) -> &[u8] {
        self.as_bytes()
    }

    /// Enforce the inbound contract: a declared payload length beyond the
    /// payload area is truncated before dispatch.
    pub fn clamp_payload_len(&mut self) {
        if self.payload_len.get() as usize > MAX_PAYLOAD {
            self.payload_len = U16::new(MAX_PAYLOAD as u16);
        }
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("msg_type", &self.msg_type)
            .field("node_id", &self.node_id.get())
            .field("flags", &self.flags)
            .field("payload_len", &self.payload_len.get())
            .finish_non_exhaustive()
    }
}

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Carries a full service record plus its version.
    Deploy = 1,
    /// Delta digest of recently mutated entries, emitted every tick.
    Sync = 2,
    /// Asks the addressee for the record of a single service id.
    Request = 3,
    /// Recency digest, emitted periodically as anti-entropy.
    Control = 4,
}

impl TryFrom<u8> for MsgType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MsgType::Deploy),
            2 => Ok(MsgType::Sync),
            3 => Ok(MsgType::Request),
            4 => Ok(MsgType::Control),
            other => Err(WireError::UnknownMsgType(other)),
        }
    }
}

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type byte: 0x{0:02x}")]
    UnknownMsgType(u8),

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD}")]
    PayloadTooLarge(usize),
}
