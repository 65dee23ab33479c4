use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::handshake::RejectReason;
use crate::options::SocketOptions;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HandshakeKind {
    InductionRequest = 1,
    InductionResponse = 2,
    ConclusionRequest = 3,
    ConclusionResponse = 4,
    Rejection = 5,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct HandshakeFlags: u8 {
        const SENDER         = 0b0000_0001;
        const TIMESTAMP_MODE = 0b0000_0010;
    }
}
impl HandshakeFlags {
    pub fn from_options(options: &SocketOptions) -> HandshakeFlags {
        let mut result = HandshakeFlags::empty();
        result.set(HandshakeFlags::SENDER, options.is_sender);
        result.set(HandshakeFlags::TIMESTAMP_MODE, options.timestamp_mode);
        result
    }
}

/// A single datagram of the connection handshake. Socket ids are those of the sending and the
///  addressed side respectively; the destination id is 0 in an induction request because the
///  caller does not know it yet.
#[derive(Clone, Eq, PartialEq)]
pub struct HandshakePacket {
    pub kind: HandshakeKind,
    pub flags: HandshakeFlags,
    pub source_socket_id: u32,
    pub destination_socket_id: u32,
    pub cookie: u32,
    pub reject_reason: RejectReason,
}
impl Debug for HandshakePacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HS{{{:?}:{}->{}", self.kind, self.source_socket_id, self.destination_socket_id)?;
        if self.kind == HandshakeKind::Rejection {
            write!(f, ":{:?}", self.reject_reason)?;
        }
        write!(f, "}}")
    }
}

impl HandshakePacket {
    pub const MAGIC: u32 = 0x5343_4831;
    pub const PROTOCOL_VERSION_1: u8 = 1;

    pub const SERIALIZED_LEN: usize = size_of::<u32>() // magic
        + size_of::<u8>()    // version
        + size_of::<u8>()    // kind
        + size_of::<u8>()    // flags
        + size_of::<u32>()   // source socket id
        + size_of::<u32>()   // destination socket id
        + size_of::<u32>()   // cookie
        + size_of::<u16>();  // reject reason

    pub fn new(kind: HandshakeKind, flags: HandshakeFlags, source_socket_id: u32, destination_socket_id: u32, cookie: u32) -> HandshakePacket {
        HandshakePacket {
            kind,
            flags,
            source_socket_id,
            destination_socket_id,
            cookie,
            reject_reason: RejectReason::Unknown,
        }
    }

    pub fn rejection(source_socket_id: u32, destination_socket_id: u32, reason: RejectReason) -> HandshakePacket {
        HandshakePacket {
            reject_reason: reason,
            ..HandshakePacket::new(HandshakeKind::Rejection, HandshakeFlags::empty(), source_socket_id, destination_socket_id, 0)
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(Self::MAGIC);
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(self.kind.into());
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.source_socket_id);
        buf.put_u32(self.destination_socket_id);
        buf.put_u32(self.cookie);
        buf.put_u16(self.reject_reason.into());
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut result);
        result
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HandshakePacket> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("handshake packet too short: {} bytes", buf.remaining());
        }

        let magic = buf.get_u32();
        if magic != Self::MAGIC {
            bail!("not a handshake packet: magic {:x}", magic);
        }
        let version = buf.get_u8();
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported handshake version {}", version);
        }
        let kind = HandshakeKind::try_from(buf.get_u8())
            .map_err(|e| anyhow!("invalid handshake kind: {}", e))?;
        let raw_flags = buf.get_u8();
        let flags = HandshakeFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("invalid handshake flags {:b}", raw_flags))?;
        let source_socket_id = buf.get_u32();
        let destination_socket_id = buf.get_u32();
        let cookie = buf.get_u32();
        // reason codes are advisory - unknown ones must not make the rejection itself unreadable
        let reject_reason = RejectReason::try_from(buf.get_u16())
            .unwrap_or(RejectReason::Unknown);

        Ok(HandshakePacket {
            kind,
            flags,
            source_socket_id,
            destination_socket_id,
            cookie,
            reject_reason,
        })
    }
}
