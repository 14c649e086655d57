pub mod serial;

use super::Channel;

pub const CHANNEL_HEADER_SIZE: usize = 1;
pub const COOKIE_HEADER_SIZE: usize = 4;

/// Bytes prepended to every datagram: channel selector + cookie.
pub const ENVELOPE_SIZE: usize = CHANNEL_HEADER_SIZE + COOKIE_HEADER_SIZE;

/// Bytes prepended to every message delivered through the reliable channel.
pub const MESSAGE_HEADER_SIZE: usize = 1;

pub const HANDSHAKE_PAYLOAD_SIZE: usize = 4;

/// The reliable-channel sub-header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageKind {
    Handshake,
    Data,
    Ping,
    Disconnect,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Handshake),
            1 => Some(Self::Data),
            2 => Some(Self::Ping),
            3 => Some(Self::Disconnect),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Handshake => 0,
            Self::Data => 1,
            Self::Ping => 2,
            Self::Disconnect => 3,
        }
    }
}

/// A parsed raw datagram.
#[derive(Debug)]
pub struct Envelope<'a> {
    pub channel: Channel,
    pub cookie: u32,
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Returns `None` if the datagram is shorter than the envelope header, or if the channel
    /// selector is unknown.
    pub fn read(datagram: &'a [u8]) -> Option<Self> {
        let mut rd = serial::Reader::new(datagram);

        let channel = Channel::from_u8(rd.read_u8()?)?;
        let cookie = rd.read_u32()?;

        Some(Self {
            channel,
            cookie,
            payload: rd.remaining_bytes(),
        })
    }

    /// Writes an envelope header followed by `payload` into `dst`, returning the written frame.
    pub fn write<'b>(channel: Channel, cookie: u32, payload: &[u8], dst: &'b mut [u8]) -> &'b [u8] {
        let mut wr = serial::Writer::new(dst);

        wr.write_u8(channel.to_u8());
        wr.write_u32(cookie);
        wr.write_slice(payload);

        wr.finalize()
    }
}

/// Reads a handshake payload (the remote cookie).
pub fn read_handshake(payload: &[u8]) -> Option<u32> {
    if payload.len() != HANDSHAKE_PAYLOAD_SIZE {
        return None;
    }

    serial::Reader::new(payload).read_u32()
}
