use crate::frame::serial::{Reader, Writer};

/// Size of an encoded segment header.
pub const OVERHEAD: usize = 24;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Command {
    #[default]
    Push,
    Ack,
    WindowProbe,
    WindowResponse,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            81 => Some(Self::Push),
            82 => Some(Self::Ack),
            83 => Some(Self::WindowProbe),
            84 => Some(Self::WindowResponse),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Push => 81,
            Self::Ack => 82,
            Self::WindowProbe => 83,
            Self::WindowResponse => 84,
        }
    }
}

/// The on-wire header of a segment, as read from a datagram. The command byte is left raw so
/// that the engine may reject unknown commands itself.
#[derive(Debug)]
pub struct Header {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

impl Header {
    pub fn read(rd: &mut Reader) -> Option<Self> {
        if rd.remaining() < OVERHEAD {
            return None;
        }

        Some(Self {
            conv: rd.read_u32()?,
            cmd: rd.read_u8()?,
            frg: rd.read_u8()?,
            wnd: rd.read_u16()?,
            ts: rd.read_u32()?,
            sn: rd.read_u32()?,
            una: rd.read_u32()?,
            len: rd.read_u32()?,
        })
    }
}

#[derive(Debug, Default)]
pub struct Segment {
    pub conv: u32,
    pub cmd: Command,
    // Fragment countdown, 0 marks the last fragment of a message
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    // Sender-side retransmission bookkeeping, never encoded
    pub resendts: u32,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
    pub data: Vec<u8>,
}

impl Segment {
    /// Encodes the header of this segment (not its payload) into `dst`, returning the number of
    /// bytes written.
    pub fn encode_header(&self, dst: &mut [u8]) -> usize {
        let mut wr = Writer::new(dst);

        wr.write_u32(self.conv);
        wr.write_u8(self.cmd.to_u8());
        wr.write_u8(self.frg);
        wr.write_u16(self.wnd);
        wr.write_u32(self.ts);
        wr.write_u32(self.sn);
        wr.write_u32(self.una);
        wr.write_u32(self.data.len() as u32);

        debug_assert_eq!(wr.bytes_written(), OVERHEAD);

        wr.bytes_written()
    }

    fn reset(&mut self) {
        self.conv = 0;
        self.cmd = Command::Push;
        self.frg = 0;
        self.wnd = 0;
        self.ts = 0;
        self.sn = 0;
        self.una = 0;
        self.resendts = 0;
        self.rto = 0;
        self.fastack = 0;
        self.xmit = 0;
        // Keep the allocation
        self.data.clear();
    }
}

const POOL_SIZE_MAX: usize = 1024;

/// Free list of recycled segments, so that steady-state traffic does not allocate payload
/// buffers per datagram.
#[derive(Default)]
pub struct SegmentPool {
    free: Vec<Segment>,
}

impl SegmentPool {
    pub fn take(&mut self) -> Segment {
        self.free.pop().unwrap_or_default()
    }

    pub fn give(&mut self, mut segment: Segment) {
        if self.free.len() < POOL_SIZE_MAX {
            segment.reset();
            self.free.push(segment);
        }
    }
}
