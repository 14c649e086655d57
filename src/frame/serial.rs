// All multi-byte fields on the wire are little-endian.

pub struct Reader<'a> {
    buffer: &'a [u8],
    bytes_read: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            bytes_read: 0,
        }
    }

    #[cfg(test)]
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.bytes_read
    }

    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.buffer[self.bytes_read..]
    }

    pub fn read_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }

        let slice = &self.buffer[self.bytes_read..self.bytes_read + len];
        self.bytes_read += len;

        Some(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.read_slice(N)?.try_into().ok()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }
}

/// Writes into a caller-sized buffer. Callers guarantee sufficient space; overrunning the buffer
/// is a logic error and panics.
pub struct Writer<'a> {
    buffer: &'a mut [u8],
    bytes_written: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        let end = self.bytes_written + bytes.len();
        self.buffer[self.bytes_written..end].copy_from_slice(bytes);
        self.bytes_written = end;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_slice(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_slice(&value.to_le_bytes());
    }

    pub fn finalize(self) -> &'a [u8] {
        let Self {
            buffer,
            bytes_written,
        } = self;
        &buffer[..bytes_written]
    }
}
