/// Fixed-capacity byte buffer used to stage frames
///
/// A `ByteBuffer` is the scratch area a transport encodes an outgoing frame
/// into, and the area a received frame is copied into before the message
/// layer decodes it. It never grows: every write and read is checked
/// against the capacity given at construction, which is
/// `MAX_MESSAGE_LENGTH + header size` for the transports in this crate.
///
/// All multi-byte fields are big-endian 16-bit values (Modbus register order).

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ModbusError, ModbusResult};

#[derive(Debug, Clone)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    /// Read cursor
    pos: usize,
    /// Number of valid bytes (written span)
    count: usize,
}

impl ByteBuffer {
    /// Create a buffer with a fixed capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            pos: 0,
            count: 0,
        }
    }

    /// Fixed capacity of the buffer
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of valid bytes
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current read position
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.count - self.pos
    }

    /// Clear position and content without reallocating
    pub fn reset(&mut self) {
        self.pos = 0;
        self.count = 0;
    }

    /// Rewind the read cursor to the start of the written span
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Replace the content with `data` and rewind
    pub fn reset_with(&mut self, data: &[u8]) -> ModbusResult<()> {
        self.ensure_capacity(data.len())?;
        self.buf[..data.len()].copy_from_slice(data);
        self.pos = 0;
        self.count = data.len();
        Ok(())
    }

    /// Shorten the written span, e.g. to drop a validated checksum
    pub fn truncate(&mut self, len: usize) {
        if len < self.count {
            self.count = len;
            self.pos = self.pos.min(len);
        }
    }

    /// The written span
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.count]
    }

    /// Copy of the written span
    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Unread part of the written span
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.pos..self.count]
    }

    fn ensure_capacity(&self, total: usize) -> ModbusResult<()> {
        if total > self.buf.len() {
            return Err(ModbusError::capacity_exceeded(total, self.buf.len()));
        }
        Ok(())
    }

    fn ensure_readable(&self, len: usize) -> ModbusResult<()> {
        if self.pos + len > self.count {
            return Err(ModbusError::frame_truncated("message"));
        }
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> ModbusResult<()> {
        self.ensure_capacity(self.count + 1)?;
        self.buf[self.count] = value;
        self.count += 1;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.ensure_capacity(self.count + 2)?;
        BigEndian::write_u16(&mut self.buf[self.count..self.count + 2], value);
        self.count += 2;
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> ModbusResult<()> {
        self.ensure_capacity(self.count + data.len())?;
        self.buf[self.count..self.count + data.len()].copy_from_slice(data);
        self.count += data.len();
        Ok(())
    }

    /// Overwrite a 16-bit field inside the written span
    ///
    /// Used to patch a length field once the body size is known.
    pub fn set_u16(&mut self, offset: usize, value: u16) -> ModbusResult<()> {
        if offset + 2 > self.count {
            return Err(ModbusError::capacity_exceeded(offset + 2, self.count));
        }
        BigEndian::write_u16(&mut self.buf[offset..offset + 2], value);
        Ok(())
    }

    pub fn read_u8(&mut self) -> ModbusResult<u8> {
        self.ensure_readable(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> ModbusResult<u16> {
        self.ensure_readable(2)?;
        let value = BigEndian::read_u16(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(value)
    }

    pub fn read_bytes(&mut self, len: usize) -> ModbusResult<&[u8]> {
        self.ensure_readable(len)?;
        let start = self.pos;
        self.pos += len;
        Ok(&self.buf[start..start + len])
    }

    /// Advance the read cursor without copying
    pub fn skip(&mut self, len: usize) -> ModbusResult<()> {
        self.ensure_readable(len)?;
        self.pos += len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_fields() {
        let mut buf = ByteBuffer::new(16);
        buf.write_u16(0x1234).unwrap();
        buf.write_u8(0xAB).unwrap();
        buf.write_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(buf.as_bytes(), &[0x12, 0x34, 0xAB, 1, 2, 3]);

        assert_eq!(buf.read_u16().unwrap(), 0x1234);
        buf.skip(1).unwrap();
        assert_eq!(buf.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_capacity_is_fixed() {
        let mut buf = ByteBuffer::new(3);
        buf.write_u16(1).unwrap();
        let err = buf.write_u16(2).unwrap_err();
        assert_eq!(err, ModbusError::capacity_exceeded(4, 3));
        assert!(buf.reset_with(&[0; 4]).is_err());
        // Failed write leaves the buffer unchanged
        assert_eq!(buf.as_bytes(), &[0, 1]);
    }

    #[test]
    fn test_read_past_end_is_truncation() {
        let mut buf = ByteBuffer::new(8);
        buf.reset_with(&[0x01]).unwrap();
        assert!(matches!(buf.read_u16(), Err(ModbusError::FrameTruncated { .. })));
        assert!(buf.skip(2).is_err());
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut buf = ByteBuffer::new(8);
        buf.write_bytes(&[9; 8]).unwrap();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 8);
        buf.write_u8(7).unwrap();
        assert_eq!(buf.to_bytes(), vec![7]);
    }

    #[test]
    fn test_patch_length_field() {
        let mut buf = ByteBuffer::new(8);
        buf.write_u16(0).unwrap();
        buf.write_bytes(&[1, 2, 3]).unwrap();
        buf.set_u16(0, 3).unwrap();
        assert_eq!(buf.as_bytes(), &[0, 3, 1, 2, 3]);
        assert!(buf.set_u16(4, 1).is_err());
    }
}
