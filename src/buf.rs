// Length-checked readers over BytesMut.
//
// BytesMut supplies the growable-buffer mechanics (doubling growth,
// `reserve` for spare capacity, `split_to` to carve a prefix off the
// front, `advance` to move the read head); what the wire parser needs
// on top is reads that fail with `buffer too short` instead of
// panicking when a frame is truncated.

use bytes::{Buf, BytesMut};

use crate::error::{DbError, Result};
use crate::varint;

pub const INITIAL_BUF_CAPACITY: usize = 128;

pub fn new_buf() -> BytesMut {
    BytesMut::with_capacity(INITIAL_BUF_CAPACITY)
}

pub trait BufExt {
    fn read_u8(&mut self) -> Result<u8>;
    fn read_u16_le(&mut self) -> Result<u16>;
    fn read_u32_le(&mut self) -> Result<u32>;
    fn read_u64_le(&mut self) -> Result<u64>;
    fn read_varint32(&mut self) -> Result<u32>;
    /// A varint length prefix followed by that many raw bytes.
    fn read_field(&mut self) -> Result<BytesMut>;
    fn read_bytes(&mut self, n: usize) -> Result<BytesMut>;
}

impl BufExt for BytesMut {
    fn read_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(DbError::BufferTooShort);
        }
        Ok(self.get_u8())
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(DbError::BufferTooShort);
        }
        Ok(self.get_u16_le())
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(DbError::BufferTooShort);
        }
        Ok(self.get_u32_le())
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        if self.remaining() < 8 {
            return Err(DbError::BufferTooShort);
        }
        Ok(self.get_u64_le())
    }

    fn read_varint32(&mut self) -> Result<u32> {
        let (value, used) = varint::read_varint32(self)?;
        self.advance(used);
        Ok(value)
    }

    fn read_field(&mut self) -> Result<BytesMut> {
        let len = self.read_varint32()? as usize;
        self.read_bytes(len)
    }

    fn read_bytes(&mut self, n: usize) -> Result<BytesMut> {
        if self.remaining() < n {
            return Err(DbError::BufferTooShort);
        }
        Ok(self.split_to(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn scalar_reads() {
        let mut buf = new_buf();
        buf.put_u32_le(0xdead_beef);
        buf.put_u64_le(42);
        assert_eq!(buf.read_u32_le().unwrap(), 0xdead_beef);
        assert_eq!(buf.read_u64_le().unwrap(), 42);
        assert!(matches!(buf.read_u8(), Err(DbError::BufferTooShort)));
    }

    #[test]
    fn field_read_carves_prefix() {
        let mut buf = new_buf();
        varint::write_varint32(&mut buf, 5);
        buf.put_slice(b"helloTAIL");
        let field = buf.read_field().unwrap();
        assert_eq!(&field[..], b"hello");
        assert_eq!(&buf[..], b"TAIL");
    }

    #[test]
    fn truncated_field_is_an_error() {
        let mut buf = new_buf();
        varint::write_varint32(&mut buf, 100);
        buf.put_slice(b"short");
        assert!(matches!(buf.read_field(), Err(DbError::BufferTooShort)));
    }
}
