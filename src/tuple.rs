// Packed, reference-counted tuples.
//
// A tuple is an ordered sequence of opaque byte-string fields, stored
// packed: each field is a BER-varint length followed by the raw bytes.
// Tuples are shared between every index that points at them; the Rc
// strong count is the reference count, one per index pointer. Flags
// track commit state: GHOST marks a tuple staged by an uncommitted
// transaction, WAL_WAIT marks one whose row is in flight to the WAL.
//
// The core is single-threaded, so flags live in a Cell and refcounts
// need no atomics.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use bytes::{BufMut, BytesMut};

use crate::buf::BufExt;
use crate::error::{DbError, Result};
use crate::varint;

pub type TupleRef = Rc<Tuple>;

/// Inserted by a transaction that has not committed yet; visible only
/// to the inserting fiber.
pub const GHOST: u16 = 0x02;
/// The tuple's redo row is waiting for WAL acknowledgement.
pub const WAL_WAIT: u16 = 0x01;

pub struct Tuple {
    flags: Cell<u16>,
    field_count: u32,
    /// Packed fields: (varint length, bytes) per field.
    data: Box<[u8]>,
}

impl Tuple {
    /// Build a tuple from already-packed field data. The caller is
    /// responsible for `data` matching `field_count`.
    pub fn from_packed(field_count: u32, data: Box<[u8]>) -> TupleRef {
        Rc::new(Tuple {
            flags: Cell::new(0),
            field_count,
            data,
        })
    }

    pub fn field_count(&self) -> u32 {
        self.field_count
    }

    /// Packed byte size of the field data.
    pub fn bsize(&self) -> usize {
        self.data.len()
    }

    pub fn packed(&self) -> &[u8] {
        &self.data
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flag(&self, flag: u16) {
        self.flags.set(self.flags.get() | flag);
    }

    pub fn clear_flag(&self, flag: u16) {
        self.flags.set(self.flags.get() & !flag);
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags.get() & flag != 0
    }

    /// The i-th field body, or None past the end.
    pub fn field(&self, i: u32) -> Option<&[u8]> {
        if i >= self.field_count {
            return None;
        }
        let mut rest = &self.data[..];
        for _ in 0..i {
            let (len, used) = varint::read_varint32(rest).ok()?;
            rest = &rest[used + len as usize..];
        }
        let (len, used) = varint::read_varint32(rest).ok()?;
        Some(&rest[used..used + len as usize])
    }

    pub fn fields(&self) -> FieldIter<'_> {
        FieldIter {
            rest: &self.data,
            remaining: self.field_count,
        }
    }

    /// Compact form: varint field count, then the packed fields.
    /// This is the shape stored in snapshot rows.
    pub fn encode(&self, out: &mut BytesMut) {
        varint::write_varint32(out, self.field_count);
        out.put_slice(&self.data);
    }

    pub fn decode(buf: &mut BytesMut) -> Result<TupleRef> {
        let field_count = buf.read_varint32()?;
        Self::decode_fields(buf, field_count)
    }

    /// Request form: u32 field count, then the packed fields. INSERT
    /// bodies and SELECT keys arrive this way.
    pub fn decode_request(buf: &mut BytesMut) -> Result<TupleRef> {
        let field_count = buf.read_u32_le()?;
        Self::decode_fields(buf, field_count)
    }

    /// Reply form: u32 packed size, u32 field count, packed fields.
    pub fn encode_reply(&self, out: &mut BytesMut) {
        out.put_u32_le(self.data.len() as u32);
        out.put_u32_le(self.field_count);
        out.put_slice(&self.data);
    }

    fn decode_fields(buf: &mut BytesMut, field_count: u32) -> Result<TupleRef> {
        let mut builder = TupleBuilder::with_capacity(field_count);
        for _ in 0..field_count {
            let field = buf.read_field()?;
            builder.add_field(&field);
        }
        Ok(builder.finish())
    }

    /// Validate a packed-field region without copying: counts fields
    /// and checks that lengths stay in bounds.
    pub fn validate_packed(data: &[u8], field_count: u32) -> Result<()> {
        let mut rest = data;
        for _ in 0..field_count {
            let (len, used) = varint::read_varint32(rest)?;
            let total = used + len as usize;
            if rest.len() < total {
                return Err(DbError::BufferTooShort);
            }
            rest = &rest[total..];
        }
        if !rest.is_empty() {
            return Err(DbError::IllegalParams("trailing bytes after last field"));
        }
        Ok(())
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.field_count == other.field_count && self.data == other.data
    }
}

impl Eq for Tuple {}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tuple[{}]{{", self.field_count)?;
        for (i, field) in self.fields().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match std::str::from_utf8(field) {
                Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s:?}")?,
                _ => write!(f, "{field:02x?}")?,
            }
        }
        write!(f, "}}")
    }
}

pub struct FieldIter<'a> {
    rest: &'a [u8],
    remaining: u32,
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let (len, used) = varint::read_varint32(self.rest).ok()?;
        let field = &self.rest[used..used + len as usize];
        self.rest = &self.rest[used + len as usize..];
        Some(field)
    }
}

pub struct TupleBuilder {
    data: BytesMut,
    field_count: u32,
}

impl TupleBuilder {
    pub fn new() -> TupleBuilder {
        Self::with_capacity(4)
    }

    pub fn with_capacity(fields: u32) -> TupleBuilder {
        TupleBuilder {
            data: BytesMut::with_capacity(16 * fields as usize),
            field_count: 0,
        }
    }

    pub fn add_field(&mut self, body: &[u8]) {
        varint::write_varint32(&mut self.data, body.len() as u32);
        self.data.put_slice(body);
        self.field_count += 1;
    }

    /// Append an already length-prefixed field.
    pub fn add_packed(&mut self, packed: &[u8]) {
        self.data.put_slice(packed);
        self.field_count += 1;
    }

    pub fn field_count(&self) -> u32 {
        self.field_count
    }

    pub fn finish(self) -> TupleRef {
        Tuple::from_packed(self.field_count, Box::from(&self.data[..]))
    }
}

impl Default for TupleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn tuple(fields: &[&[u8]]) -> TupleRef {
        let mut builder = TupleBuilder::new();
        for field in fields {
            builder.add_field(field);
        }
        builder.finish()
    }

    #[test]
    fn field_access() {
        let t = tuple(&[b"\x01\x00\x00\x00", b"hello", b""]);
        assert_eq!(t.field_count(), 3);
        assert_eq!(t.field(0).unwrap(), b"\x01\x00\x00\x00");
        assert_eq!(t.field(1).unwrap(), b"hello");
        assert_eq!(t.field(2).unwrap(), b"");
        assert!(t.field(3).is_none());
        let collected: Vec<_> = t.fields().collect();
        assert_eq!(collected.len(), 3);
    }

    #[test]
    fn compact_roundtrip() {
        let t = tuple(&[b"key", b"value with spaces", b"\x00\xff"]);
        let mut buf = BytesMut::new();
        t.encode(&mut buf);
        let back = Tuple::decode(&mut buf).unwrap();
        assert_eq!(*t, *back);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_tuple_roundtrips() {
        let t = tuple(&[]);
        assert_eq!(t.field_count(), 0);
        assert_eq!(t.bsize(), 0);
        let mut buf = BytesMut::new();
        t.encode(&mut buf);
        let back = Tuple::decode(&mut buf).unwrap();
        assert_eq!(*t, *back);
    }

    #[test]
    fn reply_form_carries_sizes() {
        let t = tuple(&[b"ab", b"c"]);
        let mut buf = BytesMut::new();
        t.encode_reply(&mut buf);
        assert_eq!(buf.read_u32_le().unwrap(), t.bsize() as u32);
        assert_eq!(buf.read_u32_le().unwrap(), 2);
        let body = buf.read_bytes(t.bsize()).unwrap();
        assert_eq!(&body[..], t.packed());
    }

    #[test]
    fn flags_toggle() {
        let t = tuple(&[b"k"]);
        assert!(!t.has_flag(GHOST));
        t.set_flag(GHOST);
        t.set_flag(WAL_WAIT);
        assert!(t.has_flag(GHOST) && t.has_flag(WAL_WAIT));
        t.clear_flag(GHOST);
        assert!(!t.has_flag(GHOST));
        assert!(t.has_flag(WAL_WAIT));
    }

    #[test]
    fn validate_rejects_truncation() {
        let t = tuple(&[b"hello", b"world"]);
        assert!(Tuple::validate_packed(t.packed(), 2).is_ok());
        assert!(Tuple::validate_packed(&t.packed()[..4], 2).is_err());
        assert!(Tuple::validate_packed(t.packed(), 1).is_err());
    }
}
