// Binary wire protocol.
//
// Framing: a 12-byte little-endian request header {msg_code, len,
// sync}, then `len` body bytes. Replies echo msg_code and sync and
// insert a ret_code word after the header triple (16 bytes total),
// except PING, whose reply is the bare 12-byte header echo. `sync` is
// an opaque correlation id; requests on one socket may be pipelined.
//
// Request bodies carry tuples as {field_count:u32, fields...}; reply
// bodies prefix each tuple with its packed byte size as well. Two
// DELETE shapes exist on the wire: opcode 20 is the old form without
// a flags word, 21 the current one with it. The opcode that arrived
// is kept in the WAL row, so replay re-enters the same parse path.

use bytes::{BufMut, BytesMut};

use crate::buf::BufExt;
use crate::error::{DbError, Result};
use crate::tuple::{Tuple, TupleRef};

pub const MSG_INSERT: u32 = 13;
pub const MSG_SELECT: u32 = 17;
pub const MSG_UPDATE: u32 = 19;
pub const MSG_DELETE_1_3: u32 = 20;
pub const MSG_DELETE: u32 = 21;
pub const MSG_CALL: u32 = 22;
pub const MSG_PING: u32 = 0xff00;

pub const FLAG_RETURN_TUPLE: u32 = 0x01;
pub const FLAG_ADD: u32 = 0x02;
pub const FLAG_REPLACE: u32 = 0x04;
pub const FLAG_QUIET: u32 = 0x08;
pub const FLAG_NOT_STORE: u32 = 0x10;

const ALLOWED_FLAGS: u32 =
    FLAG_RETURN_TUPLE | FLAG_ADD | FLAG_REPLACE | FLAG_QUIET | FLAG_NOT_STORE;

pub const REQUEST_HEADER_SIZE: usize = 12;
pub const REPLY_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub msg_code: u32,
    pub len: u32,
    pub sync: u32,
}

impl RequestHeader {
    pub fn read(buf: &mut BytesMut) -> Result<RequestHeader> {
        Ok(RequestHeader {
            msg_code: buf.read_u32_le()?,
            len: buf.read_u32_le()?,
            sync: buf.read_u32_le()?,
        })
    }

    pub fn write(&self, out: &mut BytesMut) {
        out.put_u32_le(self.msg_code);
        out.put_u32_le(self.len);
        out.put_u32_le(self.sync);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOpCode {
    Assign = 0,
    Add = 1,
    And = 2,
    Xor = 3,
    Or = 4,
    Splice = 5,
    Delete = 6,
    Insert = 7,
}

impl UpdateOpCode {
    pub fn from_u8(code: u8) -> Result<UpdateOpCode> {
        Ok(match code {
            0 => UpdateOpCode::Assign,
            1 => UpdateOpCode::Add,
            2 => UpdateOpCode::And,
            3 => UpdateOpCode::Xor,
            4 => UpdateOpCode::Or,
            5 => UpdateOpCode::Splice,
            6 => UpdateOpCode::Delete,
            7 => UpdateOpCode::Insert,
            _ => return Err(DbError::IllegalParams("unknown update op")),
        })
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOp {
    pub field_no: u32,
    pub op: UpdateOpCode,
    pub arg: Vec<u8>,
}

#[derive(Debug)]
pub enum Request {
    Insert {
        space: u32,
        flags: u32,
        tuple: TupleRef,
    },
    Select {
        space: u32,
        index: u32,
        offset: u32,
        limit: u32,
        keys: Vec<TupleRef>,
    },
    Update {
        space: u32,
        flags: u32,
        key: TupleRef,
        ops: Vec<UpdateOp>,
    },
    Delete {
        space: u32,
        flags: u32,
        key: TupleRef,
    },
    Call {
        flags: u32,
        proc: Vec<u8>,
        args: TupleRef,
    },
    Ping,
}

impl Request {
    pub fn op_name(msg_code: u32) -> &'static str {
        match msg_code {
            MSG_INSERT => "INSERT",
            MSG_SELECT => "SELECT",
            MSG_UPDATE => "UPDATE",
            MSG_DELETE | MSG_DELETE_1_3 => "DELETE",
            MSG_CALL => "CALL",
            MSG_PING => "PING",
            _ => "UNKNOWN",
        }
    }

    /// True for opcodes that mutate state and therefore reach the WAL.
    pub fn is_mutation(msg_code: u32) -> bool {
        matches!(
            msg_code,
            MSG_INSERT | MSG_UPDATE | MSG_DELETE | MSG_DELETE_1_3
        )
    }

    /// Decode one request body. The body must be consumed exactly.
    pub fn parse(msg_code: u32, body: &mut BytesMut) -> Result<Request> {
        let req = match msg_code {
            MSG_INSERT => {
                let space = body.read_u32_le()?;
                let flags = body.read_u32_le()?;
                check_flags(flags)?;
                let tuple = Tuple::decode_request(body)?;
                Request::Insert { space, flags, tuple }
            }
            MSG_SELECT => {
                let space = body.read_u32_le()?;
                let index = body.read_u32_le()?;
                let offset = body.read_u32_le()?;
                let limit = body.read_u32_le()?;
                let count = body.read_u32_le()?;
                let mut keys = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    keys.push(Tuple::decode_request(body)?);
                }
                Request::Select {
                    space,
                    index,
                    offset,
                    limit,
                    keys,
                }
            }
            MSG_UPDATE => {
                let space = body.read_u32_le()?;
                let flags = body.read_u32_le()?;
                check_flags(flags)?;
                let key = Tuple::decode_request(body)?;
                let ops_count = body.read_u32_le()?;
                let mut ops = Vec::with_capacity(ops_count.min(1024) as usize);
                for _ in 0..ops_count {
                    let field_no = body.read_u32_le()?;
                    let op = UpdateOpCode::from_u8(body.read_u8()?)?;
                    let arg = body.read_field()?.to_vec();
                    ops.push(UpdateOp { field_no, op, arg });
                }
                Request::Update {
                    space,
                    flags,
                    key,
                    ops,
                }
            }
            MSG_DELETE | MSG_DELETE_1_3 => {
                let space = body.read_u32_le()?;
                let flags = if msg_code == MSG_DELETE {
                    let flags = body.read_u32_le()?;
                    check_flags(flags)?;
                    flags
                } else {
                    0
                };
                let key = Tuple::decode_request(body)?;
                Request::Delete { space, flags, key }
            }
            MSG_CALL => {
                let flags = body.read_u32_le()?;
                check_flags(flags)?;
                let proc = body.read_field()?.to_vec();
                let args = Tuple::decode_request(body)?;
                Request::Call { flags, proc, args }
            }
            MSG_PING => Request::Ping,
            other => return Err(DbError::UnsupportedCommand(other)),
        };
        if !body.is_empty() {
            return Err(DbError::IllegalParams("trailing bytes in request body"));
        }
        Ok(req)
    }
}

fn check_flags(flags: u32) -> Result<()> {
    if flags & !ALLOWED_FLAGS != 0 {
        return Err(DbError::IllegalParams("unknown request flags"));
    }
    if flags & FLAG_ADD != 0 && flags & FLAG_REPLACE != 0 {
        return Err(DbError::IllegalParams("ADD and REPLACE are exclusive"));
    }
    Ok(())
}

/// Reply payload produced by a handler.
#[derive(Debug)]
pub enum ReplyBody {
    /// `{count}` only.
    Count(u32),
    /// `{count, tuple...}`.
    Tuples(Vec<TupleRef>),
    /// No body at all (QUIET mutations).
    Empty,
}

/// Serialise a full reply frame.
pub fn encode_reply(msg_code: u32, sync: u32, ret_code: u32, body: &ReplyBody) -> BytesMut {
    let mut payload = BytesMut::new();
    if ret_code == 0 {
        match body {
            ReplyBody::Count(count) => payload.put_u32_le(*count),
            ReplyBody::Tuples(tuples) => {
                payload.put_u32_le(tuples.len() as u32);
                for tuple in tuples {
                    tuple.encode_reply(&mut payload);
                }
            }
            ReplyBody::Empty => {}
        }
    }
    let mut out = BytesMut::with_capacity(REPLY_HEADER_SIZE + payload.len());
    out.put_u32_le(msg_code);
    out.put_u32_le(payload.len() as u32 + 4); // body + ret_code
    out.put_u32_le(sync);
    out.put_u32_le(ret_code);
    out.put_slice(&payload);
    out
}

/// PING replies echo the bare request header.
pub fn encode_ping_reply(sync: u32) -> BytesMut {
    let mut out = BytesMut::with_capacity(REQUEST_HEADER_SIZE);
    RequestHeader {
        msg_code: MSG_PING,
        len: 0,
        sync,
    }
    .write(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::TupleBuilder;

    fn request_tuple(fields: &[&[u8]]) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u32_le(fields.len() as u32);
        for f in fields {
            crate::varint::write_varint32(&mut out, f.len() as u32);
            out.put_slice(f);
        }
        out
    }

    #[test]
    fn parse_insert() {
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u32_le(FLAG_ADD);
        body.extend_from_slice(&request_tuple(&[&1u32.to_le_bytes(), b"hello"]));
        match Request::parse(MSG_INSERT, &mut body).unwrap() {
            Request::Insert { space, flags, tuple } => {
                assert_eq!(space, 0);
                assert_eq!(flags, FLAG_ADD);
                assert_eq!(tuple.field_count(), 2);
                assert_eq!(tuple.field(1).unwrap(), b"hello");
            }
            other => panic!("wrong request: {other:?}"),
        }
    }

    #[test]
    fn parse_select_multi_key() {
        let mut body = BytesMut::new();
        body.put_u32_le(7); // space
        body.put_u32_le(1); // index
        body.put_u32_le(5); // offset
        body.put_u32_le(10); // limit
        body.put_u32_le(2); // key count
        body.extend_from_slice(&request_tuple(&[&1u32.to_le_bytes()]));
        body.extend_from_slice(&request_tuple(&[&2u32.to_le_bytes()]));
        match Request::parse(MSG_SELECT, &mut body).unwrap() {
            Request::Select {
                space,
                index,
                offset,
                limit,
                keys,
            } => {
                assert_eq!((space, index, offset, limit), (7, 1, 5, 10));
                assert_eq!(keys.len(), 2);
            }
            other => panic!("wrong request: {other:?}"),
        }
    }

    #[test]
    fn both_delete_vintages() {
        let mut old = BytesMut::new();
        old.put_u32_le(0);
        old.extend_from_slice(&request_tuple(&[&9u32.to_le_bytes()]));
        assert!(matches!(
            Request::parse(MSG_DELETE_1_3, &mut old).unwrap(),
            Request::Delete { flags: 0, .. }
        ));

        let mut new = BytesMut::new();
        new.put_u32_le(0);
        new.put_u32_le(FLAG_RETURN_TUPLE);
        new.extend_from_slice(&request_tuple(&[&9u32.to_le_bytes()]));
        assert!(matches!(
            Request::parse(MSG_DELETE, &mut new).unwrap(),
            Request::Delete {
                flags: FLAG_RETURN_TUPLE,
                ..
            }
        ));
    }

    #[test]
    fn parse_update_ops() {
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u32_le(0);
        body.extend_from_slice(&request_tuple(&[&3u32.to_le_bytes()]));
        body.put_u32_le(2);
        // ASSIGN field 1 = "xyz"
        body.put_u32_le(1);
        body.put_u8(0);
        crate::varint::write_varint32(&mut body, 3);
        body.put_slice(b"xyz");
        // ADD field 2 += 7
        body.put_u32_le(2);
        body.put_u8(1);
        crate::varint::write_varint32(&mut body, 4);
        body.put_slice(&7u32.to_le_bytes());
        match Request::parse(MSG_UPDATE, &mut body).unwrap() {
            Request::Update { ops, .. } => {
                assert_eq!(ops.len(), 2);
                assert_eq!(ops[0].op, UpdateOpCode::Assign);
                assert_eq!(ops[0].field_no, 1);
                assert_eq!(ops[1].op, UpdateOpCode::Add);
                assert_eq!(ops[1].arg, 7u32.to_le_bytes());
            }
            other => panic!("wrong request: {other:?}"),
        }
    }

    #[test]
    fn exclusive_flags_rejected() {
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u32_le(FLAG_ADD | FLAG_REPLACE);
        body.extend_from_slice(&request_tuple(&[b"k"]));
        assert!(Request::parse(MSG_INSERT, &mut body).is_err());
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u32_le(0);
        body.extend_from_slice(&request_tuple(&[b"k"]));
        body.put_u8(0xcc);
        assert!(matches!(
            Request::parse(MSG_INSERT, &mut body),
            Err(DbError::IllegalParams(_))
        ));
    }

    #[test]
    fn reply_layout() {
        let mut b = TupleBuilder::new();
        b.add_field(b"k");
        let tuple = b.finish();
        let mut reply = encode_reply(MSG_SELECT, 42, 0, &ReplyBody::Tuples(vec![tuple.clone()]));
        assert_eq!(reply.read_u32_le().unwrap(), MSG_SELECT);
        let len = reply.read_u32_le().unwrap();
        assert_eq!(reply.read_u32_le().unwrap(), 42);
        assert_eq!(reply.read_u32_le().unwrap(), 0); // ret_code
        assert_eq!(len as usize, 4 + reply.len());
        assert_eq!(reply.read_u32_le().unwrap(), 1); // count
        assert_eq!(reply.read_u32_le().unwrap(), tuple.bsize() as u32);
        assert_eq!(reply.read_u32_le().unwrap(), 1); // field count
    }

    #[test]
    fn error_reply_has_no_body() {
        let mut reply = encode_reply(MSG_INSERT, 1, 0x3702, &ReplyBody::Count(1));
        reply.read_u32_le().unwrap();
        assert_eq!(reply.read_u32_le().unwrap(), 4); // just ret_code
        reply.read_u32_le().unwrap();
        assert_eq!(reply.read_u32_le().unwrap(), 0x3702);
        assert!(reply.is_empty());
    }

    #[test]
    fn ping_reply_is_header_echo() {
        let reply = encode_ping_reply(42);
        assert_eq!(
            &reply[..],
            &[
                0x00, 0xff, 0x00, 0x00, // msg_code 0xff00
                0x00, 0x00, 0x00, 0x00, // len 0
                0x2a, 0x00, 0x00, 0x00, // sync 42
            ]
        );
    }
}
