// Row framing shared by WAL segments, snapshots, and the replication
// stream.
//
// A row is: a 4-byte marker, a 28-byte header {header_crc32c, lsn:i64,
// tm:f64, len:u32, data_crc32c:u32}, then `len` payload bytes. The
// header CRC covers the 24 header bytes after itself; the data CRC
// covers the payload. CRC32-C throughout, hardware-accelerated where
// the CPU offers it; every participant must use the same polynomial.
// A cleanly closed file ends with the EOF marker.

use bytes::{Buf, BufMut, BytesMut};

use crate::buf::BufExt;
use crate::error::{DbError, Result};

pub const ROW_MARKER: u32 = 0xba0b_abed;
pub const EOF_MARKER: u32 = 0xffff_ffff;
pub const ROW_HEADER_SIZE: usize = 28;

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub lsn: i64,
    /// Seconds since the epoch at append time.
    pub tm: f64,
    /// Payload: tag, cookie, then tag-specific bytes.
    pub data: Vec<u8>,
}

/// Parsed payload prefix common to every row.
#[derive(Debug, Clone)]
pub struct RowPayload {
    pub tag: u16,
    pub cookie: u64,
    pub body: BytesMut,
}

impl Row {
    pub fn new(lsn: i64, tm: f64, tag: u16, cookie: u64, body: &[u8]) -> Row {
        let mut data = Vec::with_capacity(10 + body.len());
        data.extend_from_slice(&tag.to_le_bytes());
        data.extend_from_slice(&cookie.to_le_bytes());
        data.extend_from_slice(body);
        Row { lsn, tm, data }
    }

    pub fn payload(&self) -> Result<RowPayload> {
        let mut buf = BytesMut::from(&self.data[..]);
        Ok(RowPayload {
            tag: buf.read_u16_le()?,
            cookie: buf.read_u64_le()?,
            body: buf,
        })
    }

    /// Marker + header + payload.
    pub fn frame_len(&self) -> usize {
        4 + ROW_HEADER_SIZE + self.data.len()
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(self.frame_len());
        out.put_u32_le(ROW_MARKER);
        let mut header = [0u8; ROW_HEADER_SIZE - 4];
        header[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        header[8..16].copy_from_slice(&self.tm.to_le_bytes());
        header[16..20].copy_from_slice(&(self.data.len() as u32).to_le_bytes());
        header[20..24].copy_from_slice(&crc32c::crc32c(&self.data).to_le_bytes());
        out.put_u32_le(crc32c::crc32c(&header));
        out.put_slice(&header);
        out.put_slice(&self.data);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.frame_len());
        self.encode(&mut out);
        out
    }
}

/// Outcome of pulling the next row off a byte stream.
#[derive(Debug)]
pub enum ReadOutcome {
    Row(Row),
    /// Clean end-of-file marker.
    Eof,
    /// Out of bytes before a complete row; more may arrive later.
    NeedMore,
    /// Header CRC mismatch: this row and everything after it is
    /// unreadable.
    BadHeaderCrc,
    /// Header parsed but the payload failed its CRC.
    BadDataCrc { lsn: i64 },
}

/// Try to read one framed row from the front of `buf`. Consumes the
/// frame on success; leaves `buf` untouched when more bytes are needed.
/// Garbage before the next marker is skipped byte by byte.
pub fn read_row(buf: &mut BytesMut) -> ReadOutcome {
    loop {
        if buf.remaining() < 4 {
            return ReadOutcome::NeedMore;
        }
        let marker = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if marker == EOF_MARKER {
            buf.advance(4);
            return ReadOutcome::Eof;
        }
        if marker != ROW_MARKER {
            buf.advance(1);
            continue;
        }
        if buf.remaining() < 4 + ROW_HEADER_SIZE {
            return ReadOutcome::NeedMore;
        }
        let header = &buf[4..4 + ROW_HEADER_SIZE];
        let header_crc = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if crc32c::crc32c(&header[4..]) != header_crc {
            return ReadOutcome::BadHeaderCrc;
        }
        let lsn = i64::from_le_bytes(header[4..12].try_into().unwrap());
        let tm = f64::from_le_bytes(header[12..20].try_into().unwrap());
        let len = u32::from_le_bytes(header[20..24].try_into().unwrap()) as usize;
        let data_crc = u32::from_le_bytes(header[24..28].try_into().unwrap());
        if buf.remaining() < 4 + ROW_HEADER_SIZE + len {
            return ReadOutcome::NeedMore;
        }
        buf.advance(4 + ROW_HEADER_SIZE);
        let data = buf.split_to(len).to_vec();
        if crc32c::crc32c(&data) != data_crc {
            return ReadOutcome::BadDataCrc { lsn };
        }
        return ReadOutcome::Row(Row { lsn, tm, data });
    }
}

/// Read a framed row from a socket-backed stream, growing `buf` as
/// needed. CRC failures on a live stream are hard errors.
pub async fn read_row_stream<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Row>
where
    S: tokio::io::AsyncRead + Unpin,
{
    loop {
        match read_row(buf) {
            ReadOutcome::Row(row) => return Ok(row),
            ReadOutcome::Eof => continue,
            ReadOutcome::NeedMore => {
                crate::net::bread(stream, buf, buf.len() + 1).await?;
            }
            ReadOutcome::BadHeaderCrc => return Err(DbError::BadChecksum("row header")),
            ReadOutcome::BadDataCrc { .. } => return Err(DbError::BadChecksum("row payload")),
        }
    }
}
