// Fiber I/O: blocking-style socket helpers that suspend the calling
// fiber until the descriptor is ready. Partial reads and writes loop
// internally; the helpers return only on completion or a hard error.

use std::io::IoSlice;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DbError, Result};

/// Read until `buf` holds at least `needed` bytes. Bytes already in
/// `buf` count; a clean EOF before the target is `ConnectionClosed`.
pub async fn bread<S>(stream: &mut S, buf: &mut BytesMut, needed: usize) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < needed {
        buf.reserve(needed - buf.len());
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(DbError::ConnectionClosed);
        }
    }
    Ok(())
}

/// Gather-write every slice in order, to completion.
pub async fn sendv<S>(stream: &mut S, iov: &[&[u8]]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut slices: Vec<&[u8]> = iov.iter().copied().filter(|s| !s.is_empty()).collect();
    while !slices.is_empty() {
        let bufs: Vec<IoSlice<'_>> = slices.iter().map(|s| IoSlice::new(s)).collect();
        let mut written = stream.write_vectored(&bufs).await?;
        if written == 0 {
            return Err(DbError::ConnectionClosed);
        }
        while written > 0 {
            if written >= slices[0].len() {
                written -= slices[0].len();
                slices.remove(0);
            } else {
                slices[0] = &slices[0][written..];
                written = 0;
            }
        }
    }
    Ok(())
}

pub async fn write_all<S>(stream: &mut S, data: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn bread_accumulates_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            client.write_all(b"0123456789abcdef").await.unwrap();
        });
        let mut buf = BytesMut::new();
        bread(&mut server, &mut buf, 16).await.unwrap();
        assert_eq!(&buf[..], b"0123456789abcdef");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn bread_reports_eof() {
        let (client, mut server) = tokio::io::duplex(8);
        drop(client);
        let mut buf = BytesMut::new();
        assert!(matches!(
            bread(&mut server, &mut buf, 4).await,
            Err(DbError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn sendv_writes_all_slices() {
        let (mut client, mut server) = tokio::io::duplex(4);
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            bread(&mut server, &mut buf, 11).await.unwrap();
            buf
        });
        sendv(&mut client, &[b"head", b"", b"body", b"end"]).await.unwrap();
        let got = reader.await.unwrap();
        assert_eq!(&got[..], b"headbodyend");
    }
}
