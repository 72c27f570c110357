// Replication relay: the leader half of the stream.
//
// One fiber per connected follower. Handshake: the follower sends the
// 8-byte LSN it has confirmed, the relay answers with the 4-byte
// format version, then streams framed WAL rows with LSN greater than
// the requested one forever. The relay reads finished segment files
// only, so everything it ships has been fsynced; at the head of the
// log it polls the directory for new segments.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::buf::BufExt;
use crate::error::{DbError, Result};
use crate::fiber;
use crate::net::{bread, sendv};
use crate::server::Server;
use crate::wal::dir::Tailer;
use crate::wal::FORMAT_VERSION;

const DIR_RESCAN_DELAY: Duration = Duration::from_millis(100);

pub async fn relay_loop(server: Rc<Server>, mut stream: TcpStream, peer: SocketAddr) {
    info!(%peer, "follower connected");
    match relay(&server, &mut stream).await {
        Ok(()) | Err(DbError::ConnectionClosed) => debug!(%peer, "follower disconnected"),
        Err(e) => warn!(%peer, error = %e, "relay failed"),
    }
}

async fn relay(server: &Rc<Server>, stream: &mut TcpStream) -> Result<()> {
    let mut rbuf = crate::buf::new_buf();
    bread(stream, &mut rbuf, 8).await?;
    let follower_lsn = rbuf.read_u64_le()? as i64;
    sendv(stream, &[&FORMAT_VERSION.to_le_bytes()]).await?;
    info!(follower_lsn, "streaming from LSN {}", follower_lsn + 1);

    let wal_dir = server.cfg.borrow().wal_dir.clone();
    let mut tailer = Tailer::new(&wal_dir, follower_lsn + 1);
    let mut frame = BytesMut::new();
    loop {
        let rows = tailer.poll()?;
        if rows.is_empty() {
            if server.is_stopping() {
                return Ok(());
            }
            fiber::sleep(DIR_RESCAN_DELAY).await?;
            continue;
        }
        for row in &rows {
            frame.clear();
            row.encode(&mut frame);
            sendv(stream, &[&frame]).await?;
        }
    }
}
