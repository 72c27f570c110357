// Replication follower.
//
// Connect to the leader, announce the confirmed LSN, check the format
// version, then apply the row stream through the ordinary dispatch
// path. The environment pins each row's LSN and leaves the WAL write
// on: a follower logs what it applies, so its own recovery and its
// own downstream followers work unchanged. Ephemeral (`NOT_STORE`)
// operations skip the leader's WAL and therefore never appear here.
//
// A broken stream backs off with bounded, jittered exponential delay
// and reconnects from whatever LSN is confirmed by then.

use std::rc::Rc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::buf::BufExt;
use crate::error::{DbError, Result};
use crate::fiber;
use crate::memory::Region;
use crate::net::{bread, sendv};
use crate::server::{ExecEnv, Server};
use crate::wal::row::read_row_stream;
use crate::wal::{FORMAT_VERSION, WAL_TAG};

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(3);

pub async fn follow(server: Rc<Server>, source: String) {
    let mut backoff = BACKOFF_MIN;
    loop {
        if server.is_stopping() {
            return;
        }
        info!(leader = %source, lsn = server.confirmed_lsn(), "connecting to leader");
        match follow_once(&server, &source).await {
            Ok(()) => return,
            Err(DbError::Cancelled) => return,
            Err(e) => {
                warn!(leader = %source, error = %e, "replication stream broken");
            }
        }
        let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
        let pause = backoff + Duration::from_millis(jitter);
        if fiber::sleep(pause).await.is_err() {
            return;
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

async fn follow_once(server: &Rc<Server>, source: &str) -> Result<()> {
    let mut stream = tokio::net::TcpStream::connect(source).await?;
    let confirmed = server.confirmed_lsn();
    sendv(&mut stream, &[&(confirmed as u64).to_le_bytes()]).await?;

    let mut rbuf = crate::buf::new_buf();
    bread(&mut stream, &mut rbuf, 4).await?;
    let version = rbuf.read_u32_le()?;
    if version != FORMAT_VERSION {
        return Err(DbError::WrongVersion(version));
    }
    info!(leader = %source, "replication stream established");

    let region = Region::new(server.slab.clone());
    loop {
        let row = read_row_stream(&mut stream, &mut rbuf).await?;
        if server.is_stopping() {
            return Ok(());
        }
        if row.lsn <= server.confirmed_lsn() {
            continue;
        }
        if let Err(e) = apply_row(server, &region, &row).await {
            // Both sides apply the same log deterministically; a row
            // that fails here means the replicas have diverged.
            error!(lsn = row.lsn, error = %e, "replicated row failed to apply, stopping");
            server.request_stop(crate::server::EXIT_PANIC);
            return Ok(());
        }
        region.reset();
    }
}

async fn apply_row(server: &Rc<Server>, region: &Region, row: &crate::wal::Row) -> Result<()> {
    let payload = row.payload()?;
    if payload.tag != WAL_TAG {
        warn!(lsn = row.lsn, tag = payload.tag, "foreign row tag in stream, skipped");
        return Ok(());
    }
    let mut body = payload.body;
    let op = body.read_u16_le()?;
    let env = ExecEnv::replication(row.lsn, payload.cookie);
    crate::engine::dispatch::process_request(server, region, u32::from(op), body, &env).await?;
    Ok(())
}
