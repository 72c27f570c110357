// Crash recovery: rebuild in-memory state from the newest snapshot
// plus every WAL segment after it.
//
// Snapshot rows populate the indexes directly, from a source already
// known consistent. WAL rows re-enter the ordinary dispatch path with
// the recovery environment set, so each mutation runs through exactly
// the handler that produced it, minus the WAL write. A header CRC
// failure ends replay: that row and everything after it is discarded.
// A payload CRC failure ends replay cleanly or aborts startup,
// depending on `panic_on_wal_error`.

use std::fs;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::buf::BufExt;
use crate::engine::dispatch;
use crate::error::{DbError, Result};
use crate::memory::Region;
use crate::server::{ExecEnv, Server};
use crate::tuple::Tuple;
use crate::wal::dir::{self, SegmentEnd, Tailer};
use crate::wal::row::Row;
use crate::wal::{SNAP_MAGIC, SNAP_SUFFIX, SNAP_TAG, WAL_TAG, XLOG_MAGIC, XLOG_SUFFIX};

pub struct RecoverySummary {
    pub snapshot_lsn: i64,
    pub rows_replayed: u64,
}

pub async fn recover(server: &Rc<Server>) -> Result<RecoverySummary> {
    let (wal_dir, snap_dir, panic_on_snap, panic_on_wal) = {
        let cfg = server.cfg.borrow();
        (
            cfg.wal_dir.clone(),
            cfg.snap_dir.clone(),
            cfg.panic_on_snap_error,
            cfg.panic_on_wal_error,
        )
    };
    fs::create_dir_all(&wal_dir)?;
    fs::create_dir_all(&snap_dir)?;
    dir::cleanup_inprogress(&wal_dir)?;
    dir::cleanup_inprogress(&snap_dir)?;

    let mut snapshot_lsn = 0;
    let snap_lsns = dir::scan(&snap_dir, SNAP_SUFFIX)?;
    if let Some(&latest) = snap_lsns.last() {
        info!(lsn = latest, "loading snapshot");
        load_snapshot(server, latest, panic_on_snap)?;
        server.adopt_lsn(latest);
        server.confirm_lsn(latest);
        snapshot_lsn = latest;
    }

    let rows_replayed = replay_wal(server, panic_on_wal).await?;
    Ok(RecoverySummary {
        snapshot_lsn,
        rows_replayed,
    })
}

fn load_snapshot(server: &Rc<Server>, snap_lsn: i64, panic_on_error: bool) -> Result<()> {
    let path = dir::segment_path(&server.cfg.borrow().snap_dir, snap_lsn, SNAP_SUFFIX);
    let segment = dir::read_segment(&path, SNAP_MAGIC)?;
    if segment.end != SegmentEnd::Clean {
        if panic_on_error {
            return Err(DbError::BadChecksum("snapshot"));
        }
        warn!(end = ?segment.end, "snapshot did not end cleanly, loading what it holds");
    }

    let mut loaded = 0u64;
    for row in &segment.rows {
        let payload = row.payload()?;
        if payload.tag != SNAP_TAG {
            warn!(lsn = row.lsn, tag = payload.tag, "foreign row tag in snapshot");
            continue;
        }
        let mut body = payload.body;
        let space_id = body.read_u32_le()?;
        let field_count = body.read_u32_le()?;
        let data_size = body.read_u32_le()? as usize;
        let data = body.read_bytes(data_size)?;
        Tuple::validate_packed(&data, field_count)?;
        let tuple = Tuple::from_packed(field_count, Box::from(&data[..]));

        let space = server.spaces.get(space_id)?;
        space.primary().borrow_mut().replace(None, Some(&tuple))?;
        for secondary in space.secondaries() {
            secondary.borrow_mut().replace(None, Some(&tuple))?;
        }
        loaded += 1;
    }
    info!(tuples = loaded, "snapshot loaded");
    Ok(())
}

async fn replay_wal(server: &Rc<Server>, panic_on_error: bool) -> Result<u64> {
    let wal_dir = server.cfg.borrow().wal_dir.clone();
    let lsns = dir::scan(&wal_dir, XLOG_SUFFIX)?;
    if lsns.is_empty() {
        return Ok(0);
    }
    let confirmed = server.confirmed_lsn();
    let start = match dir::segment_containing(&lsns, confirmed + 1) {
        Some(start) => start,
        None => {
            warn!(
                first_segment = lsns[0],
                confirmed, "gap between snapshot and the first WAL segment"
            );
            lsns[0]
        }
    };

    let region = Region::new(server.slab.clone());
    let mut replayed = 0u64;
    let last_segment = *lsns.last().unwrap();

    for &seg in lsns.iter().filter(|&&s| s >= start) {
        let path = dir::segment_path(&wal_dir, seg, XLOG_SUFFIX);
        debug!(segment = %path.display(), "replaying");
        let segment = dir::read_segment(&path, XLOG_MAGIC)?;

        for row in &segment.rows {
            if row.lsn <= server.confirmed_lsn() {
                continue;
            }
            apply_row(server, &region, row).await?;
            region.reset();
            replayed += 1;
        }

        match segment.end {
            SegmentEnd::Clean => {}
            SegmentEnd::Truncated => {
                if seg != last_segment {
                    warn!(segment = %path.display(), "segment without EOF marker mid-log");
                }
            }
            SegmentEnd::BadHeaderCrc => {
                warn!(segment = %path.display(), "header CRC mismatch, discarding the rest of the log");
                return Ok(replayed);
            }
            SegmentEnd::BadDataCrc { lsn } => {
                if panic_on_error {
                    return Err(DbError::BadChecksum("WAL row"));
                }
                warn!(lsn, segment = %path.display(), "payload CRC mismatch, stopping replay");
                return Ok(replayed);
            }
        }
    }
    Ok(replayed)
}

/// Route one WAL row through the read-write handlers in recovery mode.
pub async fn apply_row(server: &Rc<Server>, region: &Region, row: &Row) -> Result<()> {
    let payload = row.payload()?;
    if payload.tag != WAL_TAG {
        warn!(lsn = row.lsn, tag = payload.tag, "foreign row tag in WAL, skipped");
        return Ok(());
    }
    let mut body = payload.body;
    let op = body.read_u16_le()?;
    let env = ExecEnv::recovery(row.lsn);
    match dispatch::process_request(server, region, u32::from(op), body, &env).await {
        Ok(_) => Ok(()),
        // A row straddling the snapshot boundary can double-apply;
        // key conflicts there are benign.
        Err(e @ (DbError::TupleFound | DbError::TupleNotFound)) => {
            warn!(lsn = row.lsn, error = %e, "replay skipped a row");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Follow mode: keep watching the WAL directory and apply rows as new
/// segments appear. Hot-standby nodes sharing a log directory sit in
/// this loop instead of serving writes.
pub async fn follow(server: Rc<Server>, rescan: Duration) {
    let wal_dir = server.cfg.borrow().wal_dir.clone();
    let mut tailer = Tailer::new(&wal_dir, server.confirmed_lsn() + 1);
    let region = Region::new(server.slab.clone());
    loop {
        match tailer.poll() {
            Ok(rows) => {
                for row in &rows {
                    if let Err(e) = apply_row(&server, &region, row).await {
                        warn!(lsn = row.lsn, error = %e, "follow apply failed");
                    }
                    region.reset();
                }
            }
            Err(e) => warn!(error = %e, "WAL directory rescan failed"),
        }
        if server.is_stopping() || crate::fiber::sleep(rescan).await.is_err() {
            return;
        }
    }
}
