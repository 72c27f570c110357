// Snapshot writer.
//
// `save` pins a point-in-time image first: tuple handles are cloned
// out of every primary index before the first suspension point, so
// later writes cannot leak in. The image then streams to a tempfile in
// the background, throttled by `snap_io_rate_limit`, and the finished
// file is fsynced and renamed to `<confirmed_lsn>.snap` in one step.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tracing::info;

use crate::error::{DbError, Result};
use crate::fiber;
use crate::index::IteratorType;
use crate::server::Server;
use crate::tuple::{TupleRef, GHOST};
use crate::wal::dir::segment_path;
use crate::wal::row::{Row, EOF_MARKER};
use crate::wal::{file_header, DEFAULT_COOKIE, INPROGRESS_SUFFIX, SNAP_MAGIC, SNAP_SUFFIX, SNAP_TAG};

/// Write a snapshot of the current committed state. Returns the LSN
/// the snapshot is named after. Fails fast with `Busy` while another
/// snapshot is in flight.
pub async fn save(server: &Rc<Server>) -> Result<i64> {
    let _running = server.snap_latch.try_lock()?;
    let lsn = server.confirmed_lsn();
    let snap_dir = server.cfg.borrow().snap_dir.clone();
    let rate_limit = server.cfg.borrow().snap_io_rate_limit;
    fs::create_dir_all(&snap_dir)?;

    // Point-in-time image: no suspension between these clones.
    let mut image: Vec<(u32, Vec<TupleRef>)> = Vec::new();
    for space in server.spaces.all() {
        let tuples = space
            .primary()
            .borrow()
            .iterate(IteratorType::All, None)?
            .into_iter()
            .filter(|t| !t.has_flag(GHOST))
            .collect();
        image.push((space.id, tuples));
    }

    let final_path = segment_path(&snap_dir, lsn, SNAP_SUFFIX);
    let tmp_path = PathBuf::from(format!("{}{INPROGRESS_SUFFIX}", final_path.display()));
    if final_path.exists() {
        info!(lsn, "snapshot already present, skipping");
        return Ok(lsn);
    }

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(file_header(SNAP_MAGIC).as_bytes())?;

    let mut tuples_written = 0u64;
    let mut bytes_since_pause = 0u64;
    for (space_id, tuples) in &image {
        for tuple in tuples {
            let mut body = BytesMut::with_capacity(12 + tuple.bsize());
            body.put_u32_le(*space_id);
            body.put_u32_le(tuple.field_count());
            body.put_u32_le(tuple.bsize() as u32);
            body.put_slice(tuple.packed());
            let row = Row::new(lsn, 0.0, SNAP_TAG, DEFAULT_COOKIE, &body);
            let frame = row.to_bytes();
            file.write_all(&frame)?;
            tuples_written += 1;

            if rate_limit > 0 {
                bytes_since_pause += frame.len() as u64;
                if bytes_since_pause >= rate_limit {
                    bytes_since_pause = 0;
                    fiber::sleep(Duration::from_secs(1))
                        .await
                        .map_err(|_| DbError::Cancelled)?;
                }
            }
        }
    }

    file.write_all(&EOF_MARKER.to_le_bytes())?;
    file.sync_data()?;
    drop(file);
    fs::rename(&tmp_path, &final_path)?;
    info!(lsn, tuples = tuples_written, file = %final_path.display(), "snapshot saved");
    Ok(lsn)
}
