// Segment directory handling. A segment file is named after the first
// LSN it contains, zero-padded to twenty digits; a file still being
// written carries the `.inprogress` suffix until its first successful
// fsync.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tracing::{info, warn};

use crate::error::{DbError, Result};
use crate::wal::row::{read_row, ReadOutcome, Row};
use crate::wal::INPROGRESS_SUFFIX;

pub fn segment_name(lsn: i64, suffix: &str) -> String {
    format!("{lsn:020}.{suffix}")
}

pub fn segment_path(dir: &Path, lsn: i64, suffix: &str) -> PathBuf {
    dir.join(segment_name(lsn, suffix))
}

/// Starting LSNs of every finished segment in `dir`, ascending.
pub fn scan(dir: &Path, suffix: &str) -> Result<Vec<i64>> {
    let mut lsns = Vec::new();
    if !dir.exists() {
        return Ok(lsns);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(&format!(".{suffix}")) {
            if let Ok(lsn) = stem.parse::<i64>() {
                lsns.push(lsn);
            }
        }
    }
    lsns.sort_unstable();
    Ok(lsns)
}

/// Remove leftover zero-length `.inprogress` files; a non-empty one is
/// kept for inspection but never replayed.
pub fn cleanup_inprogress(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(INPROGRESS_SUFFIX) {
            continue;
        }
        if entry.metadata()?.len() == 0 {
            info!(file = %entry.path().display(), "removing empty in-progress segment");
            fs::remove_file(entry.path())?;
        } else {
            warn!(file = %entry.path().display(), "leaving non-empty in-progress segment");
        }
    }
    Ok(())
}

/// The segment that may contain `lsn`: the greatest start LSN at or
/// below it.
pub fn segment_containing(lsns: &[i64], lsn: i64) -> Option<i64> {
    lsns.iter().copied().filter(|&start| start <= lsn).next_back()
}

/// How a segment read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEnd {
    /// EOF marker present: the segment was closed cleanly.
    Clean,
    /// File ended without the marker (dirty shutdown); rows up to the
    /// last valid one were returned.
    Truncated,
    /// A header CRC mismatch cut the read short.
    BadHeaderCrc,
    /// A payload CRC mismatch on the row after the last returned one.
    BadDataCrc { lsn: i64 },
}

pub struct SegmentRows {
    pub rows: Vec<Row>,
    pub end: SegmentEnd,
}

/// Read a whole segment: validate the text preamble, then collect rows
/// until the EOF marker, a CRC failure, or the end of the file.
pub fn read_segment(path: &Path, magic: &str) -> Result<SegmentRows> {
    let mut file = fs::File::open(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let header = crate::wal::file_header(magic);
    if !contents.starts_with(header.as_bytes()) {
        return Err(DbError::IllegalParams("bad segment file header"));
    }
    let mut buf = BytesMut::from(&contents[header.len()..]);

    let mut rows = Vec::new();
    let end = loop {
        match read_row(&mut buf) {
            ReadOutcome::Row(row) => rows.push(row),
            ReadOutcome::Eof => break SegmentEnd::Clean,
            ReadOutcome::NeedMore => break SegmentEnd::Truncated,
            ReadOutcome::BadHeaderCrc => break SegmentEnd::BadHeaderCrc,
            ReadOutcome::BadDataCrc { lsn } => break SegmentEnd::BadDataCrc { lsn },
        }
    };
    Ok(SegmentRows { rows, end })
}

/// Cursor over a WAL directory, delivering durable rows in LSN order.
/// Only finished (renamed) segments are visible, so everything a
/// tailer yields has been fsynced at least once. Lenient about damaged
/// segments: it reads what it can and moves on; strict CRC policy
/// belongs to startup recovery.
pub struct Tailer {
    dir: PathBuf,
    next_lsn: i64,
}

impl Tailer {
    /// Tail `dir` starting at rows with `lsn >= next_lsn`.
    pub fn new(dir: &Path, next_lsn: i64) -> Tailer {
        Tailer {
            dir: dir.to_path_buf(),
            next_lsn: next_lsn.max(1),
        }
    }

    pub fn next_lsn(&self) -> i64 {
        self.next_lsn
    }

    /// Rows that have appeared since the last poll.
    pub fn poll(&mut self) -> Result<Vec<Row>> {
        let lsns = scan(&self.dir, crate::wal::XLOG_SUFFIX)?;
        if lsns.is_empty() {
            return Ok(Vec::new());
        }
        let start = segment_containing(&lsns, self.next_lsn).unwrap_or(lsns[0]);
        let mut out = Vec::new();
        for &seg in lsns.iter().filter(|&&s| s >= start) {
            let path = segment_path(&self.dir, seg, crate::wal::XLOG_SUFFIX);
            let segment = match read_segment(&path, crate::wal::XLOG_MAGIC) {
                Ok(segment) => segment,
                Err(e) => {
                    warn!(segment = %path.display(), error = %e, "unreadable segment while tailing");
                    continue;
                }
            };
            if !matches!(segment.end, SegmentEnd::Clean | SegmentEnd::Truncated) {
                warn!(segment = %path.display(), end = ?segment.end, "damaged segment while tailing");
            }
            for row in segment.rows {
                if row.lsn >= self.next_lsn {
                    self.next_lsn = row.lsn + 1;
                    out.push(row);
                }
            }
        }
        Ok(out)
    }
}
