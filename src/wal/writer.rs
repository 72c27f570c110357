// The WAL writer.
//
// A dedicated thread owns the active segment file, decoupled from the
// scheduler thread by a bounded inbox: when the inbox is full, commits
// suspend, which is the engine's backpressure. The loop batches
// whatever is pending (up to a ceiling), appends the rows with one
// gather write each, optionally lingers to coalesce more commits, runs
// one fdatasync for the whole batch, then acknowledges every row.
//
// A syscall error fails the entire batch: every request in it is
// nacked and the panic flag is raised; the scheduler side treats that
// as fatal. Segments rotate at the configured row cap; a new segment
// keeps the `.inprogress` name until its first successful fsync.

use std::fs;
use std::io::{IoSlice, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::error::{DbError, Result};
use crate::wal::dir::segment_path;
use crate::wal::row::{Row, EOF_MARKER};
use crate::wal::{file_header, INPROGRESS_SUFFIX, XLOG_MAGIC, XLOG_SUFFIX};

/// Batch ceiling per fsync.
const BATCH_MAX: usize = 256;

pub struct WalRequest {
    pub lsn: i64,
    pub tag: u16,
    pub cookie: u64,
    /// Opcode, stored ahead of the body so replay can route it.
    pub op: u16,
    pub body: Vec<u8>,
    pub done: oneshot::Sender<bool>,
}

#[derive(Clone)]
pub struct WalConfig {
    pub dir: PathBuf,
    pub rows_per_wal: u32,
    pub fsync_delay: Duration,
}

pub struct WalWriter {
    tx: Option<mpsc::Sender<WalRequest>>,
    panicked: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WalWriter {
    pub fn start(config: WalConfig, inbox_size: usize) -> Result<WalWriter> {
        fs::create_dir_all(&config.dir)?;
        let (tx, rx) = mpsc::channel(inbox_size.max(1));
        let panicked = Arc::new(AtomicBool::new(false));
        let flag = panicked.clone();
        let thread = thread::Builder::new()
            .name("wal-writer".into())
            .spawn(move || writer_loop(rx, config, flag))?;
        Ok(WalWriter {
            tx: Some(tx),
            panicked,
            thread: Some(thread),
        })
    }

    /// Handle for submitting rows; `send` suspends when the inbox is
    /// full.
    pub fn sender(&self) -> mpsc::Sender<WalRequest> {
        self.tx.as_ref().expect("writer running").clone()
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Close the inbox and wait for the writer to finalize the active
    /// segment.
    pub fn shutdown(mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Segment {
    file: fs::File,
    inprogress_path: PathBuf,
    final_path: PathBuf,
    rows: u32,
    renamed: bool,
}

impl Segment {
    fn create(config: &WalConfig, first_lsn: i64) -> std::io::Result<Segment> {
        let final_path = segment_path(&config.dir, first_lsn, XLOG_SUFFIX);
        let inprogress_path =
            PathBuf::from(format!("{}{INPROGRESS_SUFFIX}", final_path.display()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&inprogress_path)?;
        file.write_all(file_header(XLOG_MAGIC).as_bytes())?;
        info!(segment = %final_path.display(), "opened WAL segment");
        Ok(Segment {
            file,
            inprogress_path,
            final_path,
            rows: 0,
            renamed: false,
        })
    }

    fn append(&mut self, row: &Row) -> std::io::Result<()> {
        let frame = row.to_bytes();
        // One gather write per row: libc cuts this into as few
        // syscalls as it can.
        let mut written = 0;
        while written < frame.len() {
            let iov = [IoSlice::new(&frame[written..])];
            let n = self.file.write_vectored(&iov)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write to WAL segment",
                ));
            }
            written += n;
        }
        self.rows += 1;
        Ok(())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()?;
        if !self.renamed {
            fs::rename(&self.inprogress_path, &self.final_path)?;
            self.renamed = true;
        }
        Ok(())
    }

    fn finalize(mut self) -> std::io::Result<()> {
        self.file.write_all(&EOF_MARKER.to_le_bytes())?;
        self.sync()?;
        info!(segment = %self.final_path.display(), rows = self.rows, "closed WAL segment");
        Ok(())
    }
}

fn now_tm() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn writer_loop(
    mut rx: mpsc::Receiver<WalRequest>,
    config: WalConfig,
    panicked: Arc<AtomicBool>,
) {
    let mut segment: Option<Segment> = None;

    while let Some(first) = rx.blocking_recv() {
        let mut batch = vec![first];
        while batch.len() < BATCH_MAX {
            match rx.try_recv() {
                Ok(req) => batch.push(req),
                Err(_) => break,
            }
        }

        match write_batch(&mut segment, &config, &batch) {
            Ok(()) => {
                for req in batch {
                    let _ = req.done.send(true);
                }
            }
            Err(e) => {
                error!(error = %e, "WAL batch failed");
                panicked.store(true, Ordering::Relaxed);
                // The staged segment state is unreliable; drop it so
                // the next batch starts a fresh file.
                segment = None;
                for req in batch {
                    let _ = req.done.send(false);
                }
            }
        }
    }

    if let Some(segment) = segment.take() {
        if let Err(e) = segment.finalize() {
            error!(error = %e, "failed to finalize WAL segment on shutdown");
        }
    }
}

fn write_batch(
    segment: &mut Option<Segment>,
    config: &WalConfig,
    batch: &[WalRequest],
) -> std::io::Result<()> {
    for req in batch {
        if segment.is_none() {
            *segment = Some(Segment::create(config, req.lsn)?);
        }
        let mut body = Vec::with_capacity(2 + req.body.len());
        body.extend_from_slice(&req.op.to_le_bytes());
        body.extend_from_slice(&req.body);
        let row = Row::new(req.lsn, now_tm(), req.tag, req.cookie, &body);
        let active = segment.as_mut().unwrap();
        active.append(&row)?;
        if active.rows >= config.rows_per_wal {
            segment.take().unwrap().finalize()?;
        }
    }

    if !config.fsync_delay.is_zero() {
        thread::sleep(config.fsync_delay);
    }
    if let Some(active) = segment.as_mut() {
        active.sync()?;
    }
    Ok(())
}

/// Convenience used by the engine: submit one row and wait for the
/// writer's verdict. The sender handle is consumed and released before
/// the ack wait, so a shutting-down writer sees its inbox close as
/// soon as every pending send has landed.
pub async fn submit(
    sender: mpsc::Sender<WalRequest>,
    lsn: i64,
    tag: u16,
    cookie: u64,
    op: u16,
    body: Vec<u8>,
) -> Result<()> {
    let (done, ack) = oneshot::channel();
    let sent = sender
        .send(WalRequest {
            lsn,
            tag,
            cookie,
            op,
            body,
            done,
        })
        .await;
    drop(sender);
    sent.map_err(|_| DbError::WalFailure)?;
    match ack.await {
        Ok(true) => Ok(()),
        _ => Err(DbError::WalFailure),
    }
}
