// The server: the single global-state structure.
//
// One instance exists per process, created at startup and torn down at
// shutdown. It owns the space registry, the LSN state, the WAL-writer
// handle, the stored-procedure registry and the request counters, and
// is threaded as an explicit `Rc<Server>` through everything
// non-trivial. The core runs on one thread; cells and RefCells are the
// only interior mutability it needs.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::dispatch;
use crate::engine::proc::ProcRegistry;
use crate::error::{DbError, Result};
use crate::fiber;
use crate::fiber::ipc::Latch;
use crate::memory::SlabCache;
use crate::space::SpaceSet;
use crate::stat::Stat;
use crate::wal::writer::{self, WalConfig, WalWriter};
use crate::wal::{DEFAULT_COOKIE, WAL_TAG};
use crate::{admin, recovery, repl, snapshot};

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_STARTUP: i32 = 2;
pub const EXIT_PANIC: i32 = 3;

/// Consecutive WAL failures tolerated before the process gives up.
const WAL_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadWrite,
    ReadOnly,
}

/// Execution environment of one request: who it came from and how it
/// interacts with the log.
#[derive(Debug, Clone, Copy)]
pub struct ExecEnv {
    /// Replay from the local log: suppress the WAL write.
    pub recovery: bool,
    /// Bypass the read-only role check (recovery and replication
    /// apply mutations on followers).
    pub privileged: bool,
    pub cookie: u64,
    /// LSN dictated by the log being applied, instead of a fresh one.
    pub fixed_lsn: Option<i64>,
}

impl ExecEnv {
    pub fn client(cookie: u64) -> ExecEnv {
        ExecEnv {
            recovery: false,
            privileged: false,
            cookie,
            fixed_lsn: None,
        }
    }

    pub fn recovery(lsn: i64) -> ExecEnv {
        ExecEnv {
            recovery: true,
            privileged: true,
            cookie: DEFAULT_COOKIE,
            fixed_lsn: Some(lsn),
        }
    }

    /// A follower applying a row streamed from its leader: the row is
    /// written to the follower's own WAL under the leader's LSN.
    pub fn replication(lsn: i64, cookie: u64) -> ExecEnv {
        ExecEnv {
            recovery: false,
            privileged: true,
            cookie,
            fixed_lsn: Some(lsn),
        }
    }
}

pub struct Server {
    pub cfg: RefCell<Config>,
    pub spaces: SpaceSet,
    pub stat: Stat,
    pub slab: Arc<SlabCache>,
    pub procs: ProcRegistry,
    /// One snapshot at a time; a second `save snapshot` fails fast.
    pub snap_latch: Latch,

    lsn: Cell<i64>,
    confirmed_lsn: Cell<i64>,
    mode: Cell<Mode>,
    wal: RefCell<Option<WalWriter>>,
    wal_failures: Cell<u32>,

    stop_code: Cell<Option<i32>>,
    shutdown: Notify,

    client_addr: Cell<Option<SocketAddr>>,
    admin_addr: Cell<Option<SocketAddr>>,
    replication_addr: Cell<Option<SocketAddr>>,
}

impl Server {
    pub fn new(cfg: Config) -> Rc<Server> {
        let slab = if cfg.memory_limit > 0 {
            SlabCache::with_limit(cfg.memory_limit)
        } else {
            SlabCache::new()
        };
        Rc::new(Server {
            spaces: SpaceSet::from_config(&cfg.spaces),
            stat: Stat::new(),
            slab,
            procs: ProcRegistry::new(),
            snap_latch: Latch::new(),
            cfg: RefCell::new(cfg),
            lsn: Cell::new(0),
            confirmed_lsn: Cell::new(0),
            mode: Cell::new(Mode::ReadWrite),
            wal: RefCell::new(None),
            wal_failures: Cell::new(0),
            stop_code: Cell::new(None),
            shutdown: Notify::new(),
            client_addr: Cell::new(None),
            admin_addr: Cell::new(None),
            replication_addr: Cell::new(None),
        })
    }

    // -- LSN bookkeeping ---------------------------------------------------

    pub fn lsn(&self) -> i64 {
        self.lsn.get()
    }

    pub fn confirmed_lsn(&self) -> i64 {
        self.confirmed_lsn.get()
    }

    pub fn next_lsn(&self) -> i64 {
        let lsn = self.lsn.get() + 1;
        self.lsn.set(lsn);
        lsn
    }

    /// Adopt an LSN dictated by a log being applied.
    pub fn adopt_lsn(&self, lsn: i64) -> i64 {
        self.lsn.set(self.lsn.get().max(lsn));
        lsn
    }

    pub fn confirm_lsn(&self, lsn: i64) {
        self.confirmed_lsn.set(self.confirmed_lsn.get().max(lsn));
    }

    // -- Role --------------------------------------------------------------

    pub fn mode(&self) -> Mode {
        self.mode.get()
    }

    /// Swap the active dispatch table. Takes effect for the next
    /// request on every connection; requests already past routing run
    /// to completion.
    pub fn set_mode(&self, mode: Mode) {
        if self.mode.replace(mode) != mode {
            info!(?mode, "switched dispatch mode");
        }
    }

    // -- WAL ---------------------------------------------------------------

    pub fn start_wal_writer(&self) -> Result<()> {
        let cfg = self.cfg.borrow();
        let writer = WalWriter::start(
            WalConfig {
                dir: cfg.wal_dir.clone(),
                rows_per_wal: cfg.rows_per_wal,
                fsync_delay: cfg.wal_fsync_delay,
            },
            cfg.wal_writer_inbox_size,
        )?;
        drop(cfg);
        *self.wal.borrow_mut() = Some(writer);
        Ok(())
    }

    /// Ship one redo row to the writer and wait for durability.
    pub async fn wal_write(&self, lsn: i64, cookie: u64, op: u16, body: Vec<u8>) -> bool {
        let sender = match self.wal.borrow().as_ref() {
            Some(writer) => writer.sender(),
            None => return false,
        };
        let ok = writer::submit(sender, lsn, WAL_TAG, cookie, op, body)
            .await
            .is_ok();
        if ok {
            self.wal_failures.set(0);
        } else {
            let streak = self.wal_failures.get() + 1;
            self.wal_failures.set(streak);
            if streak >= WAL_FAILURE_LIMIT {
                error!(streak, "WAL keeps failing, shutting down");
                self.request_stop(EXIT_PANIC);
            }
        }
        ok
    }

    // -- Lifecycle ---------------------------------------------------------

    pub fn request_stop(&self, code: i32) {
        if self.stop_code.get().is_none() {
            self.stop_code.set(Some(code));
        }
        self.shutdown.notify_waiters();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_code.get().is_some()
    }

    pub async fn wait_shutdown(&self) -> i32 {
        loop {
            if let Some(code) = self.stop_code.get() {
                return code;
            }
            self.shutdown.notified().await;
        }
    }

    /// Tear down: close the WAL (EOF marker, final fsync) and release
    /// the writer thread.
    pub fn finalize(&self) {
        if let Some(writer) = self.wal.borrow_mut().take() {
            writer.shutdown();
        }
        info!(lsn = self.lsn.get(), "server stopped");
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr.get()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr.get()
    }

    pub fn replication_addr(&self) -> Option<SocketAddr> {
        self.replication_addr.get()
    }

    /// Recover local state and start every configured listener. Must
    /// run inside a LocalSet.
    pub async fn startup(self: &Rc<Server>) -> Result<()> {
        let summary = recovery::recover(self).await?;
        info!(
            snapshot_lsn = summary.snapshot_lsn,
            rows = summary.rows_replayed,
            lsn = self.lsn(),
            "recovery complete"
        );

        self.start_wal_writer()?;

        let (listen_port, admin_port, replication_port, source) = {
            let cfg = self.cfg.borrow();
            (
                cfg.listen_port,
                cfg.admin_port,
                cfg.replication_port,
                cfg.replication_source.clone(),
            )
        };

        if let Some(source) = source {
            // A follower serves reads only; writes arrive via the
            // replication stream.
            self.set_mode(Mode::ReadOnly);
            let server = self.clone();
            fiber::spawn("replica", async move {
                repl::follower::follow(server, source).await;
            });
        } else {
            self.set_mode(Mode::ReadWrite);
        }

        if listen_port != 0 {
            let listener = Self::bind(listen_port).await?;
            self.client_addr.set(Some(listener.local_addr()?));
            let server = self.clone();
            fiber::spawn("iproto-acceptor", async move {
                server.accept_loop(listener, AcceptKind::Client).await;
            });
        }
        if admin_port != 0 {
            let listener = Self::bind(admin_port).await?;
            self.admin_addr.set(Some(listener.local_addr()?));
            let server = self.clone();
            fiber::spawn("admin-acceptor", async move {
                server.accept_loop(listener, AcceptKind::Admin).await;
            });
        }
        if replication_port != 0 {
            let listener = Self::bind(replication_port).await?;
            self.replication_addr.set(Some(listener.local_addr()?));
            let server = self.clone();
            fiber::spawn("relay-acceptor", async move {
                server.accept_loop(listener, AcceptKind::Relay).await;
            });
        }

        #[cfg(unix)]
        {
            let server = self.clone();
            fiber::spawn("signals", async move {
                server.signal_loop().await;
            });
        }

        info!(
            client = ?self.client_addr.get(),
            admin = ?self.admin_addr.get(),
            replication = ?self.replication_addr.get(),
            "listening"
        );
        Ok(())
    }

    async fn bind(port: u16) -> Result<TcpListener> {
        Ok(TcpListener::bind(("0.0.0.0", port)).await?)
    }

    async fn accept_loop(self: Rc<Server>, listener: TcpListener, kind: AcceptKind) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        match kind {
                            AcceptKind::Client => {
                                fiber::spawn("iproto", async move {
                                    dispatch::client_loop(server, stream, peer).await;
                                });
                            }
                            AcceptKind::Admin => {
                                fiber::spawn("admin", async move {
                                    admin::admin_loop(server, stream, peer).await;
                                });
                            }
                            AcceptKind::Relay => {
                                fiber::spawn("relay", async move {
                                    repl::leader::relay_loop(server, stream, peer).await;
                                });
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        if fiber::sleep(std::time::Duration::from_millis(100)).await.is_err() {
                            break;
                        }
                    }
                },
            }
            if self.is_stopping() {
                break;
            }
        }
    }

    #[cfg(unix)]
    async fn signal_loop(self: Rc<Server>) {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install signal handlers");
                return;
            }
        };
        let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut hup = signal(SignalKind::hangup()).expect("SIGHUP handler");
        let mut usr1 = signal(SignalKind::user_defined1()).expect("SIGUSR1 handler");
        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("SIGTERM: shutting down");
                    self.request_stop(EXIT_OK);
                    break;
                }
                _ = int.recv() => {
                    info!("SIGINT: shutting down");
                    self.request_stop(EXIT_OK);
                    break;
                }
                _ = hup.recv() => {
                    info!("SIGHUP: reloading configuration");
                    if let Err(e) = self.cfg.borrow().check() {
                        warn!(error = %e, "configuration reload rejected");
                    }
                }
                _ = usr1.recv() => {
                    info!("SIGUSR1: saving snapshot");
                    let server = self.clone();
                    fiber::spawn("snapshot", async move {
                        if let Err(e) = snapshot::save(&server).await {
                            warn!(error = %e, "snapshot failed");
                        }
                    });
                }
            }
        }
    }

    /// Full lifecycle: startup, serve until a stop is requested, tear
    /// down. Returns the process exit code.
    pub async fn run(self: &Rc<Server>) -> i32 {
        if let Err(e) = self.cfg.borrow().check() {
            error!(error = %e, "bad configuration");
            return EXIT_CONFIG;
        }
        if let Err(e) = self.startup().await {
            error!(error = %e, "startup failed");
            return match e {
                DbError::BadChecksum(_) => EXIT_PANIC,
                _ => EXIT_STARTUP,
            };
        }
        let code = self.wait_shutdown().await;
        self.finalize();
        code
    }
}

#[derive(Clone, Copy)]
enum AcceptKind {
    Client,
    Admin,
    Relay,
}
