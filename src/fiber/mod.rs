// Fibers: cooperative tasks on a single-threaded runtime.
//
// The core runs on a tokio current-thread runtime inside a LocalSet;
// a fiber is a named local task. Every suspension point is an
// `.await`; between awaits a fiber owns the thread, so core state
// needs no atomics. Cancellation is cooperative: `cancel` marks the
// fiber and wakes it, and the mark is observed at the next suspension
// point as `DbError::Cancelled`, unwinding through drop guards.

pub mod ipc;

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{DbError, Result};

tokio::task_local! {
    static CURRENT: Rc<FiberCtx>;
}

thread_local! {
    static NEXT_FID: Cell<u32> = const { Cell::new(1) };
}

pub struct FiberCtx {
    fid: u32,
    name: String,
    /// Client endpoint identifier, carried into WAL rows.
    cookie: Cell<u64>,
    cancelled: Cell<bool>,
    wakeup: Notify,
}

impl FiberCtx {
    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cookie(&self) -> u64 {
        self.cookie.get()
    }

    pub fn set_cookie(&self, cookie: u64) {
        self.cookie.set(cookie);
    }
}

/// Handle to a spawned fiber.
pub struct Fiber {
    ctx: Rc<FiberCtx>,
    join: JoinHandle<()>,
}

impl Fiber {
    pub fn fid(&self) -> u32 {
        self.ctx.fid
    }

    /// Mark the fiber cancelled and wake it. The fiber observes the
    /// mark at its next suspension point.
    pub fn cancel(&self) {
        self.ctx.cancelled.set(true);
        self.ctx.wakeup.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Spawn a named fiber on the current LocalSet.
pub fn spawn<F>(name: &str, fut: F) -> Fiber
where
    F: Future<Output = ()> + 'static,
{
    let fid = NEXT_FID.with(|n| {
        let fid = n.get();
        n.set(fid.wrapping_add(1).max(1));
        fid
    });
    let ctx = Rc::new(FiberCtx {
        fid,
        name: name.to_string(),
        cookie: Cell::new(0),
        cancelled: Cell::new(false),
        wakeup: Notify::new(),
    });
    let scoped = CURRENT.scope(ctx.clone(), fut);
    let join = tokio::task::spawn_local(scoped);
    Fiber { ctx, join }
}

/// The calling fiber's context, when running inside one.
pub fn current() -> Option<Rc<FiberCtx>> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// Fails once the fiber has been cancelled.
pub fn check_cancel() -> Result<()> {
    match current() {
        Some(ctx) if ctx.cancelled.get() => Err(DbError::Cancelled),
        _ => Ok(()),
    }
}

/// Run `fut` as a suspension point: completes with the future, or with
/// `Cancelled` if the fiber is cancelled first.
pub async fn cancellable<F>(fut: F) -> Result<F::Output>
where
    F: Future,
{
    let ctx = match current() {
        Some(ctx) => ctx,
        None => return Ok(fut.await),
    };
    if ctx.cancelled.get() {
        return Err(DbError::Cancelled);
    }
    tokio::select! {
        out = fut => Ok(out),
        // The only waker is cancel(), which sets the mark first.
        _ = ctx.wakeup.notified() => Err(DbError::Cancelled),
    }
}

pub async fn sleep(duration: Duration) -> Result<()> {
    cancellable(tokio::time::sleep(duration)).await
}

/// Yield to the scheduler; the fiber re-queues at the tail of the
/// ready queue.
pub async fn yield_now() -> Result<()> {
    check_cancel()?;
    tokio::task::yield_now().await;
    check_cancel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn spawned_fibers_run_and_join() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let log = Rc::new(RefCell::new(Vec::new()));
                let log2 = log.clone();
                let fiber = spawn("worker", async move {
                    log2.borrow_mut().push(current().unwrap().name().to_string());
                });
                fiber.join().await;
                assert_eq!(log.borrow().as_slice(), ["worker"]);
            })
            .await;
    }

    #[tokio::test]
    async fn cancel_observed_at_suspension_point() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let outcome = Rc::new(Cell::new(None));
                let outcome2 = outcome.clone();
                let fiber = spawn("sleeper", async move {
                    let r = sleep(Duration::from_secs(3600)).await;
                    outcome2.set(Some(matches!(r, Err(DbError::Cancelled))));
                });
                yield_now().await.unwrap();
                fiber.cancel();
                fiber.join().await;
                assert_eq!(outcome.get(), Some(true));
            })
            .await;
    }

    #[tokio::test]
    async fn fifo_wakeup_order() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let order = Rc::new(RefCell::new(Vec::new()));
                let mut fibers = Vec::new();
                for i in 0..4 {
                    let order = order.clone();
                    fibers.push(spawn("ordered", async move {
                        order.borrow_mut().push(i);
                    }));
                }
                for fiber in fibers {
                    fiber.join().await;
                }
                assert_eq!(order.borrow().as_slice(), [0, 1, 2, 3]);
            })
            .await;
    }
}
