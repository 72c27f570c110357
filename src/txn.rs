// Transaction lifecycle: redo bytes for the WAL, one undo triple for
// the indexes.
//
// By the time a transaction commits, the primary index already points
// at the new tuple (staged under the space latch, flagged GHOST).
// Commit stamps an LSN, ships the redo row to the WAL writer and
// suspends until the row is durable; only then do secondary indexes
// follow and the ghost flag clears. Rollback swaps the primary back.
//
// Cancellation during the WAL wait is deferred: the row is in flight
// and completes normally; the cancel mark is observed afterwards.

use std::rc::Rc;

use crate::error::{DbError, Result};
use crate::server::{ExecEnv, Server};
use crate::space::Space;
use crate::tuple::{TupleRef, GHOST, WAL_WAIT};

struct Undo {
    space: Rc<Space>,
    old: Option<TupleRef>,
    new: Option<TupleRef>,
}

pub struct Txn {
    op: u16,
    redo: Vec<u8>,
    undo: Option<Undo>,
    /// Suppresses the WAL write; the op stays ephemeral and followers
    /// never see it, since replication streams the WAL.
    not_store: bool,
}

impl Txn {
    pub fn begin(op: u16, not_store: bool) -> Txn {
        Txn {
            op,
            redo: Vec::new(),
            undo: None,
            not_store,
        }
    }

    /// Record the redo row body: the wire-format bytes of the mutation,
    /// byte-identical to what the client sent, so that replay re-enters
    /// the same handler with the same arguments.
    pub fn add_redo(&mut self, body: &[u8]) {
        self.redo.clear();
        self.redo.extend_from_slice(body);
    }

    /// Record the undo triple. The primary index has already been
    /// swapped to `new`; `new` carries the GHOST flag.
    pub fn add_undo(&mut self, space: Rc<Space>, old: Option<TupleRef>, new: Option<TupleRef>) {
        debug_assert!(self.undo.is_none(), "one undo triple per transaction");
        if let Some(new) = &new {
            debug_assert!(new.has_flag(GHOST));
            new.set_flag(WAL_WAIT);
        }
        self.undo = Some(Undo { space, old, new });
    }

    /// Commit: assign the LSN, wait for WAL durability, then settle
    /// the indexes. On WAL failure the staged mutation is rolled back
    /// and the error propagates to the caller.
    pub async fn commit(mut self, server: &Server, env: &ExecEnv) -> Result<()> {
        let undo = match self.undo.take() {
            Some(undo) => undo,
            // Read-only transaction: nothing to log or settle.
            None => return Ok(()),
        };

        if !self.not_store {
            let lsn = match env.fixed_lsn {
                Some(lsn) => server.adopt_lsn(lsn),
                None => server.next_lsn(),
            };
            if !env.recovery {
                let acked = server
                    .wal_write(lsn, env.cookie, self.op, std::mem::take(&mut self.redo))
                    .await;
                if !acked {
                    Self::rollback_undo(&undo);
                    return Err(DbError::WalFailure);
                }
            }
            server.confirm_lsn(lsn);
        }

        if let Some(new) = &undo.new {
            new.clear_flag(GHOST);
            new.clear_flag(WAL_WAIT);
        }
        for secondary in undo.space.secondaries() {
            secondary
                .borrow_mut()
                .replace(undo.old.as_ref(), undo.new.as_ref())
                .map_err(|e| DbError::Internal(format!("secondary index diverged: {e}")))?;
        }
        // Dropping `undo.old` releases the displaced tuple's reference.
        Ok(())
    }

    /// Roll back the staged primary-index swap and release the new
    /// tuple.
    pub fn rollback(mut self) {
        if let Some(undo) = self.undo.take() {
            Self::rollback_undo(&undo);
        }
    }

    fn rollback_undo(undo: &Undo) {
        let _swapped = undo
            .space
            .primary()
            .borrow_mut()
            .replace(undo.new.as_ref(), undo.old.as_ref());
        debug_assert!(_swapped.is_ok(), "undo swap cannot conflict");
        if let Some(new) = &undo.new {
            new.clear_flag(GHOST);
            new.clear_flag(WAL_WAIT);
        }
    }
}
