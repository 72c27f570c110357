// Request dispatch: one fiber per client socket, a serial
// read-decode-execute-reply loop.
//
// The routing table is a property of the server's role: read-write on
// a leader, read-only on a follower. The role is examined once per
// request at the routing point, so a swap takes effect at the next
// request boundary. Recovery and replication replay enter the same
// handlers with a privileged environment: role checks are bypassed and
// (for recovery) the WAL write is suppressed.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::engine::update;
use crate::error::{DbError, Result};
use crate::index::IteratorType;
use crate::memory::Region;
use crate::net::{bread, sendv};
use crate::proto::{
    self, ReplyBody, Request, RequestHeader, FLAG_ADD, FLAG_QUIET, FLAG_REPLACE,
    FLAG_RETURN_TUPLE, FLAG_NOT_STORE, MSG_PING, REQUEST_HEADER_SIZE,
};
use crate::server::{ExecEnv, Mode, Server};
use crate::space::Space;
use crate::tuple::{TupleRef, GHOST};
use crate::txn::Txn;

/// Client endpoint identifier carried into WAL rows.
fn peer_cookie(addr: &SocketAddr) -> u64 {
    match addr {
        SocketAddr::V4(v4) => {
            (u64::from(u32::from(*v4.ip())) << 32) | u64::from(v4.port())
        }
        SocketAddr::V6(v6) => {
            let octets = v6.ip().octets();
            let mut low = [0u8; 8];
            low.copy_from_slice(&octets[8..]);
            u64::from_le_bytes(low) ^ u64::from(v6.port())
        }
    }
}

/// Serve one client connection to completion.
pub async fn client_loop(server: Rc<Server>, mut stream: TcpStream, peer: SocketAddr) {
    let region = Region::new(server.slab.clone());
    let env = ExecEnv::client(peer_cookie(&peer));
    let mut rbuf = crate::buf::new_buf();
    info!(%peer, "client connected");

    loop {
        if let Err(e) = serve_one(&server, &region, &mut stream, &mut rbuf, &env).await {
            match e {
                DbError::ConnectionClosed => debug!(%peer, "client disconnected"),
                other => warn!(%peer, error = %other, "client connection dropped"),
            }
            break;
        }
        // Garbage-collect per request.
        region.reset();
    }
}

async fn serve_one(
    server: &Rc<Server>,
    region: &Region,
    stream: &mut TcpStream,
    rbuf: &mut BytesMut,
    env: &ExecEnv,
) -> Result<()> {
    bread(stream, rbuf, REQUEST_HEADER_SIZE).await?;
    let header = RequestHeader::read(rbuf)?;
    let body_len = header.len as usize;

    let readahead = server.cfg.borrow().readahead;
    if body_len > readahead {
        warn!(
            msg_code = header.msg_code,
            len = body_len,
            "request body exceeds the receive buffer, rejecting"
        );
        discard(stream, rbuf, body_len).await?;
        let reply = proto::encode_reply(
            header.msg_code,
            header.sync,
            DbError::IllegalParams("").ret_code(),
            &ReplyBody::Empty,
        );
        return sendv(stream, &[&reply]).await;
    }

    bread(stream, rbuf, body_len).await?;
    let body = rbuf.split_to(body_len);

    if header.msg_code == MSG_PING {
        server.stat.record("PING", true);
        let reply = proto::encode_ping_reply(header.sync);
        return sendv(stream, &[&reply]).await;
    }

    let started = Instant::now();
    let result = process_request(server, region, header.msg_code, body, env).await;
    let elapsed = started.elapsed();
    if elapsed > server.cfg.borrow().too_long_threshold {
        warn!(
            op = Request::op_name(header.msg_code),
            ?elapsed,
            "request took too long"
        );
    }
    server
        .stat
        .record(Request::op_name(header.msg_code), result.is_ok());

    let reply = match result {
        Ok(body) => proto::encode_reply(header.msg_code, header.sync, 0, &body),
        Err(e) => {
            debug!(op = Request::op_name(header.msg_code), error = %e, "request failed");
            proto::encode_reply(header.msg_code, header.sync, e.ret_code(), &ReplyBody::Empty)
        }
    };
    sendv(stream, &[&reply]).await
}

/// Drain and drop `n` body bytes from the stream.
async fn discard(stream: &mut TcpStream, rbuf: &mut BytesMut, mut n: usize) -> Result<()> {
    while n > 0 {
        let chunk = n.min(64 * 1024);
        bread(stream, rbuf, chunk).await?;
        let got = rbuf.len().min(n);
        let _ = rbuf.split_to(got);
        n -= got;
    }
    Ok(())
}

/// Decode and execute one request body. This is the entry point shared
/// by the client loop, recovery replay, and the replication follower.
pub async fn process_request(
    server: &Rc<Server>,
    region: &Region,
    msg_code: u32,
    body: BytesMut,
    env: &ExecEnv,
) -> Result<ReplyBody> {
    // The redo row must carry the body byte-identical to what the
    // client sent, so take the copy before the parser consumes it.
    let redo = body.clone();
    let mut body = body;
    let request = Request::parse(msg_code, &mut body)?;

    if Request::is_mutation(msg_code)
        && server.mode() == Mode::ReadOnly
        && !env.privileged
    {
        return Err(DbError::NonMaster);
    }

    match request {
        Request::Insert { space, flags, tuple } => {
            do_insert(server, msg_code, space, flags, tuple, &redo, env).await
        }
        Request::Delete { space, flags, key } => {
            do_delete(server, msg_code, space, flags, key, &redo, env).await
        }
        Request::Update {
            space,
            flags,
            key,
            ops,
        } => do_update(server, region, msg_code, space, flags, key, ops, &redo, env).await,
        Request::Select {
            space,
            index,
            offset,
            limit,
            keys,
        } => do_select(server, space, index, offset, limit, keys),
        Request::Call { proc, args, .. } => {
            let tuples = server.procs.call(server, &proc, &args)?;
            Ok(ReplyBody::Tuples(tuples))
        }
        Request::Ping => Ok(ReplyBody::Empty),
    }
}

fn key_from_tuple(space: &Space, index_no: u32, key_tuple: &TupleRef) -> Result<crate::index::Key> {
    let field = key_tuple
        .field(0)
        .ok_or(DbError::IllegalParams("empty key"))?;
    let index = space.index(index_no)?;
    let key = index.borrow().key_def().key_from_field(field)?;
    Ok(key)
}

fn mutation_reply(flags: u32, tuple: Option<TupleRef>) -> ReplyBody {
    if flags & FLAG_QUIET != 0 {
        ReplyBody::Empty
    } else if flags & FLAG_RETURN_TUPLE != 0 {
        ReplyBody::Tuples(tuple.into_iter().collect())
    } else {
        ReplyBody::Count(1)
    }
}

async fn do_insert(
    server: &Rc<Server>,
    msg_code: u32,
    space_id: u32,
    flags: u32,
    tuple: TupleRef,
    redo: &BytesMut,
    env: &ExecEnv,
) -> Result<ReplyBody> {
    let space = server.spaces.get(space_id)?;
    space.check_cardinality(&tuple)?;
    let key = space.primary_key(&tuple)?;

    let txn = {
        // The latch covers the staging window only; it is released
        // before the WAL wait so unrelated keys keep committing.
        let _latch = space.latch().try_lock()?;
        let old = space.primary().borrow().find(&key);
        if let Some(old) = &old {
            if old.has_flag(GHOST) {
                return Err(DbError::Busy);
            }
            if flags & FLAG_ADD != 0 {
                return Err(DbError::TupleFound);
            }
        } else if flags & FLAG_REPLACE != 0 {
            return Err(DbError::TupleNotFound);
        }

        tuple.set_flag(GHOST);
        if let Err(e) = space
            .primary()
            .borrow_mut()
            .replace(old.as_ref(), Some(&tuple))
        {
            tuple.clear_flag(GHOST);
            return Err(e);
        }

        let mut txn = Txn::begin(msg_code as u16, flags & FLAG_NOT_STORE != 0);
        txn.add_redo(redo);
        txn.add_undo(space.clone(), old, Some(tuple.clone()));
        txn
    };
    txn.commit(server, env).await?;
    Ok(mutation_reply(flags, Some(tuple)))
}

async fn do_delete(
    server: &Rc<Server>,
    msg_code: u32,
    space_id: u32,
    flags: u32,
    key_tuple: TupleRef,
    redo: &BytesMut,
    env: &ExecEnv,
) -> Result<ReplyBody> {
    let space = server.spaces.get(space_id)?;
    let key = key_from_tuple(&space, 0, &key_tuple)?;

    let (txn, old) = {
        let _latch = space.latch().try_lock()?;
        let old = match space.primary().borrow().find(&key) {
            Some(old) => old,
            None => {
                return if flags & FLAG_QUIET != 0 {
                    Ok(ReplyBody::Count(0))
                } else {
                    Err(DbError::TupleNotFound)
                };
            }
        };
        if old.has_flag(GHOST) {
            return Err(DbError::Busy);
        }
        space.primary().borrow_mut().replace(Some(&old), None)?;

        let mut txn = Txn::begin(msg_code as u16, flags & FLAG_NOT_STORE != 0);
        txn.add_redo(redo);
        txn.add_undo(space.clone(), Some(old.clone()), None);
        (txn, old)
    };
    txn.commit(server, env).await?;
    Ok(mutation_reply(flags, Some(old)))
}

#[allow(clippy::too_many_arguments)]
async fn do_update(
    server: &Rc<Server>,
    region: &Region,
    msg_code: u32,
    space_id: u32,
    flags: u32,
    key_tuple: TupleRef,
    ops: Vec<proto::UpdateOp>,
    redo: &BytesMut,
    env: &ExecEnv,
) -> Result<ReplyBody> {
    let space = server.spaces.get(space_id)?;
    let key = key_from_tuple(&space, 0, &key_tuple)?;

    let (txn, new_tuple) = {
        let _latch = space.latch().try_lock()?;
        let old = match space.primary().borrow().find(&key) {
            Some(old) => old,
            None => {
                return if flags & FLAG_QUIET != 0 {
                    Ok(ReplyBody::Count(0))
                } else {
                    Err(DbError::TupleNotFound)
                };
            }
        };
        if old.has_flag(GHOST) {
            return Err(DbError::Busy);
        }

        let new_tuple = update::apply_ops(region, &old, &ops)?;
        space.check_cardinality(&new_tuple)?;
        new_tuple.set_flag(GHOST);
        if let Err(e) = space
            .primary()
            .borrow_mut()
            .replace(Some(&old), Some(&new_tuple))
        {
            new_tuple.clear_flag(GHOST);
            return Err(e);
        }

        let mut txn = Txn::begin(msg_code as u16, flags & FLAG_NOT_STORE != 0);
        txn.add_redo(redo);
        txn.add_undo(space.clone(), Some(old), Some(new_tuple.clone()));
        (txn, new_tuple)
    };
    txn.commit(server, env).await?;
    Ok(mutation_reply(flags, Some(new_tuple)))
}

fn do_select(
    server: &Rc<Server>,
    space_id: u32,
    index_no: u32,
    offset: u32,
    limit: u32,
    keys: Vec<TupleRef>,
) -> Result<ReplyBody> {
    let space = server.spaces.get(space_id)?;
    let index = space.index(index_no)?;
    let mut out = Vec::new();
    let mut to_skip = offset as usize;
    let limit = limit as usize;

    'keys: for key_tuple in &keys {
        let key = key_from_tuple(&space, index_no, key_tuple)?;
        let matches = index.borrow().iterate(IteratorType::Eq, Some(&key))?;
        for tuple in matches {
            if tuple.has_flag(GHOST) {
                continue;
            }
            if to_skip > 0 {
                to_skip -= 1;
                continue;
            }
            if out.len() >= limit {
                break 'keys;
            }
            out.push(tuple);
        }
    }
    Ok(ReplyBody::Tuples(out))
}
