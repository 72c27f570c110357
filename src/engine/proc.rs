// Stored-procedure registry behind the CALL opcode.
//
// Procedures are registered by name; the scripting runtime attaches
// its entry points here. A handful of built-ins cover the operations
// the server itself needs callable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{DbError, Result};
use crate::index::IteratorType;
use crate::server::Server;
use crate::tuple::{TupleRef, GHOST};

pub type ProcHandler = Rc<dyn Fn(&Server, &TupleRef) -> Result<Vec<TupleRef>>>;

#[derive(Default)]
pub struct ProcRegistry {
    procs: RefCell<HashMap<Vec<u8>, ProcHandler>>,
}

impl ProcRegistry {
    pub fn new() -> ProcRegistry {
        let registry = ProcRegistry::default();
        registry.register("box.select_range", Rc::new(select_range));
        registry.register("box.random", Rc::new(random_tuple));
        registry
    }

    pub fn register(&self, name: &str, handler: ProcHandler) {
        self.procs
            .borrow_mut()
            .insert(name.as_bytes().to_vec(), handler);
    }

    pub fn call(&self, server: &Server, name: &[u8], args: &TupleRef) -> Result<Vec<TupleRef>> {
        let handler = self
            .procs
            .borrow()
            .get(name)
            .cloned()
            .ok_or(DbError::IllegalParams("no such procedure"))?;
        handler(server, args)
    }
}

fn arg_u32(args: &TupleRef, i: u32) -> Result<u32> {
    let body = args
        .field(i)
        .ok_or(DbError::IllegalParams("missing procedure argument"))?;
    match body.len() {
        4 => Ok(u32::from_le_bytes(body.try_into().unwrap())),
        _ => std::str::from_utf8(body)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(DbError::IllegalParams("numeric argument expected")),
    }
}

/// `box.random(space, index [, seed])`: one pseudo-random resident
/// tuple, the probe expiry-style scans start from.
fn random_tuple(server: &Server, args: &TupleRef) -> Result<Vec<TupleRef>> {
    let space = server.spaces.get(arg_u32(args, 0)?)?;
    let index = space.index(arg_u32(args, 1)?)?;
    let seed = match args.field(2) {
        Some(_) => u64::from(arg_u32(args, 2)?),
        None => rand::random(),
    };
    let result: Vec<TupleRef> = index
        .borrow()
        .random(seed)
        .filter(|t| !t.has_flag(GHOST))
        .into_iter()
        .collect();
    Ok(result)
}

/// `box.select_range(space, index, limit [, start_key])`: tuples in
/// key order from `start_key` (or the beginning), at most `limit`.
fn select_range(server: &Server, args: &TupleRef) -> Result<Vec<TupleRef>> {
    let space = server.spaces.get(arg_u32(args, 0)?)?;
    let index = space.index(arg_u32(args, 1)?)?;
    let limit = arg_u32(args, 2)? as usize;
    let index = index.borrow();
    let tuples = match args.field(3) {
        Some(start) => {
            let key = index.key_def().key_from_field(start)?;
            index.iterate(IteratorType::Ge, Some(&key))?
        }
        None => index.iterate(IteratorType::All, None)?,
    };
    Ok(tuples
        .into_iter()
        .filter(|t| !t.has_flag(GHOST))
        .take(limit)
        .collect())
}
