// EmberDB - in-memory transactional tuple store.
//
// A single-node TCP server holding typed, indexed tuples in memory,
// with every mutation persisted through a write-ahead log and streamed
// to followers. The whole core is cooperatively scheduled on one
// thread; only the WAL writer lives on its own.

pub mod admin;
pub mod buf;
pub mod config;
pub mod engine;
pub mod error;
pub mod fiber;
pub mod index;
pub mod memory;
pub mod net;
pub mod proto;
pub mod recovery;
pub mod repl;
pub mod server;
pub mod snapshot;
pub mod space;
pub mod stat;
pub mod tuple;
pub mod txn;
pub mod varint;
pub mod wal;

pub use config::Config;
pub use error::{DbError, Result};
pub use server::Server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
