// Runtime configuration.
//
// File parsing lives outside the core; this struct is the contract the
// rest of the server programs against. Every option recognised by the
// admin `reload configuration` command is here.

use std::path::PathBuf;
use std::time::Duration;

/// Space schema as supplied by configuration: which indexes exist and
/// what they key on.
#[derive(Debug, Clone)]
pub struct SpaceConfig {
    pub id: u32,
    pub enabled: bool,
    /// Declared field count; 0 means variable.
    pub cardinality: u32,
    pub indexes: Vec<IndexConfig>,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Field position the key is built from.
    pub key_field: u32,
    pub key_type: KeyType,
    pub unique: bool,
    pub structure: IndexStructure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Unsigned integer field, 4 or 8 bytes little-endian.
    Num,
    /// Opaque byte string.
    Str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStructure {
    Hash,
    Tree,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Client port. 0 disables the listener.
    pub listen_port: u16,
    /// Text admin console port. 0 disables.
    pub admin_port: u16,
    /// Replication relay port served to followers. 0 disables.
    pub replication_port: u16,
    /// When set, start as a follower of this leader.
    pub replication_source: Option<String>,

    pub wal_dir: PathBuf,
    pub snap_dir: PathBuf,

    /// Rows per WAL segment before rotation.
    pub rows_per_wal: u32,
    /// Seconds to linger before fdatasync, coalescing commits.
    pub wal_fsync_delay: Duration,
    /// Pending rows the WAL writer accepts before commit backpressure.
    pub wal_writer_inbox_size: usize,

    pub panic_on_snap_error: bool,
    pub panic_on_wal_error: bool,

    /// Snapshot write throttle, bytes per second. 0 = unthrottled.
    pub snap_io_rate_limit: u64,
    /// Requests slower than this are logged.
    pub too_long_threshold: Duration,

    /// Largest request body accepted from a client.
    pub readahead: usize,
    /// Hard cap on slab-arena memory. 0 = unlimited.
    pub memory_limit: usize,

    pub spaces: Vec<SpaceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 33013,
            admin_port: 33015,
            replication_port: 0,
            replication_source: None,
            wal_dir: PathBuf::from("./wal"),
            snap_dir: PathBuf::from("./snap"),
            rows_per_wal: 50_000,
            wal_fsync_delay: Duration::ZERO,
            wal_writer_inbox_size: 128,
            panic_on_snap_error: true,
            panic_on_wal_error: false,
            snap_io_rate_limit: 0,
            too_long_threshold: Duration::from_millis(500),
            readahead: 16 * 1024 * 1024,
            memory_limit: 0,
            spaces: Vec::new(),
        }
    }
}

impl Config {
    /// Startup validation; failures map to exit code 1.
    pub fn check(&self) -> Result<(), String> {
        if self.rows_per_wal <= 1 {
            return Err("rows_per_wal must be greater than one".into());
        }
        if self.listen_port == 0 && self.replication_source.is_none() {
            return Err("either listen port or replication source is required".into());
        }
        for space in &self.spaces {
            if space.indexes.is_empty() {
                return Err(format!("space {} has no primary index", space.id));
            }
            if !space.indexes[0].unique {
                return Err(format!("space {}: primary index must be unique", space.id));
            }
            if space.indexes.len() > crate::space::MAX_IDX {
                return Err(format!("space {}: too many indexes", space.id));
            }
        }
        Ok(())
    }
}
