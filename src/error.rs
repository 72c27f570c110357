use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer too short")]
    BufferTooShort,

    #[error("illegal parameters: {0}")]
    IllegalParams(&'static str),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u32),

    #[error("no such space: {0}")]
    NoSuchSpace(u32),

    #[error("no such index {index} in space {space}")]
    NoSuchIndex { space: u32, index: u32 },

    #[error("tuple not found")]
    TupleNotFound,

    #[error("tuple already exists")]
    TupleFound,

    #[error("index violation")]
    IndexViolation,

    #[error("update of a read-only node")]
    NonMaster,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("WAL write failed")]
    WalFailure,

    #[error("lock timeout")]
    TimedOut,

    #[error("resource busy")]
    Busy,

    #[error("fiber cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("bad checksum in {0}")]
    BadChecksum(&'static str),

    #[error("unsupported replication version: {0}")]
    WrongVersion(u32),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Protocol error ordinals. The set is closed: codes are never removed
/// and never change meaning. The low byte carries the disposition
/// (0x00 ok, 0x01 fatal, 0x02 the caller may retry); the upper 24 bits
/// are the ordinal proper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0x0000_0000,
    NonMaster = 0x0000_0102,
    IllegalParams = 0x0000_0202,
    NodeIsRo = 0x0000_0401,
    NodeIsLocked = 0x0000_0601,
    MemoryIssue = 0x0000_0701,
    UnsupportedCommand = 0x0000_0a02,
    WrongVersion = 0x0000_2602,
    UnknownError = 0x0000_2702,
    WalIo = 0x0000_2801,
    NodeNotFound = 0x0000_3102,
    NodeFound = 0x0000_3702,
    IndexViolation = 0x0000_3802,
    NoSuchNamespace = 0x0000_3902,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// True when a client is allowed to retry the request verbatim.
    pub fn is_transient(self) -> bool {
        self.as_u32() & 0xff == 0x02
    }
}

impl DbError {
    /// Wire `ret_code` for a failed request.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DbError::NonMaster => ErrorCode::NonMaster,
            DbError::BufferTooShort | DbError::IllegalParams(_) => ErrorCode::IllegalParams,
            DbError::UnsupportedCommand(_) => ErrorCode::UnsupportedCommand,
            DbError::NoSuchSpace(_) | DbError::NoSuchIndex { .. } => ErrorCode::NoSuchNamespace,
            DbError::TupleNotFound => ErrorCode::NodeNotFound,
            DbError::TupleFound => ErrorCode::NodeFound,
            DbError::IndexViolation => ErrorCode::IndexViolation,
            DbError::OutOfMemory(_) => ErrorCode::MemoryIssue,
            DbError::Busy => ErrorCode::NodeIsLocked,
            DbError::WrongVersion(_) => ErrorCode::WrongVersion,
            // Fatal to the request: the mutation was rolled back, but
            // retrying verbatim is not known to be safe.
            DbError::WalFailure => ErrorCode::WalIo,
            DbError::Io(_) => ErrorCode::UnknownError,
            _ => ErrorCode::UnknownError,
        }
    }

    pub fn ret_code(&self) -> u32 {
        self.error_code().as_u32()
    }
}
