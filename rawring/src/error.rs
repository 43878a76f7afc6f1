use std::io;
use std::path::PathBuf;

/// Errors raised by [`crate::ring::RingTransport`].
#[derive(thiserror::Error, Debug)]
pub enum RingError {
    /// `io_uring_setup` was refused: kernel too old, io_uring disabled, or
    /// the process lacks the privileges the requested mode needs.
    #[error("io_uring_setup failed: {0}")]
    Setup(#[source] io::Error),

    /// One of the SQ ring, SQE array or CQ ring mappings failed.
    #[error("failed to map ring memory: {0}")]
    Map(#[source] io::Error),

    /// The kernel rejected an `IORING_REGISTER_FILES` batch.
    #[error("failed to register descriptors: {0}")]
    Register(#[source] io::Error),

    #[error("io_uring_enter failed: {0}")]
    Enter(#[source] io::Error),

    #[error("kernel lacks required feature {0}")]
    Unsupported(&'static str),

    #[error("invalid ring configuration: {0}")]
    InvalidConfig(String),
}

impl RingError {
    /// Setup-time failures end the process; only `io_uring_enter` can be
    /// transient.
    pub fn is_fatal(&self) -> bool {
        match self {
            RingError::Enter(e) => !matches!(
                e.raw_os_error(),
                Some(libc::EAGAIN | libc::EBUSY | libc::EINTR)
            ),
            _ => true,
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            RingError::Setup(e) | RingError::Map(e) | RingError::Register(e) | RingError::Enter(e) => {
                e.raw_os_error()
            }
            _ => None,
        }
    }
}

/// Errors raised by [`crate::arena::OperationArena`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    #[error("operation arena is full ({capacity} in-flight operations)")]
    Full { capacity: usize },

    /// A completion carried a tag with no matching in-flight operation.
    #[error("no in-flight operation for tag {0}")]
    UnknownTag(u64),
}

#[derive(thiserror::Error, Debug)]
pub enum ShardError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Arena(#[from] ArenaError),
}

impl ShardError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ShardError::Ring(e) => e.is_fatal(),
            ShardError::Arena(ArenaError::UnknownTag(_)) => false,
            ShardError::Arena(ArenaError::Full { .. }) => true,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("failed to bind listening socket to {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: nix::Error,
    },

    #[error("listen failed: {0}")]
    Listen(#[source] nix::Error),

    #[error("failed to spawn shard thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("shard {id} failed: {source}")]
    Shard {
        id: usize,
        #[source]
        source: ShardError,
    },

    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised by [`crate::bulk::BulkReader`].
#[derive(thiserror::Error, Debug)]
pub enum BulkError {
    #[error("no files provided")]
    NoFiles,

    #[error("file open error: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is too large for a single read ({size} bytes)")]
    TooLarge { path: PathBuf, size: u64 },

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Arena(#[from] ArenaError),
}
