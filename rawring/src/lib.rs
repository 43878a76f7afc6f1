//! A raw `io_uring` transport and the two programs built on it: a sharded
//! TCP echo server and a kernel-polled bulk file reader.

pub mod arena;
pub use arena::{OperationArena, Tag};

pub mod buffer_pool;
pub use buffer_pool::BufferPool;

pub mod bulk;
pub use bulk::{BulkReader, BulkReport, FileOutcome, FileReport, RejectReason};

pub mod config;
pub use config::{Builder, RingConfig, RingMode, ServerConfig};

pub mod echo;

mod error;
pub use error::{ArenaError, BulkError, RingError, ServerError, ShardError};

pub mod ring;
pub use ring::{RingTransport, Submit};

pub mod server;
pub use server::{EchoServer, bind_listener};

pub mod shard;

pub mod sys;

mod utils;
pub use utils::thread::online_cpus;

#[cfg(test)]
mod test_utils;
