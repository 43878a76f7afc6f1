//! Listener setup and shard threads for the echo server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ShardError};
use crate::shard::Shard;
use crate::utils::sys::warn_if_fd_limit_below;
use crate::utils::thread::{online_cpus, pin_current_thread};
use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrLike, SockaddrStorage, sockopt,
};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};

/// Descriptors a shard needs beyond its connections: the ring and the
/// shared listener.
const SHARD_FD_OVERHEAD: usize = 2;

/// Creates a blocking TCP listener with `SO_REUSEADDR`. Returns it with the
/// address it is bound to, which differs from `addr` when port 0 was asked
/// for.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<(OwnedFd, SocketAddr), ServerError> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };

    let bind_err = |source| ServerError::Bind { addr, source };

    let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .map_err(bind_err)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(bind_err)?;
    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr)).map_err(bind_err)?;

    // `Backlog::new` only takes values below SOMAXCONN; larger requests are
    // capped at net.core.somaxconn by the kernel anyway.
    let backlog = if backlog >= libc::SOMAXCONN {
        Backlog::MAXCONN
    } else {
        Backlog::new(backlog).map_err(ServerError::Listen)?
    };
    socket::listen(&fd, backlog).map_err(ServerError::Listen)?;

    let local = socket::getsockname::<SockaddrStorage>(fd.as_raw_fd())
        .map_err(ServerError::Listen)?;
    let local_addr = if let Some(v4) = local.as_sockaddr_in() {
        SocketAddr::V4((*v4).into())
    } else if let Some(v6) = local.as_sockaddr_in6() {
        SocketAddr::V6((*v6).into())
    } else {
        return Err(ServerError::InvalidConfig(format!(
            "listener bound to unexpected address family {:?}",
            local.family()
        )));
    };

    Ok((fd, local_addr))
}

/// A running echo server: one listener shared by `threads` shards.
#[derive(Debug)]
pub struct EchoServer {
    local_addr: SocketAddr,
    shards: Vec<JoinHandle<Result<(), ShardError>>>,

    // Kept so the listener outlives every shard, even detached ones.
    _listener: Arc<OwnedFd>,
}

impl EchoServer {
    /// Binds the listener and starts every shard. Returns once all shards
    /// have created their rings, or with the first shard's setup error.
    pub fn start(cfg: ServerConfig) -> Result<Self, ServerError> {
        warn_if_fd_limit_below(cfg.threads * (cfg.connections_per_shard + SHARD_FD_OVERHEAD));

        let (fd, local_addr) = bind_listener(cfg.addr, cfg.backlog)?;
        let listener = Arc::new(fd);

        let (ready_tx, ready_rx) = mpsc::channel::<(usize, Result<(), ShardError>)>();
        let cpus = online_cpus();

        let mut shards = Vec::with_capacity(cfg.threads);
        for id in 0..cfg.threads {
            let listener = Arc::clone(&listener);
            let ready_tx = ready_tx.clone();
            let cfg = cfg.clone();

            let handle = thread::Builder::new()
                .name(cfg.shard_thread_name(id))
                .spawn(move || {
                    if cfg.pin_threads {
                        let cpu = id % cpus;
                        if let Err(e) = pin_current_thread(cpu) {
                            tracing::warn!(shard = id, cpu, error = %e, "failed to pin shard");
                        }
                    }

                    let mut shard = match Shard::try_new(id, listener, &cfg) {
                        Ok(shard) => shard,
                        Err(e) => {
                            // Reported through the handshake; the thread ends here.
                            let _ = ready_tx.send((id, Err(e)));
                            return Ok(());
                        }
                    };

                    let _ = ready_tx.send((id, Ok(())));
                    drop(ready_tx);

                    shard.run()
                })
                .map_err(ServerError::Spawn)?;

            shards.push(handle);
        }

        drop(ready_tx);

        for _ in 0..cfg.threads {
            match ready_rx.recv() {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(source))) => return Err(ServerError::Shard { id, source }),
                Err(_) => {
                    return Err(ServerError::Spawn(io::Error::other(
                        "shard thread exited before finishing setup",
                    )));
                }
            }
        }

        tracing::info!(
            addr = %local_addr,
            shards = cfg.threads,
            connections_per_shard = cfg.connections_per_shard,
            "echo server listening"
        );

        Ok(Self {
            local_addr,
            shards,
            _listener: listener,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    /// Blocks on the shards. Shards only stop on a fatal ring error, which
    /// is returned.
    pub fn join(self) -> Result<(), ServerError> {
        for (id, handle) in self.shards.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(source)) => return Err(ServerError::Shard { id, source }),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }

        Ok(())
    }
}
