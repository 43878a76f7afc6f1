use crate::error::{RingError, ServerError};
use crate::sys::MAX_RING_ENTRIES;
use crate::utils::thread::online_cpus;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Default SQ ring size for the bulk reader.
const QUEUE_DEPTH: u32 = 1024;

/// Effectively "never go idle" for the bulk reader's kernel poller.
const SQ_THREAD_IDLE: Duration = Duration::from_millis(99_999_999);

/// Echo shards keep many connections in flight; the kernel clamps this to
/// its own maximum.
const ECHO_RING_SIZE: u32 = MAX_RING_ENTRIES;

const LISTEN_PORT: u16 = 7777;
const LISTEN_BACKLOG: i32 = 10_000;

/// Per-connection receive buffer. One receive is one message.
const MESSAGE_SIZE: usize = 1024;

/// Connection slots (and buffers) preallocated per shard.
const CONNECTIONS_PER_SHARD: usize = 10_000;

const MAX_THREADS: usize = 64;

/// How the kernel picks up submissions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RingMode {
    /// Submissions are handed over with `io_uring_enter`.
    #[default]
    Default,

    /// A kernel thread polls the SQ ring (`IORING_SETUP_SQPOLL`). It sleeps
    /// after `idle_timeout` without work and must then be woken explicitly.
    KernelPolled,
}

impl RingMode {
    pub const fn is_kernel_polled(self) -> bool {
        matches!(self, RingMode::KernelPolled)
    }
}

/// Parameters for [`crate::ring::RingTransport::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// SQ ring size, a power of two.
    queue_depth: u32,

    mode: RingMode,

    /// Only used in [`RingMode::KernelPolled`].
    idle_timeout: Duration,

    /// Pin the kernel poller to this CPU. Only used in [`RingMode::KernelPolled`].
    sq_thread_cpu: Option<u32>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            queue_depth: QUEUE_DEPTH,
            mode: RingMode::Default,
            idle_timeout: SQ_THREAD_IDLE,
            sq_thread_cpu: None,
        }
    }
}

impl RingConfig {
    pub fn new(queue_depth: u32, mode: RingMode) -> Self {
        Self::default().queue_depth(queue_depth).mode(mode)
    }

    /// The configuration the bulk reader uses: a kernel-polled ring whose
    /// poller practically never sleeps.
    pub fn kernel_polled() -> Self {
        Self::default().mode(RingMode::KernelPolled)
    }

    #[track_caller]
    pub fn queue_depth(mut self, val: u32) -> Self {
        assert!(val.is_power_of_two(), "queue_depth must be a power of two");
        self.queue_depth = val;
        self
    }

    pub fn mode(mut self, mode: RingMode) -> Self {
        self.mode = mode;
        self
    }

    #[track_caller]
    pub fn idle_timeout(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "idle_timeout must be greater than 0");
        self.idle_timeout = val;
        self
    }

    pub fn sq_thread_cpu(mut self, cpu: u32) -> Self {
        self.sq_thread_cpu = Some(cpu);
        self
    }

    pub fn get_queue_depth(&self) -> u32 {
        self.queue_depth
    }

    pub fn get_mode(&self) -> RingMode {
        self.mode
    }

    pub fn get_idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn get_sq_thread_cpu(&self) -> Option<u32> {
        self.sq_thread_cpu
    }

    /// Idle timeout as the millisecond count `io_uring_params` expects.
    pub(crate) fn idle_timeout_ms(&self) -> u32 {
        u32::try_from(self.idle_timeout.as_millis()).unwrap_or(u32::MAX)
    }

    pub fn validate(&self) -> Result<(), RingError> {
        if !self.queue_depth.is_power_of_two() {
            return Err(RingError::InvalidConfig(format!(
                "queue_depth must be a power of two, got {}",
                self.queue_depth
            )));
        }

        if self.queue_depth > MAX_RING_ENTRIES {
            return Err(RingError::InvalidConfig(format!(
                "queue_depth {} exceeds kernel maximum {}",
                self.queue_depth, MAX_RING_ENTRIES
            )));
        }

        if self.mode.is_kernel_polled() && self.idle_timeout.is_zero() {
            return Err(RingError::InvalidConfig(
                "idle_timeout must be greater than 0 in kernel-polled mode".into(),
            ));
        }

        Ok(())
    }
}

/// Builder for the echo server. Consumed by [`Builder::try_build`], which
/// resolves defaults and validates into a [`ServerConfig`].
#[derive(Debug)]
pub struct Builder {
    /// Number of shards. Defaults to 1 per online CPU.
    threads: Option<usize>,

    addr: SocketAddr,

    backlog: i32,

    message_size: usize,

    connections_per_shard: usize,

    ring_size: u32,

    pin_threads: bool,

    thread_name: String,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            threads: None,
            addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, LISTEN_PORT)),
            backlog: LISTEN_BACKLOG,
            message_size: MESSAGE_SIZE,
            connections_per_shard: CONNECTIONS_PER_SHARD,
            ring_size: ECHO_RING_SIZE,
            pin_threads: true,
            thread_name: "rawring-shard".to_string(),
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shards, between 1 and 64.
    #[track_caller]
    pub fn threads(mut self, val: usize) -> Self {
        assert!(
            (1..=MAX_THREADS).contains(&val),
            "threads must be between 1 and {MAX_THREADS}"
        );
        self.threads = Some(val);
        self
    }

    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    #[track_caller]
    pub fn backlog(mut self, val: i32) -> Self {
        assert!(val > 0, "backlog must be greater than 0");
        self.backlog = val;
        self
    }

    #[track_caller]
    pub fn message_size(mut self, val: usize) -> Self {
        assert!(val > 0, "message_size must be greater than 0");
        self.message_size = val;
        self
    }

    #[track_caller]
    pub fn connections_per_shard(mut self, val: usize) -> Self {
        assert!(val > 0, "connections_per_shard must be greater than 0");
        self.connections_per_shard = val;
        self
    }

    #[track_caller]
    pub fn ring_size(mut self, val: u32) -> Self {
        assert!(val.is_power_of_two(), "ring_size must be a power of two");
        self.ring_size = val;
        self
    }

    pub fn pin_threads(mut self, val: bool) -> Self {
        self.pin_threads = val;
        self
    }

    /// Prefix for shard thread names; the shard id is appended.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = val.into();
        self
    }

    pub fn try_build(self) -> Result<ServerConfig, ServerError> {
        self.try_into()
    }
}

/// Validated echo server configuration shared (by clone) with every shard.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub threads: usize,
    pub addr: SocketAddr,
    pub backlog: i32,
    pub message_size: usize,
    pub connections_per_shard: usize,
    pub ring: RingConfig,
    pub pin_threads: bool,
    pub thread_name: String,
}

impl ServerConfig {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn shard_thread_name(&self, id: usize) -> String {
        format!("{}-{}", self.thread_name, id)
    }

    fn validate(&self) -> Result<(), ServerError> {
        if !(1..=MAX_THREADS).contains(&self.threads) {
            return Err(ServerError::InvalidConfig(format!(
                "threads must be between 1 and {MAX_THREADS}, got {}",
                self.threads
            )));
        }

        if u32::try_from(self.message_size).is_err() {
            return Err(ServerError::InvalidConfig(format!(
                "message_size {} does not fit a single ring operation",
                self.message_size
            )));
        }

        self.ring
            .validate()
            .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;

        // Every connection plus the listener's accept can be queued in one
        // turn; the SQ ring must hold all of them.
        let max_in_flight = self.connections_per_shard.saturating_add(1);
        if max_in_flight > self.ring.get_queue_depth() as usize {
            return Err(ServerError::InvalidConfig(format!(
                "ring_size {} cannot hold {} connections plus the accept",
                self.ring.get_queue_depth(),
                self.connections_per_shard
            )));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for ServerConfig {
    type Error = ServerError;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let threads = builder
            .threads
            .unwrap_or_else(|| online_cpus().clamp(1, MAX_THREADS));

        let cfg = ServerConfig {
            threads,
            addr: builder.addr,
            backlog: builder.backlog,
            message_size: builder.message_size,
            connections_per_shard: builder.connections_per_shard,
            ring: RingConfig::new(builder.ring_size, RingMode::Default),
            pin_threads: builder.pin_threads,
            thread_name: builder.thread_name,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    // Cloned into every shard thread.
    assert_impl_all!(ServerConfig: Send, Sync, Clone);

    #[test]
    fn test_ring_defaults() {
        let cfg = RingConfig::default();
        assert_eq!(cfg.get_queue_depth(), 1024);
        assert_eq!(cfg.get_mode(), RingMode::Default);
        assert!(cfg.validate().is_ok());

        let cfg = RingConfig::kernel_polled();
        assert!(cfg.get_mode().is_kernel_polled());
        assert_eq!(cfg.idle_timeout_ms(), 99_999_999);
    }

    #[rstest]
    #[case::depth_1(1)]
    #[case::depth_8(8)]
    #[case::depth_4096(4096)]
    #[case::depth_max(MAX_RING_ENTRIES)]
    fn test_ring_valid_depths(#[case] depth: u32) {
        assert!(RingConfig::new(depth, RingMode::Default).validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "queue_depth must be a power of two")]
    fn test_ring_depth_not_power_of_two() {
        let _ = RingConfig::default().queue_depth(1000);
    }

    #[test]
    fn test_ring_depth_over_kernel_max() {
        let cfg = RingConfig::default().queue_depth(MAX_RING_ENTRIES * 2);
        assert!(matches!(cfg.validate(), Err(RingError::InvalidConfig(_))));
    }

    #[test]
    fn test_idle_timeout_saturates() {
        let cfg = RingConfig::kernel_polled().idle_timeout(Duration::from_secs(u64::MAX / 2));
        assert_eq!(cfg.idle_timeout_ms(), u32::MAX);
    }

    #[test]
    fn test_server_defaults() -> anyhow::Result<()> {
        let cfg = ServerConfig::builder().threads(2).try_build()?;

        assert_eq!(cfg.threads, 2);
        assert_eq!(cfg.addr.port(), 7777);
        assert_eq!(cfg.backlog, 10_000);
        assert_eq!(cfg.message_size, 1024);
        assert_eq!(cfg.connections_per_shard, 10_000);
        assert_eq!(cfg.ring.get_queue_depth(), MAX_RING_ENTRIES);
        assert_eq!(cfg.shard_thread_name(3), "rawring-shard-3");

        Ok(())
    }

    #[test]
    fn test_server_threads_default_to_cpus() -> anyhow::Result<()> {
        let cfg = ServerConfig::builder().try_build()?;
        assert_eq!(cfg.threads, online_cpus().clamp(1, MAX_THREADS));
        Ok(())
    }

    #[rstest]
    #[case::one_short(64, 64)]
    #[case::far_too_small(64, 8)]
    fn test_server_ring_smaller_than_connections(#[case] conns: usize, #[case] ring: u32) {
        let res = ServerConfig::builder()
            .threads(1)
            .connections_per_shard(conns)
            .ring_size(ring)
            .try_build();
        assert!(matches!(res, Err(ServerError::InvalidConfig(_))));
    }

    #[test]
    fn test_server_ring_fits_connections_and_accept() -> anyhow::Result<()> {
        let cfg = ServerConfig::builder()
            .threads(1)
            .connections_per_shard(63)
            .ring_size(64)
            .try_build()?;
        assert_eq!(cfg.ring.get_queue_depth(), 64);
        Ok(())
    }

    #[rstest]
    #[case::zero(0)]
    #[case::too_many(65)]
    #[should_panic(expected = "threads must be between 1 and 64")]
    fn test_server_threads_out_of_range(#[case] threads: usize) {
        let _ = ServerConfig::builder().threads(threads);
    }
}
