use crate::config::RingConfig;
use crate::error::RingError;
use crate::ring::RingTransport;

// Exports
pub(crate) mod spy;
pub(crate) use spy::SpySubmitter;

/// Creates a ring for a test, or `None` when the environment refuses
/// `io_uring_setup` (old kernel, seccomp, `io_uring_disabled`).
pub(crate) fn try_ring(cfg: &RingConfig) -> Option<RingTransport> {
    match RingTransport::init(cfg) {
        Ok(ring) => Some(ring),
        Err(e @ RingError::Setup(_)) => {
            eprintln!("skipping: {e}");
            None
        }
        Err(e) => panic!("ring init failed: {e:?}"),
    }
}

/// Whether the kernel would let us create a ring with this config. Used by
/// tests that create their rings indirectly (shards, bulk reader).
pub(crate) fn io_uring_available(cfg: &RingConfig) -> bool {
    try_ring(cfg).is_some()
}

/// Evaluates to a fresh [`RingTransport`], or returns `Ok(())` from the
/// calling test when io_uring is unavailable.
macro_rules! ring_or_skip {
    ($cfg:expr) => {
        match $crate::test_utils::try_ring(&$cfg) {
            Some(ring) => ring,
            None => return Ok(()),
        }
    };
}
pub(crate) use ring_or_skip;
