use super::*;
use crate::test_utils::ring_or_skip;
use anyhow::Result;
use rstest::rstest;
use std::collections::BTreeSet;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

fn default_ring(depth: u32) -> RingConfig {
    RingConfig::new(depth, RingMode::Default)
}

fn drain_exactly(ring: &mut RingTransport, n: usize) -> Result<Vec<CompletionEntry>> {
    let mut seen = Vec::with_capacity(n);

    while seen.len() < n {
        ring.drain_completions(1, |cqe| seen.push(cqe))?;
    }

    Ok(seen)
}

#[test]
fn test_init_default_mode() -> Result<()> {
    let ring = ring_or_skip!(default_ring(64));

    assert_eq!(ring.mode(), RingMode::Default);
    assert_eq!(ring.sq_capacity(), 64);
    assert_eq!(ring.cq_capacity(), 128);
    assert_eq!(ring.sq_pending(), 0);
    assert_eq!(ring.cq_ready(), 0);
    assert_eq!(ring.cq_overflow(), 0);
    assert!(ring.as_raw_fd() >= 0);

    Ok(())
}

#[test]
fn test_invalid_config_fails_before_setup() {
    let cfg = RingConfig::default().queue_depth(1 << 20);
    assert!(matches!(
        RingTransport::init(&cfg),
        Err(RingError::InvalidConfig(_))
    ));
}

#[test]
fn test_drain_without_wait_on_empty_ring() -> Result<()> {
    let mut ring = ring_or_skip!(default_ring(8));

    let mut called = false;
    assert_eq!(ring.drain_completions(0, |_| called = true)?, 0);
    assert!(!called);

    // Nothing to submit and nothing to wait for is a no-op.
    assert_eq!(ring.submit_and_wait(0)?, 0);

    Ok(())
}

#[rstest]
#[case::depth_8(8, 8)]
#[case::depth_64_partial(64, 17)]
#[case::depth_256(256, 256)]
fn test_exactly_one_completion_per_submission(#[case] depth: u32, #[case] n: u64) -> Result<()> {
    let mut ring = ring_or_skip!(default_ring(depth));

    for tag in 0..n {
        ring.submit(&SubmissionEntry::nop().user_data(tag));
    }
    assert_eq!(ring.sq_pending(), n as u32);

    let completions = drain_exactly(&mut ring, n as usize)?;

    let tags: BTreeSet<u64> = completions.iter().map(|c| c.user_data()).collect();
    assert_eq!(tags.len(), n as usize, "duplicate completions");
    assert_eq!(tags, (0..n).collect());
    assert!(completions.iter().all(|c| c.result() == 0));

    assert_eq!(ring.sq_pending(), 0);
    assert_eq!(ring.cq_ready(), 0);

    Ok(())
}

#[test]
fn test_indices_wrap_across_many_laps() -> Result<()> {
    let depth = 4;
    let mut ring = ring_or_skip!(default_ring(depth));

    for lap in 0..100u64 {
        for i in 0..depth as u64 {
            ring.submit(&SubmissionEntry::nop().user_data(lap * 10 + i));
        }

        let completions = drain_exactly(&mut ring, depth as usize)?;
        let tags: BTreeSet<u64> = completions.iter().map(|c| c.user_data()).collect();
        assert_eq!(tags, (0..depth as u64).map(|i| lap * 10 + i).collect());
    }

    Ok(())
}

// Submitting past capacity is unguarded. Recorded behaviour on a Default-mode
// ring (the kernel only reads the SQ inside io_uring_enter, so nothing races
// with this test): the tail runs past the head by `size + 1` and slot 0 is
// overwritten by the last submission, losing the first one.
#[test]
fn test_overrun_overwrites_oldest_unconsumed_entry() -> Result<()> {
    let depth = 8u32;
    let mut ring = ring_or_skip!(default_ring(depth));

    for tag in 0..=depth as u64 {
        ring.submit(&SubmissionEntry::nop().user_data(tag));
    }

    assert_eq!(ring.sq_pending(), depth + 1);
    assert!(ring.sq_pending() > ring.sq_capacity());

    assert_eq!(ring.sqe_at(0).get_user_data(), depth as u64);
    assert_eq!(ring.sqe_at(depth).get_user_data(), depth as u64);
    for slot in 1..depth {
        assert_eq!(ring.sqe_at(slot).get_user_data(), slot as u64);
    }

    Ok(())
}

#[test]
fn test_send_recv_through_ring() -> Result<()> {
    let mut ring = ring_or_skip!(default_ring(8));
    let (a, b) = UnixStream::pair()?;

    let payload = b"ring transport".to_vec();
    let mut inbound = vec![0u8; 64];

    ring.submit(&SubmissionEntry::send(a.as_raw_fd(), payload.as_ptr(), payload.len() as u32).user_data(1));
    ring.submit(
        &SubmissionEntry::recv(b.as_raw_fd(), inbound.as_mut_ptr(), inbound.len() as u32)
            .user_data(2),
    );

    let completions = drain_exactly(&mut ring, 2)?;

    for cqe in completions {
        assert_eq!(cqe.result(), payload.len() as i32, "tag {}", cqe.user_data());
    }
    assert_eq!(&inbound[..payload.len()], payload.as_slice());

    Ok(())
}

#[test]
fn test_negative_result_carries_errno() -> Result<()> {
    let mut ring = ring_or_skip!(default_ring(8));
    let file = tempfile::tempfile()?;
    let mut buf = [0u8; 8];

    ring.submit(&SubmissionEntry::recv(file.as_raw_fd(), buf.as_mut_ptr(), 8).user_data(7));

    let completions = drain_exactly(&mut ring, 1)?;
    assert_eq!(completions[0].user_data(), 7);
    assert_eq!(completions[0].result(), -libc::ENOTSOCK);

    Ok(())
}

#[test]
fn test_register_descriptors() -> Result<()> {
    let mut ring = ring_or_skip!(default_ring(8));

    let mut first = tempfile::tempfile()?;
    let second = tempfile::tempfile()?;
    first.write_all(b"fixed")?;

    ring.register_descriptors(&[first.as_raw_fd(), second.as_raw_fd()])?;

    // A second table on the same ring is refused.
    let err = ring
        .register_descriptors(&[first.as_raw_fd()])
        .expect_err("files already registered");
    assert!(matches!(err, RingError::Register(_)));
    assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

    let mut buf = [0u8; 5];
    let iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    ring.submit(&SubmissionEntry::readv(Target::Fixed(0), &iov, 1, 0).user_data(0));

    let completions = drain_exactly(&mut ring, 1)?;
    assert_eq!(completions[0].result(), 5);
    assert_eq!(&buf, b"fixed");

    Ok(())
}

#[test]
fn test_kernel_poller_wake_up() -> Result<()> {
    let cfg = RingConfig::new(8, RingMode::KernelPolled).idle_timeout(Duration::from_millis(10));
    let mut ring = ring_or_skip!(cfg);

    assert!(ring.mode().is_kernel_polled());

    ring.submit(&SubmissionEntry::nop().user_data(1));
    ring.wake_if_needed()?;
    assert_eq!(drain_exactly(&mut ring, 1)?[0].user_data(), 1);

    // Let the poller go idle.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !ring.sq_flags().contains(SqFlags::NEED_WAKEUP) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(ring.sq_flags().contains(SqFlags::NEED_WAKEUP));

    // A sleeping poller does not see new work until woken.
    ring.submit(&SubmissionEntry::nop().user_data(2));
    assert!(ring.wake_if_needed()?);
    assert_eq!(drain_exactly(&mut ring, 1)?[0].user_data(), 2);

    Ok(())
}

#[test]
fn test_wake_is_noop_in_default_mode() -> Result<()> {
    let mut ring = ring_or_skip!(default_ring(8));
    assert!(!ring.wake_if_needed()?);
    Ok(())
}
