//! Raw mirrors of the `io_uring` uAPI (`include/uapi/linux/io_uring.h`).
//!
//! The `io_uring` crate keeps its `sys` module private, so the structures the
//! kernel fills during setup are declared here. Opcode numbers are still taken
//! from the crate, see [`crate::ring::Opcode`].

use bitflags::bitflags;
use std::io;
use std::os::fd::RawFd;
use std::ptr;

// mmap offsets
pub(crate) const IORING_OFF_SQ_RING: libc::off_t = 0;
pub(crate) const IORING_OFF_CQ_RING: libc::off_t = 0x800_0000;
pub(crate) const IORING_OFF_SQES: libc::off_t = 0x1000_0000;

// io_uring_setup flags
pub(crate) const IORING_SETUP_SQPOLL: u32 = 1 << 1;
pub(crate) const IORING_SETUP_SQ_AFF: u32 = 1 << 2;
pub(crate) const IORING_SETUP_CLAMP: u32 = 1 << 4;

// io_uring_enter flags
pub(crate) const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
pub(crate) const IORING_ENTER_SQ_WAKEUP: u32 = 1 << 1;

// io_uring_register opcodes
pub(crate) const IORING_REGISTER_FILES: u32 = 2;

/// Largest SQ ring the kernel accepts (`IORING_MAX_ENTRIES`).
pub const MAX_RING_ENTRIES: u32 = 32768;

bitflags!(
    /// Capabilities reported by the kernel in `io_uring_params.features`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// SQ and CQ rings can be mapped with a single mmap.
        const SINGLE_MMAP = 1 << 0;

        /// The kernel never drops completions; overflowed CQEs are kept
        /// internally until the CQ ring has room again.
        const NODROP = 1 << 1;

        /// Data consumed by a submission is stable once it was submitted.
        const SUBMIT_STABLE = 1 << 2;

        /// `offset == -1` means "current file position" for reads/writes.
        const RW_CUR_POS = 1 << 3;

        const CUR_PERSONALITY = 1 << 4;

        /// Socket operations are armed with an internal poll instead of
        /// being punted to an io-wq worker when they would block.
        const FAST_POLL = 1 << 5;

        const POLL_32BITS = 1 << 6;

        /// SQPOLL rings accept non-registered descriptors.
        const SQPOLL_NONFIXED = 1 << 7;
    }
);

bitflags!(
    /// Flags the kernel publishes in the SQ ring `flags` word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SqFlags: u32 {
        /// The SQPOLL thread went idle and needs `IORING_ENTER_SQ_WAKEUP`.
        const NEED_WAKEUP = 1 << 0;

        /// The CQ ring overflowed.
        const CQ_OVERFLOW = 1 << 1;

        const TASKRUN = 1 << 2;
    }
);

/// `struct io_sqring_offsets`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SqRingOffsets {
    pub(crate) head: u32,
    pub(crate) tail: u32,
    pub(crate) ring_mask: u32,
    pub(crate) ring_entries: u32,
    pub(crate) flags: u32,
    pub(crate) dropped: u32,
    pub(crate) array: u32,
    pub(crate) resv1: u32,
    pub(crate) user_addr: u64,
}

/// `struct io_cqring_offsets`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CqRingOffsets {
    pub(crate) head: u32,
    pub(crate) tail: u32,
    pub(crate) ring_mask: u32,
    pub(crate) ring_entries: u32,
    pub(crate) overflow: u32,
    pub(crate) cqes: u32,
    pub(crate) flags: u32,
    pub(crate) resv1: u32,
    pub(crate) user_addr: u64,
}

/// `struct io_uring_params`, filled in by the kernel during setup.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Params {
    pub(crate) sq_entries: u32,
    pub(crate) cq_entries: u32,
    pub(crate) flags: u32,
    pub(crate) sq_thread_cpu: u32,
    pub(crate) sq_thread_idle: u32,
    pub(crate) features: u32,
    pub(crate) wq_fd: u32,
    pub(crate) resv: [u32; 3],
    pub(crate) sq_off: SqRingOffsets,
    pub(crate) cq_off: CqRingOffsets,
}

pub(crate) fn io_uring_setup(entries: u32, params: &mut Params) -> io::Result<RawFd> {
    // SAFETY: `params` is a valid, exclusively borrowed `io_uring_params`.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_long,
            ptr::from_mut(params),
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(ret as RawFd)
}

pub(crate) fn io_uring_enter(
    fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
) -> io::Result<u32> {
    // SAFETY: no signal mask is passed, every other argument is plain data.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd as libc::c_long,
            to_submit as libc::c_long,
            min_complete as libc::c_long,
            flags as libc::c_long,
            ptr::null::<libc::sigset_t>(),
            0 as libc::c_long,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(ret as u32)
}

pub(crate) fn io_uring_register_files(fd: RawFd, files: &[RawFd]) -> io::Result<()> {
    // SAFETY: the kernel copies `files.len()` descriptors out of the slice
    // before returning.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            fd as libc::c_long,
            IORING_REGISTER_FILES as libc::c_long,
            files.as_ptr(),
            files.len() as libc::c_long,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
