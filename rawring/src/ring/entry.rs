use io_uring::{opcode, squeue};
use std::os::fd::RawFd;

/// The operations this crate puts on the ring.
///
/// Numeric codes come from the `io_uring` crate so they track the kernel
/// headers it is generated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Readv,
    Accept,
    Send,
    Recv,
}

impl Opcode {
    pub const fn code(self) -> u8 {
        match self {
            Opcode::Nop => opcode::Nop::CODE,
            Opcode::Readv => opcode::Readv::CODE,
            Opcode::Accept => opcode::Accept::CODE,
            Opcode::Send => opcode::Send::CODE,
            Opcode::Recv => opcode::Recv::CODE,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        [
            Opcode::Nop,
            Opcode::Readv,
            Opcode::Accept,
            Opcode::Send,
            Opcode::Recv,
        ]
        .into_iter()
        .find(|op| op.code() == code)
    }
}

/// What a submission operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A plain file descriptor.
    Fd(RawFd),

    /// An index into the ring's registered descriptor table.
    Fixed(u32),
}

/// `struct io_uring_sqe`, 64 bytes.
///
/// Only the fields this crate needs have named accessors; unions in the
/// kernel definition are flattened to their first member.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionEntry {
    opcode: u8,
    flags: u8,
    ioprio: u16,
    fd: i32,
    off: u64,
    addr: u64,
    len: u32,
    op_flags: u32,
    user_data: u64,
    buf_index: u16,
    personality: u16,
    file_index: u32,
    addr3: u64,
    pad: u64,
}

impl SubmissionEntry {
    /// Generic constructor mirroring the `submit(opcode, target, buffer,
    /// length, offset, tag)` shape of the transport.
    pub fn new(opcode: Opcode, target: Target, addr: u64, len: u32, offset: u64) -> Self {
        let (fd, flags) = match target {
            Target::Fd(fd) => (fd, 0),
            Target::Fixed(index) => (index as i32, squeue::Flags::FIXED_FILE.bits()),
        };

        Self {
            opcode: opcode.code(),
            flags,
            fd,
            off: offset,
            addr,
            len,
            ..Default::default()
        }
    }

    pub fn nop() -> Self {
        Self::new(Opcode::Nop, Target::Fd(-1), 0, 0, 0)
    }

    /// Accept on a listening socket without reporting the peer address.
    /// The new descriptor is created close-on-exec.
    pub fn accept(listener: RawFd) -> Self {
        let mut sqe = Self::new(Opcode::Accept, Target::Fd(listener), 0, 0, 0);
        sqe.op_flags = libc::SOCK_CLOEXEC as u32;
        sqe
    }

    pub fn recv(fd: RawFd, buf: *mut u8, len: u32) -> Self {
        Self::new(Opcode::Recv, Target::Fd(fd), buf as u64, len, 0)
    }

    /// Send without raising SIGPIPE when the peer is gone.
    pub fn send(fd: RawFd, buf: *const u8, len: u32) -> Self {
        let mut sqe = Self::new(Opcode::Send, Target::Fd(fd), buf as u64, len, 0);
        sqe.op_flags = libc::MSG_NOSIGNAL as u32;
        sqe
    }

    /// Scatter read of `iovecs` iovec entries into `iov`.
    pub fn readv(target: Target, iov: *const libc::iovec, iovecs: u32, offset: u64) -> Self {
        Self::new(Opcode::Readv, target, iov as u64, iovecs, offset)
    }

    /// Sets the opaque value the kernel hands back in the completion.
    #[must_use]
    pub fn user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_code(self.opcode)
    }

    pub fn get_user_data(&self) -> u64 {
        self.user_data
    }

    pub fn target(&self) -> Target {
        if self.flags & squeue::Flags::FIXED_FILE.bits() != 0 {
            Target::Fixed(self.fd as u32)
        } else {
            Target::Fd(self.fd)
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn offset(&self) -> u64 {
        self.off
    }

    pub fn op_flags(&self) -> u32 {
        self.op_flags
    }
}

/// `struct io_uring_cqe`, 16 bytes.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    user_data: u64,
    res: i32,
    flags: u32,
}

impl CompletionEntry {
    pub fn new(user_data: u64, res: i32) -> Self {
        Self {
            user_data,
            res,
            flags: 0,
        }
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// `-errno` on failure, otherwise a byte count or a new descriptor.
    pub fn result(&self) -> i32 {
        self.res
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}
