//! Operation descriptors.
//!
//! An [`Operation`] is a tagged union describing one kernel entry together
//! with exactly the parameters that entry needs. Buffer fields are raw
//! pointers into caller-owned memory; the caller keeps them valid until the
//! completion's callback fires.

use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use crate::completion::Completion;

/// Kernel-facing timespec storage.
///
/// Layout-compatible with `__kernel_timespec` so a pointer to it can be
/// handed to io_uring timeout SQEs, while staying portable to the kqueue
/// backend (which only reads the nanosecond deadline next to it).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl KernelTimespec {
    /// Split a nanosecond count into seconds and nanoseconds.
    #[inline]
    pub fn from_ns(ns: u64) -> Self {
        Self {
            tv_sec: (ns / 1_000_000_000) as i64,
            tv_nsec: (ns % 1_000_000_000) as i64,
        }
    }
}

/// Discriminant of an [`Operation`], without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpTag {
    Nop,
    Accept,
    Cancel,
    CancelTimeout,
    Close,
    Connect,
    Fsync,
    LinkTimeout,
    OpenAt,
    Read,
    Recv,
    RecvMsg,
    Send,
    SendMsg,
    Timeout,
    Write,
}

/// Describes one I/O operation and its parameters.
///
/// `Nop` is the sentinel for a completion that has never been submitted.
/// The cancel variants carry a non-owning pointer identifying the target
/// completion; it is only compared or looked up by address, never
/// dereferenced after the target completes.
pub enum Operation {
    Nop,
    Accept {
        socket: RawFd,
        /// Peer address written by the kernel. Kept so a future accessor
        /// can surface it without a layout change.
        address: libc::sockaddr_storage,
        address_len: libc::socklen_t,
    },
    Cancel {
        target: NonNull<Completion>,
    },
    CancelTimeout {
        target: NonNull<Completion>,
    },
    Close {
        fd: RawFd,
    },
    Connect {
        socket: RawFd,
        address: libc::sockaddr_storage,
        address_len: libc::socklen_t,
        /// Set once the readiness backend has issued `connect(2)`, so the
        /// writability path checks `SO_ERROR` instead of reconnecting.
        initiated: bool,
    },
    Fsync {
        fd: RawFd,
    },
    LinkTimeout {
        timespec: KernelTimespec,
    },
    OpenAt {
        dir_fd: RawFd,
        path: NonNull<libc::c_char>,
        flags: libc::c_int,
        mode: libc::mode_t,
    },
    Read {
        fd: RawFd,
        buf: NonNull<u8>,
        len: usize,
        offset: u64,
    },
    Recv {
        socket: RawFd,
        buf: NonNull<u8>,
        len: usize,
    },
    RecvMsg {
        socket: RawFd,
        msg: NonNull<libc::msghdr>,
    },
    Send {
        socket: RawFd,
        buf: NonNull<u8>,
        len: usize,
    },
    SendMsg {
        socket: RawFd,
        msg: NonNull<libc::msghdr>,
    },
    Timeout {
        /// Absolute `CLOCK_MONOTONIC` expiry in nanoseconds. The kqueue
        /// backend polls this; io_uring uses the relative timespec below.
        expires: u64,
        timespec: KernelTimespec,
    },
    Write {
        fd: RawFd,
        buf: NonNull<u8>,
        len: usize,
        offset: u64,
    },
}

impl Operation {
    /// The discriminant of this operation.
    pub fn tag(&self) -> OpTag {
        match self {
            Operation::Nop => OpTag::Nop,
            Operation::Accept { .. } => OpTag::Accept,
            Operation::Cancel { .. } => OpTag::Cancel,
            Operation::CancelTimeout { .. } => OpTag::CancelTimeout,
            Operation::Close { .. } => OpTag::Close,
            Operation::Connect { .. } => OpTag::Connect,
            Operation::Fsync { .. } => OpTag::Fsync,
            Operation::LinkTimeout { .. } => OpTag::LinkTimeout,
            Operation::OpenAt { .. } => OpTag::OpenAt,
            Operation::Read { .. } => OpTag::Read,
            Operation::Recv { .. } => OpTag::Recv,
            Operation::RecvMsg { .. } => OpTag::RecvMsg,
            Operation::Send { .. } => OpTag::Send,
            Operation::SendMsg { .. } => OpTag::SendMsg,
            Operation::Timeout { .. } => OpTag::Timeout,
            Operation::Write { .. } => OpTag::Write,
        }
    }

    /// Returns `true` if this is an actual operation (not the sentinel).
    #[inline]
    pub fn is_active(&self) -> bool {
        !matches!(self, Operation::Nop)
    }
}

/// Clamp a buffer length to the per-platform kernel maximum.
///
/// Past these sizes the kernel rejects the transfer with `EINVAL`, so
/// submitters clamp instead of forwarding the full length.
#[inline]
pub fn buffer_limit(len: usize) -> usize {
    #[cfg(target_os = "linux")]
    const MAX: usize = 0x7fff_f000;
    #[cfg(target_os = "macos")]
    const MAX: usize = 0x7fff_ffff;
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    const MAX: usize = isize::MAX as usize;

    len.min(MAX)
}

/// Convert a socket address into kernel sockaddr storage.
pub(crate) fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: sockaddr_storage is sized and aligned for any sockaddr.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            #[cfg(target_os = "macos")]
            {
                sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: as above.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            #[cfg(target_os = "macos")]
            {
                sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}
