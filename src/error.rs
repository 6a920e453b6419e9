//! Per-operation error types and errno translation.
//!
//! The kernel reports completions as a signed word: a non-negative value on
//! success or a negated errno on failure. Each operation has a closed error
//! set; decoding happens once, at callback dispatch, so backends only move
//! raw results around. An errno outside an operation's set maps to that
//! operation's `Unexpected` variant, carrying the raw value for diagnosis.

use std::os::unix::io::RawFd;

use thiserror::Error;

/// Errors reported by `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcceptError {
    #[error("resource temporarily unavailable")]
    Again,
    #[error("invalid file descriptor")]
    FileDescriptorInvalid,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("socket is not listening")]
    SocketNotListening,
    #[error("process file descriptor quota exceeded")]
    ProcessFdQuotaExceeded,
    #[error("system file descriptor quota exceeded")]
    SystemFdQuotaExceeded,
    #[error("system resources exhausted")]
    SystemResources,
    #[error("file descriptor is not a socket")]
    FileDescriptorNotASocket,
    #[error("operation not supported")]
    OperationNotSupported,
    #[error("permission denied")]
    PermissionDenied,
    #[error("protocol failure")]
    ProtocolFailure,
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

impl AcceptError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => AcceptError::Again,
            libc::EBADF => AcceptError::FileDescriptorInvalid,
            libc::ECONNABORTED => AcceptError::ConnectionAborted,
            libc::EINVAL => AcceptError::SocketNotListening,
            libc::EMFILE => AcceptError::ProcessFdQuotaExceeded,
            libc::ENFILE => AcceptError::SystemFdQuotaExceeded,
            libc::ENOBUFS | libc::ENOMEM => AcceptError::SystemResources,
            libc::ENOTSOCK => AcceptError::FileDescriptorNotASocket,
            libc::EOPNOTSUPP => AcceptError::OperationNotSupported,
            libc::EPERM => AcceptError::PermissionDenied,
            libc::EPROTO => AcceptError::ProtocolFailure,
            libc::ECANCELED => AcceptError::Canceled,
            other => AcceptError::Unexpected(other),
        }
    }
}

/// Errors reported by `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("access denied")]
    AccessDenied,
    #[error("address already in use")]
    AddressInUse,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("connection attempt already in progress")]
    OpenAlreadyInProgress,
    #[error("invalid file descriptor")]
    FileDescriptorInvalid,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("no such file or directory")]
    FileNotFound,
    #[error("file descriptor is not a socket")]
    FileDescriptorNotASocket,
    #[error("permission denied")]
    PermissionDenied,
    #[error("protocol not supported")]
    ProtocolNotSupported,
    #[error("connection timed out")]
    ConnectionTimedOut,
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

impl ConnectError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EACCES => ConnectError::AccessDenied,
            libc::EADDRINUSE => ConnectError::AddressInUse,
            libc::EADDRNOTAVAIL => ConnectError::AddressNotAvailable,
            libc::EAFNOSUPPORT => ConnectError::AddressFamilyNotSupported,
            libc::EAGAIN | libc::EINPROGRESS => ConnectError::Again,
            libc::EALREADY => ConnectError::OpenAlreadyInProgress,
            libc::EBADF => ConnectError::FileDescriptorInvalid,
            libc::ECONNREFUSED => ConnectError::ConnectionRefused,
            libc::EISCONN => ConnectError::AlreadyConnected,
            libc::ENETUNREACH => ConnectError::NetworkUnreachable,
            libc::ENOENT => ConnectError::FileNotFound,
            libc::ENOTSOCK => ConnectError::FileDescriptorNotASocket,
            libc::EPERM => ConnectError::PermissionDenied,
            libc::EPROTOTYPE | libc::EPROTONOSUPPORT => ConnectError::ProtocolNotSupported,
            libc::ETIMEDOUT => ConnectError::ConnectionTimedOut,
            libc::ECANCELED => ConnectError::Canceled,
            other => ConnectError::Unexpected(other),
        }
    }
}

/// Errors reported by `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseError {
    #[error("invalid file descriptor")]
    FileDescriptorInvalid,
    #[error("disk quota exceeded")]
    DiskQuota,
    #[error("input/output error")]
    InputOutput,
    #[error("no space left on device")]
    NoSpaceLeft,
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

impl CloseError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBADF => CloseError::FileDescriptorInvalid,
            libc::EDQUOT => CloseError::DiskQuota,
            libc::EIO => CloseError::InputOutput,
            libc::ENOSPC => CloseError::NoSpaceLeft,
            libc::ECANCELED => CloseError::Canceled,
            other => CloseError::Unexpected(other),
        }
    }
}

/// Errors reported by `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("resource temporarily unavailable")]
    Again,
    #[error("file descriptor not open for reading")]
    NotOpenForReading,
    #[error("buffer or offset alignment invalid")]
    Alignment,
    #[error("input/output error")]
    InputOutput,
    #[error("file descriptor is a directory")]
    IsDir,
    #[error("system resources exhausted")]
    SystemResources,
    #[error("file descriptor is not seekable")]
    Unseekable,
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

impl ReadError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => ReadError::Again,
            libc::EBADF => ReadError::NotOpenForReading,
            libc::EINVAL => ReadError::Alignment,
            libc::EIO => ReadError::InputOutput,
            libc::EISDIR => ReadError::IsDir,
            libc::ENOBUFS | libc::ENOMEM => ReadError::SystemResources,
            libc::ENXIO | libc::ESPIPE | libc::EOVERFLOW => ReadError::Unseekable,
            libc::ECANCELED => ReadError::Canceled,
            other => ReadError::Unexpected(other),
        }
    }
}

/// Errors reported by `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("resource temporarily unavailable")]
    Again,
    #[error("file descriptor not open for writing")]
    NotOpenForWriting,
    #[error("socket not connected")]
    NotConnected,
    #[error("buffer or offset alignment invalid")]
    Alignment,
    #[error("disk quota exceeded")]
    DiskQuota,
    #[error("file too big")]
    FileTooBig,
    #[error("input/output error")]
    InputOutput,
    #[error("file descriptor is a directory")]
    IsDir,
    #[error("no space left on device")]
    NoSpaceLeft,
    #[error("system resources exhausted")]
    SystemResources,
    #[error("file descriptor is not seekable")]
    Unseekable,
    #[error("access denied")]
    AccessDenied,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

impl WriteError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => WriteError::Again,
            libc::EBADF => WriteError::NotOpenForWriting,
            libc::EDESTADDRREQ => WriteError::NotConnected,
            libc::EINVAL => WriteError::Alignment,
            libc::EDQUOT => WriteError::DiskQuota,
            libc::EFBIG => WriteError::FileTooBig,
            libc::EIO => WriteError::InputOutput,
            libc::EISDIR => WriteError::IsDir,
            libc::ENOSPC => WriteError::NoSpaceLeft,
            libc::ENOBUFS | libc::ENOMEM => WriteError::SystemResources,
            libc::ENXIO | libc::ESPIPE | libc::EOVERFLOW => WriteError::Unseekable,
            libc::EACCES | libc::EPERM => WriteError::AccessDenied,
            libc::EPIPE => WriteError::BrokenPipe,
            libc::ECANCELED => WriteError::Canceled,
            other => WriteError::Unexpected(other),
        }
    }
}

/// Errors reported by `recv` and `recvmsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("resource temporarily unavailable")]
    Again,
    #[error("invalid file descriptor")]
    FileDescriptorInvalid,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("system resources exhausted")]
    SystemResources,
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("file descriptor is not a socket")]
    FileDescriptorNotASocket,
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

impl RecvError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => RecvError::Again,
            libc::EBADF => RecvError::FileDescriptorInvalid,
            libc::ECONNREFUSED => RecvError::ConnectionRefused,
            libc::ENOBUFS | libc::ENOMEM => RecvError::SystemResources,
            libc::ENOTCONN => RecvError::SocketNotConnected,
            libc::ENOTSOCK => RecvError::FileDescriptorNotASocket,
            libc::ECONNRESET => RecvError::ConnectionResetByPeer,
            libc::ECANCELED => RecvError::Canceled,
            other => RecvError::Unexpected(other),
        }
    }
}

/// Errors reported by `send` and `sendmsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("access denied")]
    AccessDenied,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("TCP fast open already in progress")]
    FastOpenAlreadyInProgress,
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    #[error("invalid file descriptor")]
    FileDescriptorInvalid,
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("message too big")]
    MessageTooBig,
    #[error("system resources exhausted")]
    SystemResources,
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("file descriptor is not a socket")]
    FileDescriptorNotASocket,
    #[error("operation not supported")]
    OperationNotSupported,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

impl SendError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EACCES => SendError::AccessDenied,
            libc::EAGAIN => SendError::Again,
            libc::EALREADY => SendError::FastOpenAlreadyInProgress,
            libc::EAFNOSUPPORT => SendError::AddressFamilyNotSupported,
            libc::EBADF => SendError::FileDescriptorInvalid,
            libc::ECONNRESET => SendError::ConnectionResetByPeer,
            libc::EMSGSIZE => SendError::MessageTooBig,
            libc::ENOBUFS | libc::ENOMEM => SendError::SystemResources,
            libc::ENOTCONN => SendError::SocketNotConnected,
            libc::ENOTSOCK => SendError::FileDescriptorNotASocket,
            libc::EOPNOTSUPP => SendError::OperationNotSupported,
            libc::EPIPE => SendError::BrokenPipe,
            libc::ECANCELED => SendError::Canceled,
            other => SendError::Unexpected(other),
        }
    }
}

/// Errors reported by `fsync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsyncError {
    #[error("invalid file descriptor")]
    FileDescriptorInvalid,
    #[error("disk quota exceeded")]
    DiskQuota,
    #[error("invalid arguments")]
    ArgumentsInvalid,
    #[error("input/output error")]
    InputOutput,
    #[error("no space left on device")]
    NoSpaceLeft,
    #[error("read-only file system")]
    ReadOnlyFileSystem,
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

impl FsyncError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBADF => FsyncError::FileDescriptorInvalid,
            libc::EDQUOT => FsyncError::DiskQuota,
            libc::EINVAL => FsyncError::ArgumentsInvalid,
            libc::EIO => FsyncError::InputOutput,
            libc::ENOSPC => FsyncError::NoSpaceLeft,
            libc::EROFS => FsyncError::ReadOnlyFileSystem,
            libc::ECANCELED => FsyncError::Canceled,
            other => FsyncError::Unexpected(other),
        }
    }
}

/// Errors reported by `openat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpenAtError {
    #[error("access denied")]
    AccessDenied,
    #[error("invalid file descriptor")]
    FileDescriptorInvalid,
    #[error("device busy")]
    DeviceBusy,
    #[error("path already exists")]
    PathAlreadyExists,
    #[error("file too big")]
    FileTooBig,
    #[error("invalid arguments")]
    ArgumentsInvalid,
    #[error("path is a directory")]
    IsDir,
    #[error("symbolic link loop")]
    SymLinkLoop,
    #[error("process file descriptor quota exceeded")]
    ProcessFdQuotaExceeded,
    #[error("name too long")]
    NameTooLong,
    #[error("system file descriptor quota exceeded")]
    SystemFdQuotaExceeded,
    #[error("no such device")]
    NoDevice,
    #[error("no such file or directory")]
    FileNotFound,
    #[error("system resources exhausted")]
    SystemResources,
    #[error("no space left on device")]
    NoSpaceLeft,
    #[error("path component is not a directory")]
    NotDir,
    #[error("file locks not supported")]
    FileLocksNotSupported,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

impl OpenAtError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EACCES => OpenAtError::AccessDenied,
            libc::EBADF => OpenAtError::FileDescriptorInvalid,
            libc::EBUSY | libc::ETXTBSY => OpenAtError::DeviceBusy,
            libc::EEXIST => OpenAtError::PathAlreadyExists,
            libc::EFBIG | libc::EOVERFLOW => OpenAtError::FileTooBig,
            libc::EINVAL => OpenAtError::ArgumentsInvalid,
            libc::EISDIR => OpenAtError::IsDir,
            libc::ELOOP => OpenAtError::SymLinkLoop,
            libc::EMFILE => OpenAtError::ProcessFdQuotaExceeded,
            libc::ENAMETOOLONG => OpenAtError::NameTooLong,
            libc::ENFILE => OpenAtError::SystemFdQuotaExceeded,
            libc::ENODEV | libc::ENXIO => OpenAtError::NoDevice,
            libc::ENOENT => OpenAtError::FileNotFound,
            libc::ENOMEM => OpenAtError::SystemResources,
            libc::ENOSPC => OpenAtError::NoSpaceLeft,
            libc::ENOTDIR => OpenAtError::NotDir,
            libc::EOPNOTSUPP => OpenAtError::FileLocksNotSupported,
            libc::EAGAIN => OpenAtError::Again,
            libc::ECANCELED => OpenAtError::Canceled,
            other => OpenAtError::Unexpected(other),
        }
    }
}

/// Errors reported by `timeout` and link timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeoutError {
    #[error("operation canceled")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

/// Errors reported by `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("target is already being canceled")]
    AlreadyInProgress,
    #[error("target not found")]
    NotFound,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

/// Errors reported by `cancel_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelTimeoutError {
    #[error("target is already firing")]
    AlreadyInProgress,
    #[error("target not found")]
    NotFound,
    #[error("target had already completed")]
    Canceled,
    #[error("unexpected errno: {0}")]
    Unexpected(i32),
}

// ============================================================================
// Raw result decoding
// ============================================================================

pub(crate) fn decode_accept(raw: i32) -> Result<RawFd, AcceptError> {
    if raw >= 0 {
        Ok(raw as RawFd)
    } else {
        Err(AcceptError::from_errno(-raw))
    }
}

pub(crate) fn decode_connect(raw: i32) -> Result<(), ConnectError> {
    if raw >= 0 {
        Ok(())
    } else {
        Err(ConnectError::from_errno(-raw))
    }
}

pub(crate) fn decode_close(raw: i32) -> Result<(), CloseError> {
    // EINTR on close is success: the fd state is unspecified afterwards and
    // retrying can close an unrelated descriptor.
    if raw >= 0 || raw == -libc::EINTR {
        Ok(())
    } else {
        Err(CloseError::from_errno(-raw))
    }
}

pub(crate) fn decode_read(raw: i32) -> Result<usize, ReadError> {
    if raw >= 0 {
        Ok(raw as usize)
    } else {
        Err(ReadError::from_errno(-raw))
    }
}

pub(crate) fn decode_write(raw: i32) -> Result<usize, WriteError> {
    if raw >= 0 {
        Ok(raw as usize)
    } else {
        Err(WriteError::from_errno(-raw))
    }
}

pub(crate) fn decode_recv(raw: i32) -> Result<usize, RecvError> {
    if raw >= 0 {
        Ok(raw as usize)
    } else {
        Err(RecvError::from_errno(-raw))
    }
}

pub(crate) fn decode_send(raw: i32) -> Result<usize, SendError> {
    if raw >= 0 {
        Ok(raw as usize)
    } else {
        Err(SendError::from_errno(-raw))
    }
}

pub(crate) fn decode_fsync(raw: i32) -> Result<(), FsyncError> {
    if raw >= 0 {
        Ok(())
    } else {
        Err(FsyncError::from_errno(-raw))
    }
}

pub(crate) fn decode_openat(raw: i32) -> Result<RawFd, OpenAtError> {
    if raw >= 0 {
        Ok(raw as RawFd)
    } else {
        Err(OpenAtError::from_errno(-raw))
    }
}

pub(crate) fn decode_timeout(raw: i32) -> Result<(), TimeoutError> {
    // ETIME is how the kernel reports a timer that fired; a zero result
    // means the timeout was satisfied by its completion count. Both are
    // success for the submitter.
    if raw >= 0 || raw == -libc::ETIME {
        Ok(())
    } else if raw == -libc::ECANCELED {
        Err(TimeoutError::Canceled)
    } else {
        Err(TimeoutError::Unexpected(-raw))
    }
}

pub(crate) fn decode_cancel(raw: i32) -> Result<(), CancelError> {
    if raw >= 0 {
        Ok(())
    } else {
        match -raw {
            libc::EALREADY => Err(CancelError::AlreadyInProgress),
            libc::ENOENT => Err(CancelError::NotFound),
            other => Err(CancelError::Unexpected(other)),
        }
    }
}

pub(crate) fn decode_cancel_timeout(raw: i32) -> Result<(), CancelTimeoutError> {
    if raw >= 0 {
        Ok(())
    } else {
        match -raw {
            libc::EBUSY | libc::EALREADY => Err(CancelTimeoutError::AlreadyInProgress),
            libc::ENOENT => Err(CancelTimeoutError::NotFound),
            libc::ECANCELED => Err(CancelTimeoutError::Canceled),
            other => Err(CancelTimeoutError::Unexpected(other)),
        }
    }
}
