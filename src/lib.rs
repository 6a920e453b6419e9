//! proact - completion-based async I/O over io_uring and kqueue.
//!
//! This crate exposes POSIX-style file-descriptor operations (accept,
//! connect, close, read, write, recv, send, recvmsg, sendmsg, fsync,
//! openat, timeout, cancel) behind a single completion-based API with two
//! native backends: io_uring on Linux and kqueue on macOS. A caller submits
//! an operation together with a stable [`Completion`] record and a typed
//! callback; the engine later dispatches the callback with the operation's
//! typed result when the kernel reports completion.
//!
//! # Model
//!
//! - **Caller-owned storage**: a [`Completion`] (or [`LinkedCompletion`])
//!   is the only per-operation memory. The engine allocates nothing per
//!   operation; records are threaded through intrusive queues and their
//!   addresses identify operations to the kernel.
//! - **Single-threaded**: one engine instance is driven by one thread.
//!   Callbacks run synchronously from [`Engine::tick`] and may submit
//!   follow-up operations, which are processed on the next iteration.
//! - **Uniform errors**: every operation has a closed, typed error set;
//!   unknown errnos surface as that operation's `Unexpected` variant, and
//!   EINTR is retried transparently.
//! - **Linked timeouts**: the `*_with_timeout` submitters pair a main
//!   operation with a timeout so that exactly one half wins and the other
//!   observes `Canceled`. io_uring expresses the pair as a kernel link;
//!   kqueue synthesizes it with cross-cancels.
//!
//! # Quick start
//!
//! ```ignore
//! use proact::{Completion, Engine};
//!
//! struct Ctx { done: bool }
//!
//! fn fired(ctx: &mut Ctx, _io: &mut Engine, _c: &mut Completion,
//!          result: Result<(), proact::TimeoutError>) {
//!     result.unwrap();
//!     ctx.done = true;
//! }
//!
//! let mut io = Engine::new(32)?;
//! let mut ctx = Ctx { done: false };
//! let mut completion = Completion::new();
//! io.timeout(&mut ctx as *mut Ctx, fired, &mut completion, 10_000_000);
//! while !ctx.done {
//!     io.tick()?;
//! }
//! ```

mod completion;
mod engine;
mod error;
mod fifo;
mod op;
mod time;

#[cfg(target_os = "linux")]
mod uring;

#[cfg(target_os = "macos")]
mod kqueue;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("this crate supports only Linux (io_uring) and macOS (kqueue)");

pub use completion::{Completion, LinkedCompletion};
pub use engine::{
    AcceptCallback, CancelCallback, CancelTimeoutCallback, CloseCallback, Config, ConnectCallback,
    ConnectTimeoutCallback, Engine, FsyncCallback, OpenAtCallback, ReadCallback, RecvCallback,
    RecvMsgCallback, RecvMsgTimeoutCallback, RecvTimeoutCallback, SendCallback, SendMsgCallback,
    SendMsgTimeoutCallback, SendTimeoutCallback, TimeoutCallback, WriteCallback,
};
pub use error::{
    AcceptError, CancelError, CancelTimeoutError, CloseError, ConnectError, FsyncError,
    OpenAtError, ReadError, RecvError, SendError, TimeoutError, WriteError,
};
pub use op::{buffer_limit, KernelTimespec, OpTag, Operation};
pub use time::monotonic_ns;
