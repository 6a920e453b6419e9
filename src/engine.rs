//! Engine facade.
//!
//! One [`Engine`] instance is driven by one thread. Submitters fill a
//! caller-owned [`Completion`] and hand it to the backend; [`Engine::tick`]
//! flushes submissions, harvests completions, and dispatches callbacks.
//! Callbacks receive the engine handle so follow-up operations can be
//! submitted from inside them; those submissions are processed on the next
//! iteration of the surrounding tick loop, never during the same sweep.

use std::ffi::{c_void, CStr};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::completion::{Completion, LinkedCompletion, Thunk};
use crate::error::{
    self, AcceptError, CancelError, CancelTimeoutError, CloseError, ConnectError, FsyncError,
    OpenAtError, ReadError, RecvError, SendError, TimeoutError, WriteError,
};
use crate::op::{self, buffer_limit, KernelTimespec, Operation};
use crate::time;

#[cfg(target_os = "linux")]
use crate::uring::UringDriver as Driver;

#[cfg(target_os = "macos")]
use crate::kqueue::KqueueDriver as Driver;

/// Engine configuration.
///
/// `entries` bounds the number of submissions the backend accepts before
/// overflowing to the engine's own queue; it must be at least the expected
/// number of concurrent operations for full throughput, but correctness
/// does not depend on it. The sqpoll fields configure io_uring submission
/// queue polling and are ignored by the kqueue backend.
#[derive(Debug, Clone)]
pub struct Config {
    /// Submission queue depth. Power of two, 1..=4096.
    pub entries: u16,
    /// Enable kernel submission-queue polling (io_uring only).
    pub sqpoll: bool,
    /// Idle time before the sqpoll thread sleeps, in milliseconds.
    pub sqpoll_idle_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entries: 256,
            sqpoll: false,
            sqpoll_idle_ms: 1000,
        }
    }
}

// ============================================================================
// Callback signatures
// ============================================================================

pub type AcceptCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<RawFd, AcceptError>);
pub type CloseCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<(), CloseError>);
pub type ConnectCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<(), ConnectError>);
pub type FsyncCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<(), FsyncError>);
pub type OpenAtCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<RawFd, OpenAtError>);
pub type ReadCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<usize, ReadError>);
pub type RecvCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<usize, RecvError>);
pub type RecvMsgCallback<C> = RecvCallback<C>;
pub type SendCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<usize, SendError>);
pub type SendMsgCallback<C> = SendCallback<C>;
pub type WriteCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<usize, WriteError>);
pub type TimeoutCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<(), TimeoutError>);
pub type CancelCallback<C> = fn(&mut C, &mut Engine, &mut Completion, Result<(), CancelError>);
pub type CancelTimeoutCallback<C> =
    fn(&mut C, &mut Engine, &mut Completion, Result<(), CancelTimeoutError>);

pub type ConnectTimeoutCallback<C> =
    fn(&mut C, &mut Engine, &mut LinkedCompletion, Result<(), ConnectError>);
pub type RecvTimeoutCallback<C> =
    fn(&mut C, &mut Engine, &mut LinkedCompletion, Result<usize, RecvError>);
pub type RecvMsgTimeoutCallback<C> = RecvTimeoutCallback<C>;
pub type SendTimeoutCallback<C> =
    fn(&mut C, &mut Engine, &mut LinkedCompletion, Result<usize, SendError>);
pub type SendMsgTimeoutCallback<C> = SendTimeoutCallback<C>;

// ============================================================================
// Engine
// ============================================================================

/// Single-threaded completion-based I/O engine.
///
/// # Caller obligations
///
/// Every submitter shares the same contract:
///
/// - the completion's address is stable until its callback fires
/// - buffers, paths and msghdrs referenced by the operation stay valid
///   until the callback fires
/// - `context` points to storage that is valid at dispatch time
///
/// Exactly one callback fires per submission. Dropping the engine closes
/// the backend; callbacks for operations still in flight never fire.
pub struct Engine {
    backend: Driver,
    total_submitted: u64,
    total_completed: u64,
}

impl Engine {
    /// Create an engine with the default configuration and the given
    /// submission queue depth.
    pub fn new(entries: u16) -> io::Result<Self> {
        Self::with_config(Config {
            entries,
            ..Config::default()
        })
    }

    /// Create an engine from a full configuration.
    ///
    /// # Panics
    ///
    /// Panics if `entries` is zero, not a power of two, or above 4096.
    pub fn with_config(config: Config) -> io::Result<Self> {
        assert!(config.entries >= 1);
        assert!(config.entries <= 4096);
        assert!(config.entries.is_power_of_two());

        let backend = Driver::new(&config)?;
        debug!(entries = config.entries, "engine initialized");
        Ok(Self {
            backend,
            total_submitted: 0,
            total_completed: 0,
        })
    }

    /// Consume the engine, closing the backend.
    ///
    /// Outstanding submissions are abandoned and their callbacks never
    /// fire; drive the engine to quiescence first if that matters.
    pub fn deinit(self) {
        drop(self);
    }

    /// True when no operation is queued, in flight, or awaiting dispatch.
    pub fn is_idle(&self) -> bool {
        self.backend.is_idle()
    }

    /// Operations accepted by the submitters so far.
    pub fn total_submitted(&self) -> u64 {
        self.total_submitted
    }

    /// Callbacks dispatched so far.
    pub fn total_completed(&self) -> u64 {
        self.total_completed
    }

    /// One engine step: flush submissions, harvest completions, dispatch
    /// callbacks from a snapshot, then retry overflowed submissions.
    ///
    /// Does not wait for completions. Callbacks run synchronously here;
    /// submissions they make are picked up on the next call.
    #[cfg(target_os = "linux")]
    pub fn tick(&mut self) -> io::Result<()> {
        self.backend.flush(0)?;
        self.backend.harvest();
        self.dispatch_completed();
        self.backend.retry_unqueued();
        Ok(())
    }

    /// One engine step: register pending work, reap readiness events and
    /// expired timers, then dispatch callbacks from a snapshot.
    #[cfg(target_os = "macos")]
    pub fn tick(&mut self) -> io::Result<()> {
        self.backend.poll(false)?;
        self.dispatch_completed();
        Ok(())
    }

    /// Drive the engine for at least `ns` nanoseconds of monotonic time.
    ///
    /// Submissions continue to be flushed and callbacks dispatched while
    /// waiting. Returns no earlier than the deadline.
    #[cfg(target_os = "linux")]
    pub fn run_for_ns(&mut self, ns: u64) -> io::Result<()> {
        let deadline = time::monotonic_ns().saturating_add(ns);
        let ts = KernelTimespec::from_ns(deadline);

        self.backend.begin_run();
        loop {
            self.backend.arm_run_timeout(&ts)?;
            self.backend.flush(1)?;
            self.backend.harvest();
            self.dispatch_completed();
            self.backend.retry_unqueued();
            if self.backend.run_deadline_hit() {
                break;
            }
        }

        // The deadline timespec lives in this frame: reap every remaining
        // internal timer before returning. The deadline has passed, so they
        // all fire promptly.
        while self.backend.run_timeouts_inflight() > 0 {
            self.backend.flush(0)?;
            self.backend.harvest();
            self.dispatch_completed();
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Drive the engine for at least `ns` nanoseconds of monotonic time.
    #[cfg(target_os = "macos")]
    pub fn run_for_ns(&mut self, ns: u64) -> io::Result<()> {
        fn deadline_reached(
            done: &mut bool,
            _io: &mut Engine,
            _completion: &mut Completion,
            _result: Result<(), TimeoutError>,
        ) {
            *done = true;
        }

        let mut done = false;
        let mut completion = Completion::new();
        // SAFETY-relevant: both locals outlive the loop below, which runs
        // until the timer has dispatched.
        self.timeout(
            &mut done as *mut bool,
            deadline_reached,
            &mut completion,
            ns,
        );
        while !done {
            self.backend.poll(true)?;
            self.dispatch_completed();
        }
        Ok(())
    }

    /// Dispatch callbacks for everything on the completed list.
    ///
    /// Works on a snapshot so completions produced by these callbacks are
    /// deferred to the next sweep, keeping recursion bounded.
    fn dispatch_completed(&mut self) -> u32 {
        let mut snapshot = self.backend.take_completed();
        let mut dispatched: u32 = 0;
        while let Some(completion) = snapshot.pop() {
            // SAFETY: completions on the list are live caller storage; the
            // thunk was installed by the submitter for this very record.
            let (thunk, context, user_fn) = unsafe {
                let c = completion.as_ptr();
                ((*c).thunk.take(), (*c).context, (*c).user_fn)
            };
            self.total_completed += 1;
            dispatched += 1;
            if let Some(thunk) = thunk {
                // SAFETY: context and user_fn are exactly what the matching
                // submitter stored.
                unsafe { thunk(context, user_fn, self, completion) };
            }
        }
        debug_assert!(self.total_completed <= self.total_submitted);
        dispatched
    }

    fn submit(
        &mut self,
        completion: &mut Completion,
        operation: Operation,
        context: *mut c_void,
        user_fn: *const (),
        thunk: Thunk,
    ) {
        completion.prepare(operation, context, user_fn, thunk);
        self.total_submitted += 1;
        self.backend.enqueue(NonNull::from(completion));
    }

    // ========================================================================
    // Submitters
    // ========================================================================

    /// Accept one connection on a listening socket.
    pub fn accept<C>(
        &mut self,
        context: *mut C,
        callback: AcceptCallback<C>,
        completion: &mut Completion,
        socket: RawFd,
    ) {
        self.submit(
            completion,
            Operation::Accept {
                socket,
                address: unsafe { mem::zeroed() },
                address_len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            },
            context as *mut c_void,
            callback as *const (),
            accept_thunk::<C>,
        );
    }

    /// Close a file descriptor.
    pub fn close<C>(
        &mut self,
        context: *mut C,
        callback: CloseCallback<C>,
        completion: &mut Completion,
        fd: RawFd,
    ) {
        self.submit(
            completion,
            Operation::Close { fd },
            context as *mut c_void,
            callback as *const (),
            close_thunk::<C>,
        );
    }

    /// Connect a socket to `addr`.
    pub fn connect<C>(
        &mut self,
        context: *mut C,
        callback: ConnectCallback<C>,
        completion: &mut Completion,
        socket: RawFd,
        addr: SocketAddr,
    ) {
        let (address, address_len) = op::sockaddr_from(&addr);
        self.submit(
            completion,
            Operation::Connect {
                socket,
                address,
                address_len,
                initiated: false,
            },
            context as *mut c_void,
            callback as *const (),
            connect_thunk::<C>,
        );
    }

    /// Flush pending writes on `fd` to durable storage.
    pub fn fsync<C>(
        &mut self,
        context: *mut C,
        callback: FsyncCallback<C>,
        completion: &mut Completion,
        fd: RawFd,
    ) {
        self.submit(
            completion,
            Operation::Fsync { fd },
            context as *mut c_void,
            callback as *const (),
            fsync_thunk::<C>,
        );
    }

    /// Open a file relative to `dir_fd`.
    ///
    /// `path` must stay valid until the callback fires.
    pub fn openat<C>(
        &mut self,
        context: *mut C,
        callback: OpenAtCallback<C>,
        completion: &mut Completion,
        dir_fd: RawFd,
        path: &CStr,
        flags: libc::c_int,
        mode: libc::mode_t,
    ) {
        let path = NonNull::new(path.as_ptr() as *mut libc::c_char)
            .expect("CStr pointer is never null");
        self.submit(
            completion,
            Operation::OpenAt {
                dir_fd,
                path,
                flags,
                mode,
            },
            context as *mut c_void,
            callback as *const (),
            openat_thunk::<C>,
        );
    }

    /// Read into `buf` at `offset`. The length is clamped by
    /// [`buffer_limit`].
    pub fn read<C>(
        &mut self,
        context: *mut C,
        callback: ReadCallback<C>,
        completion: &mut Completion,
        fd: RawFd,
        buf: &mut [u8],
        offset: u64,
    ) {
        let len = buffer_limit(buf.len());
        let buf = NonNull::new(buf.as_mut_ptr()).expect("slice pointer is never null");
        self.submit(
            completion,
            Operation::Read {
                fd,
                buf,
                len,
                offset,
            },
            context as *mut c_void,
            callback as *const (),
            read_thunk::<C>,
        );
    }

    /// Receive into `buf`. The length is clamped by [`buffer_limit`].
    pub fn recv<C>(
        &mut self,
        context: *mut C,
        callback: RecvCallback<C>,
        completion: &mut Completion,
        socket: RawFd,
        buf: &mut [u8],
    ) {
        let len = buffer_limit(buf.len());
        let buf = NonNull::new(buf.as_mut_ptr()).expect("slice pointer is never null");
        self.submit(
            completion,
            Operation::Recv { socket, buf, len },
            context as *mut c_void,
            callback as *const (),
            recv_thunk::<C>,
        );
    }

    /// Receive a message. `msg` and everything it points at must stay valid
    /// until the callback fires.
    pub fn recvmsg<C>(
        &mut self,
        context: *mut C,
        callback: RecvMsgCallback<C>,
        completion: &mut Completion,
        socket: RawFd,
        msg: *mut libc::msghdr,
    ) {
        let msg = NonNull::new(msg).expect("msghdr pointer must not be null");
        self.submit(
            completion,
            Operation::RecvMsg { socket, msg },
            context as *mut c_void,
            callback as *const (),
            recv_thunk::<C>,
        );
    }

    /// Send from `buf`. The length is clamped by [`buffer_limit`].
    pub fn send<C>(
        &mut self,
        context: *mut C,
        callback: SendCallback<C>,
        completion: &mut Completion,
        socket: RawFd,
        buf: &[u8],
    ) {
        let len = buffer_limit(buf.len());
        let buf = NonNull::new(buf.as_ptr() as *mut u8).expect("slice pointer is never null");
        self.submit(
            completion,
            Operation::Send { socket, buf, len },
            context as *mut c_void,
            callback as *const (),
            send_thunk::<C>,
        );
    }

    /// Send a message. `msg` and everything it points at must stay valid
    /// until the callback fires.
    pub fn sendmsg<C>(
        &mut self,
        context: *mut C,
        callback: SendMsgCallback<C>,
        completion: &mut Completion,
        socket: RawFd,
        msg: *const libc::msghdr,
    ) {
        let msg =
            NonNull::new(msg as *mut libc::msghdr).expect("msghdr pointer must not be null");
        self.submit(
            completion,
            Operation::SendMsg { socket, msg },
            context as *mut c_void,
            callback as *const (),
            send_thunk::<C>,
        );
    }

    /// Write `buf` at `offset`. The length is clamped by [`buffer_limit`].
    pub fn write<C>(
        &mut self,
        context: *mut C,
        callback: WriteCallback<C>,
        completion: &mut Completion,
        fd: RawFd,
        buf: &[u8],
        offset: u64,
    ) {
        let len = buffer_limit(buf.len());
        let buf = NonNull::new(buf.as_ptr() as *mut u8).expect("slice pointer is never null");
        self.submit(
            completion,
            Operation::Write {
                fd,
                buf,
                len,
                offset,
            },
            context as *mut c_void,
            callback as *const (),
            write_thunk::<C>,
        );
    }

    /// Fire the callback after a relative delay of `ns` nanoseconds.
    pub fn timeout<C>(
        &mut self,
        context: *mut C,
        callback: TimeoutCallback<C>,
        completion: &mut Completion,
        ns: u64,
    ) {
        self.submit(
            completion,
            Operation::Timeout {
                expires: time::monotonic_ns().saturating_add(ns),
                timespec: KernelTimespec::from_ns(ns),
            },
            context as *mut c_void,
            callback as *const (),
            timeout_thunk::<C>,
        );
    }

    /// Cancel an in-flight operation by completion identity.
    ///
    /// A successfully canceled target still fires its own callback, with
    /// `Canceled`. The cancel's own result distinguishes success,
    /// `NotFound` (target already finished), and `AlreadyInProgress`.
    pub fn cancel<C>(
        &mut self,
        context: *mut C,
        callback: CancelCallback<C>,
        completion: &mut Completion,
        target: &mut Completion,
    ) {
        let target = NonNull::from(target);
        self.submit(
            completion,
            Operation::Cancel { target },
            context as *mut c_void,
            callback as *const (),
            cancel_thunk::<C>,
        );
    }

    /// Cancel a previously submitted timeout by completion identity.
    ///
    /// Reports `Canceled` when the target timeout had already completed.
    pub fn cancel_timeout<C>(
        &mut self,
        context: *mut C,
        callback: CancelTimeoutCallback<C>,
        completion: &mut Completion,
        target: &mut Completion,
    ) {
        let target = NonNull::from(target);
        self.submit(
            completion,
            Operation::CancelTimeout { target },
            context as *mut c_void,
            callback as *const (),
            cancel_timeout_thunk::<C>,
        );
    }

    // ========================================================================
    // Linked submitters
    // ========================================================================

    /// Connect with an attached timeout that cancels the attempt.
    ///
    /// Exactly one of the halves wins: either the connect completes with
    /// its own result and the timeout surfaces `Canceled`, or the timeout
    /// fires and the connect surfaces `Canceled`. The callback is invoked
    /// once, with the connect result, after both halves have reported.
    /// Requires an engine with at least 2 entries.
    pub fn connect_with_timeout<C>(
        &mut self,
        context: *mut C,
        callback: ConnectTimeoutCallback<C>,
        linked: &mut LinkedCompletion,
        socket: RawFd,
        addr: SocketAddr,
        timeout_ns: u64,
    ) {
        let (address, address_len) = op::sockaddr_from(&addr);
        self.submit_linked(
            linked,
            Operation::Connect {
                socket,
                address,
                address_len,
                initiated: false,
            },
            context as *mut c_void,
            callback as *const (),
            connect_linked_main::<C>,
            connect_linked_timeout::<C>,
            timeout_ns,
        );
    }

    /// Receive with an attached timeout. See [`Engine::connect_with_timeout`]
    /// for the composite semantics.
    pub fn recv_with_timeout<C>(
        &mut self,
        context: *mut C,
        callback: RecvTimeoutCallback<C>,
        linked: &mut LinkedCompletion,
        socket: RawFd,
        buf: &mut [u8],
        timeout_ns: u64,
    ) {
        let len = buffer_limit(buf.len());
        let buf = NonNull::new(buf.as_mut_ptr()).expect("slice pointer is never null");
        self.submit_linked(
            linked,
            Operation::Recv { socket, buf, len },
            context as *mut c_void,
            callback as *const (),
            recv_linked_main::<C>,
            recv_linked_timeout::<C>,
            timeout_ns,
        );
    }

    /// Receive a message with an attached timeout. See
    /// [`Engine::connect_with_timeout`] for the composite semantics.
    pub fn recvmsg_with_timeout<C>(
        &mut self,
        context: *mut C,
        callback: RecvMsgTimeoutCallback<C>,
        linked: &mut LinkedCompletion,
        socket: RawFd,
        msg: *mut libc::msghdr,
        timeout_ns: u64,
    ) {
        let msg = NonNull::new(msg).expect("msghdr pointer must not be null");
        self.submit_linked(
            linked,
            Operation::RecvMsg { socket, msg },
            context as *mut c_void,
            callback as *const (),
            recv_linked_main::<C>,
            recv_linked_timeout::<C>,
            timeout_ns,
        );
    }

    /// Send with an attached timeout. See [`Engine::connect_with_timeout`]
    /// for the composite semantics.
    pub fn send_with_timeout<C>(
        &mut self,
        context: *mut C,
        callback: SendTimeoutCallback<C>,
        linked: &mut LinkedCompletion,
        socket: RawFd,
        buf: &[u8],
        timeout_ns: u64,
    ) {
        let len = buffer_limit(buf.len());
        let buf = NonNull::new(buf.as_ptr() as *mut u8).expect("slice pointer is never null");
        self.submit_linked(
            linked,
            Operation::Send { socket, buf, len },
            context as *mut c_void,
            callback as *const (),
            send_linked_main::<C>,
            send_linked_timeout::<C>,
            timeout_ns,
        );
    }

    /// Send a message with an attached timeout. See
    /// [`Engine::connect_with_timeout`] for the composite semantics.
    pub fn sendmsg_with_timeout<C>(
        &mut self,
        context: *mut C,
        callback: SendMsgTimeoutCallback<C>,
        linked: &mut LinkedCompletion,
        socket: RawFd,
        msg: *const libc::msghdr,
        timeout_ns: u64,
    ) {
        let msg =
            NonNull::new(msg as *mut libc::msghdr).expect("msghdr pointer must not be null");
        self.submit_linked(
            linked,
            Operation::SendMsg { socket, msg },
            context as *mut c_void,
            callback as *const (),
            send_linked_main::<C>,
            send_linked_timeout::<C>,
            timeout_ns,
        );
    }

    /// Submit a main/timeout pair.
    ///
    /// On io_uring the pair goes to the kernel as one linked submission so
    /// the link timeout cancels the main operation. On kqueue both halves
    /// are independent and the first to complete cross-cancels the other.
    #[allow(clippy::too_many_arguments)]
    fn submit_linked(
        &mut self,
        linked: &mut LinkedCompletion,
        operation: Operation,
        context: *mut c_void,
        user_fn: *const (),
        main_thunk: Thunk,
        timeout_thunk: Thunk,
        timeout_ns: u64,
    ) {
        linked.arm(context, user_fn);
        let linked_ptr = linked as *mut LinkedCompletion as *mut c_void;

        linked
            .main
            .prepare(operation, linked_ptr, ptr::null(), main_thunk);
        linked.main.linked = true;
        self.total_submitted += 2;

        #[cfg(target_os = "linux")]
        {
            linked.timeout.prepare(
                Operation::LinkTimeout {
                    timespec: KernelTimespec::from_ns(timeout_ns),
                },
                linked_ptr,
                ptr::null(),
                timeout_thunk,
            );
            let main = NonNull::from(&mut linked.main);
            let timeout = NonNull::from(&mut linked.timeout);
            self.backend.enqueue_linked(main, timeout);
        }

        #[cfg(target_os = "macos")]
        {
            linked.timeout.prepare(
                Operation::Timeout {
                    expires: time::monotonic_ns().saturating_add(timeout_ns),
                    timespec: KernelTimespec::from_ns(timeout_ns),
                },
                linked_ptr,
                ptr::null(),
                timeout_thunk,
            );
            let main = NonNull::from(&mut linked.main);
            self.backend.enqueue(main);
            let timeout = NonNull::from(&mut linked.timeout);
            self.backend.enqueue(timeout);
        }
    }

    /// Cross-cancel the timeout half after the main half won the race.
    #[cfg(target_os = "macos")]
    fn cancel_linked_timeout(&mut self, linked: &mut LinkedCompletion) {
        let target = NonNull::from(&mut linked.timeout);
        let context = linked as *mut LinkedCompletion as *mut c_void;
        linked
            .cancel
            .prepare(Operation::CancelTimeout { target }, context, ptr::null(), cross_cancel_thunk);
        self.total_submitted += 1;
        self.backend.enqueue(NonNull::from(&mut linked.cancel));
    }

    /// Cross-cancel the main half after the timeout fired first.
    #[cfg(target_os = "macos")]
    fn cancel_linked_main(&mut self, linked: &mut LinkedCompletion) {
        let target = NonNull::from(&mut linked.main);
        let context = linked as *mut LinkedCompletion as *mut c_void;
        linked
            .cancel
            .prepare(Operation::Cancel { target }, context, ptr::null(), cross_cancel_thunk);
        self.total_submitted += 1;
        self.backend.enqueue(NonNull::from(&mut linked.cancel));
    }
}

// ============================================================================
// Dispatch thunks
// ============================================================================

macro_rules! completion_thunk {
    ($name:ident, $decode:path, $ok:ty, $err:ty) => {
        unsafe fn $name<C>(
            context: *mut c_void,
            user_fn: *const (),
            io: &mut Engine,
            mut completion: NonNull<Completion>,
        ) {
            let result = $decode(unsafe { completion.as_ref() }.result);
            // SAFETY: the submitter stored a callback of exactly this type,
            // and a context pointer of exactly this context type.
            let callback: fn(&mut C, &mut Engine, &mut Completion, Result<$ok, $err>) =
                unsafe { mem::transmute(user_fn) };
            callback(
                unsafe { &mut *(context as *mut C) },
                io,
                unsafe { completion.as_mut() },
                result,
            );
        }
    };
}

completion_thunk!(accept_thunk, error::decode_accept, RawFd, AcceptError);
completion_thunk!(close_thunk, error::decode_close, (), CloseError);
completion_thunk!(connect_thunk, error::decode_connect, (), ConnectError);
completion_thunk!(fsync_thunk, error::decode_fsync, (), FsyncError);
completion_thunk!(openat_thunk, error::decode_openat, RawFd, OpenAtError);
completion_thunk!(read_thunk, error::decode_read, usize, ReadError);
completion_thunk!(recv_thunk, error::decode_recv, usize, RecvError);
completion_thunk!(send_thunk, error::decode_send, usize, SendError);
completion_thunk!(write_thunk, error::decode_write, usize, WriteError);
completion_thunk!(timeout_thunk, error::decode_timeout, (), TimeoutError);
completion_thunk!(cancel_thunk, error::decode_cancel, (), CancelError);
completion_thunk!(
    cancel_timeout_thunk,
    error::decode_cancel_timeout,
    (),
    CancelTimeoutError
);

/// Fire the composite callback once both halves have reported.
unsafe fn fire_linked<C, T, E>(
    linked: &mut LinkedCompletion,
    io: &mut Engine,
    decode: fn(i32) -> Result<T, E>,
) {
    let raw = linked.main_result.expect("main result slot is filled");
    let result = decode(raw);
    // SAFETY: the linked submitter stored a callback of exactly this type.
    let callback: fn(&mut C, &mut Engine, &mut LinkedCompletion, Result<T, E>) =
        unsafe { mem::transmute(linked.user_fn) };
    let context = linked.context;
    callback(unsafe { &mut *(context as *mut C) }, io, linked, result);
}

macro_rules! linked_thunks {
    ($main_name:ident, $timeout_name:ident, $decode:path, $ok:ty, $err:ty) => {
        unsafe fn $main_name<C>(
            context: *mut c_void,
            _user_fn: *const (),
            io: &mut Engine,
            completion: NonNull<Completion>,
        ) {
            let raw = unsafe { completion.as_ref() }.result;
            // SAFETY: the linked submitter set context to the owning pair.
            let linked = unsafe { &mut *(context as *mut LinkedCompletion) };
            linked.main_result = Some(raw);
            if linked.timeout_result.is_none() {
                // io_uring cancels the link timeout in the kernel; kqueue
                // needs an explicit cross-cancel.
                #[cfg(target_os = "macos")]
                io.cancel_linked_timeout(linked);
                return;
            }
            unsafe { fire_linked::<C, $ok, $err>(linked, io, $decode) };
        }

        unsafe fn $timeout_name<C>(
            context: *mut c_void,
            _user_fn: *const (),
            io: &mut Engine,
            completion: NonNull<Completion>,
        ) {
            let raw = unsafe { completion.as_ref() }.result;
            // SAFETY: the linked submitter set context to the owning pair.
            let linked = unsafe { &mut *(context as *mut LinkedCompletion) };
            linked.timeout_result = Some(raw);
            if linked.main_result.is_none() {
                #[cfg(target_os = "macos")]
                io.cancel_linked_main(linked);
                return;
            }
            unsafe { fire_linked::<C, $ok, $err>(linked, io, $decode) };
        }
    };
}

linked_thunks!(
    connect_linked_main,
    connect_linked_timeout,
    error::decode_connect,
    (),
    ConnectError
);
linked_thunks!(
    recv_linked_main,
    recv_linked_timeout,
    error::decode_recv,
    usize,
    RecvError
);
linked_thunks!(
    send_linked_main,
    send_linked_timeout,
    error::decode_send,
    usize,
    SendError
);

/// Dispatch hook for the synthesized cross-cancel; its result is internal.
#[cfg(target_os = "macos")]
unsafe fn cross_cancel_thunk(
    _context: *mut c_void,
    _user_fn: *const (),
    _io: &mut Engine,
    _completion: NonNull<Completion>,
) {
}
