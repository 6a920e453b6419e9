//! kqueue backend.
//!
//! kqueue reports readiness, not completion, so this backend synthesizes a
//! proactor on top: readiness-driven operations wait on `io_pending` until
//! they are registered as one-shot kevents (with `udata` carrying the
//! completion's address), and when the kernel signals readiness the
//! operation is performed inline with the matching syscall. Operations that
//! are synchronous on the descriptor (close, openat, fsync) run immediately
//! when dispatched. Timers live on the `timeouts` list and are expired by
//! polling the monotonic clock; when a timer is the only reason to enter
//! the kernel, the kevent timespec sleeps exactly the remaining time.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

use tracing::trace;

use crate::completion::Completion;
use crate::engine::Config;
use crate::fifo::Fifo;
use crate::op::{OpTag, Operation};
use crate::time;

/// Upper bound on kevent change and event batches per kernel entry.
/// Anything beyond it stays pending and is reaped on the next tick.
const EVENT_BATCH: usize = 256;

pub(crate) struct KqueueDriver {
    kq: RawFd,
    /// Operations awaiting kevent registration or synchronous execution.
    io_pending: Fifo,
    /// Operations registered as one-shot kevents, awaiting readiness.
    io_inflight: Fifo,
    /// Active timers, expired by polling.
    timeouts: Fifo,
    /// Completions awaiting callback dispatch.
    completed: Fifo,
}

/// Disposition of a readiness operation at registration time.
enum Readiness {
    Registered(libc::kevent),
    Done(i32),
}

/// Disposition of an operation performed inline after readiness.
enum ExecOutcome {
    Done(i32),
    WouldBlock,
}

impl KqueueDriver {
    pub(crate) fn new(_config: &Config) -> io::Result<Self> {
        // SAFETY: plain syscalls.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok(Self {
            kq,
            io_pending: Fifo::new(),
            io_inflight: Fifo::new(),
            timeouts: Fifo::new(),
            completed: Fifo::new(),
        })
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.io_pending.is_empty()
            && self.io_inflight.is_empty()
            && self.timeouts.is_empty()
            && self.completed.is_empty()
    }

    pub(crate) fn take_completed(&mut self) -> Fifo {
        self.completed.take()
    }

    pub(crate) fn enqueue(&mut self, completion: NonNull<Completion>) {
        // SAFETY: the submitter hands us live, unqueued completion storage.
        let tag = unsafe { completion.as_ref() }.op_tag();
        trace!(user_data = completion.as_ptr() as u64, ?tag, "submit");
        match tag {
            OpTag::Timeout => self.timeouts.push(completion),
            _ => self.io_pending.push(completion),
        }
    }

    /// One backend step: drain pending work, expire timers, enter the
    /// kernel, and move signalled operations to `completed`.
    ///
    /// With `wait` set, blocks up to the next timer deadline when there is
    /// nothing to submit and nothing already completed; otherwise polls.
    pub(crate) fn poll(&mut self, wait: bool) -> io::Result<()> {
        let mut changes: [libc::kevent; EVENT_BATCH] = unsafe { mem::zeroed() };
        let mut nchanges = 0;

        let mut pending = self.io_pending.take();
        while let Some(mut node) = pending.pop() {
            // SAFETY: queued nodes are live caller storage.
            let completion = unsafe { node.as_mut() };
            match completion.op_tag() {
                OpTag::Cancel | OpTag::CancelTimeout => {
                    // Flush queued registrations first so the target search
                    // sees every in-kernel operation.
                    if nchanges > 0 {
                        self.kevent_enter(&changes[..nchanges], &ZERO_TS)?;
                        nchanges = 0;
                    }
                    self.resolve_cancel(node);
                }
                OpTag::Close | OpTag::Fsync | OpTag::OpenAt => {
                    completion.result = execute_sync(&completion.op);
                    self.completed.push(node);
                }
                _ => match prepare_io(completion) {
                    Readiness::Registered(change) => {
                        changes[nchanges] = change;
                        nchanges += 1;
                        self.io_inflight.push(node);
                        if nchanges == EVENT_BATCH {
                            self.kevent_enter(&changes[..nchanges], &ZERO_TS)?;
                            nchanges = 0;
                        }
                    }
                    Readiness::Done(result) => {
                        completion.result = result;
                        self.completed.push(node);
                    }
                },
            }
        }

        let now = time::monotonic_ns();
        self.expire_timeouts(now);

        // Decide how long the kernel entry may block.
        let mut ts = ZERO_TS;
        let block = wait && nchanges == 0 && self.completed.is_empty();
        let ts_ptr: *const libc::timespec = if !block {
            &ts
        } else if let Some(ns) = self.next_timeout_ns(now) {
            ts.tv_sec = (ns / 1_000_000_000) as libc::time_t;
            ts.tv_nsec = (ns % 1_000_000_000) as libc::c_long;
            &ts
        } else if !self.io_inflight.is_empty() {
            // Only readiness left to wait on.
            ptr::null()
        } else {
            // Nothing in flight at all.
            return Ok(());
        };

        self.kevent_enter_raw(&changes[..nchanges], ts_ptr)?;

        // A blocking wait may have slept through timer deadlines.
        if block {
            self.expire_timeouts(time::monotonic_ns());
        }
        Ok(())
    }

    /// kevent with a bounded timespec reference.
    fn kevent_enter(&mut self, changes: &[libc::kevent], ts: &libc::timespec) -> io::Result<()> {
        self.kevent_enter_raw(changes, ts)
    }

    /// Submit a changelist and reap up to one batch of events.
    fn kevent_enter_raw(
        &mut self,
        changes: &[libc::kevent],
        ts: *const libc::timespec,
    ) -> io::Result<()> {
        let mut events: [libc::kevent; EVENT_BATCH] = unsafe { mem::zeroed() };
        let nevents = loop {
            // SAFETY: the arrays are valid for the lengths passed; udata
            // pointers were installed by this backend.
            let rc = unsafe {
                libc::kevent(
                    self.kq,
                    changes.as_ptr(),
                    changes.len() as libc::c_int,
                    events.as_mut_ptr(),
                    EVENT_BATCH as libc::c_int,
                    ts,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        };

        for event in events.iter().take(nevents) {
            self.handle_event(event);
        }
        Ok(())
    }

    /// One readiness event: perform the operation inline, re-queueing it if
    /// the descriptor turned out not to be ready after all.
    fn handle_event(&mut self, event: &libc::kevent) {
        let node = match NonNull::new(event.udata as *mut Completion) {
            Some(node) => node,
            None => return,
        };
        self.io_inflight.remove(node);

        let mut node = node;
        // SAFETY: udata was set to the completion's address at registration.
        let completion = unsafe { node.as_mut() };

        if (event.flags & libc::EV_ERROR) != 0 && event.data != 0 {
            completion.result = -(event.data as i32);
            self.completed.push(node);
            return;
        }

        match execute_io(completion) {
            ExecOutcome::Done(result) => {
                completion.result = result;
                self.completed.push(node);
            }
            ExecOutcome::WouldBlock => self.io_pending.push(node),
        }
    }

    /// Move expired timers to `completed` with success.
    fn expire_timeouts(&mut self, now: u64) {
        let mut remaining = Fifo::new();
        let mut timers = self.timeouts.take();
        while let Some(mut node) = timers.pop() {
            // SAFETY: queued nodes are live caller storage.
            let completion = unsafe { node.as_mut() };
            let expires = match completion.op {
                Operation::Timeout { expires, .. } => expires,
                _ => unreachable!("timeouts list holds only timers"),
            };
            if now >= expires {
                completion.result = 0;
                self.completed.push(node);
            } else {
                remaining.push(node);
            }
        }
        self.timeouts = remaining;
    }

    /// Nanoseconds until the nearest timer deadline, if any timer is armed.
    fn next_timeout_ns(&self, now: u64) -> Option<u64> {
        let mut nearest: Option<u64> = None;
        let mut cursor = self.timeouts.peek();
        while let Some(node) = cursor {
            // SAFETY: queued nodes are live caller storage.
            let completion = unsafe { node.as_ref() };
            if let Operation::Timeout { expires, .. } = completion.op {
                let remaining = expires.saturating_sub(now);
                nearest = Some(nearest.map_or(remaining, |n: u64| n.min(remaining)));
            }
            cursor = unsafe { node.as_ref() }.next;
        }
        nearest
    }

    /// Resolve a cancel or cancel-timeout against the engine's queues.
    ///
    /// A target found on any queue completes with `ECANCELED` and the
    /// cancel reports success. A plain cancel whose target is gone reports
    /// `ENOENT`; a cancel-timeout in the same situation reports `ECANCELED`
    /// (the timer is taken to have already completed).
    fn resolve_cancel(&mut self, mut node: NonNull<Completion>) {
        // SAFETY: queued nodes are live caller storage.
        let completion = unsafe { node.as_mut() };
        let result = match completion.op {
            Operation::CancelTimeout { target } => {
                if self.timeouts.remove(target) {
                    self.cancel_target(target);
                    0
                } else {
                    -libc::ECANCELED
                }
            }
            Operation::Cancel { target } => {
                if self.io_pending.remove(target) {
                    self.cancel_target(target);
                    0
                } else if self.io_inflight.remove(target) {
                    self.delete_registration(target);
                    self.cancel_target(target);
                    0
                } else if self.timeouts.remove(target) {
                    self.cancel_target(target);
                    0
                } else {
                    -libc::ENOENT
                }
            }
            _ => unreachable!("resolve_cancel on a non-cancel operation"),
        };
        completion.result = result;
        self.completed.push(node);
    }

    /// Complete a canceled target so its own callback still fires.
    fn cancel_target(&mut self, mut target: NonNull<Completion>) {
        // SAFETY: the target was just detached from one of our queues.
        unsafe { target.as_mut() }.result = -libc::ECANCELED;
        self.completed.push(target);
    }

    /// Best-effort EV_DELETE for a target that was already registered.
    fn delete_registration(&mut self, target: NonNull<Completion>) {
        // SAFETY: the target was on io_inflight, so its op is readiness-based.
        let (ident, filter) = match unsafe { &target.as_ref().op } {
            Operation::Accept { socket, .. }
            | Operation::Recv { socket, .. }
            | Operation::RecvMsg { socket, .. } => (*socket, libc::EVFILT_READ),
            Operation::Connect { socket, .. }
            | Operation::Send { socket, .. }
            | Operation::SendMsg { socket, .. } => (*socket, libc::EVFILT_WRITE),
            Operation::Read { fd, .. } => (*fd, libc::EVFILT_READ),
            Operation::Write { fd, .. } => (*fd, libc::EVFILT_WRITE),
            _ => return,
        };
        let change = libc::kevent {
            ident: ident as libc::uintptr_t,
            filter,
            flags: libc::EV_DELETE,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        // The registration may have fired already; ENOENT here is fine.
        unsafe {
            libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, &ZERO_TS);
        }
    }
}

impl Drop for KqueueDriver {
    fn drop(&mut self) {
        // SAFETY: kq was created in new() and is owned by this driver.
        unsafe {
            libc::close(self.kq);
        }
    }
}

const ZERO_TS: libc::timespec = libc::timespec {
    tv_sec: 0,
    tv_nsec: 0,
};

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Build the one-shot registration for a readiness operation, issuing
/// `connect(2)` first when the attempt has not been initiated yet.
fn prepare_io(completion: &mut Completion) -> Readiness {
    let udata = completion as *mut Completion as *mut libc::c_void;
    match completion.op {
        Operation::Connect {
            socket,
            ref address,
            address_len,
            ref mut initiated,
        } => {
            if !*initiated {
                // SAFETY: the address storage lives inside the completion.
                let rc = unsafe {
                    libc::connect(
                        socket,
                        address as *const libc::sockaddr_storage as *const libc::sockaddr,
                        address_len,
                    )
                };
                if rc == 0 {
                    return Readiness::Done(0);
                }
                match errno() {
                    // The attempt continues asynchronously; writability
                    // reports the outcome.
                    libc::EINPROGRESS | libc::EAGAIN | libc::EINTR => *initiated = true,
                    other => return Readiness::Done(-other),
                }
            }
            Readiness::Registered(oneshot(socket, libc::EVFILT_WRITE, udata))
        }
        Operation::Accept { socket, .. }
        | Operation::Recv { socket, .. }
        | Operation::RecvMsg { socket, .. } => {
            Readiness::Registered(oneshot(socket, libc::EVFILT_READ, udata))
        }
        Operation::Send { socket, .. } | Operation::SendMsg { socket, .. } => {
            Readiness::Registered(oneshot(socket, libc::EVFILT_WRITE, udata))
        }
        Operation::Read { fd, .. } => Readiness::Registered(oneshot(fd, libc::EVFILT_READ, udata)),
        Operation::Write { fd, .. } => {
            Readiness::Registered(oneshot(fd, libc::EVFILT_WRITE, udata))
        }
        _ => unreachable!("not a readiness operation"),
    }
}

fn oneshot(fd: RawFd, filter: i16, udata: *mut libc::c_void) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT,
        fflags: 0,
        data: 0,
        udata,
    }
}

/// Perform a readiness operation inline once the kernel reported the
/// descriptor ready. EINTR retries the syscall; EAGAIN re-queues the
/// completion for re-registration.
fn execute_io(completion: &mut Completion) -> ExecOutcome {
    match completion.op {
        Operation::Accept {
            socket,
            ref mut address,
            ref mut address_len,
        } => loop {
            *address_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // SAFETY: address storage lives inside the completion.
            let fd = unsafe {
                libc::accept(
                    socket,
                    address as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    address_len,
                )
            };
            if fd >= 0 {
                unsafe {
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                }
                return ExecOutcome::Done(fd);
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return ExecOutcome::WouldBlock,
                other => return ExecOutcome::Done(-other),
            }
        },
        Operation::Connect { socket, .. } => {
            let mut err: libc::c_int = 0;
            let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            // SAFETY: err is valid storage for the option value.
            let rc = unsafe {
                libc::getsockopt(
                    socket,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut libc::c_int as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc != 0 {
                ExecOutcome::Done(-errno())
            } else if err != 0 {
                ExecOutcome::Done(-err)
            } else {
                ExecOutcome::Done(0)
            }
        }
        Operation::Read {
            fd,
            buf,
            len,
            offset,
        } => loop {
            // SAFETY: the caller keeps the buffer valid until dispatch.
            let n = unsafe {
                libc::pread(
                    fd,
                    buf.as_ptr() as *mut libc::c_void,
                    len,
                    offset as libc::off_t,
                )
            };
            match done_or_retry(n) {
                Some(outcome) => return outcome,
                None => continue,
            }
        },
        Operation::Write {
            fd,
            buf,
            len,
            offset,
        } => loop {
            // SAFETY: as above.
            let n = unsafe {
                libc::pwrite(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    len,
                    offset as libc::off_t,
                )
            };
            match done_or_retry(n) {
                Some(outcome) => return outcome,
                None => continue,
            }
        },
        Operation::Recv { socket, buf, len } => loop {
            // SAFETY: as above.
            let n = unsafe { libc::recv(socket, buf.as_ptr() as *mut libc::c_void, len, 0) };
            match done_or_retry(n) {
                Some(outcome) => return outcome,
                None => continue,
            }
        },
        Operation::Send { socket, buf, len } => loop {
            // SAFETY: as above.
            let n = unsafe { libc::send(socket, buf.as_ptr() as *const libc::c_void, len, 0) };
            match done_or_retry(n) {
                Some(outcome) => return outcome,
                None => continue,
            }
        },
        Operation::RecvMsg { socket, msg } => loop {
            // SAFETY: the caller keeps the msghdr and its iovecs valid.
            let n = unsafe { libc::recvmsg(socket, msg.as_ptr(), 0) };
            match done_or_retry(n) {
                Some(outcome) => return outcome,
                None => continue,
            }
        },
        Operation::SendMsg { socket, msg } => loop {
            // SAFETY: as above.
            let n = unsafe { libc::sendmsg(socket, msg.as_ptr(), 0) };
            match done_or_retry(n) {
                Some(outcome) => return outcome,
                None => continue,
            }
        },
        _ => unreachable!("not a readiness operation"),
    }
}

/// Classify a syscall return: `None` means EINTR, retry.
fn done_or_retry(n: isize) -> Option<ExecOutcome> {
    if n >= 0 {
        return Some(ExecOutcome::Done(n as i32));
    }
    match errno() {
        libc::EINTR => None,
        libc::EAGAIN => Some(ExecOutcome::WouldBlock),
        other => Some(ExecOutcome::Done(-other)),
    }
}

/// Operations that are synchronous on the descriptor run immediately.
fn execute_sync(op: &Operation) -> i32 {
    match *op {
        Operation::Close { fd } => {
            // SAFETY: plain syscall; the fd is the caller's to close.
            let rc = unsafe { libc::close(fd) };
            if rc == 0 {
                0
            } else {
                match errno() {
                    // Retrying close after EINTR could close a reused fd.
                    libc::EINTR => 0,
                    other => -other,
                }
            }
        }
        Operation::Fsync { fd } => loop {
            // SAFETY: plain syscall.
            let rc = unsafe { libc::fsync(fd) };
            if rc == 0 {
                return 0;
            }
            match errno() {
                libc::EINTR => continue,
                other => return -other,
            }
        },
        Operation::OpenAt {
            dir_fd,
            path,
            flags,
            mode,
        } => loop {
            // SAFETY: the caller keeps the path alive until dispatch.
            let fd = unsafe { libc::openat(dir_fd, path.as_ptr(), flags, mode as libc::c_uint) };
            if fd >= 0 {
                return fd;
            }
            match errno() {
                libc::EINTR => continue,
                other => return -other,
            }
        },
        _ => unreachable!("not a synchronous operation"),
    }
}
