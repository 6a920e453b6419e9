//! io_uring backend.
//!
//! Every operation maps to one SQE whose `user_data` is the completion's
//! address. Submissions that do not fit in the SQ ring are parked on the
//! `unqueued` FIFO and retried after completions drain. Harvested CQEs move
//! their completions to `completed`; the engine dispatches callbacks from a
//! snapshot of that list so submissions made inside callbacks wait for the
//! next tick.

use std::io;

use io_uring::squeue;
use io_uring::types::{Fd, TimeoutFlags, Timespec};
use io_uring::{opcode, IoUring};
use std::ptr::NonNull;
use tracing::trace;

use crate::completion::Completion;
use crate::engine::Config;
use crate::fifo::Fifo;
use crate::op::{KernelTimespec, OpTag, Operation};

pub(crate) struct UringDriver {
    ring: IoUring,
    /// Submissions that did not fit in the SQ, in submission order.
    /// Linked pairs stay adjacent here: the head's `linked` flag says
    /// whether to pop one record or two.
    unqueued: Fifo,
    /// Harvested completions awaiting callback dispatch.
    completed: Fifo,
    /// Scratch for draining the CQ before acting on entries, so harvesting
    /// never holds the queue borrow while re-enqueueing. Pre-allocated once.
    cqe_scratch: Vec<(u64, i32)>,
    /// Operations handed to the kernel and not yet reaped.
    inflight: u32,
    /// Outstanding internal deadline timers (user_data = 0).
    run_timeouts: u32,
    /// Set when the current internal deadline timer reported ETIME.
    run_deadline_hit: bool,
}

impl UringDriver {
    pub(crate) fn new(config: &Config) -> io::Result<Self> {
        let entries = config.entries as u32;
        let mut builder = IoUring::builder();
        builder.setup_cqsize(entries.saturating_mul(4));
        if config.sqpoll {
            builder.setup_sqpoll(config.sqpoll_idle_ms);
        }
        let ring = builder.build(entries)?;

        Ok(Self {
            ring,
            unqueued: Fifo::new(),
            completed: Fifo::new(),
            cqe_scratch: Vec::with_capacity(entries.saturating_mul(4) as usize),
            inflight: 0,
            run_timeouts: 0,
            run_deadline_hit: false,
        })
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.inflight == 0 && self.unqueued.is_empty() && self.completed.is_empty()
    }

    pub(crate) fn take_completed(&mut self) -> Fifo {
        self.completed.take()
    }

    /// Queue one operation, overflowing to `unqueued` when the SQ is full.
    pub(crate) fn enqueue(&mut self, mut completion: NonNull<Completion>) {
        // SAFETY: the submitter hands us live, unqueued completion storage.
        let entry = unsafe { sqe_for(completion.as_mut()) };
        let tag = unsafe { completion.as_ref() }.op_tag();
        trace!(user_data = completion.as_ptr() as u64, ?tag, "submit");
        // SAFETY: the SQE references memory the caller keeps valid until the
        // callback fires.
        let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
        if pushed {
            self.inflight += 1;
        } else {
            trace!(user_data = completion.as_ptr() as u64, "submission queue full, parking");
            self.unqueued.push(completion);
        }
    }

    /// Queue a linked pair so the kernel sees the link.
    ///
    /// Both SQEs are acquired before either is written; if the ring cannot
    /// hold both, both records are parked in order and resubmitted as a
    /// pair later.
    pub(crate) fn enqueue_linked(
        &mut self,
        mut main: NonNull<Completion>,
        mut timeout: NonNull<Completion>,
    ) {
        debug_assert!(unsafe { main.as_ref() }.linked);
        debug_assert_eq!(unsafe { timeout.as_ref() }.op_tag(), OpTag::LinkTimeout);

        {
            let sq = self.ring.submission();
            debug_assert!(sq.capacity() >= 2, "linked submissions need at least 2 entries");
            if sq.capacity() - sq.len() < 2 {
                drop(sq);
                trace!(
                    user_data = main.as_ptr() as u64,
                    "submission queue full, parking linked pair"
                );
                self.unqueued.push(main);
                self.unqueued.push(timeout);
                return;
            }
        }

        // SAFETY: both completions are live and their operation memory stays
        // valid until the callbacks fire.
        let entries = unsafe { [sqe_for(main.as_mut()), sqe_for(timeout.as_mut())] };
        let tag = unsafe { main.as_ref() }.op_tag();
        trace!(user_data = main.as_ptr() as u64, ?tag, "submit linked");
        // SAFETY: capacity for both entries was checked above; push_multiple
        // places them contiguously so IOSQE_IO_LINK binds them.
        unsafe {
            self.ring
                .submission()
                .push_multiple(&entries)
                .expect("submission queue has room for the pair");
        }
        self.inflight += 2;
    }

    /// Retry parked submissions, preserving main/link-timeout adjacency.
    ///
    /// Works on a snapshot so anything parked again (or parked by callbacks
    /// that ran earlier in this tick) is retried on the next tick.
    pub(crate) fn retry_unqueued(&mut self) {
        let mut snapshot = self.unqueued.take();
        while let Some(head) = snapshot.pop() {
            if unsafe { head.as_ref() }.linked {
                // The second conditional pop keeps the pair together; a
                // linked head is always parked with its timeout behind it.
                let timeout = snapshot
                    .pop()
                    .expect("linked pair is parked adjacently");
                self.enqueue_linked(head, timeout);
            } else {
                self.enqueue(head);
            }
        }
    }

    /// Enter the kernel: submit pending SQEs, optionally waiting for
    /// completions. EINTR is retried; EBUSY means the CQ needs draining
    /// first and is left for the harvest step.
    pub(crate) fn flush(&mut self, wait_nr: u32) -> io::Result<()> {
        loop {
            match self.ring.submitter().submit_and_wait(wait_nr as usize) {
                Ok(_) => return Ok(()),
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(ref e) if e.raw_os_error() == Some(libc::EBUSY) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Reap all available CQEs without waiting.
    ///
    /// Operations interrupted by a signal are re-queued instead of
    /// completed, so callbacks never observe EINTR.
    pub(crate) fn harvest(&mut self) {
        self.cqe_scratch.clear();
        for cqe in self.ring.completion() {
            self.cqe_scratch.push((cqe.user_data(), cqe.result()));
        }

        for i in 0..self.cqe_scratch.len() {
            let (user_data, result) = self.cqe_scratch[i];
            if user_data == 0 {
                // Internal deadline timer from run_for_ns.
                debug_assert!(self.run_timeouts > 0);
                self.run_timeouts -= 1;
                if result == -libc::ETIME {
                    self.run_deadline_hit = true;
                }
                continue;
            }

            debug_assert!(self.inflight > 0);
            self.inflight -= 1;

            let mut completion =
                NonNull::new(user_data as *mut Completion).expect("user_data is a completion");
            // SAFETY: user_data was set to the completion's address at
            // submission and the caller keeps the storage alive.
            let record = unsafe { completion.as_mut() };

            if result == -libc::EINTR && retry_on_eintr(record.op_tag()) {
                self.enqueue(completion);
                continue;
            }

            record.result = result;
            self.completed.push(completion);
        }
    }

    /// Arm one internal absolute deadline timer for `run_for_ns`.
    ///
    /// The timespec lives in the caller's frame; all timers armed here must
    /// be reaped before that frame unwinds.
    pub(crate) fn arm_run_timeout(&mut self, ts: &KernelTimespec) -> io::Result<()> {
        // SAFETY: KernelTimespec is layout-compatible with the kernel
        // timespec the Timeout opcode dereferences.
        let entry = opcode::Timeout::new(ts as *const KernelTimespec as *const Timespec)
            .count(1)
            .flags(TimeoutFlags::ABS)
            .build()
            .user_data(0);
        // SAFETY: ts outlives the CQE by the caller's contract.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                // Make room, then retry once.
                self.ring.submitter().submit()?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| io::Error::other("submission queue full after submit"))?;
            }
        }
        self.run_timeouts += 1;
        Ok(())
    }

    pub(crate) fn begin_run(&mut self) {
        self.run_deadline_hit = false;
    }

    pub(crate) fn run_deadline_hit(&self) -> bool {
        self.run_deadline_hit
    }

    pub(crate) fn run_timeouts_inflight(&self) -> u32 {
        self.run_timeouts
    }
}

/// Whether an interrupted operation is retried transparently.
///
/// Timers cannot report EINTR, cancels are not worth retrying, and close
/// must not be retried (handled as success at decode).
fn retry_on_eintr(tag: OpTag) -> bool {
    !matches!(
        tag,
        OpTag::Timeout | OpTag::LinkTimeout | OpTag::Cancel | OpTag::CancelTimeout | OpTag::Close
    )
}

/// Translate an operation into its SQE.
///
/// # Safety
///
/// The completion must stay at a stable address, and every pointer in its
/// operation payload must stay valid, until the CQE for this SQE is
/// harvested.
unsafe fn sqe_for(completion: &mut Completion) -> squeue::Entry {
    let user_data = completion as *mut Completion as u64;
    let linked = completion.linked;
    let entry = match completion.op {
        Operation::Nop => {
            debug_assert!(false, "sentinel operation submitted");
            opcode::Nop::new().build()
        }
        Operation::Accept {
            socket,
            ref mut address,
            ref mut address_len,
        } => opcode::Accept::new(
            Fd(socket),
            address as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            address_len,
        )
        .flags(libc::SOCK_CLOEXEC)
        .build(),
        Operation::Cancel { target } => opcode::AsyncCancel::new(target.as_ptr() as u64).build(),
        Operation::CancelTimeout { target } => {
            opcode::TimeoutRemove::new(target.as_ptr() as u64).build()
        }
        Operation::Close { fd } => opcode::Close::new(Fd(fd)).build(),
        Operation::Connect {
            socket,
            ref address,
            address_len,
            ..
        } => opcode::Connect::new(
            Fd(socket),
            address as *const libc::sockaddr_storage as *const libc::sockaddr,
            address_len,
        )
        .build(),
        Operation::Fsync { fd } => opcode::Fsync::new(Fd(fd)).build(),
        Operation::LinkTimeout { ref timespec } => {
            opcode::LinkTimeout::new(timespec as *const KernelTimespec as *const Timespec).build()
        }
        Operation::OpenAt {
            dir_fd,
            path,
            flags,
            mode,
        } => opcode::OpenAt::new(Fd(dir_fd), path.as_ptr())
            .flags(flags)
            .mode(mode)
            .build(),
        Operation::Read {
            fd,
            buf,
            len,
            offset,
        } => opcode::Read::new(Fd(fd), buf.as_ptr(), len as u32)
            .offset(offset)
            .build(),
        Operation::Recv { socket, buf, len } => {
            opcode::Recv::new(Fd(socket), buf.as_ptr(), len as u32).build()
        }
        Operation::RecvMsg { socket, msg } => {
            opcode::RecvMsg::new(Fd(socket), msg.as_ptr()).build()
        }
        Operation::Send { socket, buf, len } => {
            opcode::Send::new(Fd(socket), buf.as_ptr() as *const u8, len as u32)
                .flags(libc::MSG_NOSIGNAL)
                .build()
        }
        Operation::SendMsg { socket, msg } => {
            opcode::SendMsg::new(Fd(socket), msg.as_ptr() as *const libc::msghdr).build()
        }
        Operation::Timeout { ref timespec, .. } => {
            opcode::Timeout::new(timespec as *const KernelTimespec as *const Timespec).build()
        }
        Operation::Write {
            fd,
            buf,
            len,
            offset,
        } => opcode::Write::new(Fd(fd), buf.as_ptr() as *const u8, len as u32)
            .offset(offset)
            .build(),
    };

    let entry = entry.user_data(user_data);
    if linked {
        entry.flags(squeue::Flags::IO_LINK)
    } else {
        entry
    }
}
