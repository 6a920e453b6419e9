//! Completion records.
//!
//! A [`Completion`] is caller-owned storage that binds one operation to its
//! callback for the duration of a submission. The engine never allocates
//! per-operation state: the record's address is the identity the kernel
//! hands back (`user_data` on io_uring, `udata` on kqueue), and its
//! intrusive `next` link threads it through the engine's internal queues.
//!
//! The address must therefore stay stable from submission until the
//! callback fires. After the callback the record is the caller's again and
//! may be resubmitted, including from inside the callback itself.

use std::ffi::c_void;
use std::ptr::{self, NonNull};

use crate::engine::Engine;
use crate::error::{self, TimeoutError};
use crate::op::{OpTag, Operation};

/// Type-erased dispatch hook.
///
/// Monomorphized per context type and operation by the submitters: it
/// recovers the typed context from `context`, re-types `user_fn` into the
/// user's callback, decodes the raw result, and calls the user.
pub(crate) type Thunk =
    unsafe fn(context: *mut c_void, user_fn: *const (), io: &mut Engine, completion: NonNull<Completion>);

/// Caller-owned record for one in-flight operation.
///
/// Owned by exactly one engine queue, or by the kernel, at any time while
/// in flight; never by two. The raw kernel result is stored here by the
/// io_uring backend; the kqueue backend fills it in after performing the
/// operation inline on readiness.
pub struct Completion {
    /// Intrusive link; `None` when not queued (or at a queue's tail).
    pub(crate) next: Option<NonNull<Completion>>,
    pub(crate) op: Operation,
    pub(crate) context: *mut c_void,
    pub(crate) user_fn: *const (),
    pub(crate) thunk: Option<Thunk>,
    /// Non-negative value or negated errno, as the kernel reports it.
    pub(crate) result: i32,
    /// When set, this record is the first half of a linked pair and must be
    /// submitted adjacently with the following link-timeout record.
    pub(crate) linked: bool,
}

impl Completion {
    /// A fresh, never-submitted completion.
    pub const fn new() -> Self {
        Self {
            next: None,
            op: Operation::Nop,
            context: ptr::null_mut(),
            user_fn: ptr::null(),
            thunk: None,
            result: 0,
            linked: false,
        }
    }

    /// The tag of the operation this record currently describes.
    #[inline]
    pub fn op_tag(&self) -> OpTag {
        self.op.tag()
    }

    /// The raw kernel result: non-negative on success, negated errno on
    /// failure. Meaningful only inside the callback.
    #[inline]
    pub fn raw_result(&self) -> i32 {
        self.result
    }

    /// Install an operation and callback for a fresh submission.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the record is still linked into a queue.
    pub(crate) fn prepare(
        &mut self,
        op: Operation,
        context: *mut c_void,
        user_fn: *const (),
        thunk: Thunk,
    ) {
        debug_assert!(self.next.is_none(), "completion resubmitted while queued");
        debug_assert!(op.is_active());
        self.op = op;
        self.context = context;
        self.user_fn = user_fn;
        self.thunk = Some(thunk);
        self.result = 0;
        self.linked = false;
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// A main operation paired with a timeout that cancels it.
///
/// The pair is submitted so that exactly one of the halves completes with
/// its own result while the other surfaces `canceled`. The composite user
/// callback fires exactly once, with the main half's result, only after
/// both raw result slots are filled.
pub struct LinkedCompletion {
    pub(crate) main: Completion,
    pub(crate) timeout: Completion,
    /// Storage for the synthesized cross-cancel on readiness backends.
    #[cfg(target_os = "macos")]
    pub(crate) cancel: Completion,
    pub(crate) main_result: Option<i32>,
    pub(crate) timeout_result: Option<i32>,
    pub(crate) context: *mut c_void,
    pub(crate) user_fn: *const (),
}

impl LinkedCompletion {
    pub const fn new() -> Self {
        Self {
            main: Completion::new(),
            timeout: Completion::new(),
            #[cfg(target_os = "macos")]
            cancel: Completion::new(),
            main_result: None,
            timeout_result: None,
            context: ptr::null_mut(),
            user_fn: ptr::null(),
        }
    }

    /// The raw result of the main half, once it has completed.
    #[inline]
    pub fn main_raw(&self) -> Option<i32> {
        self.main_result
    }

    /// The timeout half's own outcome, once it has completed: `Ok(())` if
    /// the timer fired (and canceled the main operation), `Canceled` if the
    /// main operation finished first.
    pub fn timeout_outcome(&self) -> Option<Result<(), TimeoutError>> {
        self.timeout_result.map(error::decode_timeout)
    }

    /// Reset the result slots and install the composite callback.
    pub(crate) fn arm(&mut self, context: *mut c_void, user_fn: *const ()) {
        debug_assert!(self.main.next.is_none());
        debug_assert!(self.timeout.next.is_none());
        self.main_result = None;
        self.timeout_result = None;
        self.context = context;
        self.user_fn = user_fn;
    }
}

impl Default for LinkedCompletion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_completion_is_inert() {
        let c = Completion::new();
        assert_eq!(c.op_tag(), OpTag::Nop);
        assert_eq!(c.raw_result(), 0);
        assert!(c.next.is_none());
        assert!(!c.linked);
    }

    #[test]
    fn test_linked_completion_slots_start_empty() {
        let linked = LinkedCompletion::new();
        assert!(linked.main_raw().is_none());
        assert!(linked.timeout_outcome().is_none());
    }

    #[test]
    fn test_timeout_outcome_decodes_raw_slot() {
        let mut linked = LinkedCompletion::new();
        linked.timeout_result = Some(-libc::ETIME);
        assert_eq!(linked.timeout_outcome(), Some(Ok(())));
        linked.timeout_result = Some(-libc::ECANCELED);
        assert_eq!(linked.timeout_outcome(), Some(Err(TimeoutError::Canceled)));
    }
}
