// src/core_local.rs
//! Per-core local state
//!
//! One cache-line-isolated block per worker core. The dispatch context
//! fields are only ever written by the owning core; they are atomics so
//! the block stays `Sync` without locking, not because of contention.
//!
//! The core id itself is carried in a thread-local set by
//! [`crate::EventMachine::init_local`].

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::cell::Cell;

use spin::Mutex;

use crate::event::SEQ_UNDEF;
use crate::types::{EventGroupId, Priority, QueueId};

std::thread_local! {
    static CORE_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Core id of the calling thread, if it has run `init_local`
#[must_use]
pub fn current_core() -> Option<usize> {
    let id = CORE_ID.with(Cell::get);
    (id != usize::MAX).then_some(id)
}

pub(crate) fn bind_current_core(core: usize) -> bool {
    CORE_ID.with(|c| {
        if c.get() != usize::MAX {
            return false;
        }
        c.set(core);
        true
    })
}

/// One queue candidate in a scheduling snapshot
#[derive(Debug, Clone, Copy)]
pub(crate) struct SchedEntry {
    pub qid: u32,
    pub group: u8,
}

/// Per-core scheduling snapshot, rebuilt when the config generation moves
#[derive(Debug, Default)]
pub(crate) struct CoreSched {
    /// Generation the snapshot was built against
    pub cached_gen: u64,
    /// Bit `g` set iff queue group `g`'s core mask includes this core
    pub group_mask: u64,
    /// Ready queues per priority level, excluding core-owned queues
    pub lists: [Vec<SchedEntry>; Priority::NUM],
    /// Per-priority scan cursor
    pub cursors: [usize; Priority::NUM],
}

/// Core local variables
#[repr(align(64))]
pub(crate) struct CoreLocal {
    /// Queue element being dispatched, `QueueId::UNDEF` outside receive
    pub current_queue: AtomicU32,
    /// Event slot being dispatched
    pub current_event: AtomicU32,
    /// Event group captured from the header before the receive call
    pub current_group: AtomicU32,
    /// Ordering slot captured before the receive call
    pub current_seq: AtomicU64,
    /// Set by the ordered egress path when the in-flight event commits
    pub ordered_committed: AtomicBool,

    /// The number of times queue create has been called on this core
    pub queue_create_count: AtomicU64,
    /// The number of errors reported on this core
    pub error_count: AtomicU64,
    /// Reentrancy guard around the EO error handler
    pub in_error_handler: AtomicBool,

    /// Scheduling snapshot; touched only by the owning core, the lock is
    /// uncontended by construction
    pub sched: Mutex<CoreSched>,
}

impl CoreLocal {
    pub fn new() -> Self {
        Self {
            current_queue: AtomicU32::new(QueueId::UNDEF.as_u32()),
            current_event: AtomicU32::new(u32::MAX),
            current_group: AtomicU32::new(EventGroupId::UNDEF.as_u32()),
            current_seq: AtomicU64::new(SEQ_UNDEF),
            ordered_committed: AtomicBool::new(false),
            queue_create_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            in_error_handler: AtomicBool::new(false),
            sched: Mutex::new(CoreSched::default()),
        }
    }

    /// Enter the dispatch context for one event
    pub fn enter_dispatch(&self, queue: u32, event: u32, group: u32, seq: u64) {
        self.current_queue.store(queue, Ordering::Relaxed);
        self.current_event.store(event, Ordering::Relaxed);
        self.current_group.store(group, Ordering::Relaxed);
        self.current_seq.store(seq, Ordering::Relaxed);
        self.ordered_committed.store(false, Ordering::Relaxed);
    }

    /// Leave the dispatch context
    pub fn leave_dispatch(&self) {
        self.current_queue
            .store(QueueId::UNDEF.as_u32(), Ordering::Relaxed);
        self.current_event.store(u32::MAX, Ordering::Relaxed);
        self.current_group
            .store(EventGroupId::UNDEF.as_u32(), Ordering::Relaxed);
        self.current_seq.store(SEQ_UNDEF, Ordering::Relaxed);
    }
}

// Per-core blocks must not share cache lines
const _: () = assert!(core::mem::align_of::<CoreLocal>() >= 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_context_round_trip() {
        let cl = CoreLocal::new();
        cl.enter_dispatch(5, 9, 2, 17);
        assert_eq!(cl.current_queue.load(Ordering::Relaxed), 5);
        assert_eq!(cl.current_event.load(Ordering::Relaxed), 9);
        assert_eq!(cl.current_group.load(Ordering::Relaxed), 2);
        assert_eq!(cl.current_seq.load(Ordering::Relaxed), 17);
        assert!(!cl.ordered_committed.load(Ordering::Relaxed));

        cl.leave_dispatch();
        assert_eq!(
            cl.current_queue.load(Ordering::Relaxed),
            QueueId::UNDEF.as_u32()
        );
        assert_eq!(cl.current_seq.load(Ordering::Relaxed), SEQ_UNDEF);
    }

    #[test]
    fn test_core_binding_in_thread() {
        std::thread::spawn(|| {
            assert_eq!(current_core(), None);
            assert!(bind_current_core(3));
            assert_eq!(current_core(), Some(3));
            // A second bind on the same thread is rejected
            assert!(!bind_current_core(4));
            assert_eq!(current_core(), Some(3));
        })
        .join()
        .unwrap();
    }
}
