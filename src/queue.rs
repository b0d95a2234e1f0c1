// src/queue.rs
//! Queue elements: per-queue state, lifecycle and send paths
//!
//! A queue element owns the event ring, the scheduling discipline and the
//! discipline-specific ordering state. The hot cells (status, discipline,
//! ordering cell) are lock-free atomics; control-plane fields sit behind
//! the `ctl` lock and only change through the status state machine:
//!
//! ```text
//! Invalid ──create──▶ Init ──bind──▶ Bound ──enable──▶ Ready
//!                          ◀─unbind──     ◀─disable──
//! Ready/Bound/Init ──delete (ring empty, idle)──▶ Invalid
//! ```
//!
//! The atomic-queue ordering state is a single 64-bit cell packing
//! `(sched_count, event_count)` so scheduler admission is one CAS. For
//! parallel-ordered queues the same cell holds the sequence number of the
//! event owning the first-in-order slot.

use core::any::Any;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;

use spin::{Mutex, RwLock};

use crate::config::{
    ATOMIC_RING_SIZE, DYN_QUEUE_POOLS, FIRST_DYN_QUEUE, PARALLEL_ORD_RING_SIZE, QUEUE_NAME_LEN,
    QUEUE_STATIC_MAX,
};
use crate::core_local::current_core;
use crate::eo::ExecutionObject;
use crate::error::{EmError, EmResult, escope};
use crate::event::{Event, OP_NONE, OP_SEND, SEQ_UNDEF};
use crate::machine::EventMachine;
use crate::queue_group::truncate_name;
use crate::ring::Ring;
use crate::types::{EoId, Priority, QueueGroupId, QueueId, QueueType};

/// Queue element status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueStatus {
    Invalid = 0,
    Init = 1,
    Bound = 2,
    Ready = 3,
}

impl QueueStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Init,
            2 => Self::Bound,
            3 => Self::Ready,
            _ => Self::Invalid,
        }
    }
}

/// `sched_count` increment in the packed atomic-queue cell
pub(crate) const SCHED_ONE: u64 = 1 << 32;

#[inline]
pub(crate) fn cell_sched(cell: u64) -> u32 {
    (cell >> 32) as u32
}

#[inline]
pub(crate) fn cell_count(cell: u64) -> u32 {
    cell as u32
}

/// No owning core (the queue is scheduled by eligibility masks)
pub(crate) const OWNER_NONE: u32 = u32::MAX;

/// Dynamic-pool marker for static and internal ids
pub(crate) const DYN_POOL_NONE: u8 = u8::MAX;

/// In-flight ordering state of a parallel-ordered queue
#[derive(Default)]
pub(crate) struct OrderState {
    /// Next sequence number to stamp at dequeue
    pub next_seq: u64,
    /// Dequeued, not yet committed events in dequeue order
    pub inflight: VecDeque<(u64, u32)>,
}

/// Control-plane fields, guarded by the element's `ctl` lock
pub(crate) struct QueueCtl {
    pub prio: Priority,
    pub group: QueueGroupId,
    pub name: String,
    pub eo: EoId,
    /// Cached copy of the EO's receive object for hot-path locality;
    /// valid exactly while the queue is bound
    pub recv: Option<Arc<dyn ExecutionObject>>,
    /// User-defined queue context
    pub context: Option<Arc<dyn Any + Send + Sync>>,
    /// Owning core of an internal per-core queue
    pub owner_core: u32,
    /// Free pool this dynamic id returns to on delete
    pub dyn_pool: u8,
}

/// One queue table slot
#[repr(align(64))]
pub(crate) struct QueueElement {
    status: AtomicU32,
    qtype: AtomicU8,
    /// Atomic: packed `(sched_count, event_count)`.
    /// Parallel-ordered: sequence holding the first-in-order slot.
    pub order_cell: AtomicU64,
    /// Event ring (atomic/parallel) or order ring (parallel-ordered).
    /// The `Arc` keeps a ring alive for any dispatcher still holding it.
    pub ring: RwLock<Option<Arc<Ring>>>,
    /// Queue-specific lock: serialises the ordered dequeue/hand-off
    pub order: Mutex<OrderState>,
    pub ctl: RwLock<QueueCtl>,
}

impl QueueElement {
    pub fn new() -> Self {
        Self {
            status: AtomicU32::new(QueueStatus::Invalid as u32),
            qtype: AtomicU8::new(0),
            order_cell: AtomicU64::new(0),
            ring: RwLock::new(None),
            order: Mutex::new(OrderState::default()),
            ctl: RwLock::new(QueueCtl {
                prio: Priority::UNDEF,
                group: QueueGroupId::UNDEF,
                name: String::new(),
                eo: EoId::UNDEF,
                recv: None,
                context: None,
                owner_core: OWNER_NONE,
                dyn_pool: DYN_POOL_NONE,
            }),
        }
    }

    #[inline]
    pub fn status(&self) -> QueueStatus {
        QueueStatus::from_u32(self.status.load(Ordering::Acquire))
    }

    fn store_status(&self, status: QueueStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    /// Reserve an `Invalid` slot; the winner proceeds to `Init`
    fn try_reserve(&self) -> bool {
        self.status
            .compare_exchange(
                QueueStatus::Invalid as u32,
                QueueStatus::Init as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Reserve a slot for the internal-queue bring-up path
    pub fn reserve_for_init(&self) -> bool {
        self.try_reserve()
    }

    /// Jump straight to `Ready`; internal queues have no bind/enable
    pub fn set_ready(&self) {
        self.store_status(QueueStatus::Ready);
    }

    #[inline]
    pub fn qtype(&self) -> Option<QueueType> {
        QueueType::from_u8(self.qtype.load(Ordering::Acquire))
    }

    /// Ring reference for the dispatch hot path
    pub fn ring_ref(&self) -> Option<Arc<Ring>> {
        self.ring.read().clone()
    }

    /// True when the ring holds at least one event
    pub fn ring_nonempty(&self) -> bool {
        self.ring.read().as_ref().is_some_and(|r| !r.is_empty())
    }
}

/// A failed `send`; the caller keeps ownership of the event
#[derive(Debug)]
pub struct SendError {
    /// What went wrong
    pub error: EmError,
    /// Where it went wrong
    pub escope: u32,
    /// The undelivered event, handed back
    pub event: Event,
}

impl core::fmt::Display for SendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "send failed: {}", self.error)
    }
}

impl EventMachine {
    /// Create a queue
    ///
    /// With `id` the queue takes that static id (`[0, 255]`); without, an
    /// id is allocated from the dynamic pools.
    pub fn queue_create(
        &self,
        name: &str,
        qtype: QueueType,
        prio: Priority,
        group: QueueGroupId,
        id: Option<QueueId>,
    ) -> EmResult<QueueId> {
        if !prio.is_valid() {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_ALLOC));
        }
        if !self.qgroups.is_allocated(group) {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_ALLOC));
        }

        let qid = match id {
            Some(qid) => {
                if qid.as_u32() > QUEUE_STATIC_MAX {
                    return Err(self.report_error(EmError::BadId, escope::QUEUE_ALLOC));
                }
                if !self.queues[qid.as_u32() as usize].try_reserve() {
                    return Err(self.report_error(EmError::NotFree, escope::QUEUE_ALLOC));
                }
                qid
            }
            None => self.alloc_dyn_queue()?,
        };

        let elem = &self.queues[qid.as_u32() as usize];
        self.queue_init(elem, name, qtype, prio, group, OWNER_NONE);

        if let Some(cl) = current_core().and_then(|c| self.core_locals.get(c)) {
            cl.queue_create_count.fetch_add(1, Ordering::Relaxed);
        }
        log::debug!("queue {qid} '{name}' created ({qtype:?}, prio {})", prio.level());
        Ok(qid)
    }

    /// Bind a queue in `Init` to an EO
    pub fn queue_bind(&self, queue: QueueId, eo: EoId) -> EmResult<()> {
        let Some(elem) = self.queue_elem(queue) else {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_STATE_CHANGE));
        };
        let Some(obj) = self.eo_object(eo) else {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_STATE_CHANGE));
        };

        let mut ctl = elem.ctl.write();
        if elem.status() != QueueStatus::Init {
            return Err(self.report_error(EmError::BadState, escope::QUEUE_STATE_CHANGE));
        }
        ctl.eo = eo;
        ctl.recv = Some(obj);
        elem.store_status(QueueStatus::Bound);
        drop(ctl);

        self.eo_link_queue(eo, queue);
        Ok(())
    }

    /// Make a `Bound` queue schedulable
    pub fn queue_enable(&self, queue: QueueId) -> EmResult<()> {
        let Some(elem) = self.queue_elem(queue) else {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_STATE_CHANGE));
        };
        let ctl = elem.ctl.write();
        if elem.status() != QueueStatus::Bound {
            return Err(self.report_error(EmError::BadState, escope::QUEUE_STATE_CHANGE));
        }
        elem.store_status(QueueStatus::Ready);
        drop(ctl);

        self.bump_config_gen();
        Ok(())
    }

    /// Take a `Ready` queue out of scheduling
    ///
    /// Events already in the ring stay there and drain after a re-enable.
    pub fn queue_disable(&self, queue: QueueId) -> EmResult<()> {
        let Some(elem) = self.queue_elem(queue) else {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_STATE_CHANGE));
        };
        let ctl = elem.ctl.write();
        if elem.status() != QueueStatus::Ready {
            return Err(self.report_error(EmError::BadState, escope::QUEUE_STATE_CHANGE));
        }
        elem.store_status(QueueStatus::Bound);
        drop(ctl);

        self.bump_config_gen();
        Ok(())
    }

    /// Detach a disabled queue from its EO
    pub fn queue_unbind(&self, queue: QueueId) -> EmResult<()> {
        let Some(elem) = self.queue_elem(queue) else {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_STATE_CHANGE));
        };
        let mut ctl = elem.ctl.write();
        if elem.status() != QueueStatus::Bound {
            return Err(self.report_error(EmError::BadState, escope::QUEUE_STATE_CHANGE));
        }
        let eo = ctl.eo;
        ctl.eo = EoId::UNDEF;
        ctl.recv = None;
        elem.store_status(QueueStatus::Init);
        drop(ctl);

        self.eo_unlink_queue(eo, queue);
        Ok(())
    }

    /// Delete a queue
    ///
    /// Requires an empty ring and no in-flight dispatch; unbinds
    /// implicitly when still bound. The slot returns to its free pool.
    pub fn queue_delete(&self, queue: QueueId) -> EmResult<()> {
        let Some(elem) = self.queue_elem(queue) else {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_STATE_CHANGE));
        };
        let mut ctl = elem.ctl.write();
        if elem.status() == QueueStatus::Invalid {
            return Err(self.report_error(EmError::BadState, escope::QUEUE_STATE_CHANGE));
        }

        // Drain semantics: nothing queued, nothing dispatched
        if elem.ring.read().as_ref().is_some_and(|r| !r.is_empty()) {
            return Err(self.report_error(EmError::NotFree, escope::QUEUE_STATE_CHANGE));
        }
        match elem.qtype() {
            Some(QueueType::Atomic) => {
                let cell = elem.order_cell.load(Ordering::Acquire);
                if cell_sched(cell) != 0 || cell_count(cell) != 0 {
                    return Err(self.report_error(EmError::NotFree, escope::QUEUE_STATE_CHANGE));
                }
            }
            Some(QueueType::ParallelOrdered) => {
                if !elem.order.lock().inflight.is_empty() {
                    return Err(self.report_error(EmError::NotFree, escope::QUEUE_STATE_CHANGE));
                }
            }
            _ => {}
        }

        let eo = ctl.eo;
        let dyn_pool = ctl.dyn_pool;
        ctl.eo = EoId::UNDEF;
        ctl.recv = None;
        ctl.context = None;
        ctl.dyn_pool = DYN_POOL_NONE;
        elem.store_status(QueueStatus::Invalid);
        drop(ctl);

        if !eo.is_undef() {
            self.eo_unlink_queue(eo, queue);
        }
        if dyn_pool != DYN_POOL_NONE {
            // Cannot fail: each dynamic id is in circulation exactly once
            let _ = self.dyn_pools[dyn_pool as usize].enqueue(queue.as_u32());
        }

        self.bump_config_gen();
        log::debug!("queue {queue} deleted");
        Ok(())
    }

    /// Send an event to a queue
    ///
    /// From inside a receive call on a parallel-ordered queue, forwarding
    /// the in-flight event commits it in source-dequeue order (see the
    /// scheduler module). On failure the event is handed back inside the
    /// error.
    pub fn send(&self, event: Event, queue: QueueId) -> Result<(), SendError> {
        let idx = event.into_raw();

        if let Some(core) = current_core().filter(|&c| c < self.core_locals.len()) {
            let cl = &self.core_locals[core];
            if cl.current_event.load(Ordering::Relaxed) == idx
                && cl.current_seq.load(Ordering::Relaxed) != SEQ_UNDEF
            {
                return match self.send_from_ordered(core, idx, queue) {
                    Ok(()) => Ok(()),
                    Err(e) => Err(SendError {
                        error: self.report_error(e, escope::SEND_FROM_PARALLEL_ORD),
                        escope: escope::SEND_FROM_PARALLEL_ORD,
                        event: Event::from_raw(idx),
                    }),
                };
            }
        }

        let escope = self.send_escope(queue);
        match self.send_to_queue(idx, queue) {
            Ok(()) => Ok(()),
            Err(e) => Err(SendError {
                error: self.report_error(e, escope),
                escope,
                event: Event::from_raw(idx),
            }),
        }
    }

    /// Send an event tagged with an event group
    pub fn send_group(
        &self,
        event: Event,
        queue: QueueId,
        group: crate::types::EventGroupId,
    ) -> Result<(), SendError> {
        self.pool
            .hdr(event.raw())
            .event_group
            .store(group.as_u32(), Ordering::Relaxed);
        self.send(event, queue)
    }

    /// Enqueue an event slot into a queue's ring, discipline-aware
    ///
    /// Does not report errors; callers decide the escope and reporting.
    pub(crate) fn send_to_queue(&self, idx: u32, queue: QueueId) -> EmResult<()> {
        let Some(elem) = self.queue_elem(queue) else {
            return Err(EmError::BadId);
        };
        if elem.status() != QueueStatus::Ready {
            return Err(EmError::BadState);
        }
        let Some(qtype) = elem.qtype() else {
            return Err(EmError::BadState);
        };

        let hdr = self.pool.hdr(idx);
        hdr.src_queue.store(queue.as_u32(), Ordering::Relaxed);
        hdr.src_qtype.store(qtype as u8, Ordering::Relaxed);

        let ring = elem.ring.read();
        let Some(ring) = ring.as_ref() else {
            return Err(EmError::BadState);
        };

        match qtype {
            QueueType::Atomic => {
                // Count first so a winning dispatcher always sees the
                // increment of every entry it dequeues
                elem.order_cell.fetch_add(1, Ordering::AcqRel);
                if ring.enqueue(idx).is_err() {
                    elem.order_cell.fetch_sub(1, Ordering::AcqRel);
                    return Err(EmError::LibFailed);
                }
                Ok(())
            }
            QueueType::Parallel | QueueType::ParallelOrdered => {
                if ring.enqueue(idx).is_err() {
                    return Err(EmError::LibFailed);
                }
                Ok(())
            }
        }
    }

    /// Commit a forward from ordered context in source-dequeue order
    ///
    /// Spins until this event's sequence owns the first-in-order slot,
    /// enqueues into the destination under the source queue's lock, then
    /// advances the slot. Bounded by the longest in-flight receive on any
    /// peer core.
    fn send_from_ordered(&self, core: usize, idx: u32, dst: QueueId) -> EmResult<()> {
        let cl = &self.core_locals[core];
        let src = QueueId::new(cl.current_queue.load(Ordering::Relaxed));
        let Some(src_elem) = self.queue_elem(src) else {
            return Err(EmError::BadContext);
        };
        let seq = cl.current_seq.load(Ordering::Relaxed);

        let hdr = self.pool.hdr(idx);
        hdr.dst_queue.store(dst.as_u32(), Ordering::Relaxed);
        hdr.operation.store(OP_SEND, Ordering::Release);

        while src_elem.order_cell.load(Ordering::Acquire) != seq {
            core::hint::spin_loop();
        }

        let mut st = src_elem.order.lock();
        debug_assert_eq!(st.inflight.front().map(|e| e.0), Some(seq));
        st.inflight.pop_front();

        let dst = QueueId::new(hdr.dst_queue.load(Ordering::Relaxed));
        hdr.operation.store(OP_NONE, Ordering::Relaxed);
        let result = self.send_to_queue(idx, dst);

        let next = st.inflight.front().map_or(SEQ_UNDEF, |e| e.0);
        src_elem.order_cell.store(next, Ordering::Release);
        drop(st);

        // The ordering slot is consumed either way; a retry after an
        // error takes the plain send path
        cl.ordered_committed.store(true, Ordering::Relaxed);
        cl.current_seq.store(SEQ_UNDEF, Ordering::Relaxed);
        result
    }

    /// Release the ordering slot of an event that was not forwarded
    pub(crate) fn ordered_release(&self, elem: &QueueElement, seq: u64) {
        while elem.order_cell.load(Ordering::Acquire) != seq {
            core::hint::spin_loop();
        }
        let mut st = elem.order.lock();
        debug_assert_eq!(st.inflight.front().map(|e| e.0), Some(seq));
        st.inflight.pop_front();
        let next = st.inflight.front().map_or(SEQ_UNDEF, |e| e.0);
        elem.order_cell.store(next, Ordering::Release);
    }

    /// Attach a user context to a queue
    pub fn queue_set_context(
        &self,
        queue: QueueId,
        context: Arc<dyn Any + Send + Sync>,
    ) -> EmResult<()> {
        let Some(elem) = self.queue_elem(queue) else {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_STATE_CHANGE));
        };
        let mut ctl = elem.ctl.write();
        if elem.status() == QueueStatus::Invalid {
            return Err(self.report_error(EmError::BadState, escope::QUEUE_STATE_CHANGE));
        }
        ctl.context = Some(context);
        Ok(())
    }

    /// User context of a queue
    #[must_use]
    pub fn queue_context(&self, queue: QueueId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.queue_elem(queue)?.ctl.read().context.clone()
    }

    /// Queue name
    pub fn queue_name(&self, queue: QueueId) -> EmResult<String> {
        let Some(elem) = self.queue_elem(queue) else {
            return Err(EmError::BadId);
        };
        if elem.status() == QueueStatus::Invalid {
            return Err(EmError::BadId);
        }
        Ok(elem.ctl.read().name.clone())
    }

    /// Queue discipline
    pub fn queue_type(&self, queue: QueueId) -> EmResult<QueueType> {
        let elem = self.queue_elem(queue).ok_or(EmError::BadId)?;
        if elem.status() == QueueStatus::Invalid {
            return Err(EmError::BadId);
        }
        elem.qtype().ok_or(EmError::BadState)
    }

    /// Queue priority
    pub fn queue_priority(&self, queue: QueueId) -> EmResult<Priority> {
        let elem = self.queue_elem(queue).ok_or(EmError::BadId)?;
        if elem.status() == QueueStatus::Invalid {
            return Err(EmError::BadId);
        }
        Ok(elem.ctl.read().prio)
    }

    /// Queue group of a queue
    pub fn queue_group_of(&self, queue: QueueId) -> EmResult<QueueGroupId> {
        let elem = self.queue_elem(queue).ok_or(EmError::BadId)?;
        if elem.status() == QueueStatus::Invalid {
            return Err(EmError::BadId);
        }
        Ok(elem.ctl.read().group)
    }

    /// Current status of a queue
    #[must_use]
    pub fn queue_status(&self, queue: QueueId) -> QueueStatus {
        self.queue_elem(queue)
            .map_or(QueueStatus::Invalid, QueueElement::status)
    }

    pub(crate) fn queue_elem(&self, queue: QueueId) -> Option<&QueueElement> {
        self.queues.get(queue.as_u32() as usize)
    }

    /// Initialise a freshly reserved slot (status already `Init`)
    pub(crate) fn queue_init(
        &self,
        elem: &QueueElement,
        name: &str,
        qtype: QueueType,
        prio: Priority,
        group: QueueGroupId,
        owner_core: u32,
    ) {
        let cap = match qtype {
            QueueType::ParallelOrdered => PARALLEL_ORD_RING_SIZE,
            _ => ATOMIC_RING_SIZE,
        };
        {
            let mut ring = elem.ring.write();
            // Reuse the previous ring when the capacity fits; a stale
            // dispatcher may still hold the old Arc, which stays valid
            if !ring.as_ref().is_some_and(|r| r.capacity() == cap) {
                *ring = Some(Arc::new(Ring::new(cap)));
            }
        }

        elem.qtype.store(qtype as u8, Ordering::Release);
        elem.order_cell.store(
            match qtype {
                QueueType::ParallelOrdered => SEQ_UNDEF,
                _ => 0,
            },
            Ordering::Release,
        );
        {
            let mut st = elem.order.lock();
            st.next_seq = 0;
            st.inflight.clear();
        }

        let mut ctl = elem.ctl.write();
        ctl.prio = prio;
        ctl.group = group;
        ctl.name = truncate_name(name, QUEUE_NAME_LEN);
        ctl.eo = EoId::UNDEF;
        ctl.recv = None;
        ctl.context = None;
        ctl.owner_core = owner_core;
    }

    /// Allocate a dynamic queue id, rotating over the free pools
    fn alloc_dyn_queue(&self) -> EmResult<QueueId> {
        let start = self.dyn_pool_rr.fetch_add(1, Ordering::Relaxed) as usize;
        for i in 0..DYN_QUEUE_POOLS {
            let pool = (start + i) % DYN_QUEUE_POOLS;
            if let Some(id) = self.dyn_pools[pool].dequeue() {
                let elem = &self.queues[id as usize];
                let reserved = elem.try_reserve();
                debug_assert!(reserved, "free-pool id {id} was not Invalid");
                elem.ctl.write().dyn_pool = pool as u8;
                return Ok(QueueId::new(id));
            }
        }
        Err(self.report_error(EmError::AllocFailed, escope::QUEUE_ALLOC))
    }

    fn send_escope(&self, queue: QueueId) -> u32 {
        match self.queue_elem(queue).and_then(QueueElement::qtype) {
            Some(QueueType::Atomic) => escope::SEND_ATOMIC,
            Some(QueueType::ParallelOrdered) => escope::SEND_PARALLEL_ORD,
            _ => escope::SEND_PARALLEL,
        }
    }
}

// The first dynamic id must stay above the internal region
const _: () = assert!(FIRST_DYN_QUEUE > QUEUE_STATIC_MAX);
