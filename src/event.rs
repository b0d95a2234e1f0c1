// src/event.rs
//! Events, event headers and the event pool
//!
//! An event is an opaque payload preceded by a fixed, cache-line-aligned
//! header that threads scheduling metadata through the system: source
//! queue, event type, event-group back-reference and, on the
//! parallel-ordered path, the ordering slot. Headers live in a fixed pool
//! of slots; an [`Event`] is an owned token for one slot.
//!
//! Ownership moves with the token: producer until enqueue, scheduler
//! between dequeue and the receive call, EO during receive, then either
//! the pool (on free) or the next queue (on forward). No slot has two
//! owners at once.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::error::{EmError, EmResult, escope};
use crate::machine::EventMachine;
use crate::ring::Ring;
use crate::types::{EventGroupId, EventType, PoolId, QueueId};

/// Pending header operation on the parallel-ordered path
pub(crate) const OP_NONE: u8 = 0;
/// The event has been tagged for forwarding to `dst_queue`
pub(crate) const OP_SEND: u8 = 1;

/// Ordering-slot sentinel: the event holds no slot
pub(crate) const SEQ_UNDEF: u64 = u64::MAX;

/// Undefined packet-I/O port
pub(crate) const IO_PORT_UNDEF: i32 = -1;

/// Per-event metadata, written by senders and read by receivers
///
/// The parallel-ordered fields (`order_seq`, `dst_queue`, `operation`)
/// are only meaningful while the event is in flight from an ordered
/// queue; see the scheduler module for the hand-off protocol.
#[repr(align(64))]
pub(crate) struct EventHdr {
    /// Queue this event was last sent to (receiver's source queue)
    pub src_queue: AtomicU32,
    /// Discipline of the source queue, as `QueueType` discriminant
    pub src_qtype: AtomicU8,
    /// Major/minor event type
    pub event_type: AtomicU32,
    /// Event group to decrement when the receive call completes
    pub event_group: AtomicU32,
    /// Valid payload length in bytes
    pub payload_len: AtomicU32,

    /// Ordering slot: dequeue sequence from the source ordered queue
    pub order_seq: AtomicU64,
    /// Destination tagged by a forward from ordered context
    pub dst_queue: AtomicU32,
    /// Pending operation tag (`OP_NONE` / `OP_SEND`)
    pub operation: AtomicU8,

    /// Ingress port index, set by the packet-I/O collaborator
    pub io_port: AtomicI32,
}

impl EventHdr {
    fn new() -> Self {
        Self {
            src_queue: AtomicU32::new(QueueId::UNDEF.as_u32()),
            src_qtype: AtomicU8::new(0),
            event_type: AtomicU32::new(EventType::UNDEF.as_raw()),
            event_group: AtomicU32::new(EventGroupId::UNDEF.as_u32()),
            payload_len: AtomicU32::new(0),
            order_seq: AtomicU64::new(SEQ_UNDEF),
            dst_queue: AtomicU32::new(QueueId::UNDEF.as_u32()),
            operation: AtomicU8::new(OP_NONE),
            io_port: AtomicI32::new(IO_PORT_UNDEF),
        }
    }

    /// Reset sender-visible fields for a fresh allocation
    fn reset(&self, event_type: EventType, len: usize) {
        self.src_queue
            .store(QueueId::UNDEF.as_u32(), Ordering::Relaxed);
        self.src_qtype.store(0, Ordering::Relaxed);
        self.event_type.store(event_type.as_raw(), Ordering::Relaxed);
        self.event_group
            .store(EventGroupId::UNDEF.as_u32(), Ordering::Relaxed);
        self.payload_len.store(len as u32, Ordering::Relaxed);
        self.order_seq.store(SEQ_UNDEF, Ordering::Relaxed);
        self.dst_queue
            .store(QueueId::UNDEF.as_u32(), Ordering::Relaxed);
        self.operation.store(OP_NONE, Ordering::Relaxed);
        self.io_port.store(IO_PORT_UNDEF, Ordering::Relaxed);
    }
}

/// One pool slot: header plus payload storage
pub(crate) struct EventSlot {
    pub hdr: EventHdr,
    payload: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the payload cell is only accessed through an `Event` token or
// a `&mut Event`, and exactly one such token exists per slot between
// alloc and free. The header is all atomics.
unsafe impl Sync for EventSlot {}

/// Owned handle to one allocated event
///
/// The token is not `Clone`: it moves through `send`, `free` and the
/// receive call the way the underlying memory changes owner. Dropping a
/// token without freeing or sending it leaks the pool slot.
#[must_use = "an event must be sent or freed, dropping it leaks the pool slot"]
#[derive(Debug, PartialEq, Eq)]
pub struct Event {
    idx: u32,
}

impl Event {
    pub(crate) fn from_raw(idx: u32) -> Self {
        Self { idx }
    }

    pub(crate) fn into_raw(self) -> u32 {
        let idx = self.idx;
        core::mem::forget(self);
        idx
    }

    /// Slot index of this event, for diagnostics
    #[must_use]
    pub fn raw(&self) -> u32 {
        self.idx
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        log::error!("event slot {} dropped without send or free, slot leaked", self.idx);
    }
}

/// Fixed pool of event slots with a lockless free-list
pub(crate) struct EventPool {
    slots: Box<[EventSlot]>,
    free: Ring,
    max_event_size: usize,
}

impl EventPool {
    pub fn new(events: usize, max_event_size: usize) -> Self {
        let cap = events.next_power_of_two();
        let slots: Box<[EventSlot]> = (0..events)
            .map(|_| EventSlot {
                hdr: EventHdr::new(),
                payload: UnsafeCell::new(vec![0u8; max_event_size].into_boxed_slice()),
            })
            .collect();
        let free = Ring::new(cap);
        for idx in 0..events as u32 {
            // Cannot fail: capacity >= events
            let _ = free.enqueue(idx);
        }
        Self {
            slots,
            free,
            max_event_size,
        }
    }

    pub fn alloc(&self, size: usize, event_type: EventType) -> Option<u32> {
        let idx = self.free.dequeue()?;
        self.slots[idx as usize].hdr.reset(event_type, size);
        Some(idx)
    }

    pub fn free(&self, idx: u32) {
        debug_assert!((idx as usize) < self.slots.len());
        // Cannot fail: at most `events` indices are ever in circulation
        let _ = self.free.enqueue(idx);
    }

    #[inline]
    pub fn hdr(&self, idx: u32) -> &EventHdr {
        &self.slots[idx as usize].hdr
    }

    pub fn max_event_size(&self) -> usize {
        self.max_event_size
    }

    pub fn free_count(&self) -> usize {
        self.free.count()
    }

    /// Shared view of the slot payload
    ///
    /// # Safety
    ///
    /// The caller must hold the slot's `Event` token (or a reference to
    /// it), which is the single owner of the payload cell.
    #[inline]
    pub unsafe fn payload(&self, idx: u32) -> &[u8] {
        let len = self.hdr(idx).payload_len.load(Ordering::Relaxed) as usize;
        // SAFETY: exclusive slot ownership per the caller contract
        unsafe { &(self.slots[idx as usize].payload.get().as_ref().unwrap())[..len] }
    }

    /// Mutable view of the slot payload
    ///
    /// # Safety
    ///
    /// As [`Self::payload`], with a unique borrow of the `Event` token.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self, idx: u32) -> &mut [u8] {
        let len = self.hdr(idx).payload_len.load(Ordering::Relaxed) as usize;
        // SAFETY: exclusive slot ownership per the caller contract
        unsafe { &mut (self.slots[idx as usize].payload.get().as_mut().unwrap())[..len] }
    }
}

impl EventMachine {
    /// Allocate an event of `size` bytes from `pool`
    ///
    /// Only [`PoolId::DEFAULT`] exists in this implementation.
    pub fn alloc(&self, size: usize, event_type: EventType, pool: PoolId) -> EmResult<Event> {
        if pool != PoolId::DEFAULT {
            return Err(self.report_error(EmError::BadId, escope::EVENT_ALLOC));
        }
        if size == 0 || size > self.pool.max_event_size() {
            return Err(self.report_error(EmError::TooLarge, escope::EVENT_ALLOC));
        }
        match self.pool.alloc(size, event_type) {
            Some(idx) => Ok(Event::from_raw(idx)),
            None => Err(self.report_error(EmError::AllocFailed, escope::EVENT_ALLOC)),
        }
    }

    /// Return an event to its pool
    pub fn free(&self, event: Event) {
        self.pool.free(event.into_raw());
    }

    /// Event type recorded at allocation
    #[must_use]
    pub fn event_type(&self, event: &Event) -> EventType {
        EventType::from_raw(self.pool.hdr(event.raw()).event_type.load(Ordering::Relaxed))
    }

    /// Queue this event was last sent to, as observed by a receiver
    #[must_use]
    pub fn event_source_queue(&self, event: &Event) -> QueueId {
        QueueId::new(self.pool.hdr(event.raw()).src_queue.load(Ordering::Relaxed))
    }

    /// Event group the event is tagged with, if any
    #[must_use]
    pub fn event_group_of(&self, event: &Event) -> Option<EventGroupId> {
        let gid = self.pool.hdr(event.raw()).event_group.load(Ordering::Relaxed);
        if gid == EventGroupId::UNDEF.as_u32() {
            None
        } else {
            Some(EventGroupId::new(gid))
        }
    }

    /// Read-only payload view
    #[must_use]
    pub fn payload<'a>(&'a self, event: &'a Event) -> &'a [u8] {
        // SAFETY: `event` is the slot's unique token and is borrowed for 'a
        unsafe { self.pool.payload(event.raw()) }
    }

    /// Mutable payload view
    #[must_use]
    pub fn payload_mut<'a>(&'a self, event: &'a mut Event) -> &'a mut [u8] {
        // SAFETY: `event` is the slot's unique token, uniquely borrowed for 'a
        unsafe { self.pool.payload_mut(event.raw()) }
    }

    /// Ingress port stamped by the packet-I/O collaborator
    #[must_use]
    pub fn event_io_port(&self, event: &Event) -> Option<u32> {
        let port = self.pool.hdr(event.raw()).io_port.load(Ordering::Relaxed);
        u32::try_from(port).ok()
    }

    /// Stamp the ingress port (packet-I/O collaborators only)
    pub fn event_set_io_port(&self, event: &mut Event, port: u32) {
        self.pool
            .hdr(event.raw())
            .io_port
            .store(port as i32, Ordering::Relaxed);
    }
}
