// src/sched.rs
//! Per-core scheduler and dispatch loop
//!
//! Every worker core runs the same busy-polling iteration: refresh the
//! scheduling snapshot if the config generation moved, poll the core's
//! own internal queue, then walk the priorities from highest to lowest
//! and admit the first runnable queue. Admission is discipline specific:
//!
//! - **Atomic**: one CAS on the packed `(sched_count, event_count)` cell;
//!   the winner drains exclusively and releases afterwards, giving
//!   non-concurrent FIFO delivery.
//! - **Parallel**: any eligible core with a non-empty ring dequeues.
//! - **Parallel-ordered**: dequeue happens under the queue lock so the
//!   sequence stamp equals dequeue order; the receive calls then run
//!   concurrently and egress is serialised on the ordering slot.
//!
//! Strict priority is intentional: higher levels may starve lower ones.

use core::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::EmConfig;
use crate::core_local::current_core;
use crate::eo::ExecutionObject;
use crate::error::{EmError, escope};
use crate::event::{Event, SEQ_UNDEF};
use crate::machine::EventMachine;
use crate::queue::{QueueElement, QueueStatus, SCHED_ONE, cell_count, cell_sched};
use crate::types::{EventGroupId, EventType, Priority, QueueId, QueueType};

/// Upper bound of the configurable dispatch burst
pub(crate) const SCHED_BURST_MAX: usize = 64;

impl EventMachine {
    /// Run one dispatch iteration on the calling core
    ///
    /// Returns the number of events delivered. The calling thread must
    /// have run [`EventMachine::init_local`].
    pub fn dispatch_once(&self) -> usize {
        let Some(core) = current_core().filter(|&c| c < self.core_locals.len()) else {
            self.report_error(EmError::BadContext, escope::DISPATCH);
            return 0;
        };

        self.refresh_snapshot(core);

        // The core-owned internal queue is polled out of band; it never
        // appears in a scheduling snapshot
        let qid = QueueId::new(EmConfig::internal_queue(core));
        let n = self.try_admit_atomic(core, qid);
        if n > 0 {
            return n;
        }

        self.scan_priorities(core)
    }

    /// Busy-poll until [`EventMachine::shutdown`]
    ///
    /// Never sleeps; with `idle_pause` configured an empty iteration
    /// issues a `spin_loop` hint.
    pub fn dispatch_loop(&self) {
        while !self.is_shutdown() {
            let n = self.dispatch_once();
            if n == 0 && self.conf.idle_pause {
                core::hint::spin_loop();
            }
        }
        log::debug!("dispatch loop exits on core {:?}", current_core());
    }

    /// Rebuild the core's snapshot when the config generation moved
    fn refresh_snapshot(&self, core: usize) {
        let r#gen = self.config_gen.load(Ordering::Acquire);
        let cl = &self.core_locals[core];
        let mut s = cl.sched.lock();
        if s.cached_gen == r#gen {
            return;
        }

        s.group_mask = self.qgroups.eligibility_mask(core);
        for list in &mut s.lists {
            list.clear();
        }
        for (qid, elem) in self.queues.iter().enumerate() {
            if elem.status() != QueueStatus::Ready {
                continue;
            }
            let ctl = elem.ctl.read();
            if ctl.owner_core != crate::queue::OWNER_NONE {
                continue;
            }
            let prio = ctl.prio.level() as usize;
            if prio < Priority::NUM {
                s.lists[prio].push(crate::core_local::SchedEntry {
                    qid: qid as u32,
                    group: ctl.group.as_u32() as u8,
                });
            }
        }
        s.cached_gen = r#gen;
        log::trace!("core {core} snapshot refreshed, gen {}", r#gen);
    }

    /// Walk priorities from highest to lowest; dispatch the first
    /// admissible queue
    fn scan_priorities(&self, core: usize) -> usize {
        let cl = &self.core_locals[core];

        for prio in (0..Priority::NUM).rev() {
            // Candidate selection under the (uncontended) snapshot lock,
            // dispatch outside of it
            let admitted = {
                let mut s = cl.sched.lock();
                let len = s.lists[prio].len();
                if len == 0 {
                    continue;
                }
                let start = s.cursors[prio] % len;
                let mut found = None;
                for i in 0..len {
                    let pos = (start + i) % len;
                    let entry = s.lists[prio][pos];
                    if s.group_mask & (1u64 << entry.group) == 0 {
                        continue;
                    }
                    let qid = QueueId::new(entry.qid);
                    let Some(elem) = self.queue_elem(qid) else {
                        continue;
                    };
                    if elem.status() != QueueStatus::Ready {
                        continue;
                    }
                    match elem.qtype() {
                        Some(QueueType::Atomic) => {
                            if self.atomic_admission(elem) {
                                found = Some((pos, qid, QueueType::Atomic));
                            }
                        }
                        Some(QueueType::Parallel) => {
                            if elem.ring_nonempty() {
                                found = Some((pos, qid, QueueType::Parallel));
                            }
                        }
                        Some(QueueType::ParallelOrdered) => {
                            if elem.ring_nonempty() {
                                found = Some((pos, qid, QueueType::ParallelOrdered));
                            }
                        }
                        None => continue,
                    }
                    if found.is_some() {
                        s.cursors[prio] = pos + 1;
                        break;
                    }
                }
                found
            };

            let Some((_, qid, qtype)) = admitted else {
                continue;
            };
            let elem = self.queue_elem(qid).expect("admitted queue exists");
            return match qtype {
                QueueType::Atomic => self.dispatch_atomic(core, qid, elem),
                QueueType::Parallel => self.dispatch_parallel(core, qid, elem),
                QueueType::ParallelOrdered => self.dispatch_ordered(core, qid, elem),
            };
        }
        0
    }

    /// CAS admission on the packed cell: wins iff
    /// `sched_count == 0 && event_count > 0`
    fn atomic_admission(&self, elem: &QueueElement) -> bool {
        let cell = elem.order_cell.load(Ordering::Acquire);
        if cell_sched(cell) != 0 || cell_count(cell) == 0 {
            return false;
        }
        elem.order_cell
            .compare_exchange(cell, cell | SCHED_ONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Admission + dispatch of one atomic queue (internal-queue path)
    fn try_admit_atomic(&self, core: usize, qid: QueueId) -> usize {
        let Some(elem) = self.queue_elem(qid) else {
            return 0;
        };
        if elem.status() != QueueStatus::Ready || !self.atomic_admission(elem) {
            return 0;
        }
        self.dispatch_atomic(core, qid, elem)
    }

    /// Drain one burst from an exclusively held atomic queue
    fn dispatch_atomic(&self, core: usize, qid: QueueId, elem: &QueueElement) -> usize {
        let release = || {
            elem.order_cell.fetch_sub(SCHED_ONE, Ordering::AcqRel);
        };

        if elem.status() != QueueStatus::Ready {
            release();
            return 0;
        }
        let Some(recv) = elem.ctl.read().recv.clone() else {
            release();
            return 0;
        };
        let Some(ring) = elem.ring_ref() else {
            // Ready with no ring breaks the state-machine invariant
            self.fatal_error(EmError::BadState, escope::SCHEDULE_ATOMIC);
        };

        let burst = self.conf.sched_burst.min(SCHED_BURST_MAX);
        let mut buf = [0u32; SCHED_BURST_MAX];
        let n = ring.dequeue_burst(&mut buf[..burst]);
        if n > 0 {
            elem.order_cell.fetch_sub(n as u64, Ordering::AcqRel);
        }

        // Exclusive hold: events of one atomic queue run sequentially,
        // in ring order, on this core
        for &idx in &buf[..n] {
            self.deliver(core, qid, &recv, idx, SEQ_UNDEF, None);
        }

        release();
        n
    }

    /// Drain one burst from a parallel queue; no exclusion, no ordering
    fn dispatch_parallel(&self, core: usize, qid: QueueId, elem: &QueueElement) -> usize {
        if elem.status() != QueueStatus::Ready {
            return 0;
        }
        let Some(recv) = elem.ctl.read().recv.clone() else {
            return 0;
        };
        let Some(ring) = elem.ring_ref() else {
            self.fatal_error(EmError::BadState, escope::SCHEDULE_PARALLEL);
        };

        let burst = self.conf.sched_burst.min(SCHED_BURST_MAX);
        let mut buf = [0u32; SCHED_BURST_MAX];
        let n = ring.dequeue_burst(&mut buf[..burst]);
        for &idx in &buf[..n] {
            self.deliver(core, qid, &recv, idx, SEQ_UNDEF, None);
        }
        n
    }

    /// Dequeue a burst from an ordered queue and stamp sequence numbers
    ///
    /// The pop and the stamp happen under the queue lock, so the stamp
    /// equals the dequeue order across all cores. The receive calls run
    /// outside the lock, concurrently with peers.
    fn dispatch_ordered(&self, core: usize, qid: QueueId, elem: &QueueElement) -> usize {
        if elem.status() != QueueStatus::Ready {
            return 0;
        }
        let Some(recv) = elem.ctl.read().recv.clone() else {
            return 0;
        };
        let Some(ring) = elem.ring_ref() else {
            self.fatal_error(EmError::BadState, escope::SCHEDULE_PARALLEL_ORD);
        };

        let burst = self.conf.sched_burst.min(SCHED_BURST_MAX);
        let mut buf = [0u32; SCHED_BURST_MAX];
        let n;
        {
            let mut st = elem.order.lock();
            n = ring.dequeue_burst(&mut buf[..burst]);
            for &idx in &buf[..n] {
                let seq = st.next_seq;
                st.next_seq += 1;
                self.pool.hdr(idx).order_seq.store(seq, Ordering::Release);
                st.inflight.push_back((seq, idx));
            }
            if n > 0 {
                // The slot always tracks the oldest in-flight sequence
                let front = st.inflight.front().map(|e| e.0).unwrap_or(SEQ_UNDEF);
                elem.order_cell.store(front, Ordering::Release);
            }
        }

        for &idx in &buf[..n] {
            let seq = self.pool.hdr(idx).order_seq.load(Ordering::Acquire);
            self.deliver(core, qid, &recv, idx, seq, Some(elem));
        }
        n
    }

    /// Invoke the receive function for one event and run the
    /// discipline-independent completion
    fn deliver(
        &self,
        core: usize,
        qid: QueueId,
        recv: &Arc<dyn ExecutionObject>,
        idx: u32,
        seq: u64,
        ordered_from: Option<&QueueElement>,
    ) {
        let cl = &self.core_locals[core];
        let hdr = self.pool.hdr(idx);
        let event_type = EventType::from_raw(hdr.event_type.load(Ordering::Relaxed));
        // Captured before receive: the EO may free or forward the event,
        // after which the header belongs to someone else
        let group = hdr.event_group.load(Ordering::Relaxed);

        cl.enter_dispatch(qid.as_u32(), idx, group, seq);
        recv.receive(self, Event::from_raw(idx), event_type, qid);
        let committed = cl.ordered_committed.load(Ordering::Relaxed);
        cl.leave_dispatch();

        // An ordered event that was not forwarded still occupies its
        // ordering slot; give it up so peers can make progress
        if let Some(src) = ordered_from {
            if !committed {
                self.ordered_release(src, seq);
            }
        }

        if group != EventGroupId::UNDEF.as_u32() {
            self.event_group_complete(EventGroupId::new(group));
        }
    }
}
