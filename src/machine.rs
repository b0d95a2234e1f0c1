// src/machine.rs
//! The Event Machine: global tables, bring-up and the internal control
//! plane
//!
//! `init_global` is called once by one core and allocates every table;
//! `init_local` is called once by every worker core and rendezvouses on a
//! busy-wait barrier. Handles are dense indices into the tables; table
//! addresses are stable for the life of the machine.
//!
//! The internal control plane runs EO lifecycle propagation: per-core
//! internal queues carry `start_local`/`stop_local` requests, the shared
//! internal queue carries the done events fired by the completion event
//! group.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use spin::Barrier;

use crate::config::{
    EmConfig, FIRST_DYN_QUEUE, MAX_CORES, SHARED_INTERNAL_QUEUE,
};
use crate::core_local::{CoreLocal, bind_current_core, current_core};
use crate::eo::{EoElement, ExecutionObject};
use crate::error::{EmError, EmResult, escope};
use crate::event::{Event, EventPool};
use crate::event_group::EventGroupElement;
use crate::queue::{QueueElement, QueueStatus};
use crate::queue_group::QueueGroupTable;
use crate::ring::Ring;
use crate::types::{EoId, EventGroupId, EventType, PoolId, QueueId};

/// Event type of internal control events
pub(crate) const EVENT_TYPE_INTERNAL: EventType =
    EventType::from_parts(EventType::SW, 0x00FF_FF00);

/// Lifecycle phase propagated to every core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalOp {
    Start,
    Stop,
}

const OP_START_LOCAL: u8 = 1;
const OP_STOP_LOCAL: u8 = 2;
const OP_DONE_START: u8 = 3;
const OP_DONE_STOP: u8 = 4;

/// Wire size of a control message payload
pub(crate) const CTRL_MSG_LEN: usize = 17;

/// Internal control message, carried in an internal event's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CtrlMsg {
    op: u8,
    eo: u32,
    group: u32,
    notif_event: u32,
    notif_queue: u32,
}

impl CtrlMsg {
    fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.op;
        buf[1..5].copy_from_slice(&self.eo.to_le_bytes());
        buf[5..9].copy_from_slice(&self.group.to_le_bytes());
        buf[9..13].copy_from_slice(&self.notif_event.to_le_bytes());
        buf[13..17].copy_from_slice(&self.notif_queue.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < CTRL_MSG_LEN {
            return None;
        }
        Some(Self {
            op: buf[0],
            eo: u32::from_le_bytes(buf[1..5].try_into().ok()?),
            group: u32::from_le_bytes(buf[5..9].try_into().ok()?),
            notif_event: u32::from_le_bytes(buf[9..13].try_into().ok()?),
            notif_queue: u32::from_le_bytes(buf[13..17].try_into().ok()?),
        })
    }
}

/// Receive handler of the internal control queues
struct InternalCtrl;

impl ExecutionObject for InternalCtrl {
    fn receive(&self, em: &EventMachine, event: Event, _event_type: EventType, _queue: QueueId) {
        let Some(msg) = CtrlMsg::decode(em.payload(&event)) else {
            log::error!("malformed internal control event, dropping");
            em.report_error(EmError::BadPointer, escope::INTERNAL_EVENT_RECEIVE);
            em.free(event);
            return;
        };
        let eo = EoId::new(msg.eo);
        let core = current_core().unwrap_or(0);

        match msg.op {
            OP_START_LOCAL => {
                if let Some(obj) = em.eo_object(eo) {
                    if let Err(e) = obj.start_local(em, eo, core) {
                        em.report_error(e, escope::EO_START_LOCAL_DONE);
                    }
                }
                em.free(event);
            }
            OP_STOP_LOCAL => {
                if let Some(obj) = em.eo_object(eo) {
                    if let Err(e) = obj.stop_local(em, eo, core) {
                        em.report_error(e, escope::EO_STOP_LOCAL_DONE);
                    }
                }
                em.free(event);
            }
            OP_DONE_START => {
                em.local_done(msg, escope::EO_START_LOCAL_DONE);
                em.free(event);
            }
            OP_DONE_STOP => {
                // Global stop runs once every core has acknowledged
                if let Some(obj) = em.eo_object(eo) {
                    if let Err(e) = obj.stop(em, eo) {
                        em.report_error(e, escope::EO_STOP_LOCAL_DONE);
                    }
                }
                em.eo_set_active(eo, false);
                em.local_done(msg, escope::EO_STOP_LOCAL_DONE);
                em.free(event);
            }
            _ => {
                log::error!("unknown internal control op {}", msg.op);
                em.report_error(EmError::NotImplemented, escope::INTERNAL_EVENT_RECEIVE);
                em.free(event);
            }
        }
    }
}

/// The Event Machine core
///
/// Created once by [`EventMachine::init_global`]; shared by reference (or
/// `Arc`) with every worker core and event producer.
pub struct EventMachine {
    pub(crate) conf: EmConfig,
    pub(crate) queues: Box<[QueueElement]>,
    pub(crate) eos: Box<[EoElement]>,
    pub(crate) pool: EventPool,
    pub(crate) groups: Box<[EventGroupElement]>,
    pub(crate) qgroups: QueueGroupTable,
    pub(crate) core_locals: Box<[CoreLocal]>,

    /// Free-id pools
    pub(crate) dyn_pools: Box<[Ring]>,
    pub(crate) dyn_pool_rr: AtomicU64,
    pub(crate) eo_free: Ring,
    pub(crate) egroup_free: Ring,

    /// Bumped on every scheduling-relevant change; cores refresh their
    /// snapshots at the top of a dispatch iteration
    pub(crate) config_gen: AtomicU64,
    pub(crate) registered_cores: AtomicU64,
    barrier: Barrier,
    shutdown: AtomicBool,
}

impl EventMachine {
    /// Global initialisation; called once by one core
    ///
    /// Allocates the queue table, EO table, event pool, event-group
    /// table, the default queue group (all configured cores) and the
    /// internal queues (one per core plus one shared).
    pub fn init_global(conf: EmConfig) -> EmResult<Arc<Self>> {
        if !conf.validate() {
            log::error!("invalid configuration: {conf:?}");
            return Err(EmError::TooLarge);
        }

        let queues: Box<[QueueElement]> =
            (0..conf.max_queues).map(|_| QueueElement::new()).collect();
        let eos: Box<[EoElement]> = (0..conf.max_eos).map(|_| EoElement::new()).collect();
        let groups: Box<[EventGroupElement]> = (0..conf.max_event_groups)
            .map(|_| EventGroupElement::new())
            .collect();
        let core_locals: Box<[CoreLocal]> =
            (0..conf.core_count).map(|_| CoreLocal::new()).collect();

        let eo_free = Ring::new(conf.max_eos.next_power_of_two());
        for id in 0..conf.max_eos as u32 {
            let _ = eo_free.enqueue(id);
        }
        let egroup_free = Ring::new(conf.max_event_groups.next_power_of_two());
        for id in 0..conf.max_event_groups as u32 {
            let _ = egroup_free.enqueue(id);
        }

        // Dynamic queue ids, contiguous chunk per pool
        let per_pool = conf.dyn_queues_per_pool();
        let dyn_pools: Box<[Ring]> = (0..crate::config::DYN_QUEUE_POOLS)
            .map(|p| {
                let ring = Ring::new(per_pool.next_power_of_two().max(2));
                let base = FIRST_DYN_QUEUE as usize + p * per_pool;
                for id in base..base + per_pool {
                    let _ = ring.enqueue(id as u32);
                }
                ring
            })
            .collect();

        let qgroups = QueueGroupTable::new();
        qgroups.init_default(conf.core_count);

        let em = Arc::new(Self {
            pool: EventPool::new(conf.pool_events, conf.max_event_size),
            queues,
            eos,
            groups,
            qgroups,
            core_locals,
            dyn_pools,
            dyn_pool_rr: AtomicU64::new(0),
            eo_free,
            egroup_free,
            config_gen: AtomicU64::new(1),
            registered_cores: AtomicU64::new(0),
            barrier: Barrier::new(conf.core_count),
            shutdown: AtomicBool::new(false),
            conf,
        });

        // Internal control queues: one per core, dispatched only by its
        // owner, plus the shared one scheduled like any other queue
        let ctrl: Arc<dyn ExecutionObject> = Arc::new(InternalCtrl);
        for core in 0..em.conf.core_count {
            em.internal_queue_setup(EmConfig::internal_queue(core), core as u32, Arc::clone(&ctrl));
        }
        em.internal_queue_setup(SHARED_INTERNAL_QUEUE, crate::queue::OWNER_NONE, ctrl);

        log::info!(
            "EM init: {} cores, {} queues, {} EOs, {} pool events",
            em.conf.core_count,
            em.conf.max_queues,
            em.conf.max_eos,
            em.conf.pool_events
        );
        Ok(em)
    }

    /// Per-core initialisation; called once by every worker core
    ///
    /// Binds the calling thread to `core`, then waits on the global
    /// barrier until the last core arrives.
    pub fn init_local(&self, core: usize) -> EmResult<()> {
        if core >= self.conf.core_count {
            return Err(self.report_error(EmError::BadId, escope::INIT_CORE));
        }
        let bit = 1u64 << core;
        if self.registered_cores.fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return Err(self.report_error(EmError::BadState, escope::INIT_CORE));
        }
        if !bind_current_core(core) {
            return Err(self.report_error(EmError::BadContext, escope::INIT_CORE));
        }

        log::debug!("core {core} registered");
        self.barrier.wait();
        Ok(())
    }

    /// Runtime configuration
    #[must_use]
    pub fn config(&self) -> &EmConfig {
        &self.conf
    }

    /// Request every dispatch loop to return
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Errors reported on `core` so far
    pub fn core_error_count(&self, core: usize) -> EmResult<u64> {
        let cl = self.core_locals.get(core).ok_or(EmError::BadId)?;
        Ok(cl.error_count.load(Ordering::Relaxed))
    }

    /// Queue creations performed on `core` so far
    pub fn core_queue_create_count(&self, core: usize) -> EmResult<u64> {
        let cl = self.core_locals.get(core).ok_or(EmError::BadId)?;
        Ok(cl.queue_create_count.load(Ordering::Relaxed))
    }

    /// Count, log and surface a non-fatal error
    ///
    /// Invokes the registered error handler of the EO in context, if any.
    pub(crate) fn report_error(&self, error: EmError, escope: u32) -> EmError {
        log::warn!("EM error {error} (code {}), escope {escope:#010x}", error.code());

        if let Some(core) = current_core() {
            if let Some(cl) = self.core_locals.get(core) {
                cl.error_count.fetch_add(1, Ordering::Relaxed);

                // Reentrancy guard: a handler reporting errors of its own
                // must not recurse
                if cl.in_error_handler.swap(true, Ordering::Acquire) {
                    return error;
                }
                let qid = QueueId::new(cl.current_queue.load(Ordering::Relaxed));
                if !qid.is_undef() {
                    if let Some(elem) = self.queue_elem(qid) {
                        let (eo, recv) = {
                            let ctl = elem.ctl.read();
                            (ctl.eo, ctl.recv.clone())
                        };
                        if let Some(recv) = recv {
                            recv.error_handler(eo, error, escope);
                        }
                    }
                }
                cl.in_error_handler.store(false, Ordering::Release);
            }
        }
        error
    }

    /// Terminate after best-effort logging; the scheduler does not
    /// attempt to continue past a broken invariant
    pub(crate) fn fatal_error(&self, error: EmError, escope: u32) -> ! {
        log::error!(
            "EM FATAL error {error} (code {:#010x}), escope {escope:#010x}",
            crate::error::error_set_fatal(error.code())
        );
        std::process::abort();
    }

    pub(crate) fn bump_config_gen(&self) {
        self.config_gen.fetch_add(1, Ordering::Release);
    }

    /// Propagate a lifecycle phase to every core and arm the completion
    /// group; the done event lands on the shared internal queue
    pub(crate) fn eo_local_func_call(
        &self,
        eo: EoId,
        op: LocalOp,
        notif: Option<(Event, QueueId)>,
    ) -> EmResult<()> {
        let cores = self.conf.core_count;

        let cleanup_notif = |notif: Option<(Event, QueueId)>| {
            if let Some((ev, _)) = notif {
                self.free(ev);
            }
        };

        let group = match self.event_group_create() {
            Ok(g) => g,
            Err(e) => {
                cleanup_notif(notif);
                return Err(self.report_error(e, escope::EO_LOCAL_FUNC_CALL_REQ));
            }
        };

        // Allocate everything up front so a shortage cannot strand a
        // half-armed group
        let mut done = match self.alloc(CTRL_MSG_LEN, EVENT_TYPE_INTERNAL, PoolId::DEFAULT) {
            Ok(ev) => ev,
            Err(e) => {
                let _ = self.event_group_delete(group);
                cleanup_notif(notif);
                return Err(self.report_error(e, escope::EO_LOCAL_FUNC_CALL_REQ));
            }
        };
        let mut locals = Vec::with_capacity(cores);
        for _ in 0..cores {
            match self.alloc(CTRL_MSG_LEN, EVENT_TYPE_INTERNAL, PoolId::DEFAULT) {
                Ok(ev) => locals.push(ev),
                Err(e) => {
                    for ev in locals {
                        self.free(ev);
                    }
                    self.free(done);
                    let _ = self.event_group_delete(group);
                    cleanup_notif(notif);
                    return Err(self.report_error(e, escope::EO_LOCAL_FUNC_CALL_REQ));
                }
            }
        }

        let (notif_event, notif_queue) = match notif {
            Some((ev, q)) => (ev.into_raw(), q.as_u32()),
            None => (u32::MAX, QueueId::UNDEF.as_u32()),
        };
        let (local_op, done_op) = match op {
            LocalOp::Start => (OP_START_LOCAL, OP_DONE_START),
            LocalOp::Stop => (OP_STOP_LOCAL, OP_DONE_STOP),
        };

        CtrlMsg {
            op: done_op,
            eo: eo.as_u32(),
            group: group.as_u32(),
            notif_event,
            notif_queue,
        }
        .encode(self.payload_mut(&mut done));

        if let Err(e) = self.event_group_apply(
            group,
            cores as i64,
            done,
            QueueId::new(SHARED_INTERNAL_QUEUE),
        ) {
            for ev in locals {
                self.free(ev);
            }
            self.free(e.event);
            let _ = self.event_group_delete(group);
            if notif_event != u32::MAX {
                self.free(Event::from_raw(notif_event));
            }
            return Err(e.error);
        }

        for (core, mut ev) in locals.into_iter().enumerate() {
            CtrlMsg {
                op: local_op,
                eo: eo.as_u32(),
                group: group.as_u32(),
                notif_event: u32::MAX,
                notif_queue: QueueId::UNDEF.as_u32(),
            }
            .encode(self.payload_mut(&mut ev));

            let dst = QueueId::new(EmConfig::internal_queue(core));
            if let Err(err) = self.send_group(ev, dst, group) {
                // Keep the countdown consistent: account the lost request
                // as completed
                log::warn!("local func call to core {core} failed: {}", err.error);
                self.free(err.event);
                self.event_group_complete(group);
            }
        }
        Ok(())
    }

    /// Done-callback tail: forward the user notification and retire the
    /// completion group
    fn local_done(&self, msg: CtrlMsg, escope: u32) {
        if let Err(e) = self.event_group_delete(EventGroupId::new(msg.group)) {
            log::warn!("completion group {} delete failed: {e}", msg.group);
        }
        if msg.notif_event != u32::MAX {
            let notif = Event::from_raw(msg.notif_event);
            let dst = QueueId::new(msg.notif_queue);
            if let Err(err) = self.send(notif, dst) {
                self.report_error(err.error, escope);
                self.free(err.event);
            }
        }
    }

    /// Install an internal queue directly in `Ready`, bypassing the
    /// bind/enable machinery (no EO element backs the control handler)
    fn internal_queue_setup(&self, qid: u32, owner_core: u32, recv: Arc<dyn ExecutionObject>) {
        use crate::types::{Priority, QueueType};

        let elem = &self.queues[qid as usize];
        let reserved = elem.reserve_for_init();
        debug_assert!(reserved, "internal queue id {qid} already taken");
        self.queue_init(
            elem,
            "internal",
            QueueType::Atomic,
            Priority::LOWEST,
            crate::config::QUEUE_GROUP_DEFAULT,
            owner_core,
        );
        elem.ctl.write().recv = Some(recv);
        elem.set_ready();
        debug_assert_eq!(elem.status(), QueueStatus::Ready);
    }
}

// One core mask word must cover every configurable core
const _: () = assert!(MAX_CORES <= 64);
