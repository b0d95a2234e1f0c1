// src/eo.rs
//! Execution Objects: application handlers and their lifecycle
//!
//! An EO owns a receive callback plus lifecycle hooks. `start`/`stop` run
//! once on the calling core; `start_local`/`stop_local` run on every
//! configured core, propagated through the internal control queues and
//! completed by an internal event group (see the machine module).

use std::sync::Arc;

use spin::RwLock;

use crate::config::EO_NAME_LEN;
use crate::error::{EmError, EmResult, escope};
use crate::event::Event;
use crate::machine::{EventMachine, LocalOp};
use crate::queue_group::truncate_name;
use crate::types::{EoId, EventType, QueueId};

/// Application handler attached to queues
///
/// The receive call owns the event: it must `send` it onward or `free`
/// it. Receive must not block indefinitely; yielding is achieved by
/// returning.
pub trait ExecutionObject: Send + Sync {
    /// Deliver one event from a bound queue
    fn receive(&self, em: &EventMachine, event: Event, event_type: EventType, queue: QueueId);

    /// Global start, run once on the calling core
    fn start(&self, em: &EventMachine, eo: EoId) -> EmResult<()> {
        let _ = (em, eo);
        Ok(())
    }

    /// Per-core start, run on every configured core
    fn start_local(&self, em: &EventMachine, eo: EoId, core: usize) -> EmResult<()> {
        let _ = (em, eo, core);
        Ok(())
    }

    /// Global stop, run once after every core acknowledged `stop_local`
    fn stop(&self, em: &EventMachine, eo: EoId) -> EmResult<()> {
        let _ = (em, eo);
        Ok(())
    }

    /// Per-core stop, run on every configured core
    fn stop_local(&self, em: &EventMachine, eo: EoId, core: usize) -> EmResult<()> {
        let _ = (em, eo, core);
        Ok(())
    }

    /// Called when an error is reported while this EO is in context
    fn error_handler(&self, eo: EoId, error: EmError, escope: u32) {
        let _ = (eo, error, escope);
    }
}

pub(crate) struct EoCtl {
    pub name: String,
    pub obj: Option<Arc<dyn ExecutionObject>>,
    /// Child queues bound to this EO
    pub queues: Vec<QueueId>,
    pub active: bool,
    pub allocated: bool,
}

/// One EO table slot
pub(crate) struct EoElement {
    pub ctl: RwLock<EoCtl>,
}

impl EoElement {
    pub fn new() -> Self {
        Self {
            ctl: RwLock::new(EoCtl {
                name: String::new(),
                obj: None,
                queues: Vec::new(),
                active: false,
                allocated: false,
            }),
        }
    }
}

impl EventMachine {
    /// Create an EO around an application handler
    pub fn eo_create(&self, name: &str, obj: Arc<dyn ExecutionObject>) -> EmResult<EoId> {
        let Some(id) = self.eo_free.dequeue() else {
            return Err(self.report_error(EmError::AllocFailed, escope::EO_ALLOC));
        };
        let mut ctl = self.eos[id as usize].ctl.write();
        ctl.name = truncate_name(name, EO_NAME_LEN);
        ctl.obj = Some(obj);
        ctl.queues.clear();
        ctl.active = false;
        ctl.allocated = true;
        drop(ctl);

        log::debug!("EO {id} '{name}' created");
        Ok(EoId::new(id))
    }

    /// Delete an inactive EO with no bound queues
    pub fn eo_delete(&self, eo: EoId) -> EmResult<()> {
        let Some(elem) = self.eos.get(eo.as_u32() as usize) else {
            return Err(self.report_error(EmError::BadId, escope::EO_ALLOC));
        };
        let mut ctl = elem.ctl.write();
        if !ctl.allocated {
            return Err(self.report_error(EmError::BadId, escope::EO_ALLOC));
        }
        if ctl.active || !ctl.queues.is_empty() {
            return Err(self.report_error(EmError::BadState, escope::EO_ALLOC));
        }
        ctl.obj = None;
        ctl.allocated = false;
        drop(ctl);

        // Cannot fail: every EO id is in circulation exactly once
        let _ = self.eo_free.enqueue(eo.as_u32());
        Ok(())
    }

    /// Bind a queue to this EO (`queue` must be in `Init`)
    pub fn eo_add_queue(&self, eo: EoId, queue: QueueId) -> EmResult<()> {
        self.queue_bind(queue, eo)
    }

    /// Detach a disabled queue from this EO
    pub fn eo_remove_queue(&self, eo: EoId, queue: QueueId) -> EmResult<()> {
        let Some(elem) = self.queue_elem(queue) else {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_STATE_CHANGE));
        };
        if elem.ctl.read().eo != eo {
            return Err(self.report_error(EmError::BadState, escope::QUEUE_STATE_CHANGE));
        }
        self.queue_unbind(queue)
    }

    /// Start an EO
    ///
    /// Runs the global `start` on the calling core, then propagates
    /// `start_local` to every configured core through the internal
    /// control queues. `notif`, if given, is enqueued into its queue once
    /// every core has acknowledged; on error it is freed.
    pub fn eo_start(&self, eo: EoId, notif: Option<(Event, QueueId)>) -> EmResult<()> {
        let Some(obj) = self.eo_object(eo) else {
            self.free_notif(notif);
            return Err(self.report_error(EmError::BadId, escope::EO_ALLOC));
        };
        if self.eos[eo.as_u32() as usize].ctl.read().active {
            self.free_notif(notif);
            return Err(self.report_error(EmError::BadState, escope::EO_ALLOC));
        }

        if let Err(e) = obj.start(self, eo) {
            self.free_notif(notif);
            return Err(self.report_error(e, escope::EO_ALLOC));
        }
        self.eos[eo.as_u32() as usize].ctl.write().active = true;

        self.eo_local_func_call(eo, LocalOp::Start, notif)
    }

    /// Stop an EO
    ///
    /// Disables all child queues, then propagates `stop_local` to every
    /// configured core. The global `stop` runs on the core that observes
    /// the last acknowledgement; completion is signalled through `notif`.
    pub fn eo_stop(&self, eo: EoId, notif: Option<(Event, QueueId)>) -> EmResult<()> {
        if self.eo_object(eo).is_none() {
            self.free_notif(notif);
            return Err(self.report_error(EmError::BadId, escope::EO_ALLOC));
        }
        if !self.eos[eo.as_u32() as usize].ctl.read().active {
            self.free_notif(notif);
            return Err(self.report_error(EmError::BadState, escope::EO_ALLOC));
        }

        // Drain: take every child queue out of scheduling first. A queue
        // racing out of Ready is already where disable would put it.
        let queues: Vec<QueueId> = self.eos[eo.as_u32() as usize].ctl.read().queues.clone();
        for q in queues {
            if self.queue_status(q) == crate::queue::QueueStatus::Ready {
                let _ = self.queue_disable(q);
            }
        }

        self.eo_local_func_call(eo, LocalOp::Stop, notif)
    }

    /// EO name
    pub fn eo_name(&self, eo: EoId) -> EmResult<String> {
        let elem = self.eos.get(eo.as_u32() as usize).ok_or(EmError::BadId)?;
        let ctl = elem.ctl.read();
        if !ctl.allocated {
            return Err(EmError::BadId);
        }
        Ok(ctl.name.clone())
    }

    /// Whether the EO has been started
    #[must_use]
    pub fn eo_is_active(&self, eo: EoId) -> bool {
        self.eos
            .get(eo.as_u32() as usize)
            .is_some_and(|e| e.ctl.read().active)
    }

    /// Queues currently bound to the EO
    pub fn eo_queues(&self, eo: EoId) -> EmResult<Vec<QueueId>> {
        let elem = self.eos.get(eo.as_u32() as usize).ok_or(EmError::BadId)?;
        let ctl = elem.ctl.read();
        if !ctl.allocated {
            return Err(EmError::BadId);
        }
        Ok(ctl.queues.clone())
    }

    pub(crate) fn eo_object(&self, eo: EoId) -> Option<Arc<dyn ExecutionObject>> {
        let elem = self.eos.get(eo.as_u32() as usize)?;
        let ctl = elem.ctl.read();
        if !ctl.allocated {
            return None;
        }
        ctl.obj.clone()
    }

    pub(crate) fn eo_link_queue(&self, eo: EoId, queue: QueueId) {
        let mut ctl = self.eos[eo.as_u32() as usize].ctl.write();
        if !ctl.queues.contains(&queue) {
            ctl.queues.push(queue);
        }
    }

    pub(crate) fn eo_unlink_queue(&self, eo: EoId, queue: QueueId) {
        if let Some(elem) = self.eos.get(eo.as_u32() as usize) {
            elem.ctl.write().queues.retain(|&q| q != queue);
        }
    }

    pub(crate) fn eo_set_active(&self, eo: EoId, active: bool) {
        if let Some(elem) = self.eos.get(eo.as_u32() as usize) {
            elem.ctl.write().active = active;
        }
    }

    fn free_notif(&self, notif: Option<(Event, QueueId)>) {
        if let Some((ev, _)) = notif {
            self.free(ev);
        }
    }
}
