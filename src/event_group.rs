// src/event_group.rs
//! Event groups: fan-in countdown with a completion notification
//!
//! An armed group counts down once per completed receive call of a tagged
//! event. When the count reaches zero the recorded notification event is
//! enqueued into its notification queue, exactly once, and the group
//! disarms.

use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use spin::Mutex;

use crate::error::{EmError, EmResult, escope};
use crate::event::Event;
use crate::machine::EventMachine;
use crate::queue::SendError;
use crate::types::{EventGroupId, QueueId};

pub(crate) struct EventGroupElement {
    /// Remaining tagged completions before the notification fires
    count: AtomicI64,
    armed: AtomicBool,
    allocated: AtomicBool,
    /// Notification event slot and destination, present while armed
    notif: Mutex<Option<(u32, QueueId)>>,
}

impl EventGroupElement {
    pub fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            armed: AtomicBool::new(false),
            allocated: AtomicBool::new(false),
            notif: Mutex::new(None),
        }
    }
}

impl EventMachine {
    /// Allocate an event group
    pub fn event_group_create(&self) -> EmResult<EventGroupId> {
        match self.egroup_free.dequeue() {
            Some(id) => {
                self.groups[id as usize].allocated.store(true, Ordering::Release);
                Ok(EventGroupId::new(id))
            }
            None => Err(self.report_error(EmError::AllocFailed, escope::EVENT_GROUP_CREATE)),
        }
    }

    /// Delete an unarmed event group
    pub fn event_group_delete(&self, group: EventGroupId) -> EmResult<()> {
        let Some(elem) = self.event_group_elem(group) else {
            return Err(self.report_error(EmError::BadId, escope::EVENT_GROUP_DELETE));
        };
        if elem.armed.load(Ordering::Acquire) {
            return Err(self.report_error(EmError::BadState, escope::EVENT_GROUP_DELETE));
        }
        elem.allocated.store(false, Ordering::Release);
        // Cannot fail: every group id is in circulation exactly once
        let _ = self.egroup_free.enqueue(group.as_u32());
        Ok(())
    }

    /// Arm a group: after `count` tagged completions, enqueue
    /// `notif_event` into `notif_queue`
    ///
    /// On failure the notification event is handed back to the caller.
    pub fn event_group_apply(
        &self,
        group: EventGroupId,
        count: i64,
        notif_event: Event,
        notif_queue: QueueId,
    ) -> Result<(), SendError> {
        let fail = |e: EmError, ev: Event| SendError {
            error: self.report_error(e, escope::EVENT_GROUP_APPLY),
            escope: escope::EVENT_GROUP_APPLY,
            event: ev,
        };

        let Some(elem) = self.event_group_elem(group) else {
            return Err(fail(EmError::BadId, notif_event));
        };
        if count <= 0 {
            return Err(fail(EmError::TooLarge, notif_event));
        }
        if self.queue_elem(notif_queue).is_none() {
            return Err(fail(EmError::BadId, notif_event));
        }
        // Arming an already-armed group is an error
        if elem
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(fail(EmError::BadState, notif_event));
        }

        *elem.notif.lock() = Some((notif_event.into_raw(), notif_queue));
        elem.count.store(count, Ordering::Release);
        Ok(())
    }

    /// Add `count` to the remaining completions of an armed group
    pub fn event_group_increment(&self, group: EventGroupId, count: i64) -> EmResult<()> {
        let Some(elem) = self.event_group_elem(group) else {
            return Err(self.report_error(EmError::BadId, escope::EVENT_GROUP_INCREMENT));
        };
        if count <= 0 {
            return Err(self.report_error(EmError::TooLarge, escope::EVENT_GROUP_INCREMENT));
        }
        if !elem.armed.load(Ordering::Acquire) {
            return Err(self.report_error(EmError::BadState, escope::EVENT_GROUP_INCREMENT));
        }
        elem.count.fetch_add(count, Ordering::AcqRel);
        Ok(())
    }

    /// Event group of the receive call in progress on this core
    #[must_use]
    pub fn current_event_group(&self) -> Option<EventGroupId> {
        let core = crate::core_local::current_core()?;
        let cl = self.core_locals.get(core)?;
        let gid = cl.current_group.load(Ordering::Relaxed);
        (gid != EventGroupId::UNDEF.as_u32()).then(|| EventGroupId::new(gid))
    }

    /// Count down one tagged completion; fires the notification at zero
    pub(crate) fn event_group_complete(&self, group: EventGroupId) {
        let Some(elem) = self.event_group_elem(group) else {
            return;
        };
        let prev = elem.count.fetch_sub(1, Ordering::AcqRel);
        if prev != 1 {
            return;
        }

        // Last completion: fire the notification and disarm
        let taken = elem.notif.lock().take();
        let Some((notif_idx, notif_queue)) = taken else {
            return;
        };
        elem.armed.store(false, Ordering::Release);
        if let Err(err) = self.send_to_queue(notif_idx, notif_queue) {
            log::warn!(
                "event-group {} notification to {notif_queue} failed: {err}",
                group.as_u32()
            );
            self.pool.free(notif_idx);
        }
    }

    fn event_group_elem(&self, group: EventGroupId) -> Option<&EventGroupElement> {
        let idx = group.as_u32() as usize;
        let elem = self.groups.get(idx)?;
        elem.allocated.load(Ordering::Acquire).then_some(elem)
    }
}
