// src/queue_group.rs
//! Queue groups: core-affinity masks for queues
//!
//! A queue group maps a group id to a bitmask of cores eligible to
//! dispatch the group's queues. Modifications are serialised by a global
//! lock and bump the config generation; readers are wait-free (a single
//! atomic load of the mask). Each core folds the table into its local
//! eligibility mask at the next safe point, the top of a dispatch
//! iteration.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::config::{MAX_QUEUE_GROUPS, QUEUE_GROUP_DEFAULT, QUEUE_GROUP_NAME_LEN};
use crate::error::{EmError, EmResult, escope};
use crate::machine::EventMachine;
use crate::queue::QueueStatus;
use crate::types::{CoreMask, QueueGroupId};

pub(crate) struct QueueGroupEntry {
    mask: AtomicU64,
    allocated: AtomicBool,
    name: Mutex<String>,
}

impl QueueGroupEntry {
    fn new() -> Self {
        Self {
            mask: AtomicU64::new(0),
            allocated: AtomicBool::new(false),
            name: Mutex::new(String::new()),
        }
    }
}

/// Shared queue-group mask table
pub(crate) struct QueueGroupTable {
    entries: Box<[QueueGroupEntry]>,
    /// Serialises create/modify/delete
    modify_lock: Mutex<()>,
}

impl QueueGroupTable {
    pub fn new() -> Self {
        Self {
            entries: (0..MAX_QUEUE_GROUPS).map(|_| QueueGroupEntry::new()).collect(),
            modify_lock: Mutex::new(()),
        }
    }

    /// Install the default group (all configured cores) at init
    pub fn init_default(&self, cores: usize) {
        let entry = &self.entries[QUEUE_GROUP_DEFAULT.as_u32() as usize];
        entry.mask.store(CoreMask::first_n(cores).bits(), Ordering::Release);
        *entry.name.lock() = "default".to_string();
        entry.allocated.store(true, Ordering::Release);
    }

    pub fn is_allocated(&self, gid: QueueGroupId) -> bool {
        (gid.as_u32() as usize) < MAX_QUEUE_GROUPS
            && self.entries[gid.as_u32() as usize]
                .allocated
                .load(Ordering::Acquire)
    }

    /// Wait-free mask read
    pub fn mask(&self, gid: QueueGroupId) -> CoreMask {
        CoreMask::from_bits(self.entries[gid.as_u32() as usize].mask.load(Ordering::Acquire))
    }

    /// Bit `g` set iff group `g` is allocated and includes `core`
    pub fn eligibility_mask(&self, core: usize) -> u64 {
        let mut out = 0u64;
        for (g, entry) in self.entries.iter().enumerate() {
            if entry.allocated.load(Ordering::Acquire)
                && CoreMask::from_bits(entry.mask.load(Ordering::Acquire)).contains(core)
            {
                out |= 1 << g;
            }
        }
        out
    }
}

impl EventMachine {
    /// Create a queue group with the given core mask
    pub fn queue_group_create(&self, name: &str, mask: CoreMask) -> EmResult<QueueGroupId> {
        self.check_group_mask(mask, escope::QUEUE_GROUP_CREATE)?;

        let _guard = self.qgroups.modify_lock.lock();
        let Some(free) = self
            .qgroups
            .entries
            .iter()
            .position(|e| !e.allocated.load(Ordering::Acquire))
        else {
            return Err(self.report_error(EmError::AllocFailed, escope::QUEUE_GROUP_CREATE));
        };

        let entry = &self.qgroups.entries[free];
        entry.mask.store(mask.bits(), Ordering::Release);
        *entry.name.lock() = truncate_name(name, QUEUE_GROUP_NAME_LEN);
        entry.allocated.store(true, Ordering::Release);
        drop(_guard);

        self.bump_config_gen();
        log::debug!("queue group {free} '{name}' created, mask {mask}");
        Ok(QueueGroupId::new(free as u32))
    }

    /// Replace the core mask of an existing group
    pub fn queue_group_modify(&self, group: QueueGroupId, mask: CoreMask) -> EmResult<()> {
        self.check_group_mask(mask, escope::QUEUE_GROUP_MODIFY)?;
        if !self.qgroups.is_allocated(group) {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_GROUP_MODIFY));
        }

        let _guard = self.qgroups.modify_lock.lock();
        self.qgroups.entries[group.as_u32() as usize]
            .mask
            .store(mask.bits(), Ordering::Release);
        drop(_guard);

        self.bump_config_gen();
        log::debug!("queue group {} mask set to {mask}", group.as_u32());
        Ok(())
    }

    /// Delete a queue group with no member queues
    pub fn queue_group_delete(&self, group: QueueGroupId) -> EmResult<()> {
        if group == QUEUE_GROUP_DEFAULT {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_GROUP_DELETE));
        }
        if !self.qgroups.is_allocated(group) {
            return Err(self.report_error(EmError::BadId, escope::QUEUE_GROUP_DELETE));
        }

        let _guard = self.qgroups.modify_lock.lock();
        // A group with live member queues cannot go away
        for elem in self.queues.iter() {
            if elem.status() != QueueStatus::Invalid && elem.ctl.read().group == group {
                return Err(self.report_error(EmError::NotFree, escope::QUEUE_GROUP_DELETE));
            }
        }
        let entry = &self.qgroups.entries[group.as_u32() as usize];
        entry.allocated.store(false, Ordering::Release);
        entry.mask.store(0, Ordering::Release);
        drop(_guard);

        self.bump_config_gen();
        Ok(())
    }

    /// Current core mask of a group
    pub fn queue_group_mask(&self, group: QueueGroupId) -> EmResult<CoreMask> {
        if !self.qgroups.is_allocated(group) {
            return Err(EmError::BadId);
        }
        Ok(self.qgroups.mask(group))
    }

    /// Name of a group
    pub fn queue_group_name(&self, group: QueueGroupId) -> EmResult<String> {
        if !self.qgroups.is_allocated(group) {
            return Err(EmError::BadId);
        }
        Ok(self.qgroups.entries[group.as_u32() as usize].name.lock().clone())
    }

    fn check_group_mask(&self, mask: CoreMask, escope: u32) -> EmResult<()> {
        let configured = CoreMask::first_n(self.conf.core_count);
        if mask.is_empty() || mask.bits() & !configured.bits() != 0 {
            return Err(self.report_error(EmError::TooLarge, escope));
        }
        Ok(())
    }
}

/// Truncate a name to `limit` bytes on a char boundary
pub(crate) fn truncate_name(name: &str, limit: usize) -> String {
    if name.len() <= limit {
        name.to_string()
    } else {
        let mut end = limit;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name[..end].to_string()
    }
}
