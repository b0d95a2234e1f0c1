// src/config.rs
//! Compile-time limits and runtime configuration
//!
//! The queue-id space is laid out in three fixed regions:
//!
//! ```text
//! [0, 255]                     static queues (explicit id at create)
//! [256, 256 + MAX_CORES]       internal queues (one per core + shared)
//! [FIRST_DYN_QUEUE, max)       dynamic queues, split over 32 free pools
//! ```
//!
//! The layout depends only on compile-time limits, never on the runtime
//! core count, so queue ids are stable across configurations.

use crate::types::QueueGroupId;

/// Maximum number of worker cores
pub const MAX_CORES: usize = 64;

// Keep smaller than or equal to 64 to fit in a u64 core mask
const _: () = assert!(MAX_CORES <= 64);

/// Maximum number of queue groups
pub const MAX_QUEUE_GROUPS: usize = 64;

/// The default queue group: all configured cores
pub const QUEUE_GROUP_DEFAULT: QueueGroupId = QueueGroupId::new(MAX_QUEUE_GROUPS as u32 - 1);

/// Lowest static queue id
pub const QUEUE_STATIC_MIN: u32 = 0;

/// Highest static queue id
pub const QUEUE_STATIC_MAX: u32 = 0xFF;

/// First internal queue id (one queue per core, then one shared)
pub const FIRST_INTERNAL_QUEUE: u32 = QUEUE_STATIC_MAX + 1;

/// Number of internal queues
pub const INTERNAL_QUEUES: u32 = MAX_CORES as u32 + 1;

/// Last internal queue id; this one is the shared internal queue
pub const SHARED_INTERNAL_QUEUE: u32 = FIRST_INTERNAL_QUEUE + INTERNAL_QUEUES - 1;

/// First dynamic queue id, kept divisible by 32
pub const FIRST_DYN_QUEUE: u32 = (SHARED_INTERNAL_QUEUE + 1).next_multiple_of(32);

/// Number of free-id pools the dynamic region is split over
pub const DYN_QUEUE_POOLS: usize = 32;

const _: () = assert!(FIRST_DYN_QUEUE > SHARED_INTERNAL_QUEUE);
const _: () = assert!(FIRST_DYN_QUEUE % DYN_QUEUE_POOLS as u32 == 0);

/// Ring capacity of atomic and parallel event queues
pub const ATOMIC_RING_SIZE: usize = 4 * 1024;

/// Ring capacity of the parallel-ordered order queue
pub const PARALLEL_ORD_RING_SIZE: usize = 1024;

const _: () = assert!(ATOMIC_RING_SIZE.is_power_of_two());
const _: () = assert!(PARALLEL_ORD_RING_SIZE.is_power_of_two());

/// Maximum queue name length; longer names are truncated
pub const QUEUE_NAME_LEN: usize = 32;

/// Maximum EO name length; longer names are truncated
pub const EO_NAME_LEN: usize = 32;

/// Maximum queue-group name length; longer names are truncated
pub const QUEUE_GROUP_NAME_LEN: usize = 8;

/// Runtime configuration handed to [`crate::EventMachine::init_global`]
///
/// All table sizes are fixed at init; there is no dynamic growth. The
/// scheduler's hot path assumes stable table addresses.
#[derive(Debug, Clone)]
pub struct EmConfig {
    /// Number of worker cores, `1..=MAX_CORES`
    pub core_count: usize,
    /// Size of the queue table; must leave room for at least one full
    /// dynamic pool above [`FIRST_DYN_QUEUE`]
    pub max_queues: usize,
    /// Size of the EO table
    pub max_eos: usize,
    /// Size of the event-group table
    pub max_event_groups: usize,
    /// Number of events in the default pool
    pub pool_events: usize,
    /// Maximum event payload size in bytes
    pub max_event_size: usize,
    /// Events dequeued per scheduling decision
    pub sched_burst: usize,
    /// Issue a `spin_loop` hint when a dispatch iteration finds no work.
    /// The dispatch loop stays busy-polling either way.
    pub idle_pause: bool,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            core_count: 1,
            max_queues: 1024,
            max_eos: 128,
            max_event_groups: 64,
            pool_events: 4096,
            max_event_size: 2048,
            sched_burst: 32,
            idle_pause: true,
        }
    }
}

impl EmConfig {
    /// Number of dynamic queue ids per pool (remainder ids are unused)
    #[must_use]
    pub(crate) fn dyn_queues_per_pool(&self) -> usize {
        (self.max_queues - FIRST_DYN_QUEUE as usize) / DYN_QUEUE_POOLS
    }

    /// Internal queue id owned by `core`
    #[must_use]
    pub(crate) fn internal_queue(core: usize) -> u32 {
        FIRST_INTERNAL_QUEUE + core as u32
    }

    pub(crate) fn validate(&self) -> bool {
        self.core_count >= 1
            && self.core_count <= MAX_CORES
            && self.max_queues > FIRST_DYN_QUEUE as usize + DYN_QUEUE_POOLS
            && self.max_eos >= 1
            && self.max_event_groups >= 1
            && self.pool_events >= 2
            // Internal control messages must fit in any pool
            && self.max_event_size >= 32
            && self.sched_burst >= 1
            && self.sched_burst <= crate::sched::SCHED_BURST_MAX
    }
}
