// src/lib.rs
//! Event Machine core: a run-to-completion, multi-core event dispatcher
//! for data-plane software
//!
//! Applications register Execution Objects (EOs) that consume events from
//! queues; the core schedules those events across a fixed pool of worker
//! cores while enforcing the ordering discipline of each queue:
//!
//! - **Atomic** queues deliver one event at a time, FIFO, never on two
//!   cores at once.
//! - **Parallel** queues deliver fully concurrently with no ordering.
//! - **Parallel-ordered** queues deliver concurrently, but forwards into
//!   downstream queues preserve the source dequeue order.
//!
//! ```no_run
//! use std::sync::Arc;
//! use event_machine::{
//!     EmConfig, Event, EventMachine, EventType, ExecutionObject, Priority,
//!     QueueType, QUEUE_GROUP_DEFAULT,
//! };
//!
//! struct Echo;
//!
//! impl ExecutionObject for Echo {
//!     fn receive(
//!         &self,
//!         em: &EventMachine,
//!         event: Event,
//!         _event_type: EventType,
//!         _queue: event_machine::QueueId,
//!     ) {
//!         em.free(event);
//!     }
//! }
//!
//! let em = EventMachine::init_global(EmConfig {
//!     core_count: 4,
//!     ..EmConfig::default()
//! })
//! .expect("init");
//!
//! let eo = em.eo_create("echo", Arc::new(Echo)).unwrap();
//! let q = em
//!     .queue_create("in", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
//!     .unwrap();
//! em.queue_bind(q, eo).unwrap();
//! em.eo_start(eo, None).unwrap();
//! em.queue_enable(q).unwrap();
//!
//! let workers = event_machine::worker::spawn_workers(&em);
//! let ev = em.alloc(64, EventType::SW, event_machine::PoolId::DEFAULT).unwrap();
//! em.send(ev, q).unwrap();
//! em.shutdown();
//! workers.join();
//! ```

pub mod config;
pub mod error;
pub mod types;
pub mod worker;

mod core_local;
mod eo;
mod event;
mod event_group;
mod machine;
mod queue;
mod queue_group;
mod ring;
mod sched;

pub use config::{
    ATOMIC_RING_SIZE, EO_NAME_LEN, EmConfig, MAX_CORES, MAX_QUEUE_GROUPS,
    PARALLEL_ORD_RING_SIZE, QUEUE_GROUP_DEFAULT, QUEUE_GROUP_NAME_LEN, QUEUE_NAME_LEN,
    QUEUE_STATIC_MAX, QUEUE_STATIC_MIN,
};
pub use core_local::current_core;
pub use eo::ExecutionObject;
pub use error::{EmError, EmResult, ERROR_FATAL_MASK, error_is_fatal, error_set_fatal, escope};
pub use event::Event;
pub use machine::EventMachine;
pub use queue::{QueueStatus, SendError};
pub use types::{
    CoreMask, EoId, EventGroupId, EventType, PoolId, Priority, QueueGroupId, QueueId, QueueType,
};
