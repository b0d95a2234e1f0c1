// src/worker.rs
//! Worker threads: one pinned busy-polling dispatcher per core
//!
//! Hosted convenience around the dispatch loop. Pinning is best effort;
//! correctness never depends on it, only the cache-isolation properties
//! the core was designed around.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::machine::EventMachine;

/// Join handles of a launched worker set
pub struct WorkerHandles {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerHandles {
    /// Wait for every worker to return (after
    /// [`EventMachine::shutdown`])
    pub fn join(self) {
        for h in self.handles {
            if let Err(e) = h.join() {
                log::error!("worker thread panicked: {e:?}");
            }
        }
    }
}

/// Spawn `core_count` worker threads, each running `init_local` and then
/// the dispatch loop until shutdown
pub fn spawn_workers(em: &Arc<EventMachine>) -> WorkerHandles {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    let handles = (0..em.config().core_count)
        .map(|core| {
            let em = Arc::clone(em);
            let pin = core_ids.get(core).copied();
            std::thread::Builder::new()
                .name(format!("em-core-{core}"))
                .spawn(move || {
                    match pin {
                        Some(id) if core_affinity::set_for_current(id) => {}
                        _ => log::warn!("core {core}: pinning unavailable"),
                    }
                    if let Err(e) = em.init_local(core) {
                        log::error!("core {core}: init_local failed: {e}");
                        return;
                    }
                    em.dispatch_loop();
                })
                .expect("spawning a worker thread")
        })
        .collect();
    WorkerHandles { handles }
}
