// tests/lifecycle.rs
//! Object lifecycle: queue state machine, EO start/stop, groups

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use event_machine::{
    EmConfig, EmError, Event, EventMachine, EventType, ExecutionObject, PoolId, Priority,
    QUEUE_GROUP_DEFAULT, QueueId, QueueStatus, QueueType,
};

/// EO that frees everything it receives and counts deliveries
struct Sink {
    received: AtomicUsize,
}

impl Sink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: AtomicUsize::new(0),
        })
    }
}

impl ExecutionObject for Sink {
    fn receive(&self, em: &EventMachine, event: Event, _t: EventType, _q: QueueId) {
        self.received.fetch_add(1, Ordering::SeqCst);
        em.free(event);
    }
}

/// EO counting its local lifecycle callbacks
struct Lifecycled {
    start_locals: AtomicUsize,
    stop_locals: AtomicUsize,
    stops: AtomicUsize,
}

impl Lifecycled {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            start_locals: AtomicUsize::new(0),
            stop_locals: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }
}

impl ExecutionObject for Lifecycled {
    fn receive(&self, em: &EventMachine, event: Event, _t: EventType, _q: QueueId) {
        em.free(event);
    }

    fn start_local(&self, _em: &EventMachine, _eo: event_machine::EoId, _core: usize) -> Result<(), EmError> {
        self.start_locals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_local(&self, _em: &EventMachine, _eo: event_machine::EoId, _core: usize) -> Result<(), EmError> {
        self.stop_locals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, _em: &EventMachine, _eo: event_machine::EoId) -> Result<(), EmError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn single_core_em() -> Arc<EventMachine> {
    let em = EventMachine::init_global(EmConfig::default()).expect("init_global");
    em.init_local(0).expect("init_local");
    em
}

/// Pump the dispatcher until `pred` holds or the deadline passes
fn pump_until(em: &EventMachine, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        em.dispatch_once();
        assert!(Instant::now() < deadline, "dispatch made no progress");
    }
}

#[test]
fn queue_state_machine_round_trip() {
    let em = single_core_em();
    let eo = em.eo_create("sink", Sink::new()).unwrap();

    let q = em
        .queue_create("q", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    assert_eq!(em.queue_status(q), QueueStatus::Init);

    em.queue_bind(q, eo).unwrap();
    assert_eq!(em.queue_status(q), QueueStatus::Bound);

    em.queue_enable(q).unwrap();
    assert_eq!(em.queue_status(q), QueueStatus::Ready);

    em.queue_disable(q).unwrap();
    assert_eq!(em.queue_status(q), QueueStatus::Bound);

    em.queue_unbind(q).unwrap();
    assert_eq!(em.queue_status(q), QueueStatus::Init);

    em.queue_delete(q).unwrap();
    assert_eq!(em.queue_status(q), QueueStatus::Invalid);
    assert!(em.eo_queues(eo).unwrap().is_empty());
}

#[test]
fn queue_transitions_reject_wrong_states() {
    let em = single_core_em();
    let eo = em.eo_create("sink", Sink::new()).unwrap();
    let q = em
        .queue_create("q", QueueType::Parallel, Priority::LOW, QUEUE_GROUP_DEFAULT, None)
        .unwrap();

    // enable before bind
    assert_eq!(em.queue_enable(q), Err(EmError::BadState));
    // unbind before bind
    assert_eq!(em.queue_unbind(q), Err(EmError::BadState));

    em.queue_bind(q, eo).unwrap();
    // double bind
    assert_eq!(em.queue_bind(q, eo), Err(EmError::BadState));
    // disable before enable
    assert_eq!(em.queue_disable(q), Err(EmError::BadState));

    em.queue_enable(q).unwrap();
    em.queue_disable(q).unwrap();
    em.queue_unbind(q).unwrap();
    em.queue_delete(q).unwrap();
    // delete of a deleted queue
    assert_eq!(em.queue_delete(q), Err(EmError::BadState));
}

#[test]
fn static_queue_ids() {
    let em = single_core_em();

    let q = em
        .queue_create(
            "static7",
            QueueType::Atomic,
            Priority::HIGH,
            QUEUE_GROUP_DEFAULT,
            Some(QueueId::new(7)),
        )
        .unwrap();
    assert_eq!(q, QueueId::new(7));

    // The id is now reserved
    assert_eq!(
        em.queue_create(
            "dup",
            QueueType::Atomic,
            Priority::HIGH,
            QUEUE_GROUP_DEFAULT,
            Some(QueueId::new(7)),
        ),
        Err(EmError::NotFree)
    );

    // Out of the static range
    assert_eq!(
        em.queue_create(
            "bad",
            QueueType::Atomic,
            Priority::HIGH,
            QUEUE_GROUP_DEFAULT,
            Some(QueueId::new(256)),
        ),
        Err(EmError::BadId)
    );

    // Deleting returns the id for reuse
    em.queue_delete(q).unwrap();
    let q2 = em
        .queue_create(
            "again",
            QueueType::Parallel,
            Priority::LOW,
            QUEUE_GROUP_DEFAULT,
            Some(QueueId::new(7)),
        )
        .unwrap();
    assert_eq!(q2, QueueId::new(7));
    em.queue_delete(q2).unwrap();
}

#[test]
fn dynamic_queue_slot_reuse() {
    let em = single_core_em();

    let q1 = em
        .queue_create("d1", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    assert!(q1.as_u32() >= 352, "dynamic ids start above the internal region");
    em.queue_delete(q1).unwrap();

    // The freed id cycles back through its pool
    let mut seen = false;
    for _ in 0..1024 {
        let q = em
            .queue_create("d", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
            .unwrap();
        let hit = q == q1;
        em.queue_delete(q).unwrap();
        if hit {
            seen = true;
            break;
        }
    }
    assert!(seen, "deleted dynamic id never reappeared");
}

#[test]
fn send_requires_ready_queue() {
    let em = single_core_em();
    let eo = em.eo_create("sink", Sink::new()).unwrap();
    let q = em
        .queue_create("q", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    em.queue_bind(q, eo).unwrap();

    let ev = em.alloc(16, EventType::SW, PoolId::DEFAULT).unwrap();
    let err = em.send(ev, q).unwrap_err();
    assert_eq!(err.error, EmError::BadState);
    em.free(err.event);

    em.queue_enable(q).unwrap();
    let ev = em.alloc(16, EventType::SW, PoolId::DEFAULT).unwrap();
    em.send(ev, q).unwrap();
}

#[test]
fn delete_requires_drained_queue() {
    let em = single_core_em();
    let sink = Sink::new();
    let eo = em.eo_create("sink", Arc::clone(&sink) as Arc<dyn ExecutionObject>).unwrap();
    let q = em
        .queue_create("q", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    em.queue_bind(q, eo).unwrap();
    em.queue_enable(q).unwrap();

    let ev = em.alloc(16, EventType::SW, PoolId::DEFAULT).unwrap();
    em.send(ev, q).unwrap();

    assert_eq!(em.queue_delete(q), Err(EmError::NotFree));

    pump_until(&em, || sink.received.load(Ordering::SeqCst) == 1);
    em.queue_delete(q).unwrap();
}

#[test]
fn delivery_observes_source_queue() {
    struct SrcCheck {
        seen: AtomicUsize,
        expect: QueueId,
    }
    impl ExecutionObject for SrcCheck {
        fn receive(&self, em: &EventMachine, event: Event, t: EventType, q: QueueId) {
            assert_eq!(q, self.expect);
            assert_eq!(em.event_source_queue(&event), self.expect);
            assert_eq!(t.major(), EventType::SW);
            assert_eq!(em.payload(&event), b"ping");
            self.seen.fetch_add(1, Ordering::SeqCst);
            em.free(event);
        }
    }

    let em = single_core_em();
    let q = em
        .queue_create("in", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    let obj = Arc::new(SrcCheck {
        seen: AtomicUsize::new(0),
        expect: q,
    });
    let eo = em.eo_create("check", Arc::clone(&obj) as Arc<dyn ExecutionObject>).unwrap();
    em.queue_bind(q, eo).unwrap();
    em.queue_enable(q).unwrap();

    let mut ev = em.alloc(4, EventType::SW, PoolId::DEFAULT).unwrap();
    em.payload_mut(&mut ev).copy_from_slice(b"ping");
    em.send(ev, q).unwrap();

    pump_until(&em, || obj.seen.load(Ordering::SeqCst) == 1);
}

#[test]
fn eo_start_and_stop_propagate_locals() {
    let em = single_core_em();
    let obj = Lifecycled::new();
    let eo = em.eo_create("lc", Arc::clone(&obj) as Arc<dyn ExecutionObject>).unwrap();

    let q = em
        .queue_create("q", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    em.queue_bind(q, eo).unwrap();
    em.queue_enable(q).unwrap();

    // Notification queue observed by a plain sink
    let sink = Sink::new();
    let notif_eo = em.eo_create("notif-sink", Arc::clone(&sink) as Arc<dyn ExecutionObject>).unwrap();
    let notif_q = em
        .queue_create("notif", QueueType::Atomic, Priority::HIGH, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    em.queue_bind(notif_q, notif_eo).unwrap();
    em.queue_enable(notif_q).unwrap();

    let notif = em.alloc(8, EventType::SW, PoolId::DEFAULT).unwrap();
    em.eo_start(eo, Some((notif, notif_q))).unwrap();
    assert!(em.eo_is_active(eo));

    // Start locals run on the (single) core, then the notification lands
    pump_until(&em, || sink.received.load(Ordering::SeqCst) == 1);
    assert_eq!(obj.start_locals.load(Ordering::SeqCst), 1);

    // Double start is a state error
    assert_eq!(em.eo_start(eo, None), Err(EmError::BadState));

    let notif = em.alloc(8, EventType::SW, PoolId::DEFAULT).unwrap();
    em.eo_stop(eo, Some((notif, notif_q))).unwrap();
    // Stop disables child queues immediately
    assert_eq!(em.queue_status(q), QueueStatus::Bound);

    pump_until(&em, || sink.received.load(Ordering::SeqCst) == 2);
    assert_eq!(obj.stop_locals.load(Ordering::SeqCst), 1);
    assert_eq!(obj.stops.load(Ordering::SeqCst), 1);
    assert!(!em.eo_is_active(eo));

    // Fully unwound EO can be deleted
    em.queue_unbind(q).unwrap();
    em.queue_delete(q).unwrap();
    em.eo_delete(eo).unwrap();
}

#[test]
fn eo_delete_rejects_bound_queues() {
    let em = single_core_em();
    let eo = em.eo_create("sink", Sink::new()).unwrap();
    let q = em
        .queue_create("q", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    em.queue_bind(q, eo).unwrap();

    assert_eq!(em.eo_delete(eo), Err(EmError::BadState));
    em.queue_unbind(q).unwrap();
    em.eo_delete(eo).unwrap();
}

#[test]
fn event_group_lifecycle_errors() {
    let em = single_core_em();
    let g = em.event_group_create().unwrap();

    // increment before apply
    assert_eq!(em.event_group_increment(g, 1), Err(EmError::BadState));

    let sink = Sink::new();
    let eo = em.eo_create("sink", Arc::clone(&sink) as Arc<dyn ExecutionObject>).unwrap();
    let q = em
        .queue_create("q", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    em.queue_bind(q, eo).unwrap();
    em.queue_enable(q).unwrap();

    // apply with a non-positive count hands the event back
    let notif = em.alloc(8, EventType::SW, PoolId::DEFAULT).unwrap();
    let err = em.event_group_apply(g, 0, notif, q).unwrap_err();
    assert_eq!(err.error, EmError::TooLarge);
    em.free(err.event);

    let notif = em.alloc(8, EventType::SW, PoolId::DEFAULT).unwrap();
    em.event_group_apply(g, 1, notif, q).unwrap();

    // double apply while armed
    let notif2 = em.alloc(8, EventType::SW, PoolId::DEFAULT).unwrap();
    let err = em.event_group_apply(g, 1, notif2, q).unwrap_err();
    assert_eq!(err.error, EmError::BadState);
    em.free(err.event);

    // armed groups cannot be deleted
    assert_eq!(em.event_group_delete(g), Err(EmError::BadState));

    // complete the group: one tagged event through the queue
    let ev = em.alloc(8, EventType::SW, PoolId::DEFAULT).unwrap();
    em.send_group(ev, q, g).unwrap();
    pump_until(&em, || sink.received.load(Ordering::SeqCst) == 2);

    em.event_group_delete(g).unwrap();
}

#[test]
fn queue_group_create_modify_delete() {
    let em = EventMachine::init_global(EmConfig {
        core_count: 4,
        ..EmConfig::default()
    })
    .unwrap();

    let mask = event_machine::CoreMask::EMPTY.set(1).set(2);
    let g = em.queue_group_create("grp", mask).unwrap();
    assert_eq!(em.queue_group_mask(g).unwrap(), mask);
    assert_eq!(em.queue_group_name(g).unwrap(), "grp");

    // A mask outside the configured cores is over the limit
    assert_eq!(
        em.queue_group_create("bad", event_machine::CoreMask::EMPTY.set(9)),
        Err(EmError::TooLarge)
    );

    let wider = mask.set(3);
    em.queue_group_modify(g, wider).unwrap();
    assert_eq!(em.queue_group_mask(g).unwrap(), wider);

    // Groups with member queues are busy
    let q = em
        .queue_create("member", QueueType::Atomic, Priority::NORMAL, g, None)
        .unwrap();
    assert_eq!(em.queue_group_delete(g), Err(EmError::NotFree));
    em.queue_delete(q).unwrap();
    em.queue_group_delete(g).unwrap();

    // The default group is permanent
    assert_eq!(em.queue_group_delete(QUEUE_GROUP_DEFAULT), Err(EmError::BadId));
}

#[test]
fn alloc_validates_size_and_pool() {
    let em = single_core_em();

    assert_eq!(
        em.alloc(1 << 20, EventType::SW, PoolId::DEFAULT).unwrap_err(),
        EmError::TooLarge
    );
    assert_eq!(
        em.alloc(16, EventType::SW, PoolId::new(3)).unwrap_err(),
        EmError::BadId
    );

    let ev = em.alloc(16, EventType::PACKET, PoolId::DEFAULT).unwrap();
    assert_eq!(em.event_type(&ev).major(), EventType::PACKET);
    em.free(ev);
}

#[test]
fn queue_metadata_and_context() {
    struct Ctx {
        limit: usize,
    }

    let em = single_core_em();
    let q = em
        .queue_create(
            "a-rather-long-queue-name-that-wont-fit-entirely",
            QueueType::ParallelOrdered,
            Priority::HIGH,
            QUEUE_GROUP_DEFAULT,
            None,
        )
        .unwrap();

    let name = em.queue_name(q).unwrap();
    assert_eq!(name.len(), event_machine::QUEUE_NAME_LEN);
    assert!(name.starts_with("a-rather-long"));
    assert_eq!(em.queue_type(q).unwrap(), QueueType::ParallelOrdered);
    assert_eq!(em.queue_priority(q).unwrap(), Priority::HIGH);
    assert_eq!(em.queue_group_of(q).unwrap(), QUEUE_GROUP_DEFAULT);

    em.queue_set_context(q, Arc::new(Ctx { limit: 17 })).unwrap();
    let ctx = em.queue_context(q).unwrap();
    assert_eq!(ctx.downcast_ref::<Ctx>().unwrap().limit, 17);

    em.queue_delete(q).unwrap();
    assert!(em.queue_name(q).is_err());
}

#[test]
fn eo_remove_queue_checks_ownership() {
    let em = single_core_em();
    let eo_a = em.eo_create("a", Sink::new()).unwrap();
    let eo_b = em.eo_create("b", Sink::new()).unwrap();
    let q = em
        .queue_create("q", QueueType::Atomic, Priority::NORMAL, QUEUE_GROUP_DEFAULT, None)
        .unwrap();
    em.eo_add_queue(eo_a, q).unwrap();

    // The queue belongs to A, not B
    assert_eq!(em.eo_remove_queue(eo_b, q), Err(EmError::BadState));
    em.eo_remove_queue(eo_a, q).unwrap();
    assert!(em.eo_queues(eo_a).unwrap().is_empty());
}

#[test]
fn packet_io_port_stamp() {
    let em = single_core_em();
    let mut ev = em.alloc(16, EventType::PACKET, PoolId::DEFAULT).unwrap();
    assert_eq!(em.event_io_port(&ev), None);
    em.event_set_io_port(&mut ev, 3);
    assert_eq!(em.event_io_port(&ev), Some(3));
    em.free(ev);
}

#[test]
fn init_local_rejects_bad_core_and_double_bind() {
    let em = EventMachine::init_global(EmConfig::default()).unwrap();
    assert_eq!(em.init_local(5), Err(EmError::BadId));
    em.init_local(0).unwrap();
    // The same thread cannot register twice (core bit already taken)
    assert_eq!(em.init_local(0), Err(EmError::BadState));
}
