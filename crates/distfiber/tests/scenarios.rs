//! End-to-end runtime scenarios

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use distfiber::{
    current_id, current_scheduler, in_fiber, init, migrate, park, spawn, yield_now, Builder,
    FiberError, FiberId, Runtime, RuntimeConfig,
};

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    distfiber::init_logging();
}

fn float_work() -> f32 {
    let mut f = 4.0f32;
    for _ in 0..1024 {
        let temp = f;
        f = f * f;
        f /= temp;
    }
    f
}

fn int_work() -> i64 {
    let mut f = 7i64;
    yield_now();
    for _ in 0..1024 {
        let temp = f;
        f = f * f;
        f /= temp;
    }
    f
}

#[test]
fn test_small_stacks_mixed_work() {
    setup();
    let _rt = init(2).unwrap();

    let a = Builder::new().stack_size(10240).spawn(float_work).unwrap();
    let b = Builder::new().stack_size(10240).spawn(int_work).unwrap();
    let c = Builder::new().stack_size(10240).spawn(float_work).unwrap();

    assert_eq!(a.join().unwrap(), 4.0);
    assert_eq!(b.join().unwrap(), 7);
    assert_eq!(c.join().unwrap(), 4.0);
}

#[test]
fn test_nine_fibers_migrate_to_named_scheduler() {
    setup();
    let rt = init(4).unwrap();
    let target = 3;

    let handles: Vec<_> = (0..9u64)
        .map(|i| {
            spawn(move || {
                migrate(target).unwrap();
                assert_eq!(current_scheduler(), Some(target));
                (current_id(), i * i)
            })
            .unwrap()
        })
        .collect();

    let mut ids = HashSet::new();
    let mut sum = 0;
    for h in handles {
        let (id, sq) = h.join().unwrap();
        assert!(ids.insert(id), "fiber {} reported twice", id);
        sum += sq;
    }
    assert_eq!(ids.len(), 9);
    assert_eq!(sum, (0..9u64).map(|i| i * i).sum::<u64>());
    assert_eq!(rt.stats().live_fibers, 0);
}

#[test]
fn test_join_finished_fiber_returns_at_once() {
    setup();
    let _rt = init(2).unwrap();

    let handle = spawn(|| 17).unwrap();
    while !handle.is_finished() {
        yield_now();
    }
    let start = Instant::now();
    assert_eq!(handle.join(), Ok(17));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_panic_surfaces_in_join() {
    setup();
    let rt = init(2).unwrap();

    let handle = Builder::new()
        .name("doomed")
        .spawn(|| -> u32 { panic!("boom") })
        .unwrap();
    assert_eq!(handle.name(), Some("doomed"));
    assert_eq!(handle.join(), Err(FiberError::Panicked("boom".to_string())));

    // The runtime keeps going
    assert_eq!(spawn(|| 5).unwrap().join(), Ok(5));
    assert_eq!(rt.stats().live_fibers, 0);
}

#[test]
fn test_joined_fiber_is_no_longer_live() {
    setup();
    let rt = init(2).unwrap();
    for round in 0..200u32 {
        let handle = Builder::new().affinity(1).pinned(true).spawn(move || round).unwrap();
        assert_eq!(handle.join(), Ok(round));
        assert_eq!(rt.stats().live_fibers, 0, "round {}", round);
    }
}

#[test]
fn test_migrated_fiber_runs_on_target_thread() {
    setup();
    let rt = init(3).unwrap();
    let (sched, name) = spawn(|| {
        migrate(2).unwrap();
        (current_scheduler(), thread::current().name().map(str::to_string))
    })
    .unwrap()
    .join()
    .unwrap();
    assert_eq!(sched, Some(2));
    assert_eq!(name, Some(format!("{}-2", rt.config().thread_name)));
}

#[test]
fn test_pinned_fiber_cannot_migrate() {
    setup();
    let _rt = init(2).unwrap();

    // The root fiber is pinned to its thread
    assert_eq!(migrate(1), Err(FiberError::Pinned));

    let handle = Builder::new()
        .affinity(1)
        .pinned(true)
        .spawn(|| {
            let before = current_scheduler();
            let res = migrate(0);
            yield_now();
            (before, res, current_scheduler())
        })
        .unwrap();
    let (before, res, after) = handle.join().unwrap();
    assert_eq!(before, Some(1));
    assert_eq!(res, Err(FiberError::Pinned));
    assert_eq!(after, Some(1));
}

#[test]
fn test_migrate_out_of_range() {
    setup();
    let _rt = init(2).unwrap();
    let res = spawn(|| migrate(7)).unwrap().join().unwrap();
    assert_eq!(res, Err(FiberError::InvalidScheduler { id: 7, count: 2 }));
}

#[test]
fn test_second_runtime_on_thread_rejected() {
    setup();
    let rt = init(1).unwrap();
    assert!(matches!(init(2), Err(FiberError::AlreadyInitialized)));
    drop(rt);
    // Free again once the first one is gone
    let rt = init(1).unwrap();
    assert_eq!(rt.num_schedulers(), 1);
}

#[test]
fn test_api_outside_runtime() {
    assert!(!in_fiber());
    assert_eq!(current_id(), FiberId::NONE);
    assert_eq!(current_scheduler(), None);
    assert_eq!(distfiber::num_schedulers(), None);
    assert_eq!(spawn(|| ()).unwrap_err(), FiberError::NotInitialized);
    assert_eq!(migrate(0), Err(FiberError::NotInitialized));
    assert_eq!(park(|_| true), Err(FiberError::NotInitialized));
    // No-op
    yield_now();
}

#[test]
fn test_introspection_inside_runtime() {
    setup();
    let _rt = init(3).unwrap();
    assert!(in_fiber());
    assert_eq!(current_id(), FiberId::ROOT);
    assert_eq!(current_scheduler(), Some(0));
    assert_eq!(distfiber::num_schedulers(), Some(3));

    let (id, inside) = spawn(|| (current_id(), in_fiber())).unwrap().join().unwrap();
    assert_ne!(id, FiberId::ROOT);
    assert!(inside);
}

#[test]
fn test_join_from_plain_thread() {
    setup();
    let _rt = init(2).unwrap();
    let handle = Builder::new().affinity(1).spawn(|| 99u8).unwrap();
    let joined = thread::spawn(move || handle.join()).join().unwrap();
    assert_eq!(joined, Ok(99));
}

#[test]
fn test_fibers_spawning_fibers() {
    setup();
    let _rt = init(3).unwrap();
    let total = Arc::new(AtomicUsize::new(0));

    let parents: Vec<_> = (0..4)
        .map(|_| {
            let total = Arc::clone(&total);
            spawn(move || {
                let children: Vec<_> = (0..8)
                    .map(|_| {
                        let total = Arc::clone(&total);
                        spawn(move || {
                            yield_now();
                            total.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap()
                    })
                    .collect();
                for c in children {
                    c.join().unwrap();
                }
            })
            .unwrap()
        })
        .collect();
    for p in parents {
        p.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 32);
}

#[test]
fn test_detached_fibers_finish() {
    setup();
    let rt = init(2).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let done = Arc::clone(&done);
        spawn(move || {
            yield_now();
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
        .detach();
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while done.load(Ordering::SeqCst) < 16 && Instant::now() < deadline {
        yield_now();
    }
    assert_eq!(done.load(Ordering::SeqCst), 16);
    while rt.stats().live_fibers > 0 && Instant::now() < deadline {
        yield_now();
    }
    assert_eq!(rt.stats().live_fibers, 0);
}

#[test]
fn test_woken_after_shutdown_is_cancelled() {
    setup();
    let mut rt = init(1).unwrap();
    let (tx, rx) = mpsc::channel();

    let handle = spawn(move || {
        park(|parker| {
            tx.send(parker).unwrap();
            true
        })
        .unwrap();
        "never"
    })
    .unwrap();

    // Let it run on this thread until it parks
    let parker = loop {
        if let Ok(p) = rx.try_recv() {
            break p;
        }
        yield_now();
    };
    rt.shutdown();
    assert!(!in_fiber());

    parker.unpark();
    drop(rt);
    assert_eq!(handle.join(), Err(FiberError::Cancelled));
}

#[test]
fn test_custom_config_runtime() {
    setup();
    let config = RuntimeConfig::new()
        .threads(2)
        .stack_size(64 * 1024)
        .steal_quota(4)
        .idle_spins(0)
        .park_timeout(Duration::from_micros(200))
        .thread_name("custom");
    let rt = Runtime::new(config).unwrap();
    assert_eq!(rt.config().steal_quota, 4);
    assert_eq!(rt.config().thread_name, "custom");

    let name = Builder::new()
        .affinity(1)
        .pinned(true)
        .spawn(|| thread::current().name().map(str::to_string))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(name.as_deref(), Some("custom-1"));
    rt.block_on(|| ());
}
