#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use common::{bump, init_tracing};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};
use taskweave::{
    BuildError, Executor, ExecutorConfig, Graph, NodeId, Outcome, Priority, RunError,
};

fn named(graph: &mut Graph, name: &str, work: impl FnMut() + Send + 'static) -> NodeId {
    let id = graph.emplace(work);
    graph.set_name(id, name);
    id
}

#[test]
fn single_worker_dispatches_ready_nodes_by_priority() {
    init_tracing();
    //        A
    //      / | \
    //  B(h) C(l) D(n)
    //      \ | /
    //        E
    let order = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::new(AtomicUsize::new(0));
    let seen_by_e = Arc::new(AtomicUsize::new(usize::MAX));

    let mut graph = Graph::new("priorities");
    let log = |name: &'static str, bumps: bool| {
        let order = order.clone();
        let counter = counter.clone();
        move || {
            order.lock().push(name);
            if bumps {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    };
    let a = named(&mut graph, "A", log("A", false));
    let b = named(&mut graph, "B", log("B", true));
    let c = named(&mut graph, "C", log("C", true));
    let d = named(&mut graph, "D", log("D", true));
    let e = {
        let order = order.clone();
        let counter = counter.clone();
        let seen_by_e = seen_by_e.clone();
        named(&mut graph, "E", move || {
            order.lock().push("E");
            seen_by_e.store(counter.load(Ordering::SeqCst), Ordering::SeqCst);
        })
    };
    graph.set_priority(b, Priority::High);
    graph.set_priority(c, Priority::Low);
    graph.set_priority(d, Priority::Normal);
    graph.precede_all(a, &[b, c, d]).unwrap();
    for mid in [b, c, d] {
        graph.precede(mid, e).unwrap();
    }

    let executor = Executor::with_workers(1).unwrap();
    assert_eq!(executor.run(graph).unwrap().wait(), Ok(Outcome::Completed));
    assert_eq!(*order.lock(), ["A", "B", "D", "C", "E"]);
    assert_eq!(seen_by_e.load(Ordering::SeqCst), 3);
}

#[test]
fn every_node_runs_once_per_pass_after_its_predecessors() {
    init_tracing();
    const LAYERS: usize = 4;
    const WIDTH: usize = 8;
    const PASSES: usize = 5;

    let runs: Arc<Vec<AtomicUsize>> =
        Arc::new((0..LAYERS * WIDTH).map(|_| AtomicUsize::new(0)).collect());
    let mut graph = Graph::new("layers");
    let mut previous: Vec<NodeId> = Vec::new();
    for layer in 0..LAYERS {
        let current: Vec<NodeId> = (0..WIDTH)
            .map(|slot| {
                let me = layer * WIDTH + slot;
                let preds: Vec<usize> = previous.iter().map(|id| id.index()).collect();
                let runs = runs.clone();
                graph.emplace(move || {
                    let pass = runs[me].load(Ordering::SeqCst);
                    for &pred in &preds {
                        assert_eq!(runs[pred].load(Ordering::SeqCst), pass + 1);
                    }
                    runs[me].fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for &from in &previous {
            graph.precede_all(from, &current).unwrap();
        }
        previous = current;
    }

    let executor = Executor::with_workers(4).unwrap();
    let handle = executor.run_n(graph, PASSES).unwrap();
    assert_eq!(handle.wait(), Ok(Outcome::Completed));
    assert_eq!(handle.passes(), PASSES);
    assert!(runs.iter().all(|count| count.load(Ordering::SeqCst) == PASSES));
}

#[test]
fn run_n_accumulates_and_zero_passes_is_a_no_op() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new("counter");
    graph.emplace(bump(&counter));
    let graph = Arc::new(graph);

    let executor = Executor::with_workers(2).unwrap();
    assert_eq!(
        executor.run_n(graph.clone(), 4).unwrap().wait(),
        Ok(Outcome::Completed)
    );
    assert_eq!(counter.load(Ordering::SeqCst), 4);

    let handle = executor.run_n(graph, 0).unwrap();
    assert_eq!(handle.wait(), Ok(Outcome::Completed));
    assert_eq!(handle.passes(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn run_until_checks_the_predicate_before_every_pass() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new("until");
    graph.emplace(bump(&counter));

    let executor = Executor::with_workers(2).unwrap();
    let stop = {
        let counter = counter.clone();
        move || counter.load(Ordering::SeqCst) >= 3
    };
    let handle = executor.run_until(graph, stop).unwrap();
    assert_eq!(handle.wait(), Ok(Outcome::Completed));
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(handle.passes(), 3);
}

#[test]
fn panicking_predicate_fails_the_run() {
    init_tracing();
    let executor = Executor::with_workers(1).unwrap();
    let mut graph = Graph::new("g");
    graph.emplace(|| {});
    let handle = executor
        .run_until(graph, || -> bool { panic!("bad predicate") })
        .unwrap();
    assert_eq!(
        handle.wait(),
        Err(RunError::PredicatePanicked {
            message: "bad predicate".into()
        })
    );
}

#[test]
fn empty_graph_completes() {
    let executor = Executor::with_workers(1).unwrap();
    let handle = executor.run(Graph::new("empty")).unwrap();
    assert_eq!(handle.wait(), Ok(Outcome::Completed));
    assert_eq!(handle.passes(), 1);
}

#[test]
fn panic_is_reported_and_later_nodes_skip_their_work() {
    init_tracing();
    let after = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new("failing");
    let a = named(&mut graph, "a", || {});
    let b = named(&mut graph, "b", || panic!("boom"));
    let c = named(&mut graph, "c", bump(&after));
    graph.precede(a, b).unwrap();
    graph.precede(b, c).unwrap();

    let executor = Executor::with_workers(2).unwrap();
    let handle = executor.run_n(graph, 3).unwrap();
    assert_eq!(
        handle.wait(),
        Err(RunError::TaskPanicked {
            task: "b".into(),
            message: "boom".into()
        })
    );
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert_eq!(handle.passes(), 1);
}

#[test]
fn without_halting_successors_of_a_panic_still_run() {
    init_tracing();
    let after = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new("failing");
    let b = named(&mut graph, "b", || panic!("boom"));
    let c = named(&mut graph, "c", bump(&after));
    graph.precede(b, c).unwrap();

    let config = ExecutorConfig {
        halt_on_panic: false,
        ..ExecutorConfig::with_workers(2)
    };
    let executor = Executor::new(config).unwrap();
    let result = executor.run(graph).unwrap().wait();
    assert!(matches!(result, Err(RunError::TaskPanicked { ref task, .. }) if task == "b"));
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_run_still_resolves() {
    init_tracing();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let after = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::new("cancelled");
    let blocker = named(&mut graph, "blocker", move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    let next = named(&mut graph, "next", bump(&after));
    graph.precede(blocker, next).unwrap();

    let executor = Executor::with_workers(2).unwrap();
    let handle = executor.run_n(graph, 10).unwrap();
    started_rx.recv().unwrap();
    assert!(handle.cancel());
    assert!(!handle.cancel());
    release_tx.send(()).unwrap();

    assert_eq!(handle.wait(), Ok(Outcome::Cancelled));
    assert!(handle.is_cancelled());
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert!(!handle.cancel());
}

#[test]
fn panic_after_cancel_keeps_the_run_cancelled() {
    init_tracing();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let mut graph = Graph::new("cancelled then failed");
    named(&mut graph, "blocker", move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        panic!("late failure");
    });

    let executor = Executor::with_workers(1).unwrap();
    let handle = executor.run(graph).unwrap();
    started_rx.recv().unwrap();
    assert!(handle.cancel());
    release_tx.send(()).unwrap();

    assert_eq!(
        handle.wait(),
        Err(RunError::TaskPanicked {
            task: "blocker".into(),
            message: "late failure".into()
        })
    );
    assert!(handle.is_cancelled());
}

#[test]
fn runs_of_one_graph_are_serialized() {
    init_tracing();
    let running = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let total = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::new("shared");
    {
        let running = running.clone();
        let overlapped = overlapped.clone();
        let total = total.clone();
        graph.emplace(move || {
            if running.fetch_add(1, Ordering::SeqCst) != 0 {
                overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
            total.fetch_add(1, Ordering::SeqCst);
        });
    }
    let graph = Arc::new(graph);

    let executor = Executor::with_workers(4).unwrap();
    let handles: Vec<_> = (0..4)
        .map(|_| executor.run(graph.clone()).unwrap())
        .collect();
    for handle in handles {
        assert_eq!(handle.wait(), Ok(Outcome::Completed));
    }
    assert_eq!(total.load(Ordering::SeqCst), 4);
    assert!(!overlapped.load(Ordering::SeqCst));
}

#[test]
fn strong_cycle_is_rejected_before_scheduling() {
    let ran = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new("cyclic");
    let a = named(&mut graph, "a", bump(&ran));
    let b = named(&mut graph, "b", bump(&ran));
    graph.precede(a, b).unwrap();
    graph.precede(b, a).unwrap();

    let executor = Executor::with_workers(1).unwrap();
    let err = executor.run(graph).unwrap_err();
    assert!(matches!(err, BuildError::Cycle { ref graph, .. } if graph == "cyclic"));
    assert_eq!(executor.num_topologies(), 0);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn zero_workers_is_rejected() {
    assert_eq!(
        Executor::with_workers(0).unwrap_err(),
        BuildError::NoWorkers
    );
}

#[test]
fn async_tasks_return_values_and_panics() {
    init_tracing();
    let executor = Executor::with_workers(2).unwrap();
    assert_eq!(executor.run_async(|| 6 * 7).get(), Ok(42));

    let failed = executor.run_async(|| -> u32 { panic!("nope") });
    assert_eq!(
        failed.get(),
        Err(RunError::TaskPanicked {
            task: "#0".into(),
            message: "nope".into()
        })
    );
}

#[test]
fn dropping_the_executor_waits_for_detached_work() {
    init_tracing();
    let done = Arc::new(AtomicUsize::new(0));
    {
        let executor = Executor::with_workers(2).unwrap();
        for _ in 0..8 {
            let done = done.clone();
            executor.spawn_detached(move || {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
    }
    assert_eq!(done.load(Ordering::SeqCst), 8);
}

#[test]
fn wait_for_all_drains_every_submitted_run() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let executor = Executor::with_workers(3).unwrap();
    for name in ["x", "y", "z"] {
        let mut graph = Graph::new(name);
        for _ in 0..10 {
            graph.emplace(bump(&counter));
        }
        drop(executor.run_n(graph, 2).unwrap());
    }
    executor.wait_for_all();
    assert_eq!(executor.num_topologies(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 60);
}

#[test]
fn wait_timeout_gives_up_on_a_slow_run() {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let mut graph = Graph::new("slow");
    graph.emplace(move || {
        release_rx.recv().unwrap();
    });

    let executor = Executor::with_workers(1).unwrap();
    let handle = executor.run(graph).unwrap();
    assert_eq!(handle.wait_timeout(Duration::from_millis(20)), None);
    assert!(!handle.is_finished());
    release_tx.send(()).unwrap();
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(10)),
        Some(Ok(Outcome::Completed))
    );
}
