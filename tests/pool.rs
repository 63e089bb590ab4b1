//! Integration tests for the worker pool.
//!
//! Most tests use gated jobs: each payload carries a oneshot receiver and the
//! handler does nothing until the test tells it to succeed, fail, or panic.
//! That keeps every scheduling decision under the test's control.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rttp_pool::{
    Lifecycle, Pool, PoolConfig, PoolEvent, PoolStats, RespawnPolicy, TaskErrorKind, TaskId,
};
use tokio::sync::{broadcast, oneshot};

#[derive(Debug)]
enum Step {
    Succeed(u32),
    Fail(&'static str),
    Panic,
}

struct Job {
    release: oneshot::Receiver<Step>,
}

fn gated() -> (Job, oneshot::Sender<Step>) {
    let (tx, rx) = oneshot::channel();
    (Job { release: rx }, tx)
}

async fn run(job: Job) -> Result<u32, String> {
    match job.release.await {
        Ok(Step::Succeed(n)) => Ok(n),
        Ok(Step::Fail(message)) => Err(message.to_string()),
        Ok(Step::Panic) => panic!("job asked to panic"),
        Err(_) => std::future::pending().await,
    }
}

fn gated_pool(size: usize, respawn: RespawnPolicy) -> Pool<Job, u32> {
    let config = PoolConfig::default()
        .with_size(size)
        .with_respawn(respawn);
    Pool::new(config, |job: Job| run(job)).unwrap()
}

async fn next_event(events: &mut broadcast::Receiver<PoolEvent>) -> PoolEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a pool event")
        .expect("event channel closed")
}

fn stats(pool_size: usize, idle: usize, active: usize, queued: usize) -> PoolStats {
    PoolStats {
        pool_size,
        idle,
        active,
        queued,
    }
}

/// Unpacks an `Assigned` event into the task id and worker slot index.
fn assigned(event: PoolEvent) -> (TaskId, usize) {
    match event {
        PoolEvent::Assigned { task_id, worker_id } => (task_id, worker_id.index()),
        other => panic!("expected an assignment, got {other:?}"),
    }
}

fn id(raw: u64) -> TaskId {
    TaskId::from_raw(raw)
}

// ── Scheduling ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_workers_four_tasks() {
    let pool = gated_pool(2, RespawnPolicy::Replace);
    let mut events = pool.subscribe();

    let (j1, g1) = gated();
    let (j2, g2) = gated();
    let (j3, g3) = gated();
    let (j4, g4) = gated();
    let h1 = pool.schedule(j1).unwrap();
    let h2 = pool.schedule(j2).unwrap();
    let h3 = pool.schedule(j3).unwrap();
    let h4 = pool.schedule(j4).unwrap();

    assert_eq!(pool.stats(), stats(2, 0, 2, 2));
    assert_eq!(assigned(next_event(&mut events).await), (h1.id(), 0));
    assert_eq!(assigned(next_event(&mut events).await), (h2.id(), 1));
    assert_eq!(
        next_event(&mut events).await,
        PoolEvent::Queued {
            task_id: h3.id(),
            position: 0,
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        PoolEvent::Queued {
            task_id: h4.id(),
            position: 1,
        }
    );

    g1.send(Step::Succeed(1)).unwrap();
    assert_eq!(h1.await, Ok(1));
    assert_eq!(pool.stats(), stats(2, 0, 2, 1));

    assert!(matches!(
        next_event(&mut events).await,
        PoolEvent::Settled { error: None, .. }
    ));
    assert_eq!(assigned(next_event(&mut events).await), (h3.id(), 0));

    g2.send(Step::Succeed(2)).unwrap();
    g3.send(Step::Succeed(3)).unwrap();
    g4.send(Step::Succeed(4)).unwrap();
    assert_eq!(h2.await, Ok(2));
    assert_eq!(h3.await, Ok(3));
    assert_eq!(h4.await, Ok(4));
    assert_eq!(pool.stats(), stats(2, 2, 0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_pool_size() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handler = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        move |n: u32| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(n)
            }
        }
    };
    let pool: Pool<u32, u32> = Pool::new(PoolConfig::default().with_size(3), handler).unwrap();

    let handles: Vec<_> = (0..40).map(|n| pool.schedule(n).unwrap()).collect();
    assert!(pool.stats().active <= 3);

    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await, Ok(n as u32));
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(pool.stats(), stats(3, 3, 0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submitters_race_completions_and_crashes() {
    let pool: Arc<Pool<u32, u32>> = Arc::new(
        Pool::new(PoolConfig::default().with_size(3), |n: u32| async move {
            tokio::task::yield_now().await;
            if n % 7 == 0 {
                panic!("payload {n} is a multiple of seven");
            }
            Ok::<_, String>(n)
        })
        .unwrap(),
    );

    let submitters: Vec<_> = (0..8u32)
        .map(|submitter| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut handles = Vec::new();
                for i in 0..50u32 {
                    let payload = submitter * 1_000 + i;
                    handles.push((payload, pool.schedule(payload).unwrap()));
                    assert!(pool.stats().active <= 3, "{:?}", pool.stats());
                    tokio::task::yield_now().await;
                }

                let mut crashed = 0usize;
                for (payload, handle) in handles {
                    match handle.await {
                        Ok(n) => assert_eq!(n, payload),
                        Err(err) => {
                            assert_eq!(payload % 7, 0, "{err}");
                            assert_eq!(err.kind(), TaskErrorKind::WorkerCrash);
                            crashed += 1;
                        }
                    }
                }
                crashed
            })
        })
        .collect();

    let mut crashed = 0usize;
    for submitter in submitters {
        crashed += submitter.await.unwrap();
    }

    let expected = (0..8u32)
        .flat_map(|submitter| (0..50u32).map(move |i| submitter * 1_000 + i))
        .filter(|payload| payload % 7 == 0)
        .count();
    assert_eq!(crashed, expected);
    assert_eq!(pool.stats(), stats(3, 3, 0, 0));
}

#[tokio::test]
async fn queued_tasks_are_assigned_in_submission_order() {
    let pool = gated_pool(1, RespawnPolicy::Replace);
    let mut events = pool.subscribe();

    let (blocker, release_blocker) = gated();
    let first = pool.schedule(blocker).unwrap();

    let mut handles = Vec::new();
    for n in 0..5 {
        let (job, gate) = gated();
        gate.send(Step::Succeed(n)).unwrap();
        handles.push(pool.schedule(job).unwrap());
    }
    assert_eq!(pool.stats().queued, 5);

    release_blocker.send(Step::Succeed(99)).unwrap();
    assert_eq!(first.await, Ok(99));
    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await, Ok(n as u32));
    }

    let mut assigned = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::Assigned { task_id, .. } = event {
            assigned.push(task_id);
        }
    }
    assert_eq!(assigned, (1..=6).map(id).collect::<Vec<_>>());
}

#[tokio::test]
async fn every_task_settles_exactly_once() {
    let pool = gated_pool(2, RespawnPolicy::Replace);
    let mut events = pool.subscribe();

    let mut handles = Vec::new();
    for n in 0..6 {
        let (job, gate) = gated();
        let step = if n % 3 == 0 {
            Step::Fail("odd one out")
        } else {
            Step::Succeed(n)
        };
        gate.send(step).unwrap();
        handles.push(pool.schedule(job).unwrap());
    }
    for handle in handles {
        let _ = handle.await;
    }

    let mut settled = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::Settled { task_id, .. } = event {
            settled.push(task_id);
        }
    }
    settled.sort();
    assert_eq!(settled, (1..=6).map(id).collect::<Vec<_>>());
}

#[tokio::test]
async fn handler_fault_settles_as_execution_error() {
    let pool = gated_pool(1, RespawnPolicy::Replace);

    let (job, gate) = gated();
    let handle = pool.schedule(job).unwrap();
    gate.send(Step::Fail("malformed record")).unwrap();

    let err = handle.await.unwrap_err();
    assert_eq!(err.kind(), TaskErrorKind::WorkerExecution);
    assert_eq!(err.message(), "malformed record");

    let (job, gate) = gated();
    gate.send(Step::Succeed(8)).unwrap();
    assert_eq!(pool.schedule(job).unwrap().await, Ok(8));
}

#[tokio::test]
async fn dropped_handle_does_not_disturb_the_pool() {
    let pool = gated_pool(1, RespawnPolicy::Replace);

    let (job, gate) = gated();
    drop(pool.schedule(job).unwrap());
    gate.send(Step::Succeed(1)).unwrap();

    let (job, gate) = gated();
    gate.send(Step::Succeed(2)).unwrap();
    assert_eq!(pool.schedule(job).unwrap().await, Ok(2));
}

// ── Cancellation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_removes_only_queued_tasks() {
    let pool = gated_pool(1, RespawnPolicy::Replace);

    let (j1, g1) = gated();
    let (j2, _g2) = gated();
    let h1 = pool.schedule(j1).unwrap();
    let h2 = pool.schedule(j2).unwrap();
    assert_eq!(pool.stats(), stats(1, 0, 1, 1));

    assert!(!pool.cancel(h1.id()));
    assert!(pool.cancel(h2.id()));
    assert!(!pool.cancel(h2.id()));
    assert_eq!(pool.stats(), stats(1, 0, 1, 0));

    let err = h2.await.unwrap_err();
    assert_eq!(err.kind(), TaskErrorKind::Cancelled);

    g1.send(Step::Succeed(1)).unwrap();
    assert_eq!(h1.await, Ok(1));
}

// ── Crash recovery ────────────────────────────────────────────────────────────

#[tokio::test]
async fn crashed_worker_is_replaced() {
    let pool = gated_pool(1, RespawnPolicy::Replace);
    let mut events = pool.subscribe();

    let (j1, g1) = gated();
    let (j2, g2) = gated();
    let h1 = pool.schedule(j1).unwrap();
    let h2 = pool.schedule(j2).unwrap();
    g2.send(Step::Succeed(5)).unwrap();
    g1.send(Step::Panic).unwrap();

    let err = h1.await.unwrap_err();
    assert_eq!(err.kind(), TaskErrorKind::WorkerCrash);
    assert!(err.message().contains("job asked to panic"), "{err}");
    assert_eq!(h2.await, Ok(5));
    assert_eq!(pool.stats(), stats(1, 1, 0, 0));

    let mut crashed = false;
    let mut replaced = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::WorkerCrashed { task_id, .. } => {
                assert_eq!(task_id, Some(id(1)));
                crashed = true;
            }
            PoolEvent::WorkerReplaced { .. } => replaced = true,
            _ => {}
        }
    }
    assert!(crashed && replaced);
}

#[tokio::test]
async fn retired_workers_shrink_capacity() {
    let pool = gated_pool(2, RespawnPolicy::Retire);

    let (job, gate) = gated();
    let handle = pool.schedule(job).unwrap();
    gate.send(Step::Panic).unwrap();
    assert_eq!(handle.await.unwrap_err().kind(), TaskErrorKind::WorkerCrash);
    assert_eq!(pool.stats(), stats(2, 1, 0, 0));

    let (job, gate) = gated();
    gate.send(Step::Succeed(3)).unwrap();
    assert_eq!(pool.schedule(job).unwrap().await, Ok(3));
}

#[tokio::test]
async fn losing_the_last_worker_rejects_queued_and_new_tasks() {
    let pool = gated_pool(1, RespawnPolicy::Retire);

    let (j1, g1) = gated();
    let (j2, _g2) = gated();
    let h1 = pool.schedule(j1).unwrap();
    let h2 = pool.schedule(j2).unwrap();
    g1.send(Step::Panic).unwrap();

    assert_eq!(h1.await.unwrap_err().kind(), TaskErrorKind::WorkerCrash);
    assert_eq!(
        h2.await.unwrap_err().kind(),
        TaskErrorKind::CapacityExhausted
    );
    assert_eq!(pool.stats(), stats(1, 0, 0, 0));

    let (job, _gate) = gated();
    let err = pool.schedule(job).unwrap_err();
    assert_eq!(err.kind(), TaskErrorKind::CapacityExhausted);
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_rejects_queued_and_drains_in_flight() {
    let pool = gated_pool(1, RespawnPolicy::Replace);
    let mut events = pool.subscribe();

    let (j1, g1) = gated();
    let (j2, _g2) = gated();
    let (j3, _g3) = gated();
    let h1 = pool.schedule(j1).unwrap();
    let h2 = pool.schedule(j2).unwrap();
    let h3 = pool.schedule(j3).unwrap();

    let drain = async {
        assert_eq!(h2.await.unwrap_err().kind(), TaskErrorKind::PoolClosed);
        assert_eq!(h3.await.unwrap_err().kind(), TaskErrorKind::PoolClosed);
        assert_eq!(pool.lifecycle(), Lifecycle::ShuttingDown);
        assert_eq!(pool.stats(), stats(1, 0, 1, 0));

        let (job, _gate) = gated();
        let err = pool.schedule(job).unwrap_err();
        assert_eq!(err.kind(), TaskErrorKind::PoolClosed);

        g1.send(Step::Succeed(7)).unwrap();
        h1.await
    };
    let (report, first) = tokio::join!(pool.shutdown(Duration::from_secs(5)), drain);

    assert_eq!(first, Ok(7));
    assert!(report.unwrap().forced_task_ids.is_empty());
    assert_eq!(pool.lifecycle(), Lifecycle::Closed);

    let mut started = None;
    let mut closed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::ShutdownStarted {
                rejected,
                in_flight,
            } => started = Some((rejected, in_flight)),
            PoolEvent::Closed { forced } => closed = Some(forced),
            _ => {}
        }
    }
    assert_eq!(started, Some((2, 1)));
    assert_eq!(closed, Some(Vec::new()));
}

#[tokio::test]
async fn shutdown_timeout_forces_in_flight_tasks() {
    let pool = gated_pool(2, RespawnPolicy::Replace);

    let (j1, _g1) = gated();
    let (j2, _g2) = gated();
    let h1 = pool.schedule(j1).unwrap();
    let h2 = pool.schedule(j2).unwrap();

    let report = pool.shutdown(Duration::from_millis(50)).await.unwrap();
    assert_eq!(report.forced_task_ids, vec![h1.id(), h2.id()]);

    let err = h1.await.unwrap_err();
    assert_eq!(err.kind(), TaskErrorKind::ShutdownTimeout);
    assert_eq!(h2.await.unwrap_err().kind(), TaskErrorKind::ShutdownTimeout);

    assert_eq!(pool.lifecycle(), Lifecycle::Closed);
    assert_eq!(pool.stats().active, 0);
    assert_eq!(pool.stats().queued, 0);
}

#[tokio::test]
async fn close_uses_configured_timeout() {
    let config = PoolConfig::default()
        .with_size(1)
        .with_shutdown_timeout(Duration::from_millis(20));
    let pool: Pool<Job, u32> = Pool::new(config, |job: Job| run(job)).unwrap();

    let (job, _gate) = gated();
    let handle = pool.schedule(job).unwrap();

    let report = pool.close().await.unwrap();
    assert_eq!(report.forced_task_ids, vec![handle.id()]);
    assert_eq!(
        handle.await.unwrap_err().kind(),
        TaskErrorKind::ShutdownTimeout
    );
}

#[tokio::test]
async fn idle_pool_shuts_down_immediately() {
    let pool = gated_pool(4, RespawnPolicy::Replace);
    let report = tokio::time::timeout(
        Duration::from_secs(1),
        pool.shutdown(Duration::from_secs(30)),
    )
    .await
    .expect("idle pool should not wait for its drain bound")
    .unwrap();
    assert!(report.forced_task_ids.is_empty());
    assert_eq!(pool.lifecycle(), Lifecycle::Closed);
}

#[tokio::test]
async fn crash_while_draining_retires_the_slot() {
    let pool = gated_pool(1, RespawnPolicy::Replace);
    let mut events = pool.subscribe();

    let (job, gate) = gated();
    let handle = pool.schedule(job).unwrap();

    let crash = async {
        gate.send(Step::Panic).unwrap();
        handle.await
    };
    let (report, outcome) = tokio::join!(pool.shutdown(Duration::from_secs(5)), crash);

    assert_eq!(outcome.unwrap_err().kind(), TaskErrorKind::WorkerCrash);
    assert!(report.unwrap().forced_task_ids.is_empty());
    assert_eq!(pool.lifecycle(), Lifecycle::Closed);

    let mut retired = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::WorkerRetired { worker_id } => {
                assert_eq!(worker_id.index(), 0);
                retired = true;
            }
            PoolEvent::WorkerReplaced { .. } => panic!("no unit is respawned while draining"),
            _ => {}
        }
    }
    assert!(retired);
}

#[tokio::test]
async fn zero_drain_bound_forces_in_flight_tasks() {
    let pool = gated_pool(2, RespawnPolicy::Replace);

    let (job, _gate) = gated();
    let handle = pool.schedule(job).unwrap();

    let report = pool.shutdown(Duration::ZERO).await.unwrap();
    assert_eq!(report.forced_task_ids, vec![handle.id()]);
    assert_eq!(
        handle.await.unwrap_err().kind(),
        TaskErrorKind::ShutdownTimeout
    );
    assert_eq!(pool.lifecycle(), Lifecycle::Closed);
    assert_eq!(pool.stats().active, 0);
}

#[tokio::test]
async fn zero_drain_bound_on_idle_pool_forces_nothing() {
    let pool = gated_pool(2, RespawnPolicy::Replace);
    let report = pool.shutdown(Duration::ZERO).await.unwrap();
    assert!(report.forced_task_ids.is_empty());
    assert_eq!(pool.lifecycle(), Lifecycle::Closed);
}
