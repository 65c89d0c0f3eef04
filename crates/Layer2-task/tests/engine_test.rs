//! Engine integration tests - concurrency bound, ordering, timeouts,
//! cancellation, retention and statistics
//!
//! `cargo test -p taskforge-task --test engine_test`

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use taskforge_task::{
    EngineConfig, Error, HandlerRegistry, TaskContext, TaskEvent, TaskFilter, TaskHandler,
    TaskId, TaskManager, TaskSpec, TaskStatus,
};
use tokio::sync::oneshot;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn started(n: usize) -> TaskManager {
    let manager =
        TaskManager::new(EngineConfig::new().max_concurrency(n)).expect("invalid config");
    manager.start(n).expect("start failed");
    manager
}

async fn sleep_task(manager: &TaskManager, name: &str, ms: u64) -> TaskId {
    manager
        .submit(TaskSpec::new("sleep", name), move |_| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        })
        .await
        .expect("submit failed")
}

/// Occupies the only worker until the returned sender fires
async fn blocker(manager: &TaskManager) -> (TaskId, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let id = manager
        .submit(TaskSpec::new("block", "blocker"), |_| async move {
            let _ = rx.await;
            Ok(json!("released"))
        })
        .await
        .expect("submit failed");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.get_status(id).await, Some(TaskStatus::Running));
    (id, tx)
}

/// Sets the flag when the callable's future is dropped
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_limit() {
    let manager = started(3);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for i in 0..12 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        let id = manager
            .submit(TaskSpec::new("count", format!("task-{}", i)), move |_| async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .await
            .unwrap();
        ids.push(id);
    }

    // sample the table while work is in flight
    for _ in 0..10 {
        assert!(manager.stats().await.running <= 3);
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    for id in ids {
        let task = manager.wait(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {}", peak);
    assert!(peak >= 2, "work never overlapped");
}

#[tokio::test]
async fn test_fifo_dequeue_order() {
    let manager = started(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for i in 0..10usize {
        let order = Arc::clone(&order);
        let id = manager
            .submit(TaskSpec::new("fifo", format!("t{}", i)), move |_| async move {
                order.lock().unwrap().push(i);
                Ok(json!(i))
            })
            .await
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        manager.wait(*id, WAIT).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());

    // list is newest first regardless of completion order
    let listed: Vec<_> = manager
        .list(&TaskFilter::new().with_type("fifo"), 10)
        .await
        .into_iter()
        .map(|t| t.id)
        .collect();
    let mut expected = ids.clone();
    expected.reverse();
    assert_eq!(listed, expected);
}

#[tokio::test]
async fn test_timeout_yields_timed_out() {
    let manager = started(1);
    let timeout = Duration::from_millis(100);
    let dropped = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&dropped);
    let id = manager
        .submit(
            TaskSpec::new("sleep", "too slow").with_timeout(timeout),
            move |_| async move {
                let _guard = DropFlag(flag);
                tokio::time::sleep(timeout * 2).await;
                Ok(json!("finished"))
            },
        )
        .await
        .unwrap();

    let task = manager.wait(id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::TimedOut);
    assert!(task.result.is_none());
    assert!(task.error.as_deref().unwrap().contains("0.100s"));

    let ran_for = task.duration().unwrap();
    assert!(ran_for >= timeout, "ran for {:?}", ran_for);
    assert!(ran_for < timeout + Duration::from_millis(150), "ran for {:?}", ran_for);

    // the callable was forcibly dropped, not left running
    assert!(dropped.load(Ordering::SeqCst));
    tokio::time::sleep(timeout * 2).await;
    assert_eq!(manager.get_status(id).await, Some(TaskStatus::TimedOut));
}

#[tokio::test]
async fn test_default_timeout_from_config() {
    let manager = TaskManager::new(EngineConfig::new().default_timeout_secs(0.05)).unwrap();
    manager.start_default().unwrap();

    let id = sleep_task(&manager, "slow", 1000).await;
    let task = manager.wait(id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::TimedOut);
    assert_eq!(task.timeout, Some(Duration::from_millis(50)));
}

#[tokio::test]
async fn test_cancel_before_dequeue_never_runs() {
    let manager = started(1);
    let mut events = manager.subscribe();
    let (blocker_id, release) = blocker(&manager).await;

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let victim = manager
        .submit(TaskSpec::new("victim", "never"), move |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(json!(null))
        })
        .await
        .unwrap();

    assert!(manager.cancel(victim).await);
    assert!(!manager.cancel(victim).await, "already terminal");

    release.send(()).unwrap();
    manager.wait(blocker_id, WAIT).await.unwrap();
    // give the worker time to dequeue and skip the victim
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = manager.get(victim).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.started_at.is_none());
    assert!(task.completed_at.is_some());
    assert!(task.result.is_none() && task.error.is_none());
    assert!(!ran.load(Ordering::SeqCst));

    while let Ok(event) = events.try_recv() {
        if event.task_id == victim {
            assert_ne!(event.to, TaskStatus::Running);
        }
    }
}

#[tokio::test]
async fn test_cancel_running_interrupts_execution() {
    let manager = started(1);
    let dropped = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicBool::new(false));

    let (flag, seen) = (Arc::clone(&dropped), Arc::clone(&observed));
    let id = manager
        .submit(TaskSpec::new("long", "forever"), move |ctx: TaskContext| async move {
            let _guard = DropFlag(flag);
            let token = ctx.cancellation_token();
            tokio::spawn(async move {
                token.cancelled().await;
                seen.store(true, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!("late"))
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.get_status(id).await, Some(TaskStatus::Running));

    assert!(manager.cancel(id).await);
    assert_eq!(manager.get_status(id).await, Some(TaskStatus::Cancelled));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dropped.load(Ordering::SeqCst), "callable still running");
    assert!(observed.load(Ordering::SeqCst), "token never fired");

    // the permit came back: the next task runs
    let next = sleep_task(&manager, "after", 5).await;
    let task = manager.wait(next, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(manager.get_result(id).await, None);
}

#[tokio::test]
async fn test_terminal_states_are_final() {
    let manager = started(2);
    let mut events = manager.subscribe();

    let ok = sleep_task(&manager, "ok", 10).await;
    let failed = manager
        .submit(TaskSpec::new("t", "fails"), |_| async {
            Err(anyhow::anyhow!("bad payload"))
        })
        .await
        .unwrap();
    let timed_out = manager
        .submit(
            TaskSpec::new("t", "times out").with_timeout(Duration::from_millis(20)),
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            },
        )
        .await
        .unwrap();
    let cancelled = sleep_task(&manager, "cancelled", 200).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    manager.cancel(cancelled).await;

    for id in [ok, failed, timed_out, cancelled] {
        manager.wait(id, WAIT).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(250)).await;

    let mut history: HashMap<TaskId, Vec<TaskEvent>> = HashMap::new();
    while let Ok(event) = events.try_recv() {
        history.entry(event.task_id).or_default().push(event);
    }

    for (id, events) in &history {
        let terminal_at = events.iter().position(|e| e.is_terminal());
        assert_eq!(
            terminal_at,
            Some(events.len() - 1),
            "task {} moved after a terminal state",
            id
        );
        for event in events {
            if let Some(from) = event.from {
                assert!(from.can_transition_to(event.to), "{} -> {}", from, event.to);
            }
        }
    }

    assert_eq!(manager.get_status(ok).await, Some(TaskStatus::Completed));
    assert_eq!(manager.get_status(failed).await, Some(TaskStatus::Failed));
    assert_eq!(manager.get_status(timed_out).await, Some(TaskStatus::TimedOut));
    assert_eq!(manager.get_status(cancelled).await, Some(TaskStatus::Cancelled));
    assert_eq!(
        manager.get(failed).await.unwrap().error.as_deref(),
        Some("bad payload")
    );
}

#[tokio::test]
async fn test_cleanup_only_removes_old_terminal_tasks() {
    let manager = started(1);

    let done = sleep_task(&manager, "done", 1).await;
    manager.wait(done, WAIT).await.unwrap();

    let (running, release) = blocker(&manager).await;
    let pending = sleep_task(&manager, "pending", 1).await;

    // nothing is an hour old yet
    assert_eq!(manager.cleanup(Duration::from_secs(3600)).await, 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.cleanup(Duration::ZERO).await, 1);

    assert!(manager.get(done).await.is_none());
    assert_eq!(manager.get_status(running).await, Some(TaskStatus::Running));
    assert_eq!(manager.get_status(pending).await, Some(TaskStatus::Pending));

    release.send(()).unwrap();
    manager.wait(pending, WAIT).await.unwrap();
}

#[tokio::test]
async fn test_stats_consistent_at_quiescence() {
    let manager = started(2);

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(sleep_task(&manager, &format!("s{}", i), 5).await);
    }
    ids.push(
        manager
            .submit(TaskSpec::new("t", "fail"), |_| async {
                Err(anyhow::anyhow!("nope"))
            })
            .await
            .unwrap(),
    );
    for id in &ids {
        manager.wait(*id, WAIT).await.unwrap();
    }

    let stats = manager.stats().await;
    let all = manager.list(&TaskFilter::new(), usize::MAX).await;
    assert_eq!(stats.total, all.len());
    assert_eq!(
        stats.pending
            + stats.running
            + stats.completed
            + stats.failed
            + stats.cancelled
            + stats.timed_out,
        stats.total
    );
    assert_eq!(stats.completed, 6);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.max_concurrency, 2);
    assert_eq!(stats.available_permits, 2);
    assert!(stats.is_running);

    let failed = manager
        .list(&TaskFilter::new().with_status(TaskStatus::Failed), 10)
        .await;
    assert_eq!(failed.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_twenty_sleeps_on_five_workers() {
    let manager = started(5);
    let begin = Instant::now();

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(sleep_task(&manager, &format!("sleep-{}", i), 200).await);
    }
    for id in &ids {
        let task = manager.wait(*id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    let elapsed = begin.elapsed();
    assert!(elapsed >= Duration::from_millis(780), "too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2000), "too slow: {:?}", elapsed);
    assert_eq!(manager.stats().await.completed, 20);
}

struct Upper;

#[async_trait]
impl TaskHandler for Upper {
    fn task_type(&self) -> &str {
        "upper"
    }

    async fn run(&self, ctx: TaskContext, input: Value) -> anyhow::Result<Value> {
        ctx.set_progress(50.0, "converting").await;
        let text = input
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("expected a string"))?;
        Ok(json!(text.to_uppercase()))
    }
}

#[tokio::test]
async fn test_registered_handlers() {
    let manager = started(1);
    let mut registry = HandlerRegistry::new();
    registry.register(Upper);

    let id = manager
        .submit_registered(&registry, TaskSpec::new("upper", "shout"), json!("hi"))
        .await
        .unwrap();
    let bad = manager
        .submit_registered(&registry, TaskSpec::new("upper", "wrong"), json!(3))
        .await
        .unwrap();

    assert_eq!(manager.wait(id, WAIT).await.unwrap().result, Some(json!("HI")));
    let task = manager.wait(bad, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("expected a string"));

    let err = manager
        .submit_registered(&registry, TaskSpec::new("lower", "x"), json!("A"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_event_sequence_for_successful_task() {
    let manager = started(1);
    let mut events = manager.subscribe();

    let id = sleep_task(&manager, "observed", 5).await;
    manager.wait(id, WAIT).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.task_id == id {
            seen.push(event.to);
        }
    }
    assert_eq!(
        seen,
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
    );
}

#[tokio::test]
async fn test_wait_times_out_on_long_task() {
    let manager = started(1);
    let id = sleep_task(&manager, "long", 500).await;
    assert!(manager.wait(id, Some(Duration::from_millis(50))).await.is_none());
    assert!(manager.cancel(id).await);
}
