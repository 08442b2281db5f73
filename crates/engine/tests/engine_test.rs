//! End-to-end engine scenarios on the in-memory store
//!
//! Run with: cargo test -p taskpool-engine --test engine_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use taskpool_engine::prelude::*;

fn fast_config(pool_size: usize) -> EngineConfig {
    EngineConfig::new()
        .with_pool_size(pool_size)
        .with_retry(RetryPolicy::fixed(Duration::from_millis(20), 3))
        .with_poll_interval(Duration::from_millis(10))
        .with_error_backoff(Duration::from_millis(20))
        .with_dequeue_timeout(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_secs(2))
}

async fn wait_for_status(store: &InMemoryTaskStore, id: Uuid, status: TaskStatus) -> Task {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let task = store.get_task(id).await.unwrap().unwrap();
        if task.status == status {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "task {} stuck in {} waiting for {}",
            id,
            task.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Tracks how many handler runs overlap and which tasks ran
#[derive(Default)]
struct Probe {
    running: AtomicUsize,
    max_running: AtomicUsize,
    runs: Mutex<Vec<Uuid>>,
}

impl Probe {
    async fn observe(&self, task_id: Uuid, work: Duration) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.runs.lock().push(task_id);
        tokio::time::sleep(work).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn runs_per_task(&self) -> HashMap<Uuid, usize> {
        let mut counts = HashMap::new();
        for id in self.runs.lock().iter() {
            *counts.entry(*id).or_insert(0) += 1;
        }
        counts
    }
}

fn probed_registry(probe: &Arc<Probe>, work: Duration) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let probe = Arc::clone(probe);
    registry.register_fn("probe", move |task| {
        let probe = Arc::clone(&probe);
        async move {
            probe.observe(task.task_id, work).await;
            Ok::<_, HandlerError>(json!({"ok": true}))
        }
    });
    registry
}

#[test_log::test(tokio::test)]
async fn test_email_task_completes() {
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(
        store.clone(),
        HandlerRegistry::with_builtin_handlers(Duration::from_millis(5)),
        fast_config(2),
    );
    engine.start().await.unwrap();

    let task = engine
        .submit(NewTask::new("email", json!({"email": "a@b.com"})))
        .await
        .unwrap();
    let task = wait_for_status(&store, task.id, TaskStatus::Completed).await;

    assert_eq!(
        task.result,
        Some(json!({"status": "email_sent", "to": "a@b.com"}))
    );
    assert!(task.error_message.is_none());
    assert_eq!(task.retry_count, 0);
    assert!(task.completed_at.is_some());

    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_unknown_type_echoes_payload() {
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(store.clone(), HandlerRegistry::new(), fast_config(1));
    engine.start().await.unwrap();

    let task = engine
        .submit(NewTask::new("mystery", json!({"x": [1, 2]})))
        .await
        .unwrap();
    let task = wait_for_status(&store, task.id, TaskStatus::Completed).await;

    assert_eq!(
        task.result,
        Some(json!({"status": "completed", "data": {"x": [1, 2]}}))
    );
    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_always_failing_task_exhausts_retries() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let attempts = Arc::clone(&attempts);
        registry.register_fn("broken", move |_task| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<serde_json::Value, _>(HandlerError::new("smtp connection refused"))
            }
        });
    }

    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(
        store.clone(),
        registry,
        fast_config(2).with_max_retries(2),
    );
    engine.start().await.unwrap();

    let task = engine
        .submit(NewTask::new("broken", json!({})))
        .await
        .unwrap();
    let task = wait_for_status(&store, task.id, TaskStatus::Failed).await;

    assert_eq!(task.retry_count, 2);
    assert_eq!(task.error_message.as_deref(), Some("smtp connection refused"));
    assert!(task.result.is_none());
    assert!(task.completed_at.is_none());

    // Terminal: no further attempts
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_transient_failure_recovers() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let attempts = Arc::clone(&attempts);
        registry.register_fn("flaky", move |task| {
            let attempts = Arc::clone(&attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(HandlerError::new("timeout talking to upstream"));
                }
                Ok::<_, HandlerError>(json!({"attempt": task.attempt}))
            }
        });
    }

    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(store.clone(), registry, fast_config(2));
    engine.start().await.unwrap();

    let task = engine.submit(NewTask::new("flaky", json!({}))).await.unwrap();
    let task = wait_for_status(&store, task.id, TaskStatus::Completed).await;

    assert_eq!(task.retry_count, 1);
    assert_eq!(task.result, Some(json!({"attempt": 2})));
    assert!(task.error_message.is_none());

    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_single_worker_runs_tasks_serially_in_order() {
    let probe = Arc::new(Probe::default());
    let store = Arc::new(InMemoryTaskStore::new());

    let mut ids = vec![];
    for i in 0..3 {
        ids.push(
            store
                .create_task(NewTask::new("probe", json!({"i": i})))
                .await
                .unwrap()
                .id,
        );
    }

    let engine = TaskEngine::new(
        store.clone(),
        probed_registry(&probe, Duration::from_millis(30)),
        fast_config(1),
    );
    engine.start().await.unwrap();

    for id in &ids {
        wait_for_status(&store, *id, TaskStatus::Completed).await;
    }

    assert_eq!(probe.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(*probe.runs.lock(), ids);

    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_pool_bounds_concurrency_and_runs_each_task_once() {
    let probe = Arc::new(Probe::default());
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(
        store.clone(),
        probed_registry(&probe, Duration::from_millis(40)),
        // Fetching much faster than tasks finish queues duplicate entries
        fast_config(3).with_poll_interval(Duration::from_millis(5)),
    );
    engine.start().await.unwrap();

    let mut ids = vec![];
    for _ in 0..12 {
        ids.push(engine.submit(NewTask::new("probe", json!({}))).await.unwrap().id);
    }
    for id in &ids {
        wait_for_status(&store, *id, TaskStatus::Completed).await;
    }

    assert!(probe.max_running.load(Ordering::SeqCst) <= 3);
    let runs = probe.runs_per_task();
    assert_eq!(runs.len(), 12);
    assert!(runs.values().all(|&n| n == 1), "duplicate runs: {:?}", runs);

    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_full_queue_throttles_fetching() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let gate = Arc::clone(&gate);
        registry.register_fn("gated", move |_task| {
            let gate = Arc::clone(&gate);
            async move {
                let _permit = gate.acquire().await.map_err(anyhow::Error::from)?;
                Ok::<_, HandlerError>(json!(null))
            }
        });
    }

    let store = Arc::new(InMemoryTaskStore::new());
    for _ in 0..10 {
        store
            .create_task(NewTask::new("gated", json!({})))
            .await
            .unwrap();
    }

    let engine = TaskEngine::new(
        store.clone(),
        registry,
        fast_config(1).with_queue_capacity(2).with_fetch_batch_size(10),
    );
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.queue_capacity, Some(2));
    assert!(stats.queue_depth <= 2);
    assert_eq!(stats.tasks.get(TaskStatus::Processing), 1);
    assert_eq!(stats.tasks.get(TaskStatus::Pending), 9);

    gate.add_permits(100);
    for task in store.list_tasks(TaskFilter::default()).await.unwrap() {
        wait_for_status(&store, task.id, TaskStatus::Completed).await;
    }

    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_graceful_stop_lets_running_handler_finish() {
    let probe = Arc::new(Probe::default());
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(
        store.clone(),
        probed_registry(&probe, Duration::from_millis(200)),
        fast_config(2),
    );
    engine.start().await.unwrap();

    let task = engine.submit(NewTask::new("probe", json!({}))).await.unwrap();
    wait_for_status(&store, task.id, TaskStatus::Processing).await;

    let started = Instant::now();
    engine.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(engine.state(), EngineState::Stopped);

    let task = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // Nothing is claimed once stopped
    let late = store
        .create_task(NewTask::new("probe", json!({})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        store.get_task(late.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(probe.runs.lock().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_stop_is_bounded_and_restart_reconciles_stale_tasks() {
    let mut slow = HandlerRegistry::new();
    slow.register_fn("job", |_task| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, HandlerError>(json!("slow"))
    });

    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(
        store.clone(),
        slow,
        fast_config(1).with_shutdown_timeout(Duration::from_millis(100)),
    );
    engine.start().await.unwrap();

    let task = engine.submit(NewTask::new("job", json!({}))).await.unwrap();
    wait_for_status(&store, task.id, TaskStatus::Processing).await;

    let started = Instant::now();
    assert!(matches!(
        engine.stop().await,
        Err(EngineError::ShutdownTimeout)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.state(), EngineState::Stopped);

    // Aborted mid-run: left processing
    assert_eq!(
        store.get_task(task.id).await.unwrap().unwrap().status,
        TaskStatus::Processing
    );

    let mut fast = HandlerRegistry::new();
    fast.register_fn("job", |_task| async move { Ok::<_, HandlerError>(json!("fast")) });
    let restarted = TaskEngine::new(store.clone(), fast, fast_config(1));
    restarted.start().await.unwrap();

    let task = wait_for_status(&store, task.id, TaskStatus::Completed).await;
    assert_eq!(task.result, Some(json!("fast")));

    restarted.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_restart_recovers_task_stranded_in_retry_delay() {
    let mut failing = HandlerRegistry::new();
    failing.register_fn("job", |_task| async move {
        Err::<serde_json::Value, _>(HandlerError::new("upstream unavailable"))
    });

    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(
        store.clone(),
        failing,
        fast_config(1).with_retry(RetryPolicy::fixed(Duration::from_secs(60), 3)),
    );
    engine.start().await.unwrap();

    let task = engine.submit(NewTask::new("job", json!({}))).await.unwrap();
    wait_for_status(&store, task.id, TaskStatus::Retrying).await;

    // The retry timer cannot requeue while the store is down
    store.set_unavailable(true);
    engine.stop().await.unwrap();
    store.set_unavailable(false);
    assert_eq!(
        store.get_task(task.id).await.unwrap().unwrap().status,
        TaskStatus::Retrying
    );

    let mut fixed = HandlerRegistry::new();
    fixed.register_fn("job", |_task| async move { Ok::<_, HandlerError>(json!("done")) });
    let restarted = TaskEngine::new(store.clone(), fixed, fast_config(1));
    restarted.start().await.unwrap();

    let task = wait_for_status(&store, task.id, TaskStatus::Completed).await;
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.result, Some(json!("done")));

    restarted.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_engine_survives_store_outage() {
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(store.clone(), HandlerRegistry::new(), fast_config(2));
    engine.start().await.unwrap();

    store.set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.state(), EngineState::Running);
    store.set_unavailable(false);

    let task = engine.submit(NewTask::new("echo", json!(1))).await.unwrap();
    wait_for_status(&store, task.id, TaskStatus::Completed).await;

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.live_workers, 2);

    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_execution_timeout_fails_the_attempt() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("hang", |_task| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, HandlerError>(json!(null))
    });

    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(
        store.clone(),
        registry,
        fast_config(1)
            .with_retry(RetryPolicy::no_retry())
            .with_execution_timeout(Duration::from_millis(50)),
    );
    engine.start().await.unwrap();

    let task = engine.submit(NewTask::new("hang", json!({}))).await.unwrap();
    let task = wait_for_status(&store, task.id, TaskStatus::Failed).await;

    assert_eq!(
        task.error_message.as_deref(),
        Some("execution timed out after 50ms")
    );
    assert_eq!(task.retry_count, 1);

    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_submit_wakes_fetcher_before_next_poll() {
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(
        store.clone(),
        HandlerRegistry::new(),
        fast_config(1).with_poll_interval(Duration::from_secs(60)),
    );
    engine.start().await.unwrap();
    // Let the startup poll run against the empty store
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let task = engine.submit(NewTask::new("echo", json!({}))).await.unwrap();
    wait_for_status(&store, task.id, TaskStatus::Completed).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    engine.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_stats_reflect_finished_work() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("fail", |_task| async move {
        Err::<serde_json::Value, _>(HandlerError::new("bad"))
    });

    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(
        store.clone(),
        registry,
        fast_config(2).with_retry(RetryPolicy::no_retry()),
    );
    engine.start().await.unwrap();

    let mut ids = vec![];
    for _ in 0..3 {
        ids.push(engine.submit(NewTask::new("echo", json!({}))).await.unwrap().id);
    }
    let failed = engine.submit(NewTask::new("fail", json!({}))).await.unwrap();
    for id in &ids {
        wait_for_status(&store, *id, TaskStatus::Completed).await;
    }
    wait_for_status(&store, failed.id, TaskStatus::Failed).await;

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.state, EngineState::Running);
    assert_eq!(stats.pool_size, 2);
    assert_eq!(stats.tasks.get(TaskStatus::Completed), 3);
    assert_eq!(stats.tasks.get(TaskStatus::Failed), 1);
    assert_eq!(stats.backlog(), 0);
    assert_eq!(stats.success_rate(), Some(75.0));

    // Terminal tasks can be cleaned up, live ones cannot
    store.delete_task(failed.id).await.unwrap();
    assert_eq!(store.task_count(), 3);

    engine.stop().await.unwrap();
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.state, EngineState::Stopped);
    assert_eq!(stats.live_workers, 0);
    assert_eq!(stats.queue_depth, 0);
}
