//! Demo mode - submits a batch of sleeping tasks and reports how they ran

use async_trait::async_trait;
use clap::Args;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use taskforge_foundation::EngineConfig;
use taskforge_task::{
    HandlerRegistry, Task, TaskContext, TaskHandler, TaskId, TaskManager, TaskSpec,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Number of tasks to submit
    #[arg(short, long, default_value = "20")]
    tasks: usize,

    /// Worker count (overrides maxConcurrency from config)
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,

    /// How long each task sleeps
    #[arg(short, long, default_value = "200")]
    sleep_ms: u64,

    /// Make every K-th task fail
    #[arg(long)]
    fail_every: Option<usize>,

    /// Per-task deadline
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Cancel the first K tasks right after submission
    #[arg(long, default_value = "0")]
    cancel_first: usize,
}

/// Sleeps for `input.ms`, reporting progress halfway
struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    fn task_type(&self) -> &str {
        "sleep"
    }

    async fn run(&self, ctx: TaskContext, input: Value) -> anyhow::Result<Value> {
        let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms / 2)).await;
        ctx.set_progress(50.0, "halfway").await;
        tokio::time::sleep(Duration::from_millis(ms - ms / 2)).await;
        Ok(json!({ "sleptMs": ms }))
    }
}

/// Sleeps, then fails
struct FailHandler;

#[async_trait]
impl TaskHandler for FailHandler {
    fn task_type(&self) -> &str {
        "fail"
    }

    async fn run(&self, _ctx: TaskContext, input: Value) -> anyhow::Result<Value> {
        let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        anyhow::bail!("simulated failure after {}ms", ms)
    }
}

pub async fn run(config: EngineConfig, args: DemoArgs) -> anyhow::Result<()> {
    let concurrency = args.concurrency.unwrap_or(config.max_concurrency);
    let manager = TaskManager::new(config)?;
    manager.start(concurrency)?;

    let mut registry = HandlerRegistry::new();
    registry.register(SleepHandler).register(FailHandler);

    println!(
        "Taskforge demo - {} tasks x {}ms on {} workers\n",
        args.tasks, args.sleep_ms, concurrency
    );

    // print terminal transitions as they happen
    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.is_terminal() => {
                    println!("  {} {} {}", event.to.symbol(), event.task_id.short(), event.to);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Event printer lagged by {}", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let begin = Instant::now();
    let mut ids = Vec::with_capacity(args.tasks);
    for i in 0..args.tasks {
        let fails = args.fail_every.is_some_and(|k| k > 0 && (i + 1) % k == 0);
        let task_type = if fails { "fail" } else { "sleep" };

        let mut spec = TaskSpec::new(task_type, format!("task-{:02}", i + 1));
        if let Some(ms) = args.timeout_ms {
            spec = spec.with_timeout(Duration::from_millis(ms));
        }
        let id = manager
            .submit_registered(&registry, spec, json!({ "ms": args.sleep_ms }))
            .await?;
        ids.push(id);
    }
    info!("Submitted {} tasks", ids.len());

    for id in ids.iter().take(args.cancel_first) {
        manager.cancel(*id).await;
    }

    let tasks = tokio::select! {
        tasks = wait_all(&manager, &ids) => tasks,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            manager.shutdown().await;
            wait_all(&manager, &ids).await
        }
    };
    let elapsed = begin.elapsed();

    let stats = manager.stats().await;
    manager.shutdown().await;
    printer.abort();

    print_summary(&tasks);
    println!("\nWall clock: {:.3}s", elapsed.as_secs_f64());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn wait_all(manager: &TaskManager, ids: &[TaskId]) -> Vec<Task> {
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(task) = manager.wait(*id, None).await {
            tasks.push(task);
        }
    }
    tasks
}

fn print_summary(tasks: &[Task]) {
    println!(
        "\n{:<10} {:<9} {:<6} {:<10} {:>8}  {}",
        "ID", "NAME", "TYPE", "STATUS", "MS", "DETAIL"
    );
    for task in tasks {
        let ms = task
            .duration()
            .map(|d| d.as_millis().to_string())
            .unwrap_or_else(|| "-".to_string());
        let detail = match (&task.result, &task.error) {
            (Some(result), _) => result.to_string(),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{:<10} {:<9} {:<6} {} {:<8} {:>8}  {}",
            task.id.short(),
            task.name,
            task.task_type,
            task.status.symbol(),
            task.status.display_name(),
            ms,
            truncate(&detail, 60)
        );
    }
}

/// Truncate a string for display
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
