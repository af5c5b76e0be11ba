use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tracing::info;

use profile_rpa::config::EngineConfig;
use profile_rpa::engine::{
    DEFAULT_PRIORITY, DryRunExecutor, EngineDeps, EventHandlers, ExecutionEngine, WorkerChange,
};
use profile_rpa::task::{InMemoryProfileStore, InMemoryTaskStore, Profile, ProfileRef, Task};

const DEFAULT_PROFILE_COUNT: usize = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(task_path) = args.next() else {
        eprintln!("Usage: profile-rpa <task.json> [profile-count]");
        std::process::exit(2);
    };
    let profile_count = match args.next() {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid profile count: {raw}"))?,
        None => DEFAULT_PROFILE_COUNT,
    };

    let config = EngineConfig::from_env();

    eprintln!("profile-rpa v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Task: {}", task_path);
    eprintln!("   Profiles: {}", profile_count);
    eprintln!("   Concurrency: {}\n", config.concurrency_limit);

    let raw = tokio::fs::read_to_string(&task_path)
        .await
        .with_context(|| format!("failed to read {task_path}"))?;
    let task = Task::from_json(&raw)?;
    let task_id = task.id.clone();

    let tasks = Arc::new(InMemoryTaskStore::new());
    tasks.insert(task).await?;

    let profiles = Arc::new(InMemoryProfileStore::new());
    let mut refs: Vec<ProfileRef> = Vec::with_capacity(profile_count);
    for n in 1..=profile_count {
        let profile = Profile::new(format!("profile-{n}"), format!("Profile {n}"));
        refs.push(profile.to_ref());
        profiles.insert(profile).await;
    }

    let engine = ExecutionEngine::start(
        config,
        EngineDeps {
            tasks,
            profiles,
            executor: Arc::new(DryRunExecutor),
        },
    )?;

    engine.subscribe(
        EventHandlers::new()
            .on_job_update(|job| {
                info!(
                    job_id = %job.id,
                    profile = %job.profile_name,
                    status = %job.status,
                    step = job.progress.current_step,
                    total = job.progress.total_steps,
                    "Job update"
                );
            })
            .on_worker_update(|worker, change| {
                if change != WorkerChange::Created {
                    info!(worker_id = %worker.id, ?change, "Worker update");
                }
            }),
    );

    let ids = engine
        .queue_task(&task_id, &refs, DEFAULT_PRIORITY)
        .await?;
    engine.wait_idle(Duration::from_millis(50)).await;

    let jobs: Vec<_> = join_all(ids.iter().map(|id| engine.get_job(*id)))
        .await
        .into_iter()
        .flatten()
        .collect();
    let stats = engine.stats().await;
    engine.shutdown().await;

    let summary = serde_json::json!({
        "task_id": task_id,
        "stats": stats,
        "jobs": jobs,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
