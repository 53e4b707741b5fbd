use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use runner::config::{CliArgs, Config};
use runner::events::RedisBus;
use runner::queue::RedisQueue;
use runner::registry::JobRegistry;
use runner::sandbox::ExecutionPipeline;
use runner::worker::{requeue_abandoned, worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let n_workers = cli.workers;
    if n_workers == 0 {
        anyhow::bail!("The number of workers must not be 0");
    }

    let Config {
        redis: redis_config,
        queue: queue_config,
        workspace: workspace_config,
        monitor: monitor_config,
        compile: compile_config,
    } = cli.to_config().context("Failed to load configuration")?;

    let jobs_dir = workspace_config.resolve_jobs_dir();
    std::fs::create_dir_all(&jobs_dir)
        .with_context(|| format!("Failed to create jobs directory {}", jobs_dir.display()))?;
    log::info!("Job workspaces live in {}", jobs_dir.display());

    let client = redis::Client::open(redis_config.url.as_str()).context("Invalid redis url")?;
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    // Workers share nothing mutable: each gets its own connections and registry
    let mut workers = JoinSet::new();
    for i in 1..=n_workers {
        let bus = RedisBus::connect(client.clone())
            .await
            .context("Failed to connect the event bus")?;
        let queue = RedisQueue::connect(client.clone(), &queue_config.name)
            .await
            .context("Failed to connect the work queue")?;
        let pipeline = ExecutionPipeline::new(Arc::new(bus), JobRegistry::new(), &jobs_dir)
            .with_monitor(monitor_config.clone())
            .with_compile_timeout(compile_config.timeout.into());

        workers.spawn(worker(
            i,
            Arc::new(queue),
            pipeline,
            queue_config.clone(),
            shutdown_token.clone(),
        ));
    }

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 2. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Err(e)) => log::error!("Worker finished with error: {e:?}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {:?}", e),
            Err(e) => log::error!("Worker handle finished with error: {:?}", e),
            Ok(Ok(())) => {}
        }
    }

    // 3. Hand back messages whose receive was cut short by the shutdown
    match RedisQueue::connect(client, &queue_config.name).await {
        Ok(queue) => {
            requeue_abandoned(&queue).await;
        }
        Err(e) => log::error!("Failed to reconnect the work queue: {e}"),
    }

    log::info!("Shutdown complete");
    Ok(())
}
