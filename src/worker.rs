use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::job::{Job, JobError, JobMessage};
use crate::queue::{QueueMessage, WorkQueue};
use crate::sandbox::ExecutionPipeline;

pub async fn worker(
    id: u8,
    queue: Arc<dyn WorkQueue>,
    pipeline: ExecutionPipeline,
    config: QueueConfig,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let wait = std::time::Duration::from_secs(config.wait_seconds);
    log::info!("Worker {id} initialized, polling {}", config.name);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            // Dropping a pending receive can leave a message parked as
            // unacknowledged; `requeue_abandoned` returns it after shutdown
            received = queue.receive(wait) => match received {
                Ok(Some(message)) => {
                    // A job in flight is allowed to settle before the next poll
                    process_message(id, queue.as_ref(), &pipeline, message).await;
                }
                Ok(None) => log::trace!("Worker {id} found no message"),
                Err(e) => {
                    log::error!("Worker {id} failed to receive from {}: {e}", config.name);
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(config.retry_delay.into()) => {}
                    }
                }
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// Returns messages that were received but never acknowledged to the queue
///
/// Run once after every worker sharing `queue` has stopped.
pub async fn requeue_abandoned(queue: &dyn WorkQueue) -> usize {
    match queue.requeue_unacknowledged().await {
        Ok(0) => 0,
        Ok(count) => {
            log::warn!("Returned {count} unacknowledged message(s) to the queue");
            count
        }
        Err(e) => {
            log::error!("Failed to return unacknowledged messages to the queue: {e}");
            0
        }
    }
}

async fn process_message(
    id: u8,
    queue: &dyn WorkQueue,
    pipeline: &ExecutionPipeline,
    message: QueueMessage,
) {
    // Delivery is at most once: the message is gone before the job starts
    if let Err(e) = queue.delete(&message).await {
        log::error!("Worker {id} failed to delete message, running it anyway: {e}");
    }

    let job = match decode_job(&message.body) {
        Ok(job) => job,
        Err(Rejected { job_id: Some(job_id), error }) => {
            pipeline.reject(&job_id, &error).await;
            return;
        }
        Err(Rejected { job_id: None, error }) => {
            log::error!("Worker {id} dropped a message without job id: {error}");
            return;
        }
    };

    log::info!(
        "Worker {id} got job {} ({} {:?}, {})",
        job.job_id,
        job.language,
        job.language.kind(),
        job.file_name
    );
    match pipeline.execute(&job).await {
        Ok(state) => log::info!("Job {} finished on worker {id}: {state:?}", job.job_id),
        Err(e) => log::error!("Job {} failed on worker {id}: {e}", job.job_id),
    }
}

#[derive(Debug)]
struct Rejected {
    job_id: Option<String>,
    error: JobError,
}

/// Parses a queue body; failures keep the job id when one could be read
fn decode_job(body: &str) -> Result<Job, Rejected> {
    let value: Value = serde_json::from_str(body).map_err(|e| Rejected {
        job_id: None,
        error: JobError::Submission(format!("body is not JSON: {e}")),
    })?;

    let job_id = value
        .get("job_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let message: JobMessage = serde_json::from_value(value).map_err(|e| Rejected {
        job_id: job_id.clone(),
        error: JobError::Submission(e.to_string()),
    })?;

    Job::try_from(message).map_err(|error| Rejected { job_id, error })
}
