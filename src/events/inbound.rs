use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BusError, EventBus, InboundEvent, SESSION_CLOSED_REASON, input_channel};
use crate::registry::JobRegistry;

/// Active subscription to `input:<job_id>` for the duration of one stage
///
/// Dropping the subscription releases it as well, so no exit path of a stage
/// leaves a listener behind.
pub struct InputSubscription {
    job_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl InputSubscription {
    /// Subscribes and starts routing inbound events to the job's running stage
    pub async fn open(
        bus: &dyn EventBus,
        registry: JobRegistry,
        job_id: &str,
    ) -> Result<Self, BusError> {
        let mut stream = bus.subscribe(&input_channel(job_id)).await?;
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let job_id = job_id.to_string();
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        payload = stream.next() => match payload {
                            Some(payload) => route_inbound(&registry, &job_id, &payload),
                            None => {
                                log::warn!("Input channel of job {job_id} closed by the bus");
                                break;
                            }
                        }
                    }
                }
                log::debug!("Stopped listening for input of job {job_id}");
            }
        });

        Ok(Self {
            job_id: job_id.to_string(),
            cancel,
            task: Some(task),
        })
    }

    /// Unsubscribes and waits for the listener to stop
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Input listener of job {} failed: {e}", self.job_id);
            }
        }
    }
}

impl Drop for InputSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Delivers one inbound payload to the stage currently registered for `job_id`
pub fn route_inbound(registry: &JobRegistry, job_id: &str, payload: &str) {
    let event = match serde_json::from_str::<InboundEvent>(payload) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("Ignoring malformed input event for job {job_id}: {e}");
            return;
        }
    };

    // The job may have finished already
    let Some(handle) = registry.get(job_id) else {
        log::debug!("No running stage for job {job_id}, {event:?} ignored");
        return;
    };

    match event {
        InboundEvent::InputEvent { content } => {
            log::debug!("Forwarding {} byte(s) of input to job {job_id}", content.len());
            handle.write(content.into_bytes());
        }
        InboundEvent::SessionClosedEvent => {
            log::info!("Session of job {job_id} closed by client");
            handle.kill(SESSION_CLOSED_REASON);
        }
    }
}
