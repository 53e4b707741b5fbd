use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{EventBus, EventType, OutboundEvent, job_channel};

/// Events buffered per job before producers wait on the sender task
const EVENT_BUFFER: usize = 256;

/// Ordered outbound channel of one job
///
/// Producers enqueue through [`JobEvents`] handles; a single sender task
/// publishes the events to the bus one at a time, so observers see them in the
/// order they were produced.
pub struct EventPublisher {
    events: JobEvents,
    task: JoinHandle<()>,
}

impl EventPublisher {
    pub fn spawn(bus: Arc<dyn EventBus>, job_id: &str) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(drain(bus, job_channel(job_id), rx));

        Self {
            events: JobEvents {
                job_id: job_id.into(),
                tx,
                terminal_sent: Arc::new(AtomicBool::new(false)),
            },
            task,
        }
    }

    pub fn events(&self) -> JobEvents {
        self.events.clone()
    }

    /// Waits until every queued event has been handed to the bus.
    ///
    /// All [`JobEvents`] clones must have been dropped, otherwise this waits for them.
    pub async fn close(self) {
        let Self { events, task } = self;
        let job_id = events.job_id.clone();
        drop(events);

        if let Err(e) = task.await {
            log::error!("Event sender of job {job_id} failed: {e}");
        }
    }
}

/// Producer side of a job's event channel
#[derive(Clone)]
pub struct JobEvents {
    job_id: Arc<str>,
    tx: mpsc::Sender<OutboundEvent>,
    terminal_sent: Arc<AtomicBool>,
}

impl JobEvents {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn output(&self, kind: EventType, content: String) {
        self.send(OutboundEvent::output(&self.job_id, kind, content))
            .await;
    }

    pub async fn completion(&self, exit_code: i32, execution_time: u64) {
        self.send(OutboundEvent::completion(
            &self.job_id,
            exit_code,
            execution_time,
        ))
        .await;
    }

    pub async fn termination(&self, reason: String, execution_time: u64) {
        self.send(OutboundEvent::termination(
            &self.job_id,
            reason,
            execution_time,
        ))
        .await;
    }

    /// Whether COMPLETION or TERMINATION has already been queued
    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    async fn send(&self, event: OutboundEvent) {
        // Nothing may follow the terminal event of a job
        let already_terminal = if event.is_terminal() {
            self.terminal_sent.swap(true, Ordering::SeqCst)
        } else {
            self.terminal_sent.load(Ordering::SeqCst)
        };
        if already_terminal {
            log::debug!(
                "Dropping {:?} event of job {} after its terminal event",
                event.kind,
                self.job_id
            );
            return;
        }

        log::trace!("Queueing {:?} event of job {}", event.kind, self.job_id);
        if self.tx.send(event).await.is_err() {
            log::error!("Event sender of job {} is gone", self.job_id);
        }
    }
}

async fn drain(bus: Arc<dyn EventBus>, channel: String, mut rx: mpsc::Receiver<OutboundEvent>) {
    while let Some(event) = rx.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode {:?} event for {channel}: {e}", event.kind);
                continue;
            }
        };

        if let Err(e) = bus.publish(&channel, payload).await {
            log::error!("Failed to publish {:?} event on {channel}: {e}", event.kind);
        }
    }
    log::debug!("Event sender for {channel} finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryBus;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_events_keep_production_order() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = EventPublisher::spawn(bus.clone(), "job-1");
        let events = publisher.events();

        let producer = {
            let events = events.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    events.output(EventType::Stdout, format!("{i}\n")).await;
                }
            })
        };
        producer.await.unwrap();
        events.completion(0, 12).await;
        drop(events);
        publisher.close().await;

        let published = bus.events("job-1");
        assert_eq!(published.len(), 501);
        for (i, event) in published[..500].iter().enumerate() {
            assert_eq!(event.text(), Some(format!("{i}\n").as_str()));
        }
        assert_eq!(published[500], OutboundEvent::completion("job-1", 0, 12));
    }

    #[tokio::test]
    async fn test_nothing_follows_terminal_event() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = EventPublisher::spawn(bus.clone(), "job-2");
        let events = publisher.events();

        events.output(EventType::Stdout, "before".into()).await;
        events.termination("memory limit exceeded".into(), 5).await;
        events.output(EventType::Stdout, "after".into()).await;
        events.completion(0, 6).await;
        assert!(events.terminal_sent());
        drop(events);
        publisher.close().await;

        let kinds: Vec<EventType> = bus.events("job-2").iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventType::Stdout, EventType::Termination]);
    }
}
