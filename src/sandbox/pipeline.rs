use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::languages::runner_for;
use super::supervisor::{ProcessSupervisor, StageOutcome, StageSpec};
use crate::config::MonitorConfig;
use crate::events::{EventBus, EventPublisher, InputSubscription, JobEvents};
use crate::job::{Job, JobError, JobState};
use crate::registry::JobRegistry;

/// Turns a validated job into compile/run stages and publishes everything it observes
///
/// One pipeline belongs to one worker. Jobs go through it strictly one at a
/// time; it shares the worker's registry with the inbound event router.
#[derive(Clone)]
pub struct ExecutionPipeline {
    bus: Arc<dyn EventBus>,
    registry: JobRegistry,
    monitor: MonitorConfig,
    compile_timeout: Duration,
    jobs_dir: PathBuf,
}

impl ExecutionPipeline {
    pub fn new(bus: Arc<dyn EventBus>, registry: JobRegistry, jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            registry,
            monitor: MonitorConfig::default(),
            compile_timeout: Duration::from_secs(30),
            jobs_dir: jobs_dir.into(),
        }
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub(super) fn compile_timeout(&self) -> Duration {
        self.compile_timeout
    }

    /// Runs `job` to a terminal state. Every event is handed to the bus before this returns.
    pub async fn execute(&self, job: &Job) -> Result<JobState, JobError> {
        let publisher = EventPublisher::spawn(self.bus.clone(), &job.job_id);
        let events = publisher.events();

        let result = self.drive(job, &events).await;
        if !events.terminal_sent() {
            let reason = match &result {
                Err(e) => e.to_string(),
                Ok(state) => format!("job ended in state {state:?} without an outcome"),
            };
            log::error!("Job {} failed: {reason}", job.job_id);
            events.termination(reason, 0).await;
        }

        drop(events);
        publisher.close().await;
        result
    }

    /// Publishes the single TERMINATION for a submission that never made it to a job
    pub async fn reject(&self, job_id: &str, error: &JobError) {
        log::warn!("Rejecting job {job_id}: {error}");
        let publisher = EventPublisher::spawn(self.bus.clone(), job_id);
        let events = publisher.events();
        events.termination(error.to_string(), 0).await;
        drop(events);
        publisher.close().await;
    }

    async fn drive(&self, job: &Job, events: &JobEvents) -> Result<JobState, JobError> {
        let mut state = JobState::Created;
        let runner = runner_for(job.language);
        let workdir = self.prepare_workspace(job, &runner.source_file(&job.file_name)).await?;

        if let Some(compiler) = runner.as_compilable() {
            transition(&job.job_id, &mut state, JobState::Compiling);
            match self.compile_source(job, compiler, &workdir, events).await? {
                StageOutcome::Compiled => {}
                StageOutcome::Terminated { .. } => {
                    transition(&job.job_id, &mut state, JobState::Terminated);
                    return Ok(state);
                }
                _ => {
                    transition(&job.job_id, &mut state, JobState::CompileFailed);
                    return Ok(state);
                }
            }
        }

        transition(&job.job_id, &mut state, JobState::Running);
        let spec = StageSpec::run(runner.run_command(&job.file_name), &workdir);
        let next = match self.run_stage(&job.job_id, spec, events).await? {
            StageOutcome::Exited { exit_code: 0 } => JobState::Completed,
            StageOutcome::Terminated { .. } => JobState::Terminated,
            _ => JobState::RunFailed,
        };
        transition(&job.job_id, &mut state, next);
        Ok(state)
    }

    /// Creates `<jobs_dir>/<job_id>/` and writes the source file into it
    async fn prepare_workspace(&self, job: &Job, source_file: &str) -> Result<PathBuf, JobError> {
        let workdir = self.jobs_dir.join(&job.job_id);
        tokio::fs::create_dir_all(&workdir).await?;
        tokio::fs::write(workdir.join(source_file), &job.source_code).await?;
        log::debug!("Wrote {source_file} for job {} to {}", job.job_id, workdir.display());
        Ok(workdir)
    }

    /// Runs one stage with the job's input channel attached for exactly its lifetime
    pub(super) async fn run_stage(
        &self,
        job_id: &str,
        spec: StageSpec,
        events: &JobEvents,
    ) -> Result<StageOutcome, JobError> {
        // The stage never runs without its input channel attached
        let subscription =
            InputSubscription::open(self.bus.as_ref(), self.registry.clone(), job_id).await?;

        let supervisor =
            ProcessSupervisor::new(self.registry.clone(), events.clone(), self.monitor.clone());
        let outcome = match supervisor.start(spec) {
            Ok(stage) => stage.wait().await,
            Err(e) => {
                subscription.close().await;
                return Err(e);
            }
        };

        subscription.close().await;
        Ok(outcome)
    }
}

fn transition(job_id: &str, state: &mut JobState, next: JobState) {
    if !state.can_transition_to(next) {
        log::warn!("Unexpected transition of job {job_id}: {state:?} -> {next:?}");
    }
    log::info!("Job {job_id}: {state:?} -> {next:?}");
    *state = next;
}
