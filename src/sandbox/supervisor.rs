use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::monitor::{Breach, IdleWatch, ResourceMonitor};
use super::pty::{self, ExitInfo, PtyProcess, SpawnedPty};
use super::runner::StageCommand;
use crate::config::MonitorConfig;
use crate::events::{EventType, JobEvents};
use crate::job::JobError;
use crate::registry::JobRegistry;

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// How long output is still collected after the process has exited
const DRAIN_GRACE: Duration = Duration::from_millis(250);

const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Write(Vec<u8>),
    Kill(String),
}

/// Cheap, cloneable reference to a running stage
///
/// This is what the registry stores. It never owns the process; messages are
/// handled by the stage's supervisor task and silently dropped once it has
/// finished.
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    stage_id: u64,
    control: mpsc::UnboundedSender<Control>,
}

impl SupervisorHandle {
    fn channel() -> (Self, mpsc::UnboundedReceiver<Control>) {
        let (control, rx) = mpsc::unbounded_channel();
        let handle = Self {
            stage_id: NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed),
            control,
        };
        (handle, rx)
    }

    /// A handle not attached to any process; the receiver shows what was sent
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Control>) {
        Self::channel()
    }

    pub fn stage_id(&self) -> u64 {
        self.stage_id
    }

    /// Forwards bytes to the process stdin. False if the stage is already over.
    pub fn write(&self, bytes: Vec<u8>) -> bool {
        self.control.send(Control::Write(bytes)).is_ok()
    }

    /// Requests termination. Only the first request of a stage has an effect.
    pub fn kill(&self, reason: impl Into<String>) -> bool {
        self.control.send(Control::Kill(reason.into())).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Compile,
    Run,
}

impl StageKind {
    /// A PTY merges both streams, so the stage decides how output is labelled
    fn output_type(self) -> EventType {
        match self {
            Self::Compile => EventType::Stderr,
            Self::Run => EventType::Stdout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageSpec {
    pub kind: StageKind,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub wall_limit: Option<Duration>,
}

impl StageSpec {
    pub fn run(command: StageCommand, cwd: impl Into<PathBuf>) -> Self {
        Self {
            kind: StageKind::Run,
            program: command.program,
            args: command.args,
            cwd: cwd.into(),
            wall_limit: None,
        }
    }

    pub fn compile(command: StageCommand, cwd: impl Into<PathBuf>, limit: Duration) -> Self {
        Self {
            kind: StageKind::Compile,
            program: command.program,
            args: command.args,
            cwd: cwd.into(),
            wall_limit: Some(limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Compiled,
    CompileFailed { exit_code: i32 },
    Exited { exit_code: i32 },
    Terminated { reason: String },
}

/// Starts stage processes and supervises them until they settle
pub struct ProcessSupervisor {
    registry: JobRegistry,
    events: JobEvents,
    monitor: MonitorConfig,
}

impl ProcessSupervisor {
    pub fn new(registry: JobRegistry, events: JobEvents, monitor: MonitorConfig) -> Self {
        Self {
            registry,
            events,
            monitor,
        }
    }

    /// Spawns the stage process and hands it to a supervisor task
    pub fn start(self, spec: StageSpec) -> Result<RunningStage, JobError> {
        let job_id = self.events.job_id().to_string();
        let SpawnedPty {
            process,
            output,
            exit,
        } = pty::spawn(&spec.program, &spec.args, &spec.cwd).map_err(|source| {
            JobError::Spawn {
                program: spec.program.clone(),
                source,
            }
        })?;

        let (handle, control) = SupervisorHandle::channel();
        self.registry.insert(&job_id, handle.clone());
        let entry = RegistryEntry {
            registry: self.registry,
            job_id: job_id.clone(),
            stage_id: handle.stage_id,
            released: false,
        };
        log::info!(
            "Started {:?} stage {} of job {job_id} (pid {:?}): {} {}",
            spec.kind,
            handle.stage_id,
            process.pid(),
            spec.program,
            spec.args.join(" ")
        );

        let monitor = match (spec.kind, process.pid()) {
            (StageKind::Run, Some(pid)) if self.monitor.enable_resource_monitoring => {
                Some(ResourceMonitor::new(pid, &self.monitor))
            }
            _ => None,
        };
        let now = Instant::now();
        let actor = StageActor {
            kind: spec.kind,
            events: self.events,
            process,
            entry,
            started: now,
            lines: 0,
            max_output_lines: self.monitor.max_output_lines,
            idle: IdleWatch::new(self.monitor.idle_timeout.into(), now),
        };
        let timers = Timers {
            monitor,
            resource_period: self.monitor.cpu_check_interval.into(),
            idle_period: (spec.kind == StageKind::Run)
                .then_some(self.monitor.idle_check_interval.into()),
            wall_limit: spec.wall_limit,
        };

        let task = tokio::spawn(actor.run(control, output, exit, timers));
        Ok(RunningStage { handle, task })
    }
}

/// A stage that has been started; [`RunningStage::wait`] yields its outcome
pub struct RunningStage {
    handle: SupervisorHandle,
    task: JoinHandle<StageOutcome>,
}

impl RunningStage {
    pub fn handle(&self) -> &SupervisorHandle {
        &self.handle
    }

    pub async fn wait(self) -> StageOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Supervisor of stage {} failed: {e}", self.handle.stage_id);
                StageOutcome::Terminated {
                    reason: format!("supervisor failed: {e}"),
                }
            }
        }
    }
}

/// Removes the stage's registry entry exactly once, at the latest on drop
struct RegistryEntry {
    registry: JobRegistry,
    job_id: String,
    stage_id: u64,
    released: bool,
}

impl RegistryEntry {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.remove(&self.job_id, self.stage_id);
        }
    }
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        self.release();
    }
}

struct Timers {
    monitor: Option<ResourceMonitor>,
    resource_period: Duration,
    idle_period: Option<Duration>,
    wall_limit: Option<Duration>,
}

struct StageActor {
    kind: StageKind,
    events: JobEvents,
    process: PtyProcess,
    entry: RegistryEntry,
    started: Instant,
    lines: u64,
    max_output_lines: u64,
    idle: IdleWatch,
}

impl StageActor {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut output: mpsc::Receiver<String>,
        mut exit: oneshot::Receiver<ExitInfo>,
        timers: Timers,
    ) -> StageOutcome {
        let Timers {
            mut monitor,
            resource_period,
            idle_period,
            wall_limit,
        } = timers;
        let mut resource_tick = ticker(resource_period);
        let mut idle_tick = ticker(idle_period.unwrap_or(MIN_TICK));
        let deadline = tokio::time::sleep(wall_limit.unwrap_or_default());
        tokio::pin!(deadline);

        let mut control_open = true;
        let mut output_open = true;

        loop {
            tokio::select! {
                biased;

                message = control.recv(), if control_open => match message {
                    Some(Control::Write(bytes)) => {
                        log::trace!("Writing {} byte(s) to job {}", bytes.len(), self.events.job_id());
                        self.process.write(bytes);
                    }
                    Some(Control::Kill(reason)) => return self.kill(reason).await,
                    None => control_open = false,
                },

                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => {
                        if let Err(reason) = self.on_output(chunk).await {
                            return self.kill(reason).await;
                        }
                    }
                    None => output_open = false,
                },

                status = &mut exit => {
                    let exit_code = match status {
                        Ok(info) => info.exit_code,
                        Err(_) => {
                            log::error!("Exit status of job {} was lost", self.events.job_id());
                            -1
                        }
                    };
                    return self.on_exit(exit_code, output, output_open).await;
                }

                _ = resource_tick.tick(), if monitor.is_some() => {
                    if let Some(breach) = monitor.as_mut().and_then(|m| m.check(Instant::now())) {
                        return self.breach(breach).await;
                    }
                }

                _ = idle_tick.tick(), if idle_period.is_some() => {
                    let now = Instant::now();
                    if self.idle.is_idle(now) {
                        let breach = Breach::Idle { silent_for: self.idle.silent_for(now) };
                        return self.breach(breach).await;
                    }
                }

                _ = &mut deadline, if wall_limit.is_some() => {
                    let limit = wall_limit.unwrap_or_default();
                    let reason = format!(
                        "time limit exceeded: stage ran longer than {} ms",
                        limit.as_millis()
                    );
                    return self.kill(reason).await;
                }
            }
        }
    }

    /// Counts and forwards one chunk, or returns the kill reason if it breaks the line limit
    async fn on_output(&mut self, chunk: String) -> Result<(), String> {
        self.idle.touch(Instant::now());
        self.lines += chunk.matches('\n').count() as u64 + 1;
        if self.lines > self.max_output_lines {
            return Err(format!(
                "output lines limit exceeded: more than {} lines",
                self.max_output_lines
            ));
        }

        self.events.output(self.kind.output_type(), chunk).await;
        Ok(())
    }

    async fn breach(self, breach: Breach) -> StageOutcome {
        log::warn!("Job {} breached its limits: {breach}", self.events.job_id());
        self.kill(breach.to_string()).await
    }

    async fn kill(mut self, reason: String) -> StageOutcome {
        self.process.kill();
        let elapsed = self.elapsed_ms();
        log::info!(
            "Terminated {:?} stage of job {} after {elapsed} ms: {reason}",
            self.kind,
            self.events.job_id()
        );

        self.events.termination(reason.clone(), elapsed).await;
        self.entry.release();
        StageOutcome::Terminated { reason }
    }

    async fn on_exit(
        mut self,
        exit_code: i32,
        mut output: mpsc::Receiver<String>,
        output_open: bool,
    ) -> StageOutcome {
        let elapsed = self.elapsed_ms();

        if output_open {
            let grace = tokio::time::sleep(DRAIN_GRACE);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    chunk = output.recv() => match chunk {
                        Some(chunk) => {
                            if let Err(reason) = self.on_output(chunk).await {
                                return self.kill(reason).await;
                            }
                        }
                        None => break,
                    },
                    _ = &mut grace => {
                        log::debug!("Output of job {} still open after exit", self.events.job_id());
                        break;
                    }
                }
            }
        }

        // Background children of the program share its group and outlive it otherwise
        self.process.kill();
        self.entry.release();
        log::info!(
            "{:?} stage of job {} exited with code {exit_code} after {elapsed} ms",
            self.kind,
            self.events.job_id()
        );

        match self.kind {
            StageKind::Compile if exit_code == 0 => StageOutcome::Compiled,
            StageKind::Compile => {
                self.events.completion(exit_code, elapsed).await;
                StageOutcome::CompileFailed { exit_code }
            }
            StageKind::Run => {
                self.events.completion(exit_code, elapsed).await;
                StageOutcome::Exited { exit_code }
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_TICK);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
