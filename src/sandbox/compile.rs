use std::path::Path;

use super::pipeline::ExecutionPipeline;
use super::runner::Compilable;
use super::supervisor::{StageOutcome, StageSpec};
use crate::events::JobEvents;
use crate::job::{Job, JobError};

impl ExecutionPipeline {
    /// Builds the job's source in its workspace
    ///
    /// Compiler diagnostics are published as STDERR. A successful build is
    /// silent; a failed one ends with a COMPLETION carrying the compiler's exit
    /// code. The compiler runs under a wall-clock limit only.
    pub(super) async fn compile_source(
        &self,
        job: &Job,
        compiler: &dyn Compilable,
        workdir: &Path,
        events: &JobEvents,
    ) -> Result<StageOutcome, JobError> {
        let command = compiler.compile_command(&job.file_name);
        log::debug!("Compiling job {}: {command}", job.job_id);

        let spec = StageSpec::compile(command, workdir, self.compile_timeout());
        let outcome = self.run_stage(&job.job_id, spec, events).await?;

        match &outcome {
            StageOutcome::Compiled => log::info!("Job {} compiled", job.job_id),
            StageOutcome::CompileFailed { exit_code } => {
                log::info!("Compilation of job {} failed with code {exit_code}", job.job_id)
            }
            other => log::warn!("Compilation of job {} ended with {other:?}", job.job_id),
        }
        Ok(outcome)
    }
}
