mod compile;
mod languages;
mod monitor;
mod pipeline;
mod pty;
mod runner;
mod supervisor;

// Re-export the traits and common types
pub use languages::{Cpp, Java, Python, runner_for};
pub use monitor::{Breach, CpuWatch, IdleWatch, ProcessSampler, ResourceMonitor, Sample};
pub use pipeline::ExecutionPipeline;
pub use runner::{Compilable, LanguageRunner, Runnable, StageCommand};
pub use supervisor::{
    Control, ProcessSupervisor, RunningStage, StageKind, StageOutcome, StageSpec,
    SupervisorHandle,
};
