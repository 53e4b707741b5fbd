use std::fmt;

/// Program and arguments of one stage, resolved against the job workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A language whose source can be started as a process
///
/// File names passed in are bare names without extension; the source lives at
/// [`Runnable::source_file`] inside the job workspace, which is also the
/// working directory of every stage.
pub trait Runnable: Send + Sync {
    /// Extension of the source file, without the dot
    fn extension(&self) -> &'static str;

    /// Command that starts the program of `file_name`
    fn run_command(&self, file_name: &str) -> StageCommand;

    fn source_file(&self, file_name: &str) -> String {
        format!("{file_name}.{}", self.extension())
    }
}

/// A language that needs a build step before it can run
pub trait Compilable: Runnable {
    /// Command that builds `file_name` into something [`Runnable::run_command`] can start
    fn compile_command(&self, file_name: &str) -> StageCommand;
}

/// Per-language strategy driven by the execution pipeline
pub trait LanguageRunner: Runnable {
    /// The compile capability, if the language has one
    fn as_compilable(&self) -> Option<&dyn Compilable> {
        None
    }
}
