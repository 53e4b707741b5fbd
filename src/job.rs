use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::BusError;

/// Job description as it arrives on the work queue
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobMessage {
    pub job_id: String,
    pub file_name: String,
    pub source_code: String,
    pub language: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    Java,
    Python,
}

/// How a language gets from source to a running process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageKind {
    CompiledNative,
    CompiledBytecode,
    Interpreted,
}

impl Language {
    pub fn kind(&self) -> LanguageKind {
        match self {
            Self::Cpp => LanguageKind::CompiledNative,
            Self::Java => LanguageKind::CompiledBytecode,
            Self::Python => LanguageKind::Interpreted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpp => "cpp",
            Self::Java => "java",
            Self::Python => "python",
        }
    }
}

impl FromStr for Language {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpp" | "c++" => Ok(Self::Cpp),
            "java" => Ok(Self::Java),
            "python" | "python3" => Ok(Self::Python),
            other => Err(JobError::Submission(format!("unsupported language `{other}`"))),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated submission. Immutable once accepted.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub language: Language,
    pub file_name: String,
    pub source_code: String,
}

impl TryFrom<JobMessage> for Job {
    type Error = JobError;

    fn try_from(message: JobMessage) -> Result<Self, Self::Error> {
        check_identifier("job_id", &message.job_id)?;
        check_identifier("file_name", &message.file_name)?;
        let language = message.language.parse()?;

        Ok(Self {
            job_id: message.job_id,
            language,
            file_name: message.file_name,
            source_code: message.source_code,
        })
    }
}

/// Job ids and file names end up as path components and shell-free argv entries
fn check_identifier(field: &str, value: &str) -> Result<(), JobError> {
    if value.is_empty() {
        return Err(JobError::Submission(format!("{field} must not be empty")));
    }
    if value.len() > 128 {
        return Err(JobError::Submission(format!("{field} is too long")));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(JobError::Submission(format!(
            "{field} `{value}` may only contain ASCII letters, digits, `-` and `_`"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Compiling,
    CompileFailed,
    Running,
    Completed,
    RunFailed,
    Terminated,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompileFailed | Self::Completed | Self::RunFailed | Self::Terminated
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Compiling)
                | (Created, Running)
                | (Created, Terminated)
                | (Compiling, CompileFailed)
                | (Compiling, Running)
                | (Compiling, Terminated)
                | (Running, Completed)
                | (Running, RunFailed)
                | (Running, Terminated)
        )
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid submission: {0}")]
    Submission(String),

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("event bus error: {0}")]
    Transport(#[from] BusError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(job_id: &str, file_name: &str, language: &str) -> JobMessage {
        JobMessage {
            job_id: job_id.to_string(),
            file_name: file_name.to_string(),
            source_code: "print('hi')".to_string(),
            language: language.to_string(),
        }
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("cpp".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("C++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("python3".parse::<Language>().unwrap(), Language::Python);
        assert_eq!(Language::Java.kind(), LanguageKind::CompiledBytecode);
        assert!(matches!(
            "brainfuck".parse::<Language>(),
            Err(JobError::Submission(_))
        ));
    }

    #[test]
    fn test_job_validation() {
        let job = Job::try_from(message("4f1c-aa_2", "Main", "java")).unwrap();
        assert_eq!(job.language, Language::Java);
        assert_eq!(job.file_name, "Main");

        for (job_id, file_name) in [("", "main"), ("job", "../etc/passwd"), ("a/b", "main")] {
            let err = Job::try_from(message(job_id, file_name, "python")).unwrap_err();
            assert!(matches!(err, JobError::Submission(_)), "{job_id} {file_name}");
        }
    }

    #[test]
    fn test_state_transitions() {
        assert!(JobState::Created.can_transition_to(JobState::Running));
        assert!(JobState::Compiling.can_transition_to(JobState::CompileFailed));
        assert!(!JobState::CompileFailed.can_transition_to(JobState::Running));
        assert!(!JobState::Completed.can_transition_to(JobState::Terminated));
        assert!(JobState::RunFailed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }
}
