use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Pascal,
    Python2,
    Python3,
    Java,
}

impl Language {
    pub const ALL: &'static [Language] = &[
        Language::C,
        Language::Cpp,
        Language::Pascal,
        Language::Python2,
        Language::Python3,
        Language::Java,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Pascal => "pascal",
            Language::Python2 => "python2",
            Language::Python3 => "python3",
            Language::Java => "java",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown language: {0}")]
pub struct ParseLanguageError(String);

impl FromStr for Language {
    type Err = ParseLanguageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == s)
            .ok_or_else(|| ParseLanguageError(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SubmissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A program to be judged. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub language: Language,
    pub source: String,
    pub problem_id: String,
    pub time_limit: u64,   // milliseconds
    pub memory_limit: u64, // MiB
    pub created_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(
        language: Language,
        source: impl Into<String>,
        problem_id: impl Into<String>,
        time_limit: u64,
        memory_limit: u64,
    ) -> Self {
        Self {
            id: SubmissionId::new(),
            language,
            source: source.into(),
            problem_id: problem_id.into(),
            time_limit,
            memory_limit,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub position: usize,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Ok,
    TimeLimit,
    MemoryLimit,
    RuntimeError,
    CompileError,
    InternalError,
}

/// What one compile or run step produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub time: u64,      // cpu milliseconds
    pub real_time: u64, // milliseconds
    pub memory: u64,    // KiB
    #[serde(skip)]
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::InternalError,
            exit_code: None,
            signal: None,
            time: 0,
            real_time: 0,
            memory: 0,
            stdout: Vec::new(),
            stderr: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Queued,
    Judging,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompileError,
    InternalError,
    Cancelled,
}

impl VerdictStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, VerdictStatus::Queued | VerdictStatus::Judging)
    }

    fn rank(self) -> u8 {
        match self {
            VerdictStatus::Queued => 0,
            VerdictStatus::Judging => 1,
            _ => 2,
        }
    }

    /// QUEUED -> JUDGING -> terminal; terminal states never change.
    pub fn can_transition_to(self, next: VerdictStatus) -> bool {
        self.rank() < next.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerdictStatus::Queued => "QUEUED",
            VerdictStatus::Judging => "JUDGING",
            VerdictStatus::Accepted => "ACCEPTED",
            VerdictStatus::WrongAnswer => "WRONG_ANSWER",
            VerdictStatus::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            VerdictStatus::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            VerdictStatus::RuntimeError => "RUNTIME_ERROR",
            VerdictStatus::CompileError => "COMPILE_ERROR",
            VerdictStatus::InternalError => "INTERNAL_ERROR",
            VerdictStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub status: VerdictStatus,
    pub failed_case: Option<usize>,
    pub cases_run: usize,
    pub time: u64,   // max cpu milliseconds over the cases run
    pub memory: u64, // max KiB over the cases run
    pub compile_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Verdict {
    pub fn new(status: VerdictStatus) -> Self {
        Self {
            status,
            failed_case: None,
            cases_run: 0,
            time: 0,
            memory: 0,
            compile_message: None,
            updated_at: Utc::now(),
        }
    }
}
