use crate::common::{Language, SubmissionId};

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmissionRequest {
    pub language: Language,

    #[validate(length(min = 1, max = 65536))]
    pub source: String,

    #[validate(length(min = 1, max = 64))]
    pub problem_id: String,

    #[validate(range(min = 1, max = 60000))]
    pub time_limit: Option<u64>, // milliseconds

    #[validate(range(min = 1, max = 4096))]
    pub memory_limit: Option<u64>, // MiB
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSubmissionOutput {
    pub id: SubmissionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemInfo {
    pub id: String,
    pub name: String,
    pub time_limit: u64,
    pub memory_limit: u64,
    pub test_count: usize,
}
