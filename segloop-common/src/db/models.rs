//! Database row models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub created_at: i64,
    pub last_login: Option<i64>,
    pub is_active: bool,
    pub platform_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub job_id: String,
    pub username: Option<String>,
    pub archive_name: String,
    pub config: String,
    pub dataset_id: String,
    pub status: JobStatus,
    pub created_at: i64,
}

/// Lifecycle of an upload or inference job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Internal(format!("Unknown job status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceJob {
    pub job_id: String,
    pub username: Option<String>,
    pub config: String,
    pub dataset_id: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

/// One raw channel file of an ingested case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseChannel {
    pub job_id: String,
    pub case_name: String,
    pub channel: u32,
    pub dataset_id: String,
    pub raw_path: String,
    pub png_dir: Option<String>,
}

/// Annotation task created on the platform from an inference result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedTask {
    pub task_id: i64,
    pub task_name: String,
    pub nifti_id: String,
    pub job_id: String,
    pub case_name: String,
    pub dataset_id: String,
    pub created_at: i64,
    pub inserted_case_id: Option<String>,
    pub inserted_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
