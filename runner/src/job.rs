use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// How a job was handed to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    /// blocking execution
    Srun,
    /// queued for later execution
    Sbatch,
}

impl SubmissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Srun => "srun",
            Self::Sbatch => "sbatch",
        }
    }
}

/// Handle to a dispatched job.
/// Only the cluster dispatcher hands out job ids, all other dispatchers leave it empty.
/// A reference is never modified after it was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReference {
    job_id: Option<u64>,
    exit_code: Option<i32>,
    info: Map<String, Value>,
}

impl JobReference {
    pub fn new(job_id: Option<u64>, exit_code: Option<i32>) -> Self {
        Self {
            job_id,
            exit_code,
            info: Map::new(),
        }
    }

    pub fn with_info(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.info.insert(key.to_owned(), value.into());
        self
    }

    /// reference to a job executed on the local machine
    pub fn local(exit_code: Option<i32>) -> Self {
        Self::new(None, exit_code).with_info("on_slurm", false)
    }

    /// reference to a job handed to slurm
    pub fn slurm(job_id: Option<u64>, exit_code: Option<i32>, mode: SubmissionMode) -> Self {
        let mut reference = Self::new(job_id, exit_code)
            .with_info("on_slurm", true)
            .with_info("mode", mode.as_str());

        if let Some(id) = job_id {
            reference = reference.with_info("job_id", id);
        }
        if let Some(code) = exit_code {
            reference = reference.with_info("exit_code", code);
        }

        reference
    }

    /// reference to a call that was only captured, never executed
    pub fn captured() -> Self {
        Self::new(None, None).with_info("info", "test")
    }

    /// reference to a call that was buffered for a later bundled submission
    pub fn buffered() -> Self {
        Self::new(None, None)
    }

    pub fn job_id(&self) -> Option<u64> {
        self.job_id
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn info(&self) -> &Map<String, Value> {
        &self.info
    }
}

impl fmt::Display for JobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JobReference(job_id={:?}, exit_code={:?}, info={})",
            self.job_id,
            self.exit_code,
            Value::Object(self.info.clone())
        )
    }
}
