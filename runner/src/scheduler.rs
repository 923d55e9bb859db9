use crate::options::Options;
use std::{
    fmt,
    path::PathBuf,
    process::{Command, Stdio},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to run {0:?}")]
    Spawn(PathBuf, #[source] std::io::Error),
    #[error("Submission failed ({status}): {stderr}")]
    Submission { status: String, stderr: String },
    #[error("Unable to parse the job id from the sbatch output {0:?}")]
    InvalidJobId(String),
    #[error("srun was terminated by a signal")]
    Terminated,
}

/// Talks to the cluster scheduler
pub trait SchedulerClient: fmt::Debug {
    /// queue `command` and return its job id
    fn sbatch(&mut self, options: &Options, command: &str) -> Result<u64, SchedulerError>;

    /// run `command` and wait for it, returns the exit code
    fn srun(&mut self, options: &Options, command: &str) -> Result<i32, SchedulerError>;
}

/// Parse the output of `sbatch --parsable` (`<id>` or `<id>;<cluster>`).
/// The human readable `Submitted batch job <id>` is accepted as well.
pub fn parse_job_id(output: &str) -> Result<u64, SchedulerError> {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();

    line.split(';')
        .next()
        .and_then(|first| first.split_whitespace().last())
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| SchedulerError::InvalidJobId(output.to_owned()))
}

/// Client using the `sbatch` and `srun` command line tools
#[derive(Debug, Clone)]
pub struct CommandLineClient {
    sbatch: PathBuf,
    srun: PathBuf,
}

impl Default for CommandLineClient {
    fn default() -> Self {
        Self::with_programs("sbatch", "srun")
    }
}

impl CommandLineClient {
    pub fn with_programs(sbatch: impl Into<PathBuf>, srun: impl Into<PathBuf>) -> Self {
        Self {
            sbatch: sbatch.into(),
            srun: srun.into(),
        }
    }
}

impl SchedulerClient for CommandLineClient {
    fn sbatch(&mut self, options: &Options, command: &str) -> Result<u64, SchedulerError> {
        let args = options.to_sbatch_args();
        debug!("Running {:?} --parsable {args:?} --wrap {command:?}", self.sbatch);

        let output = Command::new(&self.sbatch)
            .arg("--parsable")
            .args(&args)
            .arg("--wrap")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|error| SchedulerError::Spawn(self.sbatch.clone(), error))?;

        if !output.status.success() {
            return Err(SchedulerError::Submission {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        parse_job_id(&String::from_utf8_lossy(&output.stdout))
    }

    fn srun(&mut self, options: &Options, command: &str) -> Result<i32, SchedulerError> {
        let args = options.to_sbatch_args();
        debug!("Running {:?} {args:?} sh -c {command:?}", self.srun);

        let status = Command::new(&self.srun)
            .args(&args)
            .arg("sh")
            .arg("-c")
            .arg(command)
            .status()
            .map_err(|error| SchedulerError::Spawn(self.srun.clone(), error))?;

        status.code().ok_or(SchedulerError::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn job_id_formats() {
        assert_eq!(parse_job_id("4242\n").unwrap(), 4242);
        assert_eq!(parse_job_id("4242;cluster\n").unwrap(), 4242);
        assert_eq!(parse_job_id("Submitted batch job 17").unwrap(), 17);
        assert!(matches!(
            parse_job_id("sbatch: error"),
            Err(SchedulerError::InvalidJobId(_))
        ));
        assert!(parse_job_id("").is_err());
    }

    #[test]
    fn sbatch_flags_and_wrapped_command() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args");
        let sbatch = script(
            dir.path(),
            "sbatch",
            &format!("printf '%s\\n' \"$@\" > {}\necho '77;cluster'", log.display()),
        );
        let mut client = CommandLineClient::with_programs(sbatch, "srun");
        let options = Options::new()
            .with("job_name", "slurmify:noop")
            .with("partition", "alg");

        let job_id = client.sbatch(&options, "echo 'hi there'").unwrap();

        assert_eq!(job_id, 77);
        assert_eq!(
            fs::read_to_string(log).unwrap(),
            "--parsable\n--job-name=slurmify:noop\n--partition=alg\n--wrap\necho 'hi there'\n"
        );
    }

    #[test]
    fn failed_submission() {
        let dir = tempfile::tempdir().unwrap();
        let sbatch = script(dir.path(), "sbatch", "echo 'invalid partition' >&2\nexit 1");
        let mut client = CommandLineClient::with_programs(sbatch, "srun");

        match client.sbatch(&Options::new(), "true") {
            Err(SchedulerError::Submission { stderr, .. }) => {
                assert_eq!(stderr, "invalid partition")
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn srun_returns_the_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        // drop all flags and run the rest
        let srun = script(
            dir.path(),
            "srun",
            "while [ \"${1#--}\" != \"$1\" ]; do shift; done\nexec \"$@\"",
        );
        let mut client = CommandLineClient::with_programs("sbatch", srun);

        let code = client
            .srun(&Options::new().with("partition", "alg"), "exit 3")
            .unwrap();

        assert_eq!(code, 3);
    }
}
