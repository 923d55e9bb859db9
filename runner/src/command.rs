//! Command lines that start the node bootstrap.
//!
//! A node is started as `<entry point> __slurmify_execute --root <entry point> --calls <json>`.
//! Payloads that would exceed the argument length limit of the operating system are written to
//! a temporary file instead and passed as `--fromfile <path>`; the node deletes the file after
//! reading it.

use crate::call::FunctionCall;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    collections::BTreeSet,
    ffi::OsString,
    fmt, fs,
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// first argument of every node invocation
pub const BOOTSTRAP_COMMAND: &str = "__slurmify_execute";

/// Linux limits a single argument to 128 KiB, stay well below
pub const DEFAULT_MAX_ARG_LENGTH: usize = 100_000;

/// how long an entry point may take to list its functions
pub const LISTING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Entry point {0:?} does not exist")]
    MissingEntryPoint(PathBuf),
    #[error("Failed to serialize the function calls")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to write the function calls to a file in {0:?}")]
    PayloadFile(PathBuf, #[source] std::io::Error),
    #[error("Failed to run {0:?}")]
    Spawn(PathBuf, #[source] std::io::Error),
    #[error("Listing the functions of {0:?} timed out")]
    Timeout(PathBuf),
    #[error("Listing the functions of {path:?} failed ({status})")]
    ListingFailed { path: PathBuf, status: String },
    #[error("Unexpected function listing: {0:?}")]
    InvalidListing(String),
}

/// Where and when payloads are moved out of the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadConfig {
    pub max_arg_length: usize,
    pub temp_dir: PathBuf,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            max_arg_length: DEFAULT_MAX_ARG_LENGTH,
            temp_dir: PathBuf::from("."),
        }
    }
}

/// Quote a word for a POSIX shell
pub fn quote(word: &str) -> Cow<'_, str> {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));

    if safe {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r#"'"'"'"#)))
    }
}

/// A command for the shell, either a complete line or a list of words that are quoted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShellCommand {
    Line(String),
    Argv(Vec<String>),
}

impl ShellCommand {
    pub fn to_line(&self) -> String {
        match self {
            Self::Line(line) => line.clone(),
            Self::Argv(words) => words.iter().map(|word| quote(word)).join(" "),
        }
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

impl From<&str> for ShellCommand {
    fn from(line: &str) -> Self {
        Self::Line(line.to_owned())
    }
}

impl From<String> for ShellCommand {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<Vec<String>> for ShellCommand {
    fn from(words: Vec<String>) -> Self {
        Self::Argv(words)
    }
}

impl From<&[&str]> for ShellCommand {
    fn from(words: &[&str]) -> Self {
        Self::Argv(words.iter().map(|word| word.to_string()).collect())
    }
}

/// The serialized function calls handed to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Inline(String),
    File(PathBuf),
}

/// Invocation of the node bootstrap for a list of function calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCommand {
    entry_point: PathBuf,
    payload: Payload,
}

impl NodeCommand {
    /// Serialize `calls` for the node, moving them to a file if the command line would get
    /// too long
    pub fn new(
        entry_point: &Path,
        calls: &[FunctionCall],
        config: &PayloadConfig,
    ) -> Result<Self, CommandError> {
        if !entry_point.exists() {
            return Err(CommandError::MissingEntryPoint(entry_point.to_path_buf()));
        }

        let json = serde_json::to_string(calls)?;

        let payload = if quote(&json).len() > config.max_arg_length {
            Payload::File(Self::write_payload(&json, &config.temp_dir)?)
        } else {
            Payload::Inline(json)
        };

        Ok(Self {
            entry_point: entry_point.to_path_buf(),
            payload,
        })
    }

    fn write_payload(json: &str, temp_dir: &Path) -> Result<PathBuf, CommandError> {
        let to_error = |error| CommandError::PayloadFile(temp_dir.to_path_buf(), error);

        let dir = fs::canonicalize(temp_dir).map_err(to_error)?;
        let mut file = tempfile::Builder::new()
            .prefix("slurmify_")
            .suffix(".json")
            .tempfile_in(dir)
            .map_err(to_error)?;

        file.write_all(json.as_bytes()).map_err(to_error)?;

        let (_, path) = file.keep().map_err(|error| to_error(error.error))?;

        debug!(
            path = ?path,
            "Function calls too long for the command line, wrote them to {path:?}"
        );

        Ok(path)
    }

    pub fn entry_point(&self) -> &Path {
        &self.entry_point
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// program and arguments of the command
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = vec![
            self.entry_point.clone().into_os_string(),
            BOOTSTRAP_COMMAND.into(),
            "--root".into(),
            self.entry_point.clone().into_os_string(),
        ];

        match &self.payload {
            Payload::Inline(json) => argv.extend(["--calls".into(), json.into()]),
            Payload::File(path) => {
                argv.extend(["--fromfile".into(), path.clone().into_os_string()])
            }
        }

        argv
    }

    /// the command, ready to be executed locally
    pub fn to_command(&self) -> Command {
        let mut argv = self.argv().into_iter();
        let mut command = Command::new(argv.next().unwrap_or_default());
        command.args(argv);

        command
    }

    /// the command as a shell line, e.g., for `sbatch --wrap`
    pub fn to_shell(&self) -> String {
        self.argv()
            .iter()
            .map(|word| quote(&word.to_string_lossy()).into_owned())
            .join(" ")
    }

    /// Remove the payload file, used if the node will never read it
    pub fn discard_payload(&self) {
        if let Payload::File(path) = &self.payload {
            match fs::remove_file(path) {
                Err(error) if error.kind() != ErrorKind::NotFound => {
                    warn!(error = ?error, "Failed to remove the payload file {path:?}: {error}");
                }
                _ => {}
            }
        }
    }
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// Ask `entry_point` for the ids of all functions it can execute
pub fn list_function_ids(
    entry_point: &Path,
    timeout: Duration,
) -> Result<BTreeSet<String>, CommandError> {
    let spawn_error = |error| CommandError::Spawn(entry_point.to_path_buf(), error);

    let mut child = Command::new(entry_point)
        .arg(BOOTSTRAP_COMMAND)
        .arg("--root")
        .arg(entry_point)
        .arg("--listfuncs")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(spawn_error)?;

    let status = match child.wait_timeout(timeout).map_err(spawn_error)? {
        Some(status) => status,
        None => {
            // child hasn't exited yet
            child.kill().map_err(spawn_error)?;
            child.wait().map_err(spawn_error)?;

            return Err(CommandError::Timeout(entry_point.to_path_buf()));
        }
    };

    if !status.success() {
        return Err(CommandError::ListingFailed {
            path: entry_point.to_path_buf(),
            status: status.to_string(),
        });
    }

    let mut output = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_string(&mut output).map_err(spawn_error)?;
    }

    let listing = output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default();

    serde_json::from_str(listing).map_err(|_| CommandError::InvalidListing(listing.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Arguments;
    use std::env;

    fn calls(text: &str) -> Vec<FunctionCall> {
        vec![FunctionCall::new("/bin/app:f", Arguments::positional([text]))]
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("simple/path-1.json"), "simple/path-1.json");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn shell_commands() {
        assert_eq!(ShellCommand::from("echo 1 && echo 2").to_line(), "echo 1 && echo 2");
        assert_eq!(
            ShellCommand::from(&["echo", "hello world"][..]).to_line(),
            "echo 'hello world'"
        );

        let decoded: ShellCommand = serde_json::from_str(r#"["ls", "-l"]"#).unwrap();
        assert_eq!(decoded, ShellCommand::Argv(vec!["ls".into(), "-l".into()]));
    }

    #[test]
    fn short_payloads_stay_inline() {
        let entry_point = env::current_exe().unwrap();
        let command =
            NodeCommand::new(&entry_point, &calls("hi"), &PayloadConfig::default()).unwrap();

        assert_eq!(
            command.payload(),
            &Payload::Inline(r#"[{"func_id":"/bin/app:f","args":["hi"],"kwargs":{}}]"#.into())
        );

        let argv = command.argv();
        assert_eq!(argv[1], BOOTSTRAP_COMMAND);
        assert_eq!(argv[2], "--root");
        assert_eq!(argv[4], "--calls");
        assert!(command.to_shell().contains(r#"--calls '[{"func_id""#));
    }

    #[test]
    fn long_payloads_move_to_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = PayloadConfig {
            max_arg_length: 50,
            temp_dir: dir.path().to_path_buf(),
        };
        let entry_point = env::current_exe().unwrap();
        let command = NodeCommand::new(&entry_point, &calls(&"x".repeat(100)), &config).unwrap();

        let Payload::File(path) = command.payload() else {
            panic!("expected a payload file, got {:?}", command.payload());
        };
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("slurmify_") && name.ends_with(".json"));
        assert!(path.is_absolute());

        let stored: Vec<FunctionCall> =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(stored, calls(&"x".repeat(100)));
        assert_eq!(command.argv()[4], "--fromfile");

        command.discard_payload();
        assert!(!path.exists());
        // already removed by the node
        command.discard_payload();
    }

    #[test]
    fn missing_entry_point() {
        assert!(matches!(
            NodeCommand::new(
                Path::new("/surely/not/existing"),
                &calls("hi"),
                &PayloadConfig::default()
            ),
            Err(CommandError::MissingEntryPoint(_))
        ));
    }

    #[test]
    fn listing_of_a_fake_entry_point() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake");
        fs::write(
            &fake,
            "#!/bin/sh\necho some log line\necho '[\"/fake:a\", \"/fake:b\"]'\n",
        )
        .unwrap();
        fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();

        let ids = list_function_ids(&fake, LISTING_TIMEOUT).unwrap();

        assert_eq!(
            ids,
            BTreeSet::from(["/fake:a".to_owned(), "/fake:b".to_owned()])
        );
    }

    #[test]
    fn listing_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let slow = dir.path().join("slow");
        fs::write(&slow, "#!/bin/sh\nsleep 5\n").unwrap();
        fs::set_permissions(&slow, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(matches!(
            list_function_ids(&slow, Duration::from_millis(100)),
            Err(CommandError::Timeout(_))
        ));
    }
}
