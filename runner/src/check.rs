//! Functions shipped with the `slurmify` binary and a self check against a real cluster.

use crate::{
    call::Arguments,
    context::Context,
    dispatchers::{DispatchError, SlurmDispatcher},
    options::Options,
    registry::{BoundArgs, Distributable, FunctionResult, FunctionTable, Param, RegistryError},
};
use nix::unistd::gethostname;
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::info;

/// how long to wait for a queued check job
const CHECK_POLLS: usize = 60;

#[derive(Error, Debug)]
pub enum CheckError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("Failed to prepare the check")]
    Io(#[from] io::Error),
    #[error("The node did not write {0:?}")]
    Missing(PathBuf),
}

fn write_to_file(_ctx: &mut Context, args: &BoundArgs) -> FunctionResult {
    let path: PathBuf = args.get("path")?;
    let content: String = args.get("content")?;
    let hostname = gethostname()?;

    fs::write(path, format!("{content}\n{}\n", hostname.to_string_lossy()))?;

    Ok(())
}

fn greet(_ctx: &mut Context, args: &BoundArgs) -> FunctionResult {
    let name: String = args.get("name")?;
    let greeting = format!("Hello, {name}!");
    info!("{greeting}");

    if let Some(path) = args.get_opt::<PathBuf>("path")? {
        fs::write(path, &greeting)?;
    }

    Ok(())
}

fn noop(_ctx: &mut Context, _args: &BoundArgs) -> FunctionResult {
    Ok(())
}

/// writes `content` and the host name of the node to `path`
pub static WRITE_TO_FILE: Distributable = Distributable::new(
    "write_to_file",
    &[Param::Required("path"), Param::Required("content")],
    write_to_file,
);

/// logs a greeting, optionally written to `path`
pub static GREET: Distributable = Distributable::new(
    "greet",
    &[Param::Required("name"), Param::Optional("path")],
    greet,
);

pub static NOOP: Distributable = Distributable::new("noop", &[], noop);

pub static FUNCTIONS: FunctionTable = FunctionTable {
    functions: &[&WRITE_TO_FILE, &GREET, &NOOP],
    node_setup: &[],
};

/// the content and the host name written by `write_to_file`
fn read_check_file(path: &Path) -> Option<(String, String)> {
    let content = fs::read_to_string(path).ok()?;
    let mut lines = content.lines();

    Some((lines.next()?.to_owned(), lines.next()?.to_owned()))
}

/// Check that function calls can be executed on the cluster, blocking and queued
pub fn check_slurm(
    partition: Option<String>,
    constraint: Option<String>,
) -> Result<(), CheckError> {
    let mut ctx = Context::new(&FUNCTIONS)?;
    ctx.set_dispatcher(SlurmDispatcher::new()?);

    let mut options = Options::new();
    if let Some(partition) = partition {
        options.insert("partition", partition);
    }
    if let Some(constraint) = constraint {
        options.insert("constraint", constraint);
    }
    ctx.update_defaults(&options);

    // the nodes need to see the directory, so it can't be in /tmp
    let dir = tempfile::tempdir_in(".")?;
    let write = ctx.function(&WRITE_TO_FILE)?;

    let path = dir.path().join("check_1.txt");
    write.distribute_and_wait(
        &mut ctx,
        Arguments::positional([path.display().to_string(), "test".to_owned()]),
    )?;
    let (_, host) = read_check_file(&path).ok_or(CheckError::Missing(path))?;
    info!("Check 1 successful, the function was executed on {host}");

    let path = dir.path().join("check_2.txt");
    write.distribute(
        &mut ctx,
        Arguments::positional([path.display().to_string(), "test".to_owned()]),
    )?;

    for _ in 0..CHECK_POLLS {
        if let Some((_, host)) = read_check_file(&path) {
            info!("Check 2 successful, the function was executed on {host}");
            return Ok(());
        }

        thread::sleep(Duration::from_secs(1));
    }

    Err(CheckError::Missing(path))
}
