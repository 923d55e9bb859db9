use crate::options::Options;
use std::{
    env,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error};

/// file name of the default configuration, searched in home, XDG config and working directory
pub const CONFIG_NAME: &str = ".slurmify_default.yaml";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// search all directories in `PATH` for an executable with the given name
pub fn find_executable(name: &str) -> Option<PathBuf> {
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| matches!(check_executable(candidate), Ok(true)))
    })
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Configuration is not a valid mapping of options")]
    InvalidConfig(#[from] serde_yaml::Error),
}

/// Process wide default options.
/// Every submission overlays its own options on top of these.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    options: Options,
}

impl Defaults {
    /// load the defaults from all well known locations
    pub fn load() -> Self {
        Self::load_from(Self::search_paths())
    }

    /// Candidate files in increasing priority: home directory, XDG config directory and the
    /// current working directory
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(CONFIG_NAME));
        }
        if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("slurmify").join(CONFIG_NAME));
        }
        paths.push(PathBuf::from(CONFIG_NAME));

        paths
    }

    /// Load and merge the given files, later files override earlier ones.
    /// Files that can't be read are skipped.
    pub fn load_from(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut defaults = Self::default();

        for path in paths {
            match Self::load_file(&path) {
                Ok(options) => {
                    if !options.is_empty() {
                        debug!(path = ?path, "Loaded default configuration {options}");
                    }
                    defaults.update(&options);
                }
                Err(error) => {
                    error!(error = ?error, "Could not open default configuration {path:?}: {error}")
                }
            }
        }

        defaults
    }

    fn load_file(path: &Path) -> Result<Options, ConfigErrors> {
        if !path.is_file() {
            return Ok(Options::new());
        }

        let content = fs::read_to_string(path)?;

        if content.trim().is_empty() {
            Ok(Options::new())
        } else {
            Ok(serde_yaml::from_str(&content)?)
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// add or overwrite default options
    pub fn update(&mut self, overlay: &Options) {
        self.options.update(overlay);
    }

    /// replace the defaults completely
    pub fn replace(&mut self, options: Options) {
        self.options = options;
    }

    /// the defaults with `overlay` applied on top
    pub fn merged(&self, overlay: &Options) -> Options {
        self.options.merged(overlay)
    }
}
