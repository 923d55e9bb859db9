//! Registry of all distributable functions of a binary.
//!
//! A node runs the same binary as the submitting process, so every function is known on both
//! sides through the same static `FunctionTable`. The id of a function is built from the entry
//! point (the binary) and the function name, `"<entry point>:<name>"`, which makes it
//! reproducible on the node once it knows the entry point it was started with.

use crate::{
    call::Arguments,
    command::{list_function_ids, LISTING_TIMEOUT},
    config::check_executable,
    context::Context,
    options::Options,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    env, fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Result of a distributable function
pub type FunctionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Signature of a distributable function
pub type Handler = fn(&mut Context, &BoundArgs) -> FunctionResult;

/// Hook executed on the node before any function call
pub type SetupHook = fn(&mut Context) -> FunctionResult;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Can only register properly named functions, '{0}' is not a valid name")]
    InvalidName(String),
    #[error("Multiple function definitions for '{0}'")]
    DuplicateIdentity(String),
    #[error("Function '{0}' unknown")]
    UnknownFunction(String),
    #[error("Function '{0}' cannot be called from the entry point {1:?}")]
    UnavailableFunction(String, PathBuf),
    #[error("No entry point known")]
    NoEntryPoint,
    #[error("Illegal entry point ({0:?}), it has to be an existing executable file")]
    IllegalEntryPoint(PathBuf),
    #[error("Entry point {0:?} does not exist")]
    MissingEntryPoint(PathBuf),
    #[error("Arguments don't match the signature of '{function}': {reason}")]
    ArgumentMismatch { function: String, reason: String },
    #[error("Argument '{0}' is missing")]
    MissingArgument(String),
    #[error("Argument '{name}' has an unexpected type")]
    InvalidArgument {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A parameter of a distributable function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Required(&'static str),
    Optional(&'static str),
}

impl Param {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Required(name) | Self::Optional(name) => name,
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required(_))
    }
}

/// Static description of a distributable function.
///
/// ```ignore
/// static GREET: Distributable = Distributable::new("greet", &[Param::Required("name")], greet)
///     .with_options(&[("partition", "alg")]);
/// ```
pub struct Distributable {
    name: &'static str,
    params: &'static [Param],
    handler: Handler,
    options: &'static [(&'static str, &'static str)],
}

impl Distributable {
    pub const fn new(name: &'static str, params: &'static [Param], handler: Handler) -> Self {
        Self {
            name,
            params,
            handler,
            options: &[],
        }
    }

    /// function specific scheduler options
    pub const fn with_options(self, options: &'static [(&'static str, &'static str)]) -> Self {
        Self { options, ..self }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> &'static [Param] {
        self.params
    }

    pub fn handler(&self) -> Handler {
        self.handler
    }

    pub fn default_options(&self) -> Options {
        self.options.iter().copied().collect()
    }

    /// Bind positional and keyword arguments to the parameters of this function
    pub fn bind(&self, arguments: &Arguments) -> Result<BoundArgs, RegistryError> {
        let mismatch = |reason: String| RegistryError::ArgumentMismatch {
            function: self.name.to_owned(),
            reason,
        };

        if arguments.args.len() > self.params.len() {
            return Err(mismatch(format!(
                "takes {} positional arguments but {} were given",
                self.params.len(),
                arguments.args.len()
            )));
        }

        let mut values: BTreeMap<&'static str, Value> = self
            .params
            .iter()
            .zip(arguments.args.iter())
            .map(|(param, value)| (param.name(), value.clone()))
            .collect();

        for (name, value) in arguments.kwargs.iter() {
            let param = self
                .params
                .iter()
                .find(|param| param.name() == name.as_str())
                .ok_or_else(|| mismatch(format!("unexpected keyword argument '{name}'")))?;

            if values.insert(param.name(), value.clone()).is_some() {
                return Err(mismatch(format!("multiple values for argument '{name}'")));
            }
        }

        if let Some(missing) = self
            .params
            .iter()
            .find(|param| param.is_required() && !values.contains_key(param.name()))
        {
            return Err(mismatch(format!(
                "missing required argument '{}'",
                missing.name()
            )));
        }

        Ok(BoundArgs { values })
    }
}

impl fmt::Debug for Distributable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Distributable")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// All distributable functions and node setup hooks of a binary
#[derive(Clone, Copy)]
pub struct FunctionTable {
    pub functions: &'static [&'static Distributable],
    pub node_setup: &'static [SetupHook],
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTable")
            .field("functions", &self.functions)
            .field("node_setup", &self.node_setup.len())
            .finish()
    }
}

/// Arguments bound to the parameter names of a function
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    values: BTreeMap<&'static str, Value>,
}

impl BoundArgs {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, RegistryError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| RegistryError::MissingArgument(name.to_owned()))?;

        serde_json::from_value(value.clone()).map_err(|source| RegistryError::InvalidArgument {
            name: name.to_owned(),
            source,
        })
    }

    /// like `get`, but missing and `null` arguments are `None`
    pub fn get_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, RegistryError> {
        match self.values.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(name).map(Some),
        }
    }
}

#[derive(Debug, Default)]
enum Preflight {
    #[default]
    Pending,
    Listed {
        entry_point: PathBuf,
        ids: BTreeSet<String>,
    },
    Disabled,
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(first) if first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_owned()))
    }
}

fn validate_entry_point(path: &Path) -> Result<PathBuf, RegistryError> {
    match check_executable(path) {
        Ok(true) => fs::canonicalize(path)
            .map_err(|_| RegistryError::IllegalEntryPoint(path.to_path_buf())),
        _ => Err(RegistryError::IllegalEntryPoint(path.to_path_buf())),
    }
}

fn identity_for(entry_point: &Path, name: &str) -> String {
    format!("{}:{name}", entry_point.display())
}

/// Maps function ids to distributable functions
#[derive(Debug, Default)]
pub struct Registry {
    entry_point: Option<PathBuf>,
    functions: BTreeMap<String, &'static Distributable>,
    preflight: Preflight,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// the entry point, if already known
    pub fn entry_point(&self) -> Option<&Path> {
        self.entry_point.as_deref()
    }

    /// Set the entry point explicitly, all registered functions move to the new entry point.
    /// Returns the normalized path.
    pub fn set_entry_point(&mut self, path: impl AsRef<Path>) -> Result<PathBuf, RegistryError> {
        let entry_point = validate_entry_point(path.as_ref())?;

        debug!(entry_point = ?entry_point, "Setting entry point");

        self.functions = std::mem::take(&mut self.functions)
            .into_values()
            .map(|function| (identity_for(&entry_point, function.name()), function))
            .collect();

        if !matches!(self.preflight, Preflight::Disabled) {
            self.preflight = Preflight::Pending;
        }

        self.entry_point = Some(entry_point.clone());

        Ok(entry_point)
    }

    /// Return the entry point, inferring it from the running executable if it is not known yet
    pub fn resolve_entry_point(&mut self) -> Result<PathBuf, RegistryError> {
        match &self.entry_point {
            Some(entry_point) if entry_point.is_file() => Ok(entry_point.clone()),
            Some(entry_point) => Err(RegistryError::MissingEntryPoint(entry_point.clone())),
            None => {
                let executable = env::current_exe().map_err(|_| RegistryError::NoEntryPoint)?;

                self.set_entry_point(executable)
            }
        }
    }

    /// the id of `function` under the current entry point
    pub fn identity(&mut self, function: &Distributable) -> Result<String, RegistryError> {
        validate_name(function.name())?;

        Ok(identity_for(&self.resolve_entry_point()?, function.name()))
    }

    /// Register a function, allowing it to be called by its id
    pub fn register(
        &mut self,
        function: &'static Distributable,
        allow_overwrite: bool,
    ) -> Result<String, RegistryError> {
        let func_id = self.identity(function)?;

        if self.functions.contains_key(&func_id) && !allow_overwrite {
            return Err(RegistryError::DuplicateIdentity(func_id));
        }

        self.functions.insert(func_id.clone(), function);

        Ok(func_id)
    }

    pub fn lookup(&self, func_id: &str) -> Result<&'static Distributable, RegistryError> {
        self.functions
            .get(func_id)
            .copied()
            .ok_or_else(|| RegistryError::UnknownFunction(func_id.to_owned()))
    }

    pub fn exists(&self, func_id: &str) -> bool {
        self.functions.contains_key(func_id)
    }

    /// all registered function ids
    pub fn ids(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    /// Never ask the entry point for its functions before submitting
    pub fn disable_preflight(&mut self) {
        self.preflight = Preflight::Disabled;
    }

    /// Check if `func_id` can be called through `entry_point`.
    /// Asks the entry point for its function ids and caches the answer. If that is not
    /// possible, the check is disabled for the rest of the process and always succeeds.
    pub fn check_id(&mut self, func_id: &str, entry_point: &Path) -> bool {
        let known = match &self.preflight {
            Preflight::Disabled => return true,
            Preflight::Listed {
                entry_point: listed,
                ids,
            } if listed == entry_point => ids.contains(func_id),
            _ => false,
        };

        if known {
            return true;
        }

        match list_function_ids(entry_point, LISTING_TIMEOUT) {
            Ok(ids) => {
                info!("Entry point {entry_point:?} has functions {ids:?}");

                let found = ids.contains(func_id);
                self.preflight = Preflight::Listed {
                    entry_point: entry_point.to_path_buf(),
                    ids,
                };

                found
            }
            Err(error) => {
                warn!(
                    "Cannot verify function ids before submitting to slurm: {error}. This is not \
                    critical, things will just be more difficult to debug in case of a mistake."
                );
                self.preflight = Preflight::Disabled;

                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::find_executable;
    use serde_json::json;

    fn noop(_ctx: &mut Context, _args: &BoundArgs) -> FunctionResult {
        Ok(())
    }

    static NOOP: Distributable = Distributable::new("noop", &[], noop);
    static PAIR: Distributable = Distributable::new(
        "pair",
        &[Param::Required("x"), Param::Optional("y")],
        noop,
    )
    .with_options(&[("constraint", "alggen02")]);
    static UNNAMED: Distributable = Distributable::new("<closure>", &[], noop);
    static SPACED: Distributable = Distributable::new("two words", &[], noop);

    fn registry() -> (Registry, PathBuf) {
        let mut registry = Registry::new();
        let entry_point = registry
            .set_entry_point(env::current_exe().unwrap())
            .unwrap();

        (registry, entry_point)
    }

    #[test]
    fn identity_combines_entry_point_and_name() {
        let (mut registry, entry_point) = registry();
        let func_id = registry.register(&NOOP, false).unwrap();

        assert_eq!(func_id, format!("{}:noop", entry_point.display()));
        assert!(registry.exists(&func_id));
        assert_eq!(registry.lookup(&func_id).unwrap().name(), "noop");
    }

    #[test]
    fn duplicate_registration_fails() {
        let (mut registry, _) = registry();
        registry.register(&NOOP, false).unwrap();

        assert!(matches!(
            registry.register(&NOOP, false),
            Err(RegistryError::DuplicateIdentity(_))
        ));
        assert!(registry.register(&NOOP, true).is_ok());
        assert_eq!(registry.ids().len(), 1);
    }

    #[test]
    fn improper_names_are_rejected() {
        let (mut registry, _) = registry();

        assert!(matches!(
            registry.register(&UNNAMED, false),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            registry.register(&SPACED, false),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn unknown_ids_are_reported() {
        let (registry, _) = registry();

        assert!(matches!(
            registry.lookup("/nowhere:noop"),
            Err(RegistryError::UnknownFunction(id)) if id == "/nowhere:noop"
        ));
    }

    #[test]
    fn entry_point_must_be_an_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("main.rs");
        fs::write(&source, "fn main() {}").unwrap();
        let mut registry = Registry::new();

        assert!(matches!(
            registry.set_entry_point(&source),
            Err(RegistryError::IllegalEntryPoint(_))
        ));
        assert!(matches!(
            registry.set_entry_point(dir.path().join("missing")),
            Err(RegistryError::IllegalEntryPoint(_))
        ));
        assert!(registry.entry_point().is_none());
    }

    #[test]
    fn entry_point_is_inferred_from_the_executable() {
        let mut registry = Registry::new();
        let entry_point = registry.resolve_entry_point().unwrap();

        assert_eq!(
            entry_point,
            fs::canonicalize(env::current_exe().unwrap()).unwrap()
        );
        assert_eq!(registry.entry_point(), Some(entry_point.as_path()));
    }

    #[test]
    fn changing_the_entry_point_moves_functions() {
        let (mut registry, _) = registry();
        registry.register(&NOOP, false).unwrap();

        let other = find_executable("sh").unwrap();
        let other = registry.set_entry_point(other).unwrap();

        assert_eq!(registry.ids(), vec![format!("{}:noop", other.display())]);
    }

    #[test]
    fn binding_arguments() {
        let bound = PAIR.bind(&Arguments::positional([1])).unwrap();
        assert_eq!(bound.get::<i64>("x").unwrap(), 1);
        assert_eq!(bound.get_opt::<i64>("y").unwrap(), None);

        let bound = PAIR
            .bind(&Arguments::new().kwarg("y", "b").kwarg("x", "a"))
            .unwrap();
        assert_eq!(bound.get::<String>("x").unwrap(), "a");
        assert_eq!(bound.get_opt::<String>("y").unwrap().as_deref(), Some("b"));
        assert!(matches!(
            bound.get::<i64>("x"),
            Err(RegistryError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn binding_mismatches() {
        let cases = [
            Arguments::new(),
            Arguments::positional([1, 2, 3]),
            Arguments::positional([1]).kwarg("x", 2),
            Arguments::positional([1]).kwarg("z", 2),
        ];

        for arguments in cases {
            assert!(
                matches!(
                    PAIR.bind(&arguments),
                    Err(RegistryError::ArgumentMismatch { .. })
                ),
                "{arguments:?} should not bind"
            );
        }
    }

    #[test]
    fn default_options_of_a_function() {
        assert_eq!(
            PAIR.default_options(),
            Options::new().with("constraint", "alggen02")
        );
        assert!(NOOP.default_options().is_empty());
        assert_eq!(
            PAIR.bind(&Arguments::positional([json!(null)]))
                .unwrap()
                .value("x"),
            Some(&Value::Null)
        );
    }

    #[test]
    fn preflight_failure_disables_the_check() {
        let (mut registry, _) = registry();
        let broken = find_executable("false").unwrap();

        assert!(registry.check_id("/unknown:f", &broken));
        assert!(matches!(registry.preflight, Preflight::Disabled));
        assert!(registry.check_id("/other:g", &broken));
    }

    #[test]
    fn disabled_preflight_accepts_everything() {
        let (mut registry, entry_point) = registry();
        registry.disable_preflight();

        assert!(registry.check_id("anything", &entry_point));
    }
}
