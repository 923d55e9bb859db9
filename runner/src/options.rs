use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    #[error("Option 'dependency' has an unexpected type ({0}), unable to extend it")]
    UnexpectedDependencyType(OptionValue),
}

/// A single scheduler option value
/// Only types with a total order are allowed, so options can key a bundle.
/// Floats are read as text and lists as comma separated text, the way slurm expects them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged, from = "RawOptionValue")]
pub enum OptionValue {
    Flag(bool),
    Int(i64),
    Text(String),
    Nested(Options),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOptionValue {
    Flag(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<RawOptionValue>),
    Nested(Options),
}

impl From<RawOptionValue> for OptionValue {
    fn from(value: RawOptionValue) -> Self {
        match value {
            RawOptionValue::Flag(flag) => Self::Flag(flag),
            RawOptionValue::Int(value) => Self::Int(value),
            RawOptionValue::Float(value) => Self::Text(value.to_string()),
            RawOptionValue::Text(text) => Self::Text(text),
            RawOptionValue::List(values) => Self::Text(
                values
                    .into_iter()
                    .map(|value| OptionValue::from(value).to_string())
                    .join(","),
            ),
            RawOptionValue::Nested(options) => Self::Nested(options),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(flag) => write!(f, "{flag}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(text) => write!(f, "{text}"),
            Self::Nested(options) => write!(f, "{options}"),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Options> for OptionValue {
    fn from(value: Options) -> Self {
        Self::Nested(value)
    }
}

/// Slurm dependency types that take a list of job ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyMethod {
    After,
    #[default]
    AfterAny,
    AfterOk,
    AfterNotOk,
}

impl DependencyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::After => "after",
            Self::AfterAny => "afterany",
            Self::AfterOk => "afterok",
            Self::AfterNotOk => "afternotok",
        }
    }
}

impl fmt::Display for DependencyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler submission options, e.g., partition, constraint or dependency.
///
/// Keys are normalized to use underscores (`job-name` and `job_name` are the same key) and
/// are kept sorted, which makes equality and hashing independent of the insertion order.
/// This allows options to be used as a key when bundling calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, OptionValue>")]
pub struct Options(BTreeMap<String, OptionValue>);

fn normalize_key(key: &str) -> String {
    key.trim().replace('-', "_")
}

impl From<BTreeMap<String, OptionValue>> for Options {
    fn from(map: BTreeMap<String, OptionValue>) -> Self {
        map.into_iter().collect()
    }
}

impl<K: AsRef<str>, V: Into<OptionValue>> FromIterator<(K, V)> for Options {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (normalize_key(key.as_ref()), value.into()))
                .collect(),
        )
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(&normalize_key(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&normalize_key(key))
    }

    pub fn insert(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<OptionValue>,
    ) -> Option<OptionValue> {
        self.0.insert(normalize_key(key.as_ref()), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        self.0.remove(&normalize_key(key))
    }

    /// builder style version of `insert`
    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<OptionValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.0.iter()
    }

    /// overwrite all keys of `self` that are present in `overlay`
    pub fn update(&mut self, overlay: &Options) {
        self.0
            .extend(overlay.0.iter().map(|(key, value)| (key.clone(), value.clone())));
    }

    /// return a copy of `self` with `overlay` applied on top
    pub fn merged(&self, overlay: &Options) -> Options {
        let mut merged = self.clone();
        merged.update(overlay);
        merged
    }

    /// Add a dependency on `job_ids` with the given method.
    /// Existing dependencies are extended instead of replaced.
    pub fn add_dependencies(
        &mut self,
        job_ids: &[u64],
        method: DependencyMethod,
    ) -> Result<(), OptionsError> {
        if job_ids.is_empty() {
            return Ok(());
        }

        let ids = job_ids.iter().join(":");

        match self.0.get_mut("dependency") {
            None => {
                self.insert("dependency", format!("{method}:{ids}"));
            }
            Some(OptionValue::Text(existing)) => {
                existing.push_str(&format!(",{method}:{ids}"));
            }
            Some(OptionValue::Nested(methods)) => {
                let joined = match methods.get(method.as_str()) {
                    Some(OptionValue::Text(existing)) => format!("{existing}:{ids}"),
                    Some(OptionValue::Int(existing)) => format!("{existing}:{ids}"),
                    Some(other) => {
                        return Err(OptionsError::UnexpectedDependencyType(other.clone()))
                    }
                    None => ids,
                };

                methods.insert(method.as_str(), joined);
            }
            Some(other) => return Err(OptionsError::UnexpectedDependencyType(other.clone())),
        }

        Ok(())
    }

    /// Render the options as `sbatch`/`srun` flags.
    /// `true` flags become bare switches, `false` flags are dropped and nested options are
    /// joined as `key:value` pairs (the format used by `--dependency`).
    pub fn to_sbatch_args(&self) -> Vec<String> {
        self.0
            .iter()
            .filter_map(|(key, value)| {
                let flag = key.replace('_', "-");

                match value {
                    OptionValue::Flag(true) => Some(format!("--{flag}")),
                    OptionValue::Flag(false) => None,
                    OptionValue::Int(value) => Some(format!("--{flag}={value}")),
                    OptionValue::Text(text) => Some(format!("--{flag}={text}")),
                    OptionValue::Nested(nested) => Some(format!(
                        "--{flag}={}",
                        nested
                            .iter()
                            .map(|(key, value)| format!("{key}:{value}"))
                            .join(",")
                    )),
                }
            })
            .collect()
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}}}",
            self.0
                .iter()
                .map(|(key, value)| match value {
                    OptionValue::Text(text) => format!("{key}: '{text}'"),
                    other => format!("{key}: {other}"),
                })
                .join(", ")
        )
    }
}
