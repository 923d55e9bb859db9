use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// maximal length of the positional/ keyword part in the log form of a call
const SHORT_FORM_LIMIT: usize = 200;

/// Positional and keyword arguments of a call.
/// Only JSON representable values are allowed, as they have to survive the trip to the node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            args: values.into_iter().map(Into::into).collect(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_owned(), value.into());
        self
    }
}

impl From<Vec<Value>> for Arguments {
    fn from(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }
}

/// The human readable part of a function id, i.e., the function name
pub fn readable_name(func_id: &str) -> &str {
    func_id
        .rsplit_once(':')
        .map_or(func_id, |(_, name)| name)
}

/// A single call of a distributable function, as it is sent to a node.
/// Serializes to `{"func_id": .., "args": [..], "kwargs": {..}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    func_id: String,
    #[serde(flatten)]
    arguments: Arguments,
}

impl FunctionCall {
    pub fn new(func_id: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            func_id: func_id.into(),
            arguments,
        }
    }

    pub fn func_id(&self) -> &str {
        &self.func_id
    }

    pub fn name(&self) -> &str {
        readable_name(&self.func_id)
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn args(&self) -> &[Value] {
        &self.arguments.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.arguments.kwargs
    }
}

fn short_value(value: &Value) -> String {
    match value {
        Value::String(text) => format!("'{text}'"),
        other => other.to_string(),
    }
}

fn truncate(text: String) -> String {
    if text.chars().count() > SHORT_FORM_LIMIT {
        let mut short: String = text.chars().take(SHORT_FORM_LIMIT).collect();
        short.push_str("...");
        short
    } else {
        text
    }
}

/// short form for logging, e.g., `f('hello', 2, flag=true)`
impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = truncate(self.args().iter().map(short_value).join(", "));
        let kwargs = truncate(
            self.kwargs()
                .iter()
                .map(|(name, value)| format!("{name}={}", short_value(value)))
                .join(", "),
        );

        write!(
            f,
            "{}({})",
            self.name(),
            [args, kwargs].iter().filter(|part| !part.is_empty()).join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_form() {
        let call = FunctionCall::new(
            "/opt/bin/app:greet",
            Arguments::positional(["world"]).kwarg("times", 2),
        );

        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"func_id": "/opt/bin/app:greet", "args": ["world"], "kwargs": {"times": 2}})
        );
    }

    #[test]
    fn missing_arguments_default_to_empty() {
        let call: FunctionCall = serde_json::from_str(r#"{"func_id": "/a:noop"}"#).unwrap();

        assert_eq!(call.name(), "noop");
        assert!(call.args().is_empty());
        assert!(call.kwargs().is_empty());
    }

    #[test]
    fn short_form() {
        let call = FunctionCall::new(
            "/opt/bin/app:g",
            Arguments::positional([json!("a"), json!(2)]).kwarg("y", json!([1, 2])),
        );

        assert_eq!(call.to_string(), "g('a', 2, y=[1,2])");
        assert_eq!(
            FunctionCall::new("/opt/bin/app:noop", Arguments::new()).to_string(),
            "noop()"
        );
    }

    #[test]
    fn short_form_is_truncated() {
        let call = FunctionCall::new("/a:f", Arguments::positional(["x".repeat(500)]));
        let short = call.to_string();

        assert!(short.ends_with("...)"));
        assert!(short.len() < 220);
    }
}
