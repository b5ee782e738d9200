//! Call Marshaling
//!
//! Canonical JSON wire form for call arguments and the result envelope
//! returned by the control runtime.
//!
//! ## Arguments
//!
//! Callers pass either a positional sequence or a name→value mapping. Both
//! are serialized verbatim; mapping names onto typed parameters is the
//! control runtime's job, so the two styles are interchangeable for a
//! function whose interface metadata names its parameters.
//!
//! ```text
//! Positional(["test"])        ->  ["test"]
//! Named({"name": "test"})     ->  {"name":"test"}
//! ```
//!
//! ## Results
//!
//! ```text
//! {"result": <json>, "error": ""}          success (null result = void)
//! {"result": null,   "error": "<message>"}  guest-reported failure
//! ```

mod value;

pub use value::Value;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("value at `{path}` cannot be encoded: {reason}")]
    Unrepresentable { path: String, reason: String },

    #[error("{what} is not valid JSON: {source}, original text: {raw}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
        raw: String,
    },

    #[error("{what} has an unexpected shape: {reason}, original text: {raw}")]
    Shape {
        what: &'static str,
        reason: String,
        raw: String,
    },
}

/// Arguments of a single service call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArgs {
    /// Ordered sequence of argument values.
    Positional(Vec<Value>),
    /// Argument values keyed by parameter name.
    Named(BTreeMap<String, Value>),
}

impl CallArgs {
    /// No arguments.
    pub fn none() -> Self {
        CallArgs::Positional(Vec::new())
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        CallArgs::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        CallArgs::Named(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Parse arguments from JSON text (an array or an object).
    pub fn from_json_str(raw: &str) -> Result<Self, MarshalError> {
        let json: serde_json::Value = serde_json::from_str(raw).map_err(|source| MarshalError::Parse {
            what: "call arguments",
            source,
            raw: raw.to_string(),
        })?;
        match Value::from(json) {
            Value::Array(items) => Ok(CallArgs::Positional(items)),
            Value::Object(fields) => Ok(CallArgs::Named(fields)),
            _ => Err(MarshalError::Shape {
                what: "call arguments",
                reason: "expected an array or an object".to_string(),
                raw: raw.to_string(),
            }),
        }
    }
}

impl Default for CallArgs {
    fn default() -> Self {
        CallArgs::none()
    }
}

impl From<Vec<Value>> for CallArgs {
    fn from(values: Vec<Value>) -> Self {
        CallArgs::Positional(values)
    }
}

impl From<BTreeMap<String, Value>> for CallArgs {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        CallArgs::Named(fields)
    }
}

/// Serialize call arguments into the JSON wire form.
pub fn encode_args(args: &CallArgs) -> Result<String, MarshalError> {
    let json = match args {
        CallArgs::Positional(values) => Value::Array(values.clone()).to_json()?,
        CallArgs::Named(fields) => Value::Object(fields.clone()).to_json()?,
    };
    Ok(json.to_string())
}

/// Result envelope produced by the control runtime for every completed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: String,
}

impl ResultEnvelope {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            result,
            error: String::new(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::Null,
            error: message.into(),
        }
    }

    /// Serialize the envelope; envelopes only hold JSON values, so this
    /// cannot fail.
    pub fn to_json_string(&self) -> String {
        serde_json::json!({ "result": self.result, "error": self.error }).to_string()
    }

    /// Split into the returned value or the guest's error message.
    pub fn into_outcome(self) -> Result<Value, String> {
        if self.error.is_empty() {
            Ok(Value::from(self.result))
        } else {
            Err(self.error)
        }
    }
}

/// Parse the raw result text returned by the control runtime.
pub fn decode_envelope(raw: &str) -> Result<ResultEnvelope, MarshalError> {
    let json: serde_json::Value = serde_json::from_str(raw).map_err(|source| MarshalError::Parse {
        what: "call result",
        source,
        raw: raw.to_string(),
    })?;
    if !json.is_object() {
        return Err(MarshalError::Shape {
            what: "call result",
            reason: "expected an object with `result` and `error` fields".to_string(),
            raw: raw.to_string(),
        });
    }
    serde_json::from_value(json).map_err(|source| MarshalError::Parse {
        what: "call result",
        source,
        raw: raw.to_string(),
    })
}
