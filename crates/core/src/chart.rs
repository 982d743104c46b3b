use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::domain::result_set::ResultSet;

pub const SELECTION_SUFFIX: &str = "__selection";
pub const ALL_LABEL: &str = "[All]";

const COMPOSITION_KEYS: [&str; 7] =
    ["mark", "layer", "concat", "hconcat", "vconcat", "facet", "repeat"];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChartError {
    #[error("no JSON object found in chart response")]
    MissingObject,
    #[error("chart response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("chart specification has no mark or view composition")]
    MissingMark,
}

/// Vega-Lite specification returned to clients. Inline data is always stripped;
/// the client binds the result rows itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChartSpec(Value);

impl ChartSpec {
    /// Parses model output into a chart, dropping any inline data.
    pub fn parse(text: &str) -> Result<Self, ChartError> {
        let candidate = extract_json_object(text).ok_or(ChartError::MissingObject)?;
        let value: Value = serde_json::from_str(candidate)
            .map_err(|error| ChartError::InvalidJson(error.to_string()))?;
        let Value::Object(mut spec) = value else {
            return Err(ChartError::MissingObject);
        };

        if !COMPOSITION_KEYS.iter().any(|key| spec.contains_key(*key)) {
            return Err(ChartError::MissingMark);
        }

        spec.insert("data".to_owned(), json!({ "values": [] }));
        spec.remove("datasets");
        Ok(Self(Value::Object(spec)))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Binds every `<column>__selection` parameter to a select input listing the
    /// column's distinct values, with `null` standing for "all". Parameters whose
    /// column is absent from `result` are left untouched. Returns the bound columns.
    pub fn bind_selection_params(&mut self, result: &ResultSet) -> Vec<String> {
        if !contains_key_recursive(&self.0, "transform") {
            return Vec::new();
        }
        let Value::Object(spec) = &mut self.0 else {
            return Vec::new();
        };
        let Some(Value::Array(params)) = spec.get_mut("params") else {
            return Vec::new();
        };

        let mut bound = Vec::new();
        for param in params.iter_mut() {
            let Value::Object(param) = param else {
                continue;
            };
            let Some(column) = param
                .get("name")
                .and_then(Value::as_str)
                .and_then(|name| name.strip_suffix(SELECTION_SUFFIX))
                .map(str::to_owned)
            else {
                continue;
            };
            let Some(mut options) = result.distinct_values(&column) else {
                continue;
            };

            let none_index = match options.iter().position(Value::is_null) {
                Some(index) => index,
                None => {
                    options.insert(0, Value::Null);
                    0
                }
            };
            let mut labels = options.clone();
            labels[none_index] = Value::String(ALL_LABEL.to_owned());

            param.insert("value".to_owned(), Value::Null);
            param.insert("bind".to_owned(), select_binding(&column, options, labels));
            bound.push(column);
        }
        bound
    }
}

fn select_binding(column: &str, options: Vec<Value>, labels: Vec<Value>) -> Value {
    let mut bind = Map::new();
    bind.insert("input".to_owned(), Value::String("select".to_owned()));
    bind.insert("options".to_owned(), Value::Array(options));
    bind.insert("labels".to_owned(), Value::Array(labels));
    bind.insert("name".to_owned(), Value::String(column.to_owned()));
    Value::Object(bind)
}

fn contains_key_recursive(value: &Value, key: &str) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key(key) || map.values().any(|child| contains_key_recursive(child, key))
        }
        Value::Array(items) => items.iter().any(|child| contains_key_recursive(child, key)),
        _ => false,
    }
}

/// Slice from the first `{` to the last `}` inclusive.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
