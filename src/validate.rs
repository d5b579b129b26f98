//! Client-side validation of `select`, `query` and `groups` arguments.
//!
//! Arguments arrive as loosely-typed JSON values and leave as typed
//! restrictions. Absent arguments mean "no restriction". Any other shape is
//! rejected with [`Error::Validation`] and never reaches the network.

use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// Columns to project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select(Vec<String>);

impl Select {
    pub fn columns(&self) -> &[String] {
        &self.0
    }

    /// Wire form: `{"col": 1, ...}`.
    pub fn to_param(&self) -> String {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|c| (c.clone(), Value::from(1)))
            .collect();
        Value::Object(map).to_string()
    }
}

/// Equality filter over scalar column values.
#[derive(Debug, Clone, PartialEq)]
pub struct Query(Map<String, Value>);

impl Query {
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_param(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

pub fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

pub fn validate_select(value: Option<&Value>) -> Result<Option<Select>> {
    validate_columns("select", value).map(|cols| cols.map(Select))
}

pub fn validate_groups(value: Option<&Value>) -> Result<Option<Vec<String>>> {
    validate_columns("groups", value)
}

pub fn validate_query(value: Option<&Value>) -> Result<Option<Query>> {
    let map = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(Error::validation(format!(
                "query must be a mapping of column to value, got {}",
                kind(other)
            )))
        }
    };

    if let Some((key, bad)) = map.iter().find(|(_, v)| !is_scalar(v)) {
        return Err(Error::validation(format!(
            "query value for {} must be a string, number or bool, got {}",
            key,
            kind(bad)
        )));
    }

    Ok(Some(Query(map.clone())))
}

fn validate_columns(arg: &str, value: Option<&Value>) -> Result<Option<Vec<String>>> {
    let items = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(Error::validation(format!(
                "{} must be a list of column names, got {}",
                arg,
                kind(other)
            )))
        }
    };

    items
        .iter()
        .map(|item| match item {
            Value::String(s) if !s.is_empty() => Ok(s.clone()),
            Value::String(_) => Err(Error::validation(format!("{} contains an empty column name", arg))),
            other => Err(Error::validation(format!(
                "{} must contain only column names, found {}",
                arg,
                kind(other)
            ))),
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

pub(crate) fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
