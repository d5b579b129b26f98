//! Calculations and aggregation datasets attached to a [`Dataset`].
//!
//! Calculations are sub-resources with their own lifecycle. Adding one only
//! means the server accepted it; whether the formula evaluates is learned
//! later from [`Dataset::calculation_state`] or
//! [`Dataset::calculation_succeeded`]. Aggregation datasets are never stored
//! on the handle: [`Dataset::get_aggregate_datasets`] rebuilds the mapping
//! from the server on every call.

use crate::connection::{routes, Answer, ApiRequest, FilePart, RequestBody};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::state::{Refresh, ResourceState};
use crate::validate::{self, validate_groups};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Order-insensitive key for a set of grouping columns. The empty signature
/// means "no grouping".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(into = "String")]
pub struct GroupSignature(String);

impl GroupSignature {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = columns
            .into_iter()
            .map(|c| c.as_ref().trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        Self(set.into_iter().collect::<Vec<_>>().join(","))
    }

    /// Parses the comma-joined form the server uses.
    pub fn parse(joined: &str) -> Self {
        Self::from_columns(joined.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn columns(&self) -> Vec<&str> {
        if self.0.is_empty() {
            Vec::new()
        } else {
            self.0.split(',').collect()
        }
    }
}

impl fmt::Display for GroupSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<GroupSignature> for String {
    fn from(signature: GroupSignature) -> Self {
        signature.0
    }
}

impl<'de> Deserialize<'de> for GroupSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Self::none()),
            Value::String(s) => Ok(Self::parse(&s)),
            Value::Array(items) => items
                .iter()
                .map(|i| {
                    i.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| serde::de::Error::custom("group columns must be strings"))
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Self::from_columns),
            other => Err(serde::de::Error::custom(format!(
                "group must be a string or list, got {}",
                validate::kind(&other)
            ))),
        }
    }
}

/// A calculation as listed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub name: String,
    pub formula: String,
    #[serde(default)]
    pub group: GroupSignature,
    #[serde(default)]
    pub state: ResourceState,
}

impl Calculation {
    pub fn is_grouped(&self) -> bool {
        !self.group.is_empty()
    }
}

/// A validated request to add one calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationSpec {
    pub name: String,
    pub formula: String,
    pub groups: Option<Vec<String>>,
}

impl CalculationSpec {
    pub fn new(name: &str, formula: &str, groups: Option<&Value>) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::validation("calculation name must not be empty"));
        }
        if formula.trim().is_empty() {
            return Err(Error::validation("calculation formula must not be empty"));
        }
        Ok(Self {
            name: name.to_string(),
            formula: formula.to_string(),
            groups: validate_groups(groups)?,
        })
    }

    /// Validates one `{"name", "formula", "groups"?}` mapping.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            Error::validation(format!(
                "calculation must be a mapping, got {}",
                validate::kind(value)
            ))
        })?;
        let name = match map.get("name") {
            Some(Value::String(name)) => name,
            _ => return Err(Error::validation("calculation name must be a string")),
        };
        let formula = match map.get("formula") {
            Some(Value::String(formula)) => formula,
            _ => return Err(Error::validation("calculation formula must be a string")),
        };
        Self::new(name, formula, map.get("groups"))
    }

    pub fn signature(&self) -> GroupSignature {
        self.groups
            .as_ref()
            .map(GroupSignature::from_columns)
            .unwrap_or_default()
    }

    fn to_json(&self) -> Value {
        let mut value = json!({"name": self.name, "formula": self.formula});
        if let Some(groups) = &self.groups {
            value["group"] = Value::String(groups.join(","));
        }
        value
    }
}

impl Dataset {
    /// Adds one calculation. `Ok(true)` when the server accepts it,
    /// `Ok(false)` when it refuses.
    pub async fn add_calculation(&self, name: &str, formula: &str, groups: Option<&Value>) -> Result<bool> {
        let spec = CalculationSpec::new(name, formula, groups)?;
        let id = self.require_id()?;

        let mut form = vec![
            ("name".to_string(), spec.name.clone()),
            ("formula".to_string(), spec.formula.clone()),
        ];
        if let Some(groups) = &spec.groups {
            form.push(("group".to_string(), groups.join(",")));
        }

        let answer = self
            .connection()
            .submit(ApiRequest::post(routes::calculations(id)).body(RequestBody::Form(form)))
            .await?;
        if let Answer::Refused(message) = answer {
            warn!(dataset = %id, calculation = %spec.name, %message, "calculation rejected");
            return Ok(false);
        }
        info!(dataset = %id, calculation = %spec.name, "calculation accepted");
        Ok(true)
    }

    /// Adds a batch of calculations given as a JSON list of
    /// `{"name", "formula", "groups"?}` mappings.
    pub async fn add_calculations(&self, calculations: &Value) -> Result<bool> {
        let items = match calculations {
            Value::Array(items) if !items.is_empty() => items,
            Value::Array(_) => return Err(Error::validation("calculations must not be empty")),
            other => {
                return Err(Error::validation(format!(
                    "calculations must be a list, got {}",
                    validate::kind(other)
                )))
            }
        };
        let specs = items
            .iter()
            .map(CalculationSpec::from_value)
            .collect::<Result<Vec<_>>>()?;

        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert((spec.name.as_str(), spec.signature())) {
                return Err(Error::validation(format!(
                    "duplicate calculation {} for group [{}]",
                    spec.name,
                    spec.signature()
                )));
            }
        }
        let id = self.require_id()?;

        let body = Value::Array(specs.iter().map(CalculationSpec::to_json).collect()).to_string();
        let body = RequestBody::Multipart {
            fields: Vec::new(),
            files: vec![FilePart {
                field: "json_file".to_string(),
                filename: "calculations.json".to_string(),
                bytes: body.into_bytes(),
            }],
        };
        let answer = self
            .connection()
            .submit(ApiRequest::post(routes::calculations(id)).body(body))
            .await?;
        if let Answer::Refused(message) = answer {
            warn!(dataset = %id, %message, "calculations rejected");
            return Ok(false);
        }
        info!(dataset = %id, count = specs.len(), "calculations accepted");
        Ok(true)
    }

    /// `Ok(false)` when no calculation has that name.
    pub async fn remove_calculation(&self, name: &str) -> Result<bool> {
        if name.trim().is_empty() {
            return Err(Error::validation("calculation name must not be empty"));
        }
        let id = self.require_id()?;
        let answer = self
            .connection()
            .submit(ApiRequest::delete(routes::calculations(id)).param("name", name))
            .await?;
        if let Answer::Refused(message) = answer {
            debug!(dataset = %id, calculation = %name, %message, "calculation not removed");
            return Ok(false);
        }
        info!(dataset = %id, calculation = %name, "calculation removed");
        Ok(true)
    }

    pub async fn get_calculations(&self) -> Result<Vec<Calculation>> {
        let id = self.require_id()?;
        let payload = self
            .connection()
            .perform(ApiRequest::get(routes::calculations(id)))
            .await?;
        if let Some(message) = payload.error_message() {
            return Err(Error::remote(None, message));
        }
        match payload.into_json()? {
            Value::Null => Ok(Vec::new()),
            list @ Value::Array(_) => serde_json::from_value(list)
                .map_err(|e| Error::remote(None, format!("malformed calculation list: {}", e))),
            other => Err(Error::remote(
                None,
                format!("expected a calculation list, got {}", validate::kind(&other)),
            )),
        }
    }

    /// State of the named calculation, `None` if it does not exist. When
    /// several groups share the name, any error wins, then any pending.
    pub async fn calculation_state(&self, name: &str) -> Result<Option<ResourceState>> {
        let states: Vec<ResourceState> = self
            .get_calculations()
            .await?
            .into_iter()
            .filter(|c| c.name == name)
            .map(|c| c.state)
            .collect();

        if states.is_empty() {
            Ok(None)
        } else if states.contains(&ResourceState::Error) {
            Ok(Some(ResourceState::Error))
        } else if states.contains(&ResourceState::Pending) {
            Ok(Some(ResourceState::Pending))
        } else {
            Ok(Some(ResourceState::Ready))
        }
    }

    /// `false` once the server reports the formula failed, or if the
    /// calculation is gone. Pending counts as not failed.
    pub async fn calculation_succeeded(&self, name: &str) -> Result<bool> {
        Ok(matches!(
            self.calculation_state(name).await?,
            Some(ResourceState::Pending) | Some(ResourceState::Ready)
        ))
    }

    /// Pollable view of one calculation.
    pub fn calculation(&self, name: &str) -> CalculationWatch<'_> {
        CalculationWatch {
            dataset: self,
            name: name.to_string(),
        }
    }

    /// Aggregation datasets keyed by group signature, rebuilt from the
    /// server on every call.
    pub async fn get_aggregate_datasets(&self) -> Result<BTreeMap<GroupSignature, Dataset>> {
        let id = self.require_id()?;
        let payload = self
            .connection()
            .perform(ApiRequest::get(routes::aggregations(id)))
            .await?;
        if let Some(message) = payload.error_message() {
            return Err(Error::remote(None, message));
        }
        let map = match payload.into_json()? {
            Value::Null => return Ok(BTreeMap::new()),
            Value::Object(map) => map,
            other => {
                return Err(Error::remote(
                    None,
                    format!("expected an aggregation mapping, got {}", validate::kind(&other)),
                ))
            }
        };

        map.into_iter()
            .map(|(group, agg_id)| match agg_id {
                Value::String(agg_id) if !agg_id.is_empty() => Ok((
                    GroupSignature::parse(&group),
                    Dataset::attach(self.connection(), agg_id),
                )),
                _ => Err(Error::remote(
                    None,
                    format!("aggregation for group [{}] has no dataset id", group),
                )),
            })
            .collect()
    }
}

/// One named calculation of a dataset, as a [`Refresh`] resource.
pub struct CalculationWatch<'a> {
    dataset: &'a Dataset,
    name: String,
}

#[async_trait]
impl<'a> Refresh for CalculationWatch<'a> {
    fn describe(&self) -> String {
        format!("calculation {} on {}", self.name, self.dataset.describe())
    }

    /// A calculation that no longer exists reports [`ResourceState::Error`].
    async fn refresh(&mut self) -> Result<ResourceState> {
        Ok(self
            .dataset
            .calculation_state(&self.name)
            .await?
            .unwrap_or(ResourceState::Error))
    }
}
