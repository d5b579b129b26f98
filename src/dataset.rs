//! Dataset handles.
//!
//! A [`Dataset`] is a client-side handle to a tabular resource the server
//! computes asynchronously. It is *bound* while it holds a server identifier
//! and *unbound* before creation or after [`Dataset::delete`]; unbound handles
//! reject every non-creation operation with [`Error::Unbound`].

use crate::connection::{default_connection, routes, ApiRequest, Connection, FilePart, Payload, RequestBody};
use crate::error::{Error, Result};
use crate::state::{Refresh, ResourceState};
use crate::validate::{self, is_scalar, validate_groups, validate_query, validate_select};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// One data row as returned by the service.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFormat {
    #[default]
    Csv,
    Json,
}

impl DataFormat {
    fn file_field(&self) -> &'static str {
        match self {
            DataFormat::Csv => "csv_file",
            DataFormat::Json => "json_file",
        }
    }

    fn default_filename(&self) -> &'static str {
        match self {
            DataFormat::Csv => "data.csv",
            DataFormat::Json => "data.json",
        }
    }
}

impl FromStr for DataFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csv" => Ok(DataFormat::Csv),
            "json" => Ok(DataFormat::Json),
            other => Err(Error::validation(format!(
                "data format must be csv or json, got {}",
                other
            ))),
        }
    }
}

/// Sources for [`Dataset::create`] and [`Dataset::reset`].
///
/// Exactly one of `path`, `content` or `url` may be given. A schema (from a
/// file or inline) may accompany them or stand alone.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    path: Option<PathBuf>,
    content: Option<String>,
    url: Option<String>,
    schema_path: Option<PathBuf>,
    schema_content: Option<String>,
    data_format: Option<String>,
    na_values: Option<Vec<String>>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn schema_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema_path = Some(path.into());
        self
    }

    pub fn schema_content(mut self, schema: impl Into<String>) -> Self {
        self.schema_content = Some(schema.into());
        self
    }

    /// `"csv"` (default) or `"json"`.
    pub fn data_format(mut self, format: impl Into<String>) -> Self {
        self.data_format = Some(format.into());
        self
    }

    /// Cell values the server should read as missing.
    pub fn na_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.na_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    fn resolve(&self) -> Result<ResolvedSource> {
        let mut data = Vec::new();
        if let Some(path) = &self.path {
            data.push(DataSource::Path(path.clone()));
        }
        if let Some(content) = &self.content {
            data.push(DataSource::Content(content.clone()));
        }
        if let Some(url) = &self.url {
            if url.trim().is_empty() {
                return Err(Error::validation("url must not be empty"));
            }
            data.push(DataSource::Url(url.clone()));
        }
        if data.len() > 1 {
            return Err(Error::validation(
                "conflicting sources: give only one of path, content or url",
            ));
        }

        let schema = match (&self.schema_path, &self.schema_content) {
            (Some(_), Some(_)) => {
                return Err(Error::validation(
                    "conflicting schema sources: give schema_path or schema_content, not both",
                ))
            }
            (Some(path), None) => Some(SchemaSource::Path(path.clone())),
            (None, Some(content)) => Some(SchemaSource::Content(content.clone())),
            (None, None) => None,
        };

        let data = data.pop();
        if data.is_none() && schema.is_none() {
            return Err(Error::validation(
                "no source given: need a path, content, url or schema",
            ));
        }
        if data.is_none() && self.na_values.is_some() {
            return Err(Error::validation("na_values requires a data source"));
        }

        let format = match &self.data_format {
            Some(f) => f.parse()?,
            None => DataFormat::default(),
        };

        Ok(ResolvedSource {
            data,
            schema,
            format,
            na_values: self.na_values.clone(),
        })
    }
}

#[derive(Debug)]
enum DataSource {
    Path(PathBuf),
    Content(String),
    Url(String),
}

#[derive(Debug)]
enum SchemaSource {
    Path(PathBuf),
    Content(String),
}

#[derive(Debug)]
struct ResolvedSource {
    data: Option<DataSource>,
    schema: Option<SchemaSource>,
    format: DataFormat,
    na_values: Option<Vec<String>>,
}

impl ResolvedSource {
    async fn into_body(self) -> Result<RequestBody> {
        let mut fields = Vec::new();
        let mut files = Vec::new();

        if let Some(na_values) = self.na_values {
            fields.push(("na_values".to_string(), json!(na_values).to_string()));
        }

        match self.data {
            Some(DataSource::Url(url)) => fields.push(("url".to_string(), url)),
            Some(DataSource::Path(path)) => files.push(FilePart {
                field: self.format.file_field().to_string(),
                filename: filename_of(&path, self.format.default_filename()),
                bytes: tokio::fs::read(&path).await?,
            }),
            Some(DataSource::Content(content)) => files.push(FilePart {
                field: self.format.file_field().to_string(),
                filename: self.format.default_filename().to_string(),
                bytes: content.into_bytes(),
            }),
            None => {}
        }

        match self.schema {
            Some(SchemaSource::Path(path)) => files.push(FilePart {
                field: "schema".to_string(),
                filename: filename_of(&path, "schema.json"),
                bytes: tokio::fs::read(&path).await?,
            }),
            Some(SchemaSource::Content(content)) => files.push(FilePart {
                field: "schema".to_string(),
                filename: "schema.json".to_string(),
                bytes: content.into_bytes(),
            }),
            None => {}
        }

        if files.is_empty() {
            Ok(RequestBody::Form(fields))
        } else {
            Ok(RequestBody::Multipart { fields, files })
        }
    }
}

fn filename_of(path: &Path, fallback: &str) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(fallback)
        .to_string()
}

/// Per-column schema entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    #[serde(default)]
    pub simpletype: Option<String>,
    #[serde(default)]
    pub olap_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Snapshot of `/datasets/{id}/info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub attribution: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub num_columns: Option<u64>,
    #[serde(default)]
    pub num_rows: Option<u64>,
    #[serde(default)]
    pub state: ResourceState,
    #[serde(default)]
    pub schema: Option<BTreeMap<String, ColumnInfo>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatasetInfo {
    pub fn columns(&self) -> Vec<String> {
        self.schema
            .as_ref()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Arguments for [`Dataset::get_data`].
///
/// `select` and `query` are taken as raw JSON so their shape can be checked
/// before anything is sent.
#[derive(Debug, Clone, Default)]
pub struct DataRequest {
    select: Option<Value>,
    query: Option<Value>,
    limit: Option<u64>,
    index: bool,
    count: bool,
    format: Option<String>,
}

impl DataRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, select: impl Into<Value>) -> Self {
        self.select = Some(select.into());
        self
    }

    pub fn query(mut self, query: impl Into<Value>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Include each row's index.
    pub fn index(mut self, index: bool) -> Self {
        self.index = index;
        self
    }

    /// Ask for the number of matching rows instead of the rows.
    pub fn count(mut self, count: bool) -> Self {
        self.count = count;
        self
    }

    /// Only `"csv"` is accepted.
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataResult {
    Rows(Vec<Row>),
    Count(u64),
    Csv(String),
}

impl DataResult {
    /// True when nothing matched.
    pub fn is_empty(&self) -> bool {
        match self {
            DataResult::Rows(rows) => rows.is_empty(),
            DataResult::Count(n) => *n == 0,
            // header only
            DataResult::Csv(text) => text.lines().filter(|l| !l.trim().is_empty()).count() <= 1,
        }
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            DataResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            DataResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            DataResult::Count(n) => Some(*n),
            _ => None,
        }
    }

    pub fn csv(&self) -> Option<&str> {
        match self {
            DataResult::Csv(text) => Some(text),
            _ => None,
        }
    }
}

/// Client-side handle to a server-managed tabular dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    id: Option<String>,
    connection: Connection,
    state: Option<ResourceState>,
    info: Option<DatasetInfo>,
}

impl Dataset {
    /// Creates a dataset on the server and binds the returned identifier.
    pub async fn create(connection: &Connection, options: CreateOptions) -> Result<Self> {
        let body = options.resolve()?.into_body().await?;
        let payload = connection
            .perform(ApiRequest::post(routes::datasets()).body(body))
            .await?;
        let id = bound_id(payload)?;
        info!(dataset = %id, "created dataset");

        Ok(Self {
            id: Some(id),
            connection: connection.clone(),
            state: Some(ResourceState::Pending),
            info: None,
        })
    }

    /// [`Dataset::create`] through the process-wide default connection.
    pub async fn create_default(options: CreateOptions) -> Result<Self> {
        Self::create(&default_connection()?, options).await
    }

    /// Handle for an existing server dataset. No request is made.
    pub fn attach(connection: &Connection, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            connection: connection.clone(),
            state: None,
            info: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_bound(&self) -> bool {
        self.id.is_some()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// State from the most recent round trip, without a request.
    pub fn last_state(&self) -> Option<ResourceState> {
        self.state
    }

    /// Info from the most recent [`Dataset::get_info`], without a request.
    pub fn last_info(&self) -> Option<&DatasetInfo> {
        self.info.as_ref()
    }

    pub(crate) fn require_id(&self) -> Result<&str> {
        self.id.as_deref().ok_or(Error::Unbound)
    }

    /// Replaces the server data behind this handle, keeping the object.
    /// `id` rebinds the handle first; without it the handle must be bound.
    pub async fn reset(&mut self, options: CreateOptions, id: Option<String>) -> Result<()> {
        let target = match id {
            Some(id) => id,
            None => self.require_id()?.to_string(),
        };
        let body = options.resolve()?.into_body().await?;
        let payload = self
            .connection
            .perform(ApiRequest::put(routes::dataset_reset(&target)).body(body))
            .await?;
        if let Some(message) = payload.error_message() {
            return Err(Error::remote(None, message));
        }
        info!(dataset = %target, "reset dataset");

        self.id = Some(target);
        self.state = Some(ResourceState::Pending);
        self.info = None;
        Ok(())
    }

    /// Deletes the server dataset and unbinds this handle. Deleting an
    /// unbound handle is an error.
    pub async fn delete(&mut self) -> Result<()> {
        let id = self.require_id()?.to_string();
        let payload = self
            .connection
            .perform(ApiRequest::delete(routes::dataset(&id)))
            .await?;
        if let Some(message) = payload.error_message() {
            return Err(Error::remote(None, message));
        }
        info!(dataset = %id, "deleted dataset");

        self.id = None;
        self.state = None;
        self.info = None;
        Ok(())
    }

    async fn refresh_info(&mut self) -> Result<&DatasetInfo> {
        let id = self.require_id()?;
        let map = self
            .connection
            .perform(ApiRequest::get(routes::dataset_info(id)))
            .await
            .and_then(checked_object)?;
        let info: DatasetInfo = serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::remote(None, format!("malformed dataset info: {}", e)))?;

        self.state = Some(info.state);
        Ok(self.info.insert(info))
    }

    pub async fn get_info(&mut self) -> Result<DatasetInfo> {
        self.refresh_info().await.cloned()
    }

    pub async fn state(&mut self) -> Result<ResourceState> {
        Ok(self.refresh_info().await?.state)
    }

    pub async fn columns(&mut self) -> Result<Vec<String>> {
        Ok(self.refresh_info().await?.columns())
    }

    pub async fn num_columns(&mut self) -> Result<u64> {
        Ok(self.refresh_info().await?.num_columns.unwrap_or(0))
    }

    pub async fn num_rows(&mut self) -> Result<u64> {
        Ok(self.refresh_info().await?.num_rows.unwrap_or(0))
    }

    /// Overwrites the supplied metadata keys, leaving the others untouched.
    pub async fn set_info(&self, fields: &Value) -> Result<()> {
        let fields = scalar_fields("info", fields)?;
        let id = self.require_id()?;
        let form = fields
            .into_iter()
            .map(|(k, v)| (k, value_to_field(&v)))
            .collect();
        self.connection
            .perform(ApiRequest::put(routes::dataset_info(id)).body(RequestBody::Form(form)))
            .await
            .and_then(checked_object)?;
        Ok(())
    }

    /// Reads rows, a row count or CSV text. A filter that matches nothing
    /// gives an empty result, not an error.
    pub async fn get_data(&self, request: &DataRequest) -> Result<DataResult> {
        let select = validate_select(request.select.as_ref())?;
        let query = validate_query(request.query.as_ref())?;
        let csv = match request.format.as_deref() {
            None => false,
            Some("csv") => true,
            Some(other) => {
                return Err(Error::validation(format!("format must be csv, got {}", other)))
            }
        };
        if csv && request.count {
            return Err(Error::validation("count cannot be combined with csv format"));
        }
        let id = self.require_id()?;

        let mut req = ApiRequest::get(routes::dataset(id));
        if let Some(select) = &select {
            req = req.param("select", select.to_param());
        }
        if let Some(query) = &query {
            req = req.param("query", query.to_param());
        }
        if let Some(limit) = request.limit {
            req = req.param("limit", limit.to_string());
        }
        if request.index {
            req = req.param("index", "true");
        }
        if request.count {
            req = req.param("count", "true");
        }
        if csv {
            req = req.param("format", "csv");
        }

        let payload = self.connection.perform(req).await?;
        if let Some(message) = payload.error_message() {
            return Err(Error::remote(None, message));
        }

        if request.count {
            return match payload.into_json()? {
                Value::Number(n) => n
                    .as_u64()
                    .or_else(|| n.as_f64().map(|f| f as u64))
                    .map(DataResult::Count)
                    .ok_or_else(|| Error::remote(None, format!("invalid row count {}", n))),
                other => Err(Error::remote(
                    None,
                    format!("expected a row count, got {}", validate::kind(&other)),
                )),
            };
        }

        if csv {
            return match payload {
                Payload::Text(text) | Payload::Json(Value::String(text)) => Ok(DataResult::Csv(text)),
                Payload::Json(other) => Err(Error::remote(
                    None,
                    format!("expected CSV text, got {}", validate::kind(&other)),
                )),
            };
        }

        match payload.into_json()? {
            Value::Null => Ok(DataResult::Rows(Vec::new())),
            rows @ Value::Array(_) => serde_json::from_value(rows)
                .map(DataResult::Rows)
                .map_err(|e| Error::remote(None, format!("malformed rows: {}", e))),
            other => Err(Error::remote(
                None,
                format!("expected a list of rows, got {}", validate::kind(&other)),
            )),
        }
    }

    /// Appends rows. `rows` must be a non-empty list of mappings whose
    /// values are scalars or null.
    pub async fn update_data(&self, rows: &Value) -> Result<()> {
        let rows = match rows {
            Value::Array(rows) if !rows.is_empty() => rows,
            Value::Array(_) => return Err(Error::validation("rows must not be empty")),
            other => {
                return Err(Error::validation(format!(
                    "rows must be a list of mappings, got {}",
                    validate::kind(other)
                )))
            }
        };
        for row in rows {
            scalar_fields("row", row)?;
        }
        let id = self.require_id()?;

        let body = RequestBody::Form(vec![("update".to_string(), Value::Array(rows.clone()).to_string())]);
        self.connection
            .perform(ApiRequest::put(routes::dataset(id)).body(body))
            .await
            .and_then(checked_object)?;
        Ok(())
    }

    /// The row at `index`. A missing row comes back as the server's
    /// `{"error": ...}` answer.
    pub async fn get_row(&self, index: u64) -> Result<Value> {
        let id = self.require_id()?;
        self.connection
            .perform(ApiRequest::get(routes::row(id, index)))
            .await?
            .into_json()
    }

    pub async fn update_row(&self, index: u64, fields: &Value) -> Result<Value> {
        let fields = scalar_fields("row", fields)?;
        let id = self.require_id()?;
        let body = RequestBody::Form(vec![("data".to_string(), Value::Object(fields).to_string())]);
        self.connection
            .perform(ApiRequest::put(routes::row(id, index)).body(body))
            .await?
            .into_json()
    }

    pub async fn delete_row(&self, index: u64) -> Result<Value> {
        let id = self.require_id()?;
        self.connection
            .perform(ApiRequest::delete(routes::row(id, index)))
            .await?
            .into_json()
    }

    pub async fn resample(
        &self,
        date_column: &str,
        interval: &str,
        how: &str,
        query: Option<&Value>,
    ) -> Result<Value> {
        for (name, value) in [("date_column", date_column), ("interval", interval), ("how", how)] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("{} must not be empty", name)));
            }
        }
        let query = validate_query(query)?;
        let id = self.require_id()?;

        let mut req = ApiRequest::get(routes::resample(id))
            .param("date_column", date_column)
            .param("interval", interval)
            .param("how", how);
        if let Some(query) = &query {
            req = req.param("query", query.to_param());
        }
        self.connection.perform(req).await.and_then(checked_json)
    }

    pub async fn rolling(&self, win_type: &str, window: u32, query: Option<&Value>) -> Result<Value> {
        if win_type.trim().is_empty() {
            return Err(Error::validation("win_type must not be empty"));
        }
        if window == 0 {
            return Err(Error::validation("window must be at least 1"));
        }
        let query = validate_query(query)?;
        let id = self.require_id()?;

        let mut req = ApiRequest::get(routes::rolling(id))
            .param("win_type", win_type)
            .param("window", window.to_string());
        if let Some(query) = &query {
            req = req.param("query", query.to_param());
        }
        self.connection.perform(req).await.and_then(checked_json)
    }

    /// Per-column summary statistics, optionally grouped.
    pub async fn get_summary(
        &self,
        select: Option<&Value>,
        query: Option<&Value>,
        groups: Option<&Value>,
    ) -> Result<Map<String, Value>> {
        let select = validate_select(select)?;
        let query = validate_query(query)?;
        let groups = validate_groups(groups)?;
        let id = self.require_id()?;

        let select = select
            .map(|s| s.to_param())
            .unwrap_or_else(|| "all".to_string());
        let mut req = ApiRequest::get(routes::summary(id)).param("select", select);
        if let Some(query) = &query {
            req = req.param("query", query.to_param());
        }
        if let Some(groups) = &groups {
            req = req.param("group", groups.join(","));
        }
        self.connection.perform(req).await.and_then(checked_object)
    }

    /// One summary statistic of `field`; `None` when the summary has no
    /// such statistic. For categorical columns `"count"` totals the tallies.
    pub async fn count(&self, field: &str, method: &str) -> Result<Option<f64>> {
        if field.is_empty() || method.is_empty() {
            return Err(Error::validation("field and method must not be empty"));
        }
        let summary = self.get_summary(Some(&json!([field])), None, None).await?;
        let stats = match summary.get(field).and_then(|c| c.get("summary")) {
            Some(Value::Object(stats)) => stats,
            _ => return Ok(None),
        };

        if let Some(value) = stats.get(method).and_then(Value::as_f64) {
            return Ok(Some(value));
        }
        if method == "count" && stats.values().all(Value::is_number) {
            return Ok(Some(stats.values().filter_map(Value::as_f64).sum()));
        }
        Ok(None)
    }

    /// Service version, through a bound handle. Use
    /// [`Connection::version`] when no dataset is at hand.
    pub async fn version(&self) -> Result<Map<String, Value>> {
        self.require_id()?;
        self.connection.version().await
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id.as_deref().unwrap_or(""))
    }
}

#[async_trait]
impl Refresh for Dataset {
    fn describe(&self) -> String {
        format!("dataset {}", self.id.as_deref().unwrap_or("<unbound>"))
    }

    async fn refresh(&mut self) -> Result<ResourceState> {
        self.state().await
    }
}

/// Identifier from a create/merge/join answer.
pub(crate) fn bound_id(payload: Payload) -> Result<String> {
    if let Some(message) = payload.error_message() {
        return Err(Error::remote(None, message));
    }
    match payload.into_object()?.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(Error::remote(None, "response did not contain a dataset id")),
    }
}

fn checked_json(payload: Payload) -> Result<Value> {
    if let Some(message) = payload.error_message() {
        warn!(%message, "request rejected by server");
        return Err(Error::remote(None, message));
    }
    payload.into_json()
}

fn checked_object(payload: Payload) -> Result<Map<String, Value>> {
    if let Some(message) = payload.error_message() {
        warn!(%message, "request rejected by server");
        return Err(Error::remote(None, message));
    }
    payload.into_object()
}

/// A non-empty mapping whose values are scalars or null.
fn scalar_fields(what: &str, value: &Value) -> Result<Map<String, Value>> {
    let map = match value {
        Value::Object(map) if !map.is_empty() => map,
        Value::Object(_) => return Err(Error::validation(format!("{} has no fields", what))),
        other => {
            return Err(Error::validation(format!(
                "{} must be a mapping, got {}",
                what,
                validate::kind(other)
            )))
        }
    };
    if let Some((key, bad)) = map.iter().find(|(_, v)| !(is_scalar(v) || v.is_null())) {
        return Err(Error::validation(format!(
            "{} field {} cannot hold {}",
            what,
            key,
            validate::kind(bad)
        )));
    }
    Ok(map.clone())
}

fn value_to_field(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
