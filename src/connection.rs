//! Connection to a bamboo service.
//!
//! A [`Connection`] pairs an endpoint root with a [`Transport`]. Every
//! resource operation builds an [`ApiRequest`] and hands it to
//! [`Connection::perform`], which makes exactly one round trip. The default
//! transport is [`HttpTransport`] (reqwest); tests substitute a mock.

use crate::config::{BambooSettings, ConnectionSettings};
use crate::error::{Error, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Url};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A file uploaded as one multipart field.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Form(Vec<(String, String)>),
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    },
}

impl RequestBody {
    /// Value of a text field, for either form or multipart bodies.
    pub fn field(&self, name: &str) -> Option<&str> {
        let fields = match self {
            RequestBody::Empty => return None,
            RequestBody::Form(fields) => fields,
            RequestBody::Multipart { fields, .. } => fields,
        };
        fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn file(&self, field: &str) -> Option<&FilePart> {
        match self {
            RequestBody::Multipart { files, .. } => files.iter().find(|f| f.field == field),
            _ => None,
        }
    }
}

/// One request against the service, relative to the endpoint root.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    /// Message of an `{"error": ...}` answer, which the service uses for
    /// well-formed requests it could not satisfy.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Payload::Json(Value::Object(map)) => map.get("error").map(|e| match e {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            _ => None,
        }
    }

    pub fn into_json(self) -> Result<Value> {
        match self {
            Payload::Json(value) => Ok(value),
            Payload::Text(text) => Err(Error::remote(
                None,
                format!("expected a JSON body, got text: {}", truncate(&text)),
            )),
        }
    }

    pub fn into_object(self) -> Result<Map<String, Value>> {
        match self.into_json()? {
            Value::Object(map) => Ok(map),
            other => Err(Error::remote(
                None,
                format!("expected a JSON object, got {}", truncate(&other.to_string())),
            )),
        }
    }
}

fn truncate(s: &str) -> String {
    const LIMIT: usize = 120;
    if s.len() <= LIMIT {
        s.to_string()
    } else {
        let mut end = LIMIT;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

/// Outcome of a request whose refusal is a normal answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Accepted(Payload),
    Refused(String),
}

/// Sends requests to the service. Implementations must collapse every
/// network, status and decoding failure into [`Error::Remote`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<Payload>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: Client,
    root: Url,
    credentials: Option<(String, String)>,
}

impl HttpTransport {
    pub fn new(settings: &ConnectionSettings) -> Result<Self> {
        let root = parse_root(&settings.url)?;
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            root,
            credentials: settings
                .credentials()
                .map(|(u, p)| (u.to_string(), p.to_string())),
        })
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        let joined = format!("{}{}", self.root.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|e| Error::Config(format!("invalid request URL {}: {}", joined, e)))
    }
}

fn parse_root(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::Config(format!("invalid endpoint {}: {}", url, e)))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<Payload> {
        let url = self.url_for(&request.path)?;
        let mut builder = self
            .client
            .request(request.method.into(), url)
            .query(&request.params);

        if let Some((user, pass)) = &self.credentials {
            builder = builder.basic_auth(user, Some(pass));
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Multipart { fields, files } => {
                let mut form = Form::new();
                for (key, value) in fields {
                    form = form.text(key, value);
                }
                for file in files {
                    form = form.part(file.field, Part::bytes(file.bytes).file_name(file.filename));
                }
                builder.multipart(form)
            }
        };

        let response = builder.send().await?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);
        let text = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| Payload::Json(v).error_message())
                .unwrap_or_else(|| truncate(&text));
            return Err(Error::remote(Some(status.as_u16()), message));
        }

        if is_json {
            serde_json::from_str(&text).map(Payload::Json).map_err(|e| {
                Error::remote(Some(status.as_u16()), format!("malformed JSON body: {}", e))
            })
        } else {
            Ok(Payload::Text(text))
        }
    }
}

/// Handle to a bamboo service. Cheap to clone; shared read-only by every
/// dataset created through it.
#[derive(Clone)]
pub struct Connection {
    root: Url,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("root", &self.root.as_str()).finish()
    }
}

impl Connection {
    pub fn new(settings: &ConnectionSettings) -> Result<Self> {
        let transport = HttpTransport::new(settings)?;
        Ok(Self {
            root: parse_root(&settings.url)?,
            transport: Arc::new(transport),
        })
    }

    /// Connection with default settings pointed at `url`.
    pub fn with_url(url: &str) -> Result<Self> {
        Self::new(&ConnectionSettings {
            url: url.to_string(),
            ..ConnectionSettings::default()
        })
    }

    pub fn with_transport(root: Url, transport: Arc<dyn Transport>) -> Self {
        Self { root, transport }
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    pub async fn perform(&self, request: ApiRequest) -> Result<Payload> {
        debug!(method = %request.method, path = %request.path, "bamboo request");
        let result = self.transport.send(request).await;
        if let Err(e) = &result {
            debug!(error = %e, "bamboo request failed");
        }
        result
    }

    /// Like [`Connection::perform`], but a 4xx status or an `{"error": ...}`
    /// body comes back as [`Answer::Refused`]. Server faults and network
    /// failures stay errors.
    pub async fn submit(&self, request: ApiRequest) -> Result<Answer> {
        match self.perform(request).await {
            Ok(payload) => Ok(match payload.error_message() {
                Some(message) => Answer::Refused(message),
                None => Answer::Accepted(payload),
            }),
            Err(Error::Remote {
                status: Some(status @ 400..=499),
                message,
            }) => {
                debug!(status, %message, "bamboo request refused");
                Ok(Answer::Refused(message))
            }
            Err(e) => Err(e),
        }
    }

    /// Version information reported by the service.
    pub async fn version(&self) -> Result<Map<String, Value>> {
        self.perform(ApiRequest::get(routes::version())).await?.into_object()
    }
}

lazy_static! {
    static ref DEFAULT_CONNECTION: std::result::Result<Connection, String> = BambooSettings::new()
        .map_err(|e| e.to_string())
        .and_then(|settings| Connection::new(&settings.connection).map_err(|e| e.to_string()));
}

/// Process-wide connection built once from [`BambooSettings::new`].
pub fn default_connection() -> Result<Connection> {
    DEFAULT_CONNECTION.clone().map_err(Error::Config)
}

pub(crate) mod routes {
    pub fn datasets() -> String {
        "/datasets".to_string()
    }

    pub fn dataset(id: &str) -> String {
        format!("/datasets/{}", id)
    }

    pub fn dataset_info(id: &str) -> String {
        format!("/datasets/{}/info", id)
    }

    pub fn dataset_reset(id: &str) -> String {
        format!("/datasets/{}/reset", id)
    }

    pub fn row(id: &str, index: u64) -> String {
        format!("/datasets/{}/row/{}", id, index)
    }

    pub fn summary(id: &str) -> String {
        format!("/datasets/{}/summary", id)
    }

    pub fn resample(id: &str) -> String {
        format!("/datasets/{}/resample", id)
    }

    pub fn rolling(id: &str) -> String {
        format!("/datasets/{}/rolling", id)
    }

    pub fn aggregations(id: &str) -> String {
        format!("/datasets/{}/aggregations", id)
    }

    pub fn calculations(id: &str) -> String {
        format!("/calculations/{}", id)
    }

    pub fn merge() -> String {
        "/datasets/merge".to_string()
    }

    pub fn join() -> String {
        "/datasets/join".to_string()
    }

    pub fn version() -> String {
        "/version".to_string()
    }
}
