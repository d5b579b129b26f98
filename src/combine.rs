//! Merge and join: new datasets computed from existing ones.
//!
//! A refusal by the server (incompatible schemas, a join key that does not
//! exist, nothing to match) is a normal answer and comes back as `Ok(None)`,
//! whether it arrives as a 4xx status or as an `{"error": ...}` body.
//! Malformed requests fail before anything is sent.

use crate::connection::{default_connection, routes, Answer, ApiRequest, Connection, RequestBody};
use crate::dataset::{bound_id, Dataset};
use crate::error::{Error, Result};
use serde_json::Value;
use tracing::{info, warn};

/// Concatenates the rows of two or more datasets into a new dataset.
/// Without `connection` the process-wide default is used.
pub async fn merge(datasets: &[&Dataset], connection: Option<&Connection>) -> Result<Option<Dataset>> {
    if datasets.len() < 2 {
        return Err(Error::validation(format!(
            "merge needs at least two datasets, got {}",
            datasets.len()
        )));
    }
    let ids = datasets
        .iter()
        .map(|d| d.require_id().map(|id| Value::String(id.to_string())))
        .collect::<Result<Vec<_>>>()?;
    let connection = resolve(connection)?;

    let body = RequestBody::Form(vec![("datasets".to_string(), Value::Array(ids).to_string())]);
    let payload = match connection
        .submit(ApiRequest::post(routes::merge()).body(body))
        .await?
    {
        Answer::Accepted(payload) => payload,
        Answer::Refused(message) => {
            warn!(%message, "merge rejected");
            return Ok(None);
        }
    };

    let id = bound_id(payload)?;
    info!(dataset = %id, sources = datasets.len(), "merged datasets");
    Ok(Some(Dataset::attach(&connection, id)))
}

/// Joins `right` onto `left` by the column `on`.
pub async fn join(
    left: &Dataset,
    right: &Dataset,
    on: &str,
    connection: Option<&Connection>,
) -> Result<Option<Dataset>> {
    if on.trim().is_empty() {
        return Err(Error::validation("join column must not be empty"));
    }
    let left_id = left.require_id()?;
    let right_id = right.require_id()?;
    let connection = resolve(connection)?;

    let body = RequestBody::Form(vec![
        ("dataset_id".to_string(), left_id.to_string()),
        ("other_dataset_id".to_string(), right_id.to_string()),
        ("on".to_string(), on.to_string()),
    ]);
    let payload = match connection
        .submit(ApiRequest::post(routes::join()).body(body))
        .await?
    {
        Answer::Accepted(payload) => payload,
        Answer::Refused(message) => {
            warn!(%message, on, "join rejected");
            return Ok(None);
        }
    };

    let id = bound_id(payload)?;
    info!(dataset = %id, left = %left_id, right = %right_id, on, "joined datasets");
    Ok(Some(Dataset::attach(&connection, id)))
}

fn resolve(connection: Option<&Connection>) -> Result<Connection> {
    match connection {
        Some(connection) => Ok(connection.clone()),
        None => default_connection(),
    }
}
