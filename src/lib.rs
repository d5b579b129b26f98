//! bamboo: async client for the bamboo tabular dataset service
//!
//! The service ingests tabular data, computes calculations and aggregations,
//! and merges or joins datasets, all asynchronously on the server. This
//! crate models those remote resources: it validates requests before they
//! are sent, makes one round trip per operation, and reports the server's
//! view of each resource's state.
//!
//! # Example
//!
//! ```rust,no_run
//! use bamboo::{Connection, CreateOptions, DataRequest, Dataset, PollPolicy, ResourceState};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::with_url("http://bamboo.io")?;
//!
//!     // Upload a CSV file
//!     let mut dataset = Dataset::create(
//!         &connection,
//!         CreateOptions::new().path("good_eats.csv").na_values(["n/a"]),
//!     ).await?;
//!
//!     // The server ingests asynchronously; waiting is opt-in
//!     let state = bamboo::poll::wait_until_settled(&mut dataset, PollPolicy::default()).await?;
//!     assert_eq!(state, ResourceState::Ready);
//!
//!     // Query rows
//!     let lunch = dataset
//!         .get_data(&DataRequest::new().select(vec!["food_type", "amount"]).query(json!({"food_type": "lunch"})))
//!         .await?;
//!     println!("{} lunch rows", lunch.rows().map(|r| r.len()).unwrap_or(0));
//!
//!     // Add an aggregation and list the derived datasets
//!     dataset.add_calculation("sum_amount", "sum(amount)", Some(&json!(["food_type"]))).await?;
//!     for (group, agg) in dataset.get_aggregate_datasets().await? {
//!         println!("[{}] -> {}", group, agg);
//!     }
//!
//!     dataset.delete().await?;
//!     Ok(())
//! }
//! ```

pub mod calculation;
pub mod combine;
pub mod config;
pub mod connection;
pub mod dataset;
pub mod error;
pub mod poll;
pub mod state;
pub mod validate;

#[cfg(test)]
mod tests;

pub use calculation::{Calculation, CalculationSpec, CalculationWatch, GroupSignature};
pub use combine::{join, merge};
pub use config::BambooSettings;
pub use connection::{default_connection, Answer, ApiRequest, Connection, HttpTransport, Payload, Transport};
pub use dataset::{CreateOptions, DataRequest, DataResult, Dataset, DatasetInfo, Row};
pub use error::{Error, Result};
pub use poll::PollPolicy;
pub use state::{Refresh, ResourceState};
