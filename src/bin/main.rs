//! Command-line client for a bamboo service.
//!
//! # Configuration
//!
//! Settings are read, in increasing precedence, from built-in defaults,
//! `config/default.toml`, `config/local.toml`, environment variables prefixed
//! with `BAMBOO_` (for example `BAMBOO_CONNECTION__URL`), and finally the
//! `--url` flag. A `.env` file only fills in variables the environment does
//! not already set.
//!
//! ```text
//! bamboo create --path good_eats.csv --wait
//! bamboo data <ID> --query '{"food_type": "lunch"}' --select food_type,amount
//! bamboo data <ID> --count
//! bamboo add-calculation <ID> sum_amount 'sum(amount)' --groups food_type
//! bamboo aggregations <ID>
//! bamboo merge <ID> <ID>
//! bamboo join <LEFT> <RIGHT> food_type
//! bamboo delete <ID>
//! ```

use bamboo::{
    BambooSettings, Connection, CreateOptions, DataRequest, DataResult, Dataset, PollPolicy,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct CliArgs {
    /// Service endpoint, overriding configuration
    #[arg(long, env = "BAMBOO_URL")]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the service version
    Version,
    /// Create a dataset
    Create {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        schema: Option<PathBuf>,
        /// csv or json
        #[arg(long)]
        format: Option<String>,
        #[arg(long, value_delimiter = ',')]
        na_values: Option<Vec<String>>,
        /// Poll until the dataset is no longer pending
        #[arg(long)]
        wait: bool,
    },
    /// Show dataset info
    Info { id: String },
    /// Read rows
    Data {
        id: String,
        #[arg(long, value_delimiter = ',')]
        select: Option<Vec<String>>,
        /// JSON mapping of column to value
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        count: bool,
        #[arg(long)]
        csv: bool,
    },
    /// Delete a dataset
    Delete { id: String },
    /// List calculations
    Calculations { id: String },
    /// Add a calculation
    AddCalculation {
        id: String,
        name: String,
        formula: String,
        #[arg(long, value_delimiter = ',')]
        groups: Option<Vec<String>>,
    },
    /// List aggregation datasets by group
    Aggregations { id: String },
    /// Merge two or more datasets
    Merge {
        #[arg(required = true, num_args = 2..)]
        ids: Vec<String>,
    },
    /// Join two datasets on a column
    Join {
        left: String,
        right: String,
        on: String,
    },
    /// Poll a dataset until it settles
    Wait { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = CliArgs::parse();
    let mut settings = BambooSettings::new()?;
    if let Some(url) = cli.url {
        settings.connection.url = url;
    }
    let connection = Connection::new(&settings.connection)?;
    let policy = PollPolicy::from(&settings.poll);

    match cli.command {
        Command::Version => print_json(&Value::Object(connection.version().await?)),
        Command::Create {
            path,
            url,
            schema,
            format,
            na_values,
            wait,
        } => {
            let mut options = CreateOptions::new();
            if let Some(path) = path {
                options = options.path(path);
            }
            if let Some(url) = url {
                options = options.url(url);
            }
            if let Some(schema) = schema {
                options = options.schema_path(schema);
            }
            if let Some(format) = format {
                options = options.data_format(format);
            }
            if let Some(na_values) = na_values {
                options = options.na_values(na_values);
            }

            let mut dataset = Dataset::create(&connection, options).await?;
            println!("{}", dataset);
            if wait {
                let state = bamboo::poll::wait_until_settled(&mut dataset, policy).await?;
                println!("{}", state);
            }
        }
        Command::Info { id } => {
            let mut dataset = Dataset::attach(&connection, id);
            print_json(&serde_json::to_value(dataset.get_info().await?)?);
        }
        Command::Data {
            id,
            select,
            query,
            limit,
            count,
            csv,
        } => {
            let mut request = DataRequest::new().count(count);
            if let Some(select) = select {
                request = request.select(select);
            }
            if let Some(query) = query {
                request = request.query(serde_json::from_str::<Value>(&query)?);
            }
            if let Some(limit) = limit {
                request = request.limit(limit);
            }
            if csv {
                request = request.format("csv");
            }

            match Dataset::attach(&connection, id).get_data(&request).await? {
                DataResult::Rows(rows) => print_json(&json!(rows)),
                DataResult::Count(n) => println!("{}", n),
                DataResult::Csv(text) => print!("{}", text),
            }
        }
        Command::Delete { id } => {
            Dataset::attach(&connection, id).delete().await?;
        }
        Command::Calculations { id } => {
            let calculations = Dataset::attach(&connection, id).get_calculations().await?;
            for calc in calculations {
                println!("{}\t[{}]\t{}\t{}", calc.name, calc.group, calc.state, calc.formula);
            }
        }
        Command::AddCalculation {
            id,
            name,
            formula,
            groups,
        } => {
            let groups = groups.map(|g| json!(g));
            let accepted = Dataset::attach(&connection, id)
                .add_calculation(&name, &formula, groups.as_ref())
                .await?;
            println!("{}", accepted);
        }
        Command::Aggregations { id } => {
            for (group, dataset) in Dataset::attach(&connection, id).get_aggregate_datasets().await? {
                println!("[{}]\t{}", group, dataset);
            }
        }
        Command::Merge { ids } => {
            let datasets: Vec<Dataset> = ids
                .into_iter()
                .map(|id| Dataset::attach(&connection, id))
                .collect();
            let refs: Vec<&Dataset> = datasets.iter().collect();
            match bamboo::merge(&refs, Some(&connection)).await? {
                Some(merged) => println!("{}", merged),
                None => eprintln!("merge rejected by server"),
            }
        }
        Command::Join { left, right, on } => {
            let left = Dataset::attach(&connection, left);
            let right = Dataset::attach(&connection, right);
            match bamboo::join(&left, &right, &on, Some(&connection)).await? {
                Some(joined) => println!("{}", joined),
                None => eprintln!("join rejected by server"),
            }
        }
        Command::Wait { id } => {
            let mut dataset = Dataset::attach(&connection, id);
            let state = bamboo::poll::wait_until_settled(&mut dataset, policy).await?;
            println!("{}", state);
        }
    }

    Ok(())
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}
