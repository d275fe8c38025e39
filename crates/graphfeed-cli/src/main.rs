//! graphfeed - live document-database source CLI
//!
//! Drives a schema-described record graph stored in SurrealDB.
//!
//! ## Commands
//!
//! - `watch`: Stream a live query's operations as JSON lines
//! - `query`: Run an oql query once
//! - `apply`: Apply a transform from a JSON file
//! - `tables`: List the database's tables

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use graphfeed_core::metrics::METRICS;
use graphfeed_core::{
    Expression, Operation, QueryResult, ReplayPolicy, SchemaDefinition, Source,
    SourceConfig, SourceQuery, Transform,
};
use graphfeed_state::{Driver, Query, SurrealDriver};
use serde_json::Value;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "graphfeed")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live document-database source for record graphs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to the JSON schema describing models and relationships
    #[arg(long, global = true, env = "GRAPHFEED_SCHEMA")]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream operations for a live query until interrupted
    Watch {
        /// oql expression as JSON, e.g. '{"op":"recordsOfType","args":["message"]}'
        #[arg(long, conflicts_with = "table", required_unless_present = "table")]
        oql: Option<String>,

        /// Watch every document of a table
        #[arg(long)]
        table: Option<String>,

        /// Operations replayed to the watcher on start (0 = none, default: all)
        #[arg(long)]
        replay: Option<usize>,
    },

    /// Run an oql query once and print the result
    Query {
        /// oql expression as JSON
        #[arg(long)]
        oql: String,
    },

    /// Apply a transform read from a JSON file
    ///
    /// The file holds either `{"operations": [...]}` or a bare array of
    /// `{op, path, value}` operations.
    Apply {
        /// Path to the transform file
        file: PathBuf,
    },

    /// List tables in the database
    Tables,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    graphfeed_core::init_tracing(cli.json, level);

    let driver = Arc::new(
        SurrealDriver::from_env()
            .await
            .context("Failed to connect to graphfeed database")?,
    );

    match cli.command {
        Commands::Watch { oql, table, replay } => {
            let replay = match replay {
                None => ReplayPolicy::All,
                Some(0) => ReplayPolicy::None,
                Some(n) => ReplayPolicy::Latest(n),
            };
            let source = open_source(driver, cli.schema.as_deref(), replay).await?;
            let query = match (oql, table) {
                (Some(oql), _) => SourceQuery::oql(parse_expression(&oql)?),
                (None, Some(table)) => SourceQuery::native(Query::table(table)),
                (None, None) => anyhow::bail!("either --oql or --table is required"),
            };
            cmd_watch(&source, &query).await
        }
        Commands::Query { oql } => {
            let source = open_source(driver, cli.schema.as_deref(), ReplayPolicy::All).await?;
            cmd_query(&source, &parse_expression(&oql)?).await
        }
        Commands::Apply { file } => {
            let source = open_source(driver, cli.schema.as_deref(), ReplayPolicy::All).await?;
            cmd_apply(&source, &file).await
        }
        Commands::Tables => cmd_tables(driver.as_ref()).await,
    }
}

/// Load the schema, make sure its tables exist, and build a source.
async fn open_source(
    driver: Arc<SurrealDriver>,
    schema_path: Option<&Path>,
    replay: ReplayPolicy,
) -> Result<Source<SurrealDriver>> {
    let path = schema_path.context("--schema (or GRAPHFEED_SCHEMA) is required")?;
    let schema = SchemaDefinition::from_file(path)
        .with_context(|| format!("Failed to load schema from {}", path.display()))?;
    let models: Vec<String> = schema.models.keys().cloned().collect();

    let config = SourceConfig {
        replay,
        ..SourceConfig::default()
    };
    let source = Source::with_config(Arc::clone(&driver), Arc::new(schema), config);

    let tables: Vec<String> = models
        .iter()
        .map(|model| source.serializer().table_name(model))
        .collect();
    let tables: Vec<&str> = tables.iter().map(String::as_str).collect();
    driver
        .define_tables(&tables)
        .await
        .context("Failed to define tables")?;

    Ok(source)
}

fn parse_expression(json: &str) -> Result<Expression> {
    serde_json::from_str(json).context("oql expression is not valid JSON")
}

async fn cmd_watch(source: &Source<SurrealDriver>, query: &SourceQuery) -> Result<()> {
    let live = source
        .live_query(query)
        .await
        .context("Failed to start live query")?;
    info!(model = live.model(), "Watching live query");

    let mut operations = live.subscribe();
    // This stream is the only consumer; stop retaining history for others.
    live.set_replay(ReplayPolicy::None);
    loop {
        tokio::select! {
            item = operations.next() => match item {
                Some(Ok(operation)) => println!("{}", serde_json::to_string(&operation)?),
                Some(Err(e)) => return Err(e).context("Live query failed"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    live.close();
    METRICS.flush();
    Ok(())
}

async fn cmd_query(source: &Source<SurrealDriver>, expression: &Expression) -> Result<()> {
    let result = source
        .query(&SourceQuery::oql(expression.clone()))
        .await
        .context("Query failed")?;

    let output = match result {
        QueryResult::Record(record) => serde_json::to_value(record)?,
        QueryResult::Records(records) => serde_json::to_value(records)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_apply(source: &Source<SurrealDriver>, file: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let transform = parse_transform(&contents)?;

    source
        .transform(&transform)
        .await
        .with_context(|| format!("Transform {} failed", transform.id))?;

    println!(
        "Applied transform {} ({} operations)",
        transform.id,
        transform.operations.len()
    );
    METRICS.flush();
    Ok(())
}

fn parse_transform(contents: &str) -> Result<Transform> {
    let value: Value = serde_json::from_str(contents).context("Transform is not valid JSON")?;
    let transform = match value {
        Value::Array(_) => Transform::new(
            serde_json::from_value::<Vec<Operation>>(value).context("Invalid operation")?,
        ),
        other => serde_json::from_value(other).context("Invalid transform")?,
    };
    Ok(transform)
}

async fn cmd_tables(driver: &SurrealDriver) -> Result<()> {
    let tables = driver.list_tables().await.context("Failed to list tables")?;

    if tables.is_empty() {
        println!("No tables found");
        return Ok(());
    }
    for table in tables {
        println!("{}", table);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn watch_requires_a_query() {
        assert!(Cli::try_parse_from(["graphfeed", "watch"]).is_err());
        assert!(Cli::try_parse_from(["graphfeed", "watch", "--table", "messages"]).is_ok());
        assert!(Cli::try_parse_from([
            "graphfeed", "watch", "--table", "messages", "--oql", "{}"
        ])
        .is_err());
    }

    #[test]
    fn transform_files_accept_both_shapes() {
        let bare = parse_transform(
            r#"[{"op": "replace", "path": "message/m1/attributes/body", "value": "Hi"}]"#,
        )
        .unwrap();
        assert_eq!(bare.operations.len(), 1);

        let wrapped = parse_transform(
            r#"{"operations": [{"op": "remove", "path": "message/m1"}]}"#,
        )
        .unwrap();
        assert_eq!(wrapped.operations[0].kind(), "removeRecord");

        assert!(parse_transform(r#"[{"op": "move", "path": "message/m1"}]"#).is_err());
    }
}
