use clap::Parser;
use dbrepo::config::{Action, Args};
use dbrepo::{Config, DbRepository, PgConnectionProvider, PgSchemaMapper, Value, telemetry};
use serde_json::json;
use std::sync::Arc;

/// Command-line parameters are JSON literals where they parse as one, text otherwise.
fn parse_params(params: &[String]) -> Vec<Value> {
    params
        .iter()
        .map(|raw| serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::Text(raw.clone())))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;
    tracing::debug!("{:?}", args);

    let Some(action) = args.action else {
        anyhow::bail!("nothing to run: pass one of `query`, `exec` or `scalar`");
    };

    let url = config.database_url()?;
    let provider = PgConnectionProvider::new(url)?;
    let repo = DbRepository::new(provider, config.repository_options(Arc::new(PgSchemaMapper::new())));

    let output = match action {
        Action::Query { sql, params } => json!(repo.execute_query_rows(&sql, parse_params(&params), None).await?),
        Action::Exec { sql, params } => json!({ "affected": repo.execute_non_query(&sql, parse_params(&params), None).await? }),
        Action::Scalar { sql, params } => json!(repo.execute_scalar(&sql, parse_params(&params), None).await?),
    };
    repo.close().await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
