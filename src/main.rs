use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use querier::query::structured::StructuredQuery;
use querier::{Collaborators, InMemoryCatalog, InMemoryStorageRegistry, QueryContext, QueryService};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "tsquery")]
#[command(about = "tsquery - structured time-series query federation")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: TsQueryCommands,
}

#[derive(Subcommand)]
enum TsQueryCommands {
    /// Resolve a structured query and print its routing and PromQL
    Explain {
        /// JSON file holding the structured query
        file: PathBuf,
    },
    #[command(flatten)]
    Common(CommonCommands),
}

async fn explain(config: &common::config::Configuration, file: &Path) -> Result<()> {
    let payload = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let query: StructuredQuery =
        serde_json::from_str(&payload).context("Failed to parse structured query")?;

    let catalog = Arc::new(
        InMemoryCatalog::from_config(&config.catalog).context("Failed to build catalog")?,
    );
    let service = QueryService::new(
        config.query.clone(),
        Collaborators::shared(catalog),
        Arc::new(InMemoryStorageRegistry::new()),
    );

    let cancel = CancellationToken::new();
    let span = tracing::info_span!("explain", space_uid = %query.space_uid);
    let ctx = QueryContext::new(cancel.clone()).with_span(span);

    let (reference, expr) = tokio::select! {
        result = service.explain(&ctx, &query) => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("Interrupted");
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&reference).context("Failed to serialize query reference")?
    );
    println!("{expr}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on CLI arguments
    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    match &cli.command {
        TsQueryCommands::Explain { file } => explain(&config, file).await,
        TsQueryCommands::Common(command) => utils::handle_common_command(command, &config),
    }
}
