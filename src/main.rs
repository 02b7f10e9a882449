use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use homedir::my_home;
use tracing_subscriber::EnvFilter;

mod backup;
mod catalog;
mod cli;
mod config;
mod corpus;
mod errors;
mod lock;
mod models;
mod product;
mod retriever;
mod service;
mod store;
#[cfg(test)]
mod tests;

use config::Config;
use models::ModelProvider;
use service::CatalogService;

fn base_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CATALOG_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/catalog-search"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    #[cfg(feature = "markdown-docs")]
    if let cli::Command::MarkdownDocs {} = args.command {
        clap_markdown::print_help_markdown::<cli::Args>();
        return Ok(());
    }

    let base_path = base_path()?;
    let config = Config::load_with(&base_path)
        .with_context(|| format!("failed to load config from {}", base_path.display()))?;
    let models = Arc::new(ModelProvider::from_config(&config, base_path.clone()));
    let service = CatalogService::open(config, models)?;

    match args.command {
        #[cfg(feature = "markdown-docs")]
        cli::Command::MarkdownDocs {} => Ok(()),

        cli::Command::Build { input, replace } => cli::handle_build(&input, replace, &service),
        cli::Command::Search { query, mode, top_k } => cli::handle_search(&query, mode, top_k, &service),
        cli::Command::Add { product } => cli::handle_add(product, &service),
        cli::Command::Update { id, fields } => cli::handle_update(id, fields, &service),
        cli::Command::Delete { ids } => cli::handle_delete(&ids, &service),
        cli::Command::Get { id } => cli::handle_get(id, &service),
        cli::Command::Recent { limit } => cli::handle_recent(limit, &service),
        cli::Command::Stats {} => cli::handle_stats(&service),
        cli::Command::Reconcile {} => cli::handle_reconcile(&service),
        cli::Command::Backup { output } => cli::handle_backup(output, &service),
    }
}
