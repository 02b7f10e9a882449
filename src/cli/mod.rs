use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::retriever::SearchMode;

mod handlers;
mod types;

pub use handlers::*;
pub use types::*;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate api docs in markdown format
    #[cfg(feature = "markdown-docs")]
    #[clap(hide = true)]
    MarkdownDocs {},

    /// Build the catalog from a product CSV
    Build {
        /// CSV with name, brand, categories, ingredients, manufacturer,
        /// manufacturerNumber and an optional id column
        #[clap(short, long)]
        input: PathBuf,

        /// Replace a catalog that already holds products
        #[clap(long, default_value = "false")]
        replace: bool,
    },
    /// Search products
    Search {
        /// Free-text query
        query: String,

        /// Retrieval mode (defaults to search.default_mode)
        #[clap(short, long, value_enum)]
        mode: Option<SearchMode>,

        /// Number of results (defaults to search.default_top_k)
        #[clap(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Add a product
    Add {
        #[clap(flatten)]
        product: ProductArgs,
    },
    /// Update fields of a product
    Update {
        /// Product id
        id: u64,

        #[clap(flatten)]
        fields: ProductUpdateArgs,
    },
    /// Delete products by id
    Delete {
        /// Product ids
        #[clap(required = true)]
        ids: Vec<u64>,
    },
    /// Show one product
    Get {
        /// Product id
        id: u64,
    },
    /// List the most recently added products
    Recent {
        #[clap(short, long, default_value = "10")]
        limit: usize,
    },
    /// Catalog statistics
    Stats {},
    /// Check the stores against each other and repair them
    Reconcile {},
    /// Archive config and the live generation
    Backup {
        /// Output directory (defaults to <base>/backups)
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}
