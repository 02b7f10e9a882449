use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::retriever::SearchMode;
use crate::service::{read_seed_rows, CatalogService};

use super::types::{ProductArgs, ProductUpdateArgs};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn handle_build(input: &Path, replace: bool, service: &CatalogService) -> Result<()> {
    let file = File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    let rows = read_seed_rows(BufReader::new(file))?;
    let report = service.seed(rows, replace)?;
    print_json(&report)
}

pub fn handle_search(
    query: &str,
    mode: Option<SearchMode>,
    top_k: Option<usize>,
    service: &CatalogService,
) -> Result<()> {
    let response = service.search(query, mode, top_k)?;
    print_json(&response)
}

pub fn handle_add(product: ProductArgs, service: &CatalogService) -> Result<()> {
    let id = service.add(product.into())?;
    print_json(&service.get(id)?)
}

pub fn handle_update(id: u64, fields: ProductUpdateArgs, service: &CatalogService) -> Result<()> {
    let record = service.update(id, fields.into())?;
    print_json(&record)
}

pub fn handle_delete(ids: &[u64], service: &CatalogService) -> Result<()> {
    let outcome = service.delete(ids)?;
    print_json(&outcome)
}

pub fn handle_get(id: u64, service: &CatalogService) -> Result<()> {
    print_json(&service.get(id)?)
}

pub fn handle_recent(limit: usize, service: &CatalogService) -> Result<()> {
    print_json(&service.recent(limit))
}

pub fn handle_stats(service: &CatalogService) -> Result<()> {
    print_json(&service.stats())
}

pub fn handle_reconcile(service: &CatalogService) -> Result<()> {
    let report = service.reconcile()?;
    print_json(&report)
}

pub fn handle_backup(output: Option<PathBuf>, service: &CatalogService) -> Result<()> {
    let path = service.backup(output)?;
    println!("{}", path.display());
    Ok(())
}
