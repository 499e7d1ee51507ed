//! One-shot validation of an existing IPC file.

use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::config::ExchangeConfig;
use crate::domain::{DomainSummarizer, TableDomainAndMetadata};
use crate::error::Result;
use crate::rowkey::RowKeyValidator;
use crate::table::ColumnarTable;

/// Outcome of [`inspect_file`].
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub path: PathBuf,
    pub rows: u64,
    pub batches: usize,
    pub columns: Vec<String>,
    pub row_keys_unique: bool,
    /// Why the row keys are not unique.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_key_error: Option<String>,
    pub summary: TableDomainAndMetadata,
}

/// Check the row keys of a finalized file and compute its domains.
pub async fn inspect_file(path: PathBuf, config: ExchangeConfig) -> Result<InspectReport> {
    let table = ColumnarTable::from_file(&path)?;
    let source = table.source()?;
    let batches = source.num_batches()?;

    let validator = RowKeyValidator::new(source.clone(), &config)?;
    let summarizer = DomainSummarizer::new(source, &config)?;
    let result = analyze(&validator, &summarizer, batches).await;
    let closed = validator.close().await.and(summarizer.close().await);
    let (row_keys_unique, row_key_error, summary) = result?;
    closed?;

    info!(path = %path.display(), batches, unique = row_keys_unique, "File inspected");
    Ok(InspectReport {
        columns: table
            .schema()
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect(),
        rows: table.row_count(),
        path,
        batches,
        row_keys_unique,
        row_key_error,
        summary,
    })
}

async fn analyze(
    validator: &RowKeyValidator,
    summarizer: &DomainSummarizer,
    batches: usize,
) -> Result<(bool, Option<String>, TableDomainAndMetadata)> {
    for _ in 0..batches {
        summarizer.submit_next_batch()?;
        // keep summarizing after the first duplicate
        if validator.is_valid()
            && let Err(e) = validator.check_next_batch()
            && !e.is_duplicate_key()
        {
            return Err(e);
        }
    }

    let unique = validator.all_unique().await?;
    let cause = validator.invalid_cause().map(|e| e.to_string());
    let summary = summarizer.table_domain_and_metadata().await?;
    Ok((unique, cause, summary))
}
