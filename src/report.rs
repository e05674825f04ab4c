//! Fetches a report, splits it into one CSV file per table, and
//! summarizes the files produced.

use crate::gatk::Report;
use crate::storage::{Location, Storage};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tempfile::TempDir;
use tracing::{info, instrument, warn};

/// The files produced from a report, by table name.
pub type TableSet = BTreeMap<String, Location>;

/// Download the report at `report`, decode it, and write each of its
/// tables as `<output_root>/<table name>.csv`.
///
/// The report is decoded from a copy staged in a private scratch
/// folder, removed when this function returns. A report that doesn't
/// exist yields an empty set.
#[instrument(skip_all, fields(report = %report, output_root = %output_root))]
pub async fn download_report(
    storage: &Storage,
    report: &Location,
    output_root: &Location,
) -> Result<TableSet> {
    let scratch = TempDir::new().context("Failed to create a scratch folder")?;
    let staged = match storage.stage(report, scratch.path()).await? {
        Some(staged) => staged,
        None => {
            warn!("Report {} not found", report);
            return Ok(TableSet::new());
        }
    };
    let decoded = Report::from_path(&staged).await?;
    let mut tables = TableSet::new();
    for table in &decoded.tables {
        let destination = output_root.join(&table.file_name());
        info!("{} -> {}", table.name, destination);
        storage
            .write_text(&destination, &table.to_csv())
            .await
            .with_context(|| format!("Failed to write table {:?}", table.name))?;
        tables.insert(table.name.clone(), destination);
    }
    Ok(tables)
}

/// Write the list of produced files into `<root>/<file_name>`, as a
/// JSON array of paths relative to `root`. Files outside `root` are
/// listed by their full URI.
#[instrument(skip_all, fields(root = %root))]
pub async fn summarize_tables(
    storage: &Storage,
    tables: &TableSet,
    root: &Location,
    file_name: &str,
) -> Result<Location> {
    let files: Vec<String> = tables
        .values()
        .map(|location| {
            location
                .relative_to(root)
                .unwrap_or_else(|| location.to_string())
        })
        .collect();
    let summary = root.join(file_name);
    storage
        .write_text(&summary, &serde_json::to_string(&files)?)
        .await?;
    info!("Summarized {} tables into {}", files.len(), summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatk::tests::SAMPLE;
    use serde_json::Value;

    #[tokio::test]
    async fn splits_a_report_into_tables() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::local();
        let root = Location::Local(dir.path().to_path_buf());
        let report = root.join("out/bqsr_report/report.csv");
        storage.write_text(&report, SAMPLE).await.unwrap();

        let output = report.ancestor(2);
        let tables = download_report(&storage, &report, &output).await.unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables["Quantized"], root.join("out/Quantized.csv"));
        let csv = storage.read_text(&tables["Quantized"]).await.unwrap();
        assert!(csv.starts_with("QualityScore,Count,QuantizedScore\n"));
        // The source report is left untouched.
        assert_eq!(storage.read_text(&report).await.unwrap(), SAMPLE);

        let summary = summarize_tables(&storage, &tables, &root, "quilt_summarize.json")
            .await
            .unwrap();
        let listed: Value =
            serde_json::from_str(&storage.read_text(&summary).await.unwrap()).unwrap();
        assert_eq!(
            listed,
            serde_json::json!(["out/Arguments.csv", "out/Quantized.csv"])
        );
    }

    #[tokio::test]
    async fn missing_report_yields_an_empty_set() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::local();
        let root = Location::Local(dir.path().to_path_buf());
        let tables = download_report(&storage, &root.join("nope/report.csv"), &root)
            .await
            .unwrap();
        assert!(tables.is_empty());

        let summary = summarize_tables(&storage, &tables, &root, "quilt_summarize.json")
            .await
            .unwrap();
        assert_eq!(storage.read_text(&summary).await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn undecodable_report_fails() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::local();
        let root = Location::Local(dir.path().to_path_buf());
        let report = root.join("report.csv");
        storage.write_text(&report, "not,a,report\n").await.unwrap();
        assert!(download_report(&storage, &report, &root).await.is_err());
    }
}
