//! Decodes GATK reports: plain-text files holding several named,
//! whitespace-aligned tables.
//!
//! ```text
//! #:GATKReport.v1.1:2
//! #:GATKTable:2:3:%s:%s:;
//! #:GATKTable:Arguments:Recalibration argument collection values used in this run
//! Argument  Value
//! ...
//! ```

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use tracing::warn;

const REPORT_HEADER: &str = "#:GATKReport.v1";
const TABLE_HEADER: &str = "#:GATKTable:";

/// One named table of a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub description: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Render the table as CSV, header row first.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        push_csv_row(&mut out, &self.columns);
        for row in &self.rows {
            push_csv_row(&mut out, row);
        }
        out
    }

    /// A file name derived from the table name.
    pub fn file_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        format!("{}.csv", name)
    }
}

fn push_csv_row(out: &mut String, fields: &[String]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains(&[',', '"', '\n', '\r'][..]) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

/// A decoded report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub version: String,
    pub tables: Vec<Table>,
}

impl Report {
    /// Decode the report stored at `path`.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read report {:?}", path))?;
        Self::parse(&text).with_context(|| format!("Failed to decode report {:?}", path))
    }

    /// Decode a report from its text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().peekable();
        let header = lines.next().ok_or_else(|| anyhow!("Empty report"))?;
        if !header.starts_with(REPORT_HEADER) {
            bail!("Unsupported report header {:?}", header);
        }
        let mut header_parts = header[2..].split(':');
        let version = header_parts
            .next()
            .and_then(|v| v.strip_prefix("GATKReport."))
            .unwrap_or_default()
            .to_string();
        let declared: Option<usize> = header_parts.next().and_then(|n| n.trim().parse().ok());

        let mut tables = Vec::new();
        while let Some(line) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            let format = line
                .strip_prefix(TABLE_HEADER)
                .ok_or_else(|| anyhow!("Expected a table header, found {:?}", line))?;
            let mut format_parts = format.split(':');
            let column_count: usize = format_parts
                .next()
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| anyhow!("Bad table format line {:?}", line))?;
            let row_count: usize = format_parts
                .next()
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| anyhow!("Bad table format line {:?}", line))?;

            let identity = lines
                .next()
                .and_then(|l| l.strip_prefix(TABLE_HEADER))
                .ok_or_else(|| anyhow!("Table format line {:?} isn't followed by a name", line))?;
            let (name, description) = identity.split_once(':').unwrap_or((identity, ""));
            if name.is_empty() {
                bail!("Table without a name after {:?}", line);
            }

            let columns: Vec<String> = lines
                .next()
                .ok_or_else(|| anyhow!("Table {:?} has no column header", name))?
                .split_whitespace()
                .map(String::from)
                .collect();
            if columns.len() != column_count {
                bail!(
                    "Table {:?} declares {} columns but names {}",
                    name,
                    column_count,
                    columns.len()
                );
            }

            let mut rows = Vec::with_capacity(row_count);
            while let Some(row) = lines.peek() {
                if row.trim().is_empty() || row.starts_with(TABLE_HEADER) {
                    break;
                }
                let fields: Vec<String> = row.split_whitespace().map(String::from).collect();
                if fields.len() != column_count {
                    bail!(
                        "Row {:?} of table {:?} has {} fields, expected {}",
                        row,
                        name,
                        fields.len(),
                        column_count
                    );
                }
                rows.push(fields);
                lines.next();
            }
            if rows.len() != row_count {
                warn!(
                    "Table {:?} declares {} rows but holds {}",
                    name,
                    row_count,
                    rows.len()
                );
            }
            tables.push(Table {
                name: String::from(name),
                description: String::from(description),
                columns,
                rows,
            });
        }

        if let Some(declared) = declared {
            if declared != tables.len() {
                warn!(
                    "Report declares {} tables but holds {}",
                    declared,
                    tables.len()
                );
            }
        }
        Ok(Report { version, tables })
    }
}
