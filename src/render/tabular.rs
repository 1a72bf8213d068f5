//! One-row-per-record output of a filtered list: CSV export and print view.

use std::io::Write;

use chrono::{DateTime, Local};
use comfy_table::{Cell, CellAlignment, Table};

use super::task_fields;
use crate::classifier::CostClassifier;
use crate::error::{RecordsError, Result};
use crate::filter::FilterState;
use crate::fmt::{self, money};
use crate::models::Record;

const HEADERS: [&str; 6] = ["Status", "Task Type", "Operation", "Field", "Date", "Total Cost"];

#[derive(Debug, Clone, PartialEq)]
pub struct TabularRow {
    pub status: String,
    pub task_type: String,
    /// Operation followed by its task-specific fields.
    pub operation: String,
    pub field: String,
    pub date: String,
    pub total: f64,
}

pub fn rows(records: &[Record], classifier: &CostClassifier, currency: &str) -> Vec<TabularRow> {
    records
        .iter()
        .map(|r| TabularRow {
            status: r.status.clone().unwrap_or_default(),
            task_type: r.task_type.clone().unwrap_or_default(),
            operation: operation_cell(r, currency),
            field: r.field_name.clone(),
            date: fmt::date(r.effective_date()),
            total: classifier.classify(r).total(),
        })
        .collect()
}

fn operation_cell(record: &Record, currency: &str) -> String {
    let op = record.operation.clone().unwrap_or_default();
    let details: Vec<String> = task_fields(record, currency)
        .into_iter()
        .map(|(label, value)| format!("{label}: {value}"))
        .collect();
    match (op.is_empty(), details.is_empty()) {
        (_, true) => op,
        (true, false) => details.join("; "),
        (false, false) => format!("{op} ({})", details.join("; ")),
    }
}

/// Write every row plus a trailing total. All cells are quoted.
pub fn write_csv<W: Write>(
    records: &[Record],
    classifier: &CostClassifier,
    currency: &str,
    out: W,
) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .from_writer(out);
    wtr.write_record(HEADERS)?;
    let rows = rows(records, classifier, currency);
    let total: f64 = rows.iter().map(|r| r.total).sum();
    for row in &rows {
        let amount = format!("{:.2}", row.total);
        wtr.write_record([
            row.status.as_str(),
            row.task_type.as_str(),
            row.operation.as_str(),
            row.field.as_str(),
            row.date.as_str(),
            amount.as_str(),
        ])?;
    }
    let total = format!("{total:.2}");
    wtr.write_record(["Total", "", "", "", "", total.as_str()])?;
    wtr.flush()?;
    Ok(())
}

pub fn to_csv(records: &[Record], classifier: &CostClassifier, currency: &str) -> Result<String> {
    let mut buf = Vec::new();
    write_csv(records, classifier, currency, &mut buf)?;
    String::from_utf8(buf).map_err(|e| RecordsError::RenderFailure(e.to_string()))
}

/// Printable table with title, timestamp and active filters.
pub fn print_view(
    records: &[Record],
    classifier: &CostClassifier,
    filter: &FilterState,
    currency: &str,
    generated: DateTime<Local>,
) -> String {
    let rows = rows(records, classifier, currency);
    let total: f64 = rows.iter().map(|r| r.total).sum();

    let mut table = Table::new();
    table.set_header(HEADERS.to_vec());
    for row in &rows {
        table.add_row(vec![
            Cell::new(&row.status),
            Cell::new(&row.task_type),
            Cell::new(&row.operation),
            Cell::new(&row.field),
            Cell::new(&row.date),
            Cell::new(money(row.total, currency)).set_alignment(CellAlignment::Right),
        ]);
    }
    table.add_row(vec![
        Cell::new("Total"),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(money(total, currency)).set_alignment(CellAlignment::Right),
    ]);

    format!(
        "Field Records\nGenerated {}\nFilters: {}\n{table}",
        generated.format("%Y-%m-%d %H:%M"),
        filter.describe()
    )
}
