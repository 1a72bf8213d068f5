//! Report rendering.
//!
//! A [`ReportDocument`] is a flat list of blocks built once from an assembled
//! [`Report`]. The on-screen preview and the paginated artifact both walk the
//! same blocks, so what the reviewer receives matches what was previewed.

pub mod tabular;

#[cfg(feature = "pdf")]
mod pdf;

use comfy_table::{Cell, CellAlignment, Table};
use serde_json::Value;

use crate::assembler::Report;
use crate::classifier::CostClassifier;
use crate::error::Result;
use crate::fmt::{self, money};
use crate::models::{Record, VehicleUpdate, TOTAL_COST_KEY};

const PREVIEW_WIDTH: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Title(String),
    Subtitle(String),
    Heading(String),
    Subheading(String),
    KeyValues(Vec<(String, String)>),
    Table {
        headers: Vec<String>,
        align: Vec<Align>,
        rows: Vec<Vec<String>>,
        /// Last row is a total and is set in bold.
        total_row: bool,
    },
    Paragraph(String),
    Separator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportDocument {
    pub title: String,
    pub blocks: Vec<Block>,
}

/// Rendered artifact bytes plus how to store them.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
    pub content_type: &'static str,
}

impl ReportDocument {
    pub fn build(report: &Report, classifier: &CostClassifier, currency: &str) -> Self {
        let title = format!("Field Report: {}", report.field.name);
        let mut blocks = vec![
            Block::Title(title.clone()),
            Block::Subtitle(format!(
                "Generated {}",
                report.assembled_at.format("%Y-%m-%d %H:%M")
            )),
            Block::Separator,
        ];

        blocks.push(Block::Heading("Field Profile".to_string()));
        let mut profile = vec![
            ("Field".to_string(), report.field.name.clone()),
            ("Field ID".to_string(), report.field.id.clone()),
        ];
        profile.extend(payload_pairs(&report.field.profile, &[], currency));
        blocks.push(Block::KeyValues(profile));

        blocks.push(Block::Heading("Growth Timeline".to_string()));
        blocks.push(Block::Table {
            headers: strings(&["Stage", "First Recorded", "Records"]),
            align: vec![Align::Left, Align::Left, Align::Right],
            rows: report
                .timeline
                .iter()
                .map(|t| {
                    vec![
                        t.status.clone(),
                        fmt::date(t.earliest_date),
                        t.record_count.to_string(),
                    ]
                })
                .collect(),
            total_row: false,
        });

        for (status, records) in report.groups() {
            blocks.push(Block::Heading(format!("{status} ({})", records.len())));
            for record in records {
                record_blocks(&mut blocks, record, classifier, currency);
            }
        }

        let s = &report.summary;
        blocks.push(Block::Heading("Cost Summary".to_string()));
        blocks.push(Block::Table {
            headers: strings(&["Source", "Amount"]),
            align: vec![Align::Left, Align::Right],
            rows: vec![
                vec!["Task Costs".to_string(), money(s.total_task_cost, currency)],
                vec!["Bought Items".to_string(), money(s.total_bought_items_cost, currency)],
                vec!["Vehicle Costs".to_string(), money(s.total_vehicle_cost, currency)],
                vec!["Grand Total".to_string(), money(s.grand_total, currency)],
            ],
            total_row: true,
        });
        blocks.push(Block::Table {
            headers: strings(&["Category", "Amount"]),
            align: vec![Align::Left, Align::Right],
            rows: vec![
                vec!["Fuel".to_string(), money(s.breakdown.fuel, currency)],
                vec!["Labor".to_string(), money(s.breakdown.labor, currency)],
                vec!["Other".to_string(), money(s.breakdown.other, currency)],
            ],
            total_row: false,
        });

        Self { title, blocks }
    }

    /// Plain-text rendering for on-screen review.
    pub fn to_preview(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            match block {
                Block::Title(t) => {
                    out.push_str(&t.to_uppercase());
                    out.push('\n');
                }
                Block::Subtitle(t) => {
                    out.push_str(t);
                    out.push('\n');
                }
                Block::Heading(t) => {
                    out.push('\n');
                    out.push_str(t);
                    out.push('\n');
                    out.push_str(&"=".repeat(t.chars().count()));
                    out.push('\n');
                }
                Block::Subheading(t) => {
                    out.push('\n');
                    out.push_str(t);
                    out.push('\n');
                }
                Block::KeyValues(pairs) => {
                    let width = pairs.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
                    for (k, v) in pairs {
                        out.push_str(&format!("  {k:<width$}  {v}\n"));
                    }
                }
                Block::Table {
                    headers,
                    align,
                    rows,
                    ..
                } => {
                    let mut table = Table::new();
                    table.set_header(headers.clone());
                    for row in rows {
                        table.add_row(row.iter().enumerate().map(|(i, v)| {
                            let cell = Cell::new(v);
                            match align.get(i) {
                                Some(Align::Right) => cell.set_alignment(CellAlignment::Right),
                                _ => cell,
                            }
                        }));
                    }
                    out.push_str(&table.to_string());
                    out.push('\n');
                }
                Block::Paragraph(t) => {
                    for line in textwrap::wrap(t, PREVIEW_WIDTH) {
                        out.push_str(&line);
                        out.push('\n');
                    }
                }
                Block::Separator => {
                    out.push_str(&"-".repeat(PREVIEW_WIDTH));
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Fixed-page rendering of the same blocks.
    #[cfg(feature = "pdf")]
    pub fn to_pdf(&self) -> Result<Vec<u8>> {
        pdf::render(self)
    }

    /// The artifact to deliver: a PDF when built with the `pdf` feature,
    /// the text preview otherwise.
    pub fn render_artifact(&self) -> Result<Artifact> {
        #[cfg(feature = "pdf")]
        {
            Ok(Artifact {
                bytes: self.to_pdf()?,
                extension: "pdf",
                content_type: "application/pdf",
            })
        }
        #[cfg(not(feature = "pdf"))]
        {
            Ok(Artifact {
                bytes: self.to_preview().into_bytes(),
                extension: "txt",
                content_type: "text/plain; charset=utf-8",
            })
        }
    }
}

fn record_blocks(blocks: &mut Vec<Block>, record: &Record, classifier: &CostClassifier, currency: &str) {
    let heading = [
        Some(fmt::date(record.effective_date())),
        record.task_type.clone(),
        record.operation.clone(),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" - ");
    blocks.push(Block::Subheading(heading));

    let costs = classifier.classify_by_source(record);
    let mut pairs = task_fields(record, currency);
    pairs.push(("Task Cost".to_string(), money(costs.task.total(), currency)));
    blocks.push(Block::KeyValues(pairs));

    if !record.bought_items.is_empty() {
        let mut rows: Vec<Vec<String>> = record
            .bought_items
            .iter()
            .map(|item| {
                vec![
                    item.item_name.clone().unwrap_or_else(|| "Item".to_string()),
                    item.quantity.map(|q| q.to_string()).unwrap_or_default(),
                    item.unit.clone().unwrap_or_default(),
                    item.unit_price.map(|p| money(p, currency)).unwrap_or_default(),
                    money(item.total_cost.unwrap_or(0.0), currency),
                ]
            })
            .collect();
        rows.push(vec![
            "Total".to_string(),
            String::new(),
            String::new(),
            String::new(),
            money(costs.bought_items.total(), currency),
        ]);
        blocks.push(Block::Table {
            headers: strings(&["Item", "Qty", "Unit", "Unit Price", "Total"]),
            align: vec![Align::Left, Align::Right, Align::Left, Align::Right, Align::Right],
            rows,
            total_row: true,
        });
    }

    if let Some(vehicle) = &record.vehicle_update {
        blocks.push(Block::KeyValues(vehicle_pairs(vehicle, costs.vehicle.total(), currency)));
        if let Some(notes) = vehicle.notes.as_deref().filter(|n| !n.trim().is_empty()) {
            blocks.push(Block::Paragraph(format!("Notes: {notes}")));
        }
    }
}

fn vehicle_pairs(vehicle: &VehicleUpdate, total: f64, currency: &str) -> Vec<(String, String)> {
    let mut pairs = vec![(
        "Vehicle".to_string(),
        vehicle.vehicle_type.clone().unwrap_or_else(|| "N/A".to_string()),
    )];
    if vehicle.date.is_some() {
        pairs.push(("Trip Date".to_string(), fmt::date(vehicle.date)));
    }
    let counts = [
        ("Active Drivers", vehicle.active_drivers),
        ("Returning Drivers", vehicle.returning_drivers),
        ("Boxes", vehicle.boxes),
    ];
    for (label, n) in counts {
        if let Some(n) = n {
            pairs.push((label.to_string(), n.to_string()));
        }
    }
    if let Some(w) = vehicle.weight {
        pairs.push(("Weight".to_string(), format!("{w} kg")));
    }
    if let Some(f) = vehicle.fuel_cost {
        pairs.push(("Fuel Cost".to_string(), money(f, currency)));
    }
    if let Some(l) = vehicle.labor_cost {
        pairs.push(("Labor Cost".to_string(), money(l, currency)));
    }
    pairs.extend(payload_pairs(&vehicle.payload, &[], currency));
    pairs.push(("Vehicle Total".to_string(), money(total, currency)));
    pairs
}

/// Task-specific payload fields as `(label, display value)`, skipping the
/// recorded total and internal keys.
pub fn task_fields(record: &Record, currency: &str) -> Vec<(String, String)> {
    payload_pairs(&record.payload, &[TOTAL_COST_KEY], currency)
}

fn payload_pairs(
    payload: &serde_json::Map<String, Value>,
    skip: &[&str],
    currency: &str,
) -> Vec<(String, String)> {
    payload
        .iter()
        .filter(|(k, _)| !k.starts_with('_') && !skip.contains(&k.as_str()))
        .map(|(k, v)| (fmt::label(k), fmt::value(k, v, currency)))
        .filter(|(_, v)| !v.is_empty())
        .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
