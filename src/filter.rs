use std::collections::BTreeMap;

use chrono::{Duration, Local, Months, NaiveDate};

use crate::classifier::CostClassifier;
use crate::models::{CostBreakdown, Record};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DateMode {
    #[default]
    All,
    Today,
    Week,
    Month,
    /// Inclusive bounds; either may be left open.
    Custom {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CostCategory {
    #[default]
    All,
    Fuel,
    Labor,
    Other,
}

/// Consumer-held filter selection. `Default` is the cleared state.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    pub date: DateMode,
    pub field_id: Option<String>,
    pub operation: Option<String>,
    pub task_type: Option<String>,
    pub cost_category: CostCategory,
    /// 0 means no lower bound.
    pub cost_min: f64,
    /// +inf means no upper bound.
    pub cost_max: f64,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            date: DateMode::All,
            field_id: None,
            operation: None,
            task_type: None,
            cost_category: CostCategory::All,
            cost_min: 0.0,
            cost_max: f64::INFINITY,
        }
    }
}

impl FilterState {
    pub fn is_cleared(&self) -> bool {
        *self == FilterState::default()
    }

    /// Short label of the active filters, e.g. for print headers.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        match &self.date {
            DateMode::All => {}
            DateMode::Today => parts.push("today".to_string()),
            DateMode::Week => parts.push("past week".to_string()),
            DateMode::Month => parts.push("past month".to_string()),
            DateMode::Custom { start, end } => match (start, end) {
                (Some(s), Some(e)) => parts.push(format!("{s} to {e}")),
                (Some(s), None) => parts.push(format!("from {s}")),
                (None, Some(e)) => parts.push(format!("until {e}")),
                (None, None) => {}
            },
        }
        if let Some(f) = &self.field_id {
            parts.push(format!("field {f}"));
        }
        if let Some(op) = &self.operation {
            parts.push(format!("operation {op}"));
        }
        if let Some(t) = &self.task_type {
            parts.push(format!("task {t}"));
        }
        match self.cost_category {
            CostCategory::All => {}
            CostCategory::Fuel => parts.push("fuel costs".to_string()),
            CostCategory::Labor => parts.push("labor costs".to_string()),
            CostCategory::Other => parts.push("other costs".to_string()),
        }
        if self.cost_min > 0.0 {
            parts.push(format!("cost >= {:.2}", self.cost_min));
        }
        if self.cost_max.is_finite() {
            parts.push(format!("cost <= {:.2}", self.cost_max));
        }
        if parts.is_empty() {
            "All records".to_string()
        } else {
            parts.join(", ")
        }
    }
}

pub type FilteredView = Vec<Record>;

const DEFAULT_WEEK_DAYS: i64 = 7;

/// Pure, order-preserving filtering over the cached list.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    classifier: CostClassifier,
    week: Duration,
}

impl FilterEngine {
    /// `week_days` outside `1..` or beyond chrono's range falls back to 7.
    pub fn new(classifier: CostClassifier, week_days: i64) -> Self {
        let week = Duration::try_days(week_days)
            .filter(|d| *d > Duration::zero())
            .unwrap_or_else(|| {
                log::warn!("Ignoring week_days {week_days}, using {DEFAULT_WEEK_DAYS}");
                Duration::days(DEFAULT_WEEK_DAYS)
            });
        Self { classifier, week }
    }

    pub fn apply(&self, records: &[Record], state: &FilterState) -> FilteredView {
        self.apply_on(records, state, Local::now().date_naive())
    }

    /// `apply` against a fixed calendar day. Undated records count as dated
    /// `today`.
    pub fn apply_on(&self, records: &[Record], state: &FilterState, today: NaiveDate) -> FilteredView {
        let window = self.date_window(&state.date, today);
        records
            .iter()
            .filter(|r| match window {
                None => true,
                Some(window) => window.contains(r.effective_date().map_or(today, |d| d.date())),
            })
            .filter(|r| matches_opt(&state.field_id, &r.field_id))
            .filter(|r| matches_opt(&state.operation, &r.operation))
            .filter(|r| matches_opt(&state.task_type, &r.task_type))
            .filter(|r| {
                if state.cost_category == CostCategory::All
                    && state.cost_min <= 0.0
                    && !state.cost_max.is_finite()
                {
                    return true;
                }
                let costs = self.classifier.classify(r);
                in_category(&costs, state.cost_category) && in_range(costs.total(), state)
            })
            .cloned()
            .collect()
    }

    fn date_window(&self, mode: &DateMode, today: NaiveDate) -> Option<DateWindow> {
        match mode {
            DateMode::All => None,
            DateMode::Today => Some(DateWindow {
                start: Some(today),
                end: Some(today),
            }),
            DateMode::Week => Some(DateWindow {
                start: today.checked_sub_signed(self.week),
                end: None,
            }),
            DateMode::Month => Some(DateWindow {
                start: today.checked_sub_months(Months::new(1)),
                end: None,
            }),
            DateMode::Custom { start: None, end: None } => None,
            DateMode::Custom { start, end } => Some(DateWindow {
                start: *start,
                end: *end,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DateWindow {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

impl DateWindow {
    fn contains(&self, day: NaiveDate) -> bool {
        self.start.map_or(true, |s| day >= s) && self.end.map_or(true, |e| day <= e)
    }
}

fn matches_opt(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match wanted {
        None => true,
        Some(w) => actual.as_deref() == Some(w.as_str()),
    }
}

fn in_category(costs: &CostBreakdown, category: CostCategory) -> bool {
    match category {
        CostCategory::All => true,
        CostCategory::Fuel => costs.fuel > 0.0,
        CostCategory::Labor => costs.labor > 0.0,
        CostCategory::Other => costs.other > 0.0,
    }
}

fn in_range(total: f64, state: &FilterState) -> bool {
    let above_min = state.cost_min <= 0.0 || total >= state.cost_min;
    let below_max = !state.cost_max.is_finite() || total <= state.cost_max;
    above_min && below_max
}

// ---------------------------------------------------------------------------
// Filter option discovery
// ---------------------------------------------------------------------------

pub fn distinct_operations(records: &[Record]) -> Vec<String> {
    let mut ops: Vec<String> = records.iter().filter_map(|r| r.operation.clone()).collect();
    ops.sort();
    ops.dedup();
    ops
}

pub fn distinct_task_types(records: &[Record]) -> Vec<String> {
    let mut types: Vec<String> = records.iter().filter_map(|r| r.task_type.clone()).collect();
    types.sort();
    types.dedup();
    types
}

/// `(field id, display name)` pairs, sorted by name.
pub fn distinct_fields(records: &[Record]) -> Vec<(String, String)> {
    let by_id: BTreeMap<String, String> = records
        .iter()
        .filter_map(|r| Some((r.field_id.clone()?, r.field_name.clone())))
        .collect();
    let mut fields: Vec<(String, String)> = by_id.into_iter().collect();
    fields.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoughtItem;
    use crate::store::Document;
    use serde_json::json;

    fn rec(id: &str, date: &str, extra: serde_json::Value) -> Record {
        let mut fields = extra.as_object().cloned().unwrap_or_default();
        fields.insert("recordDate".into(), json!(date));
        Record::from_document(&Document::new(id, fields))
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn engine() -> FilterEngine {
        FilterEngine::new(CostClassifier::new(), 7)
    }

    fn ids(view: &FilteredView) -> Vec<&str> {
        view.iter().map(|r| r.id.as_str()).collect()
    }

    fn sample() -> Vec<Record> {
        vec![
            rec("a", "2025-06-15", json!({"fieldId": "f1", "operation": "Planting", "taskType": "Input", "laborCost": 50})),
            rec("b", "2025-06-10", json!({"fieldId": "f2", "operation": "Harvest", "taskType": "Trucking", "fuelCost": 200})),
            rec("c", "2025-05-20", json!({"fieldId": "f1", "operation": "Planting", "totalCost": 500})),
            rec("d", "2025-01-02", json!({"fieldId": "f2", "operation": "Weeding"})),
        ]
    }

    #[test]
    fn test_cleared_state_passes_everything() {
        let records = sample();
        let view = engine().apply_on(&records, &FilterState::default(), day("2025-06-15"));
        assert_eq!(ids(&view), ["a", "b", "c", "d"]);
        assert!(FilterState::default().is_cleared());
    }

    #[test]
    fn test_today_week_month() {
        let records = sample();
        let e = engine();
        let today = day("2025-06-15");
        let view = |mode| e.apply_on(&records, &FilterState { date: mode, ..Default::default() }, today);
        assert_eq!(ids(&view(DateMode::Today)), ["a"]);
        assert_eq!(ids(&view(DateMode::Week)), ["a", "b"]);
        assert_eq!(ids(&view(DateMode::Month)), ["a", "b", "c"]);
    }

    #[test]
    fn test_custom_only_start_includes_on_and_after() {
        let records = sample();
        let state = FilterState {
            date: DateMode::Custom { start: Some(day("2025-06-10")), end: None },
            ..Default::default()
        };
        let view = engine().apply_on(&records, &state, day("2025-06-15"));
        assert_eq!(ids(&view), ["a", "b"]);
    }

    #[test]
    fn test_custom_only_end_includes_on_and_before() {
        let records = sample();
        let state = FilterState {
            date: DateMode::Custom { start: None, end: Some(day("2025-05-20")) },
            ..Default::default()
        };
        let view = engine().apply_on(&records, &state, day("2025-06-15"));
        assert_eq!(ids(&view), ["c", "d"]);
    }

    #[test]
    fn test_custom_without_bounds_is_no_filter() {
        let mut records = sample();
        records.push(Record::from_document(&Document::new("undated", Default::default())));
        let state = FilterState {
            date: DateMode::Custom { start: None, end: None },
            ..Default::default()
        };
        assert_eq!(engine().apply_on(&records, &state, day("2025-06-15")).len(), 5);
    }

    #[test]
    fn test_undated_record_counts_as_today() {
        let mut records = sample();
        records.push(Record::from_document(&Document::new("undated", Default::default())));
        let e = engine();
        let today = day("2025-06-15");
        let view = |mode| e.apply_on(&records, &FilterState { date: mode, ..Default::default() }, today);
        assert_eq!(ids(&view(DateMode::Today)), ["a", "undated"]);
        assert!(ids(&view(DateMode::Week)).contains(&"undated"));
        assert!(ids(&view(DateMode::Month)).contains(&"undated"));

        let past = DateMode::Custom { start: None, end: Some(day("2025-06-01")) };
        assert!(!ids(&view(past)).contains(&"undated"));
        let covering = DateMode::Custom { start: Some(day("2025-06-15")), end: Some(day("2025-06-15")) };
        assert_eq!(ids(&view(covering)), ["a", "undated"]);
    }

    #[test]
    fn test_out_of_range_week_days_falls_back() {
        let records = sample();
        let week = FilterState { date: DateMode::Week, ..Default::default() };
        let today = day("2025-06-15");
        for bad in [i64::MAX, i64::MIN, 0, -3] {
            let e = FilterEngine::new(CostClassifier::new(), bad);
            assert_eq!(ids(&e.apply_on(&records, &week, today)), ["a", "b"]);
        }
        let settings: crate::settings::Settings =
            serde_json::from_str(r#"{"week_days": 9223372036854775807}"#).unwrap();
        let e = FilterEngine::new(CostClassifier::new(), settings.week_days);
        assert_eq!(ids(&e.apply_on(&records, &week, today)), ["a", "b"]);
    }

    #[test]
    fn test_field_operation_task_compose() {
        let records = sample();
        let state = FilterState {
            field_id: Some("f1".into()),
            operation: Some("Planting".into()),
            ..Default::default()
        };
        assert_eq!(ids(&engine().apply_on(&records, &state, day("2025-06-15"))), ["a", "c"]);

        let state = FilterState { task_type: Some("Trucking".into()), ..Default::default() };
        assert_eq!(ids(&engine().apply_on(&records, &state, day("2025-06-15"))), ["b"]);
    }

    #[test]
    fn test_cost_range_and_category() {
        let mut records = sample();
        records[3].bought_items.push(BoughtItem::from_fields(json!({"totalCost": 80}).as_object().unwrap()));
        let today = day("2025-06-15");
        let e = engine();

        let min = FilterState { cost_min: 100.0, ..Default::default() };
        assert_eq!(ids(&e.apply_on(&records, &min, today)), ["b", "c"]);

        let max = FilterState { cost_max: 80.0, ..Default::default() };
        assert_eq!(ids(&e.apply_on(&records, &max, today)), ["a", "d"]);

        let both = FilterState { cost_min: 60.0, cost_max: 250.0, ..Default::default() };
        assert_eq!(ids(&e.apply_on(&records, &both, today)), ["b", "d"]);

        let fuel = FilterState { cost_category: CostCategory::Fuel, ..Default::default() };
        assert_eq!(ids(&e.apply_on(&records, &fuel, today)), ["b"]);

        let other = FilterState { cost_category: CostCategory::Other, ..Default::default() };
        assert_eq!(ids(&e.apply_on(&records, &other, today)), ["c", "d"]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let records = sample();
        let state = FilterState {
            date: DateMode::Month,
            cost_min: 10.0,
            operation: Some("Planting".into()),
            ..Default::default()
        };
        let today = day("2025-06-15");
        let e = engine();
        let first = e.apply_on(&records, &state, today);
        let second = e.apply_on(&records, &state, today);
        assert_eq!(first, second);
        assert_eq!(records, sample());
    }

    #[test]
    fn test_describe() {
        assert_eq!(FilterState::default().describe(), "All records");
        let state = FilterState {
            date: DateMode::Custom { start: Some(day("2025-01-01")), end: None },
            cost_max: 500.0,
            ..Default::default()
        };
        assert_eq!(state.describe(), "from 2025-01-01, cost <= 500.00");
    }

    #[test]
    fn test_distinct_options() {
        let mut records = sample();
        records[0].field_name = "North".into();
        records[2].field_name = "North".into();
        records[1].field_name = "East".into();
        records[3].field_name = "East".into();
        assert_eq!(distinct_operations(&records), ["Harvest", "Planting", "Weeding"]);
        assert_eq!(distinct_task_types(&records), ["Input", "Trucking"]);
        assert_eq!(
            distinct_fields(&records),
            [("f2".to_string(), "East".to_string()), ("f1".to_string(), "North".to_string())]
        );
    }
}
