use std::ops::{Add, AddAssign};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::store::{Document, Fields};

/// Open-ended, dynamically named values carried by a record or child entity.
pub type Payload = Fields;

/// Payload key holding a pre-summed total.
pub const TOTAL_COST_KEY: &str = "totalCost";

pub const UNKNOWN_FIELD: &str = "Unknown Field";

const OWNER_KEYS: [&str; 3] = ["userId", "user_id", "user_uid"];
const FIELD_NAME_KEYS: [&str; 3] = ["field_name", "fieldName", "name"];

/// Attributes of a record document that are never part of its payload.
const RECORD_KEYS: [&str; 14] = [
    "id",
    "userId",
    "user_id",
    "user_uid",
    "fieldId",
    "fieldName",
    "taskType",
    "operation",
    "status",
    "recordDate",
    "createdAt",
    "data",
    "boughtItems",
    "vehicleUpdates",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub user_id: Option<String>,
    pub field_id: Option<String>,
    pub task_type: Option<String>,
    pub operation: Option<String>,
    pub status: Option<String>,
    pub record_date: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
    pub payload: Payload,
    pub field_name: String,
    pub bought_items: Vec<BoughtItem>,
    pub vehicle_update: Option<VehicleUpdate>,
}

impl Record {
    /// Build a record from its raw document. Derived attributes (field name,
    /// children) start empty and are filled in by the loader.
    pub fn from_document(doc: &Document) -> Self {
        let f = &doc.fields;
        let payload = match f.get("data") {
            Some(Value::Object(data)) => data.clone(),
            _ => f
                .iter()
                .filter(|(k, _)| !RECORD_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Self {
            id: doc.id.clone(),
            user_id: owner_of(f),
            field_id: string_field(f, "fieldId"),
            task_type: string_field(f, "taskType"),
            operation: string_field(f, "operation"),
            status: string_field(f, "status"),
            record_date: f.get("recordDate").and_then(parse_timestamp),
            created_at: f.get("createdAt").and_then(parse_timestamp),
            payload,
            field_name: UNKNOWN_FIELD.to_string(),
            bought_items: Vec::new(),
            vehicle_update: None,
        }
    }

    /// Record date when present, creation time otherwise.
    pub fn effective_date(&self) -> Option<NaiveDateTime> {
        self.record_date.or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoughtItem {
    pub item_name: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub unit_price: Option<f64>,
    pub total_cost: Option<f64>,
    pub payload: Payload,
}

const BOUGHT_ITEM_KEYS: [&str; 8] = [
    "itemName",
    "item_name",
    "name",
    "quantity",
    "unit",
    "unitPrice",
    "totalCost",
    "total",
];

impl BoughtItem {
    pub fn from_fields(f: &Fields) -> Self {
        let item_name = string_field(f, "itemName")
            .or_else(|| string_field(f, "item_name"))
            .or_else(|| string_field(f, "name"));
        let total_cost = f
            .get(TOTAL_COST_KEY)
            .and_then(as_number)
            .or_else(|| f.get("total").and_then(as_number));
        Self {
            item_name,
            quantity: f.get("quantity").and_then(as_number),
            unit: string_field(f, "unit"),
            unit_price: f.get("unitPrice").and_then(as_number),
            total_cost,
            payload: rest(f, &BOUGHT_ITEM_KEYS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VehicleUpdate {
    pub date: Option<NaiveDateTime>,
    pub vehicle_type: Option<String>,
    pub active_drivers: Option<f64>,
    pub returning_drivers: Option<f64>,
    pub boxes: Option<f64>,
    pub weight: Option<f64>,
    pub fuel_cost: Option<f64>,
    pub labor_cost: Option<f64>,
    pub total_cost: Option<f64>,
    pub notes: Option<String>,
    pub payload: Payload,
}

const VEHICLE_KEYS: [&str; 10] = [
    "date",
    "vehicleType",
    "activeDrivers",
    "returningDrivers",
    "boxes",
    "weight",
    "fuelCost",
    "laborCost",
    "totalCost",
    "notes",
];

impl VehicleUpdate {
    pub fn from_fields(f: &Fields) -> Self {
        Self {
            date: f.get("date").and_then(parse_timestamp),
            vehicle_type: string_field(f, "vehicleType"),
            active_drivers: f.get("activeDrivers").and_then(as_number),
            returning_drivers: f.get("returningDrivers").and_then(as_number),
            boxes: f.get("boxes").and_then(as_number),
            weight: f.get("weight").and_then(as_number),
            fuel_cost: f.get("fuelCost").and_then(as_number),
            labor_cost: f.get("laborCost").and_then(as_number),
            total_cost: f.get(TOTAL_COST_KEY).and_then(as_number),
            notes: string_field(f, "notes"),
            payload: rest(f, &VEHICLE_KEYS),
        }
    }
}

/// Snapshot of the field entity owned by the registration subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldProfile {
    pub id: String,
    pub name: String,
    pub profile: Fields,
}

impl FieldProfile {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            name: field_display_name(&doc.fields).unwrap_or_else(|| UNKNOWN_FIELD.to_string()),
            profile: rest(&doc.fields, &FIELD_NAME_KEYS),
        }
    }
}

/// Fuel/labor/other split. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostBreakdown {
    pub fuel: f64,
    pub labor: f64,
    pub other: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.fuel + self.labor + self.other
    }
}

impl Add for CostBreakdown {
    type Output = CostBreakdown;

    fn add(self, rhs: CostBreakdown) -> CostBreakdown {
        CostBreakdown {
            fuel: self.fuel + rhs.fuel,
            labor: self.labor + rhs.labor,
            other: self.other + rhs.other,
        }
    }
}

impl AddAssign for CostBreakdown {
    fn add_assign(&mut self, rhs: CostBreakdown) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for CostBreakdown {
    fn sum<I: Iterator<Item = CostBreakdown>>(iter: I) -> Self {
        iter.fold(CostBreakdown::default(), Add::add)
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

pub fn owner_of(f: &Fields) -> Option<String> {
    OWNER_KEYS.iter().find_map(|k| string_field(f, k))
}

pub fn field_display_name(f: &Fields) -> Option<String> {
    FIELD_NAME_KEYS.iter().find_map(|k| string_field(f, k))
}

fn string_field(f: &Fields, key: &str) -> Option<String> {
    match f.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn rest(f: &Fields, known: &[&str]) -> Payload {
    f.iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Numeric view of a payload value. Numeric strings count; booleans and text do not.
pub fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Accepts RFC 3339, `YYYY-MM-DD[ HH:MM:SS]`, epoch milliseconds and
/// `{seconds, nanoseconds}` timestamp objects.
pub fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Number(n) => {
            let dt = DateTime::from_timestamp_millis(n.as_i64()?)?;
            Some(dt.with_timezone(&Local).naive_local())
        }
        Value::Object(map) => {
            let secs = map.get("seconds").or_else(|| map.get("_seconds"))?.as_i64()?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let dt = DateTime::from_timestamp(secs, u32::try_from(nanos).ok()?)?;
            Some(dt.with_timezone(&Local).naive_local())
        }
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
