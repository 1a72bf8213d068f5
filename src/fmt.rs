use chrono::NaiveDateTime;
use serde_json::Value;

use crate::models::{as_number, parse_timestamp};

/// Format a float as an amount with thousands separators: PHP 1,234.56
pub fn money(val: f64, currency: &str) -> String {
    let negative = val < 0.0;
    let abs = val.abs();
    let cents = format!("{:.2}", abs);
    let (int_part, dec_part) = cents.split_once('.').unwrap_or((&cents, "00"));

    let mut with_commas = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_commas.push(',');
        }
        with_commas.push(c);
    }
    let with_commas: String = with_commas.chars().rev().collect();

    if negative {
        format!("-{currency} {with_commas}.{dec_part}")
    } else {
        format!("{currency} {with_commas}.{dec_part}")
    }
}

pub fn date(dt: Option<NaiveDateTime>) -> String {
    dt.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

/// `fertilizerCost` -> `Fertilizer Cost`
pub fn label(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c == '_' {
            out.push(' ');
            continue;
        }
        if c.is_uppercase() && i > 0 && !out.ends_with(' ') {
            out.push(' ');
        }
        if out.is_empty() || out.ends_with(' ') {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
    }
    out.trim().to_string()
}

/// Display form of a payload value, picking units from the key name.
pub fn value(key: &str, value: &Value, currency: &str) -> String {
    let lower = key.to_lowercase();
    match value {
        Value::Bool(b) => (if *b { "Yes" } else { "No" }).to_string(),
        Value::Number(_) => {
            let n = as_number(value).unwrap_or_default();
            if ["cost", "price", "amount"].iter().any(|k| lower.contains(k)) {
                money(n, currency)
            } else if lower.contains("area") || lower.contains("hectare") {
                format!("{n} ha")
            } else if lower.contains("weight") {
                format!("{n} kg")
            } else {
                n.to_string()
            }
        }
        Value::String(s) if lower.contains("date") => {
            parse_timestamp(value).map_or_else(|| s.clone(), |d| date(Some(d)))
        }
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => String::new(),
        Value::Object(_) => parse_timestamp(value).map_or_else(String::new, |d| date(Some(d))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(1234.56, "PHP"), "PHP 1,234.56");
        assert_eq!(money(-500.00, "PHP"), "-PHP 500.00");
        assert_eq!(money(0.0, "PHP"), "PHP 0.00");
        assert_eq!(money(1000000.99, "$"), "$ 1,000,000.99");
    }

    #[test]
    fn test_label() {
        assert_eq!(label("fertilizerCost"), "Fertilizer Cost");
        assert_eq!(label("area_planted"), "Area Planted");
        assert_eq!(label("notes"), "Notes");
    }

    #[test]
    fn test_value_units() {
        assert_eq!(value("laborCost", &json!(50), "PHP"), "PHP 50.00");
        assert_eq!(value("areaPlanted", &json!(2.5), "PHP"), "2.5 ha");
        assert_eq!(value("caneWeight", &json!(300), "PHP"), "300 kg");
        assert_eq!(value("irrigated", &json!(true), "PHP"), "Yes");
        assert_eq!(value("plantingDate", &json!("2025-02-01"), "PHP"), "2025-02-01");
        assert_eq!(value("varieties", &json!(["Phil 99", "VMC 86"]), "PHP"), "Phil 99, VMC 86");
    }
}
