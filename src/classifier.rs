//! Keyword classification of open-ended cost fields.
//!
//! Payload keys are matched against an ordered rule list; the first matching
//! rule picks the bucket. Any future field whose name contains a cost keyword
//! is picked up without code changes. The price is the occasional false
//! positive, e.g. a non-cost field whose name happens to contain "fee".

use regex::Regex;

use crate::models::{as_number, BoughtItem, CostBreakdown, Payload, Record, VehicleUpdate, TOTAL_COST_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Fuel,
    Labor,
    Other,
}

#[derive(Debug, Clone)]
pub enum KeyMatcher {
    /// Case-insensitive substring.
    Contains(String),
    /// Case-insensitive prefix.
    StartsWith(String),
    /// Matched against the key as written.
    Regex(Regex),
}

impl KeyMatcher {
    fn matches(&self, key: &str, key_lower: &str) -> bool {
        match self {
            KeyMatcher::Contains(pat) => key_lower.contains(&pat.to_lowercase()),
            KeyMatcher::StartsWith(pat) => key_lower.starts_with(&pat.to_lowercase()),
            KeyMatcher::Regex(re) => re.is_match(key),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CostRule {
    pub matcher: KeyMatcher,
    pub bucket: Bucket,
}

impl CostRule {
    pub fn contains(pattern: &str, bucket: Bucket) -> Self {
        Self {
            matcher: KeyMatcher::Contains(pattern.to_string()),
            bucket,
        }
    }
}

/// Costs of one record split by where they were recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SourceCosts {
    pub task: CostBreakdown,
    pub bought_items: CostBreakdown,
    pub vehicle: CostBreakdown,
}

impl SourceCosts {
    pub fn combined(&self) -> CostBreakdown {
        self.task + self.bought_items + self.vehicle
    }
}

const OTHER_KEYWORDS: [&str; 6] = ["cost", "price", "amount", "expense", "fee", "charge"];

#[derive(Debug, Clone)]
pub struct CostClassifier {
    rules: Vec<CostRule>,
}

impl Default for CostClassifier {
    fn default() -> Self {
        let mut rules = vec![
            CostRule::contains("fuel", Bucket::Fuel),
            CostRule::contains("labor", Bucket::Labor),
        ];
        rules.extend(OTHER_KEYWORDS.iter().map(|k| CostRule::contains(k, Bucket::Other)));
        Self { rules }
    }
}

impl CostClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<CostRule>) -> Self {
        Self { rules }
    }

    /// Appended rules run after the built-in ones.
    pub fn push_rule(&mut self, rule: CostRule) {
        self.rules.push(rule);
    }

    pub fn bucket_for(&self, key: &str) -> Option<Bucket> {
        let lower = key.to_lowercase();
        self.rules
            .iter()
            .find(|r| r.matcher.matches(key, &lower))
            .map(|r| r.bucket)
    }

    pub fn classify(&self, record: &Record) -> CostBreakdown {
        self.classify_by_source(record).combined()
    }

    pub fn classify_by_source(&self, record: &Record) -> SourceCosts {
        SourceCosts {
            task: self.classify_payload(&record.payload),
            bought_items: self.classify_bought_items(&record.bought_items),
            vehicle: record
                .vehicle_update
                .as_ref()
                .map(|v| self.classify_vehicle(v))
                .unwrap_or_default(),
        }
    }

    /// Keyed costs first; the recorded total only counts when nothing was keyed.
    pub fn classify_payload(&self, payload: &Payload) -> CostBreakdown {
        let (mut costs, found) = self.scan(payload, &[TOTAL_COST_KEY]);
        if !found {
            let total = payload.get(TOTAL_COST_KEY).and_then(as_number).unwrap_or(0.0);
            if total > 0.0 {
                costs.other += total;
            }
        }
        costs
    }

    pub fn classify_vehicle(&self, vehicle: &VehicleUpdate) -> CostBreakdown {
        let fuel = vehicle.fuel_cost.unwrap_or(0.0);
        let labor = vehicle.labor_cost.unwrap_or(0.0);
        let mut costs = CostBreakdown {
            fuel,
            labor,
            other: 0.0,
        };
        if let Some(total) = vehicle.total_cost {
            if total > fuel + labor {
                costs.other += total - fuel - labor;
            }
        }
        let (extra, _) = self.scan(&vehicle.payload, &[TOTAL_COST_KEY, "fuelCost", "laborCost"]);
        costs + extra
    }

    /// Everything bought lands in "other", keyed extras included.
    pub fn classify_bought_items(&self, items: &[BoughtItem]) -> CostBreakdown {
        let other = items
            .iter()
            .map(|item| {
                let (extra, _) = self.scan(&item.payload, &[TOTAL_COST_KEY, "total", "unitPrice"]);
                item.total_cost.unwrap_or(0.0) + extra.total()
            })
            .sum();
        CostBreakdown {
            fuel: 0.0,
            labor: 0.0,
            other,
        }
    }

    fn scan(&self, payload: &Payload, exclude: &[&str]) -> (CostBreakdown, bool) {
        let mut costs = CostBreakdown::default();
        let mut found = false;
        for (key, value) in payload {
            if exclude.contains(&key.as_str()) {
                continue;
            }
            let Some(amount) = as_number(value) else {
                continue;
            };
            let Some(bucket) = self.bucket_for(key) else {
                continue;
            };
            found = true;
            match bucket {
                Bucket::Fuel => costs.fuel += amount,
                Bucket::Labor => costs.labor += amount,
                Bucket::Other => costs.other += amount,
            }
        }
        (costs, found)
    }
}
