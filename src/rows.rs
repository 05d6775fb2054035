use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Margin below which a row is flagged at risk.
const AT_RISK_MARGIN_PCT: f64 = 10.0;

/// How far ahead (in days) a dated row counts as "upcoming".
const UPCOMING_HORIZON_DAYS: i64 = 90;

/// One column of a user-defined table's schema.
///
/// `name` is the legacy display-label field older tables carry instead of
/// `label`; both are accepted everywhere a label is read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub column_type: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl SchemaColumn {
    pub fn display_label(&self) -> &str {
        self.label
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("")
    }
}

/// Find a schema column by id, then key, then label/name.
pub fn resolve_column<'a>(schema: &'a [SchemaColumn], query: &str) -> Option<&'a SchemaColumn> {
    let q = query.trim();
    if q.is_empty() {
        return None;
    }
    schema
        .iter()
        .find(|c| c.id.as_deref() == Some(q))
        .or_else(|| schema.iter().find(|c| c.key.as_deref() == Some(q)))
        .or_else(|| schema.iter().find(|c| c.display_label() == q))
}

/// Read a cell from a raw row.
///
/// Rows are not keyed consistently across tables: newer rows key cells by
/// the column's stable `key`, older ones by display label. Key wins, label
/// is the fallback identity, then the legacy `name`.
pub fn cell_value<'a>(row: &'a Value, col: &SchemaColumn) -> Option<&'a Value> {
    let obj = row.as_object()?;
    if let Some(key) = col.key.as_deref() {
        if let Some(v) = obj.get(key) {
            return Some(v);
        }
    }
    if let Some(label) = col.label.as_deref().or(col.name.as_deref()) {
        if let Some(v) = obj.get(label) {
            return Some(v);
        }
    }
    if let Some(name) = col.name.as_deref() {
        if let Some(v) = obj.get(name) {
            return Some(v);
        }
    }
    None
}

/// Coerce a raw cell to a number, stripping currency formatting
/// (`"$1,234.56"` parses as 1234.56). Null, empty, and non-numeric cells
/// yield `None`.
pub fn parse_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

/// Parse a raw cell as a date. Accepts `YYYY-MM-DD` and full RFC 3339
/// timestamps (the date part is kept).
pub fn parse_date(v: &Value) -> Option<NaiveDate> {
    let s = v.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    None
}

fn numeric_cell(row: &Value, col: &SchemaColumn) -> Option<f64> {
    cell_value(row, col).and_then(parse_number)
}

/// Sum one or more amount columns across a single row. Missing cells count
/// as zero so a partially filled multi-column role still rolls up.
pub fn row_amount(row: &Value, amount_cols: &[&SchemaColumn]) -> f64 {
    amount_cols
        .iter()
        .filter_map(|c| numeric_cell(row, c))
        .sum()
}

/// Total of one column over all rows.
pub fn column_total(rows: &[Value], col: &SchemaColumn) -> f64 {
    rows.iter().filter_map(|r| numeric_cell(r, col)).sum()
}

/// One slice of a category roll-up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySlice {
    pub key: String,
    pub value: f64,
}

/// Group rows by a category column's raw value, summing the mapped amount
/// column(s) per group. Blank or missing categories collapse into
/// `"Uncategorized"`. Returns the top `limit` groups by summed value,
/// descending.
pub fn category_rollup(
    rows: &[Value],
    category_col: &SchemaColumn,
    amount_cols: &[&SchemaColumn],
    limit: usize,
) -> Vec<CategorySlice> {
    let mut groups: BTreeMap<String, f64> = BTreeMap::new();
    for row in rows {
        let key = cell_value(row, category_col)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("Uncategorized")
            .to_string();
        *groups.entry(key).or_insert(0.0) += row_amount(row, amount_cols);
    }
    let mut slices: Vec<CategorySlice> = groups
        .into_iter()
        .map(|(key, value)| CategorySlice { key, value })
        .collect();
    slices.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(std::cmp::Ordering::Equal));
    slices.truncate(limit);
    slices
}

/// Threshold-based classification of one row's economics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RowHealth {
    pub margin_pct: f64,
    pub at_risk: bool,
    pub not_viable: bool,
}

/// Classify a row from its revenue, cost, and optional status text.
///
/// `margin% = (revenue - cost) / revenue * 100`, or 0 when revenue is 0.
/// At risk when margin < 10 or the status contains "at risk" (any case);
/// not viable when margin < 0.
pub fn classify_row(revenue: f64, cost: f64, status: Option<&str>) -> RowHealth {
    let margin_pct = if revenue != 0.0 {
        (revenue - cost) / revenue * 100.0
    } else {
        0.0
    };
    let status_at_risk = status
        .map(|s| s.to_lowercase().contains("at risk"))
        .unwrap_or(false);
    RowHealth {
        margin_pct,
        at_risk: margin_pct < AT_RISK_MARGIN_PCT || status_at_risk,
        not_viable: margin_pct < 0.0,
    }
}

/// An at-risk row with its computed health, kept alongside the raw row so
/// the presentation layer can show whichever cells it wants.
#[derive(Debug, Clone, Serialize)]
pub struct AtRiskRow {
    pub health: RowHealth,
    pub row: Value,
}

/// Classify every row and return the at-risk ones, worst margin first,
/// truncated to `limit`.
pub fn at_risk_rows(
    rows: &[Value],
    revenue_col: &SchemaColumn,
    cost_col: &SchemaColumn,
    status_col: Option<&SchemaColumn>,
    limit: usize,
) -> Vec<AtRiskRow> {
    let mut flagged: Vec<AtRiskRow> = rows
        .iter()
        .filter_map(|row| {
            let revenue = numeric_cell(row, revenue_col).unwrap_or(0.0);
            let cost = numeric_cell(row, cost_col).unwrap_or(0.0);
            let status = status_col
                .and_then(|c| cell_value(row, c))
                .and_then(|v| v.as_str());
            let health = classify_row(revenue, cost, status);
            health.at_risk.then(|| AtRiskRow {
                health,
                row: row.clone(),
            })
        })
        .collect();
    flagged.sort_by(|a, b| {
        a.health
            .margin_pct
            .partial_cmp(&b.health.margin_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    flagged.truncate(limit);
    flagged
}

/// Rows whose date column parses and falls within `[today, today + 90d]`.
/// Unparseable dates are excluded, not treated as matches.
pub fn upcoming_rows(rows: &[Value], date_col: &SchemaColumn, today: NaiveDate) -> Vec<Value> {
    let horizon = today + Duration::days(UPCOMING_HORIZON_DAYS);
    rows.iter()
        .filter(|row| {
            cell_value(row, date_col)
                .and_then(parse_date)
                .map(|d| d >= today && d <= horizon)
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Variance of an actual total against a baseline total.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Variance {
    pub delta: f64,
    pub delta_pct: f64,
}

/// `delta = actual - baseline`; `delta% = delta / baseline * 100`, or 0
/// when the baseline is 0 or absent. A missing baseline is not an error.
pub fn baseline_variance(actual_total: f64, baseline_total: f64) -> Variance {
    let delta = actual_total - baseline_total;
    let delta_pct = if baseline_total != 0.0 {
        delta / baseline_total * 100.0
    } else {
        0.0
    };
    Variance { delta, delta_pct }
}
