use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One bucketed or categorical data point.
///
/// `t` is an opaque, comparable bucket label (a zero-padded ISO date like
/// `2024-03`, or a category key). Metric values are keyed by alias; an
/// absent alias means "no data", which renderers must distinguish from a
/// zero value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRow {
    pub t: String,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

impl SeriesRow {
    pub fn new(t: impl Into<String>) -> Self {
        Self {
            t: t.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, alias: impl Into<String>, value: f64) -> Self {
        self.values.insert(alias.into(), value);
        self
    }

    pub fn get(&self, alias: &str) -> Option<f64> {
        self.values.get(alias).copied()
    }
}

/// Merge the time-keyed rows of several series into one ordered sequence.
///
/// The output holds exactly the union of `t` keys seen across inputs. Rows
/// sharing a `t` are combined by shallow-merging their alias values, with
/// later series overwriting earlier ones for the same alias. The merged
/// series being combined carry disjoint alias sets in practice, so the
/// merge is additive. Output rows are sorted ascending lexicographically
/// by `t`, which is a valid ordering for the zero-padded bucket labels the
/// aggregator emits.
pub fn merge_by_time_key(series_list: &[Vec<SeriesRow>]) -> Vec<SeriesRow> {
    let mut merged: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for series in series_list {
        for row in series {
            let entry = merged.entry(row.t.clone()).or_default();
            for (alias, value) in &row.values {
                entry.insert(alias.clone(), *value);
            }
        }
    }
    merged
        .into_iter()
        .map(|(t, values)| SeriesRow { t, values })
        .collect()
}
