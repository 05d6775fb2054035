use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A human-facing time range for dashboard queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    Last7Days,
    Last30Days,
    Last90Days,
    Last180Days,
    #[serde(rename = "ytd")]
    YearToDate,
    AllTime,
}

/// Time granularity used to group an aggregation's output rows.
/// `None` requests a single unbucketed aggregate (KPI totals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBucket {
    Day,
    Week,
    Month,
    None,
}

/// Range parameters in the form the remote aggregator expects.
///
/// `range_start`/`range_end` are only populated for the `custom` code,
/// which covers ranges the remote API has no native equivalent for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteRangeParams {
    pub range: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,
}

impl RemoteRangeParams {
    fn native(code: &str) -> Self {
        Self {
            range: code.to_string(),
            range_start: None,
            range_end: None,
        }
    }
}

impl TimeRange {
    /// Parse a range string.
    ///
    /// Accepts both the UI keys (`last_30_days`, `ytd`, `all_time`) and the
    /// remote API's short codes (`30d`, `90d`) as aliases.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "last_7_days" | "7d" => Ok(TimeRange::Last7Days),
            "last_30_days" | "30d" => Ok(TimeRange::Last30Days),
            "last_90_days" | "90d" => Ok(TimeRange::Last90Days),
            "last_180_days" | "180d" => Ok(TimeRange::Last180Days),
            "ytd" => Ok(TimeRange::YearToDate),
            "all_time" | "all" => Ok(TimeRange::AllTime),
            other => Err(Error::RangeParse(format!("unrecognized range: {other}"))),
        }
    }

    /// Parse a persisted range key, falling back to the 90-day range when
    /// the key is unrecognized. Stored dashboard configs can carry range
    /// keys written by older versions; those must not fail the view.
    pub fn parse_or_90d(s: &str) -> Self {
        Self::parse(s).unwrap_or_else(|_| {
            log::warn!("Unrecognized range key {s:?}, defaulting to last_90_days");
            TimeRange::Last90Days
        })
    }

    /// Canonical key string, round-trips through `parse`.
    pub fn to_key(&self) -> &'static str {
        match self {
            TimeRange::Last7Days => "last_7_days",
            TimeRange::Last30Days => "last_30_days",
            TimeRange::Last90Days => "last_90_days",
            TimeRange::Last180Days => "last_180_days",
            TimeRange::YearToDate => "ytd",
            TimeRange::AllTime => "all_time",
        }
    }

    /// The lower bound for client-side filtering, or `None` for "no lower
    /// bound" (all time).
    pub fn start_date(&self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            TimeRange::Last7Days => Some(today - Duration::days(7)),
            TimeRange::Last30Days => Some(today - Duration::days(30)),
            TimeRange::Last90Days => Some(today - Duration::days(90)),
            TimeRange::Last180Days => Some(today - Duration::days(180)),
            TimeRange::YearToDate => NaiveDate::from_ymd_opt(today.year(), 1, 1),
            TimeRange::AllTime => None,
        }
    }

    /// Map to the remote aggregator's range parameters.
    ///
    /// `last_180_days` has no native remote code and is expressed as an
    /// explicit custom range from `today - 180d` through `today`.
    pub fn remote_params(&self, today: NaiveDate) -> RemoteRangeParams {
        match self {
            TimeRange::Last7Days => RemoteRangeParams::native("7d"),
            TimeRange::Last30Days => RemoteRangeParams::native("30d"),
            TimeRange::Last90Days => RemoteRangeParams::native("90d"),
            TimeRange::Last180Days => {
                let start = today - Duration::days(180);
                RemoteRangeParams {
                    range: "custom".to_string(),
                    range_start: Some(start.format("%Y-%m-%d").to_string()),
                    range_end: Some(today.format("%Y-%m-%d").to_string()),
                }
            }
            TimeRange::YearToDate => RemoteRangeParams::native("ytd"),
            TimeRange::AllTime => RemoteRangeParams::native("all_time"),
        }
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

impl TimeBucket {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "day" => Ok(TimeBucket::Day),
            "week" => Ok(TimeBucket::Week),
            "month" => Ok(TimeBucket::Month),
            "none" => Ok(TimeBucket::None),
            other => Err(Error::RangeParse(format!("unrecognized bucket: {other}"))),
        }
    }

    pub fn to_key(&self) -> &'static str {
        match self {
            TimeBucket::Day => "day",
            TimeBucket::Week => "week",
            TimeBucket::Month => "month",
            TimeBucket::None => "none",
        }
    }

    /// The finer bucket to retry at when a coarse bucket collapses the
    /// series to too few points. Only month and week refine; a day-bucketed
    /// query has nowhere finer to go.
    pub fn refinement(&self) -> Option<TimeBucket> {
        match self {
            TimeBucket::Month | TimeBucket::Week => Some(TimeBucket::Day),
            TimeBucket::Day | TimeBucket::None => None,
        }
    }
}

impl std::fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_ui_keys() {
        assert_eq!(TimeRange::parse("last_30_days").unwrap(), TimeRange::Last30Days);
        assert_eq!(TimeRange::parse("last_90_days").unwrap(), TimeRange::Last90Days);
        assert_eq!(TimeRange::parse("last_180_days").unwrap(), TimeRange::Last180Days);
        assert_eq!(TimeRange::parse("ytd").unwrap(), TimeRange::YearToDate);
        assert_eq!(TimeRange::parse("all_time").unwrap(), TimeRange::AllTime);
    }

    #[test]
    fn test_parse_remote_aliases() {
        assert_eq!(TimeRange::parse("30d").unwrap(), TimeRange::Last30Days);
        assert_eq!(TimeRange::parse("90d").unwrap(), TimeRange::Last90Days);
        assert_eq!(TimeRange::parse("7d").unwrap(), TimeRange::Last7Days);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(TimeRange::parse("garbage").is_err());
        assert!(TimeRange::parse("").is_err());
    }

    #[test]
    fn test_parse_or_90d_fallback() {
        assert_eq!(TimeRange::parse_or_90d("last_30_days"), TimeRange::Last30Days);
        assert_eq!(TimeRange::parse_or_90d("bogus"), TimeRange::Last90Days);
    }

    #[test]
    fn test_to_key_roundtrip() {
        for r in [
            TimeRange::Last7Days,
            TimeRange::Last30Days,
            TimeRange::Last90Days,
            TimeRange::Last180Days,
            TimeRange::YearToDate,
            TimeRange::AllTime,
        ] {
            assert_eq!(TimeRange::parse(r.to_key()).unwrap(), r);
        }
    }

    #[test]
    fn test_start_date() {
        let today = d(2025, 6, 15);
        assert_eq!(
            TimeRange::Last30Days.start_date(today),
            Some(d(2025, 5, 16))
        );
        assert_eq!(
            TimeRange::Last90Days.start_date(today),
            Some(d(2025, 3, 17))
        );
        assert_eq!(TimeRange::YearToDate.start_date(today), Some(d(2025, 1, 1)));
        assert_eq!(TimeRange::AllTime.start_date(today), None);
    }

    #[test]
    fn test_remote_params_native() {
        let today = d(2025, 6, 15);
        assert_eq!(
            TimeRange::Last30Days.remote_params(today),
            RemoteRangeParams::native("30d")
        );
        assert_eq!(
            TimeRange::YearToDate.remote_params(today),
            RemoteRangeParams::native("ytd")
        );
        assert_eq!(
            TimeRange::AllTime.remote_params(today),
            RemoteRangeParams::native("all_time")
        );
    }

    #[test]
    fn test_remote_params_180d_custom() {
        let today = d(2025, 6, 15);
        let params = TimeRange::Last180Days.remote_params(today);
        assert_eq!(params.range, "custom");
        let start = params.range_start.unwrap();
        let end = params.range_end.unwrap();
        assert_eq!(start, "2024-12-17");
        assert_eq!(end, "2025-06-15");
        // End never precedes start.
        assert!(end >= start);
    }

    #[test]
    fn test_bucket_parse_and_key() {
        assert_eq!(TimeBucket::parse("day").unwrap(), TimeBucket::Day);
        assert_eq!(TimeBucket::parse("month").unwrap(), TimeBucket::Month);
        assert_eq!(TimeBucket::parse("none").unwrap(), TimeBucket::None);
        assert!(TimeBucket::parse("quarterly").is_err());
        assert_eq!(TimeBucket::Week.to_key(), "week");
    }

    #[test]
    fn test_bucket_refinement() {
        assert_eq!(TimeBucket::Month.refinement(), Some(TimeBucket::Day));
        assert_eq!(TimeBucket::Week.refinement(), Some(TimeBucket::Day));
        assert_eq!(TimeBucket::Day.refinement(), None);
        assert_eq!(TimeBucket::None.refinement(), None);
    }
}
