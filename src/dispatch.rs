use std::collections::BTreeMap;

use chrono::NaiveDate;
use futures::future;

use crate::client::{Agg, AggregateRequest, AggregateResponse, Aggregator, Metric};
use crate::error::Result;
use crate::mapping::ColumnRef;
use crate::range::{TimeBucket, TimeRange};
use crate::series::{merge_by_time_key, SeriesRow};

/// Immutable query context for one render cycle. Range/bucket changes
/// produce a fresh context rather than mutating shared fetch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryContext {
    pub range: TimeRange,
    pub bucket: TimeBucket,
    /// "Now" for range arithmetic; pinned per context so every request
    /// built from it sees the same instant.
    pub today: NaiveDate,
}

impl QueryContext {
    pub fn new(range: TimeRange, bucket: TimeBucket) -> Self {
        Self {
            range,
            bucket,
            today: chrono::Utc::now().date_naive(),
        }
    }
}

/// One metric bound to a resolved column, the dispatcher's unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
    pub alias: String,
    pub agg: Agg,
    pub column: ColumnRef,
}

impl MetricSpec {
    pub fn sum(alias: impl Into<String>, column: ColumnRef) -> Self {
        Self {
            alias: alias.into(),
            agg: Agg::Sum,
            column,
        }
    }

    fn to_metric(&self) -> Metric {
        Metric {
            alias: self.alias.clone(),
            agg: self.agg,
            column_id: self.column.column_id.clone(),
        }
    }
}

/// A metric plus the date column that buckets it, for trend queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendSpec {
    pub metric: MetricSpec,
    pub date_column: ColumnRef,
}

impl TrendSpec {
    pub fn new(metric: MetricSpec, date_column: ColumnRef) -> Self {
        Self { metric, date_column }
    }
}

/// How a trend group's bucket-collapse refinement played out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refinement {
    /// The coarse bucket produced enough points; no retry issued.
    NotNeeded,
    /// The day-granularity retry produced more points and was substituted.
    Refined,
    /// A retry was attempted but the coarse result was kept, either because
    /// the finer series was no better or because the retry failed.
    KeptCoarse,
}

/// Merged trend series plus the degradation record per query group, in
/// deterministic group order.
#[derive(Debug, Clone)]
pub struct TrendResult {
    pub series: Vec<SeriesRow>,
    pub refinements: Vec<Refinement>,
    /// "No data in range" messages passed through from the aggregator.
    pub messages: Vec<String>,
}

/// Build the unbucketed KPI requests, one per distinct source table.
pub fn build_kpi_requests(specs: &[MetricSpec], ctx: &QueryContext) -> Vec<AggregateRequest> {
    let mut by_table: BTreeMap<String, Vec<Metric>> = BTreeMap::new();
    for spec in specs {
        by_table
            .entry(spec.column.table_id.clone())
            .or_default()
            .push(spec.to_metric());
    }
    by_table
        .into_iter()
        .map(|(table_id, metrics)| AggregateRequest {
            table_id,
            metrics,
            date_column_id: None,
            time_bucket: TimeBucket::None,
            range: ctx.range.remote_params(ctx.today),
        })
        .collect()
}

/// Build the bucketed trend requests, one per distinct (table, date column)
/// pair. Metrics sharing both combine into a single request.
pub fn build_trend_requests(specs: &[TrendSpec], ctx: &QueryContext) -> Vec<AggregateRequest> {
    let mut by_group: BTreeMap<(String, String), Vec<Metric>> = BTreeMap::new();
    for spec in specs {
        by_group
            .entry((
                spec.metric.column.table_id.clone(),
                spec.date_column.column_id.clone(),
            ))
            .or_default()
            .push(spec.metric.to_metric());
    }
    by_group
        .into_iter()
        .map(|((table_id, date_column_id), metrics)| AggregateRequest {
            table_id,
            metrics,
            date_column_id: Some(date_column_id),
            time_bucket: ctx.bucket,
            range: ctx.range.remote_params(ctx.today),
        })
        .collect()
}

/// Fetch KPI totals for the given metrics, combining per-table scalars by
/// alias. Every alias is present in the output; aliases the aggregator
/// returned no row for default to 0.
pub async fn fetch_kpi_totals(
    aggregator: &dyn Aggregator,
    specs: &[MetricSpec],
    ctx: &QueryContext,
) -> Result<BTreeMap<String, f64>> {
    let requests = build_kpi_requests(specs, ctx);
    let responses: Vec<AggregateResponse> =
        future::try_join_all(requests.iter().map(|r| aggregator.aggregate(r))).await?;

    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for spec in specs {
        totals.insert(spec.alias.clone(), 0.0);
    }
    for (request, response) in requests.iter().zip(&responses) {
        let row = match response.series.first() {
            Some(row) => row,
            None => continue,
        };
        for metric in &request.metrics {
            if let Some(v) = row.get(&metric.alias) {
                totals.insert(metric.alias.clone(), v);
            }
        }
    }
    Ok(totals)
}

/// Fetch bucketed trend series for the given metrics and merge them into a
/// single time-keyed sequence.
///
/// When a month- or week-bucketed group comes back with one row or fewer,
/// the same query is re-issued at day granularity and the finer result is
/// substituted if it yields more than one row. A failed retry is swallowed
/// and the coarse result kept — the refinement is best-effort and never
/// fails the primary fetch.
pub async fn fetch_trend(
    aggregator: &dyn Aggregator,
    specs: &[TrendSpec],
    ctx: &QueryContext,
) -> Result<TrendResult> {
    let requests = build_trend_requests(specs, ctx);
    let responses: Vec<AggregateResponse> =
        future::try_join_all(requests.iter().map(|r| aggregator.aggregate(r))).await?;

    let mut per_group: Vec<Vec<SeriesRow>> = Vec::with_capacity(requests.len());
    let mut refinements = Vec::with_capacity(requests.len());
    let mut messages = Vec::new();

    for (request, response) in requests.iter().zip(responses) {
        let AggregateResponse {
            series, message, ..
        } = response;
        let refine_at = ctx.bucket.refinement();
        let (rows, refinement) = match refine_at {
            Some(finer) if series.len() <= 1 => {
                refine_group(aggregator, request, finer, series).await
            }
            _ => (series, Refinement::NotNeeded),
        };
        // The coarse message describes the coarse series; once a day
        // retry replaced it, the message no longer applies.
        if refinement != Refinement::Refined {
            if let Some(msg) = message {
                messages.push(msg);
            }
        }
        per_group.push(rows);
        refinements.push(refinement);
    }

    Ok(TrendResult {
        series: merge_by_time_key(&per_group),
        refinements,
        messages,
    })
}

async fn refine_group(
    aggregator: &dyn Aggregator,
    request: &AggregateRequest,
    finer: TimeBucket,
    coarse: Vec<SeriesRow>,
) -> (Vec<SeriesRow>, Refinement) {
    let retry = AggregateRequest {
        time_bucket: finer,
        ..request.clone()
    };
    match aggregator.aggregate(&retry).await {
        Ok(fine) if fine.series.len() > 1 => (fine.series, Refinement::Refined),
        Ok(_) => (coarse, Refinement::KeptCoarse),
        Err(e) => {
            log::debug!(
                "bucket refinement for table {} failed, keeping coarse series: {e}",
                request.table_id
            );
            (coarse, Refinement::KeptCoarse)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn ctx(range: TimeRange, bucket: TimeBucket) -> QueryContext {
        QueryContext {
            range,
            bucket,
            today: NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(),
        }
    }

    fn col(table: &str, column: &str) -> ColumnRef {
        ColumnRef::new(table, column)
    }

    fn row(t: &str, pairs: &[(&str, f64)]) -> SeriesRow {
        let mut r = SeriesRow::new(t);
        for (k, v) in pairs {
            r.values.insert(k.to_string(), *v);
        }
        r
    }

    /// Stub aggregator returning canned responses keyed by
    /// (table id, bucket); records every request it sees.
    struct StubAggregator {
        responses: BTreeMap<(String, String), AggregateResponse>,
        fail_buckets: Vec<TimeBucket>,
        requests: Mutex<Vec<AggregateRequest>>,
    }

    impl StubAggregator {
        fn new() -> Self {
            Self {
                responses: BTreeMap::new(),
                fail_buckets: Vec::new(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn respond(mut self, table: &str, bucket: TimeBucket, series: Vec<SeriesRow>) -> Self {
            self.responses.insert(
                (table.to_string(), bucket.to_key().to_string()),
                AggregateResponse {
                    series,
                    ..Default::default()
                },
            );
            self
        }

        fn fail_bucket(mut self, bucket: TimeBucket) -> Self {
            self.fail_buckets.push(bucket);
            self
        }

        fn seen(&self) -> Vec<AggregateRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Aggregator for StubAggregator {
        async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateResponse> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail_buckets.contains(&request.time_bucket) {
                return Err(Error::Api("stub failure".to_string()));
            }
            Ok(self
                .responses
                .get(&(
                    request.table_id.clone(),
                    request.time_bucket.to_key().to_string(),
                ))
                .cloned()
                .unwrap_or_default())
        }

        async fn table_snapshot(&self, table_id: &str) -> Result<crate::client::TableSnapshot> {
            Err(Error::NotFound(table_id.to_string()))
        }
    }

    #[test]
    fn test_kpi_requests_grouped_by_table() {
        let specs = vec![
            MetricSpec::sum("Revenue", col("tbl_a", "amount")),
            MetricSpec::sum("Cost", col("tbl_b", "spend")),
            MetricSpec::sum("Fees", col("tbl_a", "fees")),
        ];
        let requests = build_kpi_requests(&specs, &ctx(TimeRange::Last30Days, TimeBucket::None));
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].table_id, "tbl_a");
        assert_eq!(requests[0].metrics.len(), 2);
        assert_eq!(requests[1].table_id, "tbl_b");
        assert!(requests.iter().all(|r| r.time_bucket == TimeBucket::None));
        assert!(requests.iter().all(|r| r.date_column_id.is_none()));
    }

    #[test]
    fn test_trend_requests_share_table_and_date_column() {
        let specs = vec![
            TrendSpec::new(
                MetricSpec::sum("Revenue", col("tbl_a", "amount")),
                col("tbl_a", "closed_at"),
            ),
            TrendSpec::new(
                MetricSpec::sum("Cost", col("tbl_a", "spend")),
                col("tbl_a", "closed_at"),
            ),
        ];
        let requests = build_trend_requests(&specs, &ctx(TimeRange::Last90Days, TimeBucket::Month));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].metrics.len(), 2);
        assert_eq!(requests[0].date_column_id.as_deref(), Some("closed_at"));
        assert_eq!(requests[0].time_bucket, TimeBucket::Month);
    }

    #[test]
    fn test_trend_requests_split_on_date_column() {
        let specs = vec![
            TrendSpec::new(
                MetricSpec::sum("Revenue", col("tbl_a", "amount")),
                col("tbl_a", "revenue_date"),
            ),
            TrendSpec::new(
                MetricSpec::sum("Cost", col("tbl_a", "spend")),
                col("tbl_a", "cost_date"),
            ),
        ];
        let requests = build_trend_requests(&specs, &ctx(TimeRange::Last90Days, TimeBucket::Month));
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn test_kpi_totals_combine_across_tables() {
        let stub = StubAggregator::new()
            .respond("tbl_a", TimeBucket::None, vec![row("ALL", &[("Revenue", 500.0)])])
            .respond("tbl_b", TimeBucket::None, vec![row("ALL", &[("Cost", 200.0)])]);
        let specs = vec![
            MetricSpec::sum("Revenue", col("tbl_a", "amount")),
            MetricSpec::sum("Cost", col("tbl_b", "spend")),
        ];
        let totals = fetch_kpi_totals(&stub, &specs, &ctx(TimeRange::AllTime, TimeBucket::None))
            .await
            .unwrap();
        assert_eq!(totals["Revenue"], 500.0);
        assert_eq!(totals["Cost"], 200.0);
    }

    #[tokio::test]
    async fn test_kpi_totals_absent_rows_default_to_zero() {
        let stub = StubAggregator::new(); // every response empty
        let specs = vec![MetricSpec::sum("Revenue", col("tbl_a", "amount"))];
        let totals = fetch_kpi_totals(&stub, &specs, &ctx(TimeRange::Last30Days, TimeBucket::None))
            .await
            .unwrap();
        assert_eq!(totals["Revenue"], 0.0);
    }

    #[tokio::test]
    async fn test_trend_no_refinement_when_enough_rows() {
        let stub = StubAggregator::new().respond(
            "tbl_a",
            TimeBucket::Month,
            vec![
                row("2025-04", &[("Revenue", 1.0)]),
                row("2025-05", &[("Revenue", 2.0)]),
                row("2025-06", &[("Revenue", 3.0)]),
            ],
        );
        let specs = vec![TrendSpec::new(
            MetricSpec::sum("Revenue", col("tbl_a", "amount")),
            col("tbl_a", "closed_at"),
        )];
        let result = fetch_trend(&stub, &specs, &ctx(TimeRange::Last90Days, TimeBucket::Month))
            .await
            .unwrap();
        assert_eq!(result.series.len(), 3);
        assert_eq!(result.refinements, vec![Refinement::NotNeeded]);
        assert_eq!(stub.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_trend_refines_collapsed_month_bucket() {
        let stub = StubAggregator::new()
            .respond(
                "tbl_a",
                TimeBucket::Month,
                vec![row("2025-06", &[("Revenue", 6.0)])],
            )
            .respond(
                "tbl_a",
                TimeBucket::Day,
                vec![
                    row("2025-06-01", &[("Revenue", 1.0)]),
                    row("2025-06-02", &[("Revenue", 2.0)]),
                    row("2025-06-03", &[("Revenue", 3.0)]),
                ],
            );
        let specs = vec![TrendSpec::new(
            MetricSpec::sum("Revenue", col("tbl_a", "amount")),
            col("tbl_a", "closed_at"),
        )];
        let result = fetch_trend(&stub, &specs, &ctx(TimeRange::Last30Days, TimeBucket::Month))
            .await
            .unwrap();
        assert_eq!(result.series.len(), 3);
        assert_eq!(result.refinements, vec![Refinement::Refined]);
        let seen = stub.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].time_bucket, TimeBucket::Day);
    }

    #[tokio::test]
    async fn test_trend_keeps_coarse_when_retry_no_better() {
        let stub = StubAggregator::new()
            .respond(
                "tbl_a",
                TimeBucket::Month,
                vec![row("2025-06", &[("Revenue", 6.0)])],
            )
            .respond(
                "tbl_a",
                TimeBucket::Day,
                vec![row("2025-06-01", &[("Revenue", 6.0)])],
            );
        let specs = vec![TrendSpec::new(
            MetricSpec::sum("Revenue", col("tbl_a", "amount")),
            col("tbl_a", "closed_at"),
        )];
        let result = fetch_trend(&stub, &specs, &ctx(TimeRange::Last30Days, TimeBucket::Month))
            .await
            .unwrap();
        assert_eq!(result.series.len(), 1);
        assert_eq!(result.series[0].t, "2025-06");
        assert_eq!(result.refinements, vec![Refinement::KeptCoarse]);
    }

    #[tokio::test]
    async fn test_trend_swallows_failed_retry() {
        let stub = StubAggregator::new()
            .respond(
                "tbl_a",
                TimeBucket::Week,
                vec![row("2025-W24", &[("Revenue", 6.0)])],
            )
            .fail_bucket(TimeBucket::Day);
        let specs = vec![TrendSpec::new(
            MetricSpec::sum("Revenue", col("tbl_a", "amount")),
            col("tbl_a", "closed_at"),
        )];
        let result = fetch_trend(&stub, &specs, &ctx(TimeRange::Last30Days, TimeBucket::Week))
            .await
            .unwrap();
        assert_eq!(result.series.len(), 1);
        assert_eq!(result.refinements, vec![Refinement::KeptCoarse]);
    }

    #[tokio::test]
    async fn test_trend_day_bucket_never_refines() {
        let stub = StubAggregator::new().respond(
            "tbl_a",
            TimeBucket::Day,
            vec![row("2025-06-01", &[("Revenue", 1.0)])],
        );
        let specs = vec![TrendSpec::new(
            MetricSpec::sum("Revenue", col("tbl_a", "amount")),
            col("tbl_a", "closed_at"),
        )];
        let result = fetch_trend(&stub, &specs, &ctx(TimeRange::Last7Days, TimeBucket::Day))
            .await
            .unwrap();
        assert_eq!(result.refinements, vec![Refinement::NotNeeded]);
        assert_eq!(stub.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_trend_merges_two_tables() {
        let stub = StubAggregator::new()
            .respond(
                "tbl_a",
                TimeBucket::Month,
                vec![
                    row("2025-05", &[("Revenue", 10.0)]),
                    row("2025-06", &[("Revenue", 20.0)]),
                ],
            )
            .respond(
                "tbl_b",
                TimeBucket::Month,
                vec![
                    row("2025-05", &[("Cost", 4.0)]),
                    row("2025-06", &[("Cost", 5.0)]),
                ],
            );
        let specs = vec![
            TrendSpec::new(
                MetricSpec::sum("Revenue", col("tbl_a", "amount")),
                col("tbl_a", "closed_at"),
            ),
            TrendSpec::new(
                MetricSpec::sum("Cost", col("tbl_b", "spend")),
                col("tbl_b", "paid_at"),
            ),
        ];
        let result = fetch_trend(&stub, &specs, &ctx(TimeRange::Last90Days, TimeBucket::Month))
            .await
            .unwrap();
        assert_eq!(result.series.len(), 2);
        assert_eq!(result.series[0].get("Revenue"), Some(10.0));
        assert_eq!(result.series[0].get("Cost"), Some(4.0));
    }

    #[tokio::test]
    async fn test_trend_drops_stale_message_after_refinement() {
        let mut stub = StubAggregator::new().respond(
            "tbl_a",
            TimeBucket::Day,
            vec![
                row("2025-06-01", &[("Revenue", 1.0)]),
                row("2025-06-02", &[("Revenue", 2.0)]),
            ],
        );
        stub.responses.insert(
            ("tbl_a".to_string(), "month".to_string()),
            AggregateResponse {
                series: vec![],
                warnings: vec![],
                message: Some("No data in this time range.".to_string()),
            },
        );
        let specs = vec![TrendSpec::new(
            MetricSpec::sum("Revenue", col("tbl_a", "amount")),
            col("tbl_a", "closed_at"),
        )];
        let result = fetch_trend(&stub, &specs, &ctx(TimeRange::Last30Days, TimeBucket::Month))
            .await
            .unwrap();
        // The day retry produced data; the coarse "no data" message no
        // longer describes the series the caller sees.
        assert_eq!(result.series.len(), 2);
        assert_eq!(result.refinements, vec![Refinement::Refined]);
        assert!(result.messages.is_empty());
    }

    #[tokio::test]
    async fn test_trend_passes_through_no_data_message() {
        let mut stub = StubAggregator::new();
        stub.responses.insert(
            ("tbl_a".to_string(), "month".to_string()),
            AggregateResponse {
                series: vec![],
                warnings: vec![],
                message: Some("No data in this time range.".to_string()),
            },
        );
        let specs = vec![TrendSpec::new(
            MetricSpec::sum("Revenue", col("tbl_a", "amount")),
            col("tbl_a", "closed_at"),
        )];
        let result = fetch_trend(&stub, &specs, &ctx(TimeRange::Last90Days, TimeBucket::Month))
            .await
            .unwrap();
        assert!(result.series.is_empty());
        assert_eq!(result.messages, vec!["No data in this time range."]);
    }
}
