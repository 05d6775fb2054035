pub mod client;
pub mod dispatch;
pub mod error;
pub mod formula;
pub mod mapping;
pub mod range;
pub mod rows;
pub mod series;

pub use client::{Agg, AggregateRequest, AggregateResponse, Aggregator, ApiClient, Metric, TableSnapshot};
pub use dispatch::{MetricSpec, QueryContext, Refinement, TrendResult, TrendSpec};
pub use error::{Error, Result};
pub use mapping::{ColumnRef, MultiColumnRef, TemplateMappings};
pub use range::{RemoteRangeParams, TimeBucket, TimeRange};
pub use rows::{AtRiskRow, CategorySlice, RowHealth, SchemaColumn, Variance};
pub use series::SeriesRow;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Semantic role ids a template can bind.
pub mod roles {
    pub const REVENUE: &str = "revenue";
    pub const COST: &str = "cost";
    pub const DATE: &str = "date";
    pub const REVENUE_DATE: &str = "revenue_date";
    pub const COST_DATE: &str = "cost_date";
    pub const STATUS: &str = "status";
    pub const CATEGORY: &str = "category";
    pub const BASELINE_COST: &str = "baseline_cost";
    pub const OWNER: &str = "owner";
    pub const CASH_REQUIRED: &str = "cash_required";
    pub const PROFIT_AMOUNTS: &str = "profit_amounts";
    pub const PROFIT_DATES: &str = "profit_dates";
    pub const PROFIT_CATEGORIES: &str = "profit_categories";
    pub const COST_AMOUNTS: &str = "cost_amounts";
    pub const COST_DATES: &str = "cost_dates";
    pub const COST_CATEGORIES: &str = "cost_categories";
}

/// Aliases used for the overview metrics.
const ALIAS_REVENUE: &str = "Revenue";
const ALIAS_COST: &str = "Cost";
const ALIAS_PROFIT: &str = "Profit";
const ALIAS_MARGIN: &str = "Margin";

/// How many category slices the overview keeps.
const CATEGORY_LIMIT: usize = 8;

/// How many at-risk rows the overview keeps.
const AT_RISK_LIMIT: usize = 5;

/// Client-computed breakdowns supplementing the remote aggregates. Each is
/// best-effort: a failed snapshot fetch or unresolvable column leaves that
/// breakdown absent without failing the primary view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Breakdowns {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<CategorySlice>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_risk: Option<Vec<AtRiskRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upcoming: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance: Option<Variance>,
}

/// The normalized output handed to presentation. The renderer sees only
/// this shape — no table ids, column ids, or remote request formats.
#[derive(Debug, Clone, Serialize)]
pub struct DataBundle {
    pub kpis: BTreeMap<String, f64>,
    pub series: Vec<SeriesRow>,
    pub breakdowns: Breakdowns,
    /// "No data in range" messages from the aggregator; present when the
    /// series is legitimately empty, so callers can explain rather than
    /// show an error.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub messages: Vec<String>,
}

/// Main entry point: resolves template mappings and aggregates dashboard
/// data through a remote widget-query API.
pub struct DashboardEngine {
    client: Box<dyn Aggregator>,
}

impl DashboardEngine {
    pub fn new(client: impl Aggregator + 'static) -> Self {
        Self {
            client: Box::new(client),
        }
    }

    /// Build an engine from `DASHQ_API_URL` / `DASHQ_API_TOKEN`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ApiClient::from_env()?))
    }

    /// Unbucketed totals for ad-hoc metrics.
    pub async fn kpi_totals(
        &self,
        specs: &[MetricSpec],
        ctx: &QueryContext,
    ) -> Result<BTreeMap<String, f64>> {
        dispatch::fetch_kpi_totals(self.client.as_ref(), specs, ctx).await
    }

    /// Bucketed trend for ad-hoc metrics.
    pub async fn trend(&self, specs: &[TrendSpec], ctx: &QueryContext) -> Result<TrendResult> {
        dispatch::fetch_trend(self.client.as_ref(), specs, ctx).await
    }

    /// Load the full overview bundle for a template's mappings.
    ///
    /// Required roles are checked before any network call; a missing
    /// revenue, cost, or date mapping fails fast with a configuration
    /// error naming the unmapped roles. KPI and trend fetches run
    /// concurrently, then client-side breakdowns are computed from table
    /// snapshots where the relevant optional roles are mapped.
    pub async fn load_overview(
        &self,
        mappings: &TemplateMappings,
        ctx: &QueryContext,
    ) -> Result<DataBundle> {
        let revenue = mappings.resolve(roles::REVENUE);
        let cost = mappings.resolve(roles::COST);
        let date = mappings.resolve(roles::DATE);
        let revenue_date = mapped_or(mappings.resolve(roles::REVENUE_DATE), &date);
        let cost_date = mapped_or(mappings.resolve(roles::COST_DATE), &date);

        let mut missing = mappings.missing_roles(&[roles::REVENUE, roles::COST]);
        if !revenue_date.is_mapped() || !cost_date.is_mapped() {
            missing.push(roles::DATE.to_string());
        }
        if !missing.is_empty() {
            return Err(Error::missing_roles(missing));
        }

        let kpi_specs = vec![
            MetricSpec::sum(ALIAS_REVENUE, revenue.clone()),
            MetricSpec::sum(ALIAS_COST, cost.clone()),
        ];
        let trend_specs = vec![
            TrendSpec::new(
                MetricSpec::sum(ALIAS_REVENUE, revenue.clone()),
                revenue_date.clone(),
            ),
            TrendSpec::new(MetricSpec::sum(ALIAS_COST, cost.clone()), cost_date.clone()),
        ];

        let (mut kpis, trend) = tokio::try_join!(
            dispatch::fetch_kpi_totals(self.client.as_ref(), &kpi_specs, ctx),
            dispatch::fetch_trend(self.client.as_ref(), &trend_specs, ctx),
        )?;

        let revenue_total = kpis.get(ALIAS_REVENUE).copied().unwrap_or(0.0);
        let cost_total = kpis.get(ALIAS_COST).copied().unwrap_or(0.0);
        let profit = revenue_total - cost_total;
        let margin = if revenue_total != 0.0 {
            profit / revenue_total * 100.0
        } else {
            0.0
        };
        kpis.insert(ALIAS_PROFIT.to_string(), profit);
        kpis.insert(ALIAS_MARGIN.to_string(), margin);

        let breakdowns = self
            .compute_breakdowns(mappings, ctx, &revenue, &cost, &date, &revenue_date)
            .await;

        Ok(DataBundle {
            kpis,
            series: trend.series,
            breakdowns,
            messages: trend.messages,
        })
    }

    /// Compute the client-side breakdowns. Never fails: any snapshot fetch
    /// or column-resolution problem skips just that breakdown with a
    /// warning.
    async fn compute_breakdowns(
        &self,
        mappings: &TemplateMappings,
        ctx: &QueryContext,
        revenue: &ColumnRef,
        cost: &ColumnRef,
        date: &ColumnRef,
        revenue_date: &ColumnRef,
    ) -> Breakdowns {
        let category = [
            mappings.resolve(roles::CATEGORY),
            mappings.resolve(roles::PROFIT_CATEGORIES),
            mappings.resolve(roles::COST_CATEGORIES),
        ]
        .into_iter()
        .find(|c| c.is_mapped());
        let profit_amounts = mappings.resolve_multi(roles::PROFIT_AMOUNTS);
        let cost_amounts = mappings.resolve_multi(roles::COST_AMOUNTS);
        let status = mappings.resolve(roles::STATUS);
        let baseline = mappings.resolve(roles::BASELINE_COST);
        let upcoming_date = mapped_or(date.clone(), revenue_date);

        // Fetch each needed table once.
        let mut wanted: Vec<&str> = Vec::new();
        if let Some(cat) = &category {
            wanted.push(&cat.table_id);
        }
        if revenue.table_id == cost.table_id {
            wanted.push(&revenue.table_id);
        }
        if upcoming_date.is_mapped() {
            wanted.push(&upcoming_date.table_id);
        }
        if baseline.is_mapped() {
            wanted.push(&baseline.table_id);
        }
        let mut snapshots: BTreeMap<String, TableSnapshot> = BTreeMap::new();
        for table_id in wanted {
            if snapshots.contains_key(table_id) {
                continue;
            }
            match self.client.table_snapshot(table_id).await {
                Ok(snap) => {
                    snapshots.insert(table_id.to_string(), snap);
                }
                Err(e) => {
                    log::warn!("skipping breakdowns for table {table_id}: {e}");
                }
            }
        }

        let mut breakdowns = Breakdowns::default();

        if let Some(cat) = &category {
            let amount_ids = rollup_amount_ids(cat, &profit_amounts, &cost_amounts, revenue, cost);
            breakdowns.categories =
                category_breakdown(&snapshots, cat, &amount_ids, CATEGORY_LIMIT);
        }

        if revenue.table_id == cost.table_id {
            if let Some(snap) = snapshots.get(&revenue.table_id) {
                let rev_col = rows::resolve_column(&snap.schema_json, &revenue.column_id);
                let cost_col = rows::resolve_column(&snap.schema_json, &cost.column_id);
                let status_col = (status.is_mapped() && status.table_id == revenue.table_id)
                    .then(|| rows::resolve_column(&snap.schema_json, &status.column_id))
                    .flatten();
                match (rev_col, cost_col) {
                    (Some(r), Some(c)) => {
                        breakdowns.at_risk = Some(rows::at_risk_rows(
                            &snap.data_json,
                            r,
                            c,
                            status_col,
                            AT_RISK_LIMIT,
                        ));
                    }
                    _ => log::warn!(
                        "revenue/cost columns not found on table {}, skipping health breakdown",
                        revenue.table_id
                    ),
                }
            }
        }

        if upcoming_date.is_mapped() {
            if let Some(snap) = snapshots.get(&upcoming_date.table_id) {
                match rows::resolve_column(&snap.schema_json, &upcoming_date.column_id) {
                    Some(col) => {
                        breakdowns.upcoming =
                            Some(rows::upcoming_rows(&snap.data_json, col, ctx.today));
                    }
                    None => log::warn!(
                        "date column {} not found on table {}, skipping upcoming breakdown",
                        upcoming_date.column_id,
                        upcoming_date.table_id
                    ),
                }
            }
        }

        if baseline.is_mapped() && baseline.table_id == cost.table_id {
            if let Some(snap) = snapshots.get(&baseline.table_id) {
                let baseline_col = rows::resolve_column(&snap.schema_json, &baseline.column_id);
                let cost_col = rows::resolve_column(&snap.schema_json, &cost.column_id);
                if let (Some(b), Some(c)) = (baseline_col, cost_col) {
                    let actual = rows::column_total(&snap.data_json, c);
                    let base = rows::column_total(&snap.data_json, b);
                    breakdowns.variance = Some(rows::baseline_variance(actual, base));
                }
            }
        }

        breakdowns
    }
}

fn mapped_or(preferred: ColumnRef, fallback: &ColumnRef) -> ColumnRef {
    if preferred.is_mapped() {
        preferred
    } else {
        fallback.clone()
    }
}

/// Amount columns summed in the category roll-up. A multi-column profit or
/// cost role on the category's table wins; otherwise the single cost or
/// revenue column on that table.
fn rollup_amount_ids(
    category: &ColumnRef,
    profit_amounts: &MultiColumnRef,
    cost_amounts: &MultiColumnRef,
    revenue: &ColumnRef,
    cost: &ColumnRef,
) -> Vec<String> {
    for multi in [profit_amounts, cost_amounts] {
        if multi.is_mapped() && multi.table_id == category.table_id {
            return multi.column_ids.clone();
        }
    }
    [cost, revenue]
        .into_iter()
        .find(|c| c.is_mapped() && c.table_id == category.table_id)
        .map(|c| vec![c.column_id.clone()])
        .unwrap_or_default()
}

/// Category roll-up over the category column's own table.
fn category_breakdown(
    snapshots: &BTreeMap<String, TableSnapshot>,
    category: &ColumnRef,
    amount_ids: &[String],
    limit: usize,
) -> Option<Vec<CategorySlice>> {
    let snap = snapshots.get(&category.table_id)?;
    let category_col = rows::resolve_column(&snap.schema_json, &category.column_id)?;
    let amount_cols: Vec<&SchemaColumn> = amount_ids
        .iter()
        .filter_map(|id| rows::resolve_column(&snap.schema_json, id))
        .collect();
    if amount_cols.is_empty() {
        return None;
    }
    Some(rows::category_rollup(
        &snap.data_json,
        category_col,
        &amount_cols,
        limit,
    ))
}
