use clap::{Parser, Subcommand};

use dashq::{
    Agg, ColumnRef, DashboardEngine, MetricSpec, QueryContext, Refinement, TemplateMappings,
    TimeBucket, TimeRange, TrendSpec,
};

#[derive(Parser)]
#[command(name = "dashq", about = "Dashboard aggregation CLI")]
struct Cli {
    /// Aggregation API base URL (default: $DASHQ_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token (default: $DASHQ_API_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unbucketed totals for one or more metrics
    Kpi {
        /// Source table id
        table: String,
        /// Metric as ALIAS=COLUMN or ALIAS=AGG:COLUMN (repeatable)
        #[arg(long = "metric", value_name = "SPEC", required = true)]
        metrics: Vec<String>,
        /// Time range (e.g. last_90_days, ytd, all_time)
        #[arg(long, default_value = "all_time")]
        range: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Bucketed trend series for one or more metrics
    Query {
        /// Source table id
        table: String,
        /// Metric as ALIAS=COLUMN or ALIAS=AGG:COLUMN (repeatable)
        #[arg(long = "metric", value_name = "SPEC", required = true)]
        metrics: Vec<String>,
        /// Date column to bucket by
        #[arg(long)]
        date_column: String,
        /// Time range (e.g. last_90_days, ytd, all_time)
        #[arg(long, default_value = "last_90_days")]
        range: String,
        /// Bucket size: day, week, month
        #[arg(long, default_value = "month")]
        bucket: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Full overview bundle for a template's role mappings
    Bundle {
        /// Path to a JSON file of role -> column mappings
        mappings: String,
        /// Fallback table id for bare-column mappings
        #[arg(long)]
        table: String,
        /// Time range (e.g. last_90_days, ytd, all_time)
        #[arg(long, default_value = "last_90_days")]
        range: String,
        /// Bucket size: day, week, month
        #[arg(long, default_value = "month")]
        bucket: String,
    },
}

/// Parse ALIAS=COLUMN or ALIAS=AGG:COLUMN into a bound metric.
fn parse_metric(spec: &str, table: &str) -> anyhow::Result<MetricSpec> {
    let (alias, rest) = spec
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid metric {spec:?}. Use ALIAS=COLUMN or ALIAS=AGG:COLUMN"))?;
    let (agg, column) = match rest.split_once(':') {
        Some((agg, column)) => (Agg::parse(agg)?, column),
        None => (Agg::Sum, rest),
    };
    Ok(MetricSpec {
        alias: alias.trim().to_string(),
        agg,
        column: ColumnRef::new(table, column.trim()),
    })
}

fn make_context(range: &str, bucket: &str) -> anyhow::Result<QueryContext> {
    Ok(QueryContext::new(
        TimeRange::parse(range)?,
        TimeBucket::parse(bucket)?,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let engine = match &cli.api_url {
        Some(base) => DashboardEngine::new(dashq::ApiClient::new(
            base,
            cli.token
                .clone()
                .or_else(|| std::env::var("DASHQ_API_TOKEN").ok()),
        )?),
        None => DashboardEngine::from_env()?,
    };

    match cli.command {
        Commands::Kpi {
            table,
            metrics,
            range,
            json,
        } => {
            let specs = metrics
                .iter()
                .map(|m| parse_metric(m, &table))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let ctx = make_context(&range, "none")?;
            let totals = engine.kpi_totals(&specs, &ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&totals)?);
            } else {
                for (alias, value) in &totals {
                    println!("{alias}: {value}");
                }
            }
        }
        Commands::Query {
            table,
            metrics,
            date_column,
            range,
            bucket,
            json,
        } => {
            let date_col = ColumnRef::new(&table, &date_column);
            let specs = metrics
                .iter()
                .map(|m| {
                    parse_metric(m, &table).map(|metric| TrendSpec::new(metric, date_col.clone()))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let ctx = make_context(&range, &bucket)?;
            let result = engine.trend(&specs, &ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result.series)?);
            } else {
                for row in &result.series {
                    let cells: Vec<String> = row
                        .values
                        .iter()
                        .map(|(alias, value)| format!("{alias}={value}"))
                        .collect();
                    println!("{}  {}", row.t, cells.join("  "));
                }
                if result
                    .refinements
                    .iter()
                    .any(|r| *r == Refinement::Refined)
                {
                    eprintln!("(bucket refined to day granularity)");
                }
                for msg in &result.messages {
                    eprintln!("{msg}");
                }
                if result.series.is_empty() && result.messages.is_empty() {
                    println!("No rows.");
                }
            }
        }
        Commands::Bundle {
            mappings,
            table,
            range,
            bucket,
        } => {
            let raw = std::fs::read_to_string(&mappings)
                .map_err(|e| anyhow::anyhow!("Cannot read mappings file {mappings:?}: {e}"))?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            let mappings = TemplateMappings::from_value(value, &table);
            let ctx = make_context(&range, &bucket)?;
            let bundle = engine.load_overview(&mappings, &ctx).await?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
        }
    }

    Ok(())
}
