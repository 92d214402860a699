use anyhow::{bail, Context, Result};
use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use ccdb_pipeline::{run_backfill, BackfillPlan, PipelineConfig, PipelineRunner};

#[derive(Debug, Parser)]
#[command(name = "ccdb-cli")]
#[command(about = "CFPB consumer-complaint extract-load pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Backfill landing partitions (and the warehouse) over a date range
    Backfill {
        /// First day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last day, inclusive (YYYY-MM-DD, default: today)
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Backfill the last N days (alternative to --start)
        #[arg(long)]
        days: Option<u64>,
        /// Write landing files without merging into the warehouse
        #[arg(long)]
        no_merge: bool,
    },
}

/// Resolve the inclusive backfill window before any I/O happens.
fn resolve_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    days: Option<u64>,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate)> {
    let end = end.unwrap_or(today);
    let start = match (days, start) {
        (Some(0), _) => bail!("--days must be at least 1"),
        (Some(n), _) => end
            .checked_sub_days(Days::new(n - 1))
            .context("--days reaches before the supported calendar range")?,
        (None, Some(start)) => start,
        (None, None) => bail!("either --start or --days is required"),
    };
    if start > end {
        bail!("start date {start} is after end date {end}");
    }
    Ok((start, end))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Backfill {
            start,
            end,
            days,
            no_merge,
        } => {
            let (start, end) = resolve_range(start, end, days, Utc::now().date_naive())?;

            let mut config = PipelineConfig::from_env();
            if no_merge {
                config.merge_enabled = false;
            }

            let plan = BackfillPlan {
                start,
                end,
                companies: config.companies.clone(),
            };
            let runner = PipelineRunner::new(config);
            let summary = run_backfill(&plan, &runner).await?;

            println!(
                "backfill complete: run_id={} days={} files={} rows={} failures={}",
                summary.run_id,
                summary.total_days,
                summary.total_files,
                summary.total_rows,
                summary.failures.len()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
    }

    #[test]
    fn days_flag_counts_back_from_end() {
        let today = date(2026, 2, 25);
        let (start, end) = resolve_range(None, None, Some(7), today).expect("range");
        assert_eq!(end, today);
        assert_eq!(start, date(2026, 2, 19));
    }

    #[test]
    fn single_day_backfill_via_days_one() {
        let today = date(2026, 2, 25);
        let (start, end) = resolve_range(None, None, Some(1), today).expect("range");
        assert_eq!(start, end);
    }

    #[test]
    fn explicit_start_and_end_pass_through() {
        let (start, end) = resolve_range(
            Some(date(2026, 1, 1)),
            Some(date(2026, 2, 25)),
            None,
            date(2026, 3, 1),
        )
        .expect("range");
        assert_eq!(start, date(2026, 1, 1));
        assert_eq!(end, date(2026, 2, 25));
    }

    #[test]
    fn end_defaults_to_today() {
        let today = date(2026, 3, 1);
        let (_, end) =
            resolve_range(Some(date(2026, 2, 1)), None, None, today).expect("range");
        assert_eq!(end, today);
    }

    #[test]
    fn missing_start_and_days_is_a_usage_error() {
        assert!(resolve_range(None, None, None, date(2026, 3, 1)).is_err());
    }

    #[test]
    fn inverted_range_is_a_usage_error() {
        let result = resolve_range(
            Some(date(2026, 3, 2)),
            Some(date(2026, 3, 1)),
            None,
            date(2026, 3, 1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_days_is_a_usage_error() {
        assert!(resolve_range(None, None, Some(0), date(2026, 3, 1)).is_err());
    }
}
