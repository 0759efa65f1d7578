use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use salesmart_core::{
    config::PipelineConfig,
    db,
    pipeline::{RunOptions, SalesMartPipeline},
    types::{BusinessDate, MAX_BACKFILL_DAYS},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sales mart loader: report increment to staging to mart", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the increment for one business date and refresh the mart
    Run(RunArgs),
    /// Replay a window of business dates, oldest first
    Backfill(BackfillArgs),
    /// Re-run mart transformations for a business date
    Transform(TransformArgs),
    /// Create staging and mart schemas
    Migrate,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Business date (YYYY-MM-DD)
    #[arg(long)]
    date: BusinessDate,
    /// Stop after the staging load
    #[arg(long)]
    skip_transformations: bool,
}

#[derive(Args, Debug)]
struct BackfillArgs {
    /// First business date (inclusive)
    #[arg(long, requires = "to", conflicts_with = "days")]
    from: Option<BusinessDate>,
    /// Last business date (inclusive)
    #[arg(long, requires = "from")]
    to: Option<BusinessDate>,
    /// Number of days ending yesterday
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_BACKFILL_DAYS)))]
    days: Option<u32>,
    #[arg(long)]
    skip_transformations: bool,
}

#[derive(Args, Debug)]
struct TransformArgs {
    #[arg(long)]
    date: BusinessDate,
    /// Restrict to the named steps (repeatable)
    #[arg(long = "step")]
    steps: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let config = load_config()?;
            let pipeline = build_pipeline(&config).await?;
            let receipt = pipeline
                .run(
                    args.date,
                    RunOptions {
                        skip_transformations: args.skip_transformations,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        Command::Backfill(args) => {
            let dates = match (args.from, args.to, args.days) {
                (Some(from), Some(to), None) => BusinessDate::range_inclusive(from, to)?,
                (None, None, Some(days)) => {
                    BusinessDate::trailing_window(Local::now().date_naive(), days)?
                }
                _ => bail!("backfill needs either --from/--to or --days"),
            };
            if dates.is_empty() {
                bail!("backfill window is empty");
            }
            info!(count = dates.len(), "starting backfill");
            let config = load_config()?;
            let pipeline = build_pipeline(&config).await?;
            let receipts = pipeline
                .backfill(
                    &dates,
                    RunOptions {
                        skip_transformations: args.skip_transformations,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&receipts)?);
            Ok(())
        }
        Command::Transform(args) => {
            let config = load_config()?;
            let pipeline = build_pipeline(&config).await?;
            let executed = pipeline.transform(args.date, &args.steps).await?;
            info!(steps = ?executed, date = %args.date, "transformations finished");
            Ok(())
        }
        Command::Migrate => {
            let database_url = std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("SALESMART_DATABASE_URL"))
                .context("DATABASE_URL (or SALESMART_DATABASE_URL) must be set")?;
            let pool = db::connect(&database_url).await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations applied");
            Ok(())
        }
    }
}

fn load_config() -> Result<PipelineConfig> {
    PipelineConfig::from_env().context("failed to load configuration")
}

async fn build_pipeline(config: &PipelineConfig) -> Result<SalesMartPipeline> {
    let pool = db::connect(config.require_database_url()?).await?;
    Ok(SalesMartPipeline::from_config(config, pool).await?)
}
