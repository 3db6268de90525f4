use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cohort;
mod config;
mod db;
mod error;
mod models;
mod month;
mod payload;
mod report;

use config::Settings;
use models::{MonthlySnapshot, StaffDashboard, StaffRef};

#[derive(Parser)]
#[command(name = "care-dashboard")]
#[command(about = "Monthly customer-care cohort dashboard for CS staff", long_about = None)]
struct Cli {
    /// IANA time zone used to bucket months (overrides CARE_DASHBOARD_TZ)
    #[arg(long, global = true)]
    timezone: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import a reporting API export (one staff object or an array)
    Import {
        #[arg(long)]
        json: PathBuf,
    },
    /// Aggregate monthly snapshots for one staff member
    #[command(group(
        ArgGroup::new("source")
            .args(["email", "input"])
            .required(true)
            .multiple(false)
    ))]
    Snapshots {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        input: Option<PathBuf>,
        /// Treat this instant as "now" instead of the wall clock
        #[arg(long)]
        as_of: Option<String>,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generate a markdown dashboard for every staff member
    Report {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        as_of: Option<String>,
        #[arg(long, default_value = "care-report.md")]
        out: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(settings: &Settings) -> anyhow::Result<PgPool> {
    let database_url = settings.require_database_url()?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

fn resolve_now(as_of: Option<&str>, settings: &Settings) -> anyhow::Result<DateTime<Utc>> {
    match as_of {
        Some(value) => payload::parse_timestamp(value, settings.timezone, "--as-of")
            .context("--as-of must be a date or timestamp"),
        None => Ok(Utc::now()),
    }
}

/// Rows loaded from Postgres carry typed timestamps, so aggregation itself cannot fail here.
async fn load_dashboards(
    pool: &PgPool,
    staff: Vec<StaffRef>,
    now: DateTime<Utc>,
    settings: &Settings,
) -> anyhow::Result<Vec<(StaffRef, Result<StaffDashboard, error::AggregateError>)>> {
    let mut results = Vec::with_capacity(staff.len());
    for member in staff {
        let events = db::fetch_assignment_events(pool, member.id).await?;
        let snapshots = cohort::aggregate(&events, now, settings.timezone);
        results.push((
            member.clone(),
            Ok(StaffDashboard {
                staff: member,
                snapshots,
            }),
        ));
    }
    Ok(results)
}

fn emit(output: &str, out: Option<&Path>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, output)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Output written to {}.", path.display());
        }
        None => print!("{output}"),
    }
    Ok(())
}

fn render(
    format: OutputFormat,
    dashboards: &[(String, Vec<MonthlySnapshot>)],
) -> anyhow::Result<String> {
    match format {
        OutputFormat::Table => Ok(dashboards
            .iter()
            .map(|(name, snapshots)| report::render_table(name, snapshots))
            .collect::<Vec<_>>()
            .join("\n")),
        OutputFormat::Json => {
            let by_staff: Vec<serde_json::Value> = dashboards
                .iter()
                .map(|(name, snapshots)| serde_json::json!({ "staff": name, "snapshots": snapshots }))
                .collect();
            let mut text = serde_json::to_string_pretty(&by_staff)?;
            text.push('\n');
            Ok(text)
        }
        OutputFormat::Csv => {
            let mut buffer = Vec::new();
            report::write_csv(&mut buffer, dashboards)?;
            Ok(String::from_utf8(buffer)?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let settings = Settings::from_env(cli.timezone.as_deref())?;
    info!(timezone = settings.timezone.name(), "settings loaded");

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&settings).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect(&settings).await?;
            let inserted = db::seed(&pool).await?;
            println!("Seed data inserted ({inserted} new assignments).");
        }
        Commands::Import { json } => {
            let pool = connect(&settings).await?;
            let inserted = db::import_json(&pool, &json, settings.timezone).await?;
            info!(inserted, path = %json.display(), "import finished");
            println!("Inserted {inserted} assignments from {}.", json.display());
        }
        Commands::Snapshots {
            email,
            input,
            as_of,
            format,
            out,
        } => {
            let now = resolve_now(as_of.as_deref(), &settings)?;
            let mut dashboards = Vec::new();

            if let Some(path) = input {
                for staff_payload in payload::read_payloads(&path)? {
                    let snapshots = cohort::aggregate_payload(&staff_payload, now, settings.timezone)
                        .with_context(|| format!("aggregation failed for {}", staff_payload.staff_email))?;
                    dashboards.push((staff_payload.staff_name, snapshots));
                }
            } else if let Some(email) = email {
                let pool = connect(&settings).await?;
                let staff = db::fetch_staff_by_email(&pool, &email).await?;
                let events = db::fetch_assignment_events(&pool, staff.id).await?;
                dashboards.push((staff.name, cohort::aggregate(&events, now, settings.timezone)));
            }

            info!(staff = dashboards.len(), "snapshots built");
            let output = render(format, &dashboards)?;
            emit(&output, out.as_deref())?;
        }
        Commands::Report { input, as_of, out } => {
            let now = resolve_now(as_of.as_deref(), &settings)?;

            let results = match input {
                Some(path) => {
                    let payloads = payload::read_payloads(&path)?;
                    cohort::build_dashboard(&payloads, now, settings.timezone)
                }
                None => {
                    let pool = connect(&settings).await?;
                    let staff = db::fetch_staff(&pool).await?;
                    load_dashboards(&pool, staff, now, &settings).await?
                }
            };

            for (staff, result) in results.iter() {
                if let Err(err) = result {
                    warn!(staff = %staff.email, error = %err, "skipping staff member");
                }
            }

            let report = report::build_report(now, settings.timezone, &results);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
