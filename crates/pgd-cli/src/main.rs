use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pgd_access::{
    has_access, hash_password, IdentityStore, InMemoryIdentityStore, Section, DEFAULT_PBKDF2_ITERATIONS,
};
use pgd_core::SheetId;
use pgd_sync::{analytics, users_file_from, DashboardConfig, SheetCache};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pgd-cli")]
#[command(about = "HR dashboard data pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API.
    Serve,
    /// Fetch and clean one sheet, printing its rows as JSON.
    Fetch { sheet: SheetId },
    /// Print one analytics report computed from the employment sheet.
    Report { report: ReportKind },
    /// Produce a salted password record for the users file. Reads the password from stdin.
    HashPassword {
        #[arg(long, default_value_t = DEFAULT_PBKDF2_ITERATIONS)]
        iterations: u32,
    },
    /// Check a user's credentials (password on stdin) and their access to a section.
    CheckAccess {
        username: String,
        section: Section,
        #[arg(long)]
        users_file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportKind {
    Hiring,
    Units,
    Sourcing,
    Churn,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_secret_line() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("empty password on stdin");
    }
    Ok(password)
}

async fn load_sheet(sheet: SheetId) -> Result<pgd_core::CachedTable> {
    let config = DashboardConfig::from_env()?;
    let cache = SheetCache::from_config(&config)?;
    let lookup = cache.get_or_refresh(sheet).await;
    if let Some(error) = lookup.error() {
        warn!(sheet = %sheet, %error, "sheet refresh failed");
    }
    match lookup.table() {
        Some(cached) => Ok(cached.as_ref().clone()),
        None => bail!("sheet {sheet} is unavailable"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = DashboardConfig::from_env()?;
            pgd_web::serve(&config).await?;
        }
        Commands::Fetch { sheet } => {
            let cached = load_sheet(sheet).await?;
            eprintln!(
                "{sheet}: {} rows, {} columns, fetched at {}",
                cached.table.len(),
                cached.table.columns.len(),
                cached.fetched_at
            );
            println!("{}", serde_json::to_string_pretty(&cached.table.to_records())?);
        }
        Commands::Report { report } => {
            let cached = load_sheet(SheetId::Employment).await?;
            let table = &cached.table;
            let json = match report {
                ReportKind::Hiring => serde_json::to_string_pretty(&analytics::hiring_funnel(table))?,
                ReportKind::Units => serde_json::to_string_pretty(&analytics::unit_conversion(table))?,
                ReportKind::Sourcing => serde_json::to_string_pretty(&analytics::sourcing_channels(table))?,
                ReportKind::Churn => serde_json::to_string_pretty(&analytics::churn_breakdown(table))?,
            };
            println!("{json}");
        }
        Commands::HashPassword { iterations } => {
            let password = read_secret_line()?;
            let record = hash_password(&password, iterations);
            print!("{}", serde_yaml::to_string(&record)?);
        }
        Commands::CheckAccess {
            username,
            section,
            users_file,
        } => {
            let path = users_file.unwrap_or_else(|| users_file_from(|key| std::env::var(key).ok()));
            let store = InMemoryIdentityStore::from_yaml_file(&path)
                .with_context(|| format!("loading users from {}", path.display()))?;
            let password = read_secret_line()?;
            let Some(identity) = store.authenticate(&username, &password) else {
                bail!("invalid credentials for `{username}`");
            };
            if has_access(&identity, section) {
                println!("granted: {} ({}) may view {section}", identity.display_name, identity.role);
            } else {
                bail!("denied: {} ({}) may not view {section}", identity.display_name, identity.role);
            }
        }
    }

    Ok(())
}
