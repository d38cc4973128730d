use anyhow::Result;
use clap::Parser;
use printforge::{config, db, sweeper};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Clear expired artifact references once and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the retention window from the config
    #[arg(long)]
    days: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let window = match args.days {
        Some(days) if days > 0 => chrono::Duration::days(days),
        Some(_) => anyhow::bail!("--days must be positive"),
        None => cfg.retention_window(),
    };

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let cleaned = sweeper::sweep(&pool, window).await?;
    println!("cleaned {} order(s)", cleaned);
    Ok(())
}
