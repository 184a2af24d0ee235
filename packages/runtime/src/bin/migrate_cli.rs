// Database migration CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

#[derive(Parser)]
#[command(name = "migrate_cli", about = "Run database migrations for the agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply all pending migrations
    Run,
    /// Show applied migration versions
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = runtime_core::Config::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    match cli.command {
        Command::Run => {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Migration failed")?;
            println!("migrations applied");
        }
        Command::Info => {
            let rows = sqlx::query_as::<_, (i64, String)>(
                "SELECT version, description FROM _sqlx_migrations ORDER BY version",
            )
            .fetch_all(&pool)
            .await
            .context("Failed to read migration history")?;
            for (version, description) in rows {
                println!("{version}\t{description}");
            }
        }
    }

    Ok(())
}
