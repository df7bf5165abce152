use std::path::PathBuf;

use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use miette::{IntoDiagnostic, Result};
use perimeter::policy::loader;
use perimeter::settings::Settings;
use perimeter::storage::{self, Store};
use perimeter::{jobs, policy::ServiceEvent};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "perimeter",
    version,
    about = "Zero-trust network access policy engine"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "perimeter.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Apply the KDL manifests in a directory
    Load {
        /// Directory containing `.kdl` manifests
        dir: PathBuf,
    },
    /// Run the integrity check once
    Check {
        /// Fix discrepancies instead of only reporting them
        #[arg(long)]
        repair: bool,
    },
    /// Load manifests, check integrity on a schedule and log change events
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    let db = storage::init(&settings.database).await?;

    match cli.command {
        Command::Migrate => {
            Migrator::up(&db, None).await.into_diagnostic()?;
            tracing::info!("Migrations applied");
        }
        Command::Load { dir } => {
            let store = Store::new(db);
            loader::load_manifests(&store, &dir).await?;
        }
        Command::Check { repair } => {
            let store = Store::new(db);
            let run = jobs::run_integrity_check(&store, repair).await?;
            tracing::info!(found = run.found, fixed = run.fixed, "Integrity check finished");
            if run.unfixed() > 0 {
                return Err(miette::miette!(
                    "{} integrity discrepancies remain",
                    run.unfixed()
                ));
            }
        }
        Command::Run => run(settings, db).await?,
    }

    Ok(())
}

async fn run(settings: Settings, db: sea_orm::DatabaseConnection) -> Result<()> {
    Migrator::up(&db, None).await.into_diagnostic()?;

    let store = Store::new(db);
    store.events().subscribe(log_event);

    if let Some(dir) = &settings.manifests.dir {
        loader::load_manifests(&store, dir).await?;
    }

    if settings.integrity.on_startup {
        let run = jobs::run_integrity_check(&store, settings.integrity.repair).await?;
        tracing::info!(found = run.found, fixed = run.fixed, "Startup integrity check finished");
    }

    let mut scheduler = jobs::init_scheduler(store.clone(), &settings.integrity).await?;

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    tracing::info!("Shutting down");
    scheduler
        .shutdown()
        .await
        .map_err(|e| miette::miette!("Failed to stop job scheduler: {e}"))?;
    Ok(())
}

fn log_event(event: &ServiceEvent) {
    tracing::info!(
        event_type = ?event.event_type,
        identity_id = %event.identity_id,
        service_id = %event.service_id,
        policy_type = %event.policy_type,
        "service access changed"
    );
}
