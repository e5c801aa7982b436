use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rwi_adapters::{load_record_bundle, Normalizer};
use rwi_core::CanonicalField;
use rwi_storage::{InMemoryBackend, PgBackend, StorageBackend};
use rwi_sync::{build_scheduler, BundleDirectorySource, Importer, RemoteItemSource, SyncConfig};
use rwi_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SCHEDULE_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "rwi-cli")]
#[command(about = "Remote work item reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations (needs DATABASE_URL).
    Migrate,
    /// Serve the JSON API, with scheduled imports when RWI_SCHEDULER_ENABLED is set.
    Serve,
    /// Import one record bundle into a tracker query.
    Import {
        #[arg(long = "tracker-query")]
        tracker_query: String,
        #[arg(long)]
        bundle: PathBuf,
    },
    /// Run scheduled imports until interrupted.
    Schedule,
    /// List the provider schemas in effect.
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rwi=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let normalizer = Normalizer::new(Arc::new(
        config.schema_registry().context("loading provider schemas")?,
    ));

    if let Commands::Providers = cli.command {
        print_providers(&normalizer);
        return Ok(());
    }

    match config.database_url.as_deref() {
        Some(url) => {
            let backend = PgBackend::connect(url, config.max_db_connections()).await?;
            if let Commands::Migrate = cli.command {
                backend.migrate().await?;
                println!("migrations applied");
                return Ok(());
            }
            run(cli.command, &config, Importer::new(backend, normalizer)).await
        }
        None => {
            if let Commands::Migrate = cli.command {
                bail!("DATABASE_URL must be set to run migrations");
            }
            warn!("DATABASE_URL not set; using the in-memory backend");
            run(cli.command, &config, Importer::new(InMemoryBackend::new(), normalizer)).await
        }
    }
}

async fn run<B: StorageBackend>(command: Commands, config: &SyncConfig, importer: Importer<B>) -> Result<()> {
    let importer = importer.with_concurrency(config.import_concurrency);
    let source: Arc<dyn RemoteItemSource> =
        Arc::new(BundleDirectorySource::new(config.bundles_dir.clone()));

    match command {
        Commands::Serve => {
            let mut state = AppState::new(importer.clone());
            if let Some(scheduler) = build_scheduler(config, importer, source).await? {
                scheduler.start().await?;
                state = state.with_scheduler(Arc::new(scheduler));
            }
            rwi_web::serve(config.web_port, state).await?;
        }
        Commands::Import {
            tracker_query,
            bundle,
        } => {
            let bundle = load_record_bundle(&bundle)?;
            let records = bundle.remote_records()?;
            info!(bundle = bundle.bundle_id.as_str(), records = records.len(), "importing bundle");
            let summary = importer
                .import_batch(&tracker_query, &bundle.provider_type, records)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule => {
            let Some(scheduler) = build_scheduler(config, importer, source).await? else {
                bail!("scheduling is disabled; set RWI_SCHEDULER_ENABLED=true");
            };
            scheduler.start().await?;
            // Tracker queries may be changed by other processes sharing the database.
            let mut resync = tokio::time::interval(SCHEDULE_RESYNC_INTERVAL);
            resync.tick().await;
            loop {
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("waiting for ctrl-c")?;
                        break;
                    }
                    _ = resync.tick() => {
                        if let Err(err) = scheduler.resync().await {
                            warn!(error = %format!("{err:#}"), "resyncing tracker query schedules failed");
                        }
                    }
                }
            }
            scheduler.shutdown().await?;
        }
        Commands::Migrate | Commands::Providers => {}
    }
    Ok(())
}

fn print_providers(normalizer: &Normalizer) {
    let registry = normalizer.registry();
    for provider in registry.providers() {
        println!("{provider}");
        for field in CanonicalField::ALL {
            if let Ok(keys) = registry.resolve(provider, field) {
                if !keys.is_empty() {
                    println!("  {:<24} {}", field.as_str(), keys.join(", "));
                }
            }
        }
    }
}
