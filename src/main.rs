use clap::Parser;
use pool_rating_processor::{
    args::{Args, Command},
    database::db::DbClient,
    error::ProcessorError,
    ingest::{cache::TwoTierCache, ingest, source::HttpSource, IngestReport, IngestSettings},
    model::replay::{recompute, RecomputeReport, ReplaySettings}
};
use std::{
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc
    }
};
use tracing::{error, info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level);

    let Some(connection_string) = args.connection_string.as_deref() else {
        error!("CONNECTION_STRING is not set");
        exit(1);
    };

    let client = match connect(connection_string).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect to the database: {}", e);
            exit(1);
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let ctrl_c_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested, finishing the current tournament");
            ctrl_c_flag.store(true, Ordering::SeqCst);
        }
    });

    let result = match &args.command {
        Command::Ingest(ingest_args) => {
            run_ingest(&client, &args, &ingest_args.settings(), &cancel).await.map(|_| ())
        }
        Command::Recompute(recompute_args) => {
            run_recompute(&client, recompute_args.as_of, &recompute_args.settings()).await
        }
        Command::Run { ingest, recompute } => {
            match run_ingest(&client, &args, &ingest.settings(), &cancel).await {
                Ok(report) if report.cancelled => {
                    warn!("Ingest was cancelled, skipping recompute");
                    Ok(())
                }
                Ok(_) => run_recompute(&client, recompute.as_of, &recompute.settings()).await,
                Err(e) => Err(e)
            }
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        exit(1);
    }
}

fn init_tracing(log_level: &str) {
    let indicatif_layer = IndicatifLayer::new();
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
}

async fn connect(connection_string: &str) -> Result<DbClient, ProcessorError> {
    let client = DbClient::connect(connection_string)
        .await
        .map_err(ProcessorError::StoreUnavailable)?;
    client.ensure_schema().await?;

    info!("Connected to the database");
    Ok(client)
}

async fn run_ingest(
    client: &DbClient,
    args: &Args,
    settings: &IngestSettings,
    cancel: &AtomicBool
) -> Result<IngestReport, ProcessorError> {
    let cache = TwoTierCache::open(&args.cache_dir)
        .await
        .map_err(ProcessorError::CacheUnavailable)?;
    let source = HttpSource::new(settings.source.clone())?;

    let report = ingest(&source, &cache, client, settings, cancel).await?;

    println!(
        "Ingest: {} new tournaments, {} new games, {} excluded, {} issues{}{}",
        report.new_tournaments,
        report.new_games,
        report.excluded,
        report.errors.len(),
        if report.from_cache { " (normalized cache)" } else { "" },
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for issue in &report.errors {
        println!(
            "  [{}] tournament {:?} match {:?}: {}",
            issue.kind, issue.tournament_id, issue.match_id, issue.message
        );
    }

    Ok(report)
}

async fn run_recompute(
    client: &DbClient,
    as_of: Option<chrono::NaiveDate>,
    settings: &ReplaySettings
) -> Result<(), ProcessorError> {
    let report: RecomputeReport = recompute(client, as_of, settings).await?;

    println!(
        "Recompute: {} players rated, {} checkpoints, {} snapshots",
        report.players_rated, report.checkpoints_written, report.snapshots_written
    );
    for w in &report.convergence_warnings {
        println!(
            "  checkpoint {} hit the iteration cap ({} iterations, max delta {:.2e})",
            w.checkpoint, w.iterations, w.max_delta
        );
    }

    Ok(())
}
