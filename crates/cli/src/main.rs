use crate::{
    error::CliError,
    output::StatusReport,
    shutdown::{ExitCode, ShutdownCoordinator},
};
use clap::Parser;
use commands::Commands;
use connectors::transport::http::HttpBulkTransport;
use engine_config::settings::{
    Settings,
    validated::{LeaseBackend, TargetSettings, ValidatedSettings},
    validator::SettingsValidator,
};
use engine_core::{
    clock::{Clock, SystemClock},
    lease::cluster::LeaseSchema,
    metrics::Metrics,
    progress::ProgressService,
};
use engine_processing::pipeline::ShardPipeline;
use engine_runtime::{
    coordinator::{CoordinatorConfig, LeaseCoordinator},
    setup::init_work_items,
    worker::{Worker, WorkerConfig, generate_worker_id},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod output;
mod shutdown;
mod wiring;

#[derive(Parser, Debug)]
#[command(
    name = "bulkshift",
    version,
    about = "Resumable, lease-coordinated bulk ingest of snapshot documents"
)]
struct Cli {
    #[arg(long, global = true, help = "Settings file path (TOML)")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "bulkshift failed");
            ExitCode::GeneralError.as_i32()
        }
    };

    std::process::exit(code);
}

fn load_settings(path: Option<&Path>) -> Result<ValidatedSettings, CliError> {
    let settings = Settings::load(path)?;
    Ok(SettingsValidator::new().validate(&settings)?)
}

async fn execute(cli: Cli) -> Result<i32, CliError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init => {
            let settings = load_settings(config)?;
            let source = wiring::build_source(&settings);
            let store = wiring::open_store(&settings, clock).await?;
            let report = init_work_items(source.as_ref(), store.as_ref(), &settings.indices).await?;
            output::print_json(&report)?;
            Ok(ExitCode::Success.as_i32())
        }
        Commands::Run { worker_id } => run(load_settings(config)?, clock, worker_id).await,
        Commands::Status { json } => {
            let settings = load_settings(config)?;
            let store = wiring::open_store(&settings, clock.clone()).await?;
            let service = ProgressService::new(store, clock);
            let report = StatusReport {
                summary: service.summary().await?,
                items: service.items().await?,
            };
            if json {
                output::print_json(&report)?;
            } else {
                output::print_status_table(&report);
            }
            Ok(ExitCode::Success.as_i32())
        }
        // An explicit url needs no settings file.
        Commands::Probe { url: Some(url), json } => {
            probe(&url, None, json).await?;
            Ok(ExitCode::Success.as_i32())
        }
        Commands::Probe { url: None, json } => {
            let settings = load_settings(config)?;
            let target = settings.target.as_ref().ok_or(CliError::MissingTarget)?;
            probe(&target.url, Some(target), json).await?;
            Ok(ExitCode::Success.as_i32())
        }
    }
}

async fn run(
    settings: ValidatedSettings,
    clock: Arc<dyn Clock>,
    worker_id: Option<String>,
) -> Result<i32, CliError> {
    let target = settings.target.as_ref().ok_or(CliError::MissingTarget)?;

    let shutdown = ShutdownCoordinator::new(CancellationToken::new());
    shutdown.register_handlers();

    let source = wiring::build_source(&settings);
    let store = wiring::open_store(&settings, clock.clone()).await?;

    // Nothing else can have seeded a process-local store.
    if settings.coordination.backend == LeaseBackend::Memory {
        init_work_items(source.as_ref(), store.as_ref(), &settings.indices).await?;
    }

    let client = wiring::cluster_client(&target.url, Some(target))?;
    let compress = wiring::target_accepts_compression(&client, target).await;
    let transport = Arc::new(HttpBulkTransport::new(client, compress));

    let metrics = Metrics::new();
    let pipeline = ShardPipeline::from_config(
        source,
        transport,
        wiring::failed_writer(&settings),
        metrics.clone(),
        settings.pipeline.clone(),
    );

    let coordination = &settings.coordination;
    let coordinator = LeaseCoordinator::new(
        store,
        clock,
        CoordinatorConfig {
            initial_lease: coordination.initial_lease,
            tolerable_clock_difference: coordination.tolerable_clock_difference,
            ..CoordinatorConfig::default()
        },
    );

    let worker_config = WorkerConfig {
        worker_id: worker_id.unwrap_or_else(generate_worker_id),
        renew_interval: coordination.renew_interval,
        min_time_for_batch: coordination.min_time_for_batch,
        release_on_exit: coordination.release_on_exit,
        index_prefix: target.index_prefix.clone(),
    };
    info!(worker_id = %worker_config.worker_id, snapshot = settings.snapshot(), "Starting worker");

    let worker = Worker::new(
        worker_config,
        coordinator,
        pipeline,
        metrics,
        shutdown.cancel_token(),
    );
    let report = worker.run().await?;
    output::print_json(&report)?;

    Ok(report.outcome.exit_code())
}

async fn probe(
    url: &str,
    target: Option<&TargetSettings>,
    as_json: bool,
) -> Result<(), CliError> {
    let client = wiring::cluster_client(url, target)?;
    let version = client.detect_version().await?;
    let schema = LeaseSchema::for_version(&version).ok();
    output::print_probe(client.base_url(), &version, schema, as_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["bulkshift", "run", "--config", "b.toml", "--worker-id", "w1"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("b.toml")));
        assert_eq!(
            cli.command,
            Commands::Run {
                worker_id: Some("w1".into())
            }
        );
    }

    #[test]
    fn status_defaults_to_table() {
        let cli = Cli::try_parse_from(["bulkshift", "status"]).unwrap();
        assert_eq!(cli.config, None);
        assert_eq!(cli.command, Commands::Status { json: false });
    }
}
