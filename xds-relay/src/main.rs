mod config;

use clap::{Parser, Subcommand};
use config::{Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use orchestrator::{Orchestrator, RulesKeyer};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use shared::metrics_defs::describe_all;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use upstream::{UpstreamClient, UpstreamError};

const METRICS_PREFIX: &str = "xds_relay";

#[derive(thiserror::Error, Debug)]
enum RelayError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("aggregation rules: {0}")]
    Rules(#[from] orchestrator::rules::ValidationError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not install metrics exporter: {0}")]
    Metrics(String),
}

#[derive(Parser)]
#[command(name = "xds-relay", about = "Aggregating relay for discovery requests")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Connect upstream and serve until interrupted
    Run {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Parse and validate a config file, then exit
    Validate {
        #[arg(long, short)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Validate { config } => match Config::from_file(&config) {
            Ok(_) => {
                println!("{} is valid", config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {e}", config.display());
                ExitCode::FAILURE
            }
        },
        CliCommand::Run { config } => {
            let config = match Config::from_file(&config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{}: {e}", config.display());
                    return ExitCode::FAILURE;
                }
            };

            // Sentry must be initialized before the runtime starts its threads.
            let _sentry = init_observability(&config.logging);

            match start(config) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "xds-relay failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn start(config: Config) -> Result<(), RelayError> {
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}

fn init_observability(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), RelayError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| RelayError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| RelayError::Metrics(e.to_string()))?;

    describe_all(upstream::metrics_defs::ALL_METRICS);
    describe_all(orchestrator::metrics_defs::ALL_METRICS);

    Ok(())
}

async fn run(config: Config) -> Result<(), RelayError> {
    let token = CancellationToken::new();

    let client = UpstreamClient::connect(
        &config.upstream.address,
        config.upstream.call_options(),
        token.clone(),
    )
    .await?;
    let keyer = RulesKeyer::new(config.aggregation_rules)?;
    let orchestrator = Orchestrator::new(Arc::new(keyer), client);

    let admin = admin_service(orchestrator.clone());
    let admin_host = config.admin.host.clone();
    let admin_port = config.admin.port;
    let admin_token = token.clone();
    let mut admin_task = tokio::spawn(async move {
        run_http_service::<_, RelayError>(&admin_host, admin_port, admin, admin_token).await
    });

    tracing::info!(
        upstream = %config.upstream.address,
        admin_port,
        "xds-relay started"
    );

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            signal.map_err(RelayError::from)
        }
        served = &mut admin_task => match served {
            Ok(result) => result,
            Err(e) => Err(RelayError::Io(std::io::Error::other(e))),
        },
    };

    // Closes every upstream stream and, through them, every watch.
    token.cancel();
    if !admin_task.is_finished() {
        let _ = join_admin(admin_task).await;
    }
    tracing::info!(entries = orchestrator.keys().len(), "xds-relay stopped");

    result
}

/// Waits for the admin task after cancellation and reports how it ended.
async fn join_admin(task: JoinHandle<Result<(), RelayError>>) -> Result<(), RelayError> {
    let result = match task.await {
        Ok(result) => result,
        Err(e) => Err(RelayError::Io(std::io::Error::other(e))),
    };
    if let Err(e) = &result {
        tracing::warn!(error = %e, "admin service did not shut down cleanly");
    }
    result
}

fn admin_service(
    orchestrator: Orchestrator,
) -> AdminService<impl Fn() -> bool, impl Fn(Option<&str>) -> Option<String>, RelayError> {
    let ready = orchestrator.clone();
    AdminService::new(
        move || ready.is_live(),
        move |key: Option<&str>| cache_dump(&orchestrator, key),
    )
}

fn cache_dump(orchestrator: &Orchestrator, key: Option<&str>) -> Option<String> {
    let rendered = match key {
        None => serde_json::to_string(&orchestrator.snapshot()),
        Some(key) => serde_json::to_string(&orchestrator.entry_info(key)?),
    };

    rendered
        .inspect_err(|e| tracing::error!(error = %e, "could not render cache dump"))
        .ok()
}
