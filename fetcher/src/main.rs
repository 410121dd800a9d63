mod analytics;
mod client;
mod config;
mod error;
mod metrics_server;
mod ratelimit;
mod scheduler;
mod service;
mod worker;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Settings;
use error::FetchError;
use service::FetcherService;

#[derive(Debug, Parser)]
#[command(name = "fetcher", version = weather_core::VERSION, about = "Weather telemetry fetch pipeline")]
struct Args {
    /// Selects `config/{environment}.toml` if present.
    #[arg(long, env = "APP_ENVIRONMENT", default_value = "production")]
    environment: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs);

    let settings = Settings::load(&args.environment)?;
    let problems = settings.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!(problem, "invalid configuration");
        }
        anyhow::bail!("configuration validation failed");
    }

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| FetchError::Startup(err.to_string()))?;

    let service = FetcherService::new(settings, prometheus).await?;
    let shutdown = CancellationToken::new();
    tokio::spawn(setup_shutdown_handler(shutdown.clone()));

    service.run(shutdown).await?;
    info!("fetcher exited");

    Ok(())
}

fn init_logging(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn setup_shutdown_handler(token: CancellationToken) {
    let ctrl_c = async {
        #[allow(clippy::expect_used)]
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl_c");
    };

    #[cfg(unix)]
    let terminate = async {
        #[allow(clippy::expect_used)]
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
    token.cancel();
}
