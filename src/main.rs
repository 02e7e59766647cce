use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use rate_gate::config::{RedisConfig, Settings, DEFAULT_SECRETS_FILE};
use rate_gate::logging::{self, LogFormat};
use rate_gate::routes::routes;
use rate_gate::storage::RedisStore;
use rate_gate::{AdmissionController, FailurePolicy, GateError, Strategy};

#[derive(Debug, StructOpt)]
#[structopt(name = "rate_gate", about = "HTTP API behind a per-client Redis rate limit")]
struct Opt {
    /// JSON settings file; flags below override what it sets
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Address to listen on
    #[structopt(short, long)]
    addr: Option<String>,

    /// Requests allowed per client per window
    #[structopt(short, long)]
    max_tokens: Option<u64>,

    /// Window duration in seconds
    #[structopt(short, long)]
    window_seconds: Option<u64>,

    /// Admission strategy: atomic-script or transactional-pipeline
    #[structopt(short, long)]
    strategy: Option<Strategy>,

    /// Behaviour when Redis is unreachable: fail-closed or fail-open
    #[structopt(long)]
    failure_policy: Option<FailurePolicy>,

    /// Redis secrets file (REDIS_CONN_ADDRESS=...;REDIS_PASSWORD=...), defaults to /run/secrets/redisSecrets
    #[structopt(long, parse(from_os_str))]
    secrets_file: Option<PathBuf>,

    /// Log output: pretty or json
    #[structopt(long, default_value = "pretty")]
    log_format: LogFormat,
}

fn load_settings(opt: &Opt) -> Result<Settings, GateError> {
    let mut settings = match &opt.config {
        Some(path) => Settings::from_json_file(path)?,
        None => Settings {
            server: Default::default(),
            gate: Default::default(),
            redis: RedisConfig::from_env_or_secrets(
                opt.secrets_file
                    .as_deref()
                    .unwrap_or(Path::new(DEFAULT_SECRETS_FILE)),
            )?,
        },
    };

    if let Some(addr) = &opt.addr {
        settings.server.addr = addr.clone();
    }
    if let Some(max_tokens) = opt.max_tokens {
        settings.gate.max_tokens = max_tokens;
    }
    if let Some(window_seconds) = opt.window_seconds {
        settings.gate.window = Duration::from_secs(window_seconds);
    }
    if let Some(strategy) = opt.strategy {
        settings.gate.strategy = strategy;
    }
    if let Some(policy) = opt.failure_policy {
        settings.gate.failure_policy = policy;
    }

    settings.validate()?;
    Ok(settings)
}

async fn run(opt: Opt) -> Result<(), GateError> {
    let settings = load_settings(&opt)?;

    let store = RedisStore::connect(settings.redis.clone()).await?;
    info!(url = %settings.redis.url, "Connected to Redis");

    let gate = AdmissionController::new(store, settings.gate.clone()).await?;
    if gate.config().failure_policy == FailurePolicy::FailOpen {
        warn!("Fail-open policy: requests pass unchecked while Redis is down");
    }

    let listener = TcpListener::bind(&settings.server.addr)
        .await
        .map_err(|e| GateError::Config(format!("cannot bind {}: {}", settings.server.addr, e)))?;
    info!(addr = %settings.server.addr, "Listening");

    axum::serve(
        listener,
        routes(gate).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GateError::Internal(format!("server error: {}", e)))?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let opt = Opt::from_args();
    logging::init_with(opt.log_format);
    info!("Rate gate starting up");

    if let Err(e) = run(opt).await {
        error!(error = %e, "Startup failed");
        return Err(e.into());
    }
    Ok(())
}
