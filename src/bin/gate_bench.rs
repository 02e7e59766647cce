// src/bin/gate_bench.rs

use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::sync::{Barrier, Semaphore};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use rate_gate::config::{InMemoryConfig, RedisConfig};
use rate_gate::storage::{MemoryStore, RedisStore};
use rate_gate::{AdmissionController, GateConfig, Strategy, Verdict};

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "gate_bench",
    about = "Concurrency benchmark for the admission strategies"
)]
struct Opt {
    /// Strategy to benchmark
    #[structopt(short, long, possible_values = &["atomic-script", "transactional-pipeline", "all"], default_value = "all")]
    strategy: String,

    /// Storage backend to use
    #[structopt(short = "b", long, possible_values = &["memory", "redis"], default_value = "memory")]
    backend: String,

    /// Redis URL (when using the Redis backend)
    #[structopt(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Redis connection pool size
    #[structopt(long, default_value = "20")]
    pool_size: usize,

    /// Simulated round-trip latency for the memory backend, in milliseconds
    #[structopt(short, long, default_value = "1")]
    latency_ms: u64,

    /// Requests allowed per identity per window
    #[structopt(short, long, default_value = "10")]
    max_tokens: u64,

    /// Window duration in seconds
    #[structopt(short, long, default_value = "60")]
    window_seconds: u64,

    /// Number of distinct client identities
    #[structopt(short = "u", long, default_value = "10")]
    num_users: usize,

    /// Simultaneous first-time requests per identity
    #[structopt(short = "r", long, default_value = "50")]
    requests_per_user: usize,

    /// Number of iterations to run
    #[structopt(short, long, default_value = "3")]
    iterations: usize,

    /// Maximum number of in-flight checks
    #[structopt(short = "c", long, default_value = "100")]
    concurrency: usize,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Disable logs
    #[structopt(long)]
    disable_logs: bool,
}

#[derive(Debug, Default)]
struct IterationResult {
    admitted: usize,
    denied: usize,
    errors: usize,
    // Identities admitted beyond max_tokens, with the excess
    over_quota: Vec<(String, usize)>,
    elapsed: Duration,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let opt = Opt::from_args();

    let filter = if opt.disable_logs {
        "gate_bench=error,rate_gate=error".to_string()
    } else {
        let log_level = match opt.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        };
        format!("gate_bench={},rate_gate={}", log_level, log_level)
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(filter))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Ctrl-C stops after the current iteration
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::SeqCst);
    })?;

    let strategies = if opt.strategy == "all" {
        vec![Strategy::AtomicScript, Strategy::TransactionalPipeline]
    } else {
        vec![opt.strategy.parse::<Strategy>()?]
    };

    for strategy in strategies {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let gate = build_gate(&opt, strategy).await?;
        run_benchmark(&gate, &opt, &stop).await?;
    }

    Ok(())
}

async fn build_gate(
    opt: &Opt,
    strategy: Strategy,
) -> Result<AdmissionController, Box<dyn std::error::Error>> {
    let config = GateConfig::new(opt.max_tokens, Duration::from_secs(opt.window_seconds))
        .with_strategy(strategy);

    let gate = match opt.backend.as_str() {
        "memory" => {
            let store = MemoryStore::new(InMemoryConfig {
                max_entries: 1_000_000, // Every iteration uses fresh identities
                use_background_task: true,
                cleanup_interval: Duration::from_secs(60),
                latency: (opt.latency_ms > 0).then(|| Duration::from_millis(opt.latency_ms)),
            });
            AdmissionController::new(store, config).await?
        }
        "redis" => {
            let mut redis_config = RedisConfig::new(opt.redis_url.clone());
            redis_config.pool_size = opt.pool_size;
            redis_config.min_idle = opt.pool_size.min(4);
            redis_config.connection_timeout = Duration::from_secs(5);

            let store = match RedisStore::connect(redis_config).await {
                Ok(store) => store,
                Err(e) => {
                    error!("Failed to connect to Redis: {}", e);
                    return Err(format!("Failed to connect to Redis: {}", e).into());
                }
            };
            AdmissionController::new(store, config).await?
        }
        other => return Err(format!("Unknown storage backend: {}", other).into()),
    };

    Ok(gate)
}

async fn run_benchmark(
    gate: &AdmissionController,
    opt: &Opt,
    stop: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = format!("{} ({})", gate.strategy(), opt.backend);
    println!("\nRunning benchmark: {}", name);
    println!("{}", "=".repeat(name.len() + 19));

    let mut results = Vec::with_capacity(opt.iterations);
    for iteration in 0..opt.iterations {
        if stop.load(Ordering::SeqCst) {
            warn!("Interrupted, skipping remaining iterations");
            break;
        }
        info!("Starting iteration {} of {}", iteration + 1, opt.iterations);

        let result = run_iteration(gate, opt).await?;
        let total = result.admitted + result.denied + result.errors;
        println!(
            "Iteration {}: {:?}, {} admitted, {} denied, {} errors, {:.2} req/sec",
            iteration + 1,
            result.elapsed,
            result.admitted,
            result.denied,
            result.errors,
            total as f64 / result.elapsed.as_secs_f64()
        );
        results.push(result);
    }

    if results.is_empty() {
        return Ok(());
    }

    report(gate, opt, &name, &results);
    Ok(())
}

// One burst: every identity is new, and all its requests are released at once
async fn run_iteration(
    gate: &AdmissionController,
    opt: &Opt,
) -> Result<IterationResult, Box<dyn std::error::Error>> {
    let run_id = Uuid::new_v4();
    let mut identities: Vec<String> = (0..opt.num_users)
        .flat_map(|user| {
            std::iter::repeat(format!("bench-{}-user-{}", run_id, user)).take(opt.requests_per_user)
        })
        .collect();
    identities.shuffle(&mut rand::rng());

    let total = identities.len();
    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} checks")?
            .progress_chars("#>-"),
    );

    let barrier = Arc::new(Barrier::new(total));
    let semaphore = Arc::new(Semaphore::new(opt.concurrency.max(1)));
    let start_time = Instant::now();

    let mut handles = Vec::with_capacity(total);
    for identity in identities {
        let gate = gate.clone();
        let barrier = barrier.clone();
        let semaphore = semaphore.clone();
        let progress = progress.clone();

        handles.push(tokio::spawn(async move {
            // Wait for all tasks to be ready
            barrier.wait().await;
            let verdict = match semaphore.acquire().await {
                Ok(_permit) => gate.admit_one(&identity).await,
                Err(e) => Verdict::Error(e.to_string()),
            };
            progress.inc(1);
            (identity, verdict)
        }));
    }

    let mut result = IterationResult::default();
    let mut admitted_per_identity: HashMap<String, usize> = HashMap::new();
    for handle in futures::future::join_all(handles).await {
        let (identity, verdict) = handle?;
        match verdict {
            Verdict::Admit => {
                result.admitted += 1;
                *admitted_per_identity.entry(identity).or_default() += 1;
            }
            Verdict::Deny => result.denied += 1,
            Verdict::Error(e) => {
                result.errors += 1;
                warn!("Error in admission check: {}", e);
            }
        }
    }
    result.elapsed = start_time.elapsed();
    progress.finish_and_clear();

    let max = gate.config().max_tokens as usize;
    result.over_quota = admitted_per_identity
        .into_iter()
        .filter(|(_, admitted)| *admitted > max)
        .map(|(identity, admitted)| (identity, admitted - max))
        .collect();

    Ok(result)
}

fn report(gate: &AdmissionController, opt: &Opt, name: &str, results: &[IterationResult]) {
    let total_duration: Duration = results.iter().map(|r| r.elapsed).sum();
    let admitted: usize = results.iter().map(|r| r.admitted).sum();
    let denied: usize = results.iter().map(|r| r.denied).sum();
    let errors: usize = results.iter().map(|r| r.errors).sum();
    let total_requests = admitted + denied + errors;

    // min(max_tokens, attempts) per identity is the exact answer
    let expected_per_identity = (gate.config().max_tokens as usize).min(opt.requests_per_user);
    let expected = expected_per_identity * opt.num_users * results.len();
    let worst_case = match gate.strategy() {
        Strategy::AtomicScript => expected,
        Strategy::TransactionalPipeline => {
            (gate.config().max_tokens as usize + opt.requests_per_user.saturating_sub(1))
                .min(opt.requests_per_user)
                * opt.num_users
                * results.len()
        }
    };
    let over_quota: usize = results
        .iter()
        .flat_map(|r| r.over_quota.iter())
        .map(|(_, excess)| excess)
        .sum();
    let identities_over: usize = results.iter().map(|r| r.over_quota.len()).sum();

    println!("\nBenchmark Results for {}:", name);
    println!("  Total Requests:     {}", total_requests);
    println!(
        "  Admitted:           {} (exact quota {}, worst case {})",
        admitted, expected, worst_case
    );
    println!("  Denied:             {}", denied);
    println!("  Errors:             {}", errors);
    println!(
        "  Over quota:         {} extra admissions across {} identities",
        over_quota, identities_over
    );
    println!(
        "  Avg. Duration:      {:?}",
        total_duration / results.len() as u32
    );
    println!(
        "  Avg. Throughput:    {:.2} requests/second",
        total_requests as f64 / total_duration.as_secs_f64()
    );

    if admitted > worst_case {
        error!(admitted, worst_case, "Admissions exceeded the strategy's bound");
    }
}
