// src/bin/gate_cli.rs

use futures::future::join_all;
use prettytable::{row, Table};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rate_gate::config::InMemoryConfig;
use rate_gate::storage::MemoryStore;
use rate_gate::{AdmissionController, GateConfig, Strategy, Verdict};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "gate_cli",
    about = "Simulate client traffic against the admission gate using an in-memory store"
)]
struct Opt {
    /// Admission strategy to simulate
    #[structopt(short, long, possible_values = &["atomic-script", "transactional-pipeline", "both"], default_value = "both")]
    strategy: String,

    /// Client identities taking part (comma separated)
    #[structopt(short, long, default_value = "203.0.113.1")]
    identities: String,

    /// Requests allowed per identity per window
    #[structopt(short, long, default_value = "10")]
    max_tokens: u64,

    /// Window duration in seconds
    #[structopt(short, long, default_value = "60")]
    window_seconds: u64,

    /// Simulation mode
    #[structopt(long, possible_values = &["burst", "steady", "interleaved"], default_value = "burst")]
    simulation: String,

    /// Number of requests per identity
    #[structopt(short = "n", long, default_value = "20")]
    num_requests: usize,

    /// Time between requests in milliseconds (steady and interleaved modes)
    #[structopt(short = "t", long, default_value = "100")]
    request_interval_ms: u64,

    /// Simulated store round-trip latency in milliseconds
    #[structopt(short, long, default_value = "0")]
    latency_ms: u64,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Disable logs
    #[structopt(long)]
    disable_logs: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    admitted: usize,
    denied: usize,
    errors: usize,
}

impl Tally {
    fn record(&mut self, verdict: &Verdict) {
        match verdict {
            Verdict::Admit => self.admitted += 1,
            Verdict::Deny => self.denied += 1,
            Verdict::Error(_) => self.errors += 1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let opt = Opt::from_args();

    let filter = if opt.disable_logs {
        "gate_cli=error,rate_gate=error".to_string()
    } else {
        let log_level = match opt.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        format!("gate_cli={},rate_gate={}", log_level, log_level)
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(filter))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let strategies = match opt.strategy.as_str() {
        "both" => vec![Strategy::AtomicScript, Strategy::TransactionalPipeline],
        other => vec![other.parse::<Strategy>()?],
    };
    let identities: Vec<String> = opt
        .identities
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if identities.is_empty() {
        return Err("at least one identity is required".into());
    }

    for strategy in strategies {
        // Fresh store per strategy so runs don't share buckets
        let store = MemoryStore::new(InMemoryConfig {
            max_entries: 10_000,
            use_background_task: true,
            cleanup_interval: Duration::from_secs(60),
            latency: (opt.latency_ms > 0).then(|| Duration::from_millis(opt.latency_ms)),
        });
        let config = GateConfig::new(opt.max_tokens, Duration::from_secs(opt.window_seconds))
            .with_strategy(strategy);
        let gate = AdmissionController::new(store.clone(), config).await?;

        info!(
            "Running {} simulation with {} strategy (max_tokens={}, window={}s)",
            opt.simulation, strategy, opt.max_tokens, opt.window_seconds
        );

        let start_time = Instant::now();
        let tallies = match opt.simulation.as_str() {
            "burst" => simulate_burst(&opt, &gate, &identities).await,
            "steady" => simulate_steady(&opt, &gate, &identities).await,
            "interleaved" => simulate_interleaved(&opt, &gate, &identities).await,
            other => return Err(format!("Unknown simulation mode: {}", other).into()),
        };

        print_summary(&opt, strategy, &gate, &store, &tallies, start_time.elapsed());
    }

    Ok(())
}

// Every identity's requests fire at once, as a client retry storm would
async fn simulate_burst(
    opt: &Opt,
    gate: &AdmissionController,
    identities: &[String],
) -> BTreeMap<String, Tally> {
    let requests = identities
        .iter()
        .flat_map(|id| std::iter::repeat(id).take(opt.num_requests))
        .map(|id| async move { (id.clone(), gate.admit_one(id).await) });

    let mut tallies = BTreeMap::new();
    for (identity, verdict) in join_all(requests).await {
        tallies
            .entry(identity)
            .or_insert_with(Tally::default)
            .record(&verdict);
    }
    tallies
}

// One identity after another, each at a fixed request rate
async fn simulate_steady(
    opt: &Opt,
    gate: &AdmissionController,
    identities: &[String],
) -> BTreeMap<String, Tally> {
    let interval = Duration::from_millis(opt.request_interval_ms);
    let mut tallies = BTreeMap::new();

    for identity in identities {
        let tally: &mut Tally = tallies.entry(identity.clone()).or_default();
        for i in 0..opt.num_requests {
            let request_time = Instant::now();
            let verdict = gate.admit_one(identity).await;
            log_verdict(opt, identity, i, &verdict);
            tally.record(&verdict);

            // Calculate how long to wait before next request
            let elapsed = request_time.elapsed();
            if elapsed < interval {
                time::sleep(interval - elapsed).await;
            }
        }
    }
    tallies
}

// Identities take turns, one request each per tick
async fn simulate_interleaved(
    opt: &Opt,
    gate: &AdmissionController,
    identities: &[String],
) -> BTreeMap<String, Tally> {
    let interval = Duration::from_millis(opt.request_interval_ms);
    let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();

    for i in 0..opt.num_requests {
        let tick = Instant::now();
        for identity in identities {
            let verdict = gate.admit_one(identity).await;
            log_verdict(opt, identity, i, &verdict);
            tallies.entry(identity.clone()).or_default().record(&verdict);
        }

        let elapsed = tick.elapsed();
        if elapsed < interval {
            time::sleep(interval - elapsed).await;
        }
    }
    tallies
}

fn log_verdict(opt: &Opt, identity: &str, i: usize, verdict: &Verdict) {
    if opt.disable_logs {
        return;
    }
    match verdict {
        Verdict::Admit => info!("{} request {}: ADMITTED", identity, i + 1),
        Verdict::Deny => warn!("{} request {}: DENIED", identity, i + 1),
        Verdict::Error(e) => warn!("{} request {}: ERROR ({})", identity, i + 1, e),
    }
}

fn print_summary(
    opt: &Opt,
    strategy: Strategy,
    gate: &AdmissionController,
    store: &MemoryStore,
    tallies: &BTreeMap<String, Tally>,
    elapsed: Duration,
) {
    println!("\n{} simulation, {} strategy ({:?})", opt.simulation, strategy, elapsed);

    let mut table = Table::new();
    table.add_row(row!["Identity", "Admitted", "Denied", "Errors", "Tokens left", "Window left"]);
    for (identity, tally) in tallies {
        let key = gate.bucket_key(identity);
        let tokens = store
            .tokens(&key)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        let ttl = store
            .ttl(&key)
            .map(|ttl| format!("{}s", ttl.as_secs()))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(row![identity, tally.admitted, tally.denied, tally.errors, tokens, ttl]);
    }
    table.printstd();

    let max = gate.config().max_tokens as usize;
    for (identity, tally) in tallies {
        if tally.admitted > max {
            println!(
                "{}: {} admitted, {} over quota (first-request race)",
                identity,
                tally.admitted,
                tally.admitted - max
            );
        }
    }
}
