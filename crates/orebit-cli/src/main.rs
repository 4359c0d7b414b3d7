//! Orebit CLI
//!
//! Command-line interface for inspecting configurations and running the
//! economy engine locally.

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use orebit_core::{micros_to_coins, Algorithm, ManualClock, UserId, UserProgressionState};
use orebit_economics::constants::SYMBOL;
use orebit_engine::{EconomyEngine, EngineConfig, LoggingConfig, Scheduler, SchedulerEvent};
use orebit_storage::{FileCache, MemoryRemoteStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "orebit")]
#[command(author = "Orebit Contributors")]
#[command(version)]
#[command(about = "Orebit - progression and reward reconciliation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); defaults are used when absent
    #[arg(short, long, global = true, env = "OREBIT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a population of miners against an in-process store
    Simulate {
        #[arg(short, long, default_value = "50")]
        users: usize,

        #[arg(long, default_value = "48")]
        hours: u64,

        /// Simulation start (RFC 3339); defaults to now
        #[arg(long)]
        start: Option<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the scheduler for one user until Ctrl-C
    Run {
        #[arg(short, long, default_value = "local-miner")]
        user: String,

        /// Data directory for the local cache
        #[arg(short, long, default_value = "~/.orebit")]
        data_dir: PathBuf,
    },

    /// Validate a configuration file
    Validate,

    /// Print the level table
    Levels,

    /// Show the rate breakdown for a hypothetical miner
    Rate {
        #[arg(long, default_value = "0")]
        xp: u64,

        #[arg(short, long, default_value = "sha256")]
        algorithm: String,

        /// Evaluation time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Print the default configuration as TOML
    Defaults,
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_ansi(logging.color),
            )
            .init();
    }
}

fn expand_path(path: &Path) -> PathBuf {
    if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::from_file(expand_path(path))?),
        None => Ok(EngineConfig::default()),
    }
}

fn parse_time(value: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    match value {
        Some(s) => Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging);

    match cli.command {
        Commands::Simulate {
            users,
            hours,
            start,
            json,
        } => {
            let start = parse_time(start.as_deref())?;
            let summary = simulate(config, users, hours, start).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                summary.print();
            }
        }

        Commands::Run { user, data_dir } => {
            run(config, UserId::new(user), &expand_path(&data_dir)).await?;
        }

        Commands::Validate => {
            config.validate()?;
            println!("Configuration OK");
            println!("  levels:       {}", config.progression.levels.len());
            println!("  algorithms:   {}", config.algorithms.definitions().len());
            println!("  rules:        {}", config.rules.rules().len());
            println!("  metrics:      {}", config.metrics.len());
            println!("  competitions: {}", config.competitions.len());
            println!(
                "  events:       {} explicit, {} recurring",
                config.events.windows.len(),
                config.events.recurring.len()
            );
        }

        Commands::Levels => {
            println!("{:>5}  {:>9}  {:>10}  unlocks", "level", "xp", "multiplier");
            for def in &config.progression.levels {
                println!(
                    "{:>5}  {:>9}  {:>9.2}x  {}",
                    def.level,
                    def.threshold,
                    def.multiplier,
                    def.unlocks.join(", ")
                );
            }
        }

        Commands::Rate { xp, algorithm, at } => {
            let algorithm: Algorithm = algorithm.parse()?;
            let at = parse_time(at.as_deref())?;
            let engine = EconomyEngine::builder(config)
                .store(Arc::new(MemoryRemoteStore::new()))
                .build()?;

            let mut state = UserProgressionState::new(UserId::from("preview"));
            state.total_xp = xp;
            state.owned_algorithms.insert(algorithm);
            state.selected_algorithm = algorithm;
            let state = engine.progression().rederive(&state);

            let breakdown = engine
                .rates()
                .breakdown(&state, &engine.active_events(at), at);
            println!("level {} ({} xp), {}", state.level, xp, algorithm);
            println!("  base        {:.4}", breakdown.base);
            println!("  level       {:.2}x", breakdown.level_multiplier);
            println!("  algorithm   {:.2}x", breakdown.algorithm_multiplier);
            println!("  efficiency  {:.2}x", breakdown.efficiency);
            println!("  events      {:.2}x", breakdown.event_multiplier);
            println!("  jitter      {:.4}x", breakdown.jitter);
            println!(
                "  rate        {:.4} {SYMBOL}/day{}",
                breakdown.rate,
                if breakdown.clamped { " (clamped)" } else { "" }
            );
        }

        Commands::Defaults => {
            print!("{}", EngineConfig::default().to_toml_string()?);
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    users: usize,
    hours: u64,
    total_coins: f64,
    mean_coins: f64,
    total_xp: u64,
    levels: BTreeMap<u32, usize>,
    rules_applied: usize,
    milestones_completed: Vec<String>,
    sync_delays: usize,
}

impl SimulationSummary {
    fn print(&self) {
        println!("Simulated {} miners over {} hours", self.users, self.hours);
        println!("  mined:      {:.4} {SYMBOL} (mean {:.4})", self.total_coins, self.mean_coins);
        println!("  total xp:   {}", self.total_xp);
        println!("  rewards:    {}", self.rules_applied);
        println!("  milestones: {}", self.milestones_completed.join(", "));
        println!("  delays:     {}", self.sync_delays);
        println!("  levels:");
        for (level, count) in &self.levels {
            println!("    {level:>3}: {count}");
        }
    }
}

async fn simulate(
    config: EngineConfig,
    users: usize,
    hours: u64,
    start: DateTime<Utc>,
) -> anyhow::Result<SimulationSummary> {
    let store = Arc::new(MemoryRemoteStore::new());
    let clock = Arc::new(ManualClock::new(start));
    let engine = EconomyEngine::builder(config)
        .store(store)
        .clock(clock.clone())
        .build()?;

    let mut sessions = Vec::with_capacity(users);
    for i in 0..users {
        sessions.push(engine.session(UserId::new(format!("sim-{i:04}"))).await?);
    }

    let mut rules_applied = 0;
    let mut sync_delays = 0;
    let mut milestones = Vec::new();
    for hour in 0..hours {
        let now = clock.advance(Duration::hours(1));
        for (i, session) in sessions.iter().enumerate() {
            // every miner takes one hour off a week
            if (i as u64 + hour) % 168 == 0 {
                continue;
            }
            let report = session.accrue(now).await?;
            rules_applied += report.rules_applied.len();
            sync_delays += usize::from(report.sync_delayed);
        }
        let run = engine.run_aggregation(now).await?;
        milestones.extend(run.community.completed);
    }

    let mut summary = SimulationSummary {
        users,
        hours,
        total_coins: 0.0,
        mean_coins: 0.0,
        total_xp: 0,
        levels: BTreeMap::new(),
        rules_applied,
        milestones_completed: milestones,
        sync_delays,
    };
    for session in &sessions {
        let state = session.refresh().await?;
        summary.total_coins += micros_to_coins(state.balance);
        summary.total_xp += state.total_xp;
        *summary.levels.entry(state.level).or_default() += 1;
    }
    if users > 0 {
        summary.mean_coins = summary.total_coins / users as f64;
    }
    Ok(summary)
}

async fn run(config: EngineConfig, user: UserId, data_dir: &Path) -> anyhow::Result<()> {
    let cache_dir = data_dir.join("cache");
    std::fs::create_dir_all(&cache_dir)?;
    let cache = Arc::new(FileCache::open(&cache_dir, config.sync.cache_version)?);

    tracing::info!("Data: {:?}", data_dir);
    tracing::info!("Store: in-process (state is lost on exit, the cache is not)");

    let engine = EconomyEngine::builder(config)
        .store(Arc::new(MemoryRemoteStore::new()))
        .cache(cache)
        .build()?;

    let session = engine.session(user).await?;
    session.on_level_up(|event| {
        tracing::info!("Level up: {} -> {}", event.from, event.to);
    });
    session.on_reward_applied(|entry| {
        tracing::info!("Reward: {}", entry.key);
    });

    let scheduler = Arc::new(Scheduler::new(engine.clone()));
    scheduler.attach(session.clone());

    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SchedulerEvent::Accrued {
                    windows, credited, ..
                } => tracing::info!(
                    "Credited {} window(s): {:.6} {SYMBOL}",
                    windows,
                    micros_to_coins(credited)
                ),
                SchedulerEvent::SyncDelayed { user } => tracing::warn!("Sync delayed for {user}"),
                SchedulerEvent::TickFailed { tick, error } => {
                    tracing::warn!("{tick:?} tick failed: {error}")
                }
                _ => {}
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

    tracing::info!(
        "Mining at {:.4} {SYMBOL}/day; Ctrl-C to stop",
        session.current_rate(engine.now())
    );
    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(()).await;
    handle.await?;

    let state = session.reconcile(engine.now()).await?.state;
    if let Some(state) = state {
        println!(
            "level {}  xp {}  balance {:.6} {SYMBOL}",
            state.level,
            state.total_xp,
            micros_to_coins(state.balance)
        );
    }
    Ok(())
}
