use anyhow::{bail, Context, Result};
use boundq_core::{init_tracing, BoundqConfig, ConfigManager};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

mod scenarios;

#[derive(Parser)]
#[command(name = "boundq")]
#[command(about = "boundq - bounded MPMC queue demos and throughput runs", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./.boundq.toml, then ~/.boundq/config.toml)
    #[arg(long, global = true, env = "BOUNDQ_CONFIG")]
    config: Option<PathBuf>,

    /// Queue capacity, overrides the config file
    #[arg(long, global = true)]
    capacity: Option<usize>,

    /// Log format, overrides the config file
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fill and drain the queue from a single thread while another closes it
    Single,

    /// Producers push their ids, consumers pop until the queue is closed
    Threads {
        #[arg(short, long)]
        producers: Option<usize>,

        #[arg(short, long)]
        consumers: Option<usize>,

        /// Elements pushed by each producer
        #[arg(short, long, default_value_t = 15)]
        items: usize,

        /// Use bounded pushes with the configured timeout
        #[arg(long)]
        timed: bool,
    },

    /// Pass shared Person payloads between two producers and two consumers
    Persons {
        /// Elements pushed by each producer
        #[arg(short, long, default_value_t = 15)]
        items: usize,
    },

    /// Block producers on a full queue, close it and report what was handed back
    Shutdown {
        /// Number of producers to block
        #[arg(short, long, default_value_t = 4)]
        blocked: usize,
    },

    /// Time the producer/consumer workload
    Throughput {
        #[arg(short, long)]
        producers: Option<usize>,

        #[arg(short, long)]
        consumers: Option<usize>,

        /// Elements pushed by each producer
        #[arg(short, long)]
        items: Option<usize>,
    },

    /// Write a default config file
    InitConfig {
        /// Target path (defaults to ~/.boundq/config.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

/// Resolve the effective configuration; the manager is kept so its
/// diagnostics can be logged once tracing is up.
fn load_config(cli: &Cli) -> Result<(ConfigManager, BoundqConfig)> {
    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from(path),
        None => ConfigManager::load(),
    }
    .context("Failed to load configuration")?;

    let mut config = manager.config().clone();
    if let Some(capacity) = cli.capacity {
        config.queue.capacity = capacity;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format.as_str().to_string();
    }
    ConfigManager::validate_config(&config).context("Invalid command line overrides")?;
    Ok((manager, config))
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if let Commands::InitConfig { path, force } = &cli.command {
        return init_config(path.clone(), *force);
    }

    let (manager, config) = load_config(cli)?;
    init_tracing(&config.logging, cli.verbose).context("Failed to initialize logging")?;
    manager.log_summary();

    execute_command(cli, &config)
}

fn execute_command(cli: &Cli, config: &BoundqConfig) -> Result<()> {
    let capacity = config.queue.capacity;
    let workload = &config.workload;

    match &cli.command {
        Commands::Single => {
            header("single-thread push/pop");
            let close_after = Duration::from_millis(workload.close_after_ms);
            let popped = scenarios::single(capacity, close_after)?;
            info!(popped = popped.len(), "single-thread run finished");
        }
        Commands::Threads {
            producers,
            consumers,
            items,
            timed,
        } => {
            header("multi-threaded producers and consumers");
            let timeout = timed.then(|| Duration::from_millis(workload.push_timeout_ms));
            let counts = scenarios::threads(
                capacity,
                producers.unwrap_or(workload.producers),
                consumers.unwrap_or(workload.consumers),
                *items,
                timeout,
            )?;
            info!(consumed = counts.iter().sum::<usize>(), "threads run finished");
        }
        Commands::Persons { items } => {
            header("persons");
            let consumed = scenarios::persons(capacity, *items)?;
            info!(consumed, "persons run finished");
        }
        Commands::Shutdown { blocked } => {
            header("close and drain");
            let report = scenarios::shutdown(*blocked, Duration::from_millis(50))?;
            report.verify(*blocked)?;
        }
        Commands::Throughput {
            producers,
            consumers,
            items,
        } => {
            let producers = producers.unwrap_or(workload.producers);
            let consumers = consumers.unwrap_or(workload.consumers);
            let items = items.unwrap_or(workload.items_per_producer);
            header("throughput");
            let report = scenarios::throughput(capacity, producers, consumers, items)?;
            println!(
                "{} producers, {} consumers, capacity {}: {} items in {:.2?} ({} items/s)",
                producers,
                consumers,
                capacity,
                report.items,
                report.elapsed,
                format!("{:.0}", report.items_per_sec()).green().bold()
            );
        }
        Commands::InitConfig { .. } => unreachable!("handled before configuration is loaded"),
    }
    Ok(())
}

fn header(title: &str) {
    println!("{}", format!("== {} ==", title).cyan().bold());
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => ConfigManager::user_config_path().context("Could not determine home directory")?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    ConfigManager::create_default_config(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{} {}", "Wrote".green(), path.display());
    Ok(())
}
