//! hashstore command-line interface
//!
//! Operates on a directory file + page file pair under a data directory.
//!
//! # Examples
//!
//! ```bash
//! # Store and fetch a value
//! hashstore put user:1 '{"name":"Ada"}'
//! hashstore get user:1
//!
//! # Inspect the store
//! hashstore stats --json
//! hashstore verify
//!
//! # Rebuild the directory file from page headers
//! hashstore rebuild
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use hashstore::storage::keyed::unframe;
use hashstore::storage::{HashFile, OpenOutcome};
use hashstore::StoreConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// hashstore - paged extendible-hashing record store
#[derive(Parser, Debug)]
#[command(name = "hashstore")]
#[command(version = hashstore::VERSION)]
#[command(about = "Paged extendible-hashing record store", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Data directory holding the store files
    #[arg(long, global = true, default_value = "data", env = "HASHSTORE_DATA")]
    data_dir: PathBuf,

    /// Store name; files are <name>.dir and <name>.pages
    #[arg(long, global = true, default_value = "store")]
    name: String,

    /// TOML configuration file (HASHSTORE_* variables override it)
    #[arg(long, global = true, env = "HASHSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Also write daily-rolling log files to this directory
    #[arg(long, global = true, env = "HASHSTORE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a value under a key, replacing any previous value
    Put {
        key: String,
        value: String,
    },

    /// Print the value stored under a key
    Get {
        key: String,
    },

    /// Delete a key
    Del {
        key: String,
    },

    /// Print every record
    Scan {
        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show store statistics
    Stats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check every page and the directory
    Verify,

    /// Rebuild the directory file from the page file
    Rebuild,

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = StoreConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let mut store = open_store(&cli.data_dir, &cli.name, &config)?;
    let result = run(&mut store, cli.command);
    let closed = store.close().context("closing store");
    result.and(closed)
}

/// Setup logging with console output and optional rolling files
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "hashstore.log");
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn open_store(data_dir: &Path, name: &str, config: &StoreConfig) -> anyhow::Result<HashFile> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let dir_path = data_dir.join(format!("{}.dir", name));
    let page_path = data_dir.join(format!("{}.pages", name));

    let (store, outcome) = HashFile::open_with_config(&dir_path, &page_path, config)
        .with_context(|| format!("opening store {}", page_path.display()))?;
    match outcome {
        OpenOutcome::Created => info!(path = %page_path.display(), "Created new store"),
        OpenOutcome::Opened => {}
        OpenOutcome::Recovered => warn!(path = %dir_path.display(), "Directory was rebuilt from the page file"),
    }
    Ok(store)
}

fn run(store: &mut HashFile, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Put { key, value } => {
            let replaced = store.put(key.as_bytes(), value.as_bytes())?;
            println!("{}", if replaced { "updated" } else { "inserted" });
        }
        Commands::Get { key } => match store.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => anyhow::bail!("key not found: {}", key),
        },
        Commands::Del { key } => {
            if !store.delete(key.as_bytes())? {
                anyhow::bail!("key not found: {}", key);
            }
            println!("deleted");
        }
        Commands::Scan { limit } => scan(store, limit.unwrap_or(usize::MAX))?,
        Commands::Stats { json } => {
            let stats = store.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("pages:            {}", stats.pages);
                println!("directory depth:  {}", stats.directory_depth);
                println!("cached pages:     {}/{}", stats.cached_pages, stats.cache_capacity);
                println!("page reads:       {}", stats.page_reads);
                println!("page writes:      {}", stats.page_writes);
                println!("directory writes: {}", stats.directory_writes);
            }
        }
        Commands::Verify => {
            let report = store.verify()?;
            println!(
                "ok: {} pages, {} records, {} live bytes, {} free bytes, depth {}",
                report.pages, report.records, report.live_bytes, report.free_bytes, report.directory_depth
            );
        }
        Commands::Rebuild => {
            store.rebuild_directory()?;
            println!("rebuilt directory: {} pages, depth {}", store.page_count(), store.directory_depth());
        }
        Commands::Config => {}
    }
    Ok(())
}

fn scan(store: &mut HashFile, limit: usize) -> anyhow::Result<()> {
    let mut shown = 0;
    let mut next = store.find_first_all()?;
    while let Some((cursor, record)) = next {
        if shown >= limit {
            break;
        }
        match unframe(&record) {
            Ok((key, value)) => println!(
                "{}\t{}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ),
            Err(_) => println!("{:#010x}\t<{} raw bytes>", cursor.hash(), record.len()),
        }
        shown += 1;
        next = store.find_next_all(&cursor)?;
    }
    Ok(())
}
