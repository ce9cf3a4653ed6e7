use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::json;
use sollint_cache::{CacheOptions, CacheStorage, ResultCache};
use sollint_core::{ConfigManager, LoggingConfig};
use sollint_watch::{watch_mode, ChangeType, FileChangeEvent, WatchModeOptions};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sollint")]
#[command(about = "sollint - cached, incremental Solidity analysis runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Output format (json, pretty)
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// Configuration file (defaults to .sollint.toml, then ~/.sollint/config.toml)
    #[arg(short, long, global = true, env = "SOLLINT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Persisted result cache maintenance
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Watch files and print change batches until interrupted
    Watch {
        /// Files or directories to watch
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Use the polling backend instead of native notifications
        #[arg(long)]
        polling: bool,

        /// Print every change on its own instead of batching
        #[arg(long)]
        no_aggregate: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Target path
        #[arg(default_value = ".sollint.toml")]
        path: PathBuf,
    },

    /// Print the effective configuration
    Show,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show persisted cache statistics
    Stats,

    /// Drop expired entries from the persisted cache
    Clean,

    /// Delete the persisted cache
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match execute_command(&cli).await {
        Ok(Some(output)) => {
            print_output(&cli.output, &output)?;
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<Option<serde_json::Value>> {
    // Writing a fresh config must not depend on the current one parsing
    if let Commands::Config(ConfigCommands::Init { path }) = &cli.command {
        ConfigManager::create_default_config(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        return Ok(Some(json!({ "created": path })));
    }

    let manager =
        ConfigManager::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&manager.config().logging, cli.verbose);
    manager.log_source();

    match &cli.command {
        Commands::Config(ConfigCommands::Init { .. }) => Ok(None),
        Commands::Config(ConfigCommands::Show) => Ok(Some(json!({
            "source": manager.config_path(),
            "config": serde_json::to_value(manager.config())?,
        }))),
        Commands::Cache(cmd) => execute_cache_command(cmd, &manager).await.map(Some),
        Commands::Watch {
            paths,
            polling,
            no_aggregate,
        } => {
            execute_watch(cli, &manager, paths.clone(), *polling, !*no_aggregate).await?;
            Ok(None)
        }
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output stays machine readable
    match logging.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        "compact" => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

async fn execute_cache_command(
    cmd: &CacheCommands,
    manager: &ConfigManager,
) -> Result<serde_json::Value> {
    let options = CacheOptions {
        use_file_system: true,
        ..CacheOptions::from(&manager.config().cache)
    };
    let directory = options.cache_directory.clone();
    let mut cache: ResultCache<serde_json::Value> = ResultCache::new(options);

    match cmd {
        CacheCommands::Stats => {
            let restored = cache.load().await.context("Failed to read cache")?;
            let metadata = CacheStorage::new(&directory).read_metadata().await;
            Ok(json!({
                "directory": directory,
                "entries": restored,
                "stored_entries": metadata.as_ref().map(|m| m.entry_count),
                "saved_at": metadata.as_ref().and_then(|m| {
                    chrono::DateTime::from_timestamp_millis(m.saved_at as i64)
                }),
                "stats": serde_json::to_value(cache.stats())?,
            }))
        }
        CacheCommands::Clean => {
            let stored = CacheStorage::new(&directory)
                .read_metadata()
                .await
                .map(|m| m.entry_count);
            let restored = cache.load().await.context("Failed to read cache")?;
            let removed = cache.cleanup() + stored.map_or(0, |s| s.saturating_sub(restored));
            if stored.is_some() {
                cache.save().await.context("Failed to write cache")?;
            }
            info!(removed, remaining = cache.len(), "Cache cleaned");
            Ok(json!({
                "directory": directory,
                "removed": removed,
                "remaining": cache.len(),
            }))
        }
        CacheCommands::Clear => {
            cache.delete_cache().await.context("Failed to delete cache")?;
            Ok(json!({ "directory": directory, "cleared": true }))
        }
    }
}

async fn execute_watch(
    cli: &Cli,
    manager: &ConfigManager,
    paths: Vec<PathBuf>,
    polling: bool,
    aggregate: bool,
) -> Result<()> {
    let (batches_tx, mut batches) = mpsc::unbounded_channel::<Vec<FileChangeEvent>>();

    let mut options = WatchModeOptions::new(
        paths,
        Box::new(move |batch| {
            let _ = batches_tx.send(batch);
        }),
    )
    .with_config(&manager.config().watch);
    options.watcher.use_polling |= polling;
    options.aggregate_changes &= aggregate;

    let pretty = matches!(cli.output, OutputFormat::Pretty);
    if pretty {
        options = options.on_ready(Box::new(|files| {
            println!(
                "{} {} files, press Ctrl-C to stop",
                "Watching".cyan().bold(),
                files.to_string().yellow()
            );
        }));
    }

    let session = watch_mode(options)
        .await
        .context("Failed to start watcher")?;

    loop {
        tokio::select! {
            batch = batches.recv() => match batch {
                Some(batch) => print_batch(&cli.output, &batch)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let stats = session.stats();
    session.close().await;
    if pretty {
        println!(
            "{} {} changes detected",
            "Stopped.".cyan().bold(),
            stats.changes_detected.to_string().yellow()
        );
    }
    Ok(())
}

fn print_batch(format: &OutputFormat, batch: &[FileChangeEvent]) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(batch)?);
        }
        OutputFormat::Pretty => {
            for change in batch {
                let kind = match change.change_type {
                    ChangeType::Add => "add".green(),
                    ChangeType::Change => "change".yellow(),
                    ChangeType::Remove => "remove".red(),
                };
                println!(
                    "{} {:>6} {}",
                    change.timestamp.format("%H:%M:%S").to_string().dimmed(),
                    kind,
                    change.file_path.display()
                );
            }
        }
    }
    Ok(())
}

fn print_output(format: &OutputFormat, value: &serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Pretty => {
            print_pretty(value, 0)?;
        }
    }
    Ok(())
}

fn print_pretty(value: &serde_json::Value, depth: usize) -> Result<()> {
    let indent = "  ".repeat(depth);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let key_colored = key.cyan().bold();
                match val {
                    serde_json::Value::String(s) => {
                        println!("{}{}: {}", indent, key_colored, s.green());
                    }
                    serde_json::Value::Number(n) => {
                        println!("{}{}: {}", indent, key_colored, n.to_string().yellow());
                    }
                    serde_json::Value::Bool(b) => {
                        let val_colored = if *b {
                            "true".green()
                        } else {
                            "false".red()
                        };
                        println!("{}{}: {}", indent, key_colored, val_colored);
                    }
                    serde_json::Value::Null => {
                        println!("{}{}: {}", indent, key_colored, "none".dimmed());
                    }
                    serde_json::Value::Object(_) => {
                        println!("{}{}:", indent, key_colored);
                        print_pretty(val, depth + 1)?;
                    }
                    serde_json::Value::Array(_) => {
                        println!("{}{}: {}", indent, key_colored, val);
                    }
                }
            }
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn watch_requires_paths() {
        assert!(Cli::try_parse_from(["sollint", "watch"]).is_err());
        let cli = Cli::try_parse_from(["sollint", "--output", "json", "watch", "src", "--polling"])
            .unwrap();
        match cli.command {
            Commands::Watch { paths, polling, .. } => {
                assert_eq!(paths, vec![PathBuf::from("src")]);
                assert!(polling);
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn config_init_defaults_to_project_file() {
        let cli = Cli::try_parse_from(["sollint", "config", "init"]).unwrap();
        match cli.command {
            Commands::Config(ConfigCommands::Init { path }) => {
                assert_eq!(path, PathBuf::from(".sollint.toml"))
            }
            _ => panic!("expected config init"),
        }
    }
}
