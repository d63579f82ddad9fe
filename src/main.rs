//! Engram - tiered memory engine
//!
//! CLI entry point with global panic handler.

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use engram::cli::{self, DEFAULT_CI};
use engram::config::{engram_home, Config};
use engram::engine::MemoryEngine;
use engram::error::exit_codes;

// =============================================================================
// CLI Definition
// =============================================================================

/// How state carries between invocations, shown in `--help`.
const STATE_HELP: &str = "\
State between runs:
  By default the cache lives only for one invocation and the single backend is
  in-memory, so `engram get <key>` in a new process will not find a key stored
  by an earlier `engram store`. To keep memories across runs, set
  `persist_cache = true` under [cache] and/or add a file backend under
  [[encoder.backends]] (kind = \"file\") in .engram/config.toml or
  ~/.engram/config.toml. `engram config` shows the effective settings.";

/// Engram - store everywhere, synthesize on recall
#[derive(Parser)]
#[command(name = "engram")]
#[command(author, version, about, long_about = None)]
#[command(after_help = STATE_HELP)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cache a memory, optionally replicating it to every backend
    #[command(after_help = STATE_HELP)]
    Store {
        /// Content to store
        content: String,
        /// Content type tag
        #[arg(long = "type", short = 't', default_value = "thought")]
        content_type: String,
        /// Storing CI identifier
        #[arg(long, default_value = DEFAULT_CI)]
        ci: String,
        /// Metadata as key=value (repeatable)
        #[arg(long = "meta", short = 'm')]
        meta: Vec<String>,
        /// Also write to every backend
        #[arg(long, short)]
        everywhere: bool,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Look up a key in the cache, recalling from backends on a miss
    #[command(after_help = STATE_HELP)]
    Get {
        /// Key to look up
        key: String,
        /// Retrieving CI identifier
        #[arg(long, default_value = DEFAULT_CI)]
        ci: String,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Find memories by content, in the cache and then the backends
    Search {
        /// Text to look for (case-insensitive)
        query: String,
        /// Maximum number of results
        #[arg(long, short = 'n', default_value_t = cli::search::DEFAULT_LIMIT)]
        limit: usize,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Recall a key from every backend and synthesize the answer
    Recall {
        /// Key to recall
        key: String,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Show cache usage patterns and promotion state
    Analyze {
        /// Include engine and backend counters
        #[arg(long, short)]
        detailed: bool,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Show registered backends with health
    Backends {
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Show the effective configuration
    Config {
        /// Save it to .engram/config.toml in the current directory
        #[arg(long, short)]
        save: bool,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> ExitCode {
    setup_panic_handler();
    init_tracing();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("engram error: failed to start runtime: {}", e);
            return ExitCode::from(exit_codes::ERROR as u8);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("engram error: {}", e);
            ExitCode::from(exit_codes::ERROR as u8)
        }
    }
}

/// Log to stderr, filtered by `ENGRAM_LOG` (default `warn`).
fn init_tracing() {
    let filter = EnvFilter::try_from_env("ENGRAM_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Set up the global panic handler.
///
/// On panic, logs to ~/.engram/crash.log and exits with the error code.
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("engram panic: {}", info);

        if let Some(home) = engram_home() {
            let crash_log = home.join("crash.log");
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&crash_log)
            {
                let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
                let _ = writeln!(file, "[{}] {}", timestamp, info);
            }
        }

        std::process::exit(exit_codes::ERROR);
    }));
}

/// Run the CLI and return the exit code.
async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cwd = std::env::current_dir()?;
    let config = Config::load_from_cwd(&cwd);

    if let Commands::Config { save, json, quiet } = cli.command {
        return run_config(save, json, quiet, &cwd, config);
    }

    let engine = Arc::new(MemoryEngine::new(&config)?);

    let code = match cli.command {
        Commands::Store {
            content,
            content_type,
            ci,
            meta,
            everywhere,
            json,
            quiet,
        } => {
            let options = cli::store::StoreOptions {
                json,
                quiet,
                content_type,
                ci,
                everywhere,
            };
            run_store(&engine, &content, &meta, &options).await?
        }
        Commands::Get {
            key,
            ci,
            json,
            quiet,
        } => run_get(&engine, &key, ci, json, quiet).await,
        Commands::Search {
            query,
            limit,
            json,
            quiet,
        } => run_search(&engine, &query, limit, json, quiet).await,
        Commands::Recall { key, json, quiet } => run_recall(&engine, &key, json, quiet).await,
        Commands::Analyze {
            detailed,
            json,
            quiet,
        } => run_analyze(&engine, detailed, json, quiet),
        Commands::Backends { json, quiet } => run_backends(&engine, config, json, quiet).await,
        Commands::Config { .. } => ExitCode::from(exit_codes::SUCCESS as u8),
    };

    engine.flush_promotions().await;
    engine.shutdown()?;
    Ok(code)
}

// =============================================================================
// Command Implementations
// =============================================================================

fn print_formatted(formatted: &str) {
    if !formatted.is_empty() {
        print!("{}", formatted);
    }
}

fn found_to_exit_code(found: bool) -> ExitCode {
    if found {
        ExitCode::from(exit_codes::SUCCESS as u8)
    } else {
        ExitCode::from(exit_codes::NOT_FOUND as u8)
    }
}

async fn run_store(
    engine: &Arc<MemoryEngine>,
    content: &str,
    meta: &[String],
    options: &cli::store::StoreOptions,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let metadata = cli::parse_metadata(meta)?;
    let cmd = cli::StoreCommand::new(Arc::clone(engine));

    let output = cmd.run(content, metadata, options).await;
    print_formatted(&cmd.format_output(&output, options));

    Ok(ExitCode::from(exit_codes::SUCCESS as u8))
}

async fn run_get(
    engine: &Arc<MemoryEngine>,
    key: &str,
    ci: String,
    json: bool,
    quiet: bool,
) -> ExitCode {
    use engram::cli::get::GetOptions;

    let cmd = cli::GetCommand::new(Arc::clone(engine));
    let options = GetOptions { json, quiet, ci };

    let output = cmd.run(key, &options).await;
    print_formatted(&cmd.format_output(&output, &options));

    found_to_exit_code(output.found)
}

async fn run_search(
    engine: &Arc<MemoryEngine>,
    query: &str,
    limit: usize,
    json: bool,
    quiet: bool,
) -> ExitCode {
    use engram::cli::search::SearchOptions;

    let cmd = cli::SearchCommand::new(Arc::clone(engine));
    let options = SearchOptions { json, quiet, limit };

    let output = cmd.run(query, &options).await;
    print_formatted(&cmd.format_output(&output, &options));

    found_to_exit_code(output.found())
}

async fn run_recall(engine: &Arc<MemoryEngine>, key: &str, json: bool, quiet: bool) -> ExitCode {
    use engram::cli::recall::RecallOptions;

    let cmd = cli::RecallCommand::new(Arc::clone(engine));
    let options = RecallOptions { json, quiet };

    let output = cmd.run(key, &options).await;
    print_formatted(&cmd.format_output(&output, &options));

    found_to_exit_code(output.found())
}

fn run_analyze(engine: &Arc<MemoryEngine>, detailed: bool, json: bool, quiet: bool) -> ExitCode {
    use engram::cli::analyze::AnalyzeOptions;

    let cmd = cli::AnalyzeCommand::new(Arc::clone(engine));
    let options = AnalyzeOptions {
        json,
        quiet,
        detailed,
    };

    let output = cmd.run(&options);
    print_formatted(&cmd.format_output(&output, &options));

    ExitCode::from(exit_codes::SUCCESS as u8)
}

async fn run_backends(
    engine: &Arc<MemoryEngine>,
    config: Config,
    json: bool,
    quiet: bool,
) -> ExitCode {
    use engram::cli::backends_cmd::BackendsOptions;

    let cmd = cli::BackendsCommand::new(Arc::clone(engine), config);
    let options = BackendsOptions { json, quiet };

    let output = cmd.run(&options).await;
    print_formatted(&cmd.format_output(&output, &options));

    ExitCode::from(exit_codes::SUCCESS as u8)
}

fn run_config(
    save: bool,
    json: bool,
    quiet: bool,
    cwd: &Path,
    config: Config,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    use engram::cli::config_cmd::{ConfigCommand, ConfigOptions};

    let cmd = ConfigCommand::new(cwd, config);
    let options = ConfigOptions { json, quiet, save };

    let output = cmd.run(&options);
    print_formatted(&cmd.format_output(&output, &options));

    if output.valid {
        Ok(ExitCode::from(exit_codes::SUCCESS as u8))
    } else {
        Ok(ExitCode::from(exit_codes::ERROR as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_help_explains_state_between_runs() {
        let mut command = Cli::command();
        let help = command.render_long_help().to_string();
        assert!(help.contains("State between runs"));
        assert!(help.contains("persist_cache = true"));

        let get = command
            .find_subcommand_mut("get")
            .unwrap()
            .render_long_help()
            .to_string();
        assert!(get.contains("in-memory"));
    }

    #[test]
    fn test_search_limit_parses() {
        let cli = Cli::try_parse_from(["engram", "search", "free", "-n", "3"]).unwrap();
        match cli.command {
            Commands::Search { query, limit, .. } => {
                assert_eq!(query, "free");
                assert_eq!(limit, 3);
            }
            _ => panic!("expected search"),
        }
    }
}
