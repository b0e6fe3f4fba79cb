use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rand::Rng;
use tool_metrics::{default_config_path, Interval, MetricsApi, StorageUpdate, ToolCallQuery};

#[derive(Parser)]
#[command(name = "tool-metrics")]
#[command(about = "Inspect and export measured tool calls")]
#[command(version)]
struct Cli {
    /// Tracker config file
    #[arg(long, env = "TOOL_METRICS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print call counts and average execution times
    Stats,
    /// Print dashboard data
    Dashboard {
        /// Time-series bucket: minute, hour or day
        #[arg(long)]
        interval: Option<Interval>,
        /// Restrict the time series to these tools
        #[arg(long = "tool")]
        tools: Vec<String>,
    },
    /// Export the call log
    Export {
        /// csv or json
        #[arg(long, default_value = "csv")]
        format: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// List recorded calls
    Query {
        #[arg(long)]
        tool: Option<String>,
        /// RFC 3339 lower bound (inclusive)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound (inclusive)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        /// Keep the first N matches
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Enable or disable tracking per tool, e.g. `calculator=false`
    Track {
        #[arg(value_parser = parse_tracking_flag)]
        flags: Vec<(String, bool)>,
    },
    /// Change storage options
    Storage {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        max_entries: Option<usize>,
        /// Keep every record
        #[arg(long, conflicts_with = "max_entries")]
        unbounded: bool,
    },
    /// Remove every recorded call
    Clear,
    /// Run sample tools through the interceptor
    Demo {
        #[arg(long, default_value_t = 4)]
        calls: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config_path = cli
        .config
        .or_else(default_config_path)
        .unwrap_or_else(|| PathBuf::from(tool_metrics::config::DEFAULT_CONFIG_FILENAME));
    log::debug!("using tracker config {}", config_path.display());

    let api = MetricsApi::open(&config_path);

    match cli.command {
        Commands::Stats => {
            print_json(&serde_json::json!({
                "stats": api.stats(),
                "tools": api.tool_usage_stats(),
            }))?;
        }
        Commands::Dashboard { interval, tools } => {
            let filter = (!tools.is_empty()).then_some(tools.as_slice());
            print_json(&api.dashboard_data(interval, filter))?;
        }
        Commands::Export { format, output } => {
            let path = api
                .export_data(&format, output.as_deref())
                .context("export failed")?;
            println!("{}", path.display());
        }
        Commands::Query {
            tool,
            since,
            until,
            limit,
        } => {
            let records = api.query(&ToolCallQuery {
                tool_name: tool,
                start_time: since,
                end_time: until,
                limit,
            });
            print_json(&records)?;
        }
        Commands::Track { flags } => {
            let tools = api.configure_tool_tracking(flags)?;
            for (tool, enabled) in tools {
                let state = if enabled { "tracked".green() } else { "ignored".yellow() };
                println!("{:<24} {}", tool, state);
            }
        }
        Commands::Storage {
            path,
            max_entries,
            unbounded,
        } => {
            let max_entries = if unbounded { Some(None) } else { max_entries.map(Some) };
            let storage = api.set_storage_options(StorageUpdate { path, max_entries })?;
            print_json(&storage)?;
        }
        Commands::Clear => {
            api.clear()?;
            println!("{}", "Tool call log cleared".green());
        }
        Commands::Demo { calls } => run_demo(&api, calls),
    }

    Ok(())
}

fn init_logging(debug: bool) {
    let filter = if debug { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

fn parse_tracking_flag(raw: &str) -> Result<(String, bool), String> {
    let (tool, enabled) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TOOL=true|false, got '{}'", raw))?;
    let enabled = enabled
        .trim()
        .parse::<bool>()
        .map_err(|_| format!("expected true or false for '{}', got '{}'", tool, enabled))?;
    Ok((tool.trim().to_string(), enabled))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_demo(api: &MetricsApi, calls: usize) {
    let interceptor = api.interceptor();

    let web_search = interceptor.wrap("web_search", |(query,): (String,)| {
        let mut rng = rand::thread_rng();
        thread::sleep(Duration::from_millis(rng.gen_range(100..300)));
        Ok::<_, String>(vec![format!("Result for {}: {}", query, rng.gen_range(1..=100))])
    });
    let calculator = interceptor.wrap("calculator", |(operation, a, b): (String, i64, i64)| {
        thread::sleep(Duration::from_millis(rand::thread_rng().gen_range(50..100)));
        match operation.as_str() {
            "add" => Ok(a + b),
            "multiply" => Ok(a * b),
            other => Err(format!("unsupported operation '{}'", other)),
        }
    });

    println!("{}", "Running web searches...".bold());
    for query in ["weather", "news", "sports", "technology"].iter().cycle().take(calls) {
        match web_search((query.to_string(),)) {
            Ok(results) => println!("  Search '{}': {:?}", query, results),
            Err(error) => println!("  Search '{}' failed: {}", query, error.red()),
        }
    }

    println!("{}", "Running calculations...".bold());
    let mut rng = rand::thread_rng();
    for operation in ["add", "multiply", "divide"].iter().cycle().take(calls + 1) {
        let (a, b) = (rng.gen_range(1..=10), rng.gen_range(1..=10));
        match calculator((operation.to_string(), a, b)) {
            Ok(result) => println!("  {}({}, {}) = {}", operation, a, b, result),
            Err(error) => println!("  {}({}, {}) failed: {}", operation, a, b, error.red()),
        }
    }

    println!("{}", "Tool usage statistics:".bold());
    for (tool, stats) in api.tool_usage_stats() {
        println!("  {}:", tool.cyan());
        println!("    Count: {}", stats.count);
        println!(
            "    Avg. Execution Time: {:.4}s",
            stats.avg_execution_time.unwrap_or_default()
        );
        println!("    Success Rate: {:.2}%", stats.success_rate * 100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_flags_parse_name_and_state() {
        assert_eq!(
            parse_tracking_flag("calculator=false"),
            Ok(("calculator".to_string(), false))
        );
        assert_eq!(
            parse_tracking_flag(" web_search = true "),
            Ok(("web_search".to_string(), true))
        );
        assert!(parse_tracking_flag("calculator").is_err());
        assert!(parse_tracking_flag("calculator=maybe").is_err());
    }

    #[test]
    fn cli_parses_dashboard_arguments() {
        let cli = Cli::try_parse_from([
            "tool-metrics",
            "dashboard",
            "--interval",
            "day",
            "--tool",
            "search",
            "--tool",
            "calc",
        ])
        .expect("parse");

        match cli.command {
            Commands::Dashboard { interval, tools } => {
                assert_eq!(interval, Some(Interval::Day));
                assert_eq!(tools, vec!["search", "calc"]);
            }
            _ => panic!("expected dashboard command"),
        }
    }

    #[test]
    fn storage_unbounded_conflicts_with_max_entries() {
        let cli = Cli::try_parse_from(["tool-metrics", "storage", "--unbounded"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Storage {
                unbounded: true,
                max_entries: None,
                ..
            }
        ));

        assert!(Cli::try_parse_from([
            "tool-metrics",
            "storage",
            "--unbounded",
            "--max-entries",
            "10"
        ])
        .is_err());
    }

    #[test]
    fn cli_rejects_unknown_interval() {
        assert!(Cli::try_parse_from(["tool-metrics", "dashboard", "--interval", "week"]).is_err());
    }
}
