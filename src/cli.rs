use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::config::AppConfig;
use crate::error::Result;
use crate::parser::{extract, ExtractionPattern, DEFAULT_SIGNAL_PATTERN};

#[derive(Parser)]
#[command(name = "signal-relay")]
#[command(version = "0.1.0")]
#[command(about = "Multi-tenant trading signal relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and environment files
    #[arg(short, long, default_value = "config", env = "RELAY_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the relay (default)
    Run,
    /// Load and validate the configuration, then print a summary
    CheckConfig,
    /// Try a channel pattern against a message without running anything
    Parse {
        /// Signal pattern; needs the named groups `side` and `symbol`
        #[arg(long, default_value = DEFAULT_SIGNAL_PATTERN)]
        pattern: String,
        /// Take-profit pattern; needs the named group `tp`
        #[arg(long)]
        take_profit: Option<String>,
        /// Message text
        #[arg(long)]
        text: String,
    },
    /// Apply database migrations
    Migrate,
    /// Print a fresh base64 credentials key
    GenerateKey,
}

#[derive(Debug, Serialize)]
struct ParsePreview {
    side: String,
    symbol: String,
    entry_price: Option<String>,
    stop_loss: Option<String>,
    take_profits: Vec<String>,
    market_order: bool,
}

/// Dry-run the parser and print the extracted fields as JSON.
/// Returns whether the text matched.
pub fn preview_parse(pattern: &str, take_profit: Option<&str>, text: &str) -> Result<bool> {
    let compiled = ExtractionPattern::compile(pattern, take_profit)?;
    match extract(&compiled, text) {
        Some(fields) => {
            let preview = ParsePreview {
                side: fields.side.to_string(),
                symbol: fields.symbol,
                market_order: fields.entry_price.is_none(),
                entry_price: fields.entry_price.map(|d| d.to_string()),
                stop_loss: fields.stop_loss.map(|d| d.to_string()),
                take_profits: fields.take_profits.iter().map(|d| d.to_string()).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&preview)?);
            Ok(true)
        }
        None => {
            println!("no signal matched");
            Ok(false)
        }
    }
}

/// Print the validated configuration summary
pub fn print_config_summary(config: &AppConfig) {
    println!("feed transport:      {:?}", config.feed.transport);
    if let Some(url) = &config.feed.url {
        println!("feed url:            {}", url);
    }
    println!(
        "database:            {}",
        if config.database.url.is_some() { "postgres" } else { "in-memory" }
    );
    println!(
        "idempotency:         {} (ttl {}s, on unavailable: {:?})",
        config.idempotency.backend, config.idempotency.ttl_secs, config.idempotency.on_unavailable
    );
    println!("pipeline workers:    {}", config.pipeline.workers);
    println!(
        "circuit breaker:     {} failures / {}s window, open {}s",
        config.circuit_breaker.failure_threshold,
        config.circuit_breaker.failure_window_secs,
        config.circuit_breaker.open_secs
    );
    println!(
        "confirmation:        every {}ms for {}ms",
        config.execution.poll_interval_ms, config.execution.confirm_timeout_ms
    );
    println!(
        "health port:         {}",
        config
            .health_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommand_args() {
        let cli =
            Cli::try_parse_from(["signal-relay", "parse", "--text", "BUY EURUSD 1.1"]).unwrap();
        match cli.command {
            Some(Commands::Parse { pattern, text, .. }) => {
                assert_eq!(pattern, DEFAULT_SIGNAL_PATTERN);
                assert_eq!(text, "BUY EURUSD 1.1");
            }
            _ => panic!("expected parse command"),
        }
    }

    #[test]
    fn test_preview_parse() {
        let gold = "Buy #XAUUSD 3750.5 SL 3740 TP 3753";
        assert!(preview_parse(DEFAULT_SIGNAL_PATTERN, None, gold).unwrap());
        assert!(!preview_parse(DEFAULT_SIGNAL_PATTERN, None, "good morning").unwrap());
        assert!(preview_parse("(?P<side>buy)", None, "buy").is_err());
    }
}
