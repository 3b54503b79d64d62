use clap::Parser;
use signal_relay::cli::{self, Cli, Commands};
use signal_relay::config::AppConfig;
use signal_relay::coordination::{shutdown::wait_for_os_signal, ShutdownController, ShutdownReason};
use signal_relay::credentials::AesGcmCipher;
use signal_relay::error::{RelayError, Result};
use signal_relay::runtime::Relay;
use signal_relay::store::PostgresStore;
use signal_relay::telemetry;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => {
            let config = AppConfig::load_from(&cli.config)?;
            let _guard = telemetry::init_logging(&config.logging);
            run_relay(config).await?;
        }
        Some(Commands::CheckConfig) => {
            telemetry::init_logging_simple();
            let config = AppConfig::load_from(&cli.config)?;
            if let Err(errors) = config.validate() {
                for e in &errors {
                    eprintln!("✗ {}", e);
                }
                return Err(RelayError::Validation(format!(
                    "{} configuration error(s)",
                    errors.len()
                )));
            }
            cli::print_config_summary(&config);
            println!("✓ configuration valid");
        }
        Some(Commands::Parse { pattern, take_profit, text }) => {
            telemetry::init_logging_simple();
            cli::preview_parse(pattern, take_profit.as_deref(), text)?;
        }
        Some(Commands::Migrate) => {
            telemetry::init_logging_simple();
            let config = AppConfig::load_from(&cli.config)?;
            let url = config
                .database
                .url
                .as_deref()
                .ok_or_else(|| RelayError::Validation("database.url is not set".into()))?;
            let store = PostgresStore::new(url, config.database.max_connections).await?;
            store.migrate().await?;
            println!("✓ migrations applied");
        }
        Some(Commands::GenerateKey) => {
            println!("{}", AesGcmCipher::generate_key());
        }
    }

    Ok(())
}

async fn run_relay(config: AppConfig) -> Result<()> {
    info!("starting signal relay");
    let relay = Relay::build(config).await?;

    let shutdown = Arc::new(ShutdownController::with_defaults());
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_os_signal().await;
        on_signal.request_shutdown(ShutdownReason::Signal);
    });

    relay.run(shutdown).await
}
