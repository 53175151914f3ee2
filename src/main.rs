use clap::Parser;
use hivectl::cli::{self, Cli, Commands};
use hivectl::config::AppConfig;
use hivectl::control_plane::ControlPlane;
use hivectl::coordination::wait_for_signal;
use hivectl::error::{HiveError, Result};
use hivectl::logging::{init_logging, init_logging_simple};
use hivectl::services::HealthServer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => run(&cli).await?,
        Some(Commands::Config) => {
            init_logging_simple();
            let config = load_config(&cli)?;
            cli::show_config(&config)?;
        }
        Some(Commands::Thresholds) => {
            init_logging_simple();
            let config = load_config(&cli)?;
            cli::show_thresholds(&config);
        }
        Some(Commands::Validate {
            message_type,
            payload,
        }) => {
            init_logging_simple();
            let version = cli::validate_payload(message_type, payload)?;
            println!("valid ({message_type}, contract version {version})");
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config = AppConfig::load_from(&cli.config_dir)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config error: {e}");
        }
        return Err(HiveError::FatalConfiguration(format!(
            "{} configuration error(s)",
            errors.len()
        )));
    }
    Ok(config)
}

async fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let _log_guard = init_logging(&config.logging);

    info!(config_dir = %cli.config_dir, "Starting hivectl control plane");
    let plane = ControlPlane::build(&config)?;
    plane.start().await?;

    let health_task = config.health_port.map(|port| {
        let server = HealthServer::new(plane.health_state(), port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Health server exited");
            }
        })
    });

    let signal = wait_for_signal().await;
    plane.shutdown(signal).await;

    if let Some(task) = health_task {
        task.abort();
    }
    info!("hivectl stopped");
    Ok(())
}
