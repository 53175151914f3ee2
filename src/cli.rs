use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::bridge::{ContractRegistry, ContractVersion};
use crate::bus::MessageType;
use crate::config::AppConfig;
use crate::emergency::{Comparison, ProtocolTable};
use crate::error::{HiveError, Result};

#[derive(Parser, Debug)]
#[command(name = "hivectl")]
#[command(version)]
#[command(about = "Agent coordination control plane for voice-call assistants", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and <HIVE_ENV>.toml
    #[arg(short, long, default_value = "config", env = "HIVE_CONFIG_DIR")]
    pub config_dir: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane until interrupted (default)
    Run,
    /// Print the effective configuration as TOML
    Config,
    /// List emergency thresholds and their intervention protocols
    Thresholds,
    /// Check a payload against the bridge's message contracts
    Validate {
        /// Message type, e.g. improvement_trigger
        #[arg(short, long)]
        message_type: String,
        /// JSON payload
        #[arg(short, long)]
        payload: String,
    },
}

pub fn show_config(config: &AppConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

pub fn show_thresholds(config: &AppConfig) {
    let protocols = ProtocolTable::default();

    println!(
        "{:<20} {:<26} {:>3} {:>10} {:<9} {:>6} {:>8}",
        "NAME", "METRIC", "", "LIMIT", "SEVERITY", "HOLD", "COOLDOWN"
    );
    for threshold in &config.emergency.thresholds {
        let relation = match threshold.comparison {
            Comparison::Above => ">",
            Comparison::Below => "<",
        };
        println!(
            "{:<20} {:<26} {:>3} {:>10} {:<9} {:>5}s {:>7}s",
            threshold.name,
            threshold.metric_name,
            relation,
            threshold.threshold_value,
            threshold.severity,
            threshold.duration_seconds,
            threshold.cooldown_seconds,
        );
        let steps = protocols
            .protocols_for(threshold.emergency_type)
            .map(|steps| {
                steps
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            })
            .unwrap_or_else(|| "(no protocol)".to_string());
        println!("    {}: {}", threshold.emergency_type.as_str(), steps);
    }
    if !config.emergency.enforce_duration {
        println!("\nHold durations are not enforced (emergency.enforce_duration = false)");
    }
}

/// Validate `payload` as `message_type` against the default contracts
pub fn validate_payload(message_type: &str, payload: &str) -> Result<ContractVersion> {
    let message_type: MessageType = message_type.parse()?;
    let payload: Value = serde_json::from_str(payload)?;
    ContractRegistry::default()
        .validate(message_type, &payload)
        .map_err(HiveError::from)
}
