// Engine configuration commands

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use relaykit_dispatch::{AdmissionMode, EngineConfig};

use crate::output::{print_field, print_section, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,

    /// Validate the effective configuration and exit
    Check,
}

/// Effective configuration: the given file, or RELAYKIT_* variables
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            // YAML parser also accepts JSON
            serde_yaml::from_str::<EngineConfig>(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => EngineConfig::from_env().context("Invalid RELAYKIT_* environment")?,
    };
    Ok(config)
}

pub fn run(command: ConfigCommand, config: &EngineConfig, output: OutputFormat) -> Result<()> {
    match command {
        ConfigCommand::Show => show(config, output),
        ConfigCommand::Check => {
            config.validate().context("Configuration is invalid")?;
            if output.is_text() {
                println!("Configuration is valid");
            } else {
                output.print_value(&serde_json::json!({ "valid": true }))?;
            }
            Ok(())
        }
    }
}

fn show(config: &EngineConfig, output: OutputFormat) -> Result<()> {
    if !output.is_text() {
        return output.print_value(config);
    }

    let pool = &config.pool;
    print_section("Pool");
    print_field("Workers", &format!("{}..{}", pool.min_workers, pool.max_workers));
    print_field("Idle timeout", &millis(pool.idle_timeout));
    print_field("Health interval", &millis(pool.health_check_interval));
    print_field("Heartbeat timeout", &millis(pool.heartbeat_timeout));
    print_field("Unresponsive", &millis(pool.unresponsive_timeout));
    print_field("Spawn failures", &pool.max_spawn_failures.to_string());

    let protocol = &config.protocol;
    print_section("Delivery");
    print_field("Default ttl", &millis(protocol.default_ttl));
    print_field("Max ack timeout", &millis(protocol.max_ack_timeout));
    print_field("Max attempts", &protocol.retry.max_attempts.to_string());
    print_field("Reorder window", &protocol.reorder_window.to_string());
    print_field("Dedup capacity", &protocol.dedup_capacity.to_string());

    print_section("Scheduling");
    print_field("Policy", &config.scheduling.to_string());

    let backpressure = &config.backpressure;
    print_section("Backpressure");
    print_field(
        "Max outstanding",
        &backpressure
            .max_outstanding
            .map_or_else(|| "unlimited".to_string(), |limit| limit.to_string()),
    );
    print_field(
        "Watermarks",
        &format!("{:.2} / {:.2}", backpressure.high_watermark, backpressure.low_watermark),
    );
    let admission = match backpressure.admission {
        AdmissionMode::Reject => "reject".to_string(),
        AdmissionMode::Wait { timeout } => format!("wait up to {}", millis(timeout)),
    };
    print_field("Admission", &admission);

    let breaker = &config.circuit_breaker;
    print_section("Circuit breaker");
    print_field("Failures to open", &breaker.failure_threshold.to_string());
    print_field("Reset timeout", &millis(breaker.reset_timeout));

    print_section("Engine");
    print_field("Shutdown timeout", &millis(config.shutdown_timeout));

    Ok(())
}

fn millis(duration: std::time::Duration) -> String {
    format!("{}ms", duration.as_millis())
}
