// # lorad - LoRaWAN Ingestion Daemon
//
// This daemon is a THIN integration layer. All ingestion logic lives in
// lora-core; this binary only wires the collaborators together:
//
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Loading static provisioning and starting every application
// 4. Reaping failed applications until a shutdown signal arrives
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// - `LORA_PROVISIONING_FILE`: JSON file with `groups` and `devices` (required)
// - `LORA_LOG_LEVEL`: trace, debug, info, warn or error (default: info)
// - `LORA_RECONNECT_MAX_ATTEMPTS`: reconnects before an application stops
// - `LORA_RECONNECT_DELAY_MS`: base reconnect delay, grown linearly per attempt
// - `LORA_PROVISIONING_TIMEOUT_SECS`: bound on one auto-registration
// - `LORA_CLIENT_ID_PREFIX`: prefix for broker client ids
//
// ## Example
//
// ```bash
// export LORA_PROVISIONING_FILE=/etc/lora-agent/provisioning.json
// export LORA_LOG_LEVEL=debug
// export LORA_RECONNECT_MAX_ATTEMPTS=5
//
// lorad
// ```

use anyhow::{Context, Result};
use lora_core::{AgentConfig, ApplicationRegistry, LogUpdateSink, MemoryDeviceManager};
use lora_mqtt::MqttTransport;
use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How often applications that gave up reconnecting are removed
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum LoradExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<LoradExitCode> for ExitCode {
    fn from(code: LoradExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration
struct Config {
    provisioning_file: String,
    log_level: String,
    max_reconnect_attempts: Option<usize>,
    reconnect_delay_ms: Option<u64>,
    provisioning_timeout_secs: Option<u64>,
    client_id_prefix: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            provisioning_file: env::var("LORA_PROVISIONING_FILE")
                .context("LORA_PROVISIONING_FILE is not set")?,
            log_level: env::var("LORA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_reconnect_attempts: parse_var("LORA_RECONNECT_MAX_ATTEMPTS")?,
            reconnect_delay_ms: parse_var("LORA_RECONNECT_DELAY_MS")?,
            provisioning_timeout_secs: parse_var("LORA_PROVISIONING_TIMEOUT_SECS")?,
            client_id_prefix: env::var("LORA_CLIENT_ID_PREFIX").ok(),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.provisioning_file.is_empty() {
            anyhow::bail!(
                "LORA_PROVISIONING_FILE is required. \
                Set it via: export LORA_PROVISIONING_FILE=/etc/lora-agent/provisioning.json"
            );
        }

        if !Path::new(&self.provisioning_file).is_file() {
            anyhow::bail!(
                "LORA_PROVISIONING_FILE does not point to a file: {}",
                self.provisioning_file
            );
        }

        if let Some(attempts) = self.max_reconnect_attempts
            && !(1..=100).contains(&attempts)
        {
            anyhow::bail!(
                "LORA_RECONNECT_MAX_ATTEMPTS must be between 1 and 100. Got: {}",
                attempts
            );
        }

        if let Some(delay) = self.reconnect_delay_ms
            && !(10..=60_000).contains(&delay)
        {
            anyhow::bail!(
                "LORA_RECONNECT_DELAY_MS must be between 10 and 60000. Got: {}",
                delay
            );
        }

        if let Some(timeout) = self.provisioning_timeout_secs
            && !(1..=300).contains(&timeout)
        {
            anyhow::bail!(
                "LORA_PROVISIONING_TIMEOUT_SECS must be between 1 and 300. Got: {}",
                timeout
            );
        }

        if let Some(ref prefix) = self.client_id_prefix
            && (prefix.is_empty() || prefix.len() > 32)
        {
            anyhow::bail!(
                "LORA_CLIENT_ID_PREFIX must be 1 to 32 characters. Got: '{}'",
                prefix
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "LORA_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Core settings with environment overrides applied
    fn agent_config(&self) -> AgentConfig {
        let mut agent = AgentConfig::default();
        if let Some(attempts) = self.max_reconnect_attempts {
            agent.binding.max_reconnect_attempts = attempts;
        }
        if let Some(delay) = self.reconnect_delay_ms {
            agent.binding.reconnect_delay_ms = delay;
        }
        if let Some(timeout) = self.provisioning_timeout_secs {
            agent.pipeline.provisioning_timeout_secs = timeout;
        }
        if let Some(ref prefix) = self.client_id_prefix {
            agent.binding.client_id_prefix = prefix.clone();
        }
        agent
    }
}

/// Parse an optional numeric environment variable
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} is not a valid number ('{}'): {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return LoradExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return LoradExitCode::ConfigError.into();
    }

    let agent = config.agent_config();
    if let Err(e) = agent.validate() {
        eprintln!("Configuration validation error: {}", e);
        return LoradExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return LoradExitCode::ConfigError.into();
    }

    info!("Starting lorad daemon");
    info!(
        max_reconnect_attempts = agent.binding.max_reconnect_attempts,
        reconnect_delay_ms = agent.binding.reconnect_delay_ms,
        provisioning_timeout_secs = agent.pipeline.provisioning_timeout_secs,
        "Configuration loaded"
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return LoradExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        let manager = match MemoryDeviceManager::from_file(&config.provisioning_file).await {
            Ok(manager) => manager,
            Err(e) => {
                error!("Failed to load provisioning: {}", e);
                return LoradExitCode::ConfigError;
            }
        };

        if let Err(e) = run_daemon(manager, agent).await {
            error!("Daemon error: {}", e);
            LoradExitCode::RuntimeError
        } else {
            LoradExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon until a shutdown signal arrives
async fn run_daemon(manager: MemoryDeviceManager, agent: AgentConfig) -> Result<()> {
    info!(
        groups = manager.group_count().await,
        devices = manager.device_count().await,
        "Provisioning loaded"
    );

    let registry = ApplicationRegistry::new(
        Arc::new(MqttTransport::new()),
        Arc::new(manager),
        Arc::new(LogUpdateSink::new()),
        agent,
    );

    registry.bootstrap().await?;
    info!("Daemon initialized, {} application(s) running", registry.len().await);

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    let mut reap = tokio::time::interval(REAP_INTERVAL);
    reap.tick().await;

    let outcome = loop {
        tokio::select! {
            signal = &mut shutdown => break signal,
            _ = reap.tick() => {
                for app_eui in registry.reap_failed().await {
                    warn!(app_eui = %app_eui, "Removed application that stopped reconnecting");
                }
            }
        }
    };

    match outcome {
        Ok(signal) => info!("Received shutdown signal: {}", signal),
        Err(ref e) => error!("Shutdown error: {}", e),
    }

    info!("Stopping {} application(s)", registry.len().await);
    registry.stop_all().await;
    info!("Daemon stopped");

    outcome.map(|_| ())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let signal = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(signal)
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
