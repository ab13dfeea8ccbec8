//! Command-line interface definition for melp
//!
//! This module defines the CLI structure using clap's derive API. Every
//! operational flag can also be supplied through the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::logging::LoggingConfig;

/// Lower bound for the receiver reconnect delay.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Upper bound for the receiver reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// melp - bridge between Kafka topics and HTTP
///
/// Publishes HTTP requests onto topics and forwards topic messages to HTTP
/// callbacks with at-least-once delivery.
#[derive(Parser, Debug, Clone)]
#[command(name = "melp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short = 'f', long = "file", env = "CONFIG", default_value = "melp.yaml")]
    pub config: String,

    /// HTTP listen port
    #[arg(long, env = "HTTP_PORT", default_value_t = 10000)]
    pub port: u16,

    /// Delay before a receiver reconnects after a failed delivery
    /// (seconds, or a duration such as `1m30s`; clamped to 1s..1m)
    #[arg(long, env = "RECONNECT_DELAY", default_value = "15", value_parser = parse_delay)]
    pub reconnect_delay: Duration,

    /// Log level or filter directive (overridden by RUST_LOG)
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Also append logs to this file
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    pub echo: bool,

    /// Skip unknown configuration keys instead of rejecting the file
    #[arg(long)]
    pub relax: bool,
}

impl Cli {
    /// Reconnect delay clamped to the supported range.
    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
            .clamp(MIN_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }

    /// Logging settings derived from the flags.
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.json_logs,
            file_path: self.log_file.clone(),
        }
    }
}

/// Parses a bare number of seconds (`15`, `2.5`) or a humantime duration
/// (`500ms`, `1m30s`).
fn parse_delay(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("invalid delay '{}': {}", s, e));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid delay '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["melp"]).unwrap();
        assert_eq!(cli.config, "melp.yaml");
        assert_eq!(cli.port, 10000);
        assert_eq!(cli.reconnect_delay(), Duration::from_secs(15));
        assert_eq!(cli.log_level, "info");
        assert!(!cli.dry_run);
        assert!(!cli.echo);
        assert!(!cli.relax);
    }

    #[test]
    #[serial]
    fn test_cli_parse_flags() {
        let cli = Cli::try_parse_from([
            "melp",
            "-f",
            "/etc/melp.yaml",
            "--port",
            "8080",
            "--reconnect-delay",
            "30s",
            "-l",
            "debug",
            "--json-logs",
            "--dry-run",
            "--relax",
        ])
        .unwrap();
        assert_eq!(cli.config, "/etc/melp.yaml");
        assert_eq!(cli.port, 8080);
        assert_eq!(cli.reconnect_delay(), Duration::from_secs(30));
        assert!(cli.logging().json_format);
        assert_eq!(cli.logging().level, "debug");
        assert!(cli.dry_run);
        assert!(cli.relax);
    }

    #[test]
    #[serial]
    fn test_reconnect_delay_is_clamped() {
        let cli = Cli::try_parse_from(["melp", "--reconnect-delay", "100ms"]).unwrap();
        assert_eq!(cli.reconnect_delay(), MIN_RECONNECT_DELAY);

        let cli = Cli::try_parse_from(["melp", "--reconnect-delay", "5m"]).unwrap();
        assert_eq!(cli.reconnect_delay(), MAX_RECONNECT_DELAY);

        let cli = Cli::try_parse_from(["melp", "--reconnect-delay", "1m30s"]).unwrap();
        assert_eq!(cli.reconnect_delay(), MAX_RECONNECT_DELAY);

        let cli = Cli::try_parse_from(["melp", "--reconnect-delay", "2.5"]).unwrap();
        assert_eq!(cli.reconnect_delay(), Duration::from_millis(2500));
    }

    #[test]
    #[serial]
    fn test_env_overrides_defaults() {
        std::env::set_var("HTTP_PORT", "9999");
        let cli = Cli::try_parse_from(["melp"]).unwrap();
        std::env::remove_var("HTTP_PORT");
        assert_eq!(cli.port, 9999);
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("15"), Ok(Duration::from_secs(15)));
        assert_eq!(parse_delay("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_delay("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_delay("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_delay("2.5"), Ok(Duration::from_millis(2500)));
        assert_eq!(parse_delay("3h"), Ok(Duration::from_secs(3 * 3600)));
        assert!(parse_delay("fast").is_err());
        assert!(parse_delay("-1").is_err());
    }
}
