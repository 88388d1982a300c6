//! CLI error types with miette diagnostics.
//!
//! Wraps config, fleet, and session failures into user-facing errors with
//! actionable help text and a stable exit code.

use miette::Diagnostic;
use thiserror::Error;

use tagkeep_config::ConfigError;
use tagkeep_core::{FleetError, SessionError};

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Configuration is invalid")]
    #[diagnostic(
        code(tagkeep::config),
        help("Check the file with: tagkeep config validate")
    )]
    Config(#[from] ConfigError),

    #[error("Configuration file already exists at {path}")]
    #[diagnostic(
        code(tagkeep::config_exists),
        help("Pass --force to overwrite it.")
    )]
    ConfigExists { path: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(tagkeep::validation))]
    Validation { field: String, reason: String },

    // ── Fleet ────────────────────────────────────────────────────────

    #[error("Tag {address} is not part of the simulated fleet")]
    #[diagnostic(
        code(tagkeep::unknown_device),
        help("Simulated tags are listed in the config file or generated as AA:BB:CC:00:00:01 and up.")
    )]
    UnknownDevice { address: String },

    #[error(transparent)]
    #[diagnostic(code(tagkeep::fleet))]
    Fleet(#[from] FleetError),

    #[error("Tag operation failed")]
    #[diagnostic(code(tagkeep::session))]
    Session(#[from] SessionError),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to encode output: {0}")]
    #[diagnostic(code(tagkeep::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::ConfigExists { .. } => exit_code::CONFIG,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config = CliError::Config(ConfigError::Validation {
            field: "fleet.max_connections".into(),
            reason: "must be at least 1".into(),
        });
        assert_eq!(config.exit_code(), exit_code::CONFIG);

        let usage = CliError::Validation {
            field: "ring".into(),
            reason: "bad address".into(),
        };
        assert_eq!(usage.exit_code(), exit_code::USAGE);

        let general = CliError::UnknownDevice {
            address: "AA:BB:CC:00:00:09".into(),
        };
        assert_eq!(general.exit_code(), exit_code::GENERAL);
        assert_ne!(general.exit_code(), exit_code::SUCCESS);
    }
}
