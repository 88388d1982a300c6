//! Config subcommand handlers.

use serde::Serialize;
use tagkeep_config::{Config, ConfigError};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

// ── Summary ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ValidationSummary {
    path: String,
    devices: Vec<String>,
    max_connections: usize,
}

fn summary_detail(s: &ValidationSummary) -> String {
    format!(
        "Config OK: {} device(s), {} connection slot(s)\n   {}",
        s.devices.len(),
        s.max_connections,
        s.path
    )
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = global.config_path();

    match args.command {
        ConfigCommand::Path => {
            output::print_output(&path.display().to_string());
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = tagkeep_config::load_config_from(&path)?;
            let out = match global.output {
                OutputFormat::Table => toml::to_string_pretty(&cfg).map_err(ConfigError::from)?,
                OutputFormat::Json => serde_json::to_string_pretty(&cfg)?,
            };
            output::print_output(out.trim_end());
            Ok(())
        }

        ConfigCommand::Validate => {
            let cfg = tagkeep_config::load_config_from(&path)?;
            let addresses = cfg.validate()?;
            let summary = ValidationSummary {
                path: path.display().to_string(),
                devices: addresses.iter().map(ToString::to_string).collect(),
                max_connections: cfg.fleet.max_connections,
            };
            let out = output::render_single(global.output, &summary, summary_detail)?;
            output::print_output(&out);
            Ok(())
        }

        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }
            tagkeep_config::save_config_to(&Config::default(), &path)?;
            tracing::info!(path = %path.display(), "wrote default config");
            eprintln!("Config written to {}", path.display());
            Ok(())
        }
    }
}
