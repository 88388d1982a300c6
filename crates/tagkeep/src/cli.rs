//! Clap derive structures for the `tagkeep` CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// tagkeep -- keep BLE anti-loss tags connected and reachable
#[derive(Debug, Parser)]
#[command(
    name = "tagkeep",
    version,
    about = "Run and inspect fleets of BLE anti-loss tags",
    long_about = "Manages connections to BLE anti-loss tags that share a small pool\n\
        of adapter connection slots: alarms, battery polling, button events\n\
        and presence tracking.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file to use instead of the platform default
    #[arg(long, env = "TAGKEEP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl GlobalOpts {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(tagkeep_config::config_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect and manage the configuration file
    #[command(alias = "cfg")]
    Config(ConfigArgs),

    /// Run a fleet against simulated tags
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the resolved config file path
    Path,

    /// Print the effective configuration (file plus environment)
    Show,

    /// Validate the configuration and report what it manages
    Validate,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// ── Simulate ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// How long to run, e.g. "5s" or "1m"
    #[arg(long, short = 'd', default_value = "5s", value_parser = humantime::parse_duration)]
    pub duration: Duration,

    /// Simulated tags to generate in addition to configured ones
    /// [default: 3 when the config lists no devices]
    #[arg(long, short = 'n')]
    pub devices: Option<usize>,

    /// Connection slots (overrides fleet.max_connections)
    #[arg(long)]
    pub slots: Option<usize>,

    /// Ring this tag halfway through the run
    #[arg(long, value_name = "ADDRESS")]
    pub ring: Option<String>,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
