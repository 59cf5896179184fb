//! CLI argument definitions using clap

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Gantry - fetch pipeline resources through cached worker volumes
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "GANTRY_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch a resource version with a get step
    Get(GetArgs),

    /// Manage cached resource volumes
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the get command
#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Resource type to fetch (must be listed under [resource_types])
    pub resource_type: String,

    /// Source configuration entry (KEY=VALUE, repeatable)
    #[arg(short, long = "source", value_parser = parse_key_val)]
    pub source: Vec<(String, String)>,

    /// Source configuration as a JSON object, merged under --source entries
    #[arg(long)]
    pub source_json: Option<String>,

    /// Fetch parameter (KEY=VALUE, repeatable)
    #[arg(short, long = "param", value_parser = parse_key_val)]
    pub param: Vec<(String, String)>,

    /// Version to fetch (KEY=VALUE, repeatable); latest when omitted
    #[arg(long = "version", value_parser = parse_key_val)]
    pub version: Vec<(String, String)>,

    /// Worker tag required for placement (repeatable)
    #[arg(short, long = "tag")]
    pub tag: Vec<String>,

    /// Name to publish the fetched artifact under (defaults to the resource type)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Directory to copy the fetched artifact into
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for list commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List all cache volumes
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove volumes whose lease has expired
    Gc {
        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },
}

/// Parse a pair in KEY=VALUE format
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE format: no '=' found in '{s}'"))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE format: empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
