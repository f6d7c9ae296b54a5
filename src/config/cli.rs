use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the farmcache maintenance binary.
#[derive(Debug, Parser)]
#[command(name = "farmcache", version, about = "Persistent cache maintenance")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "FARMCACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: CacheOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Delete expired or corrupt files under the persistent directory.
    Sweep,
    /// Print the path and expiry header of a persistent item.
    Inspect(KeyArgs),
    /// Print the derived persistent path of a key.
    Path(KeyArgs),
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    /// Cache key, already normalized the way the application stores it.
    #[arg(value_name = "KEY")]
    pub key: String,

    /// Site the item belongs to; omitted for global items.
    #[arg(long = "site", value_name = "SITE")]
    pub site: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the persistent cache directory.
    #[arg(
        long = "persistent-dir",
        value_name = "PATH",
        global = true,
        value_hint = ValueHint::DirPath
    )]
    pub persistent_dir: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        global = true,
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}
