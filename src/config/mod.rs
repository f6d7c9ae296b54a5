//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{CacheOverrides, CliArgs, Command, KeyArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "farmcache";
const ENV_PREFIX: &str = "FARMCACHE";
const DEFAULT_PERSISTENT_DIR: &str = "persistent-cache";
const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_DUMMY_KEY_DAYS: u32 = 365;
const DEFAULT_PERSISTENT_FILE_MINUTES: u32 = 24 * 60;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Propagate local mutations to the other nodes of the farm.
    pub synchronize: bool,
    pub persistent_dir: PathBuf,
    /// Namespace prefix applied to every key of this process.
    pub key_context: Option<String>,
    pub capacity: NonZeroUsize,
    /// Lifetime of the anchors written by touch.
    pub dummy_key_days: NonZeroU32,
    /// How long persistent files outlive their in-memory expiry by default.
    pub persistent_file_minutes: NonZeroU32,
    pub debug: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            synchronize: false,
            persistent_dir: PathBuf::from(DEFAULT_PERSISTENT_DIR),
            key_context: None,
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            dummy_key_days: NonZeroU32::new(DEFAULT_DUMMY_KEY_DAYS).unwrap_or(NonZeroU32::MIN),
            persistent_file_minutes: NonZeroU32::new(DEFAULT_PERSISTENT_FILE_MINUTES)
                .unwrap_or(NonZeroU32::MIN),
            debug: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(dir) = overrides.persistent_dir.as_ref() {
            self.cache.persistent_dir = Some(dir.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { cache, logging } = raw;

        let cache = build_cache_settings(cache)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self { cache, logging })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheSettings::default();

    let persistent_dir = match cache.persistent_dir {
        Some(dir) if dir.as_os_str().is_empty() => {
            return Err(LoadError::invalid(
                "cache.persistent_dir",
                "must not be empty",
            ));
        }
        Some(dir) => dir,
        None => defaults.persistent_dir,
    };

    let key_context = cache.key_context.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let capacity = match cache.capacity {
        Some(value) => NonZeroUsize::new(value)
            .ok_or_else(|| LoadError::invalid("cache.capacity", "must be greater than zero"))?,
        None => defaults.capacity,
    };

    let dummy_key_days = match cache.dummy_key_days {
        Some(value) => non_zero_u32(value, "cache.dummy_key_days")?,
        None => defaults.dummy_key_days,
    };

    let persistent_file_minutes = match cache.persistent_file_minutes {
        Some(value) => non_zero_u32(value, "cache.persistent_file_minutes")?,
        None => defaults.persistent_file_minutes,
    };

    Ok(CacheSettings {
        synchronize: cache.synchronize.unwrap_or(defaults.synchronize),
        persistent_dir,
        key_context,
        capacity,
        dummy_key_days,
        persistent_file_minutes,
        debug: cache.debug.unwrap_or(defaults.debug),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    synchronize: Option<bool>,
    persistent_dir: Option<PathBuf>,
    key_context: Option<String>,
    capacity: Option<usize>,
    dummy_key_days: Option<u64>,
    persistent_file_minutes: Option<u64>,
    debug: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
