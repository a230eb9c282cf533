//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::store::RetryPolicy;
use crate::domain::coercion::{Coercion, CoercionTable, FieldKind};
use crate::domain::descriptor::{EntityDescriptor, SyncMode};
use crate::domain::error::DomainError;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "blendstore";
const ENV_PREFIX: &str = "BLENDSTORE";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_RETRY_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;

/// Command-line arguments for the blendstore binary.
#[derive(Debug, Parser)]
#[command(name = "blendstore", version, about = "Cache-aside entity store toolkit")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "BLENDSTORE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate every declared entity.
    Check,
    /// Print the cache keys derived for an entity.
    Keys(KeysArgs),
    /// Materialize every record of an entity into the cache.
    Warm(WarmArgs),
    /// Read one record through the cache and print it as JSON.
    Get(GetArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct KeysArgs {
    /// Declared entity name.
    #[arg(long, value_name = "NAME")]
    pub entity: String,

    /// Unique key value.
    #[arg(long, value_name = "UK")]
    pub key: String,

    /// Index field to derive an index key for.
    #[arg(long, value_name = "FIELD", requires = "value")]
    pub field: Option<String>,

    /// Index value paired with `--field`.
    #[arg(long, value_name = "VALUE", requires = "field")]
    pub value: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Declared entity name.
    #[arg(long, value_name = "NAME")]
    pub entity: String,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Declared entity name.
    #[arg(long, value_name = "NAME")]
    pub entity: String,

    /// Unique key value.
    #[arg(
        long,
        value_name = "UK",
        required_unless_present = "field",
        conflicts_with = "field"
    )]
    pub key: Option<String>,

    /// Unique index field.
    #[arg(long, value_name = "FIELD", requires = "value")]
    pub field: Option<String>,

    /// Unique index value paired with `--field`.
    #[arg(long, value_name = "VALUE", requires = "field")]
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub writes: WriteSettings,
    pub entities: Vec<EntitySettings>,
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

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct WriteSettings {
    pub retry_attempts: NonZeroU32,
    pub retry_backoff: Duration,
}

impl WriteSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_backoff)
    }
}

/// One declared entity.
#[derive(Debug, Clone)]
pub struct EntitySettings {
    pub name: String,
    pub table: Option<String>,
    pub unique_key: Option<String>,
    pub index: Vec<String>,
    pub multi_index: Vec<String>,
    pub cache_fields: Vec<String>,
    pub sync: SyncMode,
    /// Declared field kinds; non-empty enables typed coercion.
    pub fields: BTreeMap<String, FieldKind>,
}

impl EntitySettings {
    /// Build and validate the descriptor declared by this entry.
    pub fn descriptor(&self) -> Result<EntityDescriptor, DomainError> {
        let mut builder = EntityDescriptor::builder(self.name.clone()).sync_mode(self.sync);
        if let Some(table) = &self.table {
            builder = builder.table(table.clone());
        }
        if let Some(unique_key) = &self.unique_key {
            builder = builder.unique_key(unique_key.clone());
        }
        for field in &self.index {
            builder = builder.index(field.clone());
        }
        for field in &self.multi_index {
            builder = builder.multi_index(field.clone());
        }
        builder = builder.cache_fields(self.cache_fields.iter().cloned());
        if !self.fields.is_empty() {
            let table: CoercionTable = self
                .fields
                .iter()
                .map(|(field, kind)| (field.clone(), *kind))
                .collect();
            builder = builder.coercion(Coercion::Typed(table));
        }
        builder.build()
    }
}

impl Settings {
    pub fn entity(&self, name: &str) -> Option<&EntitySettings> {
        self.entities.iter().find(|entity| entity.name == name)
    }
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

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_logging_overrides(&cli.logging);
    match &cli.command {
        Command::Warm(args) => raw.apply_database_override(&args.database),
        Command::Get(args) => raw.apply_database_override(&args.database),
        Command::Check | Command::Keys(_) => {}
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    writes: RawWriteSettings,
    entities: Vec<RawEntitySettings>,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            writes,
            entities,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let writes = build_write_settings(writes)?;
        let entities = build_entity_settings(entities)?;

        Ok(Self {
            logging,
            database,
            writes,
            entities,
        })
    }
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

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_write_settings(writes: RawWriteSettings) -> Result<WriteSettings, LoadError> {
    let retry_attempts = non_zero_u32(
        writes.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
        "writes.retry_attempts",
    )?;
    let retry_backoff =
        Duration::from_millis(writes.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS));

    Ok(WriteSettings {
        retry_attempts,
        retry_backoff,
    })
}

fn build_entity_settings(
    entities: Vec<RawEntitySettings>,
) -> Result<Vec<EntitySettings>, LoadError> {
    let mut built: Vec<EntitySettings> = Vec::with_capacity(entities.len());
    for raw in entities {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err(LoadError::invalid("entities.name", "must not be empty"));
        }
        if built.iter().any(|entity| entity.name == name) {
            return Err(LoadError::invalid(
                "entities.name",
                format!("entity `{name}` is declared more than once"),
            ));
        }

        let sync = match raw.sync.as_deref().map(str::trim) {
            None | Some("async") => SyncMode::Async,
            Some("sync") => SyncMode::Sync,
            Some(other) => {
                return Err(LoadError::invalid(
                    "entities.sync",
                    format!("`{other}` for `{name}` is neither `sync` nor `async`"),
                ));
            }
        };

        let mut fields = BTreeMap::new();
        for (field, kind) in raw.fields {
            let kind = FieldKind::from_str(&kind).map_err(|err| {
                LoadError::invalid("entities.fields", format!("`{name}.{field}`: {err}"))
            })?;
            fields.insert(field, kind);
        }

        built.push(EntitySettings {
            name,
            table: raw.table,
            unique_key: raw.unique_key,
            index: raw.index,
            multi_index: raw.multi_index,
            cache_fields: raw.cache_fields,
            sync,
            fields,
        });
    }
    Ok(built)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWriteSettings {
    retry_attempts: Option<u64>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEntitySettings {
    name: String,
    table: Option<String>,
    unique_key: Option<String>,
    index: Vec<String>,
    multi_index: Vec<String>,
    cache_fields: Vec<String>,
    sync: Option<String>,
    fields: BTreeMap<String, String>,
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
