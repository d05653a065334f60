//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    CliArgs, Command, DatabaseArgs, DatabaseOverride, InvalidateArgs, ServeArgs, ServeOverrides,
};

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, KvBackend, MAX_TTL, ProfileOverride};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "strata";
const ENV_PREFIX: &str = "STRATA";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3100;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

/// Validated `[cache]` section.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub memory_max_bytes: NonZeroUsize,
    pub kv_backend: KvBackend,
    pub event_queue_limit: NonZeroUsize,
    pub event_log_limit: usize,
    pub auto_consume_interval: Duration,
    pub consume_batch_limit: NonZeroUsize,
    pub kv_purge_interval: Duration,
    pub profiles: BTreeMap<String, ProfileOverride>,
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

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Invalidate(args)) => {
            raw.apply_database_override(&args.database);
            if let Some(backend) = args.kv_backend.as_ref() {
                raw.cache.kv_backend = Some(backend.clone());
            }
        }
        Some(Command::PurgeExpired(args)) | Some(Command::Migrate(args)) => {
            raw.apply_database_override(&args.database)
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
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
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(bytes) = overrides.cache_memory_max_bytes {
            self.cache.memory_max_bytes = Some(bytes);
        }
        if let Some(backend) = overrides.cache_kv_backend.as_ref() {
            self.cache.kv_backend = Some(backend.clone());
        }
        if let Some(limit) = overrides.cache_event_queue_limit {
            self.cache.event_queue_limit = Some(limit);
        }
        if let Some(interval) = overrides.cache_auto_consume_interval_ms {
            self.cache.auto_consume_interval_ms = Some(interval);
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
            server,
            logging,
            database,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let cache = build_cache_settings(cache)?;

        if cache.kv_backend == KvBackend::Postgres && database.url.is_none() {
            return Err(LoadError::invalid(
                "database.url",
                "required when cache.kv_backend is `postgres`",
            ));
        }

        Ok(Self {
            server,
            logging,
            database,
            cache,
        })
    }

    /// Runtime view of the cache section.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(&self.cache)
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let kv_backend = match cache.kv_backend.as_deref() {
        Some(value) => parse_kv_backend(value)?,
        None => defaults.kv_backend,
    };

    let memory_max_bytes = non_zero_usize(
        cache
            .memory_max_bytes
            .unwrap_or(defaults.memory_max_bytes as u64),
        "cache.memory_max_bytes",
    )?;
    let event_queue_limit = non_zero_usize(
        cache
            .event_queue_limit
            .unwrap_or(defaults.event_queue_limit as u64),
        "cache.event_queue_limit",
    )?;
    let consume_batch_limit = non_zero_usize(
        cache
            .consume_batch_limit
            .unwrap_or(defaults.consume_batch_limit as u64),
        "cache.consume_batch_limit",
    )?;
    let event_log_limit = usize::try_from(
        cache
            .event_log_limit
            .unwrap_or(defaults.event_log_limit as u64),
    )
    .map_err(|_| {
        LoadError::invalid(
            "cache.event_log_limit",
            "value exceeds supported range for usize",
        )
    })?;

    let auto_consume_ms = cache
        .auto_consume_interval_ms
        .unwrap_or(defaults.auto_consume_interval_ms);
    if auto_consume_ms == 0 || u128::from(auto_consume_ms) > MAX_TTL.as_millis() {
        return Err(LoadError::invalid(
            "cache.auto_consume_interval_ms",
            format!("must be between 1 and {}", MAX_TTL.as_millis()),
        ));
    }

    let purge_secs = cache
        .kv_purge_interval_seconds
        .unwrap_or(defaults.kv_purge_interval_secs);
    if purge_secs == 0 || purge_secs > MAX_TTL.as_secs() {
        return Err(LoadError::invalid(
            "cache.kv_purge_interval_seconds",
            format!("must be between 1 and {}", MAX_TTL.as_secs()),
        ));
    }

    for (name, profile) in &cache.profiles {
        if name.trim().is_empty() {
            return Err(LoadError::invalid(
                "cache.profiles",
                "profile names must not be empty",
            ));
        }
        match profile.ttl_seconds {
            Some(0) => {
                return Err(LoadError::invalid(
                    "cache.profiles",
                    format!("profile `{name}` ttl_seconds must be greater than zero"),
                ));
            }
            Some(seconds) if seconds > MAX_TTL.as_secs() => {
                return Err(LoadError::invalid(
                    "cache.profiles",
                    format!(
                        "profile `{name}` ttl_seconds must not exceed {}",
                        MAX_TTL.as_secs()
                    ),
                ));
            }
            _ => {}
        }
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        memory_max_bytes,
        kv_backend,
        event_queue_limit,
        event_log_limit,
        auto_consume_interval: Duration::from_millis(auto_consume_ms),
        consume_batch_limit,
        kv_purge_interval: Duration::from_secs(purge_secs),
        profiles: cache.profiles,
    })
}

fn parse_kv_backend(value: &str) -> Result<KvBackend, LoadError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Ok(KvBackend::None),
        "memory" => Ok(KvBackend::Memory),
        "postgres" => Ok(KvBackend::Postgres),
        other => Err(LoadError::invalid(
            "cache.kv_backend",
            format!("expected none, memory or postgres, got `{other}`"),
        )),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
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
struct RawCacheSettings {
    enabled: Option<bool>,
    memory_max_bytes: Option<u64>,
    kv_backend: Option<String>,
    event_queue_limit: Option<u64>,
    event_log_limit: Option<u64>,
    auto_consume_interval_ms: Option<u64>,
    consume_batch_limit: Option<u64>,
    kv_purge_interval_seconds: Option<u64>,
    profiles: BTreeMap<String, ProfileOverride>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
