use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the Strata binary.
#[derive(Debug, Parser)]
#[command(name = "strata", version, about = "Strata two-tier cache service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STRATA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache admin API and the background event consumer.
    Serve(Box<ServeArgs>),
    /// Remove every cached key matching a pattern from the durable tier.
    Invalidate(InvalidateArgs),
    /// Delete expired rows from the Postgres KV tier.
    #[command(name = "purge-expired")]
    PurgeExpired(DatabaseArgs),
    /// Apply the embedded SQL migrations.
    Migrate(DatabaseArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the durable tier (none|memory|postgres).
    #[arg(long = "cache-kv-backend", value_name = "BACKEND")]
    pub kv_backend: Option<String>,

    /// Restrict invalidation to one namespace.
    #[arg(long, value_name = "NAME")]
    pub namespace: Option<String>,

    /// Glob pattern: `*` matches any run of characters, `?` exactly one.
    #[arg(value_name = "PATTERN")]
    pub pattern: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Toggle the cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the memory tier byte budget.
    #[arg(long = "cache-memory-max-bytes", value_name = "BYTES")]
    pub cache_memory_max_bytes: Option<u64>,

    /// Override the durable tier (none|memory|postgres).
    #[arg(long = "cache-kv-backend", value_name = "BACKEND")]
    pub cache_kv_backend: Option<String>,

    /// Override the pending event queue limit.
    #[arg(long = "cache-event-queue-limit", value_name = "COUNT")]
    pub cache_event_queue_limit: Option<u64>,

    /// Override the background consume interval.
    #[arg(long = "cache-auto-consume-interval-ms", value_name = "MILLISECONDS")]
    pub cache_auto_consume_interval_ms: Option<u64>,
}
