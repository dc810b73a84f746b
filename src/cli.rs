//! Command-line interface definitions using clap derive macros.
//!
//! Contains the top-level [`Cli`] parser, the [`Commands`] enum for
//! subcommands (run, validate, health), and their associated argument
//! structs. Every `run` flag has an environment variable equivalent for
//! container deployments.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "inference-router",
    version,
    about = "Traffic-control plane for multi-tenant inference serving",
    propagate_version = true,
    after_help = "\x1b[1mQuick start:\x1b[0m\n  \
        inference-router validate policies.yaml\n  \
        inference-router run --policy-file policies.yaml \\\n      \
        --backend-endpoints 'gpu-a:http://10.0.0.5:9000,gpu-b:http://10.0.0.6:9000'"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the router
    Run(Box<RunArgs>),

    /// Validate a policy seed file without starting
    Validate(ValidateArgs),

    /// Check health of a running instance
    Health(HealthArgs),
}

#[derive(Args)]
#[command(after_help = "\x1b[1mExamples:\x1b[0m\n  \
        inference-router run --policy-file policies.yaml --pretty\n  \
        inference-router run --config-store-endpoint http://etcd:2379\n  \
        inference-router run --rate-limit-redis-url redis://cache:6379")]
pub struct RunArgs {
    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Listen address
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    // -- Policies --
    /// etcd endpoint of the config store
    #[cfg(feature = "etcd")]
    #[arg(long, env = "CONFIG_STORE_ENDPOINT", help_heading = "Policies")]
    pub config_store_endpoint: Option<String>,

    /// Policy seed file (.yaml, .json), used as the config store when no etcd endpoint is set
    #[arg(long, env = "POLICY_FILE", help_heading = "Policies")]
    pub policy_file: Option<PathBuf>,

    /// Follow config store changes
    #[arg(
        long,
        env = "CONFIG_WATCH_ENABLED",
        default_value_t = true,
        action = ArgAction::Set,
        help_heading = "Policies"
    )]
    pub config_watch_enabled: bool,

    /// SQLite file holding the last-known policies
    #[arg(
        long,
        env = "CONFIG_CACHE_PATH",
        default_value = "./router-policy-cache.db",
        help_heading = "Policies"
    )]
    pub config_cache_path: PathBuf,

    /// Poll interval of the policy seed file in seconds
    #[arg(
        long,
        env = "POLICY_POLL_INTERVAL_SECS",
        default_value_t = 5,
        help_heading = "Policies"
    )]
    pub policy_poll_interval: u64,

    /// Bound on every config store call in milliseconds
    #[arg(
        long,
        env = "CONFIG_STORE_TIMEOUT_MS",
        default_value_t = 5000,
        help_heading = "Policies"
    )]
    pub config_store_timeout_ms: u64,

    // -- Backends --
    /// Comma-separated `id:uri` list
    #[arg(
        long,
        env = "BACKEND_ENDPOINTS",
        default_value = "",
        help_heading = "Backends"
    )]
    pub backend_endpoints: String,

    /// Default per-backend timeout in milliseconds
    #[arg(
        long,
        env = "BACKEND_TIMEOUT_MS",
        default_value_t = 30_000,
        help_heading = "Backends"
    )]
    pub backend_timeout_ms: u64,

    /// Health probe period in seconds
    #[arg(
        long,
        env = "HEALTH_CHECK_INTERVAL_SECS",
        default_value_t = 10,
        help_heading = "Backends"
    )]
    pub health_check_interval_secs: u64,

    /// Consecutive failures before a backend is unhealthy
    #[arg(
        long,
        env = "UNHEALTHY_THRESHOLD",
        default_value_t = 3,
        help_heading = "Backends"
    )]
    pub unhealthy_threshold: u32,

    // -- Admission --
    /// Shared rate-limit store; a process-local store is used when absent
    #[cfg(feature = "redis")]
    #[arg(long, env = "RATE_LIMIT_REDIS_URL", help_heading = "Admission")]
    pub rate_limit_redis_url: Option<String>,

    /// Sustained requests per second per organization and per API key
    #[arg(
        long,
        env = "RATE_LIMIT_DEFAULT_RPS",
        default_value_t = 100.0,
        value_parser = parse_rate,
        help_heading = "Admission"
    )]
    pub rate_limit_default_rps: f64,

    /// Token bucket capacity
    #[arg(
        long,
        env = "RATE_LIMIT_BURST_SIZE",
        default_value_t = 200,
        help_heading = "Admission"
    )]
    pub rate_limit_burst_size: u32,

    /// Budget service base URL; every request is allowed when absent
    #[arg(long, env = "BUDGET_SERVICE_ENDPOINT", help_heading = "Admission")]
    pub budget_service_endpoint: Option<String>,

    /// Budget check timeout in milliseconds
    #[arg(
        long,
        env = "BUDGET_SERVICE_TIMEOUT_MS",
        default_value_t = 2000,
        help_heading = "Admission"
    )]
    pub budget_service_timeout_ms: u64,

    /// Flat cost estimate per 1000 tokens
    #[arg(
        long,
        env = "COST_PER_1K_TOKENS",
        default_value_t = 0.002,
        help_heading = "Admission"
    )]
    pub cost_per_1k_tokens: f64,

    // -- Usage --
    /// Directory of the durable usage queue
    #[arg(
        long,
        env = "USAGE_BUFFER_DIR",
        default_value = "./usage-buffer",
        help_heading = "Usage"
    )]
    pub usage_buffer_dir: PathBuf,

    /// HTTP endpoint receiving usage batches
    #[arg(long, env = "USAGE_PUBLISH_URL", help_heading = "Usage")]
    pub usage_publish_url: Option<String>,

    /// Redis stream receiving usage records (uses --usage-redis-url)
    #[cfg(feature = "redis")]
    #[arg(long, env = "USAGE_REDIS_STREAM", help_heading = "Usage")]
    pub usage_redis_stream: Option<String>,

    /// Redis server for the usage stream
    #[cfg(feature = "redis")]
    #[arg(
        long,
        env = "USAGE_REDIS_URL",
        default_value = "redis://127.0.0.1:6379",
        help_heading = "Usage"
    )]
    pub usage_redis_url: String,

    /// Flush period in milliseconds
    #[arg(
        long,
        env = "USAGE_FLUSH_INTERVAL_MS",
        default_value_t = 1000,
        help_heading = "Usage"
    )]
    pub usage_flush_interval_ms: u64,

    /// Records per published batch
    #[arg(
        long,
        env = "USAGE_BATCH_SIZE",
        default_value_t = 100,
        help_heading = "Usage"
    )]
    pub usage_batch_size: usize,

    // -- Logging --
    /// Log level
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Force pretty (human-readable) log output
    #[arg(long)]
    pub pretty: bool,

    /// Force JSON log output (overrides TTY detection)
    #[arg(long, conflicts_with = "pretty")]
    pub json: bool,

    // -- Observability --
    /// Sentry DSN (enables error tracking)
    #[cfg(feature = "sentry-integration")]
    #[arg(long, env = "SENTRY_DSN", help_heading = "Observability")]
    pub sentry_dsn: Option<String>,

    /// Sentry environment tag
    #[cfg(feature = "sentry-integration")]
    #[arg(long, env = "SENTRY_ENVIRONMENT", help_heading = "Observability")]
    pub sentry_environment: Option<String>,

    // -- Tuning --
    /// Max request body size in bytes
    #[arg(
        long,
        env = "MAX_BODY_SIZE",
        default_value_t = 1_048_576,
        help_heading = "Tuning"
    )]
    pub max_body: usize,
}

/// A refill rate must be a finite number above zero.
fn parse_rate(raw: &str) -> Result<f64, String> {
    let rate: f64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("'{raw}' is not a number: {e}"))?;
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(format!("'{raw}' must be a finite number greater than zero"))
    }
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Policy seed file to validate
    #[arg(default_value = "policies.yaml")]
    pub policy_file: PathBuf,

    /// Output format
    #[arg(long, default_value = "text")]
    pub format: ValidateFormat,
}

#[derive(Args)]
pub struct HealthArgs {
    /// URL of the running instance
    #[arg(default_value = "http://localhost:8080")]
    pub url: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn to_tracing_level(&self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Clone, Debug, ValueEnum)]
pub enum ValidateFormat {
    Text,
    Json,
}
