use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: Option<DatabaseConfig>,
    pub redis: Option<RedisConfig>,
    pub experiments: ExperimentsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_env")]
    pub env: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// `json` for structured logs, anything else for human-readable output
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,

    /// Assignment cache expiry; unset keeps entries until reset
    #[serde(default)]
    pub assignment_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentsConfig {
    #[serde(default = "default_confidence_level")]
    pub default_confidence_level: f64,

    #[serde(default = "default_goal_event")]
    pub default_goal_event: String,

    #[serde(default = "default_results_refresh_interval_secs")]
    pub results_refresh_interval_secs: u64,
}

fn default_app_env() -> String {
    "development".to_string()
}

fn default_service_name() -> String {
    "experiment-service".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_confidence_level() -> f64 {
    0.95
}

fn default_goal_event() -> String {
    crate::models::DEFAULT_GOAL_EVENT.to_string()
}

fn default_results_refresh_interval_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from the environment (and `.env` when present).
    ///
    /// Unparseable values fall back to their defaults; only an out-of-range
    /// confidence level is an error.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let app = AppConfig {
            env: env::var("APP_ENV").unwrap_or_else(|_| default_app_env()),
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| default_service_name()),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| default_log_format()),
        };

        let database = env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| DatabaseConfig {
                url,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_db_max_connections),
            });

        let redis = env::var("REDIS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| RedisConfig {
                url,
                assignment_ttl_secs: env::var("ASSIGNMENT_CACHE_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok()),
            });

        let experiments = ExperimentsConfig {
            default_confidence_level: env::var("DEFAULT_CONFIDENCE_LEVEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_confidence_level),
            default_goal_event: env::var("DEFAULT_GOAL_EVENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(default_goal_event),
            results_refresh_interval_secs: env::var("RESULTS_REFRESH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or_else(default_results_refresh_interval_secs),
        };

        let level = experiments.default_confidence_level;
        if !(level > 0.0 && level < 1.0) {
            anyhow::bail!("DEFAULT_CONFIDENCE_LEVEL must be between 0 and 1, got {}", level);
        }

        Ok(Self {
            app,
            database,
            redis,
            experiments,
        })
    }

    pub fn is_production(&self) -> bool {
        self.app.env == "production"
    }
}
