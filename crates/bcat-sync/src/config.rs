//! Process configuration, read from the environment once at startup.

use std::time::Duration;

use bcat_adapters::{CredentialRotator, SearchClientConfig, DEFAULT_ENDPOINT, MAX_PAGE_SIZE};
use bcat_core::SamplingMode;
use bcat_storage::{StoreError, TableRef};
use thiserror::Error;
use tracing::info;

use crate::terms::TermStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// What a run searches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestMode {
    /// Batch of terms sampled from one stored field.
    Sampled(TermStrategy),
    /// Legacy: one term from a randomly chosen field, both sort orders.
    Mixed,
    /// Operator-supplied keyword, both sort orders.
    Manual(String),
}

impl HarvestMode {
    pub fn sampling_mode(&self) -> SamplingMode {
        match self {
            HarvestMode::Sampled(TermStrategy::Title) => SamplingMode::Title,
            HarvestMode::Sampled(TermStrategy::Author) => SamplingMode::Author,
            HarvestMode::Sampled(TermStrategy::Publisher) => SamplingMode::Publisher,
            HarvestMode::Mixed => SamplingMode::Mixed,
            HarvestMode::Manual(_) => SamplingMode::Manual,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub schema: String,
    pub table: String,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let config = Self {
            database_url: env.required("DATABASE_URL")?,
            schema: env.optional("BCAT_DB_SCHEMA").unwrap_or_else(|| "public".to_string()),
            table: env.optional("BCAT_TABLE").unwrap_or_else(|| "raw_naver".to_string()),
        };
        config.table_ref()?;
        Ok(config)
    }

    pub fn table_ref(&self) -> Result<TableRef, ConfigError> {
        TableRef::new(&self.schema, &self.table).map_err(|err: StoreError| ConfigError::Invalid {
            name: "BCAT_DB_SCHEMA/BCAT_TABLE",
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub database: DatabaseConfig,
    pub credentials: CredentialRotator,
    pub search_endpoint: String,
    pub mode: HarvestMode,
    pub batch_size: usize,
    pub sample_size: usize,
    pub page_size: usize,
    pub requests_per_term: usize,
    pub both_sorts: bool,
    pub http_timeout_secs: u64,
}

impl HarvestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database = DatabaseConfig::from_lookup(&lookup)?;
        let env = Env(&lookup);

        let credentials = CredentialRotator::from_json(&env.required("BOOK_API_KEYS")?).map_err(
            |err| ConfigError::Invalid {
                name: "BOOK_API_KEYS",
                reason: err.to_string(),
            },
        )?;

        let mode = match env.optional("BCAT_MODE") {
            None => SamplingMode::Title,
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                name: "BCAT_MODE",
                reason,
            })?,
        };
        let mode = match mode {
            SamplingMode::Title => HarvestMode::Sampled(TermStrategy::Title),
            SamplingMode::Author => HarvestMode::Sampled(TermStrategy::Author),
            SamplingMode::Publisher => HarvestMode::Sampled(TermStrategy::Publisher),
            SamplingMode::Mixed => HarvestMode::Mixed,
            SamplingMode::Manual => HarvestMode::Manual(env.required("MANUAL_KEYWORD")?.trim().to_string()),
        };

        let page_size = env.number("BCAT_PAGE_SIZE", MAX_PAGE_SIZE)?;
        if page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid {
                name: "BCAT_PAGE_SIZE",
                reason: format!("must be between 1 and {MAX_PAGE_SIZE}"),
            });
        }

        Ok(Self {
            database,
            credentials,
            search_endpoint: env
                .optional("BCAT_SEARCH_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            mode,
            batch_size: env.number("BCAT_BATCH_SIZE", 5)?,
            sample_size: env.number("BCAT_SAMPLE_SIZE", 100)?,
            page_size,
            requests_per_term: env.number("BCAT_REQUESTS_PER_TERM", 10)?,
            both_sorts: env.flag("BCAT_BOTH_SORTS", false)?,
            http_timeout_secs: env.number("BCAT_HTTP_TIMEOUT_SECS", 20)?,
        })
    }

    pub fn search_client_config(&self) -> SearchClientConfig {
        SearchClientConfig {
            endpoint: self.search_endpoint.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(format!("bcat/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    /// Log the effective settings without the database URL or credentials.
    pub fn log_redacted(&self) {
        info!(
            mode = self.mode.sampling_mode().as_str(),
            table = %format!("{}.{}", self.database.schema, self.database.table),
            credentials = self.credentials.pool_size(),
            batch_size = self.batch_size,
            sample_size = self.sample_size,
            page_size = self.page_size,
            requests_per_term = self.requests_per_term,
            both_sorts = self.both_sorts,
            "harvest configuration loaded"
        );
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn number<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + PartialOrd + From<u8>,
    {
        let Some(raw) = self.optional(key) else {
            return Ok(default);
        };
        let value: T = raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name: key,
            reason: format!("`{raw}` is not a positive integer"),
        })?;
        if value < T::from(1) {
            return Err(ConfigError::Invalid {
                name: key,
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(value)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no") => Ok(false),
            Some(v) => Err(ConfigError::Invalid {
                name: key,
                reason: format!("`{v}` is not a boolean"),
            }),
        }
    }
}
