use std::str::FromStr;
use std::time::Duration;

use sandbox::docker::DockerConfig;
use sandbox::{CapabilityRegistry, ProviderKind};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_LANGUAGES: &[&str] = &["python", "node", "bash", "c"];
pub const DEFAULT_INITIAL_POOL_SIZE: usize = 5;
pub const DEFAULT_MAX_POOL_SIZE: usize = 20;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_INFLIGHT: usize = 128;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}: invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Canonical names, in configuration order.
    pub languages: Vec<String>,
    pub initial_pool_size: usize,
    pub max_pool_size: usize,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_inflight: usize,
    pub max_output_bytes: usize,
    pub session_idle_timeout: Option<Duration>,
    pub provider: ProviderKind,
    pub docker: DockerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            languages: DEFAULT_LANGUAGES.iter().map(|l| (*l).to_owned()).collect(),
            initial_pool_size: DEFAULT_INITIAL_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_timeout: Duration::from_secs(DEFAULT_MAX_TIMEOUT_SECS),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            session_idle_timeout: None,
            provider: ProviderKind::Docker,
            docker: DockerConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(host) = get("HOST") {
            config.host = host;
        }
        config.port = parse_or(&get, "PORT", config.port)?;
        if let Some(languages) = get("SUPPORTED_LANGUAGES") {
            config.languages = canonical_languages(&languages)?;
        }
        config.initial_pool_size =
            parse_or(&get, "INITIAL_POOL_SIZE", config.initial_pool_size)?;
        config.max_pool_size = parse_or(&get, "MAX_POOL_SIZE", config.max_pool_size)?;
        config.default_timeout = Duration::from_secs(parse_or(
            &get,
            "DEFAULT_TIMEOUT_SECS",
            DEFAULT_TIMEOUT_SECS,
        )?);
        config.max_timeout = Duration::from_secs(parse_or(
            &get,
            "MAX_TIMEOUT_SECS",
            DEFAULT_MAX_TIMEOUT_SECS,
        )?);
        config.max_inflight = parse_or(&get, "MAX_INFLIGHT", config.max_inflight)?;
        config.max_output_bytes = parse_or(&get, "MAX_OUTPUT_BYTES", config.max_output_bytes)?;
        config.session_idle_timeout = match get("SESSION_IDLE_TIMEOUT_SECS") {
            Some(value) => match value.parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => return Err(invalid("SESSION_IDLE_TIMEOUT_SECS", value)),
            },
            None => None,
        };
        if let Some(provider) = get("SANDBOX_PROVIDER") {
            config.provider = provider
                .parse()
                .map_err(|_| invalid("SANDBOX_PROVIDER", provider))?;
        }
        if let Some(image) = get("SANDBOX_IMAGE") {
            config.docker.image = image;
        }
        // Set but empty turns the alternative runtime off.
        if let Some(runtime) = lookup("SANDBOX_RUNTIME") {
            let runtime = runtime.trim();
            config.docker.runtime = (!runtime.is_empty()).then(|| runtime.to_owned());
        }
        if let Some(memory) = get("SANDBOX_MEMORY") {
            config.docker.memory = memory;
        }
        config.docker.pids_limit = parse_or(&get, "SANDBOX_PIDS_LIMIT", config.docker.pids_limit)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::Inconsistent(
                "MAX_POOL_SIZE must be at least 1".to_owned(),
            ));
        }
        if self.initial_pool_size > self.max_pool_size {
            return Err(ConfigError::Inconsistent(format!(
                "INITIAL_POOL_SIZE ({}) exceeds MAX_POOL_SIZE ({})",
                self.initial_pool_size, self.max_pool_size
            )));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::Inconsistent(
                "DEFAULT_TIMEOUT_SECS must be positive".to_owned(),
            ));
        }
        if self.default_timeout > self.max_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "DEFAULT_TIMEOUT_SECS ({}) exceeds MAX_TIMEOUT_SECS ({})",
                self.default_timeout.as_secs(),
                self.max_timeout.as_secs()
            )));
        }
        if self.languages.is_empty() {
            return Err(ConfigError::Inconsistent(
                "SUPPORTED_LANGUAGES must name at least one language".to_owned(),
            ));
        }
        if self.max_inflight == 0 {
            return Err(ConfigError::Inconsistent(
                "MAX_INFLIGHT must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// How many idle sandboxes to warm for each language at startup. The
    /// initial size is spread evenly, earlier languages taking the remainder.
    pub fn warm_plan(&self) -> Vec<(String, usize)> {
        let count = self.languages.len().max(1);
        let base = self.initial_pool_size / count;
        let extra = self.initial_pool_size % count;
        self.languages
            .iter()
            .enumerate()
            .map(|(index, language)| (language.clone(), base + usize::from(index < extra)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

fn canonical_languages(raw: &str) -> Result<Vec<String>, ConfigError> {
    let requested: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|language| !language.is_empty())
        .collect();
    let registry = CapabilityRegistry::builtin_subset(&requested)
        .map_err(|err| invalid("SUPPORTED_LANGUAGES", err.0))?;
    Ok(registry.languages().map(str::to_owned).collect())
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value.parse().map_err(|_| invalid(name, value)),
        None => Ok(default),
    }
}

fn invalid(name: &'static str, value: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.into(),
    }
}
