use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
///
/// Only the enumerated environment variables change behaviour; everything
/// else is a tuning knob with a safe default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Port the HTTP front-end binds to. Carried here so the whole service
    /// configuration lives in one place; the engine itself never listens.
    pub port: u16,
    /// Path of the embedded store file.
    pub store_path: PathBuf,
    /// Budget for the health probe against both providers.
    pub healthcheck_timeout: Duration,
    /// Bound on any single food/worker provider call.
    pub provider_timeout: Duration,
    /// Store-commit attempts inside a timer handler before the task fails.
    pub timer_retry_attempts: u32,
    /// Back-off between those attempts.
    pub timer_retry_backoff: Duration,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
    /// Endpoint of the environment (food) provider, when remote.
    pub food_provider_url: Option<String>,
    /// Endpoint of the worker (queen) provider, when remote.
    pub worker_provider_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            store_path: PathBuf::from("recoleccion.db"),
            healthcheck_timeout: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(5),
            timer_retry_attempts: 3,
            timer_retry_backoff: Duration::from_millis(500),
            event_buffer: 256,
            food_provider_url: None,
            worker_provider_url: None,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Read the enumerated environment variables over the defaults.
    /// Unparseable values fall back to the default rather than aborting.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(path) = std::env::var("STORE_PATH") {
            config.store_path = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var("HEALTHCHECK_TIMEOUT_SEC") {
            if let Ok(secs) = secs.parse() {
                config.healthcheck_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(url) = std::env::var("ENTORNO_API_URL") {
            config.food_provider_url = Some(url);
        }
        if let Ok(url) = std::env::var("COMUNICACION_API_URL") {
            config.worker_provider_url = Some(url);
        }
        config
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.provider_timeout.is_zero() {
            return Err("provider_timeout must be greater than zero".to_string());
        }
        if self.healthcheck_timeout.is_zero() {
            return Err("healthcheck_timeout must be greater than zero".to_string());
        }
        if self.timer_retry_attempts == 0 {
            return Err("timer_retry_attempts must be greater than zero".to_string());
        }
        if self.event_buffer == 0 {
            return Err("event_buffer must be greater than zero".to_string());
        }
        if self.store_path.as_os_str().is_empty() {
            return Err("store_path must not be empty".to_string());
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_path = path.into();
        self
    }

    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.config.provider_timeout = timeout;
        self
    }

    pub fn healthcheck_timeout(mut self, timeout: Duration) -> Self {
        self.config.healthcheck_timeout = timeout;
        self
    }

    pub fn timer_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.config.timer_retry_attempts = attempts;
        self.config.timer_retry_backoff = backoff;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity;
        self
    }

    pub fn build(self) -> std::result::Result<EngineConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
