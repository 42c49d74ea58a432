use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::{IsolationLevel, PoolConfig, DEFAULT_PLAN_CACHE_CAPACITY};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Database file path, `:memory:` or a `file:` URI.
    pub database: String,
    pub plan_cache_capacity: usize,
    /// Mode used by `BEGIN` for multi-statement transactions.
    pub transaction_isolation: IsolationLevel,
    /// Skip the dangerous-pattern warnings.
    pub allow_dangerous: bool,
    pub pool: PoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: String::from("sqlexec.db"),
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
            transaction_isolation: IsolationLevel::Deferred,
            allow_dangerous: false,
            pool: PoolConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn get_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlexec")
            .join("config.toml")
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file at the default location yields the defaults; an
    /// explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(path)?)?,
            None => {
                let path = Self::get_config_path();
                if !path.exists() {
                    return Ok(Self::default());
                }
                Self::from_toml(&std::fs::read_to_string(&path)?)?
            }
        };
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        if self.plan_cache_capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        Ok(())
    }
}
