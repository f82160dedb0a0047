use std::path::PathBuf;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::jobs::{PoolConfig, QueueConfig};
use crate::mail::MailerConfig;

pub use config::ConfigError;

pub trait EnvConfig: Sized {
    fn from_env() -> Result<Self, ConfigError>;
    fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError>;
}

impl<D> EnvConfig for D
where
    D: DeserializeOwned,
{
    fn from_env() -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::default())
            .build()?
            .try_deserialize()
    }

    fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix(prefix))
            .build()?
            .try_deserialize()
    }
}

/// Everything the worker process needs, read once at startup.
///
/// Each section is deserialized from the same environment, so variable names
/// are flat (`REDIS_URL`, `WORKERS`, `SMTP_SERVER`, ...).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub mailer: MailerConfig,
    pub templates: TemplatesConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            queue: QueueConfig::from_env()?,
            pool: PoolConfig::from_env()?,
            mailer: MailerConfig::from_env()?,
            templates: TemplatesConfig::from_env()?,
        })
    }

    pub fn load_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            queue: QueueConfig::from_env_with_prefix(prefix)?,
            pool: PoolConfig::from_env_with_prefix(prefix)?,
            mailer: MailerConfig::from_env_with_prefix(prefix)?,
            templates: TemplatesConfig::from_env_with_prefix(prefix)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplatesConfig {
    /// Directory holding `<name>.html` templates (default: `templates`).
    #[serde(rename = "templates_dir", default = "default_templates_dir")]
    pub dir: PathBuf,
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

/// Deserialize a number that may arrive as a string, treating anything
/// unparseable as absent.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Int(n)) => n.to_string().parse().ok(),
        Some(Raw::Str(s)) => s.trim().parse().ok(),
        None => None,
    })
}
