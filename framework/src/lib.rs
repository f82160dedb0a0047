pub mod config;
pub mod events;
pub mod jobs;
pub mod mail;
pub mod shutdown;

pub use config::{AppConfig, EnvConfig};
