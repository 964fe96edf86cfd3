//! Infrastructure layer: background jobs, Postgres storage, locks, config.

pub mod config;
pub mod jobs;
pub mod lock;
pub mod postgres;

pub use config::{AppConfig, ConfigError};
