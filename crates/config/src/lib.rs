//! Shared Fairing configuration types and constants.

pub mod config;
pub mod constants;

pub use config::{
    BuilderConfig, ConfigError, FairingConfig, ServiceType, ServingConfig, StorageConfig,
};
