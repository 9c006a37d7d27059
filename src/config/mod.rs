//! Configuration loading and parsing.
//!
//! This module provides YAML pipeline definitions and turns them into
//! runnable graphs.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::PipelineLoader;
pub use error::ConfigError;
pub use types::{
    DefaultsConfig, GroupConfig, ObjectStoreConfig, PipelineConfig, RetryConfig, StorageConfig,
    TaskConfig, TaskKindConfig, WarehouseConfig,
};
pub use yaml::YamlLoader;
