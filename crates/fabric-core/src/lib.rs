//! fabric-core — shared primitives and configuration for the fabric twin.
//!
//! Everything here is dependency-light so that the state store, the
//! placement strategies, and the override merger can agree on the same
//! resource vector, health vocabulary, and `engine.toml` layout.

pub mod config;
pub mod types;

pub use config::{
    CostConfig, EngineConfig, EngineSettings, MergerConfig, NetworkDefaults, StrategyConfig,
    StrategyOverrides, canonical_strategy_name,
};
pub use types::*;
