//! Configuration management
//!
//! Node settings come from defaults, an optional TOML file and a few
//! environment variables, and are handed to constructors explicitly.

pub mod settings;

pub use settings::{NodeConfig, DEFAULT_MAX_PEERS};
