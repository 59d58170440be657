//! Configuration management
//!
//! Node settings come from built-in defaults, an optional TOML file and
//! environment variables, in that order of precedence.

pub mod settings;

pub use settings::{Config, DifficultyAdjustment};
