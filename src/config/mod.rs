//! Configuration module for the backup engine
//!
//! This module provides configuration management including:
//! - XDG-compliant path resolution
//! - Settings persistence with environment overrides

pub mod paths;
pub mod settings;

pub use paths::EnginePaths;
pub use settings::{ConnectionConfig, Settings, ToolSettings};
