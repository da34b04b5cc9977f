//! Tracing setup for the binary
//!
//! `RUST_LOG`, when set, overrides the verbosity flag.

use tracing_subscriber::EnvFilter;

use crate::error::{BackupError, BackupResult};

fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "pos_backup=debug"
    } else {
        "pos_backup=warn"
    }
}

/// Install a stderr subscriber; stdout is left to command output
pub fn init_logging(verbose: bool) -> BackupResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| BackupError::Configuration(format!("Failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(true), "pos_backup=debug");
        assert_eq!(default_filter(false), "pos_backup=warn");
    }
}
