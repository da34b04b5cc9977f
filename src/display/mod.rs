//! Display formatting for terminal output
//!
//! Formats backup records and statistics as tables and detail views.

pub mod backup;

pub use backup::{format_age, format_backup_details, format_backup_list, format_size, format_stats};
