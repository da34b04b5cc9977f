//! Backup display formatting
//!
//! Formats backup records and statistics for terminal output in table and
//! detail views.

use chrono::{DateTime, Utc};

use crate::models::{BackupRecord, BackupStats};

/// Format a list of backups as a table, newest first as given
pub fn format_backup_list(records: &[BackupRecord], verbose: bool) -> String {
    if records.is_empty() {
        return "No backups found.\nCreate one with: pos-backup backup create".to_string();
    }

    let now = Utc::now();
    let id_width = if verbose { 36 } else { 12 };

    let mut output = String::new();
    output.push_str(&format!(
        "{:<id_width$}  {:<20}  {:<9}  {:<9}  {:>10}  {:>6}\n",
        "ID",
        "Created",
        "Type",
        "Status",
        "Size",
        "Age",
        id_width = id_width,
    ));
    output.push_str(&format!(
        "{:-<id_width$}  {:-<20}  {:-<9}  {:-<9}  {:->10}  {:->6}\n",
        "",
        "",
        "",
        "",
        "",
        "",
        id_width = id_width,
    ));

    for record in records {
        let id = if verbose {
            record.id.full()
        } else {
            record.id.to_string()
        };
        let size = if record.size > 0 {
            format_size(record.size)
        } else {
            "-".to_string()
        };
        output.push_str(&format!(
            "{:<id_width$}  {:<20}  {:<9}  {:<9}  {:>10}  {:>6}\n",
            id,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.backup_type.to_string(),
            record.status.to_string(),
            size,
            format_age(record.timestamp, now),
            id_width = id_width,
        ));

        if verbose {
            if let Some(reason) = &record.reason {
                output.push_str(&format!("  reason: {}\n", reason));
            }
            if let Some(error) = &record.error {
                output.push_str(&format!("  error:  {}\n", error));
            }
        }
    }

    output.push_str(&format!("\nTotal: {} backup(s)", records.len()));
    output
}

/// Format a single backup in detail
pub fn format_backup_details(record: &BackupRecord) -> String {
    let mut output = String::new();

    output.push_str("Backup Details\n");
    output.push_str("==============\n");
    output.push_str(&format!("ID:        {}\n", record.id.full()));
    output.push_str(&format!("Type:      {}\n", record.backup_type));
    output.push_str(&format!("Status:    {}\n", record.status));
    output.push_str(&format!(
        "Created:   {}\n",
        record.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    output.push_str(&format!("File:      {}\n", record.path.display()));
    output.push_str(&format!("Encrypted: {}\n", if record.encrypted { "Yes" } else { "No" }));

    if record.size > 0 {
        output.push_str(&format!("Size:      {}\n", format_size(record.size)));
    }
    if let Some(checksum) = &record.checksum {
        output.push_str(&format!("Checksum:  {}\n", checksum));
    }
    if let Some(ratio) = record.compression_ratio {
        output.push_str(&format!("Ratio:     {:.2}\n", ratio));
    }
    if let Some(duration) = record.duration_ms {
        output.push_str(&format!("Duration:  {}\n", format_duration_ms(duration)));
    }
    if let Some(version) = &record.database_version {
        output.push_str(&format!("Tool:      {}\n", version));
    }
    if let Some(created_by) = &record.created_by {
        output.push_str(&format!("By:        {}\n", created_by));
    }
    if let Some(branch) = &record.branch_id {
        output.push_str(&format!("Branch:    {}\n", branch));
    }
    if let Some(reason) = &record.reason {
        output.push_str(&format!("Reason:    {}\n", reason));
    }
    if let Some(restored_at) = record.restored_at {
        output.push_str(&format!(
            "Restored:  {} by {}\n",
            restored_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.restored_by.as_deref().unwrap_or("unknown")
        ));
    }
    if let Some(error) = &record.error {
        output.push_str(&format!("Error:     {}\n", error));
    }

    output
}

/// Format aggregate statistics
pub fn format_stats(stats: &BackupStats) -> String {
    let mut output = String::new();

    output.push_str("Backup Statistics\n");
    output.push_str("=================\n");
    output.push_str(&format!(
        "Total:      {} ({} completed, {} failed, {} in progress)\n",
        stats.total,
        stats.completed,
        stats.failed,
        stats.pending + stats.running
    ));
    output.push_str(&format!(
        "By type:    {} manual, {} scheduled, {} automatic\n",
        stats.manual, stats.scheduled, stats.automatic
    ));
    output.push_str(&format!("Disk usage: {}\n", format_size(stats.total_size)));

    if let Some(avg) = stats.average_duration_ms {
        output.push_str(&format!("Avg time:   {}\n", format_duration_ms(avg)));
    }
    output.push_str(&format!("Last run:   {}\n", format_timestamp(stats.last_backup_at)));
    output.push_str(&format!(
        "Last good:  {}\n",
        format_timestamp(stats.last_successful_at)
    ));

    output
}

fn format_timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Format a file size in human-readable form
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Coarse age of a timestamp relative to `now`
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let total_seconds = now.signed_duration_since(at).num_seconds().max(0);

    if total_seconds < 60 {
        return format!("{}s", total_seconds);
    }

    let minutes = total_seconds / 60;
    if minutes < 60 {
        return format!("{}m", minutes);
    }

    let hours = minutes / 60;
    if hours < 24 {
        return format!("{}h", hours);
    }

    let days = hours / 24;
    if days < 30 {
        return format!("{}d", days);
    }

    format!("{}mo", days / 30)
}

fn format_duration_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{} ms", ms)
    } else {
        format!("{:.1} s", ms as f64 / 1000.0)
    }
}
