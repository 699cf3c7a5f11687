use std::path::Path;

use upsync_core::db::Database;

use crate::commands::common::{
    format_pending_lines, now_millis, open_database, pending_change_to_item, StatusReport,
};
use crate::error::CliError;

pub fn run_status(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let pending = db.count_pending()?;
    let changes = db.list_pending(limit)?;
    let now_ms = now_millis();

    if as_json {
        let report = StatusReport {
            pending,
            changes: changes
                .iter()
                .map(|change| pending_change_to_item(change, now_ms))
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if pending == 0 {
        println!("No pending changes.");
        return Ok(());
    }

    println!("{pending} pending changes");
    for line in format_pending_lines(&changes, now_ms) {
        println!("{line}");
    }
    if pending > changes.len() {
        println!("... and {} more", pending - changes.len());
    }
    Ok(())
}
