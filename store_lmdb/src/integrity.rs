//! LMDB database integrity checks.
//!
//! Run on startup to detect corruption before the engine accepts requests.
//! Every node, task and journal record is decoded; a record that no longer
//! decodes is reported rather than surfacing later as a runtime failure.

use std::path::Path;

use heed::types::Bytes;
use heed::Database;

use proxy_store::JournalEntry;
use proxy_types::{Node, PhysicalTask};

use crate::{decode, LmdbEnvironment, LmdbError};

/// Summary of an integrity check run.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub databases_checked: u32,
    pub total_entries: u64,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    /// Returns `true` if no errors were detected.
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }
}

fn check_records<T: serde::de::DeserializeOwned>(
    env: &LmdbEnvironment,
    name: &str,
    db: &Database<Bytes, Bytes>,
    report: &mut IntegrityReport,
) -> Result<(), LmdbError> {
    let rtxn = env.env.read_txn()?;
    report.databases_checked += 1;
    let iter = match db.iter(&rtxn) {
        Ok(iter) => iter,
        Err(e) => {
            report
                .errors
                .push(format!("failed to read database '{name}': {e}"));
            return Ok(());
        }
    };
    for entry in iter {
        match entry {
            Ok((key, val)) => {
                report.total_entries += 1;
                if let Err(e) = decode::<T>(val) {
                    report.errors.push(format!(
                        "undecodable record in '{name}' at key {}: {e}",
                        hex_prefix(key)
                    ));
                }
            }
            Err(e) => {
                report
                    .errors
                    .push(format!("cursor error in '{name}': {e}"));
                break;
            }
        }
    }
    Ok(())
}

fn hex_prefix(key: &[u8]) -> String {
    key.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Check LMDB database integrity on startup.
///
/// Read failures and undecodable records are collected in the report;
/// only a failure to open a read transaction is a hard error.
pub fn check_integrity(env: &LmdbEnvironment) -> Result<IntegrityReport, LmdbError> {
    let mut report = IntegrityReport::default();

    check_records::<Node>(env, "nodes", &env.nodes_db, &mut report)?;
    check_records::<PhysicalTask>(env, "tasks", &env.tasks_db, &mut report)?;
    check_records::<JournalEntry>(env, "journal", &env.journal_db, &mut report)?;

    let rtxn = env.env.read_txn()?;
    for (name, db) in [
        ("node_tasks", &env.node_tasks_db),
        ("idempotency", &env.idempotency_db),
        ("meta", &env.meta_db),
    ] {
        report.databases_checked += 1;
        match db.len(&rtxn) {
            Ok(count) => report.total_entries += count,
            Err(e) => report
                .errors
                .push(format!("failed to read database '{name}': {e}")),
        }
    }

    if report.is_healthy() {
        tracing::info!(
            databases = report.databases_checked,
            entries = report.total_entries,
            "store integrity check passed"
        );
    } else {
        tracing::error!(errors = report.errors.len(), "store integrity check failed");
    }
    Ok(report)
}

/// Check if the LMDB data directory looks valid before opening.
///
/// Returns `Ok(())` for a fresh (nonexistent) directory. Returns an error
/// if the directory exists but `data.mdb` is missing, which suggests
/// corruption or misconfiguration.
pub fn check_data_dir(path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Ok(());
    }
    let is_empty = path
        .read_dir()
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if is_empty {
        return Ok(());
    }
    let data_file = path.join("data.mdb");
    if !data_file.exists() {
        return Err(format!(
            "LMDB directory exists but data.mdb is missing at {}",
            path.display()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_data_dir_fresh_path() {
        let result = check_data_dir(Path::new("/tmp/proxy_test_nonexistent_12345"));
        assert!(result.is_ok());
    }

    #[test]
    fn unhealthy_report() {
        let report = IntegrityReport {
            databases_checked: 5,
            total_entries: 100,
            errors: vec!["corruption detected".to_string()],
        };
        assert!(!report.is_healthy());
        assert!(IntegrityReport::default().is_healthy());
    }
}
