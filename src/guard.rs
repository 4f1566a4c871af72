use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::db::count_observations;
use crate::errors::AppResult;

// The copy is not atomic against other writers of the live store.
#[derive(Debug, Clone)]
pub struct GuardPaths {
    pub live: PathBuf,
    pub backup: PathBuf,
    pub pre_restore: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GuardDecision {
    NoAction,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardReport {
    pub decision: GuardDecision,
    // None: missing or unreadable, not zero
    pub live_count: Option<u64>,
    pub backup_count: Option<u64>,
    pub snapshot_created: bool,
    pub restored_count: Option<u64>,
}

fn observed_count(path: &Path) -> Option<u64> {
    match count_observations(path) {
        Ok(count) => count,
        Err(err) => {
            warn!(target: "guard", path = %path.display(), %err, "store unreadable");
            None
        }
    }
}

pub fn inspect(paths: &GuardPaths) -> (GuardDecision, Option<u64>, Option<u64>) {
    let live = observed_count(&paths.live);
    let backup = observed_count(&paths.backup);
    let decision = match backup {
        Some(backup) if backup > live.unwrap_or(0) => GuardDecision::Restore,
        _ => GuardDecision::NoAction,
    };
    (decision, live, backup)
}

pub fn run(paths: &GuardPaths) -> AppResult<GuardReport> {
    let (decision, live_count, backup_count) = inspect(paths);
    info!(
        target: "guard",
        live = ?live_count,
        backup = ?backup_count,
        decision = ?decision,
        "store counts inspected"
    );

    let mut report = GuardReport {
        decision,
        live_count,
        backup_count,
        snapshot_created: false,
        restored_count: None,
    };
    if decision == GuardDecision::NoAction {
        return Ok(report);
    }

    if paths.live.exists() {
        if paths.pre_restore.exists() {
            info!(
                target: "guard",
                path = %paths.pre_restore.display(),
                "pre-restore snapshot already present; keeping it"
            );
        } else {
            fs::copy(&paths.live, &paths.pre_restore)?;
            report.snapshot_created = true;
            info!(target: "guard", path = %paths.pre_restore.display(), "pre-restore snapshot created");
        }
    }

    fs::copy(&paths.backup, &paths.live)?;
    report.restored_count = observed_count(&paths.live);
    info!(
        target: "guard",
        old = ?live_count,
        new = ?report.restored_count,
        "backup restored over live store"
    );
    Ok(report)
}
