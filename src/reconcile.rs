use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::AppResult;
use crate::records::{upsert_coordinate, Coordinate, CoordinateRecord, Provider};
use crate::reports::{export_missing, GeocodeResultRow, ResultRows};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub applied: usize,
    pub applied_per_provider: BTreeMap<Provider, usize>,
    pub failed: usize,
    // unresolved lookups: no provider or no coordinate
    pub skipped: usize,
    pub remaining: usize,
}

enum RowOutcome {
    Apply(CoordinateRecord),
    Skip,
    Fail(&'static str),
}

pub fn apply(
    conn: &Connection,
    results: &ResultRows,
    queue_path: &Path,
) -> AppResult<ReconcileSummary> {
    let mut summary = ReconcileSummary {
        failed: results.unreadable,
        ..ReconcileSummary::default()
    };

    for row in &results.rows {
        match classify(row) {
            RowOutcome::Skip => summary.skipped += 1,
            RowOutcome::Fail(reason) => {
                warn!(target: "reconcile", web_id = %row.web_id, reason, "result rejected");
                summary.failed += 1;
            }
            RowOutcome::Apply(record) => match upsert_coordinate(conn, &record) {
                Ok(()) => {
                    summary.applied += 1;
                    *summary
                        .applied_per_provider
                        .entry(record.provider)
                        .or_default() += 1;
                }
                Err(err) => {
                    warn!(target: "reconcile", web_id = record.web_id, %err, "upsert failed");
                    summary.failed += 1;
                }
            },
        }
    }

    summary.remaining = export_missing(conn, queue_path)?;
    info!(
        target: "reconcile",
        applied = summary.applied,
        failed = summary.failed,
        skipped = summary.skipped,
        remaining = summary.remaining,
        "results reconciled"
    );
    Ok(summary)
}

fn classify(row: &GeocodeResultRow) -> RowOutcome {
    let Some(provider) = Provider::parse(&row.provider) else {
        return RowOutcome::Skip;
    };
    let (lat, lon) = (row.lat.trim(), row.lon.trim());
    if lat.is_empty() || lon.is_empty() {
        return RowOutcome::Skip;
    }
    let Ok(web_id) = row.web_id.trim().parse::<i64>() else {
        return RowOutcome::Fail("non-numeric web_id");
    };
    let coordinate = match (lat.parse::<f64>(), lon.parse::<f64>()) {
        (Ok(lat), Ok(lon)) => Coordinate::new(lat, lon),
        _ => None,
    };
    let Some(coordinate) = coordinate else {
        return RowOutcome::Fail("malformed coordinate");
    };
    let trace = serde_json::to_string(row).unwrap_or_else(|_| row.status.clone());

    RowOutcome::Apply(CoordinateRecord {
        web_id,
        provider,
        coordinate,
        location: row.address.clone(),
        trace,
    })
}
