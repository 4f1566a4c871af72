use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::address::normalize;
use crate::errors::{AppError, AppResult};
use crate::records::{
    load_observation, load_pending, mark_no_geocode, mark_processed, upsert_coordinate,
    CoordinateRecord, ObservationRecord, Provider,
};
use crate::reports::{
    read_missing_queue, write_cleaned, write_no_geocode, CleanedRow, GeocodeResultRow,
    NoGeocodeRow, ResultsWriter, NO_GEOCODE_REASON,
};
use crate::resolver::{GeocodeResolver, ResolveRequest, Resolution};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrepareSummary {
    pub cleaned: usize,
    pub marked_no_geocode: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GeocodeSummary {
    pub processed: usize,
    pub resolved_per_provider: BTreeMap<Provider, usize>,
    pub unresolved: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl GeocodeSummary {
    fn record(&mut self, resolution: &Resolution) {
        self.processed += 1;
        match resolution.provider() {
            Some(provider) => *self.resolved_per_provider.entry(provider).or_default() += 1,
            None => self.unresolved += 1,
        }
    }

    pub fn resolved(&self) -> usize {
        self.resolved_per_provider.values().sum()
    }
}

pub struct PreparePaths<'a> {
    pub queue: &'a Path,
    pub cleaned: &'a Path,
    pub no_geocode: &'a Path,
}

pub fn prepare_missing(
    conn: &Connection,
    paths: &PreparePaths<'_>,
    default_locality: &str,
    country: &str,
) -> AppResult<Option<PrepareSummary>> {
    let Some(queue) = read_missing_queue(paths.queue)? else {
        info!(target: "batch", path = %paths.queue.display(), "no queue to prepare");
        return Ok(None);
    };

    let mut cleaned_rows = Vec::with_capacity(queue.rows.len());
    let mut no_geocode_rows = Vec::new();
    for row in &queue.rows {
        let normalized = normalize(row.get("strasse"));
        let plz = row.get("plz").trim().to_string();
        let ort = match row.get("ort").trim() {
            "" => default_locality.to_string(),
            value => value.to_string(),
        };
        let address = [normalized.canonical.as_str(), plz.as_str(), ort.as_str(), country]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        if !normalized.has_house_number() {
            if let Err(err) = mark_no_geocode(conn, row.web_id) {
                warn!(target: "batch", web_id = row.web_id, %err, "could not flag record");
            }
            no_geocode_rows.push(NoGeocodeRow {
                web_id: row.web_id,
                reason: NO_GEOCODE_REASON.to_string(),
            });
        }
        cleaned_rows.push(CleanedRow {
            web_id: row.web_id,
            cleaned: normalized.canonical.clone(),
            plz,
            ort,
            address,
            flags: normalized.flags.to_string(),
        });
    }

    write_cleaned(paths.cleaned, &cleaned_rows)?;
    write_no_geocode(paths.no_geocode, &no_geocode_rows)?;
    let summary = PrepareSummary {
        cleaned: cleaned_rows.len(),
        marked_no_geocode: no_geocode_rows.len(),
    };
    info!(
        target: "batch",
        cleaned = summary.cleaned,
        no_geocode = summary.marked_no_geocode,
        "queue prepared"
    );
    Ok(Some(summary))
}

pub async fn geocode_missing_file(
    resolver: &GeocodeResolver,
    queue_path: &Path,
    results_path: &Path,
) -> AppResult<GeocodeSummary> {
    let queue = read_missing_queue(queue_path)?
        .ok_or_else(|| AppError::MissingInput(queue_path.display().to_string()))?;
    let mut writer = ResultsWriter::create(results_path)?;
    let mut summary = GeocodeSummary {
        failed: queue.unreadable,
        ..GeocodeSummary::default()
    };
    let total = queue.rows.len();

    for row in &queue.rows {
        let request = ResolveRequest {
            web_id: row.web_id,
            street: normalize(row.get("strasse")).canonical,
            plz: row.get("plz").to_string(),
            ort: row.get("ort").to_string(),
        };
        let resolution = resolver.resolve(&request).await;
        writer.append(&result_row(&resolution))?;
        summary.record(&resolution);
        if summary.processed % 25 == 0 {
            info!(target: "batch", processed = summary.processed, total, "progress");
        }
    }

    info!(
        target: "batch",
        processed = summary.processed,
        resolved = summary.resolved(),
        unresolved = summary.unresolved,
        unreadable = summary.failed,
        "missing queue geocoded"
    );
    Ok(summary)
}

pub async fn geocode_pending(
    conn: &Connection,
    resolver: &GeocodeResolver,
    limit: Option<usize>,
) -> AppResult<GeocodeSummary> {
    let pending = load_pending(conn, limit)?;
    let mut summary = GeocodeSummary::default();
    info!(target: "batch", pending = pending.len(), "geocoding new records");

    for record in &pending {
        if record.no_geocode {
            summary.skipped += 1;
            if let Err(err) = mark_processed(conn, record.web_id) {
                warn!(target: "batch", web_id = record.web_id, %err, "could not clear new flag");
                summary.failed += 1;
            }
            continue;
        }

        let resolution = resolver.resolve(&request_for(record)).await;
        summary.record(&resolution);
        let stored = store_resolution(conn, &resolution)
            .and_then(|_| mark_processed(conn, record.web_id));
        if let Err(err) = stored {
            warn!(target: "batch", web_id = record.web_id, %err, "could not persist record");
            summary.failed += 1;
        }
    }

    info!(
        target: "batch",
        processed = summary.processed,
        resolved = summary.resolved(),
        skipped = summary.skipped,
        failed = summary.failed,
        "new records geocoded"
    );
    Ok(summary)
}

pub async fn geocode_single(
    conn: &Connection,
    resolver: &GeocodeResolver,
    web_id: i64,
) -> AppResult<Option<Resolution>> {
    let Some(record) = load_observation(conn, web_id)? else {
        warn!(target: "batch", web_id, "no record with this identifier");
        return Ok(None);
    };
    let resolution = resolver.resolve(&request_for(&record)).await;
    store_resolution(conn, &resolution)?;
    info!(
        target: "batch",
        web_id,
        status = resolution.status.as_str(),
        provider = resolution.provider().map(|p| p.as_str()).unwrap_or("none"),
        "single record geocoded"
    );
    Ok(Some(resolution))
}

fn request_for(record: &ObservationRecord) -> ResolveRequest {
    ResolveRequest {
        web_id: record.web_id,
        street: normalize(&record.strasse).canonical,
        plz: record.plz.clone(),
        ort: record.ort.clone(),
    }
}

fn store_resolution(conn: &Connection, resolution: &Resolution) -> AppResult<()> {
    let Some(resolved) = &resolution.resolved else {
        return Ok(());
    };
    upsert_coordinate(
        conn,
        &CoordinateRecord {
            web_id: resolution.web_id,
            provider: resolved.provider,
            coordinate: resolved.hit.coordinate,
            location: resolved.hit.location.clone(),
            trace: resolved.hit.trace.clone(),
        },
    )
}

fn result_row(resolution: &Resolution) -> GeocodeResultRow {
    let (provider, lat, lon) = match &resolution.resolved {
        Some(resolved) => (
            resolved.provider.as_str().to_string(),
            resolved.hit.coordinate.lat.to_string(),
            resolved.hit.coordinate.lon.to_string(),
        ),
        None => ("none".to_string(), String::new(), String::new()),
    };
    GeocodeResultRow {
        web_id: resolution.web_id.to_string(),
        address: resolution.attempted_address.clone(),
        provider,
        lat,
        lon,
        status: resolution.status.as_str().to_string(),
    }
}
