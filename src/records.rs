use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Osm,
    Google,
}

impl Provider {
    // open provider wins; commercial only fills gaps
    pub const PREFERENCE: [Provider; 2] = [Provider::Osm, Provider::Google];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Osm => "osm",
            Provider::Google => "google",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Provider::Osm => "geolocation_osm",
            Provider::Google => "geolocation_google",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "osm" => Some(Provider::Osm),
            "google" => Some(Provider::Google),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservationRecord {
    pub web_id: i64,
    pub strasse: String,
    pub plz: String,
    pub ort: String,
    pub is_new: bool,
    pub no_geocode: bool,
}

impl ObservationRecord {
    pub fn field(&self, column: &str) -> Option<String> {
        match column {
            "web_id" => Some(self.web_id.to_string()),
            "strasse" => Some(self.strasse.clone()),
            "plz" => Some(self.plz.clone()),
            "ort" => Some(self.ort.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        (lat.is_finite() && lon.is_finite()).then_some(Self { lat, lon })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinateRecord {
    pub web_id: i64,
    pub provider: Provider,
    pub coordinate: Coordinate,
    pub location: String,
    pub trace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreferredCoordinate {
    pub provider: Provider,
    pub coordinate: Coordinate,
}

const OBSERVATION_COLUMNS: &str = "web_id, strasse, plz, ort, new, no_geocode";

pub fn load_observation(conn: &Connection, web_id: i64) -> AppResult<Option<ObservationRecord>> {
    conn.query_row(
        &format!("SELECT {OBSERVATION_COLUMNS} FROM gebaeudebrueter WHERE web_id = ?1"),
        [web_id],
        parse_observation,
    )
    .optional()
    .map_err(AppError::from)
}

pub fn load_observations(conn: &Connection) -> AppResult<Vec<ObservationRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBSERVATION_COLUMNS} FROM gebaeudebrueter ORDER BY web_id ASC"
    ))?;
    let rows = stmt
        .query_map([], parse_observation)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_pending(conn: &Connection, limit: Option<usize>) -> AppResult<Vec<ObservationRecord>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBSERVATION_COLUMNS} FROM gebaeudebrueter WHERE new = 1 ORDER BY web_id ASC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map([limit], parse_observation)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn mark_processed(conn: &Connection, web_id: i64) -> AppResult<()> {
    conn.execute("UPDATE gebaeudebrueter SET new = 0 WHERE web_id = ?1", [web_id])?;
    Ok(())
}

pub fn mark_no_geocode(conn: &Connection, web_id: i64) -> AppResult<bool> {
    let changed = conn.execute(
        "UPDATE gebaeudebrueter SET no_geocode = 1 WHERE web_id = ?1",
        [web_id],
    )?;
    Ok(changed > 0)
}

pub fn upsert_coordinate(conn: &Connection, record: &CoordinateRecord) -> AppResult<()> {
    let sql = format!(
        "INSERT INTO {table} (web_id, longitude, latitude, location, complete_response)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(web_id) DO UPDATE SET
            longitude = excluded.longitude,
            latitude = excluded.latitude,
            location = excluded.location,
            complete_response = excluded.complete_response",
        table = record.provider.table()
    );
    conn.execute(
        &sql,
        params![
            record.web_id,
            record.coordinate.lon,
            record.coordinate.lat,
            record.location,
            record.trace,
        ],
    )?;
    trace!(
        web_id = record.web_id,
        provider = record.provider.as_str(),
        "coordinate record upserted"
    );
    Ok(())
}

pub fn load_coordinate(
    conn: &Connection,
    web_id: i64,
    provider: Provider,
) -> AppResult<Option<CoordinateRecord>> {
    let sql = format!(
        "SELECT web_id, latitude, longitude, location, complete_response FROM {} WHERE web_id = ?1",
        provider.table()
    );
    let row = conn
        .query_row(&sql, [web_id], |row| parse_coordinate_row(row, provider))
        .optional()?;
    Ok(row.flatten())
}

// NULL or non-numeric text (legacy 'None') counts as absent.
pub fn load_coordinates(
    conn: &Connection,
    provider: Provider,
) -> AppResult<BTreeMap<i64, CoordinateRecord>> {
    let sql = format!(
        "SELECT web_id, latitude, longitude, location, complete_response FROM {}",
        provider.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| parse_coordinate_row(row, provider))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .flatten()
        .map(|record| (record.web_id, record))
        .collect())
}

pub fn preferred_coordinates(conn: &Connection) -> AppResult<BTreeMap<i64, PreferredCoordinate>> {
    let mut merged = BTreeMap::new();
    for provider in Provider::PREFERENCE {
        for (web_id, record) in load_coordinates(conn, provider)? {
            merged.entry(web_id).or_insert(PreferredCoordinate {
                provider,
                coordinate: record.coordinate,
            });
        }
    }
    Ok(merged)
}

pub fn preferred_coordinate(
    conn: &Connection,
    web_id: i64,
) -> AppResult<Option<PreferredCoordinate>> {
    for provider in Provider::PREFERENCE {
        if let Some(record) = load_coordinate(conn, web_id, provider)? {
            return Ok(Some(PreferredCoordinate {
                provider,
                coordinate: record.coordinate,
            }));
        }
    }
    Ok(None)
}

pub fn missing_observations(conn: &Connection) -> AppResult<Vec<ObservationRecord>> {
    let mut located = BTreeSet::new();
    for provider in Provider::PREFERENCE {
        located.extend(load_coordinates(conn, provider)?.into_keys());
    }
    Ok(load_observations(conn)?
        .into_iter()
        .filter(|record| !located.contains(&record.web_id))
        .collect())
}

fn parse_observation(row: &Row<'_>) -> rusqlite::Result<ObservationRecord> {
    Ok(ObservationRecord {
        web_id: row.get(0)?,
        strasse: text_value(row.get_ref(1)?),
        plz: text_value(row.get_ref(2)?),
        ort: text_value(row.get_ref(3)?),
        is_new: flag_value(row.get_ref(4)?),
        no_geocode: flag_value(row.get_ref(5)?),
    })
}

fn parse_coordinate_row(
    row: &Row<'_>,
    provider: Provider,
) -> rusqlite::Result<Option<CoordinateRecord>> {
    let web_id: i64 = row.get(0)?;
    let lat = numeric_value(row.get_ref(1)?);
    let lon = numeric_value(row.get_ref(2)?);
    let coordinate = match (lat, lon) {
        (Some(lat), Some(lon)) => Coordinate::new(lat, lon),
        _ => None,
    };
    let location = text_value(row.get_ref(3)?);
    let trace = text_value(row.get_ref(4)?);
    Ok(coordinate.map(|coordinate| CoordinateRecord {
        web_id,
        provider,
        coordinate,
        location,
        trace,
    }))
}

fn numeric_value(value: ValueRef<'_>) -> Option<f64> {
    let parsed = match value {
        ValueRef::Real(v) => Some(v),
        ValueRef::Integer(v) => Some(v as f64),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse::<f64>().ok(),
        ValueRef::Null | ValueRef::Blob(_) => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn text_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        ValueRef::Null | ValueRef::Blob(_) => String::new(),
    }
}

fn flag_value(value: ValueRef<'_>) -> bool {
    match value {
        ValueRef::Integer(v) => v != 0,
        ValueRef::Real(v) => v != 0.0,
        ValueRef::Text(bytes) => matches!(bytes, b"1" | b"true" | b"True"),
        ValueRef::Null | ValueRef::Blob(_) => false,
    }
}
