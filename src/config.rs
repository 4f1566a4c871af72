use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, io};

use tracing::debug;

const DEFAULT_DB_PATH: &str = "brueter.sqlite";
const DEFAULT_REPORTS_DIR: &str = "reports";
const DEFAULT_KEY_FILE: &str = "api.key";
const DEFAULT_USER_AGENT: &str = "Gebaeudebrueter/2026-02";
const DEFAULT_NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_GOOGLE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

pub const DEFAULT_MIN_DELAY_SECS: f64 = 1.5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_ERROR_WAIT_SECS: f64 = 5.0;

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitPolicy {
    pub min_delay: Duration,
    pub max_retries: u32,
    pub error_wait: Duration,
    pub jitter_ms: (u64, u64),
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs_f64(DEFAULT_MIN_DELAY_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            error_wait: Duration::from_secs_f64(DEFAULT_ERROR_WAIT_SECS),
            jitter_ms: (50, 250),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub backup_path: PathBuf,
    pub pre_restore_path: PathBuf,
    pub reports_dir: PathBuf,
    pub rate_limit: RateLimitPolicy,
    pub request_timeout: Duration,
    pub default_locality: String,
    pub country: String,
    pub google_key_env: Option<String>,
    pub google_key_file: PathBuf,
    pub google_endpoint: String,
    pub nominatim_endpoint: String,
    pub nominatim_user_agent: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let db_path = env::var("BRUETER_DB")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let mut config = Self {
            backup_path: PathBuf::new(),
            pre_restore_path: PathBuf::new(),
            db_path: PathBuf::new(),
            reports_dir: env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_REPORTS_DIR)),
            rate_limit: RateLimitPolicy {
                min_delay: parse_secs("GEOCODE_MIN_DELAY_SECONDS", DEFAULT_MIN_DELAY_SECS),
                max_retries: parse_u32("GEOCODE_MAX_RETRIES", DEFAULT_MAX_RETRIES),
                error_wait: parse_secs("GEOCODE_ERROR_WAIT_SECONDS", DEFAULT_ERROR_WAIT_SECS),
                ..RateLimitPolicy::default()
            },
            request_timeout: parse_secs("GEOCODE_TIMEOUT_SECONDS", 10.0),
            default_locality: env::var("GEOCODE_DEFAULT_LOCALITY")
                .unwrap_or_else(|_| "Berlin".to_string()),
            country: env::var("GEOCODE_COUNTRY").unwrap_or_else(|_| "Deutschland".to_string()),
            google_key_env: env::var("GOOGLE_API_KEY").ok(),
            google_key_file: env::var("GOOGLE_API_KEY_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_KEY_FILE)),
            google_endpoint: env::var("GOOGLE_GEOCODE_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GOOGLE_ENDPOINT.to_string()),
            nominatim_endpoint: env::var("NOMINATIM_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_NOMINATIM_ENDPOINT.to_string()),
            nominatim_user_agent: nominatim_user_agent(
                env::var("NOMINATIM_USER_AGENT").ok(),
                env::var("NOMINATIM_EMAIL").ok(),
                env::var("NOMINATIM_URL").ok(),
            ),
        };
        config.set_db_path(db_path);
        config
    }

    pub fn set_db_path(&mut self, db_path: PathBuf) {
        self.backup_path = env::var("BRUETER_BACKUP_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| sibling(&db_path, ".bak"));
        self.pre_restore_path = env::var("BRUETER_PRE_RESTORE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| sibling(&db_path, ".pre_restore.bak"));
        self.db_path = db_path;
    }

    pub fn missing_queue_path(&self) -> PathBuf {
        self.reports_dir.join("missing_coords.csv")
    }

    pub fn results_path(&self) -> PathBuf {
        self.reports_dir.join("geocode_missing_results.csv")
    }

    pub fn cleaned_queue_path(&self) -> PathBuf {
        self.reports_dir.join("missing_coords_cleaned.csv")
    }

    pub fn no_geocode_path(&self) -> PathBuf {
        self.reports_dir.join("no_geocode_marked_prepared.csv")
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn nominatim_user_agent(
    base: Option<String>,
    email: Option<String>,
    url: Option<String>,
) -> String {
    let base = base
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
    let mut extra = Vec::new();
    if let Some(email) = email.filter(|v| !v.trim().is_empty()) {
        extra.push(email);
    }
    if let Some(url) = url.filter(|v| !v.trim().is_empty()) {
        extra.push(format!("+{url}"));
    }
    if extra.is_empty() {
        base
    } else {
        format!("{base} ({})", extra.join("; "))
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_secs(key: &str, default: f64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default);
    Duration::from_secs_f64(secs)
}
