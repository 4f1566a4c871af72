pub mod address;
pub mod batch;
pub mod config;
pub mod db;
pub mod errors;
pub mod guard;
pub mod providers;
pub mod reconcile;
pub mod records;
pub mod reports;
pub mod resolver;
pub mod secrets;

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::batch::{GeocodeSummary, PrepareSummary, PreparePaths};
use crate::db::{bootstrap, DatabaseContext};
use crate::guard::{GuardPaths, GuardReport};
use crate::providers::build_providers;
use crate::reconcile::ReconcileSummary;
use crate::resolver::{GeocodeResolver, Resolution};

pub use crate::address::{normalize, AddressFlags, NormalizedAddress};
pub use crate::config::{AppConfig, RateLimitPolicy};
pub use crate::errors::{AppError, AppResult};
pub use crate::records::{preferred_coordinates, Coordinate, PreferredCoordinate, Provider};
pub use crate::resolver::ResolveStatus;

pub struct AppState {
    db: DatabaseContext,
    config: AppConfig,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let db = bootstrap(&config.db_path)?;
        Ok(Self { db, config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn connection(&self) -> &rusqlite::Connection {
        &self.db.connection
    }

    pub fn resolver(&self) -> AppResult<GeocodeResolver> {
        let providers = build_providers(&self.config)?;
        let resolver = GeocodeResolver::from_config(&self.config, providers);
        info!(providers = ?resolver.provider_names(), "resolver ready");
        Ok(resolver)
    }

    pub fn prepare_missing(&self) -> AppResult<Option<PrepareSummary>> {
        let queue = self.config.missing_queue_path();
        let cleaned = self.config.cleaned_queue_path();
        let no_geocode = self.config.no_geocode_path();
        batch::prepare_missing(
            &self.db.connection,
            &PreparePaths {
                queue: &queue,
                cleaned: &cleaned,
                no_geocode: &no_geocode,
            },
            &self.config.default_locality,
            &self.config.country,
        )
    }

    pub fn export_missing(&self) -> AppResult<usize> {
        reports::export_missing(&self.db.connection, &self.config.missing_queue_path())
    }

    pub async fn geocode_missing(&self) -> AppResult<GeocodeSummary> {
        let resolver = self.resolver()?;
        batch::geocode_missing_file(
            &resolver,
            &self.config.missing_queue_path(),
            &self.config.results_path(),
        )
        .await
    }

    pub fn apply_results(&self) -> AppResult<ReconcileSummary> {
        let results = reports::read_results(&self.config.results_path())?;
        reconcile::apply(&self.db.connection, &results, &self.config.missing_queue_path())
    }

    pub async fn geocode_new(&self, limit: Option<usize>) -> AppResult<GeocodeSummary> {
        let resolver = self.resolver()?;
        batch::geocode_pending(&self.db.connection, &resolver, limit).await
    }

    pub async fn geocode_one(&self, web_id: i64) -> AppResult<Option<Resolution>> {
        let resolver = self.resolver()?;
        batch::geocode_single(&self.db.connection, &resolver, web_id).await
    }
}

pub fn run_guard(config: &AppConfig) -> AppResult<GuardReport> {
    init_tracing();
    guard::run(&GuardPaths {
        live: config.db_path.clone(),
        backup: config.backup_path.clone(),
        pre_restore: config.pre_restore_path.clone(),
    })
}

// Events carry per-component targets; untargeted ones use the lib module path.
const DEFAULT_LOG_FILTER: &str =
    "info,resolver=debug,providers=debug,credentials=debug,brueter_geocode_lib=debug";

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing::debug;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn default_filter_shows_component_debug_events() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(DEFAULT_LOG_FILTER))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            debug!(target: "resolver", web_id = 7, "no result");
            debug!(target: "providers", "provider response received");
            debug!("untargeted detail");
            debug!(target: "batch", "hidden below info");
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("no result"), "{output}");
        assert!(output.contains("provider response received"), "{output}");
        assert!(output.contains("untargeted detail"), "{output}");
        assert!(!output.contains("hidden below info"), "{output}");
    }
}
