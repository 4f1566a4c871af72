use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, RateLimitPolicy};
use crate::providers::{GeocodeHit, GeocodeProvider, LookupOutcome};
use crate::records::Provider;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

#[derive(Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct RateLimiter {
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    last_call: Mutex<Option<Instant>>,
    jitter_rng: Mutex<StdRng>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy, clock: Arc<dyn Clock>, rng: StdRng) -> Self {
        Self {
            policy,
            clock,
            last_call: Mutex::new(None),
            jitter_rng: Mutex::new(rng),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub async fn wait(&self) {
        let jitter = self.jitter();
        let previous = *self.last_call.lock();
        let pause = match previous {
            Some(prev) => {
                let interval = self.policy.min_delay + jitter;
                let elapsed = self.clock.now().saturating_duration_since(prev);
                interval.saturating_sub(elapsed)
            }
            None => jitter,
        };
        if !pause.is_zero() {
            self.clock.sleep(pause).await;
        }
        *self.last_call.lock() = Some(self.clock.now());
    }

    async fn back_off(&self) {
        self.clock.sleep(self.policy.error_wait).await;
    }

    fn jitter(&self) -> Duration {
        let (low, high) = self.policy.jitter_ms;
        if high == 0 {
            return Duration::ZERO;
        }
        let jitter_ms = self.jitter_rng.lock().gen_range(low.min(high)..=high);
        Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolveStatus {
    Ok,
    ZeroResults,
    NoStreet,
    ProviderError,
}

impl ResolveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveStatus::Ok => "OK",
            ResolveStatus::ZeroResults => "ZERO_RESULTS",
            ResolveStatus::NoStreet => "NO_STREET",
            ResolveStatus::ProviderError => "PROVIDER_ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub web_id: i64,
    pub street: String,
    pub plz: String,
    pub ort: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCoordinate {
    pub provider: Provider,
    pub hit: GeocodeHit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub web_id: i64,
    pub status: ResolveStatus,
    pub resolved: Option<ResolvedCoordinate>,
    pub attempted_address: String,
}

impl Resolution {
    pub fn provider(&self) -> Option<Provider> {
        self.resolved.as_ref().map(|r| r.provider)
    }
}

pub struct GeocodeResolver {
    providers: Vec<Arc<dyn GeocodeProvider>>,
    limiter: RateLimiter,
    default_locality: String,
    country: String,
}

impl GeocodeResolver {
    pub fn new(
        providers: Vec<Arc<dyn GeocodeProvider>>,
        limiter: RateLimiter,
        default_locality: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            providers,
            limiter,
            default_locality: default_locality.into(),
            country: country.into(),
        }
    }

    pub fn from_config(config: &AppConfig, providers: Vec<Arc<dyn GeocodeProvider>>) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limit.clone(),
            Arc::new(TokioClock),
            StdRng::from_entropy(),
        );
        Self::new(
            providers,
            limiter,
            config.default_locality.clone(),
            config.country.clone(),
        )
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.provider().as_str()).collect()
    }

    pub async fn resolve(&self, request: &ResolveRequest) -> Resolution {
        if request.street.trim().is_empty() {
            debug!(target: "resolver", web_id = request.web_id, "no street; skipping providers");
            return Resolution {
                web_id: request.web_id,
                status: ResolveStatus::NoStreet,
                resolved: None,
                attempted_address: String::new(),
            };
        }

        let variants = address_variants(
            &request.street,
            &request.plz,
            &request.ort,
            &self.default_locality,
            &self.country,
        );
        let providers: Vec<_> = self
            .providers
            .iter()
            .map(Arc::as_ref)
            .filter(|p| p.is_available())
            .collect();
        let mut answered = false;

        for (index, variant) in variants.iter().enumerate() {
            for provider in &providers {
                let name = provider.provider();
                match self.call_with_retry(*provider, variant).await {
                    LookupOutcome::Found(hit) => {
                        info!(
                            target: "resolver",
                            web_id = request.web_id,
                            provider = name.as_str(),
                            variant = index,
                            "resolved {variant}"
                        );
                        return Resolution {
                            web_id: request.web_id,
                            status: ResolveStatus::Ok,
                            resolved: Some(ResolvedCoordinate {
                                provider: name,
                                hit,
                            }),
                            attempted_address: variant.clone(),
                        };
                    }
                    LookupOutcome::NotFound => {
                        answered = true;
                        debug!(
                            target: "resolver",
                            web_id = request.web_id,
                            provider = name.as_str(),
                            variant = index,
                            "no result"
                        );
                    }
                    LookupOutcome::Transient(reason) | LookupOutcome::Permanent(reason) => {
                        warn!(
                            target: "resolver",
                            web_id = request.web_id,
                            provider = name.as_str(),
                            variant = index,
                            %reason,
                            "provider gave no usable answer"
                        );
                    }
                }
            }
        }

        let status = if answered {
            ResolveStatus::ZeroResults
        } else {
            ResolveStatus::ProviderError
        };
        info!(
            target: "resolver",
            web_id = request.web_id,
            status = status.as_str(),
            "all variants exhausted"
        );
        Resolution {
            web_id: request.web_id,
            status,
            resolved: None,
            attempted_address: variants.into_iter().next().unwrap_or_default(),
        }
    }

    async fn call_with_retry(&self, provider: &dyn GeocodeProvider, address: &str) -> LookupOutcome {
        let max_retries = self.limiter.policy().max_retries;
        let mut attempt = 0;
        loop {
            self.limiter.wait().await;
            match provider.geocode(address).await {
                LookupOutcome::Transient(reason) if attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        target: "resolver",
                        provider = provider.provider().as_str(),
                        attempt,
                        %reason,
                        "transient provider failure; backing off"
                    );
                    self.limiter.back_off().await;
                }
                outcome => return outcome,
            }
        }
    }
}

pub fn address_variants(
    street: &str,
    plz: &str,
    ort: &str,
    default_locality: &str,
    country: &str,
) -> Vec<String> {
    let street = street.trim();
    let plz = plz.trim();
    let ort = match ort.trim() {
        "" => default_locality.trim(),
        value => value,
    };
    let join = |parts: &[&str]| {
        parts
            .iter()
            .copied()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut candidates = Vec::new();
    if !street.is_empty() {
        candidates.push(join(&[street, plz, ort, country]));
        candidates.push(join(&[street, ort, country]));
    }
    if !plz.is_empty() {
        candidates.push(join(&[plz, ort, country]));
    }

    let mut variants: Vec<String> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !candidate.is_empty() && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    }
    variants
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;

    use super::*;
    use crate::records::Coordinate;

    pub struct ManualClock {
        start: Instant,
        offset: Mutex<Duration>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                start: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().clone()
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.start + *self.offset.lock()
        }

        async fn sleep(&self, duration: Duration) {
            *self.offset.lock() += duration;
            self.sleeps.lock().push(duration);
        }
    }

    pub struct ScriptedProvider {
        provider: Provider,
        available: bool,
        responses: Mutex<VecDeque<LookupOutcome>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub fn new(provider: Provider, responses: Vec<LookupOutcome>) -> Self {
            Self {
                provider,
                available: true,
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn unavailable(provider: Provider) -> Self {
            Self {
                available: false,
                ..Self::new(provider, Vec::new())
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl GeocodeProvider for ScriptedProvider {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn geocode(&self, address: &str) -> LookupOutcome {
            self.calls.lock().push(address.to_string());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or(LookupOutcome::NotFound)
        }
    }

    pub fn hit(lat: f64, lon: f64) -> LookupOutcome {
        LookupOutcome::Found(GeocodeHit {
            coordinate: Coordinate::new(lat, lon).unwrap(),
            location: format!("{lat},{lon}"),
            trace: format!("{{\"lat\":{lat},\"lon\":{lon}}}"),
        })
    }

    pub fn policy(min_delay_ms: u64, max_retries: u32, error_wait_ms: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            min_delay: Duration::from_millis(min_delay_ms),
            max_retries,
            error_wait: Duration::from_millis(error_wait_ms),
            jitter_ms: (0, 0),
        }
    }

    pub fn resolver_with(
        providers: Vec<Arc<dyn GeocodeProvider>>,
        policy: RateLimitPolicy,
        clock: Arc<ManualClock>,
    ) -> GeocodeResolver {
        let limiter = RateLimiter::new(policy, clock, StdRng::seed_from_u64(7));
        GeocodeResolver::new(providers, limiter, "Berlin", "Deutschland")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn request(street: &str, plz: &str) -> ResolveRequest {
        ResolveRequest {
            web_id: 42,
            street: street.into(),
            plz: plz.into(),
            ort: "Berlin".into(),
        }
    }

    #[test]
    fn builds_variants_from_specific_to_loose() {
        assert_eq!(
            address_variants("Hauptstr. 5", "10115", "", "Berlin", "Deutschland"),
            vec![
                "Hauptstr. 5, 10115, Berlin, Deutschland",
                "Hauptstr. 5, Berlin, Deutschland",
                "10115, Berlin, Deutschland",
            ]
        );
        assert_eq!(
            address_variants("Hauptstr. 5", " ", "Potsdam", "Berlin", "Deutschland"),
            vec!["Hauptstr. 5, Potsdam, Deutschland"]
        );
    }

    #[tokio::test]
    async fn empty_street_never_reaches_a_provider() {
        let clock = Arc::new(ManualClock::new());
        let osm = Arc::new(ScriptedProvider::new(Provider::Osm, vec![hit(1.0, 1.0)]));
        let resolver = resolver_with(vec![osm.clone()], policy(1500, 3, 5000), clock.clone());

        let resolution = resolver.resolve(&request("  ", "10115")).await;

        assert_eq!(resolution.status, ResolveStatus::NoStreet);
        assert!(resolution.resolved.is_none());
        assert!(osm.calls().is_empty());
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn commercial_provider_is_tried_first_per_variant() {
        let clock = Arc::new(ManualClock::new());
        let google = Arc::new(ScriptedProvider::new(
            Provider::Google,
            vec![LookupOutcome::NotFound, LookupOutcome::NotFound],
        ));
        let osm = Arc::new(ScriptedProvider::new(
            Provider::Osm,
            vec![LookupOutcome::NotFound, hit(52.5, 13.4)],
        ));
        let resolver = resolver_with(
            vec![google.clone(), osm.clone()],
            policy(0, 0, 0),
            clock,
        );

        let resolution = resolver.resolve(&request("Hauptstr. 5", "10115")).await;

        assert_eq!(resolution.status, ResolveStatus::Ok);
        assert_eq!(resolution.provider(), Some(Provider::Osm));
        assert_eq!(resolution.attempted_address, "Hauptstr. 5, Berlin, Deutschland");
        assert_eq!(
            google.calls(),
            vec![
                "Hauptstr. 5, 10115, Berlin, Deutschland",
                "Hauptstr. 5, Berlin, Deutschland",
            ]
        );
        assert_eq!(osm.calls().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_provider_is_skipped() {
        let clock = Arc::new(ManualClock::new());
        let google = Arc::new(ScriptedProvider::unavailable(Provider::Google));
        let osm = Arc::new(ScriptedProvider::new(Provider::Osm, vec![hit(52.5, 13.4)]));
        let resolver = resolver_with(vec![google.clone(), osm], policy(0, 0, 0), clock);

        let resolution = resolver.resolve(&request("Hauptstr. 5", "10115")).await;

        assert_eq!(resolution.provider(), Some(Provider::Osm));
        assert_eq!(resolution.attempted_address, "Hauptstr. 5, 10115, Berlin, Deutschland");
        assert!(google.calls().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let clock = Arc::new(ManualClock::new());
        let osm = Arc::new(ScriptedProvider::new(
            Provider::Osm,
            vec![
                LookupOutcome::Transient("timeout".into()),
                LookupOutcome::Transient("503".into()),
                hit(52.5, 13.4),
            ],
        ));
        let resolver = resolver_with(vec![osm.clone()], policy(1500, 3, 5000), clock.clone());

        let resolution = resolver.resolve(&request("Hauptstr. 5", "10115")).await;

        assert_eq!(resolution.status, ResolveStatus::Ok);
        assert_eq!(osm.calls().len(), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(5000), Duration::from_millis(5000)]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_demote_to_provider_error() {
        let clock = Arc::new(ManualClock::new());
        let failures = (0..6)
            .map(|_| LookupOutcome::Transient("unavailable".into()))
            .collect();
        let osm = Arc::new(ScriptedProvider::new(Provider::Osm, failures));
        let resolver = resolver_with(vec![osm.clone()], policy(0, 1, 10), clock);

        let resolution = resolver.resolve(&request("Hauptstr. 5", "10115")).await;

        assert_eq!(resolution.status, ResolveStatus::ProviderError);
        assert_eq!(resolution.attempted_address, "Hauptstr. 5, 10115, Berlin, Deutschland");
        // two attempts for each of the three variants
        assert_eq!(osm.calls().len(), 6);
    }

    #[tokio::test]
    async fn zero_results_when_any_provider_answered() {
        let clock = Arc::new(ManualClock::new());
        let google = Arc::new(ScriptedProvider::new(
            Provider::Google,
            vec![LookupOutcome::Permanent("REQUEST_DENIED".into()); 3],
        ));
        let osm = Arc::new(ScriptedProvider::new(Provider::Osm, Vec::new()));
        let resolver = resolver_with(vec![google, osm], policy(0, 3, 0), clock);

        let resolution = resolver.resolve(&request("Hauptstr. 5", "10115")).await;
        assert_eq!(resolution.status, ResolveStatus::ZeroResults);
        assert!(resolution.resolved.is_none());
    }

    #[tokio::test]
    async fn calls_are_spaced_by_minimum_delay() {
        let clock = Arc::new(ManualClock::new());
        let osm = Arc::new(ScriptedProvider::new(Provider::Osm, Vec::new()));
        let resolver = resolver_with(vec![osm], policy(1500, 3, 5000), clock.clone());

        resolver.resolve(&request("Hauptstr. 5", "10115")).await;

        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(1500), Duration::from_millis(1500)]
        );
    }

    #[tokio::test]
    async fn jitter_stays_within_bounds() {
        let clock = Arc::new(ManualClock::new());
        let policy = RateLimitPolicy {
            jitter_ms: (50, 250),
            ..policy(1000, 0, 0)
        };
        let limiter = RateLimiter::new(policy, clock.clone(), StdRng::seed_from_u64(3));

        for _ in 0..5 {
            limiter.wait().await;
        }

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 5);
        assert!(sleeps[0] >= Duration::from_millis(50) && sleeps[0] <= Duration::from_millis(250));
        for pause in &sleeps[1..] {
            assert!(*pause >= Duration::from_millis(1050));
            assert!(*pause <= Duration::from_millis(1250));
        }
    }
}
