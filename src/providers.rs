use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::records::{Coordinate, Provider};
use crate::secrets::resolve_google_credential;

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeHit {
    pub coordinate: Coordinate,
    pub location: String,
    // raw body, audit only
    pub trace: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(GeocodeHit),
    NotFound,
    Transient(String),
    Permanent(String),
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn provider(&self) -> Provider;

    fn is_available(&self) -> bool {
        true
    }

    async fn geocode(&self, address: &str) -> LookupOutcome;
}

pub fn build_providers(config: &AppConfig) -> AppResult<Vec<Arc<dyn GeocodeProvider>>> {
    let mut providers: Vec<Arc<dyn GeocodeProvider>> = Vec::new();
    if let Some(credential) = resolve_google_credential(config) {
        providers.push(Arc::new(GoogleGeocoder::new(
            config.google_endpoint.clone(),
            credential.secret().clone(),
            config.request_timeout,
        )));
    }
    providers.push(Arc::new(NominatimGeocoder::new(
        config.nominatim_endpoint.clone(),
        &config.nominatim_user_agent,
        config.request_timeout,
    )?));
    Ok(providers)
}

pub struct NominatimGeocoder {
    http: Client,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new(endpoint: String, user_agent: &str, timeout: Duration) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimGeocoder {
    fn provider(&self) -> Provider {
        Provider::Osm
    }

    async fn geocode(&self, address: &str) -> LookupOutcome {
        let request = self
            .http
            .get(&self.endpoint)
            .query(&[("q", address), ("format", "jsonv2"), ("limit", "1")]);
        match fetch_body(request).await {
            Ok(body) => parse_nominatim(body),
            Err(outcome) => outcome,
        }
    }
}

fn parse_nominatim(body: String) -> LookupOutcome {
    #[derive(Deserialize)]
    struct Place {
        lat: String,
        lon: String,
        display_name: Option<String>,
    }

    let places: Vec<Place> = match serde_json::from_str(&body) {
        Ok(places) => places,
        Err(err) => return LookupOutcome::Permanent(format!("unreadable Nominatim response: {err}")),
    };
    let Some(place) = places.into_iter().next() else {
        return LookupOutcome::NotFound;
    };
    let coordinate = match (place.lat.trim().parse(), place.lon.trim().parse()) {
        (Ok(lat), Ok(lon)) => Coordinate::new(lat, lon),
        _ => None,
    };
    match coordinate {
        Some(coordinate) => LookupOutcome::Found(GeocodeHit {
            coordinate,
            location: place.display_name.unwrap_or_default(),
            trace: body,
        }),
        None => LookupOutcome::Permanent(format!(
            "Nominatim returned non-numeric coordinates ({}, {})",
            place.lat, place.lon
        )),
    }
}

pub struct GoogleGeocoder {
    endpoint: String,
    api_key: SecretString,
    timeout: Duration,
    http: OnceCell<Option<Client>>,
}

impl GoogleGeocoder {
    pub fn new(endpoint: String, api_key: SecretString, timeout: Duration) -> Self {
        Self {
            endpoint,
            api_key,
            timeout,
            http: OnceCell::new(),
        }
    }

    fn client(&self) -> Option<&Client> {
        self.http
            .get_or_init(|| match Client::builder().timeout(self.timeout).build() {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(
                        target: "providers",
                        error = %err,
                        "Google client init failed; proceeding without Google geocoding"
                    );
                    None
                }
            })
            .as_ref()
    }
}

#[async_trait]
impl GeocodeProvider for GoogleGeocoder {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn is_available(&self) -> bool {
        self.client().is_some()
    }

    async fn geocode(&self, address: &str) -> LookupOutcome {
        let Some(http) = self.client() else {
            return LookupOutcome::Permanent("Google client unavailable".into());
        };
        let request = http
            .get(&self.endpoint)
            .query(&[("address", address), ("key", self.api_key.expose_secret())]);
        match fetch_body(request).await {
            Ok(body) => parse_google(body),
            Err(outcome) => outcome,
        }
    }
}

fn parse_google(body: String) -> LookupOutcome {
    #[derive(Deserialize)]
    struct Response {
        status: String,
        #[serde(default)]
        results: Vec<ResponseResult>,
        error_message: Option<String>,
    }

    #[derive(Deserialize)]
    struct ResponseResult {
        formatted_address: Option<String>,
        geometry: ResponseGeometry,
    }

    #[derive(Deserialize)]
    struct ResponseGeometry {
        location: ResponseLocation,
    }

    #[derive(Deserialize)]
    struct ResponseLocation {
        lat: f64,
        lng: f64,
    }

    let parsed: Response = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(err) => return LookupOutcome::Permanent(format!("unreadable Google response: {err}")),
    };
    let detail = || {
        let message = parsed.error_message.clone().unwrap_or_default();
        format!("Google status {} {message}", parsed.status).trim().to_string()
    };
    match parsed.status.as_str() {
        "OK" => {
            let Some(first) = parsed.results.first() else {
                return LookupOutcome::NotFound;
            };
            let point = &first.geometry.location;
            match Coordinate::new(point.lat, point.lng) {
                Some(coordinate) => LookupOutcome::Found(GeocodeHit {
                    coordinate,
                    location: first.formatted_address.clone().unwrap_or_default(),
                    trace: body,
                }),
                None => LookupOutcome::Permanent(detail()),
            }
        }
        "ZERO_RESULTS" => LookupOutcome::NotFound,
        "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => LookupOutcome::Transient(detail()),
        _ => LookupOutcome::Permanent(detail()),
    }
}

async fn fetch_body(request: reqwest::RequestBuilder) -> Result<String, LookupOutcome> {
    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status();
    if !status.is_success() {
        let reason = format!("HTTP {status}");
        return Err(if is_transient_status(status) {
            LookupOutcome::Transient(reason)
        } else {
            LookupOutcome::Permanent(reason)
        });
    }
    let body = response.text().await.map_err(classify_transport)?;
    debug!(target: "providers", bytes = body.len(), "provider response received");
    Ok(body)
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn classify_transport(err: reqwest::Error) -> LookupOutcome {
    if err.is_builder() {
        LookupOutcome::Permanent(err.to_string())
    } else {
        LookupOutcome::Transient(err.to_string())
    }
}
