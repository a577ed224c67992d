//! Cached, rate-limited reverse geocoding.
//!
//! Coordinates are rounded to three decimals (~110 m) to form the cache key,
//! so a burst of frames from one flight resolves with a single provider
//! request. Concurrent callers for the same key coalesce onto one in-flight
//! lookup, and requests across the whole process keep ≥1.1 s apart per the
//! Nominatim usage policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{GeocodeCacheEntry, StoreError, VaultStore};

const PROVIDER: &str = "nominatim";
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(1100);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
const RAW_JSON_LIMIT: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocode lookup cancelled")]
    Cancelled,
    #[error("geocoder transport: {0}")]
    Transport(String),
    #[error("geocoder status: {0}")]
    Status(u16),
    #[error("geocoder response parse: {0}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Administrative hierarchy for a coordinate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub provider: String,
    pub country: String,
    pub state: String,
    pub county: String,
    pub city: String,
    pub road: String,
    pub house_number: String,
    pub postcode: String,
    pub display_name: String,
    pub geocode_key: String,
}

/// One HTTPS GET with headers — the whole surface the geocoder needs from
/// the network, kept narrow so tests can observe and fake it.
#[async_trait]
pub trait GeocodeTransport: Send + Sync {
    async fn get_json(&self, url: &str, user_agent: &str) -> Result<(u16, String), GeocodeError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeocodeTransport for HttpTransport {
    async fn get_json(&self, url: &str, user_agent: &str) -> Result<(u16, String), GeocodeError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| GeocodeError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| GeocodeError::Transport(e.to_string()))?;
        Ok((status, body))
    }
}

pub struct ReverseGeocoder {
    store: Arc<dyn VaultStore>,
    transport: Arc<dyn GeocodeTransport>,
    enabled: bool,
    user_agent: String,

    next_allowed_at: Mutex<Instant>,
    inflight: Mutex<HashMap<String, watch::Receiver<bool>>>,
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

pub fn geo_key(lat: f64, lon: f64) -> String {
    format!("{:.3},{:.3}", round3(lat), round3(lon))
}

fn location_from_cache(entry: GeocodeCacheEntry) -> Location {
    Location {
        provider: entry.provider,
        country: entry.country,
        state: entry.state,
        county: entry.county,
        city: entry.city,
        road: entry.road,
        house_number: entry.house_number,
        postcode: entry.postcode,
        display_name: entry.display_name,
        geocode_key: entry.geocode_key,
    }
}

impl ReverseGeocoder {
    pub fn new(
        store: Arc<dyn VaultStore>,
        transport: Arc<dyn GeocodeTransport>,
        enabled: bool,
        user_agent: String,
    ) -> Self {
        Self {
            store,
            transport,
            enabled,
            user_agent,
            next_allowed_at: Mutex::new(Instant::now()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve `(lat, lon)` to an administrative hierarchy, or `None` when
    /// disabled or the provider has nothing for the coordinate.
    pub async fn reverse(
        &self,
        cancel: &CancellationToken,
        lat: f64,
        lon: f64,
    ) -> Result<Option<Location>, GeocodeError> {
        if !self.enabled {
            return Ok(None);
        }

        let key = geo_key(lat, lon);
        if let Some(cached) = self.store.get_geocode_cache(PROVIDER, &key)? {
            return Ok(Some(location_from_cache(cached)));
        }

        // Join an in-flight lookup for the same key instead of issuing a
        // second request; the winner persists to the cache before signaling.
        enum Lookup {
            Join(watch::Receiver<bool>),
            Lead(watch::Sender<bool>),
        }

        let lookup = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(&key) {
                Some(rx) => Lookup::Join(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    inflight.insert(key.clone(), rx);
                    Lookup::Lead(tx)
                }
            }
        };

        let tx = match lookup {
            Lookup::Join(mut rx) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GeocodeError::Cancelled),
                    changed = rx.changed() => {
                        // Sender dropped counts as completion too.
                        let _ = changed;
                    }
                }
                let cached = self.store.get_geocode_cache(PROVIDER, &key)?;
                return Ok(cached.map(location_from_cache));
            }
            Lookup::Lead(tx) => tx,
        };

        let result = self.resolve_remote(cancel, lat, lon, &key).await;

        self.inflight.lock().unwrap().remove(&key);
        let _ = tx.send(true);
        result
    }

    async fn resolve_remote(
        &self,
        cancel: &CancellationToken,
        lat: f64,
        lon: f64,
        key: &str,
    ) -> Result<Option<Location>, GeocodeError> {
        self.wait_for_rate_slot(cancel).await?;

        let url = format!(
            "https://nominatim.openstreetmap.org/reverse?format=jsonv2&lat={lat:.8}&lon={lon:.8}&zoom=18&addressdetails=1"
        );
        let (status, body) = self.transport.get_json(&url, &self.user_agent).await?;
        if !(200..300).contains(&status) {
            return Err(GeocodeError::Status(status));
        }

        let parsed: JsonValue =
            serde_json::from_str(&body).map_err(|e| GeocodeError::Parse(e.to_string()))?;
        let address = parsed.get("address").cloned().unwrap_or(JsonValue::Null);
        let get = |field: &str| -> String {
            address
                .get(field)
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let city = ["city", "town", "village", "hamlet", "municipality"]
            .iter()
            .map(|f| get(f))
            .find(|v| !v.is_empty())
            .unwrap_or_default();

        let display_name = parsed
            .get("display_name")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        let mut raw_json = serde_json::json!({
            "display_name": &display_name,
            "address": &address,
        })
        .to_string();
        if raw_json.len() > RAW_JSON_LIMIT {
            let mut cut = RAW_JSON_LIMIT;
            while !raw_json.is_char_boundary(cut) {
                cut -= 1;
            }
            raw_json.truncate(cut);
        }

        let location = Location {
            provider: PROVIDER.to_string(),
            country: get("country"),
            state: get("state"),
            county: get("county"),
            city,
            road: get("road"),
            house_number: get("house_number"),
            postcode: get("postcode"),
            display_name,
            geocode_key: key.to_string(),
        };

        let entry = GeocodeCacheEntry {
            provider: location.provider.clone(),
            geocode_key: location.geocode_key.clone(),
            country: location.country.clone(),
            state: location.state.clone(),
            county: location.county.clone(),
            city: location.city.clone(),
            road: location.road.clone(),
            house_number: location.house_number.clone(),
            postcode: location.postcode.clone(),
            display_name: location.display_name.clone(),
            raw_json,
            updated_at: String::new(),
        };
        if let Err(err) = self.store.upsert_geocode_cache(&entry) {
            // The lookup itself succeeded; a cache write failure only costs
            // a future request.
            debug!(%err, "geocode cache upsert failed");
        }

        Ok(Some(location))
    }

    /// Block until this process is allowed to issue another provider request.
    async fn wait_for_rate_slot(&self, cancel: &CancellationToken) -> Result<(), GeocodeError> {
        let wait = {
            let next = self.next_allowed_at.lock().unwrap();
            let now = Instant::now();
            (*next > now).then(|| *next - now)
        };
        if let Some(wait) = wait {
            tokio::select! {
                _ = cancel.cancelled() => return Err(GeocodeError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
        *self.next_allowed_at.lock().unwrap() = Instant::now() + MIN_REQUEST_INTERVAL;
        Ok(())
    }
}
