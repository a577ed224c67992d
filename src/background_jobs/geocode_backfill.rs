//! Reverse-geocode backfill.
//!
//! Ingest tolerates geocoder outages by inserting rows with bare
//! coordinates. This job sweeps those rows and fills in their administrative
//! fields, a few at a time, riding the geocoder's cache and rate limit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::BackgroundJob;
use crate::geocode::ReverseGeocoder;
use crate::store::{MediaLocation, VaultStore};

const BACKFILL_INTERVAL: Duration = Duration::from_secs(20);
const BATCH_SIZE: i64 = 30;

pub struct GeocodeBackfillJob {
    store: Arc<dyn VaultStore>,
    geocoder: Arc<ReverseGeocoder>,
}

impl GeocodeBackfillJob {
    pub fn new(store: Arc<dyn VaultStore>, geocoder: Arc<ReverseGeocoder>) -> Self {
        Self { store, geocoder }
    }
}

#[async_trait]
impl BackgroundJob for GeocodeBackfillJob {
    fn id(&self) -> &'static str {
        "geocode_backfill"
    }

    fn interval(&self) -> Duration {
        BACKFILL_INTERVAL
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        if !self.geocoder.enabled() {
            return Ok(());
        }
        let todos = self.store.list_geo_todos(BATCH_SIZE)?;
        for todo in todos {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let loc = match self.geocoder.reverse(cancel, todo.lat, todo.lon).await {
                Ok(Some(loc)) => loc,
                Ok(None) => continue,
                Err(err) => {
                    debug!(id = todo.id, %err, "backfill lookup failed");
                    continue;
                }
            };
            self.store.update_media_location(
                todo.id,
                &MediaLocation {
                    provider: Some(loc.provider),
                    country: Some(loc.country),
                    state: Some(loc.state),
                    county: Some(loc.county),
                    city: Some(loc.city),
                    road: Some(loc.road),
                    house_number: Some(loc.house_number),
                    postcode: Some(loc.postcode),
                    display_name: Some(loc.display_name),
                },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::{GeocodeError, GeocodeTransport, HttpTransport};
    use crate::store::{MediaRecord, SqliteVaultStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GeocodeTransport for FakeTransport {
        async fn get_json(
            &self,
            _url: &str,
            _user_agent: &str,
        ) -> Result<(u16, String), GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                200,
                serde_json::json!({
                    "display_name": "Denver, Colorado",
                    "address": {"state": "Colorado", "city": "Denver", "country": "United States"}
                })
                .to_string(),
            ))
        }
    }

    fn gps_row(store: &SqliteVaultStore, i: i64, lat: f64, lon: f64) -> i64 {
        let ts = format!("2026-02-01T12:00:{i:02}Z");
        let rec = MediaRecord {
            kind: "image".to_string(),
            file_name: format!("IMG_{i}.JPG"),
            extension: ".jpg".to_string(),
            source_mount: "/Volumes/Test".to_string(),
            source_path: format!("/DCIM/{i}.JPG"),
            dest_path: format!("/tmp/usbvault/{i}.JPG"),
            size_bytes: 100 + i,
            crc32: format!("{i:08x}"),
            sha256: format!("{i:064x}"),
            capture_time: ts.clone(),
            gps_lat: Some(lat),
            gps_lon: Some(lon),
            metadata_json: "{}".to_string(),
            source_mtime: ts.clone(),
            ingested_at: ts,
            ..Default::default()
        };
        store.insert_media(&rec).unwrap()
    }

    #[tokio::test]
    async fn backfill_fills_location_fields() {
        let store = Arc::new(SqliteVaultStore::in_memory().unwrap());
        let id = gps_row(&store, 1, 39.7392, -104.9903);

        let transport = Arc::new(FakeTransport {
            calls: AtomicUsize::new(0),
        });
        let geocoder = Arc::new(ReverseGeocoder::new(
            store.clone(),
            transport.clone(),
            true,
            "test".to_string(),
        ));
        let job = GeocodeBackfillJob::new(store.clone(), geocoder);
        job.run(&CancellationToken::new()).await.unwrap();

        let rec = store.get_media_by_id(id).unwrap().unwrap();
        assert_eq!(rec.loc_state.as_deref(), Some("Colorado"));
        assert_eq!(rec.loc_city.as_deref(), Some("Denver"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(store.list_geo_todos(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn nearby_rows_share_one_cached_lookup() {
        let store = Arc::new(SqliteVaultStore::in_memory().unwrap());
        gps_row(&store, 1, 39.7392, -104.9903);
        gps_row(&store, 2, 39.73921, -104.99031);

        let transport = Arc::new(FakeTransport {
            calls: AtomicUsize::new(0),
        });
        let geocoder = Arc::new(ReverseGeocoder::new(
            store.clone(),
            transport.clone(),
            true,
            "test".to_string(),
        ));
        let job = GeocodeBackfillJob::new(store.clone(), geocoder);
        job.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(store.list_geo_todos(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_geocoder_makes_the_job_a_noop() {
        let store = Arc::new(SqliteVaultStore::in_memory().unwrap());
        gps_row(&store, 1, 39.7392, -104.9903);
        let geocoder = Arc::new(ReverseGeocoder::new(
            store.clone(),
            Arc::new(HttpTransport::new()),
            false,
            "test".to_string(),
        ));
        let job = GeocodeBackfillJob::new(store.clone(), geocoder);
        job.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(store.list_geo_todos(10).unwrap().len(), 1);
    }
}
