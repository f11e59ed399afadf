use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use crate::config::GeolocationConfig;
use crate::utils::is_private_ip;
use crate::{Result, NetGeoError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);

        if valid {
            Some(Self { latitude, longitude })
        } else {
            None
        }
    }

    /// Parses an ipinfo-style `"lat,lon"` string.
    pub fn parse(loc: &str) -> Option<Self> {
        let (lat, lon) = loc.split_once(',')?;
        let latitude = lat.trim().parse::<f64>().ok()?;
        let longitude = lon.trim().parse::<f64>().ok()?;
        Self::new(latitude, longitude)
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

/// Location metadata for one remote address. Empty strings mean the
/// provider had nothing to say, which is not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub hostname: String,
    pub organization: String,
    pub city: String,
    pub region: String,
    pub country: String,
    pub postal: String,
    pub timezone: String,
    pub readme: String,
    pub coordinates: Option<Coordinates>,
}

impl GeoRecord {
    pub fn is_empty(&self) -> bool {
        *self == GeoRecord::default()
    }

    pub fn location_display(&self) -> String {
        self.coordinates.map(|c| c.to_string()).unwrap_or_default()
    }

    /// `"city, region, country"` with empty parts left out.
    pub fn location_summary(&self) -> String {
        [&self.city, &self.region, &self.country]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Builds a record from a provider JSON body. Missing or non-string fields
/// become empty; only a body that is not an object is rejected.
pub fn parse_geo_record(body: &Value) -> Result<GeoRecord> {
    let object = body
        .as_object()
        .ok_or_else(|| NetGeoError::Parse(format!("expected JSON object, got {}", body)))?;

    let field = |name: &str| -> String {
        object
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let loc = field("loc");
    let coordinates = if loc.is_empty() {
        None
    } else {
        let parsed = Coordinates::parse(&loc);
        if parsed.is_none() {
            log::debug!("Ignoring malformed loc field: {:?}", loc);
        }
        parsed
    };

    Ok(GeoRecord {
        hostname: field("hostname"),
        organization: field("org"),
        city: field("city"),
        region: field("region"),
        country: field("country"),
        postal: field("postal"),
        timezone: field("timezone"),
        readme: field("readme"),
        coordinates,
    })
}

/// External geolocation service.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn fetch(&self, ip: &str) -> Result<GeoRecord>;
}

/// Client for ipinfo.io and compatible `GET /{ip}/json` services.
pub struct IpInfoProvider {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl IpInfoProvider {
    pub fn new(config: &GeolocationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, ip: &str) -> String {
        format!("{}/{}/json", self.base_url, ip)
    }
}

#[async_trait]
impl GeoProvider for IpInfoProvider {
    async fn fetch(&self, ip: &str) -> Result<GeoRecord> {
        let mut request = self.client.get(self.endpoint(ip));
        if let Some(ref token) = self.token {
            request = request.query(&[("token", token)]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                NetGeoError::Timeout(format!("lookup for {} timed out", ip))
            } else {
                NetGeoError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetGeoError::ProviderStatus(status.as_u16()));
        }

        let body: Value = response.json().await?;
        parse_geo_record(&body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedLookup {
    Found(GeoRecord),
    /// Tombstone for a lookup that failed earlier in this run.
    Failed,
}

#[derive(Debug, Clone)]
pub struct GeoCacheEntry {
    pub outcome: CachedLookup,
    pub created_at: Instant,
}

impl GeoCacheEntry {
    pub fn found(record: GeoRecord) -> Self {
        Self {
            outcome: CachedLookup::Found(record),
            created_at: Instant::now(),
        }
    }

    pub fn failed() -> Self {
        Self {
            outcome: CachedLookup::Failed,
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.created_at.elapsed() >= ttl,
            None => false,
        }
    }

    fn record(&self) -> GeoRecord {
        match self.outcome {
            CachedLookup::Found(ref record) => record.clone(),
            CachedLookup::Failed => GeoRecord::default(),
        }
    }
}

type CacheSlot = Arc<OnceCell<GeoCacheEntry>>;

/// In-run lookup cache keyed by remote IP string. Each key owns a
/// `OnceCell`, so concurrent lookups for one IP share a single fetch.
pub struct GeoCache {
    slots: Mutex<HashMap<String, CacheSlot>>,
    ttl: Option<Duration>,
}

impl GeoCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Pre-populates an entry.
    pub fn seed(&self, ip: &str, entry: GeoCacheEntry) {
        let slot = Arc::new(OnceCell::new_with(Some(entry)));
        self.lock().insert(ip.to_string(), slot);
    }

    /// The settled entry for `ip`, if any.
    pub fn get(&self, ip: &str) -> Option<GeoCacheEntry> {
        self.lock()
            .get(ip)
            .and_then(|slot| slot.get().cloned())
            .filter(|entry| !entry.is_expired(self.ttl))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, ip: &str) -> CacheSlot {
        let mut slots = self.lock();

        if let Some(slot) = slots.get(ip) {
            let expired = slot.get().map_or(false, |entry| entry.is_expired(self.ttl));
            if !expired {
                return Arc::clone(slot);
            }
            log::debug!("Cache entry for {} expired", ip);
        }

        let slot: CacheSlot = Arc::new(OnceCell::new());
        slots.insert(ip.to_string(), Arc::clone(&slot));
        slot
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for GeoCache {
    fn default() -> Self {
        Self::new(None)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeoStats {
    pub lookups: usize,
    pub provider_calls: usize,
    pub failures: usize,
}

impl GeoStats {
    pub fn cache_hits(&self) -> usize {
        self.lookups.saturating_sub(self.provider_calls)
    }
}

/// Best-effort geolocation with per-run caching. `lookup` never fails.
pub struct GeoClient {
    provider: Arc<dyn GeoProvider>,
    cache: GeoCache,
    timeout: Duration,
    skip_private: bool,
    lookups: AtomicUsize,
    provider_calls: AtomicUsize,
    failures: AtomicUsize,
}

impl GeoClient {
    pub fn new(provider: Arc<dyn GeoProvider>, cache: GeoCache, timeout: Duration) -> Self {
        Self {
            provider,
            cache,
            timeout,
            skip_private: false,
            lookups: AtomicUsize::new(0),
            provider_calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &GeolocationConfig) -> Result<Self> {
        let provider = IpInfoProvider::new(config)?;
        let client = Self::new(
            Arc::new(provider),
            GeoCache::new(config.cache_ttl()),
            config.timeout(),
        );
        Ok(client.with_skip_private(config.skip_private))
    }

    pub fn with_skip_private(mut self, skip_private: bool) -> Self {
        self.skip_private = skip_private;
        self
    }

    pub fn cache(&self) -> &GeoCache {
        &self.cache
    }

    pub fn stats(&self) -> GeoStats {
        GeoStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// `None` is the "no remote endpoint" sentinel and never reaches the
    /// provider.
    pub async fn lookup(&self, remote: Option<IpAddr>) -> GeoRecord {
        let ip = match remote {
            Some(ip) => ip.to_canonical(),
            None => return GeoRecord::default(),
        };

        if self.skip_private && is_private_ip(&ip) {
            return GeoRecord::default();
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);

        let key = ip.to_string();
        let slot = self.cache.slot(&key);
        let entry = slot.get_or_init(|| self.fetch_entry(&key)).await;
        entry.record()
    }

    async fn fetch_entry(&self, ip: &str) -> GeoCacheEntry {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);

        let result = match timeout(self.timeout, self.provider.fetch(ip)).await {
            Ok(result) => result,
            Err(_) => Err(NetGeoError::Timeout(format!(
                "lookup for {} exceeded {:?}",
                ip, self.timeout
            ))),
        };

        match result {
            Ok(record) => {
                log::debug!("Geolocated {}: {}", ip, record.location_summary());
                GeoCacheEntry::found(record)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Error fetching IP details for {}: {}", ip, e);
                GeoCacheEntry::failed()
            }
        }
    }
}
