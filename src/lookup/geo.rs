//! IP -> geolocation through an ordered chain of sources.
//!
//! Resolution order for a globally routable address:
//!
//! 1. curated local overrides (never cached, always authoritative)
//! 2. the `loc` cache
//! 3. each [`LocationSource`] in the order it was added: geofeeds,
//!    provider PoP feeds, PeeringDB, reverse DNS hints, then the external
//!    geolocation services
//!
//! The first hit from step 3 is written back to the cache. Misses are not
//! cached, so a later call retries the whole chain.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use super::cache::CacheTopic;
use super::is_global;

/// A point on Earth in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Which source produced a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoMethod {
    Local,
    Geofeed,
    Ispfeed,
    Peeringdb,
    Rdns,
    ExternalMapApi,
    ExternalIpApi,
    /// Registered coordinates of the probe or VM itself
    Probe,
}

impl fmt::Display for GeoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Geofeed => "geofeed",
            Self::Ispfeed => "ispfeed",
            Self::Peeringdb => "peeringdb",
            Self::Rdns => "rdns",
            Self::ExternalMapApi => "external_map_api",
            Self::ExternalIpApi => "external_ip_api",
            Self::Probe => "probe",
        };
        f.write_str(s)
    }
}

/// Resolved location of an address.
///
/// `place` and `country` are empty when a source knows the coordinates but
/// reverse geocoding could not name them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub place: String,
    /// ISO 3166-1 alpha-2
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub method: GeoMethod,
}

impl GeoRecord {
    pub fn new(place: &str, country: &str, at: Coordinates, method: GeoMethod) -> Self {
        Self {
            place: place.to_string(),
            country: country.to_string(),
            latitude: at.lat,
            longitude: at.lng,
            method,
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

/// One step of the resolution chain
#[async_trait]
pub trait LocationSource: Send + Sync {
    fn method(&self) -> GeoMethod;

    /// Locate `ip`; every failure inside the source is reported as `None`
    async fn locate(&self, ip: IpAddr) -> Option<GeoRecord>;
}

#[derive(Debug, Deserialize)]
struct OverrideRow {
    ip: IpAddr,
    _asn: Option<u32>,
    lat: f64,
    lng: f64,
    place: String,
    country: String,
    _tag: Option<String>,
}

/// Manually curated, authoritative locations (provider VMs, known routers)
#[derive(Debug, Default)]
pub struct LocalOverrides {
    entries: HashMap<IpAddr, GeoRecord>,
}

impl LocalOverrides {
    pub fn insert(&mut self, ip: IpAddr, place: &str, country: &str, at: Coordinates) {
        self.entries
            .insert(ip, GeoRecord::new(place, country, at, GeoMethod::Local));
    }

    pub fn get(&self, ip: IpAddr) -> Option<&GeoRecord> {
        self.entries.get(&ip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse headerless `ip,asn,lat,lng,place,country,tag` rows
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        let mut overrides = Self::default();
        for (idx, row) in csv.deserialize::<OverrideRow>().enumerate() {
            let row = row.with_context(|| format!("local overrides row {}", idx + 1))?;
            let at = Coordinates::new(row.lat, row.lng);
            if !at.is_valid() {
                log::warn!("local overrides: {} has invalid coordinates", row.ip);
                continue;
            }
            overrides.insert(row.ip, &row.place, &row.country, at);
        }
        Ok(overrides)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open local overrides: {}", path.display()))?;
        let overrides = Self::from_reader(file)?;
        log::info!("local overrides: {} addresses", overrides.len());
        Ok(overrides)
    }
}

/// Prioritized, cached IP geolocation
pub struct LocationResolver {
    overrides: LocalOverrides,
    cache: CacheTopic,
    sources: Vec<Box<dyn LocationSource>>,
}

impl LocationResolver {
    pub fn new(overrides: LocalOverrides, cache: CacheTopic) -> Self {
        Self {
            overrides,
            cache,
            sources: Vec::new(),
        }
    }

    /// Append a source after the ones already configured
    pub fn with_source<S: LocationSource + 'static>(mut self, source: S) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn push_source(&mut self, source: Box<dyn LocationSource>) {
        self.sources.push(source);
    }

    /// Methods of the configured sources, in resolution order
    pub fn chain(&self) -> Vec<GeoMethod> {
        self.sources.iter().map(|s| s.method()).collect()
    }

    /// Locate `ip`.
    ///
    /// With `cache_only`, nothing past the cache is consulted.
    pub async fn resolve(&self, ip: IpAddr, cache_only: bool) -> Option<GeoRecord> {
        if !is_global(ip) {
            return None;
        }

        if let Some(local) = self.overrides.get(ip) {
            return Some(local.clone());
        }

        let key = ip.to_string();
        if let Some(cached) = self.cache.get::<GeoRecord>(&key) {
            return Some(cached);
        }
        if cache_only {
            return None;
        }

        let _fill = self.cache.lock(&key).await;
        if let Some(cached) = self.cache.get::<GeoRecord>(&key) {
            return Some(cached);
        }

        for source in &self.sources {
            let Some(record) = source.locate(ip).await else {
                continue;
            };
            if !record.coordinates().is_valid() {
                log::debug!(
                    "{}: {} returned out-of-range coordinates, ignoring",
                    ip,
                    source.method()
                );
                continue;
            }
            self.cache.put(&key, &record);
            return Some(record);
        }

        None
    }
}
