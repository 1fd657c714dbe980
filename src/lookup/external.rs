//! External geocoding and IP geolocation services.
//!
//! Every service is reached through a cache topic and a per-call timeout.
//! A failed or timed-out call is logged and reported as "no answer"; only
//! completed answers (including empty ones) are cached.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::cache::CacheTopic;
use super::geo::{Coordinates, GeoMethod, GeoRecord, LocationSource};

/// A named place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub place: String,
    pub country: String,
}

/// Forward and reverse geocoding
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>>;
    async fn reverse_geocode(&self, at: Coordinates) -> Result<Option<Place>>;
}

/// A remote IP geolocation service
#[async_trait]
pub trait IpGeoService: Send + Sync {
    /// Cache topic the answers are stored under
    fn topic(&self) -> &'static str;
    fn method(&self) -> GeoMethod;
    async fn locate(&self, ip: IpAddr) -> Result<Option<GeoRecord>>;
}

/// Run `call` through `topic`: cached answers short-circuit, completed
/// answers are stored, failures and timeouts yield `None` uncached.
///
/// Concurrent misses on one key wait for the first caller's answer
/// instead of repeating the call.
pub async fn cached_call<T, F>(topic: &CacheTopic, key: &str, timeout: Duration, call: F) -> Option<T>
where
    T: Serialize + DeserializeOwned,
    F: Future<Output = Result<Option<T>>>,
{
    if let Some(hit) = topic.get::<Option<T>>(key) {
        return hit;
    }
    let _fill = topic.lock(key).await;
    if let Some(hit) = topic.get::<Option<T>>(key) {
        return hit;
    }

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(answer)) => {
            topic.put(key, &answer);
            answer
        }
        Ok(Err(e)) => {
            log::warn!("{} lookup for {} failed: {:#}", topic.name(), key, e);
            None
        }
        Err(_) => {
            log::warn!("{} lookup for {} timed out after {:?}", topic.name(), key, timeout);
            None
        }
    }
}

/// Build the shared HTTP client for external services
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(format!("bordermap/{}", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Geocoder with forward and reverse answers cached
pub struct CachedGeocoder {
    inner: Option<Arc<dyn Geocoder>>,
    forward: CacheTopic,
    reverse: CacheTopic,
    timeout: Duration,
}

impl CachedGeocoder {
    pub fn new(inner: Arc<dyn Geocoder>, forward: CacheTopic, reverse: CacheTopic, timeout: Duration) -> Self {
        Self {
            inner: Some(inner),
            forward,
            reverse,
            timeout,
        }
    }

    /// Serve previously cached answers only
    pub fn offline(forward: CacheTopic, reverse: CacheTopic) -> Self {
        Self {
            inner: None,
            forward,
            reverse,
            timeout: Duration::ZERO,
        }
    }

    /// Coordinates of `place, country`
    pub async fn geocode(&self, place: &str, country: &str) -> Option<Coordinates> {
        let address = format!("{},{}", place, country).to_lowercase();
        match &self.inner {
            Some(inner) => cached_call(&self.forward, &address, self.timeout, inner.geocode(&address)).await,
            None => self.forward.get::<Option<Coordinates>>(&address).flatten(),
        }
    }

    /// Place and country at `at`
    pub async fn reverse_geocode(&self, at: Coordinates) -> Option<Place> {
        let key = format!("{:.5},{:.5}", at.lat, at.lng);
        match &self.inner {
            Some(inner) => cached_call(&self.reverse, &key, self.timeout, inner.reverse_geocode(at)).await,
            None => self.reverse.get::<Option<Place>>(&key).flatten(),
        }
    }
}

/// Location source backed by an [`IpGeoService`]
pub struct ExternalSource {
    service: Arc<dyn IpGeoService>,
    cache: CacheTopic,
    timeout: Duration,
}

impl ExternalSource {
    pub fn new(service: Arc<dyn IpGeoService>, cache: CacheTopic, timeout: Duration) -> Self {
        Self {
            service,
            cache,
            timeout,
        }
    }
}

#[async_trait]
impl LocationSource for ExternalSource {
    fn method(&self) -> GeoMethod {
        self.service.method()
    }

    async fn locate(&self, ip: IpAddr) -> Option<GeoRecord> {
        let key = ip.to_string();
        cached_call(&self.cache, &key, self.timeout, self.service.locate(ip)).await
    }
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    results: Vec<GoogleResult>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleResult {
    geometry: Option<GoogleGeometry>,
    #[serde(default)]
    address_components: Vec<GoogleComponent>,
}

#[derive(Debug, Deserialize)]
struct GoogleGeometry {
    location: Coordinates,
}

#[derive(Debug, Deserialize)]
struct GoogleComponent {
    long_name: String,
    short_name: String,
    #[serde(default)]
    types: Vec<String>,
}

fn google_results(resp: GoogleResponse) -> Result<Vec<GoogleResult>> {
    match resp.status.as_str() {
        "OK" | "ZERO_RESULTS" => Ok(resp.results),
        other => Err(anyhow!(
            "geocoding status {}: {}",
            other,
            resp.error_message.unwrap_or_default()
        )),
    }
}

/// Coordinates of the first geocoding result
fn parse_geocode(resp: GoogleResponse) -> Result<Option<Coordinates>> {
    let results = google_results(resp)?;
    Ok(results
        .into_iter()
        .next()
        .and_then(|r| r.geometry)
        .map(|g| g.location))
}

/// County-level name (falling back to state) and country code of the first result
fn parse_reverse_geocode(resp: GoogleResponse) -> Result<Option<Place>> {
    let results = google_results(resp)?;
    let Some(first) = results.into_iter().next() else {
        return Ok(None);
    };

    let mut level1 = None;
    let mut level2 = None;
    let mut country = None;
    for c in first.address_components {
        let has = |t: &str| c.types.iter().any(|x| x == t);
        if has("administrative_area_level_1") {
            level1 = Some(c.long_name.clone());
        }
        if has("administrative_area_level_2") {
            level2 = Some(c.long_name.clone());
        }
        if has("country") {
            country = Some(c.short_name.clone());
        }
    }

    let Some(country) = country else {
        return Ok(None);
    };
    Ok(Some(Place {
        place: level2.or(level1).unwrap_or_default(),
        country,
    }))
}

/// Google Maps geocoding API
pub struct GoogleGeocoder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleGeocoder {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: "https://maps.googleapis.com/maps/api/geocode/json".to_string(),
        }
    }

    async fn query(&self, params: &[(&str, &str)]) -> Result<GoogleResponse> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>> {
        parse_geocode(self.query(&[("address", address)]).await?)
    }

    async fn reverse_geocode(&self, at: Coordinates) -> Result<Option<Place>> {
        let latlng = format!("{},{}", at.lat, at.lng);
        parse_reverse_geocode(self.query(&[("latlng", latlng.as_str())]).await?)
    }
}

#[derive(Debug, Deserialize)]
struct IpMapResponse {
    #[serde(default)]
    locations: Vec<IpMapLocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpMapLocation {
    city_name: Option<String>,
    country_code_alpha2: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

fn parse_ipmap(resp: IpMapResponse) -> Option<GeoRecord> {
    resp.locations.into_iter().find_map(|loc| {
        Some(GeoRecord::new(
            &loc.city_name?,
            &loc.country_code_alpha2?,
            Coordinates::new(loc.latitude?, loc.longitude?),
            GeoMethod::ExternalMapApi,
        ))
    })
}

/// RIPE IPmap single-address locate endpoint
pub struct RipeIpMap {
    client: reqwest::Client,
    base_url: String,
}

impl RipeIpMap {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://ipmap-api.ripe.net/v1/locate".to_string(),
        }
    }
}

#[async_trait]
impl IpGeoService for RipeIpMap {
    fn topic(&self) -> &'static str {
        "ipmap"
    }

    fn method(&self) -> GeoMethod {
        GeoMethod::ExternalMapApi
    }

    async fn locate(&self, ip: IpAddr) -> Result<Option<GeoRecord>> {
        let url = format!("{}/{}", self.base_url, ip);
        let resp: IpMapResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_ipmap(resp))
    }
}

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    city: Option<String>,
    country: Option<String>,
    loc: Option<String>,
    #[serde(default)]
    bogon: bool,
}

fn parse_ipinfo(resp: IpInfoResponse) -> Option<GeoRecord> {
    if resp.bogon {
        return None;
    }
    let loc = resp.loc?;
    let (lat, lng) = loc.split_once(',')?;
    let at = Coordinates::new(lat.trim().parse().ok()?, lng.trim().parse().ok()?);
    Some(GeoRecord::new(
        &resp.city?,
        &resp.country?,
        at,
        GeoMethod::ExternalIpApi,
    ))
}

/// ipinfo.io details endpoint
pub struct IpInfo {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl IpInfo {
    pub fn new(client: reqwest::Client, token: String) -> Self {
        Self {
            client,
            token,
            base_url: "https://ipinfo.io".to_string(),
        }
    }
}

#[async_trait]
impl IpGeoService for IpInfo {
    fn topic(&self) -> &'static str {
        "ipinfo"
    }

    fn method(&self) -> GeoMethod {
        GeoMethod::ExternalIpApi
    }

    async fn locate(&self, ip: IpAddr) -> Result<Option<GeoRecord>> {
        let url = format!("{}/{}/json", self.base_url, ip);
        let resp: IpInfoResponse = self
            .client
            .get(url)
            .query(&[("token", self.token.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_ipinfo(resp))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lookup::cache::GeoCache;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory geocoder that counts calls
    #[derive(Default)]
    pub(crate) struct FakeGeocoder {
        pub places: HashMap<String, Coordinates>,
        pub reverse: Mutex<Option<Place>>,
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl Geocoder for FakeGeocoder {
        async fn geocode(&self, address: &str) -> Result<Option<Coordinates>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("quota exceeded"));
            }
            Ok(self.places.get(address).copied())
        }

        async fn reverse_geocode(&self, _at: Coordinates) -> Result<Option<Place>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("quota exceeded"));
            }
            Ok(self.reverse.lock().clone())
        }
    }

    pub(crate) fn cached(geocoder: Arc<FakeGeocoder>) -> CachedGeocoder {
        let cache = Arc::new(GeoCache::in_memory());
        CachedGeocoder::new(
            geocoder,
            cache.topic("geocode"),
            cache.topic("reverse_geocode"),
            Duration::from_secs(1),
        )
    }

    struct FlakyService {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IpGeoService for FlakyService {
        fn topic(&self) -> &'static str {
            "flaky"
        }

        fn method(&self) -> GeoMethod {
            GeoMethod::ExternalIpApi
        }

        async fn locate(&self, _ip: IpAddr) -> Result<Option<GeoRecord>> {
            // Fails on the first call, answers afterwards
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(anyhow!("connection reset"));
            }
            Ok(Some(GeoRecord::new(
                "Mountain View",
                "US",
                Coordinates::new(37.386, -122.0838),
                GeoMethod::ExternalIpApi,
            )))
        }
    }

    #[tokio::test]
    async fn test_geocode_is_cached_per_address() {
        let mut fake = FakeGeocoder::default();
        fake.places
            .insert("frankfurt,de".to_string(), Coordinates::new(50.11, 8.68));
        let fake = Arc::new(fake);
        let geocoder = cached(fake.clone());

        assert_eq!(
            geocoder.geocode("Frankfurt", "DE").await,
            Some(Coordinates::new(50.11, 8.68))
        );
        assert!(geocoder.geocode("frankfurt", "de").await.is_some());
        // Empty answers are cached as well
        assert!(geocoder.geocode("Atlantis", "XX").await.is_none());
        assert!(geocoder.geocode("Atlantis", "XX").await.is_none());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let fake = Arc::new(FakeGeocoder {
            fail: true,
            ..Default::default()
        });
        let geocoder = cached(fake.clone());

        assert!(geocoder.geocode("Paris", "FR").await.is_none());
        assert!(geocoder.geocode("Paris", "FR").await.is_none());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_offline_geocoder_serves_cache() {
        let cache = Arc::new(GeoCache::in_memory());
        let forward = cache.topic("geocode");
        forward.put("seattle,us", &Some(Coordinates::new(47.6, -122.33)));
        let geocoder = CachedGeocoder::offline(forward, cache.topic("reverse_geocode"));

        assert!(geocoder.geocode("Seattle", "US").await.is_some());
        assert!(geocoder.geocode("Portland", "US").await.is_none());
        assert!(geocoder.reverse_geocode(Coordinates::new(1.0, 1.0)).await.is_none());
    }

    struct SlowService {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IpGeoService for SlowService {
        fn topic(&self) -> &'static str {
            "slow"
        }

        fn method(&self) -> GeoMethod {
            GeoMethod::ExternalMapApi
        }

        async fn locate(&self, _ip: IpAddr) -> Result<Option<GeoRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Some(GeoRecord::new(
                "Frankfurt",
                "DE",
                Coordinates::new(50.11, 8.68),
                GeoMethod::ExternalMapApi,
            )))
        }
    }

    #[tokio::test]
    async fn test_concurrent_misses_call_once() {
        let service = Arc::new(SlowService {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(GeoCache::in_memory());
        let source = ExternalSource::new(service.clone(), cache.topic("slow"), Duration::from_secs(1));
        let ip: IpAddr = "8.8.8.8".parse().unwrap();

        let (a, b) = tokio::join!(source.locate(ip), source.locate(ip));
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_external_source_retries_after_failure() {
        let service = Arc::new(FlakyService {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(GeoCache::in_memory());
        let source = ExternalSource::new(service.clone(), cache.topic("flaky"), Duration::from_secs(1));
        let ip: IpAddr = "8.8.8.8".parse().unwrap();

        assert!(source.locate(ip).await.is_none());
        assert!(source.locate(ip).await.is_some());
        assert!(source.locate(ip).await.is_some());
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parse_google_geocode() {
        let json = r#"{"status": "OK", "results": [
            {"geometry": {"location": {"lat": 52.3676, "lng": 4.9041}}, "address_components": []}
        ]}"#;
        let resp: GoogleResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parse_geocode(resp).unwrap(),
            Some(Coordinates::new(52.3676, 4.9041))
        );

        let zero: GoogleResponse = serde_json::from_str(r#"{"status": "ZERO_RESULTS", "results": []}"#).unwrap();
        assert_eq!(parse_geocode(zero).unwrap(), None);

        let denied: GoogleResponse =
            serde_json::from_str(r#"{"status": "REQUEST_DENIED", "error_message": "bad key"}"#).unwrap();
        assert!(parse_geocode(denied).is_err());
    }

    #[test]
    fn test_parse_google_reverse_geocode() {
        let json = r#"{"status": "OK", "results": [{"address_components": [
            {"long_name": "Loudoun County", "short_name": "Loudoun County", "types": ["administrative_area_level_2", "political"]},
            {"long_name": "Virginia", "short_name": "VA", "types": ["administrative_area_level_1", "political"]},
            {"long_name": "United States", "short_name": "US", "types": ["country", "political"]}
        ]}]}"#;
        let resp: GoogleResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parse_reverse_geocode(resp).unwrap(),
            Some(Place {
                place: "Loudoun County".to_string(),
                country: "US".to_string()
            })
        );

        let no_country = r#"{"status": "OK", "results": [{"address_components": [
            {"long_name": "Somewhere", "short_name": "SW", "types": ["administrative_area_level_1"]}
        ]}]}"#;
        let resp: GoogleResponse = serde_json::from_str(no_country).unwrap();
        assert_eq!(parse_reverse_geocode(resp).unwrap(), None);
    }

    #[test]
    fn test_parse_ipmap_and_ipinfo() {
        let ipmap: IpMapResponse = serde_json::from_str(
            r#"{"locations": [
                {"cityName": null, "countryCodeAlpha2": "NL"},
                {"cityName": "Amsterdam", "countryCodeAlpha2": "NL", "latitude": 52.37, "longitude": 4.89, "score": 0.9}
            ]}"#,
        )
        .unwrap();
        let rec = parse_ipmap(ipmap).unwrap();
        assert_eq!(rec.place, "Amsterdam");
        assert_eq!(rec.method, GeoMethod::ExternalMapApi);

        let info: IpInfoResponse = serde_json::from_str(
            r#"{"ip": "8.8.8.8", "city": "Mountain View", "country": "US", "loc": "37.4056,-122.0775"}"#,
        )
        .unwrap();
        let rec = parse_ipinfo(info).unwrap();
        assert_eq!(rec.coordinates(), Coordinates::new(37.4056, -122.0775));

        let bogon: IpInfoResponse =
            serde_json::from_str(r#"{"ip": "10.0.0.1", "bogon": true}"#).unwrap();
        assert!(parse_ipinfo(bogon).is_none());
    }
}
