//! Reverse DNS and router naming-convention hints.
//!
//! Operators often embed a location code in router hostnames
//! (`ae-1.r01.asbnva02.us.bb.example.net`). A per-domain table of anchored
//! regexes extracts the code, which is then turned into a location through
//! the CLLI table or the geohint attached to it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::{Resolver, TokioResolver};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tldextract::{TldExtractor, TldOption};

use super::cache::CacheTopic;
use super::external::{CachedGeocoder, cached_call};
use super::facility::ClliTable;
use super::geo::{Coordinates, GeoMethod, GeoRecord, LocationSource};

/// PTR lookups
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// `Ok(None)` only when the lookup completed and the address has no
    /// name; transport and server failures are errors.
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<Option<String>>;
}

/// PTR lookups through the system resolver
pub struct DnsLookup {
    resolver: TokioResolver,
}

impl DnsLookup {
    pub fn new() -> Self {
        // Try system DNS config first, fall back to Google DNS if unavailable
        let resolver = match Resolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                log::warn!("system DNS config unavailable ({}), using Google DNS", e);
                Resolver::builder_with_config(
                    ResolverConfig::google(),
                    hickory_resolver::name_server::TokioConnectionProvider::default(),
                )
                .build()
            }
        };
        Self { resolver }
    }
}

impl Default for DnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for DnsLookup {
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<Option<String>> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => Ok(lookup.iter().next().map(|name| {
                let s = name.to_string();
                // Remove trailing dot
                s.trim_end_matches('.').to_string()
            })),
            // NXDOMAIN or an empty answer: the address simply has no name
            Err(e) if e.is_nx_domain() || e.is_no_records_found() => {
                log::debug!("PTR {}: {}", ip, e);
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("PTR lookup for {} failed", ip)),
        }
    }
}

/// What a hostname's location code points at
#[derive(Debug, Clone, PartialEq)]
pub enum HintKind {
    /// CLLI location code, resolved through the CLLI table
    Clli(String),
    /// Named place; coordinates are forward geocoded when missing
    ExplicitPlace {
        place: String,
        country: String,
        at: Option<Coordinates>,
    },
    /// Coordinates only; the place is reverse geocoded
    ExplicitCoords(Coordinates),
}

#[derive(Debug, Deserialize)]
struct HintLine {
    domain: String,
    #[serde(default)]
    re: Vec<String>,
    #[serde(default)]
    geohints: Vec<GeoHint>,
}

#[derive(Debug, Deserialize)]
struct GeoHint {
    code: String,
    #[serde(rename = "type", default)]
    kind: String,
    lat: Option<Value>,
    lng: Option<Value>,
    location: Option<HintLocation>,
}

#[derive(Debug, Deserialize)]
struct HintLocation {
    place: String,
    cc: String,
}

/// Numbers appear both as JSON numbers and as strings
fn number(v: &Option<Value>) -> Option<f64> {
    match v.as_ref()? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl GeoHint {
    fn into_kind(self) -> Option<HintKind> {
        let at = match (number(&self.lat), number(&self.lng)) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        };
        if self.kind == "clli" {
            return Some(HintKind::Clli(self.code.chars().take(6).collect()));
        }
        match (self.location, at) {
            (Some(loc), at) => Some(HintKind::ExplicitPlace {
                place: loc.place,
                country: loc.cc,
                at,
            }),
            (None, Some(at)) => Some(HintKind::ExplicitCoords(at)),
            (None, None) => None,
        }
    }
}

struct DomainHints {
    patterns: Vec<Regex>,
    /// lower-case code -> hints, in file order
    hints: HashMap<String, Vec<HintKind>>,
}

/// Naming conventions keyed by registrable domain
pub struct HintTable {
    extractor: TldExtractor,
    domains: HashMap<String, DomainHints>,
}

impl Default for HintTable {
    fn default() -> Self {
        Self {
            extractor: TldExtractor::new(TldOption::default()),
            domains: HashMap::new(),
        }
    }
}

impl HintTable {
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Parse JSON lines of `{domain, re[], geohints[]}`.
    ///
    /// Patterns are anchored at the start of the hostname; patterns the regex
    /// engine rejects are skipped.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut table = Self::default();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: HintLine = serde_json::from_str(&line)
                .with_context(|| format!("naming hints line {}", lineno + 1))?;

            let patterns = entry
                .re
                .iter()
                .filter_map(|re| match Regex::new(&format!("^(?:{})", re)) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        log::debug!("{}: skipping pattern {} ({})", entry.domain, re, e);
                        None
                    }
                })
                .collect();

            let mut hints: HashMap<String, Vec<HintKind>> = HashMap::new();
            for hint in entry.geohints {
                let code = hint.code.to_lowercase();
                if let Some(kind) = hint.into_kind() {
                    hints.entry(code).or_default().push(kind);
                }
            }

            table
                .domains
                .insert(entry.domain.to_lowercase(), DomainHints { patterns, hints });
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open naming hints: {}", path.display()))?;
        let table = Self::from_reader(BufReader::new(file))?;
        log::info!("naming hints: {} domains", table.len());
        Ok(table)
    }

    /// Registrable domain (`example.co.uk`) of a hostname
    pub fn registrable_domain(&self, host: &str) -> Option<String> {
        let result = self.extractor.extract(&format!("http://{}", host)).ok()?;
        match (result.domain, result.suffix) {
            (Some(domain), Some(suffix)) => Some(format!("{}.{}", domain, suffix)),
            _ => None,
        }
    }

    /// Every hint the hostname points at, in pattern then file order
    pub fn candidates(&self, host: &str) -> Vec<HintKind> {
        let host = host.to_lowercase();
        let Some(domain) = self.registrable_domain(&host) else {
            return Vec::new();
        };
        let Some(entry) = self.domains.get(&domain) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for re in &entry.patterns {
            let Some(code) = re.captures(&host).and_then(|c| c.get(1)) else {
                continue;
            };
            if let Some(hints) = entry.hints.get(&code.as_str().to_lowercase()) {
                out.extend(hints.iter().cloned());
            }
        }
        out
    }

    /// First hint the hostname points at
    pub fn match_host(&self, host: &str) -> Option<HintKind> {
        self.candidates(host).into_iter().next()
    }
}

/// Location from the router's hostname
pub struct RdnsSource {
    resolver: Arc<dyn HostResolver>,
    hints: HintTable,
    clli: ClliTable,
    geocoder: Arc<CachedGeocoder>,
    cache: CacheTopic,
    timeout: Duration,
}

impl RdnsSource {
    pub fn new(
        resolver: Arc<dyn HostResolver>,
        hints: HintTable,
        clli: ClliTable,
        geocoder: Arc<CachedGeocoder>,
        cache: CacheTopic,
        timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            hints,
            clli,
            geocoder,
            cache,
            timeout,
        }
    }

    async fn resolve_hint(&self, hint: HintKind) -> Option<GeoRecord> {
        let (place, country, at) = match hint {
            HintKind::Clli(code) => {
                let at = self.clli.get(&code)?;
                let named = self.geocoder.reverse_geocode(at).await;
                let (place, country) = named.map(|p| (p.place, p.country)).unwrap_or_default();
                (place, country, at)
            }
            HintKind::ExplicitPlace { place, country, at } => {
                let at = match at {
                    Some(at) => at,
                    None => self.geocoder.geocode(&place, &country).await?,
                };
                (place, country, at)
            }
            HintKind::ExplicitCoords(at) => {
                let named = self.geocoder.reverse_geocode(at).await;
                let (place, country) = named.map(|p| (p.place, p.country)).unwrap_or_default();
                (place, country, at)
            }
        };
        Some(GeoRecord::new(&place, &country, at, GeoMethod::Rdns))
    }
}

#[async_trait]
impl LocationSource for RdnsSource {
    fn method(&self) -> GeoMethod {
        GeoMethod::Rdns
    }

    async fn locate(&self, ip: IpAddr) -> Option<GeoRecord> {
        let key = ip.to_string();
        let host: String =
            cached_call(&self.cache, &key, self.timeout, self.resolver.reverse_lookup(ip)).await?;

        for hint in self.hints.candidates(&host) {
            if let Some(record) = self.resolve_hint(hint).await {
                log::debug!("{} ({}) -> {}, {}", ip, host, record.place, record.country);
                return Some(record);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::cache::GeoCache;
    use crate::lookup::external::Place;
    use crate::lookup::external::tests::{FakeGeocoder, cached};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HINTS: &str = r#"{"domain": "example.net", "re": ["^[a-z0-9-]+\\.([a-z]{6})\\d+\\.example\\.net$", "^([a-z]{3})\\d*-[a-z0-9]+\\.example\\.net$"], "geohints": [{"code": "asbnva", "type": "clli"}, {"code": "fra", "type": "iata", "lat": "50.0333", "lng": "8.5706", "location": {"place": "Frankfurt", "cc": "DE"}}, {"code": "ams", "type": "iata", "location": {"place": "Amsterdam", "cc": "NL"}}, {"code": "sin", "type": "iata", "lat": 1.35, "lng": 103.99}]}
{"domain": "example.co.uk", "re": ["(lon)\\d+\\.example\\.co\\.uk"], "geohints": [{"code": "lon", "type": "place", "location": {"place": "London", "cc": "GB"}}, {"code": "bad", "type": "iata"}]}"#;

    fn table() -> HintTable {
        HintTable::from_reader(Cursor::new(HINTS)).unwrap()
    }

    #[test]
    fn test_registrable_domain() {
        let t = table();
        assert_eq!(
            t.registrable_domain("ae1.asbnva02.example.net").as_deref(),
            Some("example.net")
        );
        assert_eq!(
            t.registrable_domain("lon01.example.co.uk").as_deref(),
            Some("example.co.uk")
        );
    }

    #[test]
    fn test_match_host() {
        let t = table();
        assert_eq!(t.len(), 2);
        assert_eq!(
            t.match_host("ae-1.ASBNVA02.example.net"),
            Some(HintKind::Clli("asbnva".to_string()))
        );
        assert_eq!(
            t.match_host("fra1-core.example.net"),
            Some(HintKind::ExplicitPlace {
                place: "Frankfurt".to_string(),
                country: "DE".to_string(),
                at: Some(Coordinates::new(50.0333, 8.5706)),
            })
        );
        assert_eq!(
            t.match_host("sin-edge.example.net"),
            Some(HintKind::ExplicitCoords(Coordinates::new(1.35, 103.99)))
        );
        assert_eq!(
            t.match_host("lon01.example.co.uk"),
            Some(HintKind::ExplicitPlace {
                place: "London".to_string(),
                country: "GB".to_string(),
                at: None,
            })
        );
        // Code with no hint, unmatched host, unknown domain
        assert!(t.match_host("xyz1-core.example.net").is_none());
        assert!(t.match_host("core.example.net").is_none());
        assert!(t.match_host("ae1.asbnva02.other.org").is_none());
    }

    #[test]
    fn test_patterns_are_anchored() {
        // The co.uk pattern has no leading ^ but must still match from the start
        let t = table();
        assert!(t.match_host("xlon01.example.co.uk").is_none());
    }

    struct FakeDns {
        names: HashMap<IpAddr, String>,
        calls: AtomicUsize,
        /// Every lookup times out
        down: bool,
    }

    #[async_trait]
    impl HostResolver for FakeDns {
        async fn reverse_lookup(&self, ip: IpAddr) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down {
                return Err(anyhow::anyhow!("request timed out"));
            }
            Ok(self.names.get(&ip).cloned())
        }
    }

    fn source(geocoder: FakeGeocoder) -> (RdnsSource, Arc<FakeDns>) {
        let mut names = HashMap::new();
        names.insert("1.0.0.1".parse().unwrap(), "ae-1.asbnva02.example.net".to_string());
        names.insert("1.0.0.2".parse().unwrap(), "ams3-core.example.net".to_string());
        names.insert("1.0.0.3".parse().unwrap(), "lon01.example.co.uk".to_string());
        let dns = Arc::new(FakeDns {
            names,
            calls: AtomicUsize::new(0),
            down: false,
        });

        let mut clli = ClliTable::default();
        clli.insert("ASBNVA", Coordinates::new(39.04, -77.48));

        let cache = Arc::new(GeoCache::in_memory());
        let source = RdnsSource::new(
            dns.clone(),
            table(),
            clli,
            Arc::new(cached(Arc::new(geocoder))),
            cache.topic("rdns"),
            Duration::from_secs(1),
        );
        (source, dns)
    }

    #[tokio::test]
    async fn test_clli_hint_is_reverse_geocoded() {
        let geocoder = FakeGeocoder::default();
        *geocoder.reverse.lock() = Some(Place {
            place: "Loudoun County".to_string(),
            country: "US".to_string(),
        });
        let (source, dns) = source(geocoder);

        let rec = source.locate("1.0.0.1".parse().unwrap()).await.unwrap();
        assert_eq!(rec.place, "Loudoun County");
        assert_eq!(rec.coordinates(), Coordinates::new(39.04, -77.48));
        assert_eq!(rec.method, GeoMethod::Rdns);

        // Hostname comes from the cache the second time
        source.locate("1.0.0.1".parse().unwrap()).await.unwrap();
        assert_eq!(dns.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolver_failure_is_not_cached() {
        let dns = Arc::new(FakeDns {
            names: HashMap::new(),
            calls: AtomicUsize::new(0),
            down: true,
        });
        let cache = Arc::new(GeoCache::in_memory());
        let topic = cache.topic("rdns");
        let source = RdnsSource::new(
            dns.clone(),
            table(),
            ClliTable::default(),
            Arc::new(cached(Arc::new(FakeGeocoder::default()))),
            topic.clone(),
            Duration::from_secs(1),
        );

        let ip: IpAddr = "1.0.0.1".parse().unwrap();
        assert!(source.locate(ip).await.is_none());
        assert!(topic.get::<Option<String>>("1.0.0.1").is_none());
        assert!(source.locate(ip).await.is_none());
        assert_eq!(dns.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_name_is_cached() {
        let (source, dns) = source(FakeGeocoder::default());
        let ip: IpAddr = "1.0.0.9".parse().unwrap();
        assert!(source.locate(ip).await.is_none());
        assert!(source.locate(ip).await.is_none());
        assert_eq!(dns.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_place_hint_is_forward_geocoded() {
        let mut geocoder = FakeGeocoder::default();
        geocoder
            .places
            .insert("amsterdam,nl".to_string(), Coordinates::new(52.37, 4.89));
        let (source, _) = source(geocoder);

        let rec = source.locate("1.0.0.2".parse().unwrap()).await.unwrap();
        assert_eq!(rec.place, "Amsterdam");
        assert_eq!(rec.country, "NL");

        // London is unknown to the geocoder, nothing else to try
        assert!(source.locate("1.0.0.3".parse().unwrap()).await.is_none());
        // No PTR record
        assert!(source.locate("1.0.0.9".parse().unwrap()).await.is_none());
    }
}
