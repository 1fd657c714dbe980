//! Self-published operator geofeeds (RFC 8805).

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use super::external::CachedGeocoder;
use super::geo::{GeoMethod, GeoRecord, LocationSource};
use super::is_global;
use super::trie::PrefixTrie;

/// One geofeed row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeofeedEntry {
    pub prefix: IpNetwork,
    pub country: String,
    pub region: String,
    pub city: String,
    pub postal: String,
}

impl GeofeedEntry {
    /// City, or region when the city is empty
    pub fn place(&self) -> &str {
        if self.city.is_empty() {
            &self.region
        } else {
            &self.city
        }
    }
}

/// Parse one `prefix,country,region,city,postal` line.
///
/// Comments after `#` are dropped. Lines without exactly five fields, with
/// an unparsable prefix or with a non-global prefix yield `None`.
pub fn parse_line(line: &str) -> Option<GeofeedEntry> {
    let line = match line.find('#') {
        Some(p) => &line[..p],
        None => line,
    };
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let record = reader.records().next()?.ok()?;
    if record.len() != 5 {
        return None;
    }

    let prefix: IpNetwork = record[0].trim().parse().ok()?;
    if !is_global(prefix.network()) {
        return None;
    }

    Some(GeofeedEntry {
        prefix,
        country: record[1].trim().to_string(),
        region: record[2].trim().to_string(),
        city: record[3].trim().to_string(),
        postal: record[4].trim().to_string(),
    })
}

/// Longest-prefix table over any number of geofeed files
#[derive(Default)]
pub struct GeofeedTable {
    trie: PrefixTrie<GeofeedEntry>,
}

impl GeofeedTable {
    pub fn insert(&mut self, entry: GeofeedEntry) {
        self.trie.insert(entry.prefix, entry);
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<&GeofeedEntry> {
        self.trie.lookup(ip)
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    /// Add every valid row of `reader`; later files override earlier ones per prefix
    pub fn extend_from_reader<R: BufRead>(&mut self, reader: R) -> Result<usize> {
        let mut added = 0;
        for line in reader.lines() {
            if let Some(entry) = parse_line(&line?) {
                self.insert(entry);
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut table = Self::default();
        for path in paths {
            let path = path.as_ref();
            let file = File::open(path)
                .with_context(|| format!("failed to open geofeed: {}", path.display()))?;
            let added = table.extend_from_reader(BufReader::new(file))?;
            log::debug!("geofeed {}: {} rows", path.display(), added);
        }
        log::info!("geofeeds: {} prefixes", table.len());
        Ok(table)
    }
}

/// Geofeed hit, placed by forward geocoding its city and country
pub struct GeofeedSource {
    table: GeofeedTable,
    geocoder: Arc<CachedGeocoder>,
}

impl GeofeedSource {
    pub fn new(table: GeofeedTable, geocoder: Arc<CachedGeocoder>) -> Self {
        Self { table, geocoder }
    }
}

#[async_trait]
impl LocationSource for GeofeedSource {
    fn method(&self) -> GeoMethod {
        GeoMethod::Geofeed
    }

    async fn locate(&self, ip: IpAddr) -> Option<GeoRecord> {
        let entry = self.table.lookup(ip)?;
        let place = entry.place();
        if place.is_empty() || entry.country.is_empty() {
            return None;
        }
        let at = self.geocoder.geocode(place, &entry.country).await?;
        Some(GeoRecord::new(place, &entry.country, at, GeoMethod::Geofeed))
    }
}
