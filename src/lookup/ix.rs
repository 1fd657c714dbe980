//! Internet Exchange directory from PeeringDB dumps
//!
//! Exchange peering LAN prefixes and the individual member addresses on
//! them map to the exchange, whose city is forward geocoded.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::external::CachedGeocoder;
use super::geo::{GeoMethod, GeoRecord, LocationSource};
use super::sanitize_display;
use super::trie::PrefixTrie;

/// PeeringDB API response wrapper
#[derive(Debug, Deserialize)]
struct PdbResponse<T> {
    data: Vec<T>,
}

/// IX record from PeeringDB /api/ix
#[derive(Debug, Deserialize)]
struct PdbIx {
    id: u32,
    name: String,
    city: Option<String>,
    country: Option<String>,
}

/// IX LAN record from PeeringDB /api/ixlan
#[derive(Debug, Deserialize)]
struct PdbIxlan {
    id: u32,
    ix_id: u32,
}

/// IX prefix record from PeeringDB /api/ixpfx
#[derive(Debug, Deserialize)]
struct PdbIxpfx {
    ixlan_id: u32,
    prefix: String,
}

/// Member port record from PeeringDB /api/netixlan
#[derive(Debug, Deserialize)]
struct PdbNetixlan {
    ix_id: u32,
    ipaddr4: Option<IpAddr>,
    ipaddr6: Option<IpAddr>,
}

/// Endpoints the directory is built from
pub const DUMPS: [&str; 4] = ["ix", "ixlan", "ixpfx", "netixlan"];

/// Dumps younger than this are not fetched again
pub const MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// File name of a dump inside the PeeringDB data directory
pub fn dump_file(endpoint: &str) -> String {
    format!("peeringdb_{}.json", endpoint)
}

/// Exchange metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IxInfo {
    pub name: String,
    pub city: Option<String>,
    pub country: Option<String>,
}

impl IxInfo {
    /// First city of a `", "`-separated list
    pub fn primary_city(&self) -> Option<&str> {
        let city = self.city.as_deref()?;
        let first = city.split(", ").next().unwrap_or(city).trim();
        (!first.is_empty()).then_some(first)
    }
}

/// Peering LAN prefix / member address -> exchange
#[derive(Default)]
pub struct IxDirectory {
    exchanges: HashMap<u32, IxInfo>,
    trie: PrefixTrie<u32>,
}

fn parse_dump<T: serde::de::DeserializeOwned, R: Read>(reader: R, endpoint: &str) -> Result<Vec<T>> {
    let resp: PdbResponse<T> = serde_json::from_reader(reader)
        .with_context(|| format!("malformed PeeringDB {} dump", endpoint))?;
    Ok(resp.data)
}

impl IxDirectory {
    /// Build from the four dumps
    pub fn from_readers<R: Read>(ix: R, ixlan: R, ixpfx: R, netixlan: R) -> Result<Self> {
        let ix: Vec<PdbIx> = parse_dump(ix, "ix")?;
        let ixlan: Vec<PdbIxlan> = parse_dump(ixlan, "ixlan")?;
        let ixpfx: Vec<PdbIxpfx> = parse_dump(ixpfx, "ixpfx")?;
        let netixlan: Vec<PdbNetixlan> = parse_dump(netixlan, "netixlan")?;

        // Sanitize names for safe terminal display
        let exchanges: HashMap<u32, IxInfo> = ix
            .into_iter()
            .map(|ix| {
                (
                    ix.id,
                    IxInfo {
                        name: sanitize_display(&ix.name),
                        city: ix.city.as_deref().map(sanitize_display),
                        country: ix.country.as_deref().map(sanitize_display),
                    },
                )
            })
            .collect();

        // ixlan_id -> ix_id
        let ixlan_to_ix: HashMap<u32, u32> = ixlan.iter().map(|lan| (lan.id, lan.ix_id)).collect();

        let mut trie = PrefixTrie::new();
        for pfx in ixpfx {
            let Some(&ix_id) = ixlan_to_ix.get(&pfx.ixlan_id) else {
                continue;
            };
            if let Err(e) = trie.insert_str(&pfx.prefix, ix_id) {
                log::debug!("peeringdb: skipping prefix {} ({:#})", pfx.prefix, e);
            }
        }
        // Member addresses override the LAN prefix they sit in
        for port in netixlan {
            for ip in [port.ipaddr4, port.ipaddr6].into_iter().flatten() {
                trie.insert_addr(ip, port.ix_id);
            }
        }

        Ok(Self { exchanges, trie })
    }

    /// Load the dumps written by [`download`] from `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let open = |endpoint: &str| {
            let path = dir.join(dump_file(endpoint));
            fs::File::open(&path)
                .map(std::io::BufReader::new)
                .with_context(|| format!("failed to open PeeringDB dump: {}", path.display()))
        };
        let directory = Self::from_readers(open("ix")?, open("ixlan")?, open("ixpfx")?, open("netixlan")?)?;
        log::info!(
            "peeringdb: {} exchanges, {} prefixes and member addresses",
            directory.exchanges.len(),
            directory.trie.len()
        );
        Ok(directory)
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<&IxInfo> {
        let ix_id = self.trie.lookup(ip)?;
        self.exchanges.get(ix_id)
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

/// Whether every dump in `dir` exists and is younger than [`MAX_AGE`]
pub fn dumps_fresh(dir: &Path) -> bool {
    DUMPS.iter().all(|endpoint| {
        fs::metadata(dir.join(dump_file(endpoint)))
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age < MAX_AGE)
    })
}

/// Fetch all dumps into `dir`.
///
/// An API key lifts the anonymous rate limit.
pub async fn download(dir: &Path, api_key: Option<&str>, timeout: Duration) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create PeeringDB dir: {}", dir.display()))?;

    // PeeringDB requires User-Agent to prevent scraping blocks
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(format!("bordermap/{}", env!("CARGO_PKG_VERSION")));

    if let Some(key) = api_key {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Api-Key {}", key)) {
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
    }
    let client = builder.build()?;

    let (ix, ixlan, ixpfx, netixlan) = tokio::join!(
        fetch_dump(&client, "ix"),
        fetch_dump(&client, "ixlan"),
        fetch_dump(&client, "ixpfx"),
        fetch_dump(&client, "netixlan"),
    );

    // Validate everything before replacing any file on disk
    let bodies = [("ix", ix?), ("ixlan", ixlan?), ("ixpfx", ixpfx?), ("netixlan", netixlan?)];
    IxDirectory::from_readers(
        bodies[0].1.as_bytes(),
        bodies[1].1.as_bytes(),
        bodies[2].1.as_bytes(),
        bodies[3].1.as_bytes(),
    )?;

    for (endpoint, body) in &bodies {
        let path = dir.join(dump_file(endpoint));
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        log::info!("peeringdb: wrote {} ({} bytes)", path.display(), body.len());
    }
    Ok(())
}

/// Note: limit=0 disables pagination to fetch all records
async fn fetch_dump(client: &reqwest::Client, endpoint: &str) -> Result<String> {
    let url = format!("https://www.peeringdb.com/api/{}?limit=0", endpoint);
    let body = client
        .get(&url)
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("GET {}", url))?
        .text()
        .await?;
    Ok(body)
}

/// Exchange hit, placed by forward geocoding its (first) city
pub struct PeeringDbSource {
    directory: IxDirectory,
    geocoder: Arc<CachedGeocoder>,
}

impl PeeringDbSource {
    pub fn new(directory: IxDirectory, geocoder: Arc<CachedGeocoder>) -> Self {
        Self { directory, geocoder }
    }
}

#[async_trait]
impl LocationSource for PeeringDbSource {
    fn method(&self) -> GeoMethod {
        GeoMethod::Peeringdb
    }

    async fn locate(&self, ip: IpAddr) -> Option<GeoRecord> {
        let ix = self.directory.lookup(ip)?;
        let city = ix.primary_city()?;
        let country = ix.country.as_deref().unwrap_or_default();
        let at = self.geocoder.geocode(city, country).await?;
        Some(GeoRecord::new(city, country, at, GeoMethod::Peeringdb))
    }
}
