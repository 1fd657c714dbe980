//! Wiring of the resolvers from the configured registry files.
//!
//! Missing registry files leave their source out of the chain with a
//! warning; unreadable or malformed ones are errors.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::lookup::asn::{AsnOrgs, BgpTable, IxpMembers, OriginResolver, ProviderFeedTable};
use crate::lookup::cache::GeoCache;
use crate::lookup::cloud::{Provider, ProviderPopSource, border_group_trie, load_feed};
use crate::lookup::external::{
    CachedGeocoder, ExternalSource, GoogleGeocoder, IpGeoService, IpInfo, RipeIpMap, http_client,
};
use crate::lookup::facility::{ClliTable, IataTable};
use crate::lookup::geo::{LocalOverrides, LocationResolver};
use crate::lookup::geofeed::{GeofeedSource, GeofeedTable};
use crate::lookup::ix::{IxDirectory, PeeringDbSource};
use crate::lookup::rdns::{DnsLookup, HintTable, RdnsSource};

/// Load `path` with `load` if it exists
fn load_optional<T>(what: &str, path: PathBuf, load: impl FnOnce(&Path) -> Result<T>) -> Result<Option<T>> {
    if !path.exists() {
        log::warn!("{} not found at {}, skipping", what, path.display());
        return Ok(None);
    }
    load(&path).map(Some)
}

/// Origin resolution from the BGP table, IXP membership and every
/// provider feed that is present
pub fn origin_resolver(config: &Config) -> Result<OriginResolver> {
    let mut resolver = OriginResolver::new();

    if let Some(bgp) = load_optional("BGP table", config.data_path(&config.files.bgp), BgpTable::load)? {
        resolver = resolver.with_source(bgp);
    }
    if let Some(ixp) = load_optional(
        "IXP membership",
        config.data_path(&config.files.ixp_members),
        IxpMembers::load,
    )? {
        resolver = resolver.with_source(ixp);
    }

    let mut feeds = ProviderFeedTable::new();
    for provider in Provider::ALL {
        let path = config.data_path(config.files.feed(provider));
        if let Some(prefixes) = load_optional("provider feed", path, |p| load_feed(provider, p))? {
            feeds.add_feed(&prefixes, provider.feed_asn());
        }
    }
    if !feeds.is_empty() {
        resolver = resolver.with_source(feeds);
    }

    if let Some(orgs) = load_optional("ASN organisations", config.data_path(&config.files.asn_orgs), AsnOrgs::load)? {
        resolver = resolver.with_orgs(orgs);
    }
    Ok(resolver)
}

fn geocoder(config: &Config, cache: &Arc<GeoCache>, client: &reqwest::Client) -> Arc<CachedGeocoder> {
    let forward = cache.topic("geocode");
    let reverse = cache.topic("reverse_geocode");
    let geocoder = match &config.google_api_key {
        Some(key) => CachedGeocoder::new(
            Arc::new(GoogleGeocoder::new(client.clone(), key.clone())),
            forward,
            reverse,
            config.external_timeout,
        ),
        None => {
            log::warn!("no Google API key, geocoding limited to cached answers");
            CachedGeocoder::offline(forward, reverse)
        }
    };
    Arc::new(geocoder)
}

/// Location resolution chain: geofeeds, provider PoP feed, PeeringDB,
/// reverse DNS hints, RIPE IPmap, then ipinfo
pub fn location_resolver(config: &Config, cache: &Arc<GeoCache>) -> Result<LocationResolver> {
    let files = &config.files;
    let overrides = load_optional(
        "local overrides",
        config.data_path(&files.local_overrides),
        LocalOverrides::load,
    )?
    .unwrap_or_default();

    let client = http_client(config.external_timeout)?;
    let geocoder = geocoder(config, cache, &client);
    let mut resolver = LocationResolver::new(overrides, cache.topic("loc"));

    let geofeeds: Vec<PathBuf> = files
        .geofeeds
        .iter()
        .map(|f| config.data_path(f))
        .filter(|p| {
            let exists = p.exists();
            if !exists {
                log::warn!("geofeed not found at {}, skipping", p.display());
            }
            exists
        })
        .collect();
    if !geofeeds.is_empty() {
        let table = GeofeedTable::load_files(&geofeeds)?;
        resolver = resolver.with_source(GeofeedSource::new(table, geocoder.clone()));
    }

    let iata = load_optional("IATA table", config.data_path(&files.iata), IataTable::load)?.unwrap_or_default();
    let aws_feed = config.data_path(files.feed(Provider::Aws));
    if let Some(prefixes) = load_optional("AWS feed", aws_feed, |p| load_feed(Provider::Aws, p))? {
        resolver = resolver.with_source(ProviderPopSource::new(border_group_trie(&prefixes), iata));
    }

    let pdb_dir = config.data_path(&files.peeringdb);
    if let Some(directory) = load_optional("PeeringDB dumps", pdb_dir, IxDirectory::load)? {
        resolver = resolver.with_source(PeeringDbSource::new(directory, geocoder.clone()));
    }

    if let Some(hints) = load_optional("hostname hints", config.data_path(&files.hints), HintTable::load)? {
        let clli = load_optional("CLLI table", config.data_path(&files.clli), ClliTable::load)?.unwrap_or_default();
        resolver = resolver.with_source(RdnsSource::new(
            Arc::new(DnsLookup::new()),
            hints,
            clli,
            geocoder,
            cache.topic("rdns"),
            config.external_timeout,
        ));
    }

    let mut services: Vec<Arc<dyn IpGeoService>> = vec![Arc::new(RipeIpMap::new(client.clone()))];
    match &config.ipinfo_token {
        Some(token) => services.push(Arc::new(IpInfo::new(client, token.clone()))),
        None => log::warn!("no ipinfo token, ipinfo lookups disabled"),
    }
    for service in services {
        let topic = cache.topic(service.topic());
        resolver = resolver.with_source(ExternalSource::new(service, topic, config.external_timeout));
    }

    log::info!("location chain: {:?}", resolver.chain());
    Ok(resolver)
}
