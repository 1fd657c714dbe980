//! IP -> origin network resolution.
//!
//! Sources are tried in a fixed order: the BGP-derived prefix table, then
//! IXP peering LAN membership, then provider-published feeds. The first hit
//! wins; answers are never merged.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;

use super::cloud::FeedPrefix;
use super::sanitize_display;
use super::trie::PrefixTrie;

/// How an origin ASN was determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginMethod {
    Bgp,
    Ixp,
    Ispfeed,
}

/// Owning network of an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRecord {
    pub asn: u32,
    pub method: OriginMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
}

/// One registry consulted by [`OriginResolver`]
pub trait OriginSource: Send + Sync {
    fn method(&self) -> OriginMethod;
    fn origin(&self, ip: IpAddr) -> Option<u32>;
}

/// Prefix -> ASN table derived from a BGP RIB dump
pub struct BgpTable {
    trie: PrefixTrie<u32>,
}

impl BgpTable {
    pub fn new(trie: PrefixTrie<u32>) -> Self {
        Self { trie }
    }

    /// Parse a pyasn-style dump: `prefix<TAB>asn` per line, `;` comments
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut trie = PrefixTrie::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(prefix), Some(asn)) = (fields.next(), fields.next()) else {
                log::debug!("bgp table line {}: missing fields", lineno + 1);
                continue;
            };
            // Multi-origin entries look like `{64500,64501}`; take the first
            let asn = asn.trim_matches(|c| c == '{' || c == '}');
            let asn = asn.split(',').next().unwrap_or_default();
            match asn.parse::<u32>() {
                Ok(asn) => {
                    if trie.insert_str(prefix, asn).is_err() {
                        log::debug!("bgp table line {}: bad prefix {}", lineno + 1, prefix);
                    }
                }
                Err(_) => log::debug!("bgp table line {}: bad asn {}", lineno + 1, asn),
            }
        }
        Ok(Self { trie })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open BGP table: {}", path.display()))?;
        let table = Self::from_reader(BufReader::new(file))?;
        log::info!("BGP table: {} prefixes", table.trie.len());
        Ok(table)
    }
}

impl OriginSource for BgpTable {
    fn method(&self) -> OriginMethod {
        OriginMethod::Bgp
    }

    fn origin(&self, ip: IpAddr) -> Option<u32> {
        self.trie.lookup(ip).copied()
    }
}

/// Exchange peering LAN address -> member ASN
pub struct IxpMembers {
    trie: PrefixTrie<u32>,
}

#[derive(Debug, Deserialize)]
struct IxpMemberLine {
    asn: u32,
    #[serde(default)]
    ipv4: Vec<String>,
    #[serde(default)]
    ipv6: Vec<String>,
}

impl IxpMembers {
    pub fn new(trie: PrefixTrie<u32>) -> Self {
        Self { trie }
    }

    /// Parse CAIDA ix-asns JSON lines
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut trie = PrefixTrie::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let member: IxpMemberLine =
                serde_json::from_str(&line).context("invalid ix-asns line")?;
            for ip in member.ipv4.iter().chain(member.ipv6.iter()) {
                if trie.insert_str(ip, member.asn).is_err() {
                    log::debug!("ix-asns: bad address {} for AS{}", ip, member.asn);
                }
            }
        }
        Ok(Self { trie })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open IXP members: {}", path.display()))?;
        let members = Self::from_reader(BufReader::new(file))?;
        log::info!("IXP members: {} addresses", members.trie.len());
        Ok(members)
    }
}

impl OriginSource for IxpMembers {
    fn method(&self) -> OriginMethod {
        OriginMethod::Ixp
    }

    fn origin(&self, ip: IpAddr) -> Option<u32> {
        self.trie.lookup(ip).copied()
    }
}

/// Provider feeds, each prefix attributed to its provider's ASN
pub struct ProviderFeedTable {
    trie: PrefixTrie<u32>,
}

impl ProviderFeedTable {
    pub fn new() -> Self {
        Self {
            trie: PrefixTrie::new(),
        }
    }

    pub fn add_feed(&mut self, prefixes: &[FeedPrefix], asn: u32) {
        for p in prefixes {
            self.trie.insert(p.network, asn);
        }
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

impl Default for ProviderFeedTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginSource for ProviderFeedTable {
    fn method(&self) -> OriginMethod {
        OriginMethod::Ispfeed
    }

    fn origin(&self, ip: IpAddr) -> Option<u32> {
        self.trie.lookup(ip).copied()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AsnField {
    Number(u32),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct AsRankLine {
    asn: AsnField,
    organization: Option<AsRankOrg>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AsRankOrg {
    org_name: Option<String>,
}

/// ASN -> organisation name
#[derive(Debug, Default)]
pub struct AsnOrgs {
    names: HashMap<u32, String>,
}

impl AsnOrgs {
    pub fn insert(&mut self, asn: u32, name: &str) {
        if !name.is_empty() {
            self.names.insert(asn, sanitize_display(name));
        }
    }

    pub fn get(&self, asn: u32) -> Option<&str> {
        self.names.get(&asn).map(String::as_str)
    }

    /// Parse AS-Rank `asns.jsonl`
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut orgs = Self::default();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<AsRankLine>(&line) else {
                continue;
            };
            let asn = match entry.asn {
                AsnField::Number(n) => n,
                AsnField::Text(s) => match s.parse() {
                    Ok(n) => n,
                    Err(_) => continue,
                },
            };
            if let Some(name) = entry.organization.and_then(|o| o.org_name) {
                orgs.insert(asn, &name);
            }
        }
        Ok(orgs)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open ASN organisations: {}", path.display()))?;
        let orgs = Self::from_reader(BufReader::new(file))?;
        log::info!("ASN organisations: {}", orgs.names.len());
        Ok(orgs)
    }
}

/// Resolves an address to its origin ASN from in-memory registries
#[derive(Default)]
pub struct OriginResolver {
    sources: Vec<Box<dyn OriginSource>>,
    orgs: Option<AsnOrgs>,
}

impl OriginResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source; sources are consulted in insertion order
    pub fn with_source<S: OriginSource + 'static>(mut self, source: S) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Enrich results with organisation names
    pub fn with_orgs(mut self, orgs: AsnOrgs) -> Self {
        self.orgs = Some(orgs);
        self
    }

    pub fn resolve(&self, ip: IpAddr) -> Option<OriginRecord> {
        let (asn, method) = self
            .sources
            .iter()
            .find_map(|s| s.origin(ip).map(|asn| (asn, s.method())))?;

        let org = self
            .orgs
            .as_ref()
            .and_then(|orgs| orgs.get(asn))
            .map(str::to_string);

        Some(OriginRecord { asn, method, org })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::cloud::{Provider, parse_feed};
    use std::io::Cursor;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn resolver() -> OriginResolver {
        let bgp = BgpTable::from_reader(Cursor::new(
            "; IP-ASN32-DAT file\n\
             8.8.8.0/24\t15169\n\
             20.35.0.0/16\t8075\n\
             198.51.0.0/16\t{64500,64501}\n",
        ))
        .unwrap();
        let ixp = IxpMembers::from_reader(Cursor::new(
            r#"{"asn": 8075, "ipv4": ["206.108.115.47"], "ipv6": ["2001:504:0:4::8075:1"]}
{"asn": 15169, "ipv4": ["91.210.16.168", "20.35.1.1"], "ipv6": []}
"#,
        ))
        .unwrap();
        let feed = parse_feed(
            Provider::Google,
            r#"{"prefixes": [{"ipv4Prefix": "34.0.0.0/15"}]}"#,
        )
        .unwrap();
        let mut feeds = ProviderFeedTable::new();
        feeds.add_feed(&feed, Provider::Google.feed_asn());

        let mut orgs = AsnOrgs::default();
        orgs.insert(15169, "Google LLC");

        OriginResolver::new()
            .with_source(bgp)
            .with_source(ixp)
            .with_source(feeds)
            .with_orgs(orgs)
    }

    #[test]
    fn test_sources_in_priority_order() {
        let r = resolver();

        let bgp = r.resolve(ip("8.8.8.8")).unwrap();
        assert_eq!((bgp.asn, bgp.method), (15169, OriginMethod::Bgp));
        assert_eq!(bgp.org.as_deref(), Some("Google LLC"));

        let ixp = r.resolve(ip("206.108.115.47")).unwrap();
        assert_eq!((ixp.asn, ixp.method), (8075, OriginMethod::Ixp));
        assert!(ixp.org.is_none());

        let feed = r.resolve(ip("34.1.2.3")).unwrap();
        assert_eq!((feed.asn, feed.method), (15169, OriginMethod::Ispfeed));
    }

    #[test]
    fn test_first_hit_is_not_merged() {
        // 20.35.1.1 is both in the BGP table and an IXP member address
        let r = resolver();
        let rec = r.resolve(ip("20.35.1.1")).unwrap();
        assert_eq!((rec.asn, rec.method), (8075, OriginMethod::Bgp));
    }

    #[test]
    fn test_multi_origin_and_unknown() {
        let r = resolver();
        assert_eq!(r.resolve(ip("198.51.3.4")).map(|o| o.asn), Some(64500));
        assert!(r.resolve(ip("1.1.1.1")).is_none());
        assert_eq!(
            r.resolve(ip("2001:504:0:4::8075:1")).map(|o| o.method),
            Some(OriginMethod::Ixp)
        );
    }

    #[test]
    fn test_parse_as_rank_orgs() {
        let orgs = AsnOrgs::from_reader(Cursor::new(
            r#"{"asn": "16509", "organization": {"orgName": "Amazon.com, Inc."}}
{"asn": "64512", "organization": {"orgName": ""}}
{"asn": 8075, "organization": null}
not json
"#,
        ))
        .unwrap();
        assert_eq!(orgs.get(16509), Some("Amazon.com, Inc."));
        assert!(orgs.get(64512).is_none());
        assert!(orgs.get(8075).is_none());
    }
}
