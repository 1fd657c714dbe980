//! Cloud provider published IP range feeds.
//!
//! AWS, Azure and Google each publish their address space in a different
//! JSON shape. All three are flattened into [`FeedPrefix`] entries; AWS
//! entries additionally carry the network border group, which encodes the
//! PoP the prefix is announced from.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use super::facility::IataTable;
use super::geo::{GeoMethod, GeoRecord, LocationSource};
use super::trie::PrefixTrie;

/// Cloud provider whose network borders are being located
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "AWS")]
    Aws,
    Azure,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Aws, Provider::Azure, Provider::Google];

    /// ASN the provider's published feed is attributed to
    pub fn feed_asn(&self) -> u32 {
        match self {
            Self::Aws => 16509,
            Self::Azure => 8075,
            Self::Google => 15169,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Aws => "AWS",
            Self::Azure => "Azure",
            Self::Google => "Google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aws" | "amazon" => Ok(Self::Aws),
            "azure" | "microsoft" => Ok(Self::Azure),
            "google" | "gcp" => Ok(Self::Google),
            other => anyhow::bail!("unknown provider: {}", other),
        }
    }
}

/// One prefix from a provider feed
#[derive(Debug, Clone)]
pub struct FeedPrefix {
    pub network: IpNetwork,
    /// AWS network border group, e.g. `us-east-1-atl-1`
    pub border_group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AwsRanges {
    #[serde(default)]
    prefixes: Vec<AwsPrefix>,
    #[serde(default)]
    ipv6_prefixes: Vec<AwsPrefix>,
}

#[derive(Debug, Deserialize)]
struct AwsPrefix {
    #[serde(alias = "ipv6_prefix")]
    ip_prefix: String,
    network_border_group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AzureServiceTags {
    values: Vec<AzureValue>,
}

#[derive(Debug, Deserialize)]
struct AzureValue {
    properties: AzureProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureProperties {
    #[serde(default)]
    address_prefixes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleRanges {
    prefixes: Vec<GooglePrefix>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GooglePrefix {
    ipv4_prefix: Option<String>,
    ipv6_prefix: Option<String>,
}

/// Parse a provider feed document
pub fn parse_feed(provider: Provider, json: &str) -> Result<Vec<FeedPrefix>> {
    let raw: Vec<(String, Option<String>)> = match provider {
        Provider::Aws => {
            let doc: AwsRanges = serde_json::from_str(json)?;
            doc.prefixes
                .into_iter()
                .chain(doc.ipv6_prefixes)
                .map(|p| (p.ip_prefix, p.network_border_group))
                .collect()
        }
        Provider::Azure => {
            let doc: AzureServiceTags = serde_json::from_str(json)?;
            doc.values
                .into_iter()
                .flat_map(|v| v.properties.address_prefixes)
                .map(|p| (p, None))
                .collect()
        }
        Provider::Google => {
            let doc: GoogleRanges = serde_json::from_str(json)?;
            doc.prefixes
                .into_iter()
                .flat_map(|p| [p.ipv4_prefix, p.ipv6_prefix])
                .flatten()
                .map(|p| (p, None))
                .collect()
        }
    };

    let mut prefixes = Vec::with_capacity(raw.len());
    for (prefix, border_group) in raw {
        match prefix.parse::<IpNetwork>() {
            Ok(network) => prefixes.push(FeedPrefix {
                network,
                border_group,
            }),
            Err(_) => log::debug!("{}: skipping unparsable prefix {:?}", provider, prefix),
        }
    }
    Ok(prefixes)
}

/// Load a provider feed from disk
pub fn load_feed(provider: Provider, path: &Path) -> Result<Vec<FeedPrefix>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read {} feed: {}", provider, path.display()))?;
    let prefixes = parse_feed(provider, &data)
        .with_context(|| format!("failed to parse {} feed: {}", provider, path.display()))?;
    log::info!("{} feed: {} prefixes", provider, prefixes.len());
    Ok(prefixes)
}

/// Build a trie of AWS border groups for PoP geolocation
pub fn border_group_trie(prefixes: &[FeedPrefix]) -> PrefixTrie<String> {
    let mut trie = PrefixTrie::new();
    for p in prefixes {
        if let Some(group) = &p.border_group {
            trie.insert(p.network, group.clone());
        }
    }
    trie
}

/// Facility code inside a border group.
///
/// Local zone groups look like `us-east-1-atl-1`; the fourth component is
/// the IATA code of the metro. Plain region groups (`us-east-1`) carry none.
pub fn border_group_facility(group: &str) -> Option<&str> {
    let parts: Vec<&str> = group.split('-').collect();
    if parts.len() == 5 {
        Some(parts[3])
    } else {
        None
    }
}

/// Location of provider prefixes announced from a metro-level border group
pub struct ProviderPopSource {
    groups: PrefixTrie<String>,
    iata: IataTable,
}

impl ProviderPopSource {
    pub fn new(groups: PrefixTrie<String>, iata: IataTable) -> Self {
        Self { groups, iata }
    }
}

#[async_trait]
impl LocationSource for ProviderPopSource {
    fn method(&self) -> GeoMethod {
        GeoMethod::Ispfeed
    }

    async fn locate(&self, ip: IpAddr) -> Option<GeoRecord> {
        let group = self.groups.lookup(ip)?;
        let code = border_group_facility(group)?;
        let Some(facility) = self.iata.get(code) else {
            log::debug!("border group {}: unknown facility {}", group, code);
            return None;
        };
        Some(GeoRecord::new(
            &facility.place,
            &facility.country,
            facility.at,
            GeoMethod::Ispfeed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::facility::Facility;
    use crate::lookup::geo::Coordinates;

    #[test]
    fn test_parse_aws_feed() {
        let json = r#"{
            "syncToken": "1",
            "prefixes": [
                {"ip_prefix": "15.181.232.0/21", "region": "us-east-1-atl-1", "service": "EC2", "network_border_group": "us-east-1-atl-1"},
                {"ip_prefix": "3.5.140.0/22", "region": "ap-northeast-2", "service": "AMAZON", "network_border_group": "ap-northeast-2"}
            ],
            "ipv6_prefixes": [
                {"ipv6_prefix": "2600:1f14::/35", "region": "us-west-2", "service": "EC2", "network_border_group": "us-west-2"}
            ]
        }"#;
        let prefixes = parse_feed(Provider::Aws, json).unwrap();
        assert_eq!(prefixes.len(), 3);
        assert_eq!(prefixes[0].border_group.as_deref(), Some("us-east-1-atl-1"));
        assert!(prefixes[2].network.is_ipv6());
    }

    #[test]
    fn test_parse_azure_and_google_feeds() {
        let azure = r#"{"values": [
            {"name": "AzureCloud", "properties": {"addressPrefixes": ["20.35.240.0/21", "2603:1000::/40"]}},
            {"name": "Empty", "properties": {}}
        ]}"#;
        let google = r#"{"prefixes": [{"ipv4Prefix": "34.0.0.0/20"}, {"ipv6Prefix": "2600:1900::/35"}]}"#;

        assert_eq!(parse_feed(Provider::Azure, azure).unwrap().len(), 2);
        let g = parse_feed(Provider::Google, google).unwrap();
        assert_eq!(g.len(), 2);
        assert!(g.iter().all(|p| p.border_group.is_none()));
    }

    #[test]
    fn test_border_group_facility() {
        assert_eq!(border_group_facility("us-east-1-atl-1"), Some("atl"));
        assert_eq!(border_group_facility("us-east-1"), None);
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("aws".parse::<Provider>().unwrap(), Provider::Aws);
        assert_eq!("GCP".parse::<Provider>().unwrap(), Provider::Google);
        assert!("oracle".parse::<Provider>().is_err());
        assert_eq!(Provider::Azure.feed_asn(), 8075);
    }

    #[tokio::test]
    async fn test_provider_pop_source() {
        let json = r#"{"prefixes": [
            {"ip_prefix": "15.181.232.0/21", "network_border_group": "us-east-1-atl-1"},
            {"ip_prefix": "15.181.240.0/21", "network_border_group": "us-west-2-xyz-1"},
            {"ip_prefix": "3.5.140.0/22", "network_border_group": "ap-northeast-2"}
        ]}"#;
        let prefixes = parse_feed(Provider::Aws, json).unwrap();
        let mut iata = IataTable::default();
        iata.insert(
            "ATL",
            Facility {
                place: "Georgia".to_string(),
                country: "US".to_string(),
                at: Coordinates::new(33.6367, -84.4281),
            },
        );
        let source = ProviderPopSource::new(border_group_trie(&prefixes), iata);

        let rec = source.locate("15.181.232.10".parse().unwrap()).await.unwrap();
        assert_eq!(rec.place, "Georgia");
        assert_eq!(rec.method, GeoMethod::Ispfeed);
        // Unknown facility code and region-level group
        assert!(source.locate("15.181.240.10".parse().unwrap()).await.is_none());
        assert!(source.locate("3.5.140.2".parse().unwrap()).await.is_none());
    }
}
