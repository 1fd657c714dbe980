use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::lookup::asn::OriginMethod;
use crate::lookup::geo::{Coordinates, GeoMethod, GeoRecord};

/// Which way the trace crosses the provider border
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From an external probe into the provider
    Ingress,
    /// From a provider VM out to an external probe
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => f.write_str("ingress"),
            Self::Egress => f.write_str("egress"),
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "ingress" | "in" => Ok(Self::Ingress),
            "egress" | "out" => Ok(Self::Egress),
            other => anyhow::bail!("unknown direction: {}", other),
        }
    }
}

/// One sanitized traceroute hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    /// Position in the path; -1 for the synthesized origin
    #[serde(rename = "id")]
    pub sequence_id: i64,
    pub ip: IpAddr,
    pub ttl: u32,
    /// Milliseconds, ascending
    #[serde(rename = "rtts")]
    pub round_trip_times: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn_method: Option<OriginMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<GeoRecord>,
}

impl Hop {
    pub fn new(sequence_id: i64, ip: IpAddr, ttl: u32, round_trip_times: Vec<f64>) -> Self {
        Self {
            sequence_id,
            ip,
            ttl,
            round_trip_times,
            asn: None,
            asn_method: None,
            loc: None,
        }
    }

    /// The synthesized hop standing for the trace's source address
    pub fn origin(ip: IpAddr) -> Self {
        Self::new(-1, ip, 0, vec![0.0, 0.0, 0.0])
    }

    pub fn min_rtt(&self) -> Option<f64> {
        self.round_trip_times.iter().copied().reduce(f64::min)
    }

    pub fn sort_rtts(&mut self) {
        self.round_trip_times.sort_by(f64::total_cmp);
    }
}

/// Registered location of a measurement probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSite {
    #[serde(default)]
    pub place: String,
    #[serde(default)]
    pub country: String,
    pub lat: f64,
    pub lng: f64,
}

impl ProbeSite {
    pub fn record(&self) -> GeoRecord {
        GeoRecord::new(
            &self.place,
            &self.country,
            Coordinates::new(self.lat, self.lng),
            GeoMethod::Probe,
        )
    }
}

/// A sanitized traceroute as handed over by ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracePath {
    /// Identifies the measurement in the output
    pub key: String,
    /// Address the trace was sent from: the probe for ingress, the VM's
    /// public address for egress
    pub source: IpAddr,
    /// Probe address an egress trace was sent to
    #[serde(default)]
    pub destination: Option<IpAddr>,
    #[serde(default)]
    pub probe: Option<ProbeSite>,
    pub hops: Vec<Hop>,
}

/// The border crossing found on one path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorderRecord {
    pub path_key: String,
    pub direction: Direction,
    pub inner_ip: Option<IpAddr>,
    pub inner_asn: Option<u32>,
    pub inner_ttl: Option<u32>,
    pub inner_rtts: Option<Vec<f64>>,
    pub outer_ip: IpAddr,
    pub outer_asn: Option<u32>,
    pub outer_ttl: u32,
    pub outer_rtts: Vec<f64>,
    pub is_ixp_pop: bool,
    pub is_known_pop: Option<bool>,
    pub separation_distance_km: Option<f64>,
    pub separated: bool,
    pub colocated: bool,
    pub inner_location: Option<GeoRecord>,
    pub outer_location: Option<GeoRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_json_shape() {
        let hop: Hop = serde_json::from_str(r#"{"id": 3, "ip": "52.93.28.10", "ttl": 7, "rtts": [12.5, 11.0, 13.1]}"#)
            .unwrap();
        assert_eq!(hop.sequence_id, 3);
        assert_eq!(hop.min_rtt(), Some(11.0));
        assert!(hop.asn.is_none());

        let json = serde_json::to_string(&hop).unwrap();
        assert!(json.contains("\"id\":3"));
        assert!(!json.contains("asn"));
    }

    #[test]
    fn test_sort_rtts_and_origin() {
        let mut hop = Hop::new(1, "1.1.1.1".parse().unwrap(), 1, vec![5.0, 3.0, 4.0]);
        hop.sort_rtts();
        assert_eq!(hop.round_trip_times, vec![3.0, 4.0, 5.0]);

        let origin = Hop::origin("8.8.8.8".parse().unwrap());
        assert_eq!(origin.sequence_id, -1);
        assert_eq!(origin.min_rtt(), Some(0.0));

        let empty = Hop::new(2, "1.1.1.1".parse().unwrap(), 2, vec![]);
        assert_eq!(empty.min_rtt(), None);
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("Ingress".parse::<Direction>().unwrap(), Direction::Ingress);
        assert_eq!("out".parse::<Direction>().unwrap(), Direction::Egress);
        assert!("sideways".parse::<Direction>().is_err());
        assert_eq!(Direction::Egress.to_string(), "egress");
    }

    #[test]
    fn test_trace_path_defaults() {
        let path: TracePath = serde_json::from_str(
            r#"{"key": "m1", "source": "193.0.0.1", "hops": [{"id": 0, "ip": "193.0.0.2", "ttl": 1, "rtts": [1.0]}]}"#,
        )
        .unwrap();
        assert!(path.probe.is_none());
        assert!(path.destination.is_none());
        assert_eq!(path.hops.len(), 1);
    }
}
