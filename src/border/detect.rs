//! Border detection over sanitized traceroutes.
//!
//! For ingress paths the border is the first hop owned by one of the
//! provider's ASNs; for egress paths it is the first hop that is not. The
//! hop right before it is the inner side of the crossing. Only the first
//! crossing on a path is modeled.

use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::distance::{distance_km, is_violation};
use super::pop::PopList;
use crate::error::BorderError;
use crate::lookup::asn::{OriginMethod, OriginResolver};
use crate::lookup::geo::{GeoMethod, GeoRecord, LocationResolver};
use crate::state::{BorderRecord, Direction, Hop, TracePath};

/// Colocation radius
pub const COLOCATION_KM: f64 = 50.0;

/// Largest minimum-RTT gap between hops still treated as colocated
pub const COLOCATION_RTT_MS: f64 = 2.0;

/// Counters for one path
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PathStats {
    /// Locations discarded by the plausibility check
    pub geo_violate_event: u64,
    /// Border locations inherited from the preceding hop
    pub colocate_event: u64,
}

/// Counters for a batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub paths: u64,
    pub borders: u64,
    pub no_border: u64,
    pub skipped: u64,
    pub geo_violate_event: u64,
    pub colocate_event: u64,
}

impl BatchStats {
    fn add_path(&mut self, stats: PathStats) {
        self.geo_violate_event += stats.geo_violate_event;
        self.colocate_event += stats.colocate_event;
    }
}

/// Result of running detection on one path
#[derive(Debug, Clone)]
pub struct Detection {
    pub record: Option<BorderRecord>,
    /// Hops with the synthesized origin prepended; ASNs are set up to the
    /// border, locations on every hop
    pub hops: Vec<Hop>,
    pub stats: PathStats,
}

/// Result of a batch
#[derive(Debug, Default)]
pub struct BatchOutput {
    pub records: Vec<BorderRecord>,
    pub stats: BatchStats,
    /// Set when the batch stopped early on cancellation
    pub cancelled: bool,
}

/// Whether `next` may share a device location with `prev`: its minimum
/// RTT is at most 2 ms larger and not smaller
pub fn is_close(prev: &Hop, next: &Hop) -> bool {
    match (prev.min_rtt(), next.min_rtt()) {
        (Some(a), Some(b)) => (0.0..=COLOCATION_RTT_MS).contains(&(b - a)),
        _ => false,
    }
}

/// Colocation verdict for the two border hops.
///
/// Adjacent hops only need to be within [`COLOCATION_KM`]; separated hops
/// also need minimum RTTs less than [`COLOCATION_RTT_MS`] apart. Missing
/// inputs mean not colocated.
pub fn check_colocated(
    separated: bool,
    distance_km: Option<f64>,
    inner_min_rtt: Option<f64>,
    outer_min_rtt: Option<f64>,
) -> bool {
    let Some(distance) = distance_km else {
        return false;
    };
    if distance >= COLOCATION_KM {
        return false;
    }
    if !separated {
        return true;
    }
    match (inner_min_rtt, outer_min_rtt) {
        (Some(a), Some(b)) => (a - b).abs() < COLOCATION_RTT_MS,
        _ => false,
    }
}

/// Locates provider border crossings
pub struct BorderDetector {
    origins: Arc<OriginResolver>,
    locations: Arc<LocationResolver>,
    cloud_asns: HashSet<u32>,
    pops: PopList,
    cache_only: bool,
}

impl BorderDetector {
    pub fn new(
        origins: Arc<OriginResolver>,
        locations: Arc<LocationResolver>,
        cloud_asns: impl IntoIterator<Item = u32>,
        pops: PopList,
    ) -> Self {
        Self {
            origins,
            locations,
            cloud_asns: cloud_asns.into_iter().collect(),
            pops,
            cache_only: false,
        }
    }

    /// Only consult overrides and the location cache
    pub fn cache_only(mut self, cache_only: bool) -> Self {
        self.cache_only = cache_only;
        self
    }

    /// Validate the path and prepend the origin hop
    fn prepare(path: &TracePath) -> Result<Vec<Hop>, BorderError> {
        let malformed = |reason: String| BorderError::MalformedPath {
            key: path.key.clone(),
            reason,
        };
        if path.hops.is_empty() {
            return Err(malformed("no hops".to_string()));
        }

        let mut hops = Vec::with_capacity(path.hops.len() + 1);
        hops.push(Hop::origin(path.source));
        for hop in &path.hops {
            if hop.round_trip_times.is_empty() {
                return Err(malformed(format!("hop {} has no RTT samples", hop.sequence_id)));
            }
            let mut hop = hop.clone();
            hop.sort_rtts();
            hops.push(hop);
        }
        Ok(hops)
    }

    /// Classify hops up to the border, returning the border index
    fn scan(&self, hops: &mut [Hop], direction: Direction) -> Option<usize> {
        for (idx, hop) in hops.iter_mut().enumerate() {
            let origin = self.origins.resolve(hop.ip);
            if let Some(origin) = &origin {
                hop.asn = Some(origin.asn);
                hop.asn_method = Some(origin.method);
            }
            let in_cloud = origin.is_some_and(|o| self.cloud_asns.contains(&o.asn));
            let is_border = match direction {
                Direction::Ingress => in_cloud,
                Direction::Egress => !in_cloud,
            };
            if is_border {
                return Some(idx);
            }
        }
        None
    }

    /// Run detection on one path
    pub async fn detect(&self, path: &TracePath, direction: Direction) -> Result<Detection, BorderError> {
        match direction {
            Direction::Ingress => self.detect_ingress(path).await,
            Direction::Egress => self.detect_egress(path).await,
        }
    }

    /// Border of a trace from an external probe into the provider
    pub async fn detect_ingress(&self, path: &TracePath) -> Result<Detection, BorderError> {
        let probe = path.probe.as_ref().map(|p| p.record());
        self.run(path, Direction::Ingress, probe.clone(), probe).await
    }

    /// Border of a trace from a provider VM to an external probe.
    ///
    /// The VM address must have a curated location. It is the reference
    /// for the plausibility check, which only runs when the path carries
    /// a probe site.
    pub async fn detect_egress(&self, path: &TracePath) -> Result<Detection, BorderError> {
        let vm = self.locations.resolve(path.source, self.cache_only).await;
        let vm = match vm {
            Some(loc) if loc.method == GeoMethod::Local => loc,
            other => {
                return Err(BorderError::UnanchoredVm {
                    ip: path.source,
                    found: other.map_or_else(|| "none".to_string(), |l| l.method.to_string()),
                });
            }
        };
        let reference = path.probe.as_ref().map(|_| vm.clone());
        self.run(path, Direction::Egress, Some(vm), reference).await
    }

    /// Privileged location for addresses the measurement itself knows
    fn known_location(
        path: &TracePath,
        direction: Direction,
        ip: IpAddr,
        origin_loc: &Option<GeoRecord>,
    ) -> Option<Option<GeoRecord>> {
        if ip == path.source {
            return Some(origin_loc.clone());
        }
        if direction == Direction::Egress && path.destination == Some(ip) {
            return Some(path.probe.as_ref().map(|p| p.record()));
        }
        None
    }

    async fn run(
        &self,
        path: &TracePath,
        direction: Direction,
        origin_loc: Option<GeoRecord>,
        reference: Option<GeoRecord>,
    ) -> Result<Detection, BorderError> {
        let mut hops = Self::prepare(path)?;
        let mut stats = PathStats::default();

        let Some(outer) = self.scan(&mut hops, direction) else {
            log::debug!("{}: no {} border", path.key, direction);
            return Ok(Detection {
                record: None,
                hops,
                stats,
            });
        };
        let inner = outer.checked_sub(1);
        let separated = match inner {
            Some(i) => hops[i].sequence_id + 1 != hops[outer].sequence_id,
            None => true,
        };

        let reference = reference.map(|r| r.coordinates());
        for idx in 0..hops.len() {
            let ip = hops[idx].ip;
            let mut loc = match Self::known_location(path, direction, ip, &origin_loc) {
                Some(known) => known,
                None => self.locations.resolve(ip, self.cache_only).await,
            };

            if idx == outer
                && loc.is_none()
                && idx > 0
                && hops[idx - 1].loc.is_some()
                && is_close(&hops[idx - 1], &hops[idx])
            {
                loc = hops[idx - 1].loc.clone();
                stats.colocate_event += 1;
            }

            if let (Some(found), Some(reference), Some(rtt)) = (&loc, reference, hops[idx].min_rtt())
                && is_violation(found.coordinates(), reference, rtt)
            {
                log::debug!(
                    "{}: {} at {}, {} is too far for {:.2} ms",
                    path.key,
                    ip,
                    found.place,
                    found.country,
                    rtt
                );
                loc = None;
                stats.geo_violate_event += 1;
            }

            hops[idx].loc = loc;
        }

        let inner_hop = inner.map(|i| &hops[i]);
        let outer_hop = &hops[outer];
        let inner_location = inner_hop.and_then(|h| h.loc.clone());
        let outer_location = outer_hop.loc.clone();

        let separation_distance_km = match (&inner_location, &outer_location) {
            (Some(a), Some(b)) => Some(distance_km(a.coordinates(), b.coordinates())),
            _ => None,
        };

        let (is_ixp_pop, is_known_pop) = match direction {
            Direction::Ingress => (
                outer_hop.asn_method == Some(OriginMethod::Ixp),
                Some(outer_location.as_ref().is_some_and(|l| self.pops.contains(l))),
            ),
            Direction::Egress => (
                inner_hop.is_some_and(|h| h.asn_method == Some(OriginMethod::Ixp)),
                inner_location.as_ref().map(|l| self.pops.contains(l)),
            ),
        };

        let colocated = inner_hop.is_some_and(|h| {
            check_colocated(separated, separation_distance_km, h.min_rtt(), outer_hop.min_rtt())
        });

        let record = BorderRecord {
            path_key: path.key.clone(),
            direction,
            inner_ip: inner_hop.map(|h| h.ip),
            inner_asn: inner_hop.and_then(|h| h.asn),
            inner_ttl: inner_hop.map(|h| h.ttl),
            inner_rtts: inner_hop.map(|h| h.round_trip_times.clone()),
            outer_ip: outer_hop.ip,
            outer_asn: outer_hop.asn,
            outer_ttl: outer_hop.ttl,
            outer_rtts: outer_hop.round_trip_times.clone(),
            is_ixp_pop,
            is_known_pop,
            separation_distance_km,
            separated,
            colocated,
            inner_location,
            outer_location,
        };

        Ok(Detection {
            record: Some(record),
            hops,
            stats,
        })
    }

    /// Run detection over many paths, `concurrency` at a time.
    ///
    /// Records come back in input order. Malformed paths are skipped and
    /// counted; a fatal error stops the batch. Cancellation stops taking
    /// new paths and returns what finished.
    pub async fn locate_batch(
        &self,
        paths: Vec<TracePath>,
        direction: Direction,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchOutput, BorderError> {
        let mut output = BatchOutput::default();

        let mut results = std::pin::pin!(
            stream::iter(paths.iter())
                .take_until(cancel.cancelled())
                .map(|path| async move { (path, self.detect(path, direction).await) })
                .buffered(concurrency.max(1))
        );

        while let Some((path, result)) = results.next().await {
            output.stats.paths += 1;
            match result {
                Ok(detection) => {
                    output.stats.add_path(detection.stats);
                    match detection.record {
                        Some(record) => {
                            output.stats.borders += 1;
                            output.records.push(record);
                        }
                        None => output.stats.no_border += 1,
                    }
                }
                Err(e) if !e.is_fatal() => {
                    log::warn!("skipping {}: {}", path.key, e);
                    output.stats.skipped += 1;
                }
                Err(e) => {
                    log::error!("{} batch halted at {}: {}", direction, path.key, e);
                    return Err(e);
                }
            }
        }

        output.cancelled = cancel.is_cancelled() && (output.stats.paths as usize) < paths.len();
        let s = &output.stats;
        log::info!(
            "{} batch: {} paths, {} borders, {} without border, {} skipped, geo_violate_event={}, colocate_event={}",
            direction,
            s.paths,
            s.borders,
            s.no_border,
            s.skipped,
            s.geo_violate_event,
            s.colocate_event
        );
        Ok(output)
    }
}
