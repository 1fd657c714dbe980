//! Known provider points of presence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::distance::distance_km;
use crate::lookup::geo::{Coordinates, GeoRecord};

/// Default matching radius
pub const DEFAULT_TOLERANCE_KM: f64 = 50.0;

/// A published PoP of the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownPop {
    #[serde(default)]
    pub name: String,
    pub place: String,
    pub country: String,
    pub lat: f64,
    pub lng: f64,
}

impl KnownPop {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lng)
    }
}

/// The provider's PoP list with its matching tolerance
#[derive(Debug, Clone)]
pub struct PopList {
    pops: Vec<KnownPop>,
    tolerance_km: f64,
}

impl Default for PopList {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_TOLERANCE_KM)
    }
}

impl PopList {
    pub fn new(pops: Vec<KnownPop>, tolerance_km: f64) -> Self {
        Self { pops, tolerance_km }
    }

    /// Load a JSON array of [`KnownPop`]s
    pub fn load(path: &Path, tolerance_km: f64) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read PoP list: {}", path.display()))?;
        let pops: Vec<KnownPop> = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse PoP list: {}", path.display()))?;
        log::info!("PoP list {}: {} entries", path.display(), pops.len());
        Ok(Self::new(pops, tolerance_km))
    }

    pub fn len(&self) -> usize {
        self.pops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pops.is_empty()
    }

    /// First PoP in the same country at the same place or within tolerance
    pub fn find(&self, loc: &GeoRecord) -> Option<&KnownPop> {
        self.pops.iter().find(|pop| {
            pop.country.eq_ignore_ascii_case(&loc.country)
                && ((!loc.place.is_empty() && pop.place.eq_ignore_ascii_case(&loc.place))
                    || distance_km(pop.coordinates(), loc.coordinates()) <= self.tolerance_km)
        })
    }

    pub fn contains(&self, loc: &GeoRecord) -> bool {
        self.find(loc).is_some()
    }
}
