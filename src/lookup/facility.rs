//! Facility code tables: IATA airport codes and CLLI location codes.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use super::geo::Coordinates;

/// A metro identified by a facility code
#[derive(Debug, Clone, PartialEq)]
pub struct Facility {
    pub place: String,
    pub country: String,
    pub at: Coordinates,
}

#[derive(Debug, Deserialize)]
struct IataRow {
    iata: String,
    region_name: String,
    country_code: String,
    latitude: f64,
    longitude: f64,
}

/// IATA code (lower-case) -> facility
#[derive(Debug, Default)]
pub struct IataTable {
    entries: HashMap<String, Facility>,
}

impl IataTable {
    pub fn insert(&mut self, code: &str, facility: Facility) {
        self.entries.insert(code.to_lowercase(), facility);
    }

    pub fn get(&self, code: &str) -> Option<&Facility> {
        self.entries.get(&code.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a CSV with `iata, region_name, country_code, latitude, longitude` columns
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::Reader::from_reader(reader);
        let mut table = Self::default();
        for row in csv.deserialize::<IataRow>() {
            let Ok(row) = row else {
                continue;
            };
            if row.iata.is_empty() {
                continue;
            }
            table.insert(
                &row.iata,
                Facility {
                    place: row.region_name,
                    country: row.country_code,
                    at: Coordinates::new(row.latitude, row.longitude),
                },
            );
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open IATA table: {}", path.display()))?;
        let table = Self::from_reader(file)?;
        log::info!("IATA table: {} codes", table.len());
        Ok(table)
    }
}

/// Normalize a CLLI code to its 6-character location part
pub fn clli_key(code: &str) -> String {
    code.chars()
        .filter(|c| *c != ' ')
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

/// CLLI location code -> coordinates
#[derive(Debug, Default)]
pub struct ClliTable {
    entries: HashMap<String, Coordinates>,
}

impl ClliTable {
    pub fn insert(&mut self, code: &str, at: Coordinates) {
        self.entries.insert(clli_key(code), at);
    }

    pub fn get(&self, code: &str) -> Option<Coordinates> {
        self.entries.get(&clli_key(code)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse tab-separated `code lat lon` lines
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut table = Self::default();
        for line in reader.lines() {
            let line = line?;
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 3 {
                continue;
            }
            let (Ok(lat), Ok(lng)) = (fields[1].trim().parse(), fields[2].trim().parse()) else {
                continue;
            };
            table.insert(fields[0], Coordinates::new(lat, lng));
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open CLLI table: {}", path.display()))?;
        let table = Self::from_reader(BufReader::new(file))?;
        log::info!("CLLI table: {} codes", table.len());
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_iata_table() {
        let csv = "country_code,region_name,iata,icao,airport,latitude,longitude\n\
                   US,Georgia,ATL,KATL,Hartsfield-Jackson Atlanta International Airport,33.6367,-84.4281\n\
                   DE,Hessen,FRA,EDDF,Frankfurt am Main Airport,50.0333,8.5706\n\
                   XX,Broken,,,No code,0,0\n";
        let table = IataTable::from_reader(Cursor::new(csv)).unwrap();
        assert_eq!(table.len(), 2);

        let atl = table.get("atl").unwrap();
        assert_eq!(atl.place, "Georgia");
        assert_eq!(atl.country, "US");
        assert_eq!(table.get("FRA").unwrap().at, Coordinates::new(50.0333, 8.5706));
    }

    #[test]
    fn test_parse_clli_table() {
        let txt = "NYCMNY\t40.7128\t-74.0060\n\
                   DLLS TX\t32.7767\t-96.7970\n\
                   garbage line\n";
        let table = ClliTable::from_reader(Cursor::new(txt)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("nycmny01"), Some(Coordinates::new(40.7128, -74.0060)));
        assert_eq!(table.get("DLLSTX"), Some(Coordinates::new(32.7767, -96.7970)));
    }

    #[test]
    fn test_clli_key() {
        assert_eq!(clli_key("ASBN VA 03"), "asbnva");
        assert_eq!(clli_key("chi"), "chi");
    }
}
