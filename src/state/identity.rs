//! Canonical identities for repeated raw path records.
//!
//! Raw records that share provider, region, service, destination and UTC
//! hour describe the same logical path and receive the same canonical id.
//! Assignments are append-only: once a raw record has an id it keeps it,
//! across runs, through the identity journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::error::IdentityError;

/// Canonical ids start above this to stay clear of raw record ids
pub const IDENTITY_OFFSET: u64 = 1_100_000_000;

/// One raw path measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPathRecord {
    pub raw_id: u64,
    pub provider: String,
    pub region: String,
    pub service: String,
    pub destination: IpAddr,
    pub timestamp: DateTime<Utc>,
    /// Previously persisted canonical id
    #[serde(default)]
    pub canonical_id: Option<u64>,
}

impl RawPathRecord {
    pub fn dedup_key(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.provider,
            self.region.trim(),
            self.service.trim(),
            self.destination,
            time_bucket(&self.timestamp)
        )
    }
}

/// UTC hour label, e.g. `24090113`
pub fn time_bucket(ts: &DateTime<Utc>) -> String {
    ts.format("%y%m%d%H").to_string()
}

/// A persisted assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPair {
    pub canonical_id: u64,
    pub raw_id: u64,
}

/// Where new assignments are persisted
pub trait IdentitySink {
    fn persist(&mut self, pairs: &[IdentityPair]) -> Result<(), IdentityError>;
}

impl IdentitySink for Vec<IdentityPair> {
    fn persist(&mut self, pairs: &[IdentityPair]) -> Result<(), IdentityError> {
        self.extend_from_slice(pairs);
        Ok(())
    }
}

/// Append-only JSON-lines file of [`IdentityPair`]s
pub struct IdentityJournal {
    path: PathBuf,
}

impl IdentityJournal {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every pair in insertion order; a missing file is an empty journal
    pub fn load(&self) -> Result<Vec<IdentityPair>, IdentityError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let mut pairs = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let pair: IdentityPair = serde_json::from_str(&line).map_err(io::Error::from)?;
            pairs.push(pair);
        }
        Ok(pairs)
    }
}

impl IdentitySink for IdentityJournal {
    fn persist(&mut self, pairs: &[IdentityPair]) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for pair in pairs {
            serde_json::to_writer(&mut writer, pair).map_err(io::Error::from)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// Copy journal assignments onto the records they belong to.
///
/// A record already carrying a different id is a conflict.
pub fn apply_persisted(records: &mut [RawPathRecord], pairs: &[IdentityPair]) -> Result<(), IdentityError> {
    let persisted: HashMap<u64, u64> = pairs.iter().map(|p| (p.raw_id, p.canonical_id)).collect();
    for record in records.iter_mut() {
        let Some(&canonical_id) = persisted.get(&record.raw_id) else {
            continue;
        };
        match record.canonical_id {
            Some(existing) if existing != canonical_id => {
                return Err(IdentityError::Conflict {
                    raw_id: record.raw_id,
                    persisted: existing,
                    computed: canonical_id,
                });
            }
            _ => record.canonical_id = Some(canonical_id),
        }
    }
    Ok(())
}

/// Single-writer canonical id allocator
pub struct PathIdentityEncoder {
    counter: u64,
    by_key: HashMap<String, u64>,
    records: HashMap<u64, RawPathRecord>,
    pending: Vec<IdentityPair>,
}

impl PathIdentityEncoder {
    /// Seed from every known raw record, including those already assigned.
    ///
    /// Two persisted ids for one dedup key are a conflict.
    pub fn new(records: impl IntoIterator<Item = RawPathRecord>) -> Result<Self, IdentityError> {
        let mut records: Vec<RawPathRecord> = records.into_iter().collect();
        records.sort_by(|a, b| {
            (&a.provider, a.region.trim(), a.service.trim(), a.destination, a.timestamp, a.raw_id).cmp(&(
                &b.provider,
                b.region.trim(),
                b.service.trim(),
                b.destination,
                b.timestamp,
                b.raw_id,
            ))
        });

        let mut counter = IDENTITY_OFFSET;
        let mut by_key: HashMap<String, u64> = HashMap::new();
        for record in &records {
            let Some(id) = record.canonical_id else {
                continue;
            };
            match by_key.get(&record.dedup_key()) {
                Some(&known) if known != id => {
                    return Err(IdentityError::Conflict {
                        raw_id: record.raw_id,
                        persisted: id,
                        computed: known,
                    });
                }
                Some(_) => {}
                None => {
                    by_key.insert(record.dedup_key(), id);
                }
            }
            counter = counter.max(id);
        }

        log::info!(
            "identity encoder: {} records, {} known paths, next id {}",
            records.len(),
            by_key.len(),
            counter + 1
        );

        Ok(Self {
            counter,
            by_key,
            records: records.into_iter().map(|r| (r.raw_id, r)).collect(),
            pending: Vec::new(),
        })
    }

    /// Canonical id of `raw_id`, allocating one for a new dedup key
    pub fn identity(&mut self, raw_id: u64) -> Result<u64, IdentityError> {
        let record = self
            .records
            .get_mut(&raw_id)
            .ok_or(IdentityError::UnknownRecord(raw_id))?;
        let key = record.dedup_key();
        if let Some(persisted) = record.canonical_id {
            return match self.by_key.get(&key) {
                Some(&computed) if computed != persisted => Err(IdentityError::Conflict {
                    raw_id,
                    persisted,
                    computed,
                }),
                _ => Ok(persisted),
            };
        }

        let id = match self.by_key.get(&key) {
            Some(&id) => id,
            None => {
                self.counter += 1;
                self.by_key.insert(key, self.counter);
                self.counter
            }
        };

        record.canonical_id = Some(id);
        self.pending.push(IdentityPair {
            canonical_id: id,
            raw_id,
        });
        Ok(id)
    }

    /// Like [`identity`](Self::identity), failing when an id the caller
    /// holds for `raw_id` disagrees with the one its dedup key resolves to
    pub fn identity_checked(&mut self, raw_id: u64, persisted: Option<u64>) -> Result<u64, IdentityError> {
        let computed = self.identity(raw_id)?;
        match persisted {
            Some(persisted) if persisted != computed => Err(IdentityError::Conflict {
                raw_id,
                persisted,
                computed,
            }),
            _ => Ok(computed),
        }
    }

    /// Assignments made since the last flush
    pub fn pending(&self) -> &[IdentityPair] {
        &self.pending
    }

    /// Persist pending assignments; they are kept if the sink fails
    pub fn flush<S: IdentitySink>(&mut self, sink: &mut S) -> Result<usize, IdentityError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        sink.persist(&self.pending)?;
        let n = self.pending.len();
        log::info!("identity encoder: persisted {} new assignments", n);
        self.pending.clear();
        Ok(n)
    }
}
