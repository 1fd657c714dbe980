//! Durable write-through cache shared by every lookup layer.
//!
//! Entries live in memory and are appended to a JSON-lines journal as they
//! change. Reopening the journal replays it; later entries for a key win.
//! There is no eviction: the key space is bounded by the set of addresses
//! (and places) ever looked up.
//!
//! Callers that fill a missing entry from an expensive source take the
//! key's fill lock first, so concurrent misses on one key make one call.

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One journal line
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum JournalEntry {
    Put { key: String, value: Value },
    Remove { key: String },
}

struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    /// A failed write may have left a partial line behind
    torn: bool,
}

impl Journal {
    fn new(path: PathBuf, file: File) -> Self {
        Self {
            path,
            writer: BufWriter::new(file),
            torn: false,
        }
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        if self.torn {
            self.writer.write_all(b"\n")?;
            self.torn = false;
        }
        if let Err(e) = self.write_line(entry) {
            self.torn = true;
            return Err(e);
        }
        Ok(())
    }

    fn write_line(&mut self, entry: &JournalEntry) -> Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Persistent key -> JSON value store, namespaced by topic
pub struct GeoCache {
    entries: RwLock<HashMap<String, Value>>,
    /// Held across read-modify-write so updates to a key never interleave
    journal: Mutex<Option<Journal>>,
    /// Fill locks of keys currently being looked up
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

fn namespaced(topic: &str, key: &str) -> String {
    format!("{}:{}", topic, key)
}

impl GeoCache {
    /// Cache without a backing file
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            journal: Mutex::new(None),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or create) a journal-backed cache, replaying existing entries
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
        }

        let entries = if path.exists() {
            Self::replay(&path)?
        } else {
            HashMap::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open cache journal: {}", path.display()))?;

        log::info!("cache {}: {} entries", path.display(), entries.len());

        Ok(Self {
            entries: RwLock::new(entries),
            journal: Mutex::new(Some(Journal::new(path, file))),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    fn replay(path: &Path) -> Result<HashMap<String, Value>> {
        let file = File::open(path)
            .with_context(|| format!("failed to read cache journal: {}", path.display()))?;
        let mut entries = HashMap::new();

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(JournalEntry::Put { key, value }) => {
                    entries.insert(key, value);
                }
                Ok(JournalEntry::Remove { key }) => {
                    entries.remove(&key);
                }
                // A torn write at the tail of the journal from an interrupted run
                Err(e) => log::warn!(
                    "cache journal {} line {}: skipping unreadable entry ({})",
                    path.display(),
                    lineno + 1,
                    e
                ),
            }
        }

        Ok(entries)
    }

    /// Handle scoped to one topic
    pub fn topic(self: &Arc<Self>, name: &str) -> CacheTopic {
        CacheTopic {
            cache: Arc::clone(self),
            name: name.to_string(),
        }
    }

    pub fn get(&self, topic: &str, key: &str) -> Option<Value> {
        self.entries.read().get(&namespaced(topic, key)).cloned()
    }

    /// Store `value`, returning the previous value for the key.
    ///
    /// The value is kept in memory even when the journal write fails.
    pub fn put(&self, topic: &str, key: &str, value: Value) -> Result<Option<Value>> {
        let key = namespaced(topic, key);
        let mut journal = self.journal.lock();
        let previous = self.entries.write().insert(key.clone(), value.clone());
        if let Some(journal) = journal.as_mut() {
            journal.append(&JournalEntry::Put { key, value })?;
        }
        Ok(previous)
    }

    /// Wait for exclusive fill rights on `topic:key`
    pub async fn lock_key(self: &Arc<Self>, topic: &str, key: &str) -> KeyGuard {
        let key = namespaced(topic, key);
        let slot = Arc::clone(self.inflight.lock().entry(key.clone()).or_default());
        let guard = slot.lock_owned().await;
        KeyGuard {
            cache: Arc::clone(self),
            key,
            guard: Some(guard),
        }
    }

    pub fn remove(&self, topic: &str, key: &str) -> Result<Option<Value>> {
        let key = namespaced(topic, key);
        let mut journal = self.journal.lock();
        if !self.entries.read().contains_key(&key) {
            return Ok(None);
        }
        if let Some(journal) = journal.as_mut() {
            journal.append(&JournalEntry::Remove { key: key.clone() })?;
        }
        Ok(self.entries.write().remove(&key))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sync the journal to disk
    pub fn flush(&self) -> Result<()> {
        let mut journal = self.journal.lock();
        if let Some(journal) = journal.as_mut() {
            journal.writer.flush()?;
            journal.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Rewrite the journal with only the live entries
    pub fn compact(&self) -> Result<()> {
        let mut guard = self.journal.lock();
        let Some(journal) = guard.as_mut() else {
            return Ok(());
        };

        let tmp_path = journal.path.with_extension("compact");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            let entries = self.entries.read();
            for (key, value) in entries.iter() {
                serde_json::to_writer(
                    &mut tmp,
                    &JournalEntry::Put {
                        key: key.clone(),
                        value: value.clone(),
                    },
                )?;
                tmp.write_all(b"\n")?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_data()?;
        }
        fs::rename(&tmp_path, &journal.path)
            .with_context(|| format!("failed to replace {}", journal.path.display()))?;

        let file = OpenOptions::new().append(true).open(&journal.path)?;
        journal.writer = BufWriter::new(file);
        Ok(())
    }
}

/// Fill lock on one key, released on drop
pub struct KeyGuard {
    cache: Arc<GeoCache>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut inflight = self.cache.inflight.lock();
        drop(self.guard.take());
        if let Some(slot) = inflight.get(&self.key)
            && Arc::strong_count(slot) == 1
        {
            inflight.remove(&self.key);
        }
    }
}

/// Typed view of one cache namespace
#[derive(Clone)]
pub struct CacheTopic {
    cache: Arc<GeoCache>,
    name: String,
}

impl CacheTopic {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached value for `key`; entries that no longer decode as `T` count as misses
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.cache.get(&self.name, key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                log::debug!("cache {}:{} undecodable ({})", self.name, key, e);
                None
            }
        }
    }

    /// Store `value`; a failed journal write is logged and the value kept in memory
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Option<Value> {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("cache {}:{} not serializable ({})", self.name, key, e);
                return None;
            }
        };
        match self.cache.put(&self.name, key, value) {
            Ok(previous) => previous,
            Err(e) => {
                log::warn!("cache {}: journal write failed ({:#})", self.name, e);
                None
            }
        }
    }

    /// Serialize fills of `key` within this topic
    pub async fn lock(&self, key: &str) -> KeyGuard {
        self.cache.lock_key(&self.name, key).await
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        match self.cache.remove(&self.name, key) {
            Ok(previous) => previous,
            Err(e) => {
                log::warn!("cache {}: journal write failed ({:#})", self.name, e);
                None
            }
        }
    }
}
