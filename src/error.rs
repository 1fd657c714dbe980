//! Typed errors for conditions callers must tell apart.
//!
//! Everything else (loading files, talking to services) returns
//! `anyhow::Result` with context.

use std::net::IpAddr;
use thiserror::Error;

/// Why a path produced no border record.
#[derive(Error, Debug)]
pub enum BorderError {
    /// The path is unusable; skip it and keep going.
    #[error("malformed path {key}: {reason}")]
    MalformedPath { key: String, reason: String },

    /// A provider VM address has no curated location, so nothing measured
    /// from it can be trusted. Halts the batch.
    #[error("VM address {ip} has no local location entry (found: {found})")]
    UnanchoredVm { ip: IpAddr, found: String },
}

impl BorderError {
    /// Whether the whole batch must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnanchoredVm { .. })
    }
}

/// Path identity assignment failures. All of them stop the batch.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("unknown raw record {0}")]
    UnknownRecord(u64),

    #[error("raw record {raw_id} is persisted as {persisted} but resolves to {computed}")]
    Conflict {
        raw_id: u64,
        persisted: u64,
        computed: u64,
    },

    #[error("identity journal error: {0}")]
    Journal(#[from] std::io::Error),
}
