use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::Config;
use crate::lookup::cloud::Provider;
use crate::state::Direction;

/// Locate where traceroute paths cross into and out of cloud provider networks
#[derive(Parser, Debug, Clone)]
#[command(name = "bordermap")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file (default: ~/.config/bordermap/config.toml)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the registry files
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Location cache journal
    #[arg(long = "cache", global = true)]
    pub cache: Option<PathBuf>,

    /// Per-call timeout for external services, in seconds
    #[arg(long = "timeout", global = true)]
    pub timeout: Option<f64>,

    /// Paths processed concurrently
    #[arg(short = 'j', long = "concurrency", global = true)]
    pub concurrency: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Detect border crossings in a JSON-lines file of traceroutes
    Locate {
        /// Trace direction (ingress, egress)
        #[arg(short = 'd', long = "direction")]
        direction: Direction,

        /// Cloud provider (AWS, Azure, Google)
        #[arg(short = 'p', long = "provider")]
        provider: Provider,

        /// Sanitized traces, one TracePath per line
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Known PoP list (JSON)
        #[arg(long = "pops")]
        pops: Option<PathBuf>,

        /// Provider ASNs, replacing the configured set
        #[arg(long = "asn")]
        asns: Vec<u32>,

        /// Output format
        #[arg(short = 'f', long = "format", value_enum, default_value = "csv")]
        format: OutputFormat,

        /// Only use local overrides and cached locations
        #[arg(long = "cache-only")]
        cache_only: bool,
    },

    /// Print the resolved location of addresses
    Geolocate {
        #[arg(required = true)]
        ips: Vec<IpAddr>,

        /// Only use local overrides and cached locations
        #[arg(long = "cache-only")]
        cache_only: bool,
    },

    /// Print the origin network of addresses
    Origin {
        #[arg(required = true)]
        ips: Vec<IpAddr>,
    },

    /// Assign canonical identities to raw path records
    AssignIds {
        /// Raw path records, one per line
        #[arg(long = "records")]
        records: PathBuf,
    },

    /// Download the PeeringDB dumps the exchange directory is built from
    FetchPeeringdb {
        /// Target directory (default: configured peeringdb dir)
        #[arg(long = "out")]
        out: Option<PathBuf>,

        /// Download even if the dumps are less than a day old
        #[arg(long = "force")]
        force: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if let Some(timeout) = self.timeout
            && !(timeout.is_finite() && timeout > 0.0)
        {
            return Err("Timeout must be positive".into());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".into());
        }

        // Upper bound to keep external services from being flooded
        const MAX_CONCURRENCY: usize = 256;
        if let Some(n) = self.concurrency
            && n > MAX_CONCURRENCY
        {
            return Err(format!("Concurrency cannot exceed {}", MAX_CONCURRENCY));
        }

        Ok(())
    }

    /// Apply command-line overrides on top of the loaded config
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(cache) = &self.cache {
            config.cache_path = cache.clone();
        }
        if let Some(timeout) = self.timeout {
            config.external_timeout = std::time::Duration::from_secs_f64(timeout);
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
    }
}
