use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use bordermap::border::{BorderDetector, PopList};
use bordermap::cli::{Args, Command, OutputFormat};
use bordermap::config::Config;
use bordermap::export::{export_csv, export_json};
use bordermap::lookup::cache::GeoCache;
use bordermap::lookup::cloud::Provider;
use bordermap::lookup::ix;
use bordermap::setup;
use bordermap::state::identity::apply_persisted;
use bordermap::state::{Direction, IdentityJournal, PathIdentityEncoder, RawPathRecord, TracePath};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        log::warn!("interrupted, finishing in-flight work");
        cancel_clone.cancel();
    });

    match args.command {
        Command::Locate {
            direction,
            provider,
            input,
            pops,
            asns,
            format,
            cache_only,
        } => {
            let job = LocateJob {
                direction,
                provider,
                input,
                pops,
                asns,
                format,
                cache_only,
            };
            run_locate(&config, job, &cancel).await
        }
        Command::Geolocate { ips, cache_only } => run_geolocate(&config, &ips, cache_only, &cancel).await,
        Command::Origin { ips } => run_origin(&config, &ips),
        Command::AssignIds { records } => run_assign_ids(&config, &records),
        Command::FetchPeeringdb { out, force } => run_fetch_peeringdb(&config, out, force, &cancel).await,
    }
}

/// Read a JSON-lines file, skipping blank lines
fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open input file: {}", path.display()))?;
    let mut items = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse {} line {}", path.display(), lineno + 1))?;
        items.push(item);
    }
    Ok(items)
}

struct LocateJob {
    direction: Direction,
    provider: Provider,
    input: PathBuf,
    pops: Option<PathBuf>,
    asns: Vec<u32>,
    format: OutputFormat,
    cache_only: bool,
}

/// Run border detection over a trace file and print the records
async fn run_locate(config: &Config, job: LocateJob, cancel: &CancellationToken) -> Result<()> {
    let paths: Vec<TracePath> = read_json_lines(&job.input)?;
    log::info!("{}: {} traces", job.input.display(), paths.len());

    let pops = match &job.pops {
        Some(path) => PopList::load(path, config.pop_tolerance_km)?,
        None => {
            log::warn!("no PoP list given, every border is reported as an unknown PoP");
            PopList::new(Vec::new(), config.pop_tolerance_km)
        }
    };
    let asns = if job.asns.is_empty() {
        config.cloud_asns.get(job.provider).to_vec()
    } else {
        job.asns
    };
    log::info!("{} ASNs: {:?}", job.provider, asns);

    let cache = Arc::new(GeoCache::open(&config.cache_path)?);
    let origins = Arc::new(setup::origin_resolver(config)?);
    let locations = Arc::new(setup::location_resolver(config, &cache)?);
    let detector = BorderDetector::new(origins, locations, asns, pops).cache_only(job.cache_only);

    let result = detector
        .locate_batch(paths, job.direction, config.concurrency, cancel)
        .await;
    // Keep what was learned even when the batch halted
    cache.flush()?;
    let output = result?;
    if output.cancelled {
        log::warn!("batch cancelled, writing {} finished records", output.records.len());
    }

    let stdout = std::io::stdout();
    match job.format {
        OutputFormat::Csv => export_csv(&output.records, stdout.lock()),
        OutputFormat::Json => export_json(&output.records, stdout.lock()),
    }
}

#[derive(serde::Serialize)]
struct Located<'a, T> {
    ip: IpAddr,
    #[serde(flatten)]
    result: Option<&'a T>,
}

async fn run_geolocate(config: &Config, ips: &[IpAddr], cache_only: bool, cancel: &CancellationToken) -> Result<()> {
    let cache = Arc::new(GeoCache::open(&config.cache_path)?);
    let locations = setup::location_resolver(config, &cache)?;

    let mut found = Vec::with_capacity(ips.len());
    for &ip in ips {
        if cancel.is_cancelled() {
            break;
        }
        found.push((ip, locations.resolve(ip, cache_only).await));
    }
    cache.flush()?;

    let rows: Vec<Located<_>> = found
        .iter()
        .map(|(ip, loc)| Located {
            ip: *ip,
            result: loc.as_ref(),
        })
        .collect();
    export_json(&rows, std::io::stdout().lock())
}

fn run_origin(config: &Config, ips: &[IpAddr]) -> Result<()> {
    let origins = setup::origin_resolver(config)?;
    let found: Vec<_> = ips.iter().map(|&ip| (ip, origins.resolve(ip))).collect();
    let rows: Vec<Located<_>> = found
        .iter()
        .map(|(ip, origin)| Located {
            ip: *ip,
            result: origin.as_ref(),
        })
        .collect();
    export_json(&rows, std::io::stdout().lock())
}

/// Assign canonical ids and append new ones to the journal
fn run_assign_ids(config: &Config, path: &Path) -> Result<()> {
    let mut records: Vec<RawPathRecord> = read_json_lines(path)?;
    let mut journal = IdentityJournal::new(&config.identity_journal);
    let persisted = journal
        .load()
        .with_context(|| format!("Failed to load identity journal: {}", journal.path().display()))?;
    apply_persisted(&mut records, &persisted)?;

    let raw_ids: Vec<u64> = records.iter().map(|r| r.raw_id).collect();
    let mut encoder = PathIdentityEncoder::new(records)?;

    let mut wtr = csv::Writer::from_writer(std::io::stdout().lock());
    wtr.write_record(["raw_id", "canonical_id"])?;
    for raw_id in raw_ids {
        let canonical_id = encoder.identity(raw_id)?;
        wtr.write_record([raw_id.to_string(), canonical_id.to_string()])?;
    }
    wtr.flush()?;

    encoder.flush(&mut journal)?;
    Ok(())
}

async fn run_fetch_peeringdb(
    config: &Config,
    out: Option<PathBuf>,
    force: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let dir = out.unwrap_or_else(|| config.data_path(&config.files.peeringdb));
    if !force && ix::dumps_fresh(&dir) {
        log::info!("PeeringDB dumps in {} are less than a day old, skipping", dir.display());
        return Ok(());
    }

    tokio::select! {
        result = ix::download(&dir, config.peeringdb_api_key.as_deref(), config.external_timeout) => {
            result?;
            log::info!("PeeringDB dumps written to {}", dir.display());
            Ok(())
        }
        _ = cancel.cancelled() => anyhow::bail!("PeeringDB download cancelled"),
    }
}
