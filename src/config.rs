use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::border::pop::DEFAULT_TOLERANCE_KM;
use crate::lookup::cloud::Provider;

/// Registry and data files, relative to `data_dir` unless absolute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataFiles {
    /// pyasn-style `prefix<TAB>asn` dump
    pub bgp: PathBuf,
    /// CAIDA ix-asns JSON lines
    pub ixp_members: PathBuf,
    /// AS-Rank organisation JSON lines
    pub asn_orgs: PathBuf,
    /// Curated `ip,asn,lat,lng,place,country,tag` overrides
    pub local_overrides: PathBuf,
    pub geofeeds: Vec<PathBuf>,
    pub aws_feed: PathBuf,
    pub azure_feed: PathBuf,
    pub google_feed: PathBuf,
    pub iata: PathBuf,
    pub clli: PathBuf,
    /// Naming-convention hints JSON lines
    pub hints: PathBuf,
    /// Directory holding the PeeringDB dumps
    pub peeringdb: PathBuf,
}

impl Default for DataFiles {
    fn default() -> Self {
        Self {
            bgp: "ipasn.dat".into(),
            ixp_members: "ix-asns.jsonl".into(),
            asn_orgs: "asorgs.jsonl".into(),
            local_overrides: "local.csv".into(),
            geofeeds: vec!["geofeed.csv".into()],
            aws_feed: "aws-ip-ranges.json".into(),
            azure_feed: "azure-service-tags.json".into(),
            google_feed: "google-cloud.json".into(),
            iata: "iata.csv".into(),
            clli: "clli.tsv".into(),
            hints: "hints.jsonl".into(),
            peeringdb: "peeringdb".into(),
        }
    }
}

impl DataFiles {
    pub fn feed(&self, provider: Provider) -> &Path {
        match provider {
            Provider::Aws => &self.aws_feed,
            Provider::Azure => &self.azure_feed,
            Provider::Google => &self.google_feed,
        }
    }
}

/// ASNs operated by each provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudAsns {
    pub aws: Vec<u32>,
    pub azure: Vec<u32>,
    pub google: Vec<u32>,
}

impl Default for CloudAsns {
    fn default() -> Self {
        Self {
            aws: vec![16509, 14618],
            azure: vec![8075],
            google: vec![15169, 396982],
        }
    }
}

impl CloudAsns {
    pub fn get(&self, provider: Provider) -> &[u32] {
        match provider {
            Provider::Aws => &self.aws,
            Provider::Azure => &self.azure,
            Provider::Google => &self.google,
        }
    }
}

/// Runtime configuration, read from TOML and overridden by the command line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory of the registry files
    pub data_dir: PathBuf,
    /// Location cache journal
    pub cache_path: PathBuf,
    /// Canonical path identity journal
    pub identity_journal: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipinfo_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peeringdb_api_key: Option<String>,
    /// Per-call timeout for external services
    #[serde(with = "duration_serde")]
    pub external_timeout: Duration,
    /// Radius for matching a location to a known PoP
    pub pop_tolerance_km: f64,
    /// Paths processed concurrently
    pub concurrency: usize,
    pub files: DataFiles,
    pub cloud_asns: CloudAsns,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::cache_dir()
            .map(|p| p.join("bordermap"))
            .unwrap_or_else(|| PathBuf::from(".bordermap"));
        Self {
            data_dir: dirs::data_dir()
                .map(|p| p.join("bordermap"))
                .unwrap_or_else(|| PathBuf::from("data")),
            cache_path: state_dir.join("geocache.jsonl"),
            identity_journal: state_dir.join("identities.jsonl"),
            google_api_key: None,
            ipinfo_token: None,
            peeringdb_api_key: None,
            external_timeout: Duration::from_secs(10),
            pop_tolerance_km: DEFAULT_TOLERANCE_KM,
            concurrency: 1,
            files: DataFiles::default(),
            cloud_asns: CloudAsns::default(),
        }
    }
}

impl Config {
    /// Default config file: ~/.config/bordermap/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("bordermap").join("config.toml"))
    }

    /// Load from `path`, else the default location, else built-in defaults.
    /// Credentials missing from the file are taken from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config = toml::from_str(&data)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        let non_empty = |name: &str| var(name).filter(|v| !v.is_empty());
        if self.google_api_key.is_none() {
            self.google_api_key = non_empty("GOOGLE_API_KEY");
        }
        if self.ipinfo_token.is_none() {
            self.ipinfo_token = non_empty("IPINFO_TOKEN");
        }
        if self.peeringdb_api_key.is_none() {
            self.peeringdb_api_key = non_empty("PEERINGDB_API_KEY");
        }
    }

    /// Resolve a data file against `data_dir`
    pub fn data_path(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir.join(file)
        }
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.external_timeout, Duration::from_secs(10));
        assert_eq!(config.pop_tolerance_km, 50.0);
        assert_eq!(config.concurrency, 1);
        assert!(config.cloud_asns.get(Provider::Aws).contains(&16509));
        assert!(config.google_api_key.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml_str = r#"
            data_dir = "/srv/registries"
            external_timeout = 2.5
            concurrency = 8

            [files]
            geofeeds = ["a.csv", "/abs/b.csv"]

            [cloud_asns]
            azure = [8075, 8068]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.external_timeout, Duration::from_millis(2500));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.cloud_asns.get(Provider::Azure), &[8075, 8068]);
        assert_eq!(config.cloud_asns.get(Provider::Aws), &[16509, 14618]);
        assert_eq!(config.files.iata, PathBuf::from("iata.csv"));

        assert_eq!(
            config.data_path(&config.files.geofeeds[0]),
            PathBuf::from("/srv/registries/a.csv")
        );
        assert_eq!(
            config.data_path(&config.files.geofeeds[1]),
            PathBuf::from("/abs/b.csv")
        );
    }

    #[test]
    fn test_negative_timeout_rejected() {
        assert!(toml::from_str::<Config>("external_timeout = -1.0").is_err());
    }

    #[test]
    fn test_env_fills_missing_credentials_only() {
        let mut config = Config {
            google_api_key: Some("from-file".to_string()),
            ..Default::default()
        };
        config.apply_env(|name| match name {
            "GOOGLE_API_KEY" => Some("from-env".to_string()),
            "IPINFO_TOKEN" => Some("tok".to_string()),
            "PEERINGDB_API_KEY" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.google_api_key.as_deref(), Some("from-file"));
        assert_eq!(config.ipinfo_token.as_deref(), Some("tok"));
        assert!(config.peeringdb_api_key.is_none());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "pop_tolerance_km = 25.0\n").unwrap();
        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.pop_tolerance_km, 25.0);

        assert!(Config::load(Some(dir.path().join("missing.toml").as_path())).is_err());
    }

    #[test]
    fn test_serialization_omits_missing_credentials() {
        let toml_str = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(!toml_str.contains("google_api_key"));
        assert!(toml_str.contains("external_timeout = 10.0"));
    }
}
