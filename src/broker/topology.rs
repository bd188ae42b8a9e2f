//! Federation topology and startup configuration.
//!
//! The topology is read once when the process starts and never changes
//! afterwards; picking up a new peer means restarting with a new file.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use hashbrown::HashMap;
use serde::Deserialize;

use super::{cache::CacheSettings, error::BrokerError, fanout::DEFAULT_WORKER_PERMITS, hrn::Hrn};

/// Where and how to reach one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub hrn: Hrn,
    pub addr: SocketAddr,
    /// TLS server name the peer's certificate is issued for.
    pub server_name: String,
}

impl InterfaceDescriptor {
    pub fn new(hrn: Hrn, addr: SocketAddr, server_name: impl Into<String>) -> Self {
        Self {
            hrn,
            addr,
            server_name: server_name.into(),
        }
    }

    pub fn url(&self) -> String {
        format!("quic://{}", self.addr)
    }
}

/// Known registries and aggregates, keyed by authority HRN.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    registries: HashMap<Hrn, InterfaceDescriptor>,
    aggregates: HashMap<Hrn, InterfaceDescriptor>,
}

impl Topology {
    pub fn new(
        registries: Vec<InterfaceDescriptor>,
        aggregates: Vec<InterfaceDescriptor>,
    ) -> Result<Self, BrokerError> {
        Ok(Self {
            registries: index("registry", registries)?,
            aggregates: index("aggregate", aggregates)?,
        })
    }

    pub fn registry(&self, hrn: &Hrn) -> Option<&InterfaceDescriptor> {
        self.registries.get(hrn)
    }

    pub fn aggregate(&self, hrn: &Hrn) -> Option<&InterfaceDescriptor> {
        self.aggregates.get(hrn)
    }

    /// Registries sorted by HRN.
    pub fn registries(&self) -> Vec<&InterfaceDescriptor> {
        sorted(&self.registries)
    }

    /// Aggregates sorted by HRN.
    pub fn aggregates(&self) -> Vec<&InterfaceDescriptor> {
        sorted(&self.aggregates)
    }

    /// URL of a registry or aggregate named `hrn`, registries first.
    pub fn url_of(&self, hrn: &Hrn) -> Option<String> {
        self.registries
            .get(hrn)
            .or_else(|| self.aggregates.get(hrn))
            .map(InterfaceDescriptor::url)
    }
}

fn index(
    table: &str,
    entries: Vec<InterfaceDescriptor>,
) -> Result<HashMap<Hrn, InterfaceDescriptor>, BrokerError> {
    let mut out = HashMap::with_capacity(entries.len());
    for entry in entries {
        let hrn = entry.hrn.clone();
        if out.insert(hrn.clone(), entry).is_some() {
            return Err(BrokerError::Config(format!("duplicate {} {}", table, hrn)));
        }
    }
    Ok(out)
}

fn sorted(table: &HashMap<Hrn, InterfaceDescriptor>) -> Vec<&InterfaceDescriptor> {
    let mut entries: Vec<_> = table.values().collect();
    entries.sort_by(|a, b| a.hrn.cmp(&b.hrn));
    entries
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub tls: Option<TlsSection>,
    #[serde(default)]
    pub registries: Vec<InterfaceSection>,
    #[serde(default)]
    pub aggregates: Vec<InterfaceSection>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    pub hrn: String,
    pub listen: SocketAddr,
    #[serde(default = "default_permits")]
    pub worker_permits: usize,
    #[serde(default = "default_ttl")]
    pub resources_ttl_secs: u64,
    #[serde(default = "default_ttl")]
    pub version_ttl_secs: u64,
    /// Where the broker's signing key is kept. Created on first start. A
    /// broker without one signs with a key that dies with the process.
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,
    /// Where the administrator credential is written at startup.
    #[serde(default)]
    pub admin_credential_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceSection {
    pub hrn: String,
    pub addr: SocketAddr,
    pub server_name: String,
}

fn default_permits() -> usize {
    DEFAULT_WORKER_PERMITS
}

fn default_ttl() -> u64 {
    super::cache::DEFAULT_TTL_SECS
}

impl BrokerConfig {
    pub fn from_toml(text: &str) -> Result<Self, BrokerError> {
        let config: Self = toml::from_str(text).map_err(|e| BrokerError::Config(e.to_string()))?;
        Hrn::parse(&config.broker.hrn)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let text = fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn hrn(&self) -> Hrn {
        Hrn::new(self.broker.hrn.clone())
    }

    pub fn topology(&self) -> Result<Topology, BrokerError> {
        let convert = |entries: &[InterfaceSection]| -> Result<Vec<InterfaceDescriptor>, BrokerError> {
            entries
                .iter()
                .map(|e| {
                    Ok(InterfaceDescriptor::new(
                        Hrn::parse(&e.hrn)?,
                        e.addr,
                        e.server_name.clone(),
                    ))
                })
                .collect()
        };
        Topology::new(convert(&self.registries)?, convert(&self.aggregates)?)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            resources_ttl: Duration::from_secs(self.broker.resources_ttl_secs),
            version_ttl: Duration::from_secs(self.broker.version_ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
[broker]
hrn = "plc"
listen = "127.0.0.1:12346"
resources_ttl_secs = 120

[[registries]]
hrn = "plc"
addr = "127.0.0.1:12345"
server_name = "registry.plc"

[[registries]]
hrn = "ple"
addr = "10.0.0.2:12345"
server_name = "registry.ple"

[[aggregates]]
hrn = "ple"
addr = "10.0.0.2:12346"
server_name = "am.ple"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = BrokerConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.hrn(), Hrn::new("plc"));
        assert_eq!(config.broker.worker_permits, DEFAULT_WORKER_PERMITS);
        let cache = config.cache_settings();
        assert_eq!(cache.resources_ttl, Duration::from_secs(120));
        assert_eq!(cache.version_ttl, Duration::from_secs(3600));
        assert!(config.tls.is_none());
        assert!(config.broker.signing_key_path.is_none());
        assert!(config.broker.admin_credential_path.is_none());

        let topology = config.topology().unwrap();
        assert_eq!(topology.registries().len(), 2);
        assert_eq!(topology.registries()[0].hrn, Hrn::new("plc"));
        assert_eq!(
            topology.url_of(&Hrn::new("ple")).as_deref(),
            Some("quic://10.0.0.2:12345")
        );
    }

    #[test]
    fn key_and_credential_paths_are_read() {
        let text = SAMPLE.replace(
            "resources_ttl_secs = 120",
            "resources_ttl_secs = 120\nsigning_key_path = \"/var/lib/fedbroker/plc.key\"\nadmin_credential_path = \"/var/lib/fedbroker/admin.cred\"",
        );
        let config = BrokerConfig::from_toml(&text).unwrap();
        assert_eq!(
            config.broker.signing_key_path.as_deref(),
            Some(Path::new("/var/lib/fedbroker/plc.key"))
        );
        assert_eq!(
            config.broker.admin_credential_path.as_deref(),
            Some(Path::new("/var/lib/fedbroker/admin.cred"))
        );
    }

    #[test]
    fn duplicate_peers_are_rejected() {
        let text = format!(
            "{}\n[[aggregates]]\nhrn = \"ple\"\naddr = \"10.0.0.3:1\"\nserver_name = \"x\"\n",
            SAMPLE
        );
        let config = BrokerConfig::from_toml(&text).unwrap();
        assert!(matches!(config.topology(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn invalid_hrn_is_a_config_error() {
        let text = SAMPLE.replace("hrn = \"plc\"\nlisten", "hrn = \"plc..x\"\nlisten");
        assert!(BrokerConfig::from_toml(&text).is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(config.aggregates.len(), 1);
        assert!(BrokerConfig::load(Path::new("/nonexistent/fedbroker.toml")).is_err());
    }
}
