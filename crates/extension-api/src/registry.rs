//! The domain service registry: `.cogworks/services.toml`.
//!
//! ```toml
//! [[services]]
//! name = "rust"
//! transport = "unix"
//! socket = "/run/cogworks/rust.sock"
//!
//! [[services]]
//! name = "kicad"
//! transport = "http"
//! url = "https://kicad.internal:8443/cogworks"
//! timeout_secs = 120
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use pipeline::DomainServiceName;

/// Errors loading the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("services configuration could not be parsed: {0}")]
    Parse(String),

    #[error("domain service '{0}' is registered more than once")]
    Duplicate(DomainServiceName),

    #[error("domain service '{name}': {reason}")]
    Invalid { name: DomainServiceName, reason: String },
}

/// How to reach a domain service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Newline-delimited JSON over a Unix domain socket.
    Unix(PathBuf),
    /// JSON over HTTP(S) POST.
    Http(reqwest::Url),
}

/// One registered domain service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: DomainServiceName,
    pub endpoint: Endpoint,
    /// Upper bound for every call, tightening the node's own timeout.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TransportKind {
    Unix,
    Http,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    name: DomainServiceName,
    #[serde(default = "default_transport")]
    transport: TransportKind,
    socket: Option<PathBuf>,
    url: Option<String>,
    timeout_secs: Option<u64>,
}

fn default_transport() -> TransportKind {
    TransportKind::Unix
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    services: Vec<RawEntry>,
}

/// Every configured domain service, by name.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<DomainServiceName, ServiceEntry>,
}

impl ServiceRegistry {
    /// Parses a registry document.
    ///
    /// # Errors
    ///
    /// [`RegistryError`] for unparseable documents, duplicate names, a
    /// transport without its address, or a plain-HTTP URL that is not local.
    pub fn from_toml(text: &str) -> Result<Self, RegistryError> {
        let raw: RawRegistry = toml::from_str(text).map_err(|e| RegistryError::Parse(e.to_string()))?;
        let mut services = BTreeMap::new();
        for entry in raw.services {
            let entry = entry.into_entry()?;
            if services.contains_key(&entry.name) {
                return Err(RegistryError::Duplicate(entry.name));
            }
            services.insert(entry.name.clone(), entry);
        }
        Ok(Self { services })
    }

    /// Reads and parses the registry at `path`.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn get(&self, name: &DomainServiceName) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl RawEntry {
    fn into_entry(self) -> Result<ServiceEntry, RegistryError> {
        let invalid = |reason: &str| RegistryError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        let endpoint = match self.transport {
            TransportKind::Unix => Endpoint::Unix(
                self.socket
                    .clone()
                    .ok_or_else(|| invalid("unix transport requires 'socket'"))?,
            ),
            TransportKind::Http => {
                let raw = self
                    .url
                    .as_deref()
                    .ok_or_else(|| invalid("http transport requires 'url'"))?;
                let url = reqwest::Url::parse(raw).map_err(|e| invalid(&format!("invalid url: {e}")))?;
                check_transport_security(&url).map_err(|reason| invalid(&reason))?;
                Endpoint::Http(url)
            }
        };
        if self.timeout_secs == Some(0) {
            return Err(invalid("timeout_secs must be at least 1"));
        }
        Ok(ServiceEntry {
            name: self.name,
            endpoint,
            timeout: self.timeout_secs.map(Duration::from_secs),
        })
    }
}

/// Non-local services must be reached over TLS.
pub fn check_transport_security(url: &reqwest::Url) -> Result<(), String> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if is_loopback(url) => Ok(()),
        "http" => Err(format!(
            "plain http is only allowed for loopback hosts, not '{}'",
            url.host_str().unwrap_or_default()
        )),
        other => Err(format!("unsupported scheme '{other}'")),
    }
}

fn is_loopback(url: &reqwest::Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => host.eq_ignore_ascii_case("localhost"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> DomainServiceName {
        DomainServiceName::new(n).unwrap()
    }

    #[test]
    fn parses_both_transports() {
        let registry = ServiceRegistry::from_toml(
            r#"
[[services]]
name = "rust"
socket = "/run/cogworks/rust.sock"

[[services]]
name = "kicad"
transport = "http"
url = "https://kicad.internal:8443/cogworks"
timeout_secs = 120
"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get(&name("rust")).unwrap().endpoint,
            Endpoint::Unix(PathBuf::from("/run/cogworks/rust.sock"))
        );
        let kicad = registry.get(&name("kicad")).unwrap();
        assert!(matches!(kicad.endpoint, Endpoint::Http(_)));
        assert_eq!(kicad.timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn plain_http_only_for_loopback() {
        for url in ["http://127.0.0.1:9000/", "http://localhost/x", "http://[::1]:80/"] {
            assert!(check_transport_security(&reqwest::Url::parse(url).unwrap()).is_ok(), "{url}");
        }
        let remote = reqwest::Url::parse("http://build-farm.example.com/").unwrap();
        assert!(check_transport_security(&remote).is_err());

        let err = ServiceRegistry::from_toml(
            r#"
[[services]]
name = "remote"
transport = "http"
url = "http://10.0.0.8/cogworks"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::Invalid { .. }));
    }

    #[test]
    fn rejects_duplicates_and_missing_addresses() {
        let dup = r#"
[[services]]
name = "rust"
socket = "/a.sock"

[[services]]
name = "rust"
socket = "/b.sock"
"#;
        assert!(matches!(ServiceRegistry::from_toml(dup), Err(RegistryError::Duplicate(_))));

        let missing = "[[services]]\nname = \"rust\"\ntransport = \"http\"\n";
        assert!(matches!(ServiceRegistry::from_toml(missing), Err(RegistryError::Invalid { .. })));
    }
}
