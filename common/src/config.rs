use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Forward proxy kind for an `OriginSource`. HTTP proxies are plain
/// `http://` or `https://` CONNECT proxies; SOCKS5 is the other transport
/// supported by reqwest.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks5,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub url: String,
    pub credentials: Option<ProxyCredentials>,
}

/// Configuration subtable for storage locations, mirroring the teacher's
/// split of a monolithic config struct into per-concern pieces
/// (`FsConfig`/`HttpConfig`/`TaskConfig`) for readability.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `<id>.video` / `<id>.meta` pairs for in-progress
    /// and resumable resources.
    pub storage_dir: PathBuf,

    /// Directory completed resources are promoted into. Defaults to
    /// `<storage_dir>/../collections` if not set.
    pub collections_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn collections_dir(&self) -> PathBuf {
        self.collections_dir.clone().unwrap_or_else(|| {
            self.storage_dir
                .parent()
                .map(|p| p.join("collections"))
                .unwrap_or_else(|| PathBuf::from("collections"))
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpServerConfig {
    /// Loopback port the hybrid server binds to.
    pub port: u16,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Per-origin-fetch options: forwarded verbatim to every `head()`/`fetch()`
/// call an `OriginSource` makes.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct OriginConfig {
    pub user_agent: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub extra_headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub storage: StorageConfig,
    pub http: HttpServerConfig,
    pub origin: OriginConfig,
}

impl CacheConfig {
    pub fn new(storage_dir: PathBuf) -> Self {
        Self {
            storage: StorageConfig {
                storage_dir,
                collections_dir: None,
            },
            http: HttpServerConfig::default(),
            origin: OriginConfig::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.http.port = port;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.origin.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.origin.proxy = Some(proxy);
        self
    }
}

/// Top-level shape of the optional TOML config file consumed by the
/// standalone binary, keeping a `[config]` subtable the way the teacher's
/// `TomlConfigFile` wrapper does, so the file can later grow sibling
/// top-level tables without breaking this one.
#[derive(Debug, Serialize, Deserialize)]
struct TomlConfigFile {
    config: CacheConfig,
}

pub fn parse_toml(doc: &str) -> Result<CacheConfig, toml::de::Error> {
    let file: TomlConfigFile = toml::from_str(doc)?;
    Ok(file.config)
}
