//! Configuration validation and constants.
//!
//! Turns the raw command-line values into an immutable `ServerConfig`: the
//! upstream URL is parsed and checked, the TLS key/certificate pair is
//! reconciled, and listen addresses are parsed. `ServerConfig` is built once at
//! startup and shared read-only by every listener.

use std::fmt;
use std::path::PathBuf;

use const_format::formatcp;
use reqwest::Url;

// =============================================================================
// Command-line Defaults
// =============================================================================

/// Default plain-HTTP listen address
pub const DEFAULT_HTTP_ADDR: &str = ":8080";

/// Default HTTPS listen address (only used when a key or certificate is given)
pub const DEFAULT_HTTPS_ADDR: &str = ":8443";

/// Default object cache directory
pub const DEFAULT_CACHE_DIRECTORY: &str = "./objects";

/// Default log filter when neither --log-level nor RUST_LOG is set
pub const DEFAULT_LOG_FILTER: &str = "lfscache=info,tower_http=info";

// =============================================================================
// Version Metadata
// =============================================================================

/// Commit the binary was built from, injected by the release pipeline
pub const BUILD_COMMIT: &str = match option_env!("LFSCACHE_COMMIT") {
    Some(commit) => commit,
    None => "none",
};

/// Build timestamp, injected by the release pipeline
pub const BUILD_DATE: &str = match option_env!("LFSCACHE_BUILD_DATE") {
    Some(date) => date,
    None => "unknown",
};

/// Version line printed by `-v`
pub const VERSION_STRING: &str = formatcp!(
    "{}, commit {}, built at {}",
    env!("CARGO_PKG_VERSION"),
    BUILD_COMMIT,
    BUILD_DATE
);

// =============================================================================
// Object Store
// =============================================================================

/// Length of a hex-encoded SHA-256 LFS object id
pub const OID_HEX_LEN: usize = 64;

/// Subdirectory of the cache directory for in-flight downloads
pub const OBJECT_TMP_DIR: &str = "tmp";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// A `host:port` listen address. An empty host listens on all interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl ListenAddr {
    /// Parse a listen address such as `:8080`, `localhost:80` or `[::1]:8443`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidListenAddr {
            addr: raw.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| invalid("missing ']' in address"))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port in address"))?;
            (format!("[{}]", host), port)
        } else {
            let (host, port) = raw
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port in address"))?;
            if host.contains(':') {
                return Err(invalid("too many colons in address"));
            }
            (host.to_string(), port)
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("port is not a number between 0 and 65535"))?;

        Ok(Self { host, port })
    }

    /// Addresses to try, in order, with `tokio::net::TcpListener::bind`.
    ///
    /// An empty host means every interface: the dual-stack IPv6 wildcard
    /// first, then the IPv4 wildcard for hosts without IPv6.
    pub fn bind_targets(&self) -> Vec<String> {
        if self.host.is_empty() {
            vec![format!("[::]:{}", self.port), format!("0.0.0.0:{}", self.port)]
        } else {
            vec![format!("{}:{}", self.host, self.port)]
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Reconciled TLS key and certificate paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

impl TlsPaths {
    /// Pair up the key and certificate paths.
    ///
    /// A single supplied path is used for both (a combined PEM file). Returns
    /// `None` when neither is supplied.
    pub fn reconcile(key: &str, cert: &str) -> Option<Self> {
        let (key, cert) = match (key.is_empty(), cert.is_empty()) {
            (true, true) => return None,
            (false, true) => (key, key),
            (true, false) => (cert, cert),
            (false, false) => (key, cert),
        };

        Some(Self {
            key_path: PathBuf::from(key),
            cert_path: PathBuf::from(cert),
        })
    }
}

/// Raw configuration values, as given on the command line
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    pub http_addr: String,
    pub https_addr: String,
    pub tls_key: String,
    pub tls_cert: String,
    pub url: String,
    pub directory: String,
}

/// Validated, immutable server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Plain-HTTP listener, disabled when `None`
    pub http_addr: Option<ListenAddr>,
    /// HTTPS listener address; only used together with `tls`
    pub https_addr: Option<ListenAddr>,
    pub tls: Option<TlsPaths>,
    /// LFS server being proxied
    pub upstream: Url,
    pub cache_directory: PathBuf,
}

impl ServerConfig {
    /// Validate raw values into a `ServerConfig`.
    pub fn validate(raw: &RawConfig) -> Result<Self, ConfigError> {
        let upstream = parse_upstream(&raw.url)?;

        Ok(Self {
            http_addr: parse_optional_addr(&raw.http_addr)?,
            https_addr: parse_optional_addr(&raw.https_addr)?,
            tls: TlsPaths::reconcile(&raw.tls_key, &raw.tls_cert),
            upstream,
            cache_directory: PathBuf::from(&raw.directory),
        })
    }

    /// HTTPS listens only when an address is set and a key or cert was given.
    pub fn https_enabled(&self) -> bool {
        self.https_addr.is_some() && self.tls.is_some()
    }
}

/// Parse and check the upstream LFS server URL.
pub fn parse_upstream(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUpstream {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ConfigError::InvalidUpstream {
            url: raw.to_string(),
            reason: format!("unsupported scheme \"{}\"", scheme),
        }),
    }
}

fn parse_optional_addr(raw: &str) -> Result<Option<ListenAddr>, ConfigError> {
    if raw.is_empty() {
        return Ok(None);
    }
    ListenAddr::parse(raw).map(Some)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported LFS server URL {url:?}: {reason}")]
    InvalidUpstream { url: String, reason: String },
    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidListenAddr { addr: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(url: &str) -> RawConfig {
        RawConfig {
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            https_addr: DEFAULT_HTTPS_ADDR.to_string(),
            url: url.to_string(),
            directory: DEFAULT_CACHE_DIRECTORY.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_upstream_accepts_http_and_https() {
        for url in ["http://lfs.example.com", "https://lfs.example.com/repo.git/info/lfs"] {
            assert!(parse_upstream(url).is_ok(), "{} should be accepted", url);
        }
    }

    #[test]
    fn test_upstream_rejects_other_schemes() {
        for url in ["ftp://lfs.example.com", "file:///tmp/objects", "ssh://git@example.com/repo"] {
            assert!(matches!(
                parse_upstream(url),
                Err(ConfigError::InvalidUpstream { .. })
            ));
        }
    }

    #[test]
    fn test_upstream_rejects_unparsable() {
        for url in ["", "not a url", "://missing-scheme"] {
            assert!(matches!(
                parse_upstream(url),
                Err(ConfigError::InvalidUpstream { .. })
            ));
        }
    }

    #[test]
    fn test_tls_key_only_is_used_for_cert() {
        let tls = TlsPaths::reconcile("a", "").unwrap();
        assert_eq!(tls.key_path, PathBuf::from("a"));
        assert_eq!(tls.cert_path, PathBuf::from("a"));
    }

    #[test]
    fn test_tls_cert_only_is_used_for_key() {
        let tls = TlsPaths::reconcile("", "b").unwrap();
        assert_eq!(tls.key_path, PathBuf::from("b"));
        assert_eq!(tls.cert_path, PathBuf::from("b"));
    }

    #[test]
    fn test_tls_both_empty_disables() {
        assert!(TlsPaths::reconcile("", "").is_none());
    }

    #[test]
    fn test_tls_both_set_unchanged() {
        let tls = TlsPaths::reconcile("key.pem", "cert.pem").unwrap();
        assert_eq!(tls.key_path, PathBuf::from("key.pem"));
        assert_eq!(tls.cert_path, PathBuf::from("cert.pem"));
    }

    #[test]
    fn test_https_enabled_requires_addr_and_tls() {
        let mut raw = raw("https://lfs.example.com");
        assert!(!ServerConfig::validate(&raw).unwrap().https_enabled());

        raw.tls_cert = "combined.pem".to_string();
        assert!(ServerConfig::validate(&raw).unwrap().https_enabled());

        raw.https_addr = String::new();
        assert!(!ServerConfig::validate(&raw).unwrap().https_enabled());
    }

    #[test]
    fn test_empty_addresses_disable_listeners() {
        let mut raw = raw("http://lfs.example.com");
        raw.http_addr = String::new();
        raw.https_addr = String::new();
        let config = ServerConfig::validate(&raw).unwrap();
        assert!(config.http_addr.is_none());
        assert!(config.https_addr.is_none());
    }

    #[test]
    fn test_listen_addr_parsing() {
        assert_eq!(
            ListenAddr::parse(":8080").unwrap(),
            ListenAddr { host: String::new(), port: 8080 }
        );
        assert_eq!(
            ListenAddr::parse("localhost:80").unwrap(),
            ListenAddr { host: "localhost".to_string(), port: 80 }
        );
        assert_eq!(
            ListenAddr::parse("[::1]:8443").unwrap(),
            ListenAddr { host: "[::1]".to_string(), port: 8443 }
        );
    }

    #[test]
    fn test_listen_addr_rejects_malformed() {
        for addr in ["8080", "host:", "host:notaport", "::1:80", "[::1]", "host:70000"] {
            assert!(
                matches!(ListenAddr::parse(addr), Err(ConfigError::InvalidListenAddr { .. })),
                "{} should be rejected",
                addr
            );
        }
    }

    #[test]
    fn test_bind_targets_fill_in_wildcard_host() {
        assert_eq!(
            ListenAddr::parse(":8080").unwrap().bind_targets(),
            vec!["[::]:8080", "0.0.0.0:8080"]
        );
        assert_eq!(ListenAddr::parse("[::1]:1").unwrap().bind_targets(), vec!["[::1]:1"]);
        assert_eq!(
            ListenAddr::parse("localhost:80").unwrap().bind_targets(),
            vec!["localhost:80"]
        );
    }

    #[test]
    fn test_version_string_format() {
        assert!(VERSION_STRING.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(VERSION_STRING.contains(", commit "));
        assert!(VERSION_STRING.contains(", built at "));
    }
}
