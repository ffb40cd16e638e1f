use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use secrecy::SecretString;
use serde::Deserialize;
use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::mitm::{CertificateAuthority, KeyManagerProvider, TrustManagerProvider, DEFAULT_CACHE_TTL};
use crate::net::packet::MIN_IP_HEADER_LENGTH;
use crate::net::UidProvider;
use crate::tunnel::SocketProtector;

pub const DEFAULT_MTU: usize = 4096;
pub const DEFAULT_SESSION_NAME: &str = "NetBare";
pub const DEFAULT_ADDRESS: &str = "10.1.10.1/32";
pub const DEFAULT_ROUTE: &str = "0.0.0.0/0";

#[derive(Clone)]
pub struct Config {
    pub session_name: String,
    pub mtu: usize,

    // Virtual interface
    pub address: IpNetwork,
    pub routes: Vec<IpNetwork>,
    pub dns_servers: Vec<IpAddr>,

    // Applications are matched by package or process name. Only one list
    // may be set.
    pub allowed_applications: Vec<String>,
    pub disallowed_applications: Vec<String>,

    // Literal host or IP matches, no wildcards
    pub allowed_hosts: Vec<String>,
    pub disallowed_hosts: Vec<String>,
    /// Hosts and IPs never intercepted
    pub ssl_whitelist: Vec<String>,

    pub dump_uid: bool,
    pub exclude_self: bool,

    /// Cap on queued writes per tunnel side, unbounded when `None`
    pub max_pending_writes: Option<usize>,
    pub session_idle_timeout: Duration,
    pub connect_timeout: Duration,

    // Root CA and leaf certificate cache
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
    pub cert_cache_size: usize,
    pub cert_cache_ttl: Duration,

    pub key_manager: Option<Arc<dyn KeyManagerProvider>>,
    pub trust_manager: Option<Arc<dyn TrustManagerProvider>>,
    pub uid_provider: Option<Arc<dyn UidProvider>>,
    pub socket_protector: Option<Arc<dyn SocketProtector>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("session_name", &self.session_name)
            .field("mtu", &self.mtu)
            .field("address", &self.address)
            .field("routes", &self.routes)
            .field("dns_servers", &self.dns_servers)
            .field("allowed_applications", &self.allowed_applications)
            .field("disallowed_applications", &self.disallowed_applications)
            .field("allowed_hosts", &self.allowed_hosts)
            .field("disallowed_hosts", &self.disallowed_hosts)
            .field("ssl_whitelist", &self.ssl_whitelist)
            .field("dump_uid", &self.dump_uid)
            .field("exclude_self", &self.exclude_self)
            .field("max_pending_writes", &self.max_pending_writes)
            .field("session_idle_timeout", &self.session_idle_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("ca_key_path", &self.ca_key_path)
            .field("cert_cache_size", &self.cert_cache_size)
            .field("cert_cache_ttl", &self.cert_cache_ttl)
            .field("key_manager", &self.key_manager.is_some())
            .field("trust_manager", &self.trust_manager.is_some())
            .field("uid_provider", &self.uid_provider.is_some())
            .field("socket_protector", &self.socket_protector.is_some())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_name: DEFAULT_SESSION_NAME.to_string(),
            mtu: DEFAULT_MTU,
            address: IpNetwork::V4(DEFAULT_ADDRESS.parse().unwrap_or_else(|_| {
                ipnetwork::Ipv4Network::from(std::net::Ipv4Addr::new(10, 1, 10, 1))
            })),
            routes: vec![IpNetwork::V4(
                DEFAULT_ROUTE.parse().unwrap_or_else(|_| {
                    ipnetwork::Ipv4Network::from(std::net::Ipv4Addr::UNSPECIFIED)
                }),
            )],
            dns_servers: Vec::new(),
            allowed_applications: Vec::new(),
            disallowed_applications: Vec::new(),
            allowed_hosts: Vec::new(),
            disallowed_hosts: Vec::new(),
            ssl_whitelist: Vec::new(),
            dump_uid: false,
            exclude_self: false,
            max_pending_writes: None,
            session_idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            ca_cert_path: None,
            ca_key_path: None,
            cert_cache_size: 1000,
            cert_cache_ttl: DEFAULT_CACHE_TTL,
            key_manager: None,
            trust_manager: None,
            uid_provider: None,
            socket_protector: None,
        }
    }
}

/// YAML layout of a config file. Absent keys keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    session_name: Option<String>,
    mtu: Option<usize>,
    address: Option<String>,
    routes: Option<Vec<String>>,
    dns_servers: Option<Vec<String>>,
    allowed_applications: Option<Vec<String>>,
    disallowed_applications: Option<Vec<String>>,
    allowed_hosts: Option<Vec<String>>,
    disallowed_hosts: Option<Vec<String>>,
    ssl_whitelist: Option<Vec<String>>,
    dump_uid: Option<bool>,
    exclude_self: Option<bool>,
    max_pending_writes: Option<usize>,
    session_idle_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    ca_cert_path: Option<PathBuf>,
    ca_key_path: Option<PathBuf>,
    cert_cache_size: Option<usize>,
    cert_cache_ttl_secs: Option<u64>,
}

fn parse_networks(values: &[String], what: &str) -> Result<Vec<IpNetwork>> {
    values
        .iter()
        .map(|v| {
            v.trim()
                .parse::<IpNetwork>()
                .with_context(|| format!("Invalid {} {}", what, v))
        })
        .collect()
}

fn parse_ips(values: &[String]) -> Result<Vec<IpAddr>> {
    values
        .iter()
        .map(|v| {
            v.trim()
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid DNS server {}", v))
        })
        .collect()
}

/// Comma-separated list, empty entries dropped
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let mut config = Config::default();

        if let Ok(name) = env::var("NETBARE_SESSION_NAME") {
            config.session_name = name;
        }
        config.mtu = env::var("NETBARE_MTU")
            .unwrap_or_else(|_| DEFAULT_MTU.to_string())
            .parse()
            .context("Invalid NETBARE_MTU")?;
        config.address = env::var("NETBARE_ADDRESS")
            .unwrap_or_else(|_| DEFAULT_ADDRESS.to_string())
            .parse()
            .context("Invalid NETBARE_ADDRESS")?;
        if let Ok(routes) = env::var("NETBARE_ROUTES") {
            config.routes = parse_networks(&split_list(&routes), "route")
                .context("Invalid NETBARE_ROUTES")?;
        }
        if let Ok(servers) = env::var("NETBARE_DNS_SERVERS") {
            config.dns_servers =
                parse_ips(&split_list(&servers)).context("Invalid NETBARE_DNS_SERVERS")?;
        }

        let list = |name: &str| env::var(name).map(|v| split_list(&v)).unwrap_or_default();
        config.allowed_applications = list("NETBARE_ALLOWED_APPLICATIONS");
        config.disallowed_applications = list("NETBARE_DISALLOWED_APPLICATIONS");
        config.allowed_hosts = list("NETBARE_ALLOWED_HOSTS");
        config.disallowed_hosts = list("NETBARE_DISALLOWED_HOSTS");
        config.ssl_whitelist = list("NETBARE_SSL_WHITELIST");

        config.dump_uid = env::var("NETBARE_DUMP_UID")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .context("Invalid NETBARE_DUMP_UID")?;
        config.exclude_self = env::var("NETBARE_EXCLUDE_SELF")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .context("Invalid NETBARE_EXCLUDE_SELF")?;
        config.max_pending_writes = match env::var("NETBARE_MAX_PENDING_WRITES") {
            Ok(v) => Some(v.parse().context("Invalid NETBARE_MAX_PENDING_WRITES")?),
            Err(_) => None,
        };
        let idle: u64 = env::var("NETBARE_SESSION_IDLE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("Invalid NETBARE_SESSION_IDLE_TIMEOUT_SECS")?;
        config.session_idle_timeout = Duration::from_secs(idle);
        let connect: u64 = env::var("NETBARE_CONNECT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Invalid NETBARE_CONNECT_TIMEOUT_SECS")?;
        config.connect_timeout = Duration::from_secs(connect);

        config.ca_cert_path = env::var("NETBARE_CA_CERT_PATH").ok().map(PathBuf::from);
        config.ca_key_path = env::var("NETBARE_CA_KEY_PATH").ok().map(PathBuf::from);
        config.cert_cache_size = env::var("NETBARE_CERT_CACHE_SIZE")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .context("Invalid NETBARE_CERT_CACHE_SIZE")?;
        let ttl: u64 = env::var("NETBARE_CERT_CACHE_TTL_SECS")
            .unwrap_or_else(|_| DEFAULT_CACHE_TTL.as_secs().to_string())
            .parse()
            .context("Invalid NETBARE_CERT_CACHE_TTL_SECS")?;
        config.cert_cache_ttl = Duration::from_secs(ttl);

        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let raw: RawConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        let mut config = Config::default();
        if let Some(name) = raw.session_name {
            config.session_name = name;
        }
        if let Some(mtu) = raw.mtu {
            config.mtu = mtu;
        }
        if let Some(address) = raw.address {
            config.address = address.parse().context("Invalid address")?;
        }
        if let Some(routes) = raw.routes {
            config.routes = parse_networks(&routes, "route")?;
        }
        if let Some(servers) = raw.dns_servers {
            config.dns_servers = parse_ips(&servers)?;
        }
        config.allowed_applications = raw.allowed_applications.unwrap_or_default();
        config.disallowed_applications = raw.disallowed_applications.unwrap_or_default();
        config.allowed_hosts = raw.allowed_hosts.unwrap_or_default();
        config.disallowed_hosts = raw.disallowed_hosts.unwrap_or_default();
        config.ssl_whitelist = raw.ssl_whitelist.unwrap_or_default();
        config.dump_uid = raw.dump_uid.unwrap_or(config.dump_uid);
        config.exclude_self = raw.exclude_self.unwrap_or(config.exclude_self);
        config.max_pending_writes = raw.max_pending_writes;
        if let Some(secs) = raw.session_idle_timeout_secs {
            config.session_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        config.ca_cert_path = raw.ca_cert_path;
        config.ca_key_path = raw.ca_key_path;
        if let Some(size) = raw.cert_cache_size {
            config.cert_cache_size = size;
        }
        if let Some(secs) = raw.cert_cache_ttl_secs {
            config.cert_cache_ttl = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Session name cannot be empty"));
        }
        if self.mtu < MIN_IP_HEADER_LENGTH {
            return Err(anyhow::anyhow!(
                "MTU {} is below the minimum IP header size {}",
                self.mtu,
                MIN_IP_HEADER_LENGTH
            ));
        }
        if !self.allowed_applications.is_empty() && !self.disallowed_applications.is_empty() {
            return Err(anyhow::anyhow!(
                "allowed_applications and disallowed_applications cannot both be set"
            ));
        }
        if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
            return Err(anyhow::anyhow!(
                "ca_cert_path and ca_key_path must be set together"
            ));
        }
        if self.cert_cache_size == 0 {
            return Err(anyhow::anyhow!("cert_cache_size must be at least 1"));
        }
        Ok(())
    }

    /// Local address of the virtual interface
    pub fn local_ip(&self) -> IpAddr {
        self.address.ip()
    }

    /// Load the root CA named by `ca_cert_path` / `ca_key_path`, if any
    pub fn load_authority(&self) -> Result<Option<CertificateAuthority>> {
        let (cert_path, key_path) = match (&self.ca_cert_path, &self.ca_key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Ok(None),
        };
        let cert_pem = std::fs::read_to_string(cert_path)
            .with_context(|| format!("Failed to read CA certificate {}", cert_path.display()))?;
        let key_pem = SecretString::new(
            std::fs::read_to_string(key_path)
                .with_context(|| format!("Failed to read CA key {}", key_path.display()))?,
        );
        let authority = CertificateAuthority::from_pem(
            &cert_pem,
            &key_pem,
            self.cert_cache_size,
            self.cert_cache_ttl,
        )
        .context("Invalid root CA")?;
        Ok(Some(authority))
    }
}

/// Fluent construction on top of `Config::default()`
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.config.session_name = name.into();
        self
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn address(mut self, address: IpNetwork) -> Self {
        self.config.address = address;
        self
    }

    pub fn route(mut self, route: IpNetwork) -> Self {
        self.config.routes.push(route);
        self
    }

    pub fn routes(mut self, routes: Vec<IpNetwork>) -> Self {
        self.config.routes = routes;
        self
    }

    pub fn dns_server(mut self, server: IpAddr) -> Self {
        self.config.dns_servers.push(server);
        self
    }

    pub fn allowed_application(mut self, application: impl Into<String>) -> Self {
        self.config.allowed_applications.push(application.into());
        self
    }

    pub fn disallowed_application(mut self, application: impl Into<String>) -> Self {
        self.config.disallowed_applications.push(application.into());
        self
    }

    pub fn allowed_host(mut self, host: impl Into<String>) -> Self {
        self.config.allowed_hosts.push(host.into());
        self
    }

    pub fn disallowed_host(mut self, host: impl Into<String>) -> Self {
        self.config.disallowed_hosts.push(host.into());
        self
    }

    pub fn ssl_whitelist(mut self, address: impl Into<String>) -> Self {
        self.config.ssl_whitelist.push(address.into());
        self
    }

    pub fn dump_uid(mut self, enabled: bool) -> Self {
        self.config.dump_uid = enabled;
        self
    }

    pub fn exclude_self(mut self, enabled: bool) -> Self {
        self.config.exclude_self = enabled;
        self
    }

    pub fn max_pending_writes(mut self, cap: usize) -> Self {
        self.config.max_pending_writes = Some(cap);
        self
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn root_ca(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.config.ca_cert_path = Some(cert_path.into());
        self.config.ca_key_path = Some(key_path.into());
        self
    }

    pub fn cert_cache(mut self, size: usize, ttl: Duration) -> Self {
        self.config.cert_cache_size = size;
        self.config.cert_cache_ttl = ttl;
        self
    }

    pub fn key_manager(mut self, provider: Arc<dyn KeyManagerProvider>) -> Self {
        self.config.key_manager = Some(provider);
        self
    }

    pub fn trust_manager(mut self, provider: Arc<dyn TrustManagerProvider>) -> Self {
        self.config.trust_manager = Some(provider);
        self
    }

    pub fn uid_provider(mut self, provider: Arc<dyn UidProvider>) -> Self {
        self.config.uid_provider = Some(provider);
        self
    }

    pub fn socket_protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.config.socket_protector = Some(protector);
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Global mutex to serialize config tests (env vars are process-global)
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_test_env() {
        for name in [
            "NETBARE_MTU",
            "NETBARE_ADDRESS",
            "NETBARE_ROUTES",
            "NETBARE_ALLOWED_HOSTS",
            "NETBARE_ALLOWED_APPLICATIONS",
            "NETBARE_DISALLOWED_APPLICATIONS",
            "NETBARE_MAX_PENDING_WRITES",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mtu, 4096);
        assert_eq!(config.address.to_string(), "10.1.10.1/32");
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].to_string(), "0.0.0.0/0");
        assert_eq!(config.session_name, "NetBare");
        assert!(config.max_pending_writes.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_both_application_lists() {
        let result = Config::builder()
            .allowed_application("com.example.a")
            .disallowed_application("com.example.b")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_tiny_mtu() {
        let err = Config::builder().mtu(10).build().unwrap_err();
        assert!(err.to_string().contains("MTU"));
    }

    #[test]
    fn test_from_env_parses_lists() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("NETBARE_MTU", "1500");
        env::set_var("NETBARE_ROUTES", "10.0.0.0/8, 192.168.0.0/16");
        env::set_var("NETBARE_ALLOWED_HOSTS", "example.com,,1.2.3.4");
        env::set_var("NETBARE_MAX_PENDING_WRITES", "64");

        let config = Config::from_env().unwrap();
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.allowed_hosts, vec!["example.com", "1.2.3.4"]);
        assert_eq!(config.max_pending_writes, Some(64));

        clear_test_env();
    }

    #[test]
    fn test_from_env_rejects_bad_mtu() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("NETBARE_MTU", "not-a-number");

        let err = Config::from_env().unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid NETBARE_MTU"));

        clear_test_env();
    }
}
