//! SSL engine factory - rustls configs for both sides of a MITM connection
//!
//! - Client-facing engines are TLS servers presenting a leaf certificate for
//!   the intercepted host, minted by the `CertificateAuthority` unless a
//!   `KeyManagerProvider` supplies key material.
//! - Server-facing engines are TLS clients verifying the real peer against the
//!   Mozilla roots unless a `TrustManagerProvider` supplies a verifier.
//!
//! Configs are cached per (host, ALPN) and per host, with a TTL.

use super::certificate_authority::CertificateAuthority;
use super::codec::SslCodec;
use crate::error::Result;
use lru::LruCache;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use webpki_roots::TLS_SERVER_ROOTS;

/// Default lifetime of cached configs
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// TLS version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

static TLS12_AND_13: [&SupportedProtocolVersion; 2] = [&TLS12, &TLS13];
static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&TLS13];

impl TlsVersion {
    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12And13 => &TLS12_AND_13,
            TlsVersion::Tls13Only => &TLS13_ONLY,
        }
    }
}

/// Key material for one side of a connection.
///
/// `client` is true when the engine acts as a TLS client (client certificate
/// for the real server), false for the certificate shown to the intercepted
/// client. Returning `None` falls back to the built-in behaviour.
pub trait KeyManagerProvider: Send + Sync {
    fn provide(
        &self,
        host: &str,
        client: bool,
    ) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>;
}

/// Verifier for the real server's certificate, `None` for the default roots
pub trait TrustManagerProvider: Send + Sync {
    fn provide(&self, host: &str) -> Option<Arc<dyn ServerCertVerifier>>;
}

struct Cached<T> {
    value: T,
    created_at: Instant,
}

struct ConfigCache<K: Hash + Eq, T: Clone> {
    entries: Mutex<LruCache<K, Cached<T>>>,
    ttl: Duration,
}

impl<K: Hash + Eq, T: Clone> ConfigCache<K, T> {
    fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn get_or_try_insert(&self, key: K, create: impl FnOnce() -> Result<T>) -> Result<T> {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(&key) {
                Some(cached) if cached.created_at.elapsed() <= self.ttl => {
                    return Ok(cached.value.clone())
                }
                Some(_) => {
                    entries.pop(&key);
                }
                None => {}
            }
        }
        let value = create()?;
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).put(
            key,
            Cached {
                value: value.clone(),
                created_at: Instant::now(),
            },
        );
        Ok(value)
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Creates the codecs for intercepted connections
pub struct SslEngineFactory {
    authority: Arc<CertificateAuthority>,
    key_manager: Option<Arc<dyn KeyManagerProvider>>,
    trust_manager: Option<Arc<dyn TrustManagerProvider>>,
    tls_version: TlsVersion,
    provider: Arc<CryptoProvider>,
    server_configs: ConfigCache<(String, Vec<Vec<u8>>), Arc<ServerConfig>>,
    client_configs: ConfigCache<String, Arc<ClientConfig>>,
}

impl SslEngineFactory {
    pub fn new(authority: Arc<CertificateAuthority>, cache_size: usize, ttl: Duration) -> Self {
        Self {
            authority,
            key_manager: None,
            trust_manager: None,
            tls_version: TlsVersion::default(),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            server_configs: ConfigCache::new(cache_size, ttl),
            client_configs: ConfigCache::new(cache_size, ttl),
        }
    }

    pub fn with_key_manager(mut self, provider: Arc<dyn KeyManagerProvider>) -> Self {
        self.key_manager = Some(provider);
        self
    }

    pub fn with_trust_manager(mut self, provider: Arc<dyn TrustManagerProvider>) -> Self {
        self.trust_manager = Some(provider);
        self
    }

    pub fn with_tls_version(mut self, version: TlsVersion) -> Self {
        self.tls_version = version;
        self
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    /// Codec facing the intercepted client, offering exactly `alpn`
    pub fn create_server_engine(&self, host: &str, alpn: &[Vec<u8>]) -> Result<SslCodec> {
        let config = self
            .server_configs
            .get_or_try_insert((host.to_string(), alpn.to_vec()), || {
                self.build_server_config(host, alpn)
            })?;
        SslCodec::server(host, config)
    }

    /// Codec facing the real server, advertising `alpn`
    pub fn create_client_engine(&self, host: &str, alpn: &[Vec<u8>]) -> Result<SslCodec> {
        let base = self
            .client_configs
            .get_or_try_insert(host.to_string(), || self.build_client_config(host))?;
        let mut config = (*base).clone();
        config.alpn_protocols = alpn.to_vec();
        SslCodec::client(host, Arc::new(config))
    }

    /// (server configs, client configs) currently cached
    pub fn cache_stats(&self) -> (usize, usize) {
        (self.server_configs.len(), self.client_configs.len())
    }

    pub fn clear_cache(&self) {
        self.server_configs.clear();
        self.client_configs.clear();
    }

    fn build_server_config(&self, host: &str, alpn: &[Vec<u8>]) -> Result<Arc<ServerConfig>> {
        let (chain, key) = match self
            .key_manager
            .as_ref()
            .and_then(|provider| provider.provide(host, false))
        {
            Some(material) => material,
            None => {
                let issued = self.authority.get_or_generate(host)?;
                (issued.chain.clone(), issued.private_key())
            }
        };

        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(self.tls_version.versions())?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = alpn.to_vec();

        debug!(host, alpn = ?config.alpn_protocols, "Created client-facing TLS config");
        Ok(Arc::new(config))
    }

    fn build_client_config(&self, host: &str) -> Result<Arc<ClientConfig>> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(self.tls_version.versions())?;
        let builder = match self
            .trust_manager
            .as_ref()
            .and_then(|provider| provider.provide(host))
        {
            Some(verifier) => builder
                .dangerous()
                .with_custom_certificate_verifier(verifier),
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(TLS_SERVER_ROOTS.iter().cloned());
                builder.with_root_certificates(roots)
            }
        };
        let config = match self
            .key_manager
            .as_ref()
            .and_then(|provider| provider.provide(host, true))
        {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
            None => builder.with_no_client_auth(),
        };

        info!(host, tls_version = ?self.tls_version, "Created upstream TLS config");
        Ok(Arc::new(config))
    }
}

/// Verifier trusting a fixed set of roots, for `TrustManagerProvider` impls
pub fn roots_verifier(roots: RootCertStore) -> Result<Arc<dyn ServerCertVerifier>> {
    let verifier = rustls::client::WebPkiServerVerifier::builder_with_provider(
        Arc::new(roots),
        Arc::new(rustls::crypto::ring::default_provider()),
    )
    .build()
    .map_err(|e| crate::error::NetBareError::config(format!("Invalid trust roots: {}", e)))?;
    Ok(verifier)
}
