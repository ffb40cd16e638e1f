//! Certificate Authority - per-host leaf certificates for MITM
//!
//! The root CA is supplied as PEM (certificate plus private key) or generated
//! in-process. Leaf certificates carry DNS or IP SANs and are cached per host
//! with a TTL.

use crate::error::{NetBareError, Result};
use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use secrecy::{ExposeSecret, SecretString};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Host identifier for certificate generation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// Wildcard domain (e.g., *.example.com)
    Wildcard(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from hostname string
    pub fn from_hostname(hostname: &str) -> Self {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Self::IpAddress(ip);
        }
        if hostname.starts_with("*.") {
            return Self::Wildcard(hostname.to_string());
        }
        Self::Domain(hostname.to_string())
    }

    fn common_name(&self) -> String {
        match self {
            Self::Domain(name) | Self::Wildcard(name) => name.clone(),
            Self::IpAddress(ip) => ip.to_string(),
        }
    }
}

/// Leaf certificate chain and its private key
#[derive(Debug)]
pub struct IssuedCertificate {
    /// Leaf first, then the root
    pub chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

impl IssuedCertificate {
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// Cached certificate with TTL
struct CachedCertificate {
    cert: Arc<IssuedCertificate>,
    created_at: Instant,
}

impl CachedCertificate {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Root signing material
struct RootCa {
    /// Issuer view used for signing; subject and key match the root
    issuer: Certificate,
    key: KeyPair,
    der: CertificateDer<'static>,
    pem: String,
}

/// Certificate Authority - generates and caches leaf certificates
pub struct CertificateAuthority {
    root: RootCa,
    cache: Mutex<LruCache<HostIdentifier, CachedCertificate>>,
    max_cache_size: usize,
    cert_ttl: Duration,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("max_cache_size", &self.max_cache_size)
            .field("cert_ttl", &self.cert_ttl)
            .finish()
    }
}

impl CertificateAuthority {
    /// Load the root from PEM certificate and PEM private key
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &SecretString,
        max_cache_size: usize,
        cert_ttl: Duration,
    ) -> Result<Self> {
        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| NetBareError::config("No certificate in CA PEM"))?
            .map_err(|e| NetBareError::config(format!("Invalid CA certificate: {}", e)))?;
        let key = KeyPair::from_pem(key_pem.expose_secret())
            .map_err(|e| NetBareError::config(format!("Invalid CA private key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| NetBareError::config(format!("Invalid CA certificate: {}", e)))?;
        let issuer = params
            .self_signed(&key)
            .map_err(|e| NetBareError::config(format!("CA key does not sign: {}", e)))?;

        info!("Loaded root CA");
        Ok(Self::with_root(
            RootCa {
                issuer,
                key,
                der,
                pem: cert_pem.to_string(),
            },
            max_cache_size,
            cert_ttl,
        ))
    }

    /// Generate a fresh self-signed root
    pub fn generate(common_name: &str, max_cache_size: usize, cert_ttl: Duration) -> Result<Self> {
        let fail = |e: rcgen::Error| NetBareError::cert_generation(common_name, e.to_string());

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(fail)?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, common_name);
        name.push(DnType::OrganizationName, common_name);
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);
        params.serial_number = Some(generate_serial_number().into());

        let key = KeyPair::generate().map_err(fail)?;
        let issuer = params.self_signed(&key).map_err(fail)?;
        let der = issuer.der().clone();
        let pem = issuer.pem();

        info!(common_name, "Generated root CA");
        Ok(Self::with_root(
            RootCa {
                issuer,
                key,
                der,
                pem,
            },
            max_cache_size,
            cert_ttl,
        ))
    }

    fn with_root(root: RootCa, max_cache_size: usize, cert_ttl: Duration) -> Self {
        let cache_size = NonZeroUsize::new(max_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            root,
            cache: Mutex::new(LruCache::new(cache_size)),
            max_cache_size,
            cert_ttl,
        }
    }

    /// DER of the root certificate, for trust stores
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.root.der
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.root.pem
    }

    /// Get or generate the leaf for `host`
    pub fn get_or_generate(&self, host: &str) -> Result<Arc<IssuedCertificate>> {
        let id = HostIdentifier::from_hostname(host);
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(&id) {
                if cached.is_expired(self.cert_ttl) {
                    debug!(host = ?id, "Certificate cache hit but expired, regenerating");
                    cache.pop(&id);
                } else {
                    return Ok(Arc::clone(&cached.cert));
                }
            }
        }

        debug!(host = ?id, "Generating new certificate");
        let cert = Arc::new(self.generate_certificate(&id)?);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(
                id,
                CachedCertificate {
                    cert: Arc::clone(&cert),
                    created_at: Instant::now(),
                },
            );
        Ok(cert)
    }

    fn generate_certificate(&self, host: &HostIdentifier) -> Result<IssuedCertificate> {
        let common_name = host.common_name();
        let fail = |e: rcgen::Error| NetBareError::cert_generation(&common_name, e.to_string());

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(fail)?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name.clone());
        params.subject_alt_names = match host {
            HostIdentifier::Domain(name) | HostIdentifier::Wildcard(name) => {
                vec![SanType::DnsName(name.clone().try_into().map_err(fail)?)]
            }
            HostIdentifier::IpAddress(ip) => vec![SanType::IpAddress(*ip)],
        };
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);
        params.serial_number = Some(generate_serial_number().into());

        let key = KeyPair::generate().map_err(fail)?;
        let leaf = params
            .signed_by(&key, &self.root.issuer, &self.root.key)
            .map_err(fail)?;

        Ok(IssuedCertificate {
            chain: vec![leaf.der().clone(), self.root.der.clone()],
            key_der: key.serialize_der(),
        })
    }

    /// (cached entries, capacity)
    pub fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        (cache.len(), self.max_cache_size)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Unique serial number: timestamp high bits, crypto RNG low bits
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;
    ((timestamp_part as u64) << 32) | (random_part as u64)
}
