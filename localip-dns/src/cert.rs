//! Keeps a wildcard certificate fresh: load it from the cache on
//! startup, refresh it through ACME when it is missing or close to
//! expiry, and serve it to TLS clients over SNI-independent
//! resolution (every client hello gets the same certificate, since
//! this server only ever has one).

use std::error;
use std::fmt;
use std::sync::Arc;

use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::acme::{AcmeClient, Error as AcmeError};
use crate::cache::{Cache, Error as CacheError};
use crate::challenge::ChallengeStore;
use crate::metrics::{CERT_EXPIRY_SECONDS, CERT_REFRESH_TOTAL};

/// Certificates are refreshed once fewer than this many days remain
/// before expiry.
const REFRESH_WINDOW_DAYS: i64 = 15;
const CERT_KEY: &str = "cert.pem";
const KEY_KEY: &str = "key.pem";

#[derive(Debug)]
pub enum Error {
    Cache(CacheError),
    Acme(AcmeError),
    InvalidPem(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Cache(err) => write!(f, "{err}"),
            Error::Acme(err) => write!(f, "{err}"),
            Error::InvalidPem(msg) => write!(f, "invalid certificate PEM: {msg}"),
        }
    }
}

impl error::Error for Error {}

struct Loaded {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    certified_key: Option<Arc<CertifiedKey>>,
}

pub struct CertificateManager {
    base_domain: String,
    cache: Box<dyn Cache>,
    acme: AcmeClient,
    challenges: Arc<ChallengeStore>,
    state: RwLock<Loaded>,
}

impl CertificateManager {
    pub async fn init(
        base_domain: String,
        cache: Box<dyn Cache>,
        directory_url: &str,
        email: &str,
        account_key_pem: &[u8],
        reg: Option<&str>,
        challenges: Arc<ChallengeStore>,
    ) -> Result<Self, Error> {
        let acme = AcmeClient::init(cache.as_ref(), directory_url, email, account_key_pem, reg)
            .await
            .map_err(Error::Acme)?;

        Ok(Self {
            base_domain,
            cache,
            acme,
            challenges,
            state: RwLock::new(Loaded {
                cert_pem: Vec::new(),
                key_pem: Vec::new(),
                certified_key: None,
            }),
        })
    }

    /// Loads whatever is cached, and obtains a fresh certificate if
    /// what's cached is missing or expiring soon. Errors obtaining a
    /// fresh certificate are logged, not propagated: an expiring
    /// certificate is still better than no server at all, and the
    /// next scheduled refresh will try again.
    pub async fn load_or_refresh(&self) {
        if let Err(err) = self.read_cache().await {
            info!(error = %err, "no usable cached certificate");
        }

        if self.needs_refresh().await {
            match self.obtain().await {
                Ok(()) => {
                    CERT_REFRESH_TOTAL.with_label_values(&["success"]).inc();
                    if let Err(err) = self.save_cache().await {
                        error!(error = %err, "could not save certificate to cache");
                    }
                }
                Err(err) => {
                    CERT_REFRESH_TOTAL.with_label_values(&["failure"]).inc();
                    error!(error = %err, "could not obtain certificate");
                    return;
                }
            }
        }

        if let Err(err) = self.rebuild_certified_key().await {
            error!(error = %err, "loaded certificate is not usable");
        }

        let state = self.state.read().await;
        if let Some(not_after) = parsed_expiry(&state.cert_pem) {
            CERT_EXPIRY_SECONDS.set(not_after.unix_timestamp());
        }
    }

    async fn read_cache(&self) -> Result<(), Error> {
        let cert_pem = self
            .cache
            .get(CERT_KEY)
            .await
            .map_err(Error::Cache)?;
        let key_pem = self.cache.get(KEY_KEY).await.unwrap_or_default();

        let mut state = self.state.write().await;
        state.cert_pem = cert_pem;
        state.key_pem = key_pem;
        Ok(())
    }

    async fn save_cache(&self) -> Result<(), Error> {
        let state = self.state.read().await;
        self.cache
            .put(CERT_KEY, &state.cert_pem)
            .await
            .map_err(Error::Cache)?;
        self.cache
            .put(KEY_KEY, &state.key_pem)
            .await
            .map_err(Error::Cache)
    }

    async fn needs_refresh(&self) -> bool {
        let state = self.state.read().await;
        if state.cert_pem.is_empty() || state.key_pem.is_empty() {
            return true;
        }
        match parsed_expiry(&state.cert_pem) {
            Some(not_after) => {
                let threshold = not_after - time::Duration::days(REFRESH_WINDOW_DAYS);
                time::OffsetDateTime::now_utc() > threshold
            }
            None => true,
        }
    }

    async fn obtain(&self) -> Result<(), Error> {
        let obtained = self
            .acme
            .obtain_wildcard_certificate(&self.base_domain, &self.challenges)
            .await
            .map_err(Error::Acme)?;

        let mut state = self.state.write().await;
        state.cert_pem = obtained.cert_pem;
        state.key_pem = obtained.key_pem;
        Ok(())
    }

    async fn rebuild_certified_key(&self) -> Result<(), Error> {
        let mut state = self.state.write().await;
        let certs = rustls_pemfile::certs(&mut state.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidPem(e.to_string()))?;
        let key = rustls_pemfile::private_key(&mut state.key_pem.as_slice())
            .map_err(|e| Error::InvalidPem(e.to_string()))?
            .ok_or_else(|| Error::InvalidPem("no private key found".to_string()))?;

        let signing_key =
            any_supported_type(&key).map_err(|e| Error::InvalidPem(e.to_string()))?;
        state.certified_key = Some(Arc::new(CertifiedKey::new(certs, signing_key)));
        Ok(())
    }

    /// Returns the PEM-encoded certificate chain, for the `/cert.pem`
    /// endpoint.
    pub async fn cert_pem(&self) -> Vec<u8> {
        self.state.read().await.cert_pem.clone()
    }

    /// Returns the PEM-encoded private key, for the `/key.pem`
    /// endpoint.
    pub async fn key_pem(&self) -> Vec<u8> {
        self.state.read().await.key_pem.clone()
    }
}

fn parsed_expiry(cert_pem: &[u8]) -> Option<time::OffsetDateTime> {
    let mut reader = cert_pem;
    let der = rustls_pemfile::certs(&mut reader).next()?.ok()?;
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
    Some(cert.validity().not_after.to_datetime())
}

/// Bridges the async, lock-guarded [`CertificateManager`] to rustls's
/// synchronous certificate resolution interface by keeping a
/// snapshot `Arc` that is swapped in on every refresh. A plain
/// `std::sync::RwLock` is used here rather than tokio's: `resolve` is
/// called synchronously from inside the TLS handshake and must never
/// await.
pub struct ServerCertResolver {
    current: std::sync::RwLock<Option<Arc<CertifiedKey>>>,
}

impl ServerCertResolver {
    pub fn new() -> Self {
        Self {
            current: std::sync::RwLock::new(None),
        }
    }

    pub async fn update(&self, manager: &CertificateManager) {
        let state = manager.state.read().await;
        let certified_key = state.certified_key.clone();
        *self.current.write().expect("cert resolver lock poisoned") = certified_key;
    }
}

impl fmt::Debug for ServerCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for ServerCertResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        self.current
            .read()
            .expect("cert resolver lock poisoned")
            .clone()
    }
}
