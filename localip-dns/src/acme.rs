//! ACME (RFC 8555) client for obtaining the wildcard certificate,
//! using DNS-01 challenges served out of a [`ChallengeStore`] by this
//! same process.

use std::error;
use std::fmt;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, Authorization, AuthorizationStatus, ChallengeType, Identifier,
    NewAccount, NewOrder, OrderStatus,
};
use tracing::{debug, info, warn};

use crate::cache::{Cache, Error as CacheError};
use crate::challenge::ChallengeStore;
use crate::metrics::{ACME_OBTAIN_DURATION_SECONDS, ACME_OBTAIN_TOTAL};

const ACCOUNT_CACHE_KEY: &str = "account.json";
const POLL_INTERVAL: Duration = Duration::from_secs(3);
const POLL_ATTEMPTS: u32 = 60;

#[derive(Debug)]
pub enum Error {
    Cache(CacheError),
    Json(serde_json::Error),
    Protocol(String),
    ChallengeUnavailable,
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Cache(err) => write!(f, "{err}"),
            Error::Json(err) => write!(f, "{err}"),
            Error::Protocol(msg) => write!(f, "ACME protocol error: {msg}"),
            Error::ChallengeUnavailable => write!(f, "no DNS-01 challenge offered"),
            Error::Timeout => write!(f, "timed out waiting for order to become ready"),
        }
    }
}

impl error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

/// An obtained certificate, in PEM form.
pub struct ObtainedCertificate {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

pub struct AcmeClient {
    account: Account,
}

impl AcmeClient {
    /// Loads a persisted account from the cache, or registers a new
    /// one and persists it, so that re-registering on every restart
    /// isn't necessary.
    ///
    /// `account_key_pem` is the operator-supplied ACME account private
    /// key (the `--key` flag) and `reg` its registration URI (`--reg`),
    /// mirroring the original service's ability to be pointed at an
    /// account it did not itself create. `instant_acme`'s
    /// `AccountCredentials` can only be produced by `Account::create`
    /// or by deserialising a blob this crate previously wrote with
    /// `Account::create`'s own output; there is no public API to
    /// construct one from raw key material and a registration URL, so
    /// an externally-provisioned account cannot be recovered this way.
    /// The key is still read and validated eagerly at startup (see
    /// `main.rs`) so a broken `--key` is caught immediately; here, it
    /// is only used to tell the operator plainly when `--reg` cannot
    /// be honoured.
    pub async fn init(
        cache: &dyn Cache,
        directory_url: &str,
        email: &str,
        account_key_pem: &[u8],
        reg: Option<&str>,
    ) -> Result<Self, Error> {
        match cache.get(ACCOUNT_CACHE_KEY).await {
            Ok(bytes) => {
                let credentials: AccountCredentials = serde_json::from_slice(&bytes)?;
                let account = Account::from_credentials(credentials)
                    .await
                    .map_err(|e| Error::Protocol(format!("loading account: {e}")))?;
                debug!("loaded existing ACME account");
                Ok(Self { account })
            }
            Err(CacheError::NotFound { .. }) => {
                debug!(
                    account_key_bytes = account_key_pem.len(),
                    "no cached ACME account"
                );
                if let Some(reg) = reg {
                    warn!(
                        %reg,
                        "cannot recover an externally-provisioned ACME account from --key/--reg; \
                         instant_acme has no API to import an account key, so a new account will \
                         be registered and cached for subsequent runs instead"
                    );
                }

                let contact = format!("mailto:{email}");
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[&contact],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    None,
                )
                .await
                .map_err(|e| Error::Protocol(format!("creating account: {e}")))?;

                let serialised = serde_json::to_vec(&credentials)?;
                cache
                    .put(ACCOUNT_CACHE_KEY, &serialised)
                    .await
                    .map_err(Error::Cache)?;

                info!(%email, "registered new ACME account");
                Ok(Self { account })
            }
            Err(err) => Err(Error::Cache(err)),
        }
    }

    /// Requests a certificate covering both the domain apex and its
    /// wildcard, resolving each DNS-01 challenge through
    /// `challenges`.
    pub async fn obtain_wildcard_certificate(
        &self,
        base_domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<ObtainedCertificate, Error> {
        let timer = std::time::Instant::now();
        let result = self
            .obtain_wildcard_certificate_inner(base_domain, challenges)
            .await;

        let label = if result.is_ok() { "success" } else { "failure" };
        ACME_OBTAIN_TOTAL.with_label_values(&[label]).inc();
        ACME_OBTAIN_DURATION_SECONDS
            .with_label_values(&[label])
            .observe(timer.elapsed().as_secs_f64());

        result
    }

    async fn obtain_wildcard_certificate_inner(
        &self,
        base_domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<ObtainedCertificate, Error> {
        let identifiers = vec![
            Identifier::Dns(base_domain.to_string()),
            Identifier::Dns(format!("*.{base_domain}")),
        ];

        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| Error::Protocol(format!("creating order: {e}")))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| Error::Protocol(format!("fetching authorizations: {e}")))?;

        let mut presented = Vec::new();
        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let value = self.present_dns01(&mut order, authz, challenges)?;
            presented.push(value);
        }

        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or(Error::ChallengeUnavailable)?;
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| Error::Protocol(format!("setting challenge ready: {e}")))?;
        }

        let result = self.poll_until_ready(&mut order).await;

        for (fqdn, value) in presented {
            challenges.clean_up(&fqdn, &value);
        }
        result?;

        let (cert_params, key_pair) = certificate_params(base_domain)?;
        let csr = cert_params
            .serialize_request(&key_pair)
            .map_err(|e| Error::Protocol(format!("building CSR: {e}")))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| Error::Protocol(format!("finalizing order: {e}")))?;

        let mut attempts = 0;
        let cert_pem = loop {
            match order.certificate().await {
                Ok(Some(chain)) => break chain,
                Ok(None) => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        return Err(Error::Timeout);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(Error::Protocol(format!("fetching certificate: {e}"))),
            }
        };

        Ok(ObtainedCertificate {
            cert_pem: cert_pem.into_bytes(),
            key_pem: key_pair.serialize_pem().into_bytes(),
        })
    }

    fn present_dns01(
        &self,
        order: &mut instant_acme::Order,
        authz: &Authorization,
        challenges: &ChallengeStore,
    ) -> Result<(dns_types::protocol::types::DomainName, String), Error> {
        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Dns01)
            .ok_or(Error::ChallengeUnavailable)?;

        let Identifier::Dns(identifier) = &authz.identifier;
        let base = identifier.trim_start_matches("*.");

        let fqdn = dns_types::protocol::types::DomainName::from_dotted_string(&format!(
            "_acme-challenge.{base}."
        ))
        .ok_or_else(|| Error::Protocol(format!("invalid identifier {identifier}")))?;

        let key_authorization = order.key_authorization(challenge);
        let value = key_authorization.dns_value();

        challenges.present(fqdn.clone(), value.clone());
        Ok((fqdn, value))
    }

    async fn poll_until_ready(&self, order: &mut instant_acme::Order) -> Result<(), Error> {
        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            order
                .refresh()
                .await
                .map_err(|e| Error::Protocol(format!("refreshing order: {e}")))?;

            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(Error::Protocol("order became invalid".to_string()));
                }
                _ => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        return Err(Error::Timeout);
                    }
                    warn!(attempts, "still waiting for order to be ready");
                }
            }
        }
    }
}

const RSA_KEY_BITS: usize = 2048;

fn certificate_params(
    base_domain: &str,
) -> Result<(rcgen::CertificateParams, rcgen::KeyPair), Error> {
    let names = vec![base_domain.to_string(), format!("*.{base_domain}")];
    let params = rcgen::CertificateParams::new(names)
        .map_err(|e| Error::Protocol(format!("building certificate params: {e}")))?;
    let key_pair = generate_rsa_key_pair()?;
    Ok((params, key_pair))
}

/// The original service requests RSA-2048 certificate keys
/// (`certcrypto.RSA2048` passed to `lego`). `rcgen::KeyPair::generate`
/// only produces ECDSA P-256 keys, since `ring` (rcgen's default
/// crypto backend) has no RSA key generation; an RSA-2048 key is
/// generated with the `rsa` crate instead and handed to `rcgen` as a
/// PEM-encoded PKCS#8 key, which `KeyPair::from_pem` accepts for any
/// algorithm it recognises.
fn generate_rsa_key_pair() -> Result<rcgen::KeyPair, Error> {
    let private_key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
        .map_err(|e| Error::Protocol(format!("generating RSA-2048 certificate key: {e}")))?;
    let pem = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(
        &private_key,
        rsa::pkcs8::LineEnding::LF,
    )
    .map_err(|e| Error::Protocol(format!("encoding RSA-2048 certificate key: {e}")))?;
    rcgen::KeyPair::from_pem(pem.as_str())
        .map_err(|e| Error::Protocol(format!("building RSA certificate key pair: {e}")))
}
