use crate::error::Error;
use moka::sync::Cache;
use rand::{thread_rng, Rng};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use std::sync::Arc;
use time::{ext::NumericalDuration, OffsetDateTime};

pub const DEFAULT_CACHE_CAPACITY: u64 = 1024;
const CERT_TTL_DAYS: i64 = 365;

/// Issues leaf certificates for intercepted hosts, signed by one CA.
///
/// Signed certificates are cached per hostname (port stripped) in a bounded
/// cache shared by every session; eviction discards the least recently used
/// entries. Clients must trust the CA certificate.
#[derive(Clone)]
pub struct CaSigner {
    private_key: rustls::PrivateKey,
    ca_cert: rustls::Certificate,
    ca_cert_pem: String,
    cache: Cache<String, Arc<CertifiedKey>>,
}

impl CaSigner {
    /// Creates a signer from a DER key/certificate pair.
    ///
    /// Fails if the key or certificate is invalid or they do not match.
    pub fn from_der(
        private_key: rustls::PrivateKey,
        ca_cert: rustls::Certificate,
        ca_cert_pem: String,
        capacity: u64,
    ) -> Result<CaSigner, Error> {
        let signer = CaSigner {
            private_key,
            ca_cert,
            ca_cert_pem,
            cache: Cache::builder().max_capacity(capacity).build(),
        };
        signer.validate()?;
        Ok(signer)
    }

    /// Creates a signer from a PEM-encoded CA certificate and private key.
    pub fn from_pem(ca_cert: &[u8], ca_key: &[u8], capacity: u64) -> Result<CaSigner, Error> {
        let cert_der = rustls_pemfile::certs(&mut &*ca_cert)?
            .into_iter()
            .next()
            .ok_or(Error::InvalidCa)?;
        let key_der = read_private_key(ca_key)?;
        CaSigner::from_der(
            rustls::PrivateKey(key_der),
            rustls::Certificate(cert_der),
            String::from_utf8_lossy(ca_cert).into_owned(),
            capacity,
        )
    }

    /// Generates a fresh ephemeral CA.
    ///
    /// Used when the embedder supplies no CA of its own; clients then have
    /// to be pointed at [`CaSigner::ca_cert_pem`] to trust interception.
    pub fn generate(capacity: u64) -> Result<CaSigner, Error> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "http-intercept");
        dn.push(DnType::OrganizationName, "http-intercept");
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = Certificate::from_params(params)?;

        CaSigner::from_der(
            rustls::PrivateKey(ca.serialize_private_key_der()),
            rustls::Certificate(ca.serialize_der()?),
            ca.serialize_pem()?,
            capacity,
        )
    }

    /// The CA certificate clients need to trust, DER encoded.
    pub fn ca_certificate(&self) -> &rustls::Certificate {
        &self.ca_cert
    }

    /// The CA certificate clients need to trust, PEM encoded.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Returns a certificate valid for `host`, signing one if needed.
    ///
    /// Any port suffix on `host` is ignored. Concurrent misses for the same
    /// host may each sign; the extra work is wasted CPU, nothing more.
    pub fn sign_host(&self, host: &str) -> Result<Arc<CertifiedKey>, Error> {
        let host = strip_port(host);
        if let Some(key) = self.cache.get(host) {
            return Ok(key);
        }
        let certified = self.mint(host)?;
        self.cache.insert(host.to_string(), certified.clone());
        Ok(certified)
    }

    /// TLS server configuration presenting the leaf for `host`, pinned to
    /// HTTP/1.1 via ALPN so intercepted clients never negotiate h2.
    pub(crate) fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, Error> {
        let key = self.sign_host(host)?;
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCert(key)));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    fn mint(&self, host: &str) -> Result<Arc<CertifiedKey>, Error> {
        let mut params = CertificateParams::default();
        params.serial_number = Some(thread_rng().gen::<u64>());
        params.not_before = OffsetDateTime::now_utc().saturating_sub(1.hours());
        params.not_after = OffsetDateTime::now_utc().saturating_add(CERT_TTL_DAYS.days());
        params
            .subject_alt_names
            .push(SanType::DnsName(host.to_string()));
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf = Certificate::from_params(params)?;

        let ca_key = KeyPair::from_der(&self.private_key.0)?;
        let ca_params = CertificateParams::from_ca_cert_der(&self.ca_cert.0, ca_key)?;
        let ca = Certificate::from_params(ca_params)?;

        let leaf_der = leaf.serialize_der_with_signer(&ca)?;
        let leaf_key = rustls::PrivateKey(leaf.serialize_private_key_der());
        let signing_key =
            rustls::sign::any_supported_type(&leaf_key).map_err(|_| Error::InvalidCa)?;

        Ok(Arc::new(CertifiedKey::new(
            vec![rustls::Certificate(leaf_der)],
            signing_key,
        )))
    }

    fn validate(&self) -> Result<(), Error> {
        let key_pair = KeyPair::from_der(&self.private_key.0)?;
        CertificateParams::from_ca_cert_der(&self.ca_cert.0, key_pair)?;
        Ok(())
    }
}

struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn strip_port(host: &str) -> &str {
    match host.split_once(':') {
        Some((name, _)) => name,
        None => host,
    }
}

fn read_private_key(pem: &[u8]) -> Result<Vec<u8>, Error> {
    let mut reader = &*pem;
    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::ECKey(der) => return Ok(der),
            _ => continue,
        }
    }
    Err(Error::InvalidCa)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_host_caches_per_host() {
        let signer = CaSigner::generate(DEFAULT_CACHE_CAPACITY).unwrap();
        let first = signer.sign_host("example.com").unwrap();
        let second = signer.sign_host("example.com:443").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = signer.sign_host("other.test").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn cache_respects_capacity() {
        let signer = CaSigner::generate(2).unwrap();
        for host in ["a.test", "b.test", "c.test", "d.test"] {
            signer.sign_host(host).unwrap();
        }
        signer.cache.run_pending_tasks();
        assert!(signer.cache.entry_count() <= 2);
    }

    #[test]
    fn round_trips_through_pem() {
        let signer = CaSigner::generate(16).unwrap();
        let pem = signer.ca_cert_pem().to_string();
        // Certificate alone is not enough, the key must come with it.
        assert!(CaSigner::from_pem(pem.as_bytes(), b"", 16).is_err());
    }

    #[test]
    fn server_config_pins_http1() {
        let signer = CaSigner::generate(16).unwrap();
        let config = signer.server_config("example.com:443").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
    }
}
