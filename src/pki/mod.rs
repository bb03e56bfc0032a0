//! Identity and credential generation for control-plane instances
//!
//! The orchestrator holds both ends of every connection it secures, so
//! certificates are issued directly against the CA issuer - there is no CSR
//! exchange. Everything generated here has a deletion path: certificates and
//! keys live only in the registry record and in Kubernetes secrets, both of
//! which are removed by the compensator.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};

use crate::{Error, Result};

/// Byte length of the symmetric encryption key (AES-256)
const ENCRYPTION_KEY_BYTES: usize = 32;

/// Generated database password length
const DB_PASSWORD_LEN: usize = 24;

/// Generate the symmetric key used to protect credentials persisted
/// server-side. Returned base64-encoded, ready for a Kubernetes secret.
pub fn generate_encryption_key() -> String {
    let mut bytes = [0u8; ENCRYPTION_KEY_BYTES];
    rand::thread_rng().fill(&mut bytes);
    BASE64.encode(bytes)
}

/// Credentials for the control plane's backing database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    /// Database name
    pub name: String,
    /// Database user
    pub user: String,
    /// Generated password
    pub password: String,
}

/// Generate credentials for the control plane's backing database
pub fn generate_database_credentials() -> DatabaseCredentials {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DB_PASSWORD_LEN)
        .map(char::from)
        .collect();
    DatabaseCredentials {
        name: "stratus_api".to_string(),
        user: "stratus".to_string(),
        password,
    }
}

/// A client certificate/key pair issued by the instance CA
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

/// Certificate authority for one control-plane instance
pub struct CertificateAuthority {
    /// CA key serialized as PEM (KeyPair isn't Clone, so we re-parse on use)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA for an instance
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Stratus".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // 10 year validity
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(2035, 1, 1);

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate CA key: {}", e)))?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::pki(format!("failed to create CA cert: {}", e)))?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from PEM material persisted in the registry
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::pki(format!("failed to parse CA key: {}", e)))?;
        if !cert_pem.contains("BEGIN CERTIFICATE") {
            return Err(Error::pki("CA cert PEM is not a certificate"));
        }
        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// The CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The CA private key in PEM format (persisted in the registry record)
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Issue a client certificate/key pair signed by this CA.
    ///
    /// `alt_names` become DNS SANs; the control-plane root domain and the
    /// in-cluster service names are passed here so one certificate covers
    /// both access paths.
    pub fn issue_client_certificate(
        &self,
        common_name: &str,
        alt_names: &[String],
    ) -> Result<ClientCertificate> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate client key: {}", e)))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Stratus".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        // 5 year validity
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(2030, 1, 1);

        let mut sans = Vec::with_capacity(alt_names.len());
        for name in alt_names {
            let ia5 = Ia5String::try_from(name.clone())
                .map_err(|e| Error::pki(format!("invalid SAN '{}': {}", name, e)))?;
            sans.push(SanType::DnsName(ia5));
        }
        params.subject_alt_names = sans;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| Error::pki(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| Error::pki(format!("failed to create issuer: {}", e)))?;

        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| Error::pki(format!("failed to sign certificate: {}", e)))?;

        Ok(ClientCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_can_be_created() {
        let ca = CertificateAuthority::new("stratus-dev").unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_key_pem().contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn ca_roundtrips_through_pem() {
        let ca = CertificateAuthority::new("stratus-dev").unwrap();
        let restored =
            CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem()).unwrap();

        // The restored CA can still issue certificates
        let cert = restored
            .issue_client_certificate("stratus-api", &["api.example.com".to_string()])
            .unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn from_pem_rejects_garbage() {
        assert!(CertificateAuthority::from_pem("nope", "nope").is_err());
    }

    #[test]
    fn client_cert_issued_with_alt_names() {
        let ca = CertificateAuthority::new("stratus-dev").unwrap();
        let cert = ca
            .issue_client_certificate(
                "stratus-api",
                &[
                    "stratus-api.stratus-system.svc".to_string(),
                    "api.dev.example.com".to_string(),
                ],
            )
            .unwrap();

        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn invalid_alt_name_is_rejected() {
        let ca = CertificateAuthority::new("stratus-dev").unwrap();
        let result = ca.issue_client_certificate("stratus-api", &["bad\u{fe}name".to_string()]);
        assert!(matches!(result, Err(Error::Pki(_))));
    }

    #[test]
    fn encryption_keys_are_random_and_sized() {
        let a = generate_encryption_key();
        let b = generate_encryption_key();
        assert_ne!(a, b);

        let decoded = BASE64.decode(&a).unwrap();
        assert_eq!(decoded.len(), ENCRYPTION_KEY_BYTES);
    }

    #[test]
    fn database_credentials_have_generated_password() {
        let a = generate_database_credentials();
        let b = generate_database_credentials();
        assert_eq!(a.user, "stratus");
        assert_eq!(a.password.len(), DB_PASSWORD_LEN);
        assert_ne!(a.password, b.password);
    }
}
