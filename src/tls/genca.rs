use super::{Result, PROXY_ORGANIZATION};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, RsaKeySize, PKCS_RSA_SHA256,
};
use std::{io, path::Path};
use time::{Duration, OffsetDateTime};

/// Root CA validity from the moment it is generated.
const ROOT_VALIDITY: Duration = Duration::days(10 * 365);

/// Generate a self-signed root CA, returned as `(certificate, key)` PEM.
pub fn generate_root_ca() -> Result<(String, String)> {
    let now = OffsetDateTime::now_utc();

    let mut params = CertificateParams::default();
    params.not_before = now - Duration::days(1);
    params.not_after = now + ROOT_VALIDITY;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, format!("{PROXY_ORGANIZATION} root CA"));
    distinguished_name.push(DnType::OrganizationName, PROXY_ORGANIZATION);
    params.distinguished_name = distinguished_name;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

    let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)?;
    let cert = params.self_signed(&key_pair)?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Write a fresh root CA to `cert_path` and `key_path`.
///
/// Existing files are left alone unless `force` is set.
pub fn write_root_ca(cert_path: &Path, key_path: &Path, force: bool) -> Result<()> {
    if !force {
        for path in [cert_path, key_path] {
            if path.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists, pass --force to replace it", path.display()),
                )
                .into());
            }
        }
    }

    for path in [cert_path, key_path] {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            if !dir.exists() {
                tracing::info!("Creating CA directory: {}", dir.display());
                std::fs::create_dir_all(dir)?;
            }
        }
    }

    let (cert, key) = generate_root_ca()?;
    std::fs::write(key_path, key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::write(cert_path, &cert)?;

    tracing::info!("Root CA certificate: {}", cert_path.display());
    tracing::info!("Root CA key: {}", key_path.display());
    tracing::info!("Generated root CA:\n{}", cert);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::CertificateAuthority;

    #[test]
    fn test_generated_ca_loads() {
        let (cert, key) = generate_root_ca().unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        CertificateAuthority::from_pem(&cert, &key, None).unwrap();
    }

    #[test]
    fn test_write_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("ca/rootCA.pem");
        let key = dir.path().join("ca/rootCA.key");

        write_root_ca(&cert, &key, false).unwrap();
        let before = std::fs::read_to_string(&cert).unwrap();

        assert!(write_root_ca(&cert, &key, false).is_err());
        assert_eq!(std::fs::read_to_string(&cert).unwrap(), before);

        write_root_ca(&cert, &key, true).unwrap();
        assert_ne!(std::fs::read_to_string(&cert).unwrap(), before);
        CertificateAuthority::from_pem_files(&cert, &key, None).unwrap();
    }
}
