//! CA 根密钥与自签证书：启动时加载或生成一次
//!
//! 目录布局：`ca.key`（PKCS#8 PEM，0600）与 `ca.crt`（PEM，0644）。两者必须
//! 同时存在或同时缺失。

use chrono::{DateTime, Duration, Utc};
use mwca_core::config::{CaConfig, MIN_CA_KEY_BITS};
use mwca_core::error::{CaError, Result};
use mwca_core::type_defs::SerialNumber;
use mwca_core::utils::{fingerprint_sha256, pem_to_der, write_atomic};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, PublicKeyData, RsaKeySize, PKCS_RSA_SHA256,
};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

pub const CA_KEY_FILE: &str = "ca.key";
pub const CA_CERT_FILE: &str = "ca.crt";

/// 已初始化的 CA 身份，进程内只读
pub struct CaIdentity {
    issuer: Issuer<'static, KeyPair>,
    certificate_pem: String,
    certificate_der: Vec<u8>,
    subject_dn: String,
    fingerprint_sha256: String,
    not_after: DateTime<Utc>,
}

impl CaIdentity {
    fn from_parts(issuer: Issuer<'static, KeyPair>, certificate_pem: String) -> Result<Self> {
        let certificate_der = pem_to_der(&certificate_pem, "CERTIFICATE")
            .map_err(|e| CaError::key_material(format!("CA certificate: {e}")))?;
        let (subject_dn, not_after) = {
            let (_, cert) = X509Certificate::from_der(&certificate_der)
                .map_err(|e| CaError::key_material(format!("Failed to parse CA certificate: {e}")))?;
            let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
                .ok_or_else(|| CaError::key_material("CA certificate notAfter out of range"))?;
            (cert.subject().to_string(), not_after)
        };
        Ok(Self {
            fingerprint_sha256: fingerprint_sha256(&certificate_der),
            issuer,
            certificate_pem,
            certificate_der,
            subject_dn,
            not_after,
        })
    }

    pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn subject_dn(&self) -> &str {
        &self.subject_dn
    }

    pub fn fingerprint_sha256(&self) -> &str {
        &self.fingerprint_sha256
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}

impl fmt::Debug for CaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaIdentity")
            .field("subject_dn", &self.subject_dn)
            .field("fingerprint_sha256", &self.fingerprint_sha256)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// 初始化结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaOrigin {
    Loaded,
    Generated,
}

pub struct KeyMaterial {
    dir: PathBuf,
    config: CaConfig,
}

impl KeyMaterial {
    pub fn new(dir: impl Into<PathBuf>, config: CaConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(CA_KEY_FILE)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    /// 加载已有 CA 或生成新 CA；RSA 生成在阻塞线程池中执行
    pub async fn initialize(self) -> Result<(CaIdentity, CaOrigin)> {
        tokio::task::spawn_blocking(move || self.initialize_blocking())
            .await
            .map_err(|e| CaError::internal(format!("CA initialization task failed: {e}")))?
    }

    pub fn initialize_blocking(&self) -> Result<(CaIdentity, CaOrigin)> {
        let key_path = self.key_path();
        let cert_path = self.cert_path();

        match (exists(&key_path)?, exists(&cert_path)?) {
            (true, true) => {
                let identity = self.load(&key_path, &cert_path)?;
                info!(
                    subject = %identity.subject_dn(),
                    fingerprint = %identity.fingerprint_sha256(),
                    not_after = %identity.not_after(),
                    "Loaded existing CA"
                );
                Ok((identity, CaOrigin::Loaded))
            }
            (false, false) => {
                let identity = self.generate(&key_path, &cert_path)?;
                info!(
                    subject = %identity.subject_dn(),
                    fingerprint = %identity.fingerprint_sha256(),
                    dir = %self.dir.display(),
                    "Generated new CA"
                );
                Ok((identity, CaOrigin::Generated))
            }
            (true, false) => Err(CaError::key_material(format!(
                "{} exists but {} is missing",
                key_path.display(),
                cert_path.display()
            ))),
            (false, true) => Err(CaError::key_material(format!(
                "{} exists but {} is missing",
                cert_path.display(),
                key_path.display()
            ))),
        }
    }

    fn load(&self, key_path: &Path, cert_path: &Path) -> Result<CaIdentity> {
        let key_pem = std::fs::read_to_string(key_path)
            .map_err(|e| CaError::key_material(format!("{}: {e}", key_path.display())))?;
        let cert_pem = std::fs::read_to_string(cert_path)
            .map_err(|e| CaError::key_material(format!("{}: {e}", cert_path.display())))?;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| CaError::key_material(format!("Failed to parse CA key: {e}")))?;

        let der = pem_to_der(&cert_pem, "CERTIFICATE")
            .map_err(|e| CaError::key_material(format!("CA certificate: {e}")))?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| CaError::key_material(format!("Failed to parse CA certificate: {e}")))?;

        if !cert.is_ca() {
            return Err(CaError::key_material("Loaded certificate is not a CA certificate"));
        }
        if cert.public_key().subject_public_key.data.as_ref() != key_pair.der_bytes() {
            return Err(CaError::key_material(
                "CA certificate public key does not match the CA private key",
            ));
        }
        cert.verify_signature(None)
            .map_err(|e| CaError::key_material(format!("CA certificate is not self-signed: {e}")))?;

        if let Ok(PublicKey::RSA(rsa)) = cert.public_key().parsed() {
            if rsa.key_size() < MIN_CA_KEY_BITS as usize {
                warn!(bits = rsa.key_size(), "Loaded CA key is smaller than {} bits", MIN_CA_KEY_BITS);
            }
        }

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::key_material(format!("Failed to read CA parameters: {e}")))?;

        CaIdentity::from_parts(issuer, cert_pem)
    }

    fn generate(&self, key_path: &Path, cert_path: &Path) -> Result<CaIdentity> {
        let key_size = match self.config.key_bits {
            4096 => RsaKeySize::_4096,
            other => {
                return Err(CaError::key_material(format!(
                    "Unsupported CA key size {other}; the signing backend generates 4096-bit RSA"
                )))
            }
        };

        ensure_private_dir(&self.dir)?;

        info!(bits = self.config.key_bits, "Generating CA key pair");
        let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, key_size)
            .map_err(|e| CaError::key_material(format!("Failed to generate CA key: {e}")))?;

        let params = self.root_params(Utc::now())?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::key_material(format!("Failed to self-sign CA certificate: {e}")))?;
        let cert_pem = cert.pem();

        write_atomic(key_path, key_pair.serialize_pem().as_bytes(), 0o600)?;
        write_atomic(cert_path, cert_pem.as_bytes(), 0o644)?;

        CaIdentity::from_parts(Issuer::new(params, key_pair), cert_pem)
    }

    fn root_params(&self, now: DateTime<Utc>) -> Result<CertificateParams> {
        let cfg = &self.config;
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaError::key_material(format!("Failed to create CA params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, DnValue::PrintableString(cfg.country.clone().try_into().map_err(
            |_| CaError::config_error(format!("ca.country is not printable: {}", cfg.country)),
        )?));
        dn.push(DnType::OrganizationName, DnValue::Utf8String(cfg.organization.clone()));
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(cfg.organizational_unit.clone()),
        );
        dn.push(DnType::CommonName, DnValue::Utf8String(cfg.common_name.clone()));
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(cfg.path_len));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(rcgen::SerialNumber::from(
            SerialNumber::generate_bytes()?.to_vec(),
        ));
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(now + Duration::days(i64::from(cfg.validity_days)))?;

        Ok(params)
    }
}

pub(crate) fn to_offset(at: DateTime<Utc>) -> Result<::time::OffsetDateTime> {
    ::time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| CaError::internal(format!("timestamp out of range: {e}")))
}

fn exists(path: &Path) -> Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CaError::key_material(format!("{}: {e}", path.display()))),
    }
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| CaError::key_material(format!("Cannot create {}: {e}", dir.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| CaError::key_material(format!("{}: {e}", dir.display())))?;
    }
    Ok(())
}

/// 单元测试用的 P-256 CA（避免生成 RSA 4096）
#[cfg(test)]
pub(crate) fn test_ca_identity() -> CaIdentity {
    let key_pair = KeyPair::generate().expect("generate test CA key");
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("test CA params");
    params.distinguished_name.push(DnType::CommonName, "Unit Test CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let cert = params.self_signed(&key_pair).expect("self-sign test CA");
    CaIdentity::from_parts(Issuer::new(params, key_pair), cert.pem()).expect("test CA identity")
}
