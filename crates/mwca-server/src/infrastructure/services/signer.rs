//! CSR 校验与叶子证书签发

use chrono::{DateTime, Duration, Utc};
use mwca_core::csr_types::{CertificateIssuer, IssuedCertificate};
use mwca_core::error::{CaError, Result};
use mwca_core::identity::{parse_csr_subject, SubjectIdentity};
use mwca_core::type_defs::SerialNumber;
use mwca_core::utils::{fingerprint_sha256, pem_to_der};
use rcgen::{
    CertificateSigningRequestParams, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
};
use std::sync::Arc;
use tracing::{debug, info};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::infrastructure::key_material::{to_offset, CaIdentity};

pub const MIN_RSA_BITS: usize = 2048;

/// 通过全部策略检查的 CSR
#[derive(Debug, Clone)]
pub struct ValidatedCsr {
    pub pem: String,
    pub identity: SubjectIdentity,
    pub key_description: String,
}

/// PEM/DER 解析、自签名校验、签名算法白名单、公钥策略、主体身份解析
pub fn validate_csr(csr_pem: &str) -> Result<ValidatedCsr> {
    let der = pem_to_der(csr_pem, "CERTIFICATE REQUEST")?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| CaError::malformed_csr(format!("Failed to parse CSR DER: {e}")))?;

    csr.verify_signature()
        .map_err(|e| CaError::malformed_csr(format!("CSR signature verification failed: {e}")))?;

    let algo = &csr.signature_algorithm.algorithm;
    let allowed = [
        oid_registry::OID_SIG_ECDSA_WITH_SHA256,
        oid_registry::OID_SIG_ECDSA_WITH_SHA384,
        oid_registry::OID_PKCS1_SHA256WITHRSA,
        oid_registry::OID_PKCS1_SHA384WITHRSA,
        oid_registry::OID_PKCS1_SHA512WITHRSA,
        oid_registry::OID_SIG_ED25519,
    ];
    if !allowed.iter().any(|a| a == algo) {
        return Err(CaError::malformed_csr(format!(
            "Disallowed CSR signature algorithm: {algo}"
        )));
    }

    let key_description = check_public_key(&csr.certification_request_info.subject_pki)?;
    let identity = parse_csr_subject(&csr)?;

    Ok(ValidatedCsr {
        pem: csr_pem.to_string(),
        identity,
        key_description,
    })
}

fn check_public_key(spki: &SubjectPublicKeyInfo<'_>) -> Result<String> {
    let key_oid = &spki.algorithm.algorithm;

    if *key_oid == oid_registry::OID_SIG_ED25519 {
        return Ok("Ed25519".to_string());
    }

    if *key_oid == oid_registry::OID_KEY_TYPE_EC_PUBLIC_KEY {
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|p| p.as_oid().ok())
            .ok_or_else(|| CaError::malformed_csr("EC key without named curve"))?;
        return if curve == oid_registry::OID_EC_P256 {
            Ok("ECDSA P-256".to_string())
        } else if curve == oid_registry::OID_NIST_EC_P384 {
            Ok("ECDSA P-384".to_string())
        } else {
            Err(CaError::malformed_csr(format!("Unsupported EC curve: {curve}")))
        };
    }

    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => {
            let bits = rsa.key_size();
            if bits < MIN_RSA_BITS {
                return Err(CaError::malformed_csr(format!(
                    "RSA key too small: {bits} bits (minimum {MIN_RSA_BITS})"
                )));
            }
            Ok(format!("RSA {bits}"))
        }
        _ => Err(CaError::malformed_csr(format!(
            "Unsupported public key algorithm: {key_oid}"
        ))),
    }
}

/// 用 CA 私钥签发叶子证书；签名在阻塞线程池中执行
#[derive(Clone)]
pub struct CertificateSigner {
    ca: Arc<CaIdentity>,
}

impl CertificateSigner {
    pub fn new(ca: Arc<CaIdentity>) -> Self {
        Self { ca }
    }

    pub fn ca(&self) -> &CaIdentity {
        &self.ca
    }

    pub async fn sign(
        &self,
        csr_pem: &str,
        validity_days: u32,
        issuer: CertificateIssuer,
    ) -> Result<IssuedCertificate> {
        let ca = self.ca.clone();
        let csr_pem = csr_pem.to_string();
        tokio::task::spawn_blocking(move || {
            sign_blocking(&ca, &csr_pem, validity_days, issuer, Utc::now())
        })
        .await
        .map_err(|e| CaError::signing(format!("signing task failed: {e}")))?
    }
}

/// 主体逐字复制自 CSR；有效期 `[now, now + validity_days]`
pub fn sign_blocking(
    ca: &CaIdentity,
    csr_pem: &str,
    validity_days: u32,
    issuer: CertificateIssuer,
    now: DateTime<Utc>,
) -> Result<IssuedCertificate> {
    let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| CaError::signing(format!("Failed to load CSR for signing: {e}")))?;

    let serial_bytes = SerialNumber::generate_bytes()?;
    let serial_number = SerialNumber::from_bytes(&serial_bytes);
    let expires_at = now + Duration::days(i64::from(validity_days));

    let params = &mut csr.params;
    params.serial_number = Some(rcgen::SerialNumber::from(serial_bytes.to_vec()));
    params.not_before = to_offset(now)?;
    params.not_after = to_offset(expires_at)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params.use_authority_key_identifier_extension = true;

    let cert = csr
        .signed_by(ca.issuer())
        .map_err(|e| CaError::signing(format!("Failed to sign certificate: {e}")))?;

    let certificate_pem = cert.pem();
    let der = cert.der();
    let (_, parsed) = X509Certificate::from_der(der)
        .map_err(|e| CaError::signing(format!("Signed certificate is unreadable: {e}")))?;
    let subject_dn = parsed.subject().to_string();
    let subject_common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    debug!(serial = %serial_number, subject = %subject_dn, "Certificate signed");
    info!(
        serial = %serial_number,
        cn = %subject_common_name,
        validity_days,
        issuer = %issuer,
        "Issued certificate"
    );

    Ok(IssuedCertificate {
        serial_number,
        subject_common_name,
        subject_dn,
        fingerprint_sha256: fingerprint_sha256(der),
        certificate_pem,
        issued_at: now,
        expires_at,
        issuer,
    })
}
