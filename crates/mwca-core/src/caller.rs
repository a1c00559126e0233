//! 已认证调用方身份
//!
//! 传输层（mTLS 终端或反向代理）完成认证后，只把类型化的 `CallerIdentity`
//! 交给核心；核心不解析原始请求头。

use crate::error::{CaError, Result};
use crate::type_defs::SerialNumber;
use crate::utils::pem_to_der;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use x509_parser::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    common_name: String,
    serial_number: Option<SerialNumber>,
}

impl CallerIdentity {
    /// 传输层已完成证书校验时使用
    pub fn verified(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            serial_number: None,
        }
    }

    pub fn with_serial(mut self, serial_number: SerialNumber) -> Self {
        self.serial_number = Some(serial_number);
        self
    }

    /// 代理转发的客户端 DN，例如 `CN=host1_alice_J,OU=agent,O=Leebalso`
    pub fn from_forwarded_dn(dn: &str) -> Result<Self> {
        let common_name = split_dn(dn)
            .into_iter()
            .find_map(|rdn| {
                let (key, value) = rdn.split_once('=')?;
                key.trim()
                    .eq_ignore_ascii_case("CN")
                    .then(|| value.trim().to_string())
            })
            .filter(|cn| !cn.is_empty())
            .ok_or_else(|| CaError::UntrustedClientCertificate {
                message: format!("forwarded subject has no CN: {dn}"),
            })?;
        Ok(Self::verified(common_name))
    }

    /// 校验客户端证书链到 CA 根（TLS client auth 规则），取出 CN 与序列号
    pub fn from_client_certificate(cert_pem: &str, ca_cert_der: &[u8]) -> Result<Self> {
        let der = pem_to_der(cert_pem, "CERTIFICATE").map_err(untrusted)?;
        verify_client_cert(&der, ca_cert_der)?;

        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| untrusted(format!("Failed to parse client certificate: {e}")))?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string)
            .ok_or_else(|| untrusted("client certificate has no CN"))?;

        Ok(Self::verified(common_name).with_serial(SerialNumber::from_bytes(cert.raw_serial())))
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn serial_number(&self) -> Option<&SerialNumber> {
        self.serial_number.as_ref()
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.common_name)
    }
}

fn untrusted(e: impl fmt::Display) -> CaError {
    CaError::UntrustedClientCertificate {
        message: e.to_string(),
    }
}

/// 按未转义的逗号切分 DN
fn split_dn(dn: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in dn.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' => escaped = true,
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn verify_client_cert(end_entity_der: &[u8], ca_der: &[u8]) -> Result<()> {
    use webpki::{EndEntityCert, Time, TrustAnchor};

    let trust_anchor = TrustAnchor::try_from_cert_der(ca_der)
        .map_err(|e| CaError::key_material(format!("Invalid CA trust anchor: {e:?}")))?;

    let cert = EndEntityCert::try_from(end_entity_der)
        .map_err(|e| untrusted(format!("Invalid end-entity cert: {e:?}")))?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let now = Time::from_seconds_since_unix_epoch(now.as_secs());

    let supported_sig_algs: &[&webpki::SignatureAlgorithm] = &[
        &webpki::ECDSA_P256_SHA256,
        &webpki::ECDSA_P256_SHA384,
        &webpki::ECDSA_P384_SHA256,
        &webpki::ECDSA_P384_SHA384,
        &webpki::ED25519,
        &webpki::RSA_PKCS1_2048_8192_SHA256,
        &webpki::RSA_PKCS1_2048_8192_SHA384,
        &webpki::RSA_PKCS1_2048_8192_SHA512,
    ];

    let anchors = [trust_anchor];
    let anchors = webpki::TlsClientTrustAnchors(&anchors);

    cert.verify_is_valid_tls_client_cert(supported_sig_algs, &anchors, &[], now)
        .map_err(|e| untrusted(format!("Certificate verification failed: {e:?}")))
}
