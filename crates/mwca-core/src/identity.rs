//! Agent 主体身份编解码
//!
//! CSR 的 Common Name 编码为 `{hostname}_{username}_J`，Organizational Unit
//! 携带 usertype（如 `agent`）。hostname 可以包含下划线，username 取后缀前
//! 最右侧的一段。

use crate::error::{CaError, IdentityError, Result};
use crate::utils::pem_to_der;
use serde::{Deserialize, Serialize};
use std::fmt;
use x509_parser::prelude::*;

pub const AGENT_CN_SUFFIX: &str = "_J";

/// 从 CSR 主体解析出的身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectIdentity {
    pub common_name: String,
    pub organizational_unit: Option<String>,
    pub hostname: String,
    pub username: String,
}

impl SubjectIdentity {
    pub fn from_parts(
        common_name: &str,
        organizational_unit: Option<&str>,
    ) -> std::result::Result<Self, IdentityError> {
        let (hostname, username) = parse_common_name(common_name)?;
        Ok(Self {
            common_name: common_name.to_string(),
            organizational_unit: organizational_unit.map(str::to_string),
            hostname,
            username,
        })
    }

    /// usertype，调用方要求时缺失即报错
    pub fn require_usertype(&self) -> std::result::Result<&str, IdentityError> {
        self.organizational_unit
            .as_deref()
            .filter(|ou| !ou.is_empty())
            .ok_or_else(|| IdentityError::MissingAttribute {
                attribute: "OU".to_string(),
            })
    }

    pub fn canonical(&self) -> String {
        render_common_name(&self.hostname, &self.username)
    }
}

impl fmt::Display for SubjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.organizational_unit {
            Some(ou) => write!(f, "CN={}, OU={}", self.common_name, ou),
            None => write!(f, "CN={}", self.common_name),
        }
    }
}

/// Split `{hostname}_{username}_J` into `(hostname, username)`.
pub fn parse_common_name(common_name: &str) -> std::result::Result<(String, String), IdentityError> {
    let body = common_name.strip_suffix(AGENT_CN_SUFFIX).ok_or_else(|| {
        IdentityError::malformed(
            Some(common_name),
            format!("CN must end with {AGENT_CN_SUFFIX}"),
        )
    })?;

    let (hostname, username) = body.rsplit_once('_').ok_or_else(|| {
        IdentityError::malformed(
            Some(common_name),
            "CN must be in format: {hostname}_{username}_J",
        )
    })?;

    if hostname.is_empty() || username.is_empty() {
        return Err(IdentityError::malformed(
            Some(common_name),
            "hostname and username must not be empty",
        ));
    }

    Ok((hostname.to_string(), username.to_string()))
}

pub fn render_common_name(hostname: &str, username: &str) -> String {
    format!("{hostname}_{username}{AGENT_CN_SUFFIX}")
}

/// 从已解析的 CSR 中提取身份（纯函数）
pub fn parse_csr_subject(
    csr: &X509CertificationRequest<'_>,
) -> std::result::Result<SubjectIdentity, IdentityError> {
    let subject = &csr.certification_request_info.subject;
    let common_name = first_attribute(subject.iter_common_name())
        .ok_or_else(|| IdentityError::malformed(None, "CSR must have CN"))?;
    let organizational_unit = first_attribute(subject.iter_organizational_unit());
    SubjectIdentity::from_parts(&common_name, organizational_unit.as_deref())
}

/// PEM 形式的入口：格式错误归为 `MalformedCsr`
pub fn parse_csr_pem(csr_pem: &str) -> Result<SubjectIdentity> {
    let der = pem_to_der(csr_pem, "CERTIFICATE REQUEST")?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| CaError::malformed_csr(format!("Failed to parse CSR DER: {e}")))?;
    Ok(parse_csr_subject(&csr)?)
}

fn first_attribute<'s, 'a: 's>(
    mut attrs: impl Iterator<Item = &'s AttributeTypeAndValue<'a>>,
) -> Option<String> {
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}
