//! 证书签发相关的数据模型：bootstrap token、证书申请、已签发证书、吊销记录

use crate::error::{CaError, RedeemError, Result};
use crate::identity::{render_common_name, SubjectIdentity};
use crate::type_defs::{RequestId, SerialNumber, TokenId};
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapToken {
    pub token_id: TokenId,
    pub expected_common_name: Option<String>,
    /// 为空或 None 时不限制来源
    pub allowed_source_ips: Option<BTreeSet<IpAddr>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by_common_name: Option<String>,
    pub used_from_ip: Option<IpAddr>,
    pub comment: String,
}

impl BootstrapToken {
    pub fn new(
        expected_common_name: Option<String>,
        validity: chrono::Duration,
        allowed_source_ips: Option<BTreeSet<IpAddr>>,
        created_by: impl Into<String>,
        comment: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if validity < chrono::Duration::zero() {
            return Err(CaError::invalid_argument("token validity must not be negative"));
        }
        Ok(Self {
            token_id: TokenId::generate()?,
            expected_common_name,
            allowed_source_ips,
            expires_at: now + validity,
            created_at: now,
            created_by: created_by.into(),
            used_at: None,
            used_by_common_name: None,
            used_from_ip: None,
            comment: comment.into(),
        })
    }

    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 仅用于展示；授权必须走 redeem
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_used() && !self.is_expired_at(now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// 兑换前的全部检查，顺序：过期 → 已使用 → 来源 → 身份
    pub fn check_redeemable(
        &self,
        now: DateTime<Utc>,
        presented_common_name: &str,
        source_ip: IpAddr,
    ) -> std::result::Result<(), RedeemError> {
        if self.is_expired_at(now) {
            return Err(RedeemError::Expired);
        }
        if self.is_used() {
            return Err(RedeemError::AlreadyUsed);
        }
        if let Some(allowed) = &self.allowed_source_ips {
            if !allowed.is_empty() && !allowed.contains(&source_ip) {
                return Err(RedeemError::SourceNotAllowed {
                    source_ip: source_ip.to_string(),
                });
            }
        }
        if let Some(expected) = &self.expected_common_name {
            if expected != presented_common_name {
                return Err(RedeemError::SubjectMismatch {
                    expected: expected.clone(),
                    presented: presented_common_name.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn mark_used(&mut self, now: DateTime<Utc>, common_name: &str, source_ip: IpAddr) {
        self.used_at = Some(now);
        self.used_by_common_name = Some(common_name.to_string());
        self.used_from_ip = Some(source_ip);
    }
}

/// Bootstrap token 导出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenExportFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for TokenExportFormat {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(TokenExportFormat::Text),
            "json" => Ok(TokenExportFormat::Json),
            other => Err(CaError::invalid_argument(format!(
                "unknown token export format: {other}"
            ))),
        }
    }
}

#[derive(Debug, Serialize)]
struct TokenFile<'a> {
    token: &'a str,
    ca_server_url: &'a str,
    expected_cn: Option<&'a str>,
}

/// 渲染交付给 agent 的 bootstrap.token 文件内容
pub fn render_token_file(
    token: &BootstrapToken,
    format: TokenExportFormat,
    ca_server_url: &str,
) -> Result<String> {
    match format {
        TokenExportFormat::Text => Ok(token.token_id.as_str().to_string()),
        TokenExportFormat::Json => Ok(serde_json::to_string_pretty(&TokenFile {
            token: token.token_id.as_str(),
            ca_server_url: ca_server_url.trim_end_matches('/'),
            expected_cn: token.expected_common_name.as_deref(),
        })?),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    PendingApproval,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::PendingApproval)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::PendingApproval => "pending_approval",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 证书申请（审计记录，永不删除）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub request_id: RequestId,
    pub csr_pem: String,
    pub subject: SubjectIdentity,
    pub source_ip: IpAddr,
    pub bootstrap_token_id: TokenId,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub agent_info: serde_json::Value,
    pub certificate_pem: Option<String>,
    pub serial_number: Option<SerialNumber>,
    pub expires_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approval_comment: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub reject_reason: Option<String>,
}

impl CertificateRequest {
    pub fn new(
        request_id: RequestId,
        csr_pem: String,
        subject: SubjectIdentity,
        source_ip: IpAddr,
        bootstrap_token_id: TokenId,
        agent_info: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            csr_pem,
            subject,
            source_ip,
            bootstrap_token_id,
            status: RequestStatus::PendingApproval,
            submitted_at: now,
            agent_info,
            certificate_pem: None,
            serial_number: None,
            expires_at: None,
            approved_at: None,
            approved_by: None,
            approval_comment: None,
            rejected_at: None,
            rejected_by: None,
            reject_reason: None,
        }
    }

    pub fn ensure_pending(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(CaError::InvalidTransition {
                request_id: self.request_id.to_string(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    pub fn mark_approved(
        &mut self,
        issued: &IssuedCertificate,
        approver: &str,
        comment: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_pending()?;
        self.status = RequestStatus::Approved;
        self.certificate_pem = Some(issued.certificate_pem.clone());
        self.serial_number = Some(issued.serial_number.clone());
        self.expires_at = Some(issued.expires_at);
        self.approved_at = Some(now);
        self.approved_by = Some(approver.to_string());
        self.approval_comment = (!comment.is_empty()).then(|| comment.to_string());
        Ok(())
    }

    pub fn mark_rejected(&mut self, rejecter: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending()?;
        self.status = RequestStatus::Rejected;
        self.rejected_at = Some(now);
        self.rejected_by = Some(rejecter.to_string());
        self.reject_reason = Some(reason.to_string());
        Ok(())
    }
}

/// 申请状态查询结果（对应 agent 轮询接口）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStatusView {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_certificate_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<SerialNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RequestStatusView {
    pub fn from_request(request: &CertificateRequest, ca_certificate_pem: &str) -> Self {
        let approved = request.status == RequestStatus::Approved;
        Self {
            request_id: request.request_id.clone(),
            status: request.status,
            submitted_at: request.submitted_at,
            certificate_pem: request.certificate_pem.clone(),
            ca_certificate_pem: approved.then(|| ca_certificate_pem.to_string()),
            serial_number: request.serial_number.clone(),
            expires_at: request.expires_at,
            approved_at: request.approved_at,
            approved_by: request.approved_by.clone(),
            rejected_at: request.rejected_at,
            rejected_by: request.rejected_by.clone(),
            reason: request.reject_reason.clone(),
        }
    }
}

/// 签发来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateIssuer {
    Request(RequestId),
    AutoRenewal,
}

impl fmt::Display for CertificateIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateIssuer::Request(id) => write!(f, "{id}"),
            CertificateIssuer::AutoRenewal => f.write_str("auto-renewal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub serial_number: SerialNumber,
    pub subject_common_name: String,
    pub subject_dn: String,
    pub certificate_pem: String,
    pub fingerprint_sha256: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer: CertificateIssuer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Active,
    Expired,
    Revoked,
}

impl CertificateStatus {
    /// revoked 优先于 expired，expired 优先于 active
    pub fn classify(revoked: bool, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if revoked {
            CertificateStatus::Revoked
        } else if now > expires_at {
            CertificateStatus::Expired
        } else {
            CertificateStatus::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Active => "active",
            CertificateStatus::Expired => "expired",
            CertificateStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateStatus {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(CertificateStatus::Active),
            "expired" => Ok(CertificateStatus::Expired),
            "revoked" => Ok(CertificateStatus::Revoked),
            other => Err(CaError::invalid_argument(format!(
                "unknown certificate status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub serial_number: SerialNumber,
    pub revoked_at: DateTime<Utc>,
    pub revoked_by: String,
}

/// 已签发证书列表行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateSummary {
    pub serial_number: SerialNumber,
    pub subject_common_name: String,
    pub status: CertificateStatus,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer: CertificateIssuer,
}

/// Agent 侧 CSR 生成器
pub struct CsrGenerator {
    key_pair: KeyPair,
}

impl CsrGenerator {
    pub fn new() -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| CaError::internal(format!("Failed to generate key pair: {e}")))?;
        Ok(Self { key_pair })
    }

    /// 生成 `{hostname}_{username}_J` 身份的 CSR
    pub fn generate_csr(
        &self,
        hostname: &str,
        username: &str,
        usertype: Option<&str>,
    ) -> Result<String> {
        self.generate_csr_with_cn(&render_common_name(hostname, username), usertype)
    }

    pub fn generate_csr_with_cn(&self, common_name: &str, usertype: Option<&str>) -> Result<String> {
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| {
            CaError::internal(format!("Failed to create certificate params: {e}"))
        })?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        if let Some(ou) = usertype {
            dn.push(
                DnType::OrganizationalUnitName,
                DnValue::Utf8String(ou.to_string()),
            );
        }
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&self.key_pair)
            .map_err(|e| CaError::internal(format!("Failed to serialize CSR: {e}")))?;

        csr.pem()
            .map_err(|e| CaError::internal(format!("Failed to convert CSR to PEM: {e}")))
    }
}
