//! CA Service - 证书生命周期的统一入口
//!
//! 组合 token、申请台账、签发、换发与吊销登记，对外暴露管理员与 agent 两侧的操作。

use chrono::{Duration, Utc};
use mwca_core::caller::CallerIdentity;
use mwca_core::config::{IssuanceConfig, MwcaConfig, TokensConfig};
use mwca_core::csr_types::{
    BootstrapToken, CertificateRequest, CertificateStatus, CertificateSummary, IssuedCertificate,
    RequestStatusView, RevocationRecord, TokenExportFormat,
};
use mwca_core::error::{CaError, RedeemError, Result};
use mwca_core::type_defs::{RequestId, SerialNumber, TokenId};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::infrastructure::key_material::{CaIdentity, CaOrigin, KeyMaterial};
use crate::infrastructure::persistence::Stores;
use crate::infrastructure::services::renewal::RenewalService;
use crate::infrastructure::services::request_ledger::CertificateRequestLedger;
use crate::infrastructure::services::revocation::RevocationRegistry;
use crate::infrastructure::services::signer::{validate_csr, CertificateSigner};
use crate::infrastructure::services::token_store::BootstrapTokenStore;

pub struct CaService {
    ca: Arc<CaIdentity>,
    tokens: BootstrapTokenStore,
    ledger: CertificateRequestLedger,
    registry: RevocationRegistry,
    renewal: RenewalService,
    issuance: IssuanceConfig,
    token_policy: TokensConfig,
}

impl CaService {
    pub fn new(
        ca: CaIdentity,
        stores: Stores,
        issuance: IssuanceConfig,
        token_policy: TokensConfig,
    ) -> Self {
        let ca = Arc::new(ca);
        let signer = CertificateSigner::new(ca.clone());
        let registry = RevocationRegistry::new(stores.certificates, stores.revocations);
        let ledger = CertificateRequestLedger::new(
            stores.requests,
            signer.clone(),
            registry.clone(),
            issuance.max_validity_days,
        );
        let renewal =
            RenewalService::new(signer, registry.clone(), issuance.renewal_validity_days);

        Self {
            ca,
            tokens: BootstrapTokenStore::new(stores.tokens),
            ledger,
            registry,
            renewal,
            issuance,
            token_policy,
        }
    }

    /// 启动屏障：加载或生成 CA，打开存储。返回之前不处理任何请求
    pub async fn bootstrap(cfg: &MwcaConfig) -> Result<(Self, CaOrigin)> {
        let (ca, origin) = KeyMaterial::new(cfg.ca_dir(), cfg.ca.clone())
            .initialize()
            .await?;
        let stores = Stores::from_config(cfg)?;
        Ok((
            Self::new(ca, stores, cfg.issuance.clone(), cfg.tokens.clone()),
            origin,
        ))
    }

    pub fn ca(&self) -> &CaIdentity {
        &self.ca
    }

    pub fn token_store(&self) -> BootstrapTokenStore {
        self.tokens.clone()
    }

    pub fn token_policy(&self) -> &TokensConfig {
        &self.token_policy
    }

    pub fn get_ca_certificate(&self) -> &str {
        self.ca.certificate_pem()
    }

    // --- agent 侧 ---

    /// 校验 CSR → 解析身份 → 兑换 token → 记录待审批申请
    ///
    /// CSR 或主体不合法时 token 不会被消耗。
    pub async fn submit_certificate_request(
        &self,
        csr_pem: &str,
        bootstrap_token: &str,
        source_ip: IpAddr,
        agent_info: serde_json::Value,
    ) -> Result<RequestId> {
        let bootstrap_token = bootstrap_token.trim();
        if bootstrap_token.is_empty() {
            return Err(RedeemError::NotFound.into());
        }
        if !(agent_info.is_object() || agent_info.is_null()) {
            return Err(CaError::invalid_argument("agent_info must be a JSON object"));
        }

        let csr = validate_csr(csr_pem).map_err(|e| {
            warn!(%source_ip, error = %e, "Rejected certificate request");
            e
        })?;
        if self.issuance.require_usertype {
            csr.identity.require_usertype()?;
        }

        let token_id = TokenId::new(bootstrap_token);
        self.tokens
            .redeem(&token_id, &csr.identity.common_name, source_ip)
            .await?;

        self.ledger
            .submit(&csr.pem, csr.identity, source_ip, token_id, agent_info)
            .await
    }

    pub async fn get_certificate_request_status(
        &self,
        request_id: &RequestId,
    ) -> Result<RequestStatusView> {
        let request = self.ledger.get(request_id).await?;
        Ok(RequestStatusView::from_request(
            &request,
            self.ca.certificate_pem(),
        ))
    }

    /// 调用方身份须已由传输层（mTLS）验证
    pub async fn renew_certificate(
        &self,
        csr_pem: &str,
        caller: &CallerIdentity,
    ) -> Result<IssuedCertificate> {
        self.renewal.renew(csr_pem, caller).await
    }

    // --- token 管理 ---

    pub async fn issue_bootstrap_token(
        &self,
        expected_common_name: Option<String>,
        validity_hours: Option<u32>,
        allowed_source_ips: Option<BTreeSet<IpAddr>>,
        comment: &str,
        created_by: &str,
    ) -> Result<BootstrapToken> {
        let hours = validity_hours.unwrap_or(self.token_policy.default_validity_hours);
        self.tokens
            .issue(
                expected_common_name,
                Duration::hours(i64::from(hours)),
                allowed_source_ips,
                created_by,
                comment,
            )
            .await
    }

    pub async fn list_bootstrap_tokens(&self) -> Result<Vec<BootstrapToken>> {
        self.tokens.list().await
    }

    /// 未指定地址时使用配置中的 `issuance.ca_server_url`
    pub async fn export_bootstrap_token(
        &self,
        token_id: &TokenId,
        format: TokenExportFormat,
        ca_server_url: Option<&str>,
    ) -> Result<String> {
        let url = ca_server_url.unwrap_or(&self.issuance.ca_server_url);
        self.tokens.export(token_id, format, url).await
    }

    pub async fn prune_bootstrap_tokens(&self) -> Result<usize> {
        let grace = Duration::hours(i64::from(self.token_policy.prune_grace_hours));
        self.tokens.prune(Utc::now(), grace).await
    }

    // --- 审批 ---

    pub async fn list_pending_requests(&self) -> Result<Vec<CertificateRequest>> {
        self.ledger.list_pending().await
    }

    pub async fn list_requests(&self) -> Result<Vec<CertificateRequest>> {
        self.ledger.list().await
    }

    pub async fn get_request(&self, request_id: &RequestId) -> Result<CertificateRequest> {
        self.ledger.get(request_id).await
    }

    /// 未指定有效期时使用 `issuance.default_validity_days`
    pub async fn approve_request(
        &self,
        request_id: &RequestId,
        approver: &str,
        validity_days: Option<u32>,
        comment: &str,
    ) -> Result<IssuedCertificate> {
        let days = validity_days.unwrap_or(self.issuance.default_validity_days);
        self.ledger.approve(request_id, approver, days, comment).await
    }

    pub async fn reject_request(
        &self,
        request_id: &RequestId,
        rejecter: &str,
        reason: &str,
    ) -> Result<()> {
        self.ledger.reject(request_id, rejecter, reason).await
    }

    // --- 证书 ---

    pub async fn list_issued_certificates(
        &self,
        status: Option<CertificateStatus>,
    ) -> Result<Vec<CertificateSummary>> {
        self.registry.list(status).await
    }

    pub async fn get_certificate(&self, serial: &SerialNumber) -> Result<IssuedCertificate> {
        self.registry.get(serial).await
    }

    pub async fn certificate_status(&self, serial: &SerialNumber) -> Result<CertificateStatus> {
        self.registry.status(serial).await
    }

    pub async fn revocation(&self, serial: &SerialNumber) -> Result<Option<RevocationRecord>> {
        self.registry.revocation(serial).await
    }

    pub async fn revoke_certificate(
        &self,
        serial: &SerialNumber,
        revoked_by: &str,
    ) -> Result<RevocationRecord> {
        if revoked_by.trim().is_empty() {
            return Err(CaError::invalid_argument("revoked_by must not be empty"));
        }
        let record = self.registry.revoke(serial, revoked_by).await?;
        if record.revoked_by != revoked_by {
            info!(
                serial = %serial,
                original_revoker = %record.revoked_by,
                "Certificate was already revoked"
            );
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::key_material::test_ca_identity;
    use mwca_core::csr_types::{CsrGenerator, RequestStatus};
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn service(issuance: IssuanceConfig) -> CaService {
        CaService::new(
            test_ca_identity(),
            Stores::in_memory(),
            issuance,
            TokensConfig::default(),
        )
    }

    fn csr(host: &str, user: &str, ou: Option<&str>) -> String {
        CsrGenerator::new()
            .unwrap()
            .generate_csr(host, user, ou)
            .unwrap()
    }

    #[tokio::test]
    async fn test_malformed_csr_does_not_burn_token() {
        let ca = service(IssuanceConfig::default());
        let token = ca
            .issue_bootstrap_token(None, Some(1), None, "", "ops")
            .await
            .unwrap();

        let err = ca
            .submit_certificate_request("garbage", token.token_id.as_str(), LOCAL, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::MalformedCsr { .. }));
        assert!(!ca.token_store().get(&token.token_id).await.unwrap().is_used());

        ca.submit_certificate_request(
            &csr("host1", "alice", None),
            token.token_id.as_str(),
            LOCAL,
            serde_json::json!({"version": "1.0"}),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_required_usertype_is_checked_before_redeem() {
        let ca = service(IssuanceConfig {
            require_usertype: true,
            ..IssuanceConfig::default()
        });
        let token = ca
            .issue_bootstrap_token(None, Some(1), None, "", "ops")
            .await
            .unwrap();

        let err = ca
            .submit_certificate_request(
                &csr("host1", "alice", None),
                token.token_id.as_str(),
                LOCAL,
                serde_json::Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::Identity(_)));
        assert!(!ca.token_store().get(&token.token_id).await.unwrap().is_used());
    }

    #[tokio::test]
    async fn test_agent_info_must_be_object() {
        let ca = service(IssuanceConfig::default());
        let err = ca
            .submit_certificate_request(
                &csr("host1", "alice", None),
                "bt-whatever",
                LOCAL,
                serde_json::json!([1, 2]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_default_validity_applies_on_approve() {
        let ca = service(IssuanceConfig::default());
        let token = ca
            .issue_bootstrap_token(Some("host1_alice_J".into()), None, None, "", "ops")
            .await
            .unwrap();
        let request_id = ca
            .submit_certificate_request(
                &csr("host1", "alice", Some("agent")),
                token.token_id.as_str(),
                LOCAL,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let pending = ca.get_certificate_request_status(&request_id).await.unwrap();
        assert_eq!(pending.status, RequestStatus::PendingApproval);
        assert!(pending.ca_certificate_pem.is_none());

        let issued = ca
            .approve_request(&request_id, "admin", None, "")
            .await
            .unwrap();
        assert_eq!(issued.expires_at - issued.issued_at, Duration::days(90));

        let view = ca.get_certificate_request_status(&request_id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Approved);
        assert_eq!(view.ca_certificate_pem.as_deref(), Some(ca.get_ca_certificate()));
        assert_eq!(view.serial_number, Some(issued.serial_number));
    }

    #[tokio::test]
    async fn test_export_uses_configured_url() {
        let ca = service(IssuanceConfig {
            ca_server_url: "https://ca.example.com/".into(),
            ..IssuanceConfig::default()
        });
        let token = ca
            .issue_bootstrap_token(Some("host1_alice_J".into()), None, None, "", "ops")
            .await
            .unwrap();
        let exported = ca
            .export_bootstrap_token(&token.token_id, TokenExportFormat::Json, None)
            .await
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(doc["ca_server_url"], "https://ca.example.com");
        assert_eq!(doc["expected_cn"], "host1_alice_J");
    }

    #[tokio::test]
    async fn test_revoke_requires_principal() {
        let ca = service(IssuanceConfig::default());
        let serial = SerialNumber::parse("01").unwrap();
        assert!(matches!(
            ca.revoke_certificate(&serial, " ").await,
            Err(CaError::InvalidArgument { .. })
        ));
    }
}
