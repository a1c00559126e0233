//! 证书申请审批状态机：pending_approval → approved | rejected（仅一次）

use chrono::Utc;
use dashmap::DashMap;
use mwca_core::csr_types::{
    CertificateIssuer, CertificateRequest, IssuedCertificate, RequestStatus,
};
use mwca_core::error::{CaError, Result};
use mwca_core::identity::SubjectIdentity;
use mwca_core::type_defs::{RequestId, TokenId};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::application::ports::{Versioned, VersionedStore};
use crate::infrastructure::services::revocation::RevocationRegistry;
use crate::infrastructure::services::signer::CertificateSigner;

const MAX_ID_ATTEMPTS: usize = 5;

pub struct CertificateRequestLedger {
    store: Arc<dyn VersionedStore<CertificateRequest>>,
    signer: CertificateSigner,
    registry: RevocationRegistry,
    max_validity_days: u32,
    /// 每个申请一把锁，只覆盖该记录的读-检查-签名-写；跨进程由存储的 CAS 兜底
    record_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CertificateRequestLedger {
    pub fn new(
        store: Arc<dyn VersionedStore<CertificateRequest>>,
        signer: CertificateSigner,
        registry: RevocationRegistry,
        max_validity_days: u32,
    ) -> Self {
        Self {
            store,
            signer,
            registry,
            max_validity_days,
            record_locks: DashMap::new(),
        }
    }

    /// 记录待审批申请；调用方负责事先校验 CSR 与 token
    pub async fn submit(
        &self,
        csr_pem: &str,
        subject: SubjectIdentity,
        source_ip: IpAddr,
        bootstrap_token_id: TokenId,
        agent_info: serde_json::Value,
    ) -> Result<RequestId> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let now = Utc::now();
            let request_id = RequestId::generate(now)?;
            let request = CertificateRequest::new(
                request_id.clone(),
                csr_pem.to_string(),
                subject.clone(),
                source_ip,
                bootstrap_token_id.clone(),
                agent_info.clone(),
                now,
            );
            match self.store.create(request_id.as_str(), request).await {
                Ok(_) => {
                    info!(
                        request_id = %request_id,
                        cn = %subject.common_name,
                        %source_ip,
                        "Certificate request submitted"
                    );
                    return Ok(request_id);
                }
                Err(CaError::Conflict { .. }) => {
                    warn!(request_id = %request_id, "Request id collision, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CaError::internal("Failed to allocate a unique request id"))
    }

    pub async fn get(&self, request_id: &RequestId) -> Result<CertificateRequest> {
        Ok(self.get_versioned(request_id).await?.value)
    }

    async fn get_versioned(&self, request_id: &RequestId) -> Result<Versioned<CertificateRequest>> {
        self.store
            .get(request_id.as_str())
            .await?
            .ok_or_else(|| CaError::RequestNotFound {
                request_id: request_id.to_string(),
            })
    }

    /// 所有申请，最新在前
    pub async fn list(&self) -> Result<Vec<CertificateRequest>> {
        let mut requests = self.snapshot().await?;
        requests.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| b.request_id.cmp(&a.request_id))
        });
        Ok(requests)
    }

    /// 待审批队列，最早提交在前
    pub async fn list_pending(&self) -> Result<Vec<CertificateRequest>> {
        let mut pending: Vec<_> = self
            .snapshot()
            .await?
            .into_iter()
            .filter(|r| r.status == RequestStatus::PendingApproval)
            .collect();
        pending.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(pending)
    }

    async fn snapshot(&self) -> Result<Vec<CertificateRequest>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|(_, v)| v.value)
            .collect())
    }

    /// 签发并置为 approved；同一申请至多生效一次
    pub async fn approve(
        &self,
        request_id: &RequestId,
        approver: &str,
        validity_days: u32,
        comment: &str,
    ) -> Result<IssuedCertificate> {
        require_principal(approver, "approver")?;
        if validity_days == 0 || validity_days > self.max_validity_days {
            return Err(CaError::invalid_argument(format!(
                "validity_days must be between 1 and {}",
                self.max_validity_days
            )));
        }

        self.with_record_lock(request_id, || async {
            let current = self.get_versioned(request_id).await?;
            current.value.ensure_pending()?;

            let issued = self
                .signer
                .sign(
                    &current.value.csr_pem,
                    validity_days,
                    CertificateIssuer::Request(request_id.clone()),
                )
                .await?;

            // 先提交状态转换，输掉 CAS 的签名结果直接丢弃，不进入已签发记录
            let mut approved = current.value.clone();
            approved.mark_approved(&issued, approver, comment, Utc::now())?;
            self.store
                .update(request_id.as_str(), approved, current.revision)
                .await
                .map_err(|e| {
                    warn!(
                        request_id = %request_id,
                        serial = %issued.serial_number,
                        error = %e,
                        "Approval not committed, discarding signed certificate"
                    );
                    e
                })?;

            if let Err(e) = self.registry.record_issued(issued.clone()).await {
                error!(
                    request_id = %request_id,
                    serial = %issued.serial_number,
                    error = %e,
                    "Request approved but certificate record failed"
                );
                return Err(e);
            }

            info!(
                request_id = %request_id,
                cn = %issued.subject_common_name,
                serial = %issued.serial_number,
                approver = %approver,
                validity_days,
                "Certificate request approved"
            );
            Ok(issued)
        })
        .await
    }

    pub async fn reject(&self, request_id: &RequestId, rejecter: &str, reason: &str) -> Result<()> {
        require_principal(rejecter, "rejecter")?;
        if reason.trim().is_empty() {
            return Err(CaError::invalid_argument("rejection reason is required"));
        }

        self.with_record_lock(request_id, || async {
            let current = self.get_versioned(request_id).await?;
            let mut rejected = current.value.clone();
            rejected.mark_rejected(rejecter, reason.trim(), Utc::now())?;
            self.store
                .update(request_id.as_str(), rejected, current.revision)
                .await?;

            info!(
                request_id = %request_id,
                cn = %current.value.subject.common_name,
                rejecter = %rejecter,
                reason = %reason.trim(),
                "Certificate request rejected"
            );
            Ok(())
        })
        .await
    }

    async fn with_record_lock<T, F, Fut>(&self, request_id: &RequestId, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self
            .record_locks
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            f().await
        };

        drop(lock);
        self.record_locks
            .remove_if(request_id.as_str(), |_, l| Arc::strong_count(l) == 1);
        result
    }
}

fn require_principal(principal: &str, role: &str) -> Result<()> {
    if principal.trim().is_empty() {
        return Err(CaError::invalid_argument(format!("{role} must not be empty")));
    }
    Ok(())
}
