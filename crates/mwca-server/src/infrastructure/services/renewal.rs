use mwca_core::caller::CallerIdentity;
use mwca_core::csr_types::{CertificateIssuer, IssuedCertificate};
use mwca_core::error::{CaError, Result};
use tracing::{info, warn};

use crate::infrastructure::services::revocation::RevocationRegistry;
use crate::infrastructure::services::signer::{validate_csr, CertificateSigner};

/// mTLS 已认证的持证客户端直接换发证书，不经过 token 与审批
#[derive(Clone)]
pub struct RenewalService {
    signer: CertificateSigner,
    registry: RevocationRegistry,
    validity_days: u32,
}

impl RenewalService {
    pub fn new(signer: CertificateSigner, registry: RevocationRegistry, validity_days: u32) -> Self {
        Self {
            signer,
            registry,
            validity_days,
        }
    }

    /// 调用方 CN 必须与 CSR 的 CN 完全一致（区分大小写）
    pub async fn renew(&self, csr_pem: &str, caller: &CallerIdentity) -> Result<IssuedCertificate> {
        let csr = validate_csr(csr_pem)?;

        if caller.common_name() != csr.identity.common_name {
            warn!(
                caller = %caller,
                requested = %csr.identity.common_name,
                "Renewal identity mismatch"
            );
            return Err(CaError::IdentityMismatch {
                caller: caller.common_name().to_string(),
                requested: csr.identity.common_name,
            });
        }

        if let Some(serial) = caller.serial_number() {
            if self.registry.is_revoked(serial).await? {
                warn!(caller = %caller, serial = %serial, "Renewal with revoked certificate");
                return Err(CaError::CertificateRevoked {
                    serial_number: serial.to_string(),
                });
            }
        }

        let issued = self
            .signer
            .sign(&csr.pem, self.validity_days, CertificateIssuer::AutoRenewal)
            .await?;
        self.registry.record_issued(issued.clone()).await?;

        info!(
            cn = %issued.subject_common_name,
            serial = %issued.serial_number,
            previous_serial = ?caller.serial_number(),
            key = %csr.key_description,
            "Certificate renewed"
        );
        Ok(issued)
    }
}
