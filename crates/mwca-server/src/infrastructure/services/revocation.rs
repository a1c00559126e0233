use chrono::{DateTime, Utc};
use mwca_core::csr_types::{CertificateStatus, CertificateSummary, IssuedCertificate, RevocationRecord};
use mwca_core::error::{CaError, Result};
use mwca_core::type_defs::SerialNumber;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::ports::VersionedStore;

/// 已签发证书与吊销记录；吊销只增不减
#[derive(Clone)]
pub struct RevocationRegistry {
    certificates: Arc<dyn VersionedStore<IssuedCertificate>>,
    revocations: Arc<dyn VersionedStore<RevocationRecord>>,
}

impl RevocationRegistry {
    pub fn new(
        certificates: Arc<dyn VersionedStore<IssuedCertificate>>,
        revocations: Arc<dyn VersionedStore<RevocationRecord>>,
    ) -> Self {
        Self {
            certificates,
            revocations,
        }
    }

    /// 序列号重复视为存储冲突
    pub async fn record_issued(&self, certificate: IssuedCertificate) -> Result<()> {
        let serial = certificate.serial_number.clone();
        if let Err(e) = self.certificates.create(serial.as_str(), certificate).await {
            if matches!(e, CaError::Conflict { .. }) {
                warn!(serial = %serial, "Duplicate certificate serial");
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn get(&self, serial: &SerialNumber) -> Result<IssuedCertificate> {
        self.certificates
            .get(serial.as_str())
            .await?
            .map(|v| v.value)
            .ok_or_else(|| CaError::UnknownSerial {
                serial_number: serial.to_string(),
            })
    }

    pub async fn is_revoked(&self, serial: &SerialNumber) -> Result<bool> {
        Ok(self.revocations.get(serial.as_str()).await?.is_some())
    }

    /// 幂等：重复吊销返回最初的记录
    pub async fn revoke(&self, serial: &SerialNumber, revoked_by: &str) -> Result<RevocationRecord> {
        let certificate = self.get(serial).await?;

        let record = RevocationRecord {
            serial_number: serial.clone(),
            revoked_at: Utc::now(),
            revoked_by: revoked_by.to_string(),
        };
        match self.revocations.create(serial.as_str(), record.clone()).await {
            Ok(_) => {
                info!(
                    serial = %serial,
                    cn = %certificate.subject_common_name,
                    revoked_by = %revoked_by,
                    "Certificate revoked"
                );
                Ok(record)
            }
            Err(CaError::Conflict { .. }) => self
                .revocations
                .get(serial.as_str())
                .await?
                .map(|v| v.value)
                .ok_or_else(|| CaError::storage(format!("revocation of {serial} vanished"))),
            Err(e) => Err(e),
        }
    }

    pub async fn revocation(&self, serial: &SerialNumber) -> Result<Option<RevocationRecord>> {
        Ok(self.revocations.get(serial.as_str()).await?.map(|v| v.value))
    }

    pub async fn status(&self, serial: &SerialNumber) -> Result<CertificateStatus> {
        self.status_at(serial, Utc::now()).await
    }

    pub async fn status_at(&self, serial: &SerialNumber, now: DateTime<Utc>) -> Result<CertificateStatus> {
        let certificate = self.get(serial).await?;
        let revoked = self.is_revoked(serial).await?;
        Ok(CertificateStatus::classify(revoked, certificate.expires_at, now))
    }

    /// 快照，按签发时间倒序
    pub async fn list(&self, filter: Option<CertificateStatus>) -> Result<Vec<CertificateSummary>> {
        let now = Utc::now();
        let revoked: HashSet<String> = self
            .revocations
            .list()
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        let mut summaries: Vec<CertificateSummary> = self
            .certificates
            .list()
            .await?
            .into_iter()
            .map(|(key, entry)| {
                let cert = entry.value;
                CertificateSummary {
                    status: CertificateStatus::classify(revoked.contains(&key), cert.expires_at, now),
                    serial_number: cert.serial_number,
                    subject_common_name: cert.subject_common_name,
                    issued_at: cert.issued_at,
                    expires_at: cert.expires_at,
                    issuer: cert.issuer,
                }
            })
            .filter(|s| filter.map_or(true, |f| s.status == f))
            .collect();
        summaries.sort_by(|a, b| {
            b.issued_at
                .cmp(&a.issued_at)
                .then_with(|| a.serial_number.cmp(&b.serial_number))
        });
        Ok(summaries)
    }
}
