use chrono::{DateTime, Duration, Utc};
use mwca_core::csr_types::{render_token_file, BootstrapToken, TokenExportFormat};
use mwca_core::error::{CaError, RedeemError, Result};
use mwca_core::identity::parse_common_name;
use mwca_core::type_defs::TokenId;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::ports::VersionedStore;

const MAX_ID_ATTEMPTS: usize = 3;

/// 一次性 bootstrap token 的签发与兑换
#[derive(Clone)]
pub struct BootstrapTokenStore {
    store: Arc<dyn VersionedStore<BootstrapToken>>,
}

impl BootstrapTokenStore {
    pub fn new(store: Arc<dyn VersionedStore<BootstrapToken>>) -> Self {
        Self { store }
    }

    pub async fn issue(
        &self,
        expected_common_name: Option<String>,
        validity: Duration,
        allowed_source_ips: Option<BTreeSet<IpAddr>>,
        created_by: &str,
        comment: &str,
    ) -> Result<BootstrapToken> {
        if let Some(cn) = expected_common_name.as_deref() {
            parse_common_name(cn)?;
        }
        if created_by.trim().is_empty() {
            return Err(CaError::invalid_argument("created_by must not be empty"));
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let token = BootstrapToken::new(
                expected_common_name.clone(),
                validity,
                allowed_source_ips.clone(),
                created_by,
                comment,
                Utc::now(),
            )?;
            match self.store.create(token.token_id.as_str(), token.clone()).await {
                Ok(_) => {
                    info!(
                        token = %token.token_id.redacted(),
                        expected_cn = ?token.expected_common_name,
                        expires_at = %token.expires_at,
                        created_by = %token.created_by,
                        "Bootstrap token issued"
                    );
                    return Ok(token);
                }
                Err(CaError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CaError::internal("Failed to allocate a unique bootstrap token id"))
    }

    /// 查找、过期、已用、来源、身份检查与 used 写入是一个原子单元
    pub async fn redeem(
        &self,
        token_id: &TokenId,
        presented_common_name: &str,
        source_ip: IpAddr,
    ) -> Result<BootstrapToken> {
        loop {
            let now = Utc::now();
            let Some(current) = self.store.get(token_id.as_str()).await? else {
                warn!(token = %token_id.redacted(), %source_ip, "Unknown bootstrap token");
                return Err(RedeemError::NotFound.into());
            };

            if let Err(reason) = current
                .value
                .check_redeemable(now, presented_common_name, source_ip)
            {
                warn!(
                    token = %token_id.redacted(),
                    cn = %presented_common_name,
                    %source_ip,
                    reason = %reason,
                    "Bootstrap token rejected"
                );
                return Err(reason.into());
            }

            let mut consumed = current.value.clone();
            consumed.mark_used(now, presented_common_name, source_ip);
            match self
                .store
                .update(token_id.as_str(), consumed.clone(), current.revision)
                .await
            {
                Ok(_) => {
                    info!(
                        token = %token_id.redacted(),
                        cn = %presented_common_name,
                        %source_ip,
                        "Bootstrap token redeemed"
                    );
                    return Ok(consumed);
                }
                Err(CaError::Conflict { .. }) => {
                    debug!(token = %token_id.redacted(), "Lost redeem race, re-reading");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get(&self, token_id: &TokenId) -> Result<BootstrapToken> {
        self.store
            .get(token_id.as_str())
            .await?
            .map(|v| v.value)
            .ok_or_else(|| CaError::TokenNotFound {
                token_id: token_id.redacted(),
            })
    }

    /// 快照，按创建时间倒序
    pub async fn list(&self) -> Result<Vec<BootstrapToken>> {
        let mut tokens: Vec<_> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|(_, v)| v.value)
            .collect();
        tokens.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tokens)
    }

    pub async fn export(
        &self,
        token_id: &TokenId,
        format: TokenExportFormat,
        ca_server_url: &str,
    ) -> Result<String> {
        let token = self.get(token_id).await?;
        render_token_file(&token, format, ca_server_url)
    }

    /// 删除过期超过 `grace` 且从未使用的 token；已使用的 token 保留作审计
    pub async fn prune(&self, now: DateTime<Utc>, grace: Duration) -> Result<usize> {
        let mut removed = 0;
        for (key, entry) in self.store.list().await? {
            let token = &entry.value;
            if token.is_used() || token.expires_at + grace >= now {
                continue;
            }
            match self.store.delete(&key, entry.revision).await {
                Ok(()) => removed += 1,
                // 期间被兑换或修改，下轮再判断
                Err(CaError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        if removed > 0 {
            info!(removed, "Pruned expired bootstrap tokens");
        }
        Ok(removed)
    }
}
