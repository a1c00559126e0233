use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::infrastructure::services::token_store::BootstrapTokenStore;

/// 定期清理长时间过期且从未使用的 bootstrap token
#[derive(Clone)]
pub struct TokenSweeper {
    tokens: BootstrapTokenStore,
    interval: Duration,
    grace: chrono::Duration,
    shutdown_token: CancellationToken,
}

impl TokenSweeper {
    pub fn new(
        tokens: BootstrapTokenStore,
        interval: Duration,
        grace: chrono::Duration,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            tokens,
            interval,
            grace,
            shutdown_token,
        }
    }

    /// 后台运行直到取消
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// 单次清理；失败只记录日志，下个周期重试
    pub async fn sweep_once(&self) -> usize {
        match self.tokens.prune(Utc::now(), self.grace).await {
            Ok(removed) => {
                debug!(removed, "Token sweep finished");
                removed
            }
            Err(e) => {
                warn!(error = %e, "Token sweep failed");
                0
            }
        }
    }

    async fn run(self) {
        info!(
            interval_sec = self.interval.as_secs(),
            grace_hours = self.grace.num_hours(),
            "Starting bootstrap token sweeper"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Bootstrap token sweeper stopped");
                    break;
                }
            }
        }
    }
}
