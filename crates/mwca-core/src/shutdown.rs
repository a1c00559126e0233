use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 优雅停机管理器
#[derive(Debug, Clone, Default)]
pub struct GracefulShutdown {
    /// 取消令牌，用于通知所有后台任务停止
    pub token: CancellationToken,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// 等待停机信号（SIGINT, SIGTERM），收到后取消令牌
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            biased;
            _ = ctrl_c => info!("Received Ctrl+C signal"),
            _ = terminate => info!("Received SIGTERM signal"),
            _ = self.token.cancelled() => info!("Shutdown requested"),
        }

        info!("Initiating graceful shutdown...");
        self.token.cancel();
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 程序内触发停机（测试与嵌入场景）
    pub fn trigger(&self) {
        self.token.cancel();
    }
}

/// 等待后台任务结束，超时后中止剩余任务
pub async fn wait_for_tasks_with_timeout(
    handles: Vec<tokio::task::JoinHandle<()>>,
    timeout: std::time::Duration,
) {
    info!(tasks = handles.len(), timeout_secs = timeout.as_secs(), "Waiting for background tasks");

    let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let result = tokio::time::timeout(timeout, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    if result.is_err() {
        warn!(
            remaining = abort_handles.len(),
            "Timeout waiting for tasks to complete, aborting remaining"
        );
        for h in abort_handles {
            h.abort();
        }
    }
}
