use anyhow::{Context, Result};
use clap::Subcommand;
use console::style;
use mwca_core::config::MwcaConfig;
use mwca_core::shutdown::{wait_for_tasks_with_timeout, GracefulShutdown};
use mwca_server::{CaIdentity, CaOrigin, CaService, KeyMaterial, Stores, TokenSweeper};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::commands::{write_output, PUBLIC_FILE_MODE};
use crate::ui::{
    create_spinner, format_time, log_detail, print_header, print_info, print_next_step,
    print_success,
};

#[derive(Subcommand, Debug)]
pub enum CaCommands {
    /// 输出 CA 证书 PEM（agent 用于校验服务端与自身证书）
    Show {
        /// 只显示主体、指纹与有效期
        #[arg(long)]
        info: bool,

        /// 写入文件而不是标准输出
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

pub fn run_ca(service: &CaService, cmd: CaCommands) -> Result<()> {
    match cmd {
        CaCommands::Show { info: true, .. } => {
            print_header("CA 证书");
            print_identity(service.ca());
            Ok(())
        }
        CaCommands::Show { out, .. } => {
            write_output(out.as_deref(), service.get_ca_certificate(), PUBLIC_FILE_MODE)
        }
    }
}

pub async fn run_init(cfg: &MwcaConfig) -> Result<()> {
    print_header("初始化 CA");

    let material = KeyMaterial::new(cfg.ca_dir(), cfg.ca.clone());
    let key_path = material.key_path();
    let cert_path = material.cert_path();

    let spinner = create_spinner(&format!(
        "加载或生成 CA 根密钥（RSA {} 位，首次生成可能需要数秒）...",
        cfg.ca.key_bits
    ));
    let result = material.initialize().await;
    spinner.finish_and_clear();
    let (identity, origin) = result.context("CA initialization failed")?;

    Stores::from_config(cfg).context("Failed to open stores")?;

    match origin {
        CaOrigin::Generated => print_success("已生成新的 CA"),
        CaOrigin::Loaded => print_info("CA 已存在，沿用现有密钥与证书"),
    }
    print_identity(&identity);
    log_detail("私钥", &key_path.display().to_string());
    log_detail("证书", &cert_path.display().to_string());

    println!();
    print_next_step(&format!(
        "为 agent 签发 token: {}",
        style("mwca token issue --cn <host>_<user>_J").cyan()
    ));
    Ok(())
}

/// 启动屏障完成后运行 token 清理任务，直到收到停机信号
pub async fn run_server(cfg: &MwcaConfig) -> Result<()> {
    let (service, origin) = CaService::bootstrap(cfg)
        .await
        .context("CA startup failed")?;
    info!(
        origin = ?origin,
        subject = %service.ca().subject_dn(),
        fingerprint = %service.ca().fingerprint_sha256(),
        "CA engine ready"
    );

    let shutdown = GracefulShutdown::new();
    let policy = service.token_policy();
    let sweeper = TokenSweeper::new(
        service.token_store(),
        Duration::from_secs(policy.sweep_interval_sec),
        chrono::Duration::hours(i64::from(policy.prune_grace_hours)),
        shutdown.child_token(),
    );
    let handles = vec![sweeper.spawn()];

    shutdown.wait_for_signal().await;
    wait_for_tasks_with_timeout(handles, Duration::from_secs(10)).await;
    info!("mwca stopped");
    Ok(())
}

fn print_identity(identity: &CaIdentity) {
    log_detail("主体", identity.subject_dn());
    log_detail("SHA-256 指纹", identity.fingerprint_sha256());
    log_detail("有效期至", &format_time(identity.not_after()));
}
