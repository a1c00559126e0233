pub mod ca;
pub mod cert;
pub mod request;
pub mod token;

use anyhow::{Context, Result};
use clap::Parser;
use mwca_core::config::MwcaConfig;
use mwca_core::utils::write_atomic;
use mwca_server::{CaService, KeyMaterial};

use crate::commands::ca::{run_ca, run_init, run_server, CaCommands};
use crate::commands::cert::{run_cert, CertCommands};
use crate::commands::request::{run_request, RequestCommands};
use crate::commands::token::{run_token, TokenCommands};

#[derive(Parser, Debug)]
#[command(
    name = "mwca",
    author,
    version,
    about = "MwAgent certificate authority",
    long_about = None,
    after_help = r#"Examples:
  # 初始化 CA（生成 4096 位 RSA 根密钥与自签证书）
  mwca init

  # 为主机 host1 上的 alice 签发 bootstrap token
  mwca token issue --cn host1_alice_J --hours 24 --by ops
  mwca token export <token> --format json --out bootstrap.token

  # 审批流程
  mwca request list --pending
  mwca request approve <request_id> --days 90 --by admin
  mwca request reject <request_id> --reason "unknown host" --by admin

  # 证书管理
  mwca cert list --status active
  mwca cert revoke <serial> --by admin

  # 常驻运行（定期清理过期 token）
  mwca run"#
)]
pub struct Cli {
    /// 配置文件路径（默认当前目录 mwca.toml）
    #[arg(long, value_name = "CONFIG_FILE", global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// 初始化或加载 CA 根密钥与证书
    Init,
    /// 启动 CA 引擎并保持运行，直到收到 SIGINT/SIGTERM
    Run,
    /// CA 证书
    Ca {
        #[command(subcommand)]
        cmd: CaCommands,
    },
    /// Bootstrap token 管理
    Token {
        #[command(subcommand)]
        cmd: TokenCommands,
    },
    /// 证书申请与审批
    Request {
        #[command(subcommand)]
        cmd: RequestCommands,
    },
    /// 已签发证书
    Cert {
        #[command(subcommand)]
        cmd: CertCommands,
    },
}

pub async fn run(cli: Cli, cfg: MwcaConfig) -> Result<()> {
    match cli.command {
        Commands::Init => run_init(&cfg).await,
        Commands::Run => run_server(&cfg).await,
        Commands::Ca { cmd } => run_ca(&open_service(&cfg).await?, cmd),
        Commands::Token { cmd } => run_token(&open_service(&cfg).await?, cmd).await,
        Commands::Request { cmd } => run_request(&open_service(&cfg).await?, cmd).await,
        Commands::Cert { cmd } => run_cert(&open_service(&cfg).await?, cmd).await,
    }
}

/// 管理子命令只使用已有 CA，不会隐式生成
async fn open_service(cfg: &MwcaConfig) -> Result<CaService> {
    let material = KeyMaterial::new(cfg.ca_dir(), cfg.ca.clone());
    if !material.key_path().exists() && !material.cert_path().exists() {
        anyhow::bail!(
            "CA 尚未初始化（{} 不存在），请先运行 `mwca init`",
            material.cert_path().display()
        );
    }
    let (service, _) = CaService::bootstrap(cfg)
        .await
        .context("Failed to open CA")?;
    Ok(service)
}

/// 读取 PEM 文件；`-` 表示标准输入
pub(crate) fn read_pem_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
            .context("Failed to read from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))
}

pub(crate) const PUBLIC_FILE_MODE: u32 = 0o644;
pub(crate) const SECRET_FILE_MODE: u32 = 0o600;

/// 原子写出到文件（指定权限）或标准输出
pub(crate) fn write_output(path: Option<&std::path::Path>, content: &str, mode: u32) -> Result<()> {
    match path {
        Some(p) => write_atomic(p, content.as_bytes(), mode)
            .with_context(|| format!("Failed to write {}", p.display())),
        None => {
            print!("{content}");
            if !content.ends_with('\n') {
                println!();
            }
            Ok(())
        }
    }
}
