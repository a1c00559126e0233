use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use console::style;
use mwca_core::csr_types::{BootstrapToken, TokenExportFormat};
use mwca_core::type_defs::TokenId;
use mwca_server::CaService;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::commands::{write_output, SECRET_FILE_MODE};
use crate::ui::{
    format_time, log_detail, new_table, print_header, print_info, print_next_step, print_success,
    print_warning,
};

#[derive(Subcommand, Debug)]
pub enum TokenCommands {
    /// 签发一次性 bootstrap token
    Issue(TokenIssueArgs),
    /// 列出 token
    List {
        /// 同时显示已使用与已过期的 token
        #[arg(short, long)]
        all: bool,
    },
    /// 导出交付给 agent 的 token 文件
    Export(TokenExportArgs),
    /// 清理过期且从未使用的 token
    Prune,
}

#[derive(Parser, Debug)]
pub struct TokenIssueArgs {
    /// 绑定的证书 CN，格式 {hostname}_{username}_J
    #[arg(long, value_name = "CN")]
    cn: Option<String>,

    /// 有效期（小时），缺省取配置 tokens.default_validity_hours
    #[arg(long)]
    hours: Option<u32>,

    /// 允许兑换的来源地址（可重复）
    #[arg(long = "allow-ip", value_name = "IP", action = clap::ArgAction::Append)]
    allow_ip: Vec<IpAddr>,

    /// 备注
    #[arg(long, default_value = "")]
    comment: String,

    /// 操作人
    #[arg(long, env = "MWCA_PRINCIPAL")]
    by: String,
}

#[derive(Parser, Debug)]
pub struct TokenExportArgs {
    /// token 值
    token: String,

    /// text | json
    #[arg(long, default_value = "text")]
    format: TokenExportFormat,

    /// 写入 token 文件的 CA 服务地址，缺省取配置 issuance.ca_server_url
    #[arg(long)]
    url: Option<String>,

    /// 输出文件（缺省标准输出）
    #[arg(short, long)]
    out: Option<PathBuf>,
}

pub async fn run_token(service: &CaService, cmd: TokenCommands) -> Result<()> {
    match cmd {
        TokenCommands::Issue(args) => run_token_issue(service, args).await,
        TokenCommands::List { all } => run_token_list(service, all).await,
        TokenCommands::Export(args) => run_token_export(service, args).await,
        TokenCommands::Prune => {
            let removed = service.prune_bootstrap_tokens().await?;
            print_success(&format!("已清理 {removed} 个过期 token"));
            Ok(())
        }
    }
}

async fn run_token_issue(service: &CaService, args: TokenIssueArgs) -> Result<()> {
    let allowed: Option<BTreeSet<IpAddr>> =
        (!args.allow_ip.is_empty()).then(|| args.allow_ip.into_iter().collect());

    let token = service
        .issue_bootstrap_token(args.cn, args.hours, allowed, &args.comment, &args.by)
        .await
        .context("Failed to issue bootstrap token")?;

    print_header("Bootstrap token");
    println!("  {}", style(token.token_id.as_str()).green().bold());
    println!();
    log_detail("CN", token.expected_common_name.as_deref().unwrap_or("(任意)"));
    log_detail("过期时间", &format_time(token.expires_at));
    if let Some(ips) = &token.allowed_source_ips {
        let ips: Vec<String> = ips.iter().map(ToString::to_string).collect();
        log_detail("来源限制", &ips.join(", "));
    }
    println!();
    print_warning("请妥善保管 token：持有者可凭它提交一次证书申请");
    print_next_step(&format!(
        "导出给 agent: mwca token export {} --format json --out bootstrap.token",
        token.token_id.as_str()
    ));
    Ok(())
}

async fn run_token_list(service: &CaService, all: bool) -> Result<()> {
    let tokens: Vec<BootstrapToken> = service
        .list_bootstrap_tokens()
        .await?
        .into_iter()
        .filter(|t| all || t.is_valid())
        .collect();

    if tokens.is_empty() {
        print_info("没有可显示的 token");
        return Ok(());
    }

    let mut table = new_table(&["TOKEN", "CN", "状态", "过期时间", "创建人", "备注"]);
    for token in &tokens {
        table.add_row(vec![
            Cell::new(token.token_id.as_str()),
            Cell::new(token.expected_common_name.as_deref().unwrap_or("-")),
            token_state_cell(token),
            Cell::new(format_time(token.expires_at)),
            Cell::new(&token.created_by),
            Cell::new(&token.comment),
        ]);
    }
    println!("{table}");
    println!("共 {} 个", tokens.len());
    Ok(())
}

fn token_state_cell(token: &BootstrapToken) -> Cell {
    if let Some(cn) = &token.used_by_common_name {
        Cell::new(format!("used by {cn}")).fg(Color::DarkGrey)
    } else if token.is_expired_at(chrono::Utc::now()) {
        Cell::new("expired").fg(Color::Red)
    } else {
        Cell::new("valid").fg(Color::Green)
    }
}

async fn run_token_export(service: &CaService, args: TokenExportArgs) -> Result<()> {
    let content = service
        .export_bootstrap_token(&TokenId::new(args.token), args.format, args.url.as_deref())
        .await?;
    write_output(args.out.as_deref(), &content, SECRET_FILE_MODE)?;
    if let Some(path) = &args.out {
        print_success(&format!("已写入 {}", path.display()));
    }
    Ok(())
}
