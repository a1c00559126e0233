use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use mwca_core::caller::CallerIdentity;
use mwca_core::csr_types::CertificateStatus;
use mwca_core::type_defs::SerialNumber;
use mwca_server::CaService;
use std::path::{Path, PathBuf};

use crate::commands::{read_pem_input, write_output, PUBLIC_FILE_MODE};
use crate::ui::{
    certificate_status_cell, confirm_action, format_time, log_detail, new_table, print_header,
    print_info, print_success, print_warning,
};

#[derive(Subcommand, Debug)]
pub enum CertCommands {
    /// 列出已签发证书
    List {
        /// active | expired | revoked
        #[arg(long)]
        status: Option<CertificateStatus>,
    },
    /// 显示证书详情
    Show {
        serial: String,

        /// 只输出 PEM
        #[arg(long)]
        pem: bool,
    },
    /// 吊销证书（不可撤销）
    Revoke {
        serial: String,

        /// 操作人
        #[arg(long, env = "MWCA_PRINCIPAL")]
        by: String,

        /// 跳过确认
        #[arg(short, long)]
        yes: bool,
    },
    /// 用现有客户端证书换发新证书
    Renew {
        /// 新 CSR PEM 文件，`-` 表示标准输入
        #[arg(long)]
        csr: String,

        /// 当前持有的客户端证书（须由本 CA 签发）
        #[arg(long)]
        cert: PathBuf,

        /// 新证书输出文件（缺省标准输出）
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

pub async fn run_cert(service: &CaService, cmd: CertCommands) -> Result<()> {
    match cmd {
        CertCommands::List { status } => run_cert_list(service, status).await,
        CertCommands::Show { serial, pem } => {
            run_cert_show(service, &SerialNumber::parse(&serial)?, pem).await
        }
        CertCommands::Revoke { serial, by, yes } => {
            run_cert_revoke(service, &SerialNumber::parse(&serial)?, &by, yes).await
        }
        CertCommands::Renew { csr, cert, out } => run_cert_renew(service, &csr, &cert, out).await,
    }
}

async fn run_cert_list(service: &CaService, status: Option<CertificateStatus>) -> Result<()> {
    let certificates = service.list_issued_certificates(status).await?;
    if certificates.is_empty() {
        print_info("没有符合条件的证书");
        return Ok(());
    }

    let mut table = new_table(&["序列号", "CN", "状态", "签发时间", "到期时间", "来源"]);
    for cert in &certificates {
        table.add_row(vec![
            Cell::new(cert.serial_number.as_str()),
            Cell::new(&cert.subject_common_name),
            certificate_status_cell(cert.status),
            Cell::new(format_time(cert.issued_at)),
            Cell::new(format_time(cert.expires_at)),
            Cell::new(cert.issuer.to_string()),
        ]);
    }
    println!("{table}");
    println!("共 {} 张", certificates.len());
    Ok(())
}

async fn run_cert_show(service: &CaService, serial: &SerialNumber, pem_only: bool) -> Result<()> {
    let cert = service.get_certificate(serial).await?;
    if pem_only {
        return write_output(None, &cert.certificate_pem, PUBLIC_FILE_MODE);
    }

    let status = service.certificate_status(serial).await?;
    print_header(&format!("证书 {serial}"));
    log_detail("状态", status.as_str());
    log_detail("主体", &cert.subject_dn);
    log_detail("SHA-256 指纹", &cert.fingerprint_sha256);
    log_detail("签发时间", &format_time(cert.issued_at));
    log_detail("到期时间", &format_time(cert.expires_at));
    log_detail("来源", &cert.issuer.to_string());
    if let Some(record) = service.revocation(serial).await? {
        log_detail("吊销时间", &format_time(record.revoked_at));
        log_detail("吊销人", &record.revoked_by);
    }
    Ok(())
}

async fn run_cert_revoke(
    service: &CaService,
    serial: &SerialNumber,
    by: &str,
    yes: bool,
) -> Result<()> {
    let cert = service.get_certificate(serial).await?;
    if !yes
        && !confirm_action(&format!(
            "确认吊销 {} ({})？此操作不可撤销",
            serial, cert.subject_common_name
        ))
    {
        print_warning("已取消");
        return Ok(());
    }

    let record = service
        .revoke_certificate(serial, by)
        .await
        .with_context(|| format!("Failed to revoke {serial}"))?;
    print_success(&format!(
        "已吊销 {} ({})",
        style(serial).cyan(),
        cert.subject_common_name
    ));
    log_detail("吊销时间", &format_time(record.revoked_at));
    log_detail("吊销人", &record.revoked_by);
    Ok(())
}

async fn run_cert_renew(
    service: &CaService,
    csr_path: &str,
    cert_path: &Path,
    out: Option<PathBuf>,
) -> Result<()> {
    let csr_pem = read_pem_input(csr_path)?;
    let presented = std::fs::read_to_string(cert_path)
        .with_context(|| format!("Failed to read {}", cert_path.display()))?;

    let caller = CallerIdentity::from_client_certificate(&presented, service.ca().certificate_der())
        .context("Presented certificate was not issued by this CA")?;

    let issued = service
        .renew_certificate(&csr_pem, &caller)
        .await
        .with_context(|| format!("Renewal for {caller} failed"))?;

    write_output(out.as_deref(), &issued.certificate_pem, PUBLIC_FILE_MODE)?;
    if out.is_some() {
        print_success(&format!(
            "已换发 {}，序列号 {}",
            issued.subject_common_name,
            style(&issued.serial_number).cyan()
        ));
    }
    Ok(())
}
