use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Cell;
use console::style;
use mwca_core::csr_types::{CertificateRequest, RequestStatus};
use mwca_core::type_defs::RequestId;
use mwca_core::utils::write_atomic;
use mwca_server::CaService;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::commands::{read_pem_input, PUBLIC_FILE_MODE};
use crate::ui::{
    format_time, log_detail, new_table, print_header, print_info, print_next_step,
    print_success, request_status_cell, truncate,
};

#[derive(Subcommand, Debug)]
pub enum RequestCommands {
    /// 以 agent 身份提交 CSR（本地接入或测试用）
    Submit(RequestSubmitArgs),
    /// 查询申请状态；已批准时可写出证书
    Status {
        request_id: String,

        /// 已批准时把 client.crt 与 ca.crt 写入该目录
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 列出申请
    List {
        /// 只显示待审批
        #[arg(long)]
        pending: bool,
    },
    /// 批准并签发证书
    Approve {
        request_id: String,

        /// 证书有效期（天），缺省取配置 issuance.default_validity_days
        #[arg(long)]
        days: Option<u32>,

        #[arg(long, default_value = "")]
        comment: String,

        /// 审批人
        #[arg(long, env = "MWCA_PRINCIPAL")]
        by: String,
    },
    /// 拒绝申请
    Reject {
        request_id: String,

        #[arg(long)]
        reason: String,

        /// 审批人
        #[arg(long, env = "MWCA_PRINCIPAL")]
        by: String,
    },
}

#[derive(Parser, Debug)]
pub struct RequestSubmitArgs {
    /// CSR PEM 文件，`-` 表示标准输入
    #[arg(long)]
    csr: String,

    /// bootstrap token
    #[arg(long)]
    token: String,

    /// 记录的来源地址
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    source_ip: IpAddr,

    /// agent 信息（JSON 对象）
    #[arg(long)]
    agent_info: Option<String>,
}

pub async fn run_request(service: &CaService, cmd: RequestCommands) -> Result<()> {
    match cmd {
        RequestCommands::Submit(args) => run_request_submit(service, args).await,
        RequestCommands::Status {
            request_id,
            out_dir,
            json,
        } => run_request_status(service, &RequestId::new(request_id), out_dir, json).await,
        RequestCommands::List { pending } => run_request_list(service, pending).await,
        RequestCommands::Approve {
            request_id,
            days,
            comment,
            by,
        } => {
            let request_id = RequestId::new(request_id);
            let issued = service
                .approve_request(&request_id, &by, days, &comment)
                .await
                .with_context(|| format!("Failed to approve {request_id}"))?;
            print_success(&format!("已批准 {}", style(&request_id).cyan()));
            log_detail("CN", &issued.subject_common_name);
            log_detail("序列号", issued.serial_number.as_str());
            log_detail("有效期至", &format_time(issued.expires_at));
            Ok(())
        }
        RequestCommands::Reject {
            request_id,
            reason,
            by,
        } => {
            let request_id = RequestId::new(request_id);
            service
                .reject_request(&request_id, &by, &reason)
                .await
                .with_context(|| format!("Failed to reject {request_id}"))?;
            print_success(&format!("已拒绝 {}", style(&request_id).cyan()));
            Ok(())
        }
    }
}

async fn run_request_submit(service: &CaService, args: RequestSubmitArgs) -> Result<()> {
    let csr_pem = read_pem_input(&args.csr)?;
    let agent_info = match args.agent_info.as_deref() {
        Some(raw) => serde_json::from_str(raw).context("--agent-info is not valid JSON")?,
        None => serde_json::Value::Null,
    };

    let request_id = service
        .submit_certificate_request(&csr_pem, &args.token, args.source_ip, agent_info)
        .await
        .context("Certificate request was not accepted")?;

    print_success(&format!("申请已提交: {}", style(&request_id).cyan().bold()));
    print_next_step(&format!("等待审批: mwca request approve {request_id}"));
    Ok(())
}

async fn run_request_status(
    service: &CaService,
    request_id: &RequestId,
    out_dir: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let view = service.get_certificate_request_status(request_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        let request = service.get_request(request_id).await?;
        print_header(&format!("申请 {request_id}"));
        print_request_details(&request);
    }

    if let Some(dir) = out_dir {
        match (&view.certificate_pem, &view.ca_certificate_pem) {
            (Some(cert), Some(ca)) => {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
                write_atomic(&dir.join("client.crt"), cert.as_bytes(), PUBLIC_FILE_MODE)?;
                write_atomic(&dir.join("ca.crt"), ca.as_bytes(), PUBLIC_FILE_MODE)?;
                print_success(&format!("证书已写入 {}", dir.display()));
            }
            _ => print_info(&format!("申请状态为 {}，没有可写出的证书", view.status)),
        }
    }
    Ok(())
}

fn print_request_details(request: &CertificateRequest) {
    log_detail("状态", request.status.as_str());
    log_detail("CN", &request.subject.common_name);
    if let Some(ou) = &request.subject.organizational_unit {
        log_detail("OU", ou);
    }
    log_detail("来源", &request.source_ip.to_string());
    log_detail("提交时间", &format_time(request.submitted_at));
    match request.status {
        RequestStatus::PendingApproval => {}
        RequestStatus::Approved => {
            if let Some(serial) = &request.serial_number {
                log_detail("序列号", serial.as_str());
            }
            if let Some(by) = &request.approved_by {
                log_detail("审批人", by);
            }
            if let Some(expires_at) = request.expires_at {
                log_detail("有效期至", &format_time(expires_at));
            }
        }
        RequestStatus::Rejected => {
            if let Some(by) = &request.rejected_by {
                log_detail("审批人", by);
            }
            if let Some(reason) = &request.reject_reason {
                log_detail("原因", reason);
            }
        }
    }
    if !request.agent_info.is_null() {
        log_detail("agent", &request.agent_info.to_string());
    }
}

async fn run_request_list(service: &CaService, pending: bool) -> Result<()> {
    let requests = if pending {
        service.list_pending_requests().await?
    } else {
        service.list_requests().await?
    };

    if requests.is_empty() {
        print_info(if pending {
            "没有待审批的申请"
        } else {
            "没有证书申请"
        });
        return Ok(());
    }

    let mut table = new_table(&["REQUEST ID", "CN", "状态", "来源", "提交时间", "agent"]);
    for request in &requests {
        table.add_row(vec![
            Cell::new(request.request_id.as_str()),
            Cell::new(&request.subject.common_name),
            request_status_cell(request.status),
            Cell::new(request.source_ip.to_string()),
            Cell::new(format_time(request.submitted_at)),
            Cell::new(truncate(&request.agent_info.to_string(), 40)),
        ]);
    }
    println!("{table}");
    println!("共 {} 个", requests.len());
    Ok(())
}
