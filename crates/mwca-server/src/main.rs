use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use mwca_core::config::MwcaConfig;

mod commands;
mod ui;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = commands::Cli::parse();

    // 统一从 mwca.toml 加载配置
    let cfg = MwcaConfig::load_config(cli.config.as_deref())
        .with_context(|| "无法加载 mwca.toml 配置文件，请检查文件是否存在或路径是否正确。")?;

    mwca_core::telemetry::init_tracing_with(&cfg.telemetry.to_log_config());
    match cli.config.as_deref() {
        Some(path) => tracing::debug!(path, "Loaded config file"),
        None => tracing::debug!("Config: using default search (current dir)"),
    }

    if let Err(e) = commands::run(cli, cfg).await {
        eprintln!("{} {:#}", style("错误:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
