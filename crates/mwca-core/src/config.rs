//! mwca 统一配置：默认值 → mwca.toml → MWCA__ 环境变量

use crate::telemetry::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "mwca.toml";
pub const ENV_PREFIX: &str = "MWCA__";
pub const MIN_CA_KEY_BITS: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MwcaConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub ca: CaConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for MwcaConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            telemetry: TelemetryConfig::default(),
            ca: CaConfig::default(),
            issuance: IssuanceConfig::default(),
            tokens: TokensConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl MwcaConfig {
    /// 从指定路径或当前目录中的 mwca.toml 加载配置；支持 MWCA__SECTION__KEY 环境变量覆盖
    pub fn load_config(path: Option<&str>) -> Result<Self, anyhow::Error> {
        use figment::providers::{Env, Format, Serialized, Toml};
        use figment::Figment;

        let mut figment = Figment::from(Serialized::defaults(MwcaConfig::default()));

        let cwd = || std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let base_dir = match path {
            Some(p) => {
                let p = Path::new(p);
                if !p.exists() {
                    return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
                }
                figment = figment.merge(Toml::file(p));
                match p.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                    _ => cwd(),
                }
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    figment = figment.merge(Toml::file(default_path));
                }
                cwd()
            }
        };

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut cfg: MwcaConfig = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load config via Figment: {}", e))?;

        cfg.resolve_relative_paths(&base_dir);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.ca.key_bits < MIN_CA_KEY_BITS {
            return Err(anyhow::anyhow!(
                "ca.key_bits must be at least {MIN_CA_KEY_BITS}, got {}",
                self.ca.key_bits
            ));
        }
        if self.ca.validity_days == 0 {
            return Err(anyhow::anyhow!("ca.validity_days must be positive"));
        }
        if self.ca.common_name.trim().is_empty() {
            return Err(anyhow::anyhow!("ca.common_name must not be empty"));
        }

        let issuance = &self.issuance;
        if issuance.max_validity_days == 0 {
            return Err(anyhow::anyhow!("issuance.max_validity_days must be positive"));
        }
        if issuance.default_validity_days == 0
            || issuance.default_validity_days > issuance.max_validity_days
        {
            return Err(anyhow::anyhow!(
                "issuance.default_validity_days must be between 1 and {}",
                issuance.max_validity_days
            ));
        }
        if issuance.renewal_validity_days == 0
            || issuance.renewal_validity_days > issuance.max_validity_days
        {
            return Err(anyhow::anyhow!(
                "issuance.renewal_validity_days must be between 1 and {}",
                issuance.max_validity_days
            ));
        }

        if self.tokens.default_validity_hours == 0 {
            return Err(anyhow::anyhow!("tokens.default_validity_hours must be positive"));
        }
        if self.tokens.sweep_interval_sec < 10 {
            return Err(anyhow::anyhow!("tokens.sweep_interval_sec must be at least 10"));
        }

        if !matches!(self.storage.backend.as_str(), "file" | "memory") {
            return Err(anyhow::anyhow!(
                "storage.backend must be 'file' or 'memory', got '{}'",
                self.storage.backend
            ));
        }

        if !matches!(
            self.telemetry.log_format.to_ascii_lowercase().as_str(),
            "text" | "json"
        ) {
            return Err(anyhow::anyhow!(
                "telemetry.log_format must be 'text' or 'json', got '{}'",
                self.telemetry.log_format
            ));
        }

        Ok(())
    }

    pub fn resolve_relative_paths(&mut self, base_dir: &Path) {
        fn make_absolute(path: &mut PathBuf, base: &Path) {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }

        make_absolute(&mut self.data_dir, base_dir);
        if let Some(dir) = self.ca.dir.as_mut() {
            make_absolute(dir, base_dir);
        }
    }

    /// CA 材料目录，未配置时为 `{data_dir}/ca`
    pub fn ca_dir(&self) -> PathBuf {
        self.ca
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ca"))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub log_no_ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_no_ansi: false,
        }
    }
}

impl TelemetryConfig {
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format.clone(),
            no_ansi: self.log_no_ansi,
        }
    }
}

/// 根 CA 参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaConfig {
    /// ca.key / ca.crt 所在目录
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_ca_key_bits")]
    pub key_bits: u32,
    #[serde(default = "default_ca_validity_days")]
    pub validity_days: u32,
    #[serde(default = "default_ca_country")]
    pub country: String,
    #[serde(default = "default_ca_organization")]
    pub organization: String,
    #[serde(default = "default_ca_organizational_unit")]
    pub organizational_unit: String,
    #[serde(default = "default_ca_common_name")]
    pub common_name: String,
    #[serde(default)]
    pub path_len: u8,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            dir: None,
            key_bits: default_ca_key_bits(),
            validity_days: default_ca_validity_days(),
            country: default_ca_country(),
            organization: default_ca_organization(),
            organizational_unit: default_ca_organizational_unit(),
            common_name: default_ca_common_name(),
            path_len: 0,
        }
    }
}

/// 叶子证书签发策略
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IssuanceConfig {
    #[serde(default = "default_validity_days")]
    pub default_validity_days: u32,
    #[serde(default = "default_max_validity_days")]
    pub max_validity_days: u32,
    #[serde(default = "default_validity_days")]
    pub renewal_validity_days: u32,
    /// 提交时是否要求 CSR 携带 OU
    #[serde(default)]
    pub require_usertype: bool,
    /// 写入导出 token 文件的服务地址
    #[serde(default = "default_ca_server_url")]
    pub ca_server_url: String,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            default_validity_days: default_validity_days(),
            max_validity_days: default_max_validity_days(),
            renewal_validity_days: default_validity_days(),
            require_usertype: false,
            ca_server_url: default_ca_server_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TokensConfig {
    #[serde(default = "default_token_validity_hours")]
    pub default_validity_hours: u32,
    #[serde(default = "default_sweep_interval_sec")]
    pub sweep_interval_sec: u64,
    /// 过期未使用的 token 在此宽限期之后才会被清理
    #[serde(default = "default_prune_grace_hours")]
    pub prune_grace_hours: u32,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            default_validity_hours: default_token_validity_hours(),
            sweep_interval_sec: default_sweep_interval_sec(),
            prune_grace_hours: default_prune_grace_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// file | memory
    #[serde(default = "default_storage_backend")]
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
        }
    }
}

// --- Default value functions ---

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_ca_key_bits() -> u32 {
    MIN_CA_KEY_BITS
}

fn default_ca_validity_days() -> u32 {
    3650
}

fn default_ca_country() -> String {
    "KR".to_string()
}

fn default_ca_organization() -> String {
    "Leebalso".to_string()
}

fn default_ca_organizational_unit() -> String {
    "CA".to_string()
}

fn default_ca_common_name() -> String {
    "MwAgent Root CA".to_string()
}

fn default_validity_days() -> u32 {
    90
}

fn default_max_validity_days() -> u32 {
    825
}

fn default_ca_server_url() -> String {
    "https://localhost:5000".to_string()
}

fn default_token_validity_hours() -> u32 {
    24
}

fn default_sweep_interval_sec() -> u64 {
    3600
}

fn default_prune_grace_hours() -> u32 {
    168
}

fn default_storage_backend() -> String {
    "file".to_string()
}
