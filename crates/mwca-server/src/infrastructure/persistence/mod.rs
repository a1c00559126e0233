pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use mwca_core::config::MwcaConfig;
use mwca_core::csr_types::{BootstrapToken, CertificateRequest, IssuedCertificate, RevocationRecord};
use mwca_core::error::{CaError, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::application::ports::VersionedStore;

/// CA 引擎使用的四张表
#[derive(Clone)]
pub struct Stores {
    pub tokens: Arc<dyn VersionedStore<BootstrapToken>>,
    pub requests: Arc<dyn VersionedStore<CertificateRequest>>,
    pub certificates: Arc<dyn VersionedStore<IssuedCertificate>>,
    pub revocations: Arc<dyn VersionedStore<RevocationRecord>>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            tokens: Arc::new(MemoryStore::new()),
            requests: Arc::new(MemoryStore::new()),
            certificates: Arc::new(MemoryStore::new()),
            revocations: Arc::new(MemoryStore::new()),
        }
    }

    /// `{dir}/tokens.json` 等四个 JSON 文件
    pub fn open_json(dir: &Path) -> Result<Self> {
        Ok(Self {
            tokens: Arc::new(JsonFileStore::open(dir.join("tokens.json"))?),
            requests: Arc::new(JsonFileStore::open(dir.join("requests.json"))?),
            certificates: Arc::new(JsonFileStore::open(dir.join("certificates.json"))?),
            revocations: Arc::new(JsonFileStore::open(dir.join("revocations.json"))?),
        })
    }

    pub fn from_config(cfg: &MwcaConfig) -> Result<Self> {
        match cfg.storage.backend.as_str() {
            "file" => {
                let dir = cfg.store_dir();
                info!(dir = %dir.display(), "Using JSON file stores");
                Self::open_json(&dir)
            }
            "memory" => {
                info!("Using in-memory stores; state is lost on exit");
                Ok(Self::in_memory())
            }
            other => Err(CaError::config_error(format!(
                "unknown storage backend: {other}"
            ))),
        }
    }
}
