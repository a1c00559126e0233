#![allow(dead_code)]

use mwca_core::config::{CaConfig, MwcaConfig};
use mwca_core::csr_types::CsrGenerator;
use mwca_server::infrastructure::key_material::{CA_CERT_FILE, CA_KEY_FILE};
use mwca_server::{CaOrigin, CaService, KeyMaterial};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::TempDir;
use x509_parser::prelude::*;

pub const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// 4096 位 RSA 生成较慢，每个测试二进制只生成一次，之后复制到各自目录
static SHARED_CA: OnceLock<TempDir> = OnceLock::new();

pub fn shared_ca_dir() -> &'static Path {
    SHARED_CA
        .get_or_init(|| {
            let dir = tempfile::tempdir().expect("tempdir");
            let (_, origin) = KeyMaterial::new(dir.path(), CaConfig::default())
                .initialize_blocking()
                .expect("generate shared CA");
            assert_eq!(origin, CaOrigin::Generated);
            dir
        })
        .path()
}

pub struct TestEnv {
    pub root: TempDir,
    pub config: MwcaConfig,
}

impl TestEnv {
    /// 文件存储 + 共享 CA
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let mut config = MwcaConfig::default();
        config.data_dir = root.path().to_path_buf();
        config.storage.backend = "file".to_string();

        let ca_dir = config.ca_dir();
        std::fs::create_dir_all(&ca_dir).expect("ca dir");
        for name in [CA_KEY_FILE, CA_CERT_FILE] {
            std::fs::copy(shared_ca_dir().join(name), ca_dir.join(name)).expect("copy CA");
        }
        Self { root, config }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.config.store_dir()
    }

    pub async fn open(&self) -> CaService {
        let (service, origin) = CaService::bootstrap(&self.config)
            .await
            .expect("bootstrap");
        assert_eq!(origin, CaOrigin::Loaded);
        service
    }
}

pub fn csr(host: &str, user: &str) -> String {
    CsrGenerator::new()
        .expect("key")
        .generate_csr(host, user, Some("agent"))
        .expect("csr")
}

pub fn csr_with_cn(common_name: &str) -> String {
    CsrGenerator::new()
        .expect("key")
        .generate_csr_with_cn(common_name, None)
        .expect("csr")
}

/// 证书由 CA 签发：issuer 与 CA 主体一致且签名可用 CA 公钥验证
pub fn assert_signed_by(cert_pem: &str, ca_pem: &str) {
    let cert_der = mwca_core::utils::pem_to_der(cert_pem, "CERTIFICATE").expect("cert pem");
    let ca_der = mwca_core::utils::pem_to_der(ca_pem, "CERTIFICATE").expect("ca pem");
    let (_, cert) = X509Certificate::from_der(&cert_der).expect("cert der");
    let (_, ca) = X509Certificate::from_der(&ca_der).expect("ca der");

    assert_eq!(cert.issuer(), ca.subject());
    cert.verify_signature(Some(ca.public_key()))
        .expect("certificate must verify against the CA key");
    assert!(!cert.is_ca());
}
