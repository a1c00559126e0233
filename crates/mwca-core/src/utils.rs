//! 通用工具：随机数、PEM/DER 转换、指纹、原子落盘

use crate::error::{CaError, Result};
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| CaError::internal(format!("Failed to generate random bytes: {e}")))?;
    Ok(bytes)
}

pub fn hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out
}

/// 解析单个 PEM 块，校验标签
pub fn pem_to_der(pem_str: &str, expected_tag: &str) -> Result<Vec<u8>> {
    if pem_str.trim().is_empty() {
        return Err(CaError::malformed_csr("Empty PEM"));
    }
    let block = ::pem::parse(pem_str.as_bytes())
        .map_err(|e| CaError::malformed_csr(format!("Failed to parse PEM: {e}")))?;
    if block.tag() != expected_tag {
        return Err(CaError::malformed_csr(format!(
            "Unexpected PEM block {}, expected {expected_tag}",
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

pub fn der_to_pem(der: &[u8], tag: &str) -> String {
    ::pem::encode(&::pem::Pem::new(tag, der.to_vec()))
}

/// SHA-256 指纹（base64）
pub fn fingerprint_sha256(der: &[u8]) -> String {
    let hash = Sha256::digest(der);
    base64::engine::general_purpose::STANDARD.encode(hash)
}

fn reject_symlink(path: &Path) -> Result<()> {
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            return Err(CaError::storage(format!(
                "Refuse to write to symlink: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

/// 原子写文件：临时文件 + fsync + rename，拒绝符号链接
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    reject_symlink(path)?;

    let parent = path
        .parent()
        .ok_or_else(|| CaError::storage(format!("Missing parent dir for {}", path.display())))?;

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CaError::storage(format!("Invalid filename for {}", path.display())))?;

    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = parent.join(format!(".{file_name}.{nonce}.tmp"));

    reject_symlink(&tmp_path)?;

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(&tmp_path)
        .map_err(|e| CaError::from_io_with_path(e, &tmp_path))?;
    // 不受 umask 影响
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(|e| CaError::from_io_with_path(e, &tmp_path))?;
    }

    file.write_all(content)
        .map_err(|e| CaError::from_io_with_path(e, &tmp_path))?;
    file.sync_all()
        .map_err(|e| CaError::from_io_with_path(e, &tmp_path))?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        CaError::storage(format!(
            "Failed to rename {} -> {}: {e}",
            tmp_path.display(),
            path.display()
        ))
    })?;

    if let Ok(dir) = OpenOptions::new().read(true).open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}
