//! 统一错误处理系统

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 主体身份解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityError {
    #[error("Malformed subject {common_name:?}: {reason}")]
    MalformedSubject {
        common_name: Option<String>,
        reason: String,
    },

    #[error("Missing subject attribute: {attribute}")]
    MissingAttribute { attribute: String },
}

impl IdentityError {
    pub fn malformed(common_name: Option<&str>, reason: impl Into<String>) -> Self {
        IdentityError::MalformedSubject {
            common_name: common_name.map(str::to_string),
            reason: reason.into(),
        }
    }
}

/// Bootstrap token 兑换错误
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedeemError {
    #[error("Bootstrap token not found")]
    NotFound,

    #[error("Bootstrap token expired")]
    Expired,

    #[error("Bootstrap token already used")]
    AlreadyUsed,

    #[error("Common name mismatch: expected {expected}, presented {presented}")]
    SubjectMismatch { expected: String, presented: String },

    #[error("Source address {source_ip} is not allowed for this token")]
    SourceNotAllowed { source_ip: String },
}

/// 错误分类，决定调用方如何呈现与是否重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Validation,
    Authorization,
    State,
    NotFound,
    Signing,
    Storage,
    Config,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::State => "state",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Signing => "signing",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Config => "config",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// 核心错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum CaError {
    // === 校验错误 ===
    #[error("Invalid CSR: {message}")]
    MalformedCsr { message: String },

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    // === 授权错误 ===
    #[error(transparent)]
    Token(#[from] RedeemError),

    #[error("Identity mismatch: caller {caller} does not match CSR {requested}")]
    IdentityMismatch { caller: String, requested: String },

    #[error("Certificate {serial_number} has been revoked")]
    CertificateRevoked { serial_number: String },

    #[error("Client certificate rejected: {message}")]
    UntrustedClientCertificate { message: String },

    // === 状态错误 ===
    #[error("Request {request_id} is already {status}")]
    InvalidTransition { request_id: String, status: String },

    // === 未找到 ===
    #[error("Certificate request not found: {request_id}")]
    RequestNotFound { request_id: String },

    #[error("Bootstrap token not found: {token_id}")]
    TokenNotFound { token_id: String },

    #[error("Unknown certificate serial: {serial_number}")]
    UnknownSerial { serial_number: String },

    // === 签名错误 ===
    #[error("Signing failed: {message}")]
    Signing { message: String },

    // === 存储错误 ===
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Concurrent modification of {key}")]
    Conflict { key: String },

    #[error("Key material error: {message}")]
    KeyMaterial { message: String },

    // === 配置与内部错误 ===
    #[error("Config error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CaError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CaError::MalformedCsr { .. }
            | CaError::Identity(_)
            | CaError::InvalidArgument { .. } => ErrorCategory::Validation,
            CaError::Token(_)
            | CaError::IdentityMismatch { .. }
            | CaError::CertificateRevoked { .. }
            | CaError::UntrustedClientCertificate { .. } => ErrorCategory::Authorization,
            CaError::InvalidTransition { .. } => ErrorCategory::State,
            CaError::RequestNotFound { .. }
            | CaError::TokenNotFound { .. }
            | CaError::UnknownSerial { .. } => ErrorCategory::NotFound,
            CaError::Signing { .. } => ErrorCategory::Signing,
            CaError::Storage { .. } | CaError::Conflict { .. } | CaError::KeyMaterial { .. } => {
                ErrorCategory::Storage
            }
            CaError::Config { .. } => ErrorCategory::Config,
            CaError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// 判断错误是否可重试（核心内部从不自动重试，由调用方决定）
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CaError::Signing { .. } | CaError::Storage { .. } | CaError::Conflict { .. }
        )
    }

    pub fn malformed_csr(message: impl Into<String>) -> Self {
        CaError::MalformedCsr {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CaError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn signing(message: impl Into<String>) -> Self {
        CaError::Signing {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        CaError::Storage {
            message: message.into(),
        }
    }

    pub fn key_material(message: impl Into<String>) -> Self {
        CaError::KeyMaterial {
            message: message.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        CaError::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CaError::Internal {
            message: message.into(),
        }
    }

    /// 从 IO 错误创建存储错误，保留文件路径上下文
    pub fn from_io_with_path(err: std::io::Error, path: impl AsRef<std::path::Path>) -> Self {
        CaError::Storage {
            message: format!("{}: {err}", path.as_ref().display()),
        }
    }
}

/// Core 操作的 Result 类型别名
pub type Result<T> = std::result::Result<T, CaError>;

impl From<std::io::Error> for CaError {
    fn from(err: std::io::Error) -> Self {
        CaError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CaError {
    fn from(err: serde_json::Error) -> Self {
        CaError::Storage {
            message: format!("serialization failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_follow_taxonomy() {
        assert_eq!(
            CaError::from(RedeemError::Expired).category(),
            ErrorCategory::Authorization
        );
        assert_eq!(
            CaError::from(IdentityError::malformed(Some("x"), "bad")).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            CaError::InvalidTransition {
                request_id: "req-1".into(),
                status: "approved".into(),
            }
            .category(),
            ErrorCategory::State
        );
        assert_eq!(
            CaError::UnknownSerial {
                serial_number: "01".into()
            }
            .category(),
            ErrorCategory::NotFound
        );
        assert_eq!(CaError::signing("x").category(), ErrorCategory::Signing);
        assert_eq!(
            CaError::Conflict { key: "k".into() }.category(),
            ErrorCategory::Storage
        );
    }

    #[test]
    fn test_only_server_side_failures_are_retriable() {
        assert!(CaError::signing("rng exhausted").is_retriable());
        assert!(CaError::storage("disk full").is_retriable());
        assert!(!CaError::from(RedeemError::AlreadyUsed).is_retriable());
        assert!(!CaError::malformed_csr("garbage").is_retriable());
    }

    #[test]
    fn test_redeem_error_display() {
        let err = RedeemError::SubjectMismatch {
            expected: "host1_bob_J".into(),
            presented: "host1_alice_J".into(),
        };
        assert!(err.to_string().contains("host1_bob_J"));
        assert!(err.to_string().contains("host1_alice_J"));
    }

    #[test]
    fn test_io_error_becomes_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = CaError::from_io_with_path(io, "/var/lib/mwca/ca.key");
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert!(err.to_string().contains("/var/lib/mwca/ca.key"));
    }
}
