use crate::error::{CaError, Result};
use crate::utils::{hex_upper, random_bytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 证书申请 ID：`req-YYYYMMDD-<8 hex>`，按日期可排序
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate(now: DateTime<Utc>) -> Result<Self> {
        let suffix = random_bytes::<4>()?;
        Ok(Self(format!(
            "req-{}-{}",
            now.format("%Y%m%d"),
            hex_upper(&suffix).to_lowercase()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Bootstrap token 标识，本身即为凭据
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 两段各 128 bit 的随机十六进制
    pub fn generate() -> Result<Self> {
        let a = random_bytes::<16>()?;
        let b = random_bytes::<16>()?;
        Ok(Self(format!(
            "bt-{}-{}",
            hex_upper(&a).to_lowercase(),
            hex_upper(&b).to_lowercase()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 日志中只显示前缀，避免泄露完整凭据
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(11).collect();
        format!("{prefix}…")
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TokenId").field(&self.redacted()).finish()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TokenId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TokenId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 证书序列号（大写十六进制）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialNumber(String);

impl SerialNumber {
    pub const LEN: usize = 16;

    /// Positive, non-zero leading byte so the DER INTEGER keeps all 16 bytes.
    pub fn generate_bytes() -> Result<[u8; Self::LEN]> {
        let mut bytes = random_bytes::<{ SerialNumber::LEN }>()?;
        bytes[0] &= 0x7f;
        if bytes[0] == 0 {
            bytes[0] = 0x01;
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex_upper(bytes))
    }

    /// 接受大小写与冒号分隔的输入
    pub fn parse(input: &str) -> Result<Self> {
        let normalized: String = input
            .trim()
            .chars()
            .filter(|c| *c != ':')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if normalized.is_empty() || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CaError::invalid_argument(format!(
                "serial number must be hexadecimal: {input}"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SerialNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_request_id_format() {
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        let id = RequestId::generate(now).unwrap();
        let s = id.as_str();
        assert!(s.starts_with("req-20260307-"));
        assert_eq!(s.len(), "req-20260307-".len() + 8);
    }

    #[test]
    fn test_token_id_entropy_and_shape() {
        let a = TokenId::generate().unwrap();
        let b = TokenId::generate().unwrap();
        assert_ne!(a, b);
        let parts: Vec<&str> = a.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "bt");
        assert_eq!(parts[1].len(), 32);
        assert_eq!(parts[2].len(), 32);
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = TokenId::generate().unwrap();
        let debug = format!("{token:?}");
        assert!(!debug.contains(token.as_str()));
    }

    #[test]
    fn test_serial_bytes_are_positive() {
        for _ in 0..64 {
            let bytes = SerialNumber::generate_bytes().unwrap();
            assert!(bytes[0] >= 0x01 && bytes[0] <= 0x7f);
        }
    }

    #[test]
    fn test_serial_parse_normalizes() {
        let serial = SerialNumber::parse("0a:1b:2c").unwrap();
        assert_eq!(serial.as_str(), "0A1B2C");
        assert!(SerialNumber::parse("xyz").is_err());
        assert!(SerialNumber::parse("").is_err());
    }
}
