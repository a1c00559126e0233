//! mwca Server - 证书颁发机构生命周期引擎
//!
//! 基于 mwca-core：CA 根密钥、bootstrap token、证书申请审批、签发、换发与吊销登记，
//! 以及可替换的版本化存储。

pub mod application;
pub mod infrastructure;

// 重新导出核心类型
pub use mwca_core::*;

pub use infrastructure::key_material::{CaIdentity, CaOrigin, KeyMaterial};
pub use infrastructure::persistence::{JsonFileStore, MemoryStore, Stores};
pub use infrastructure::services::{CaService, TokenSweeper};
