use async_trait::async_trait;
use mwca_core::error::Result;
use serde::{Deserialize, Serialize};

/// 带修订号的值；修订号在每次成功写入后单调递增
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<V> {
    pub value: V,
    pub revision: u64,
}

/// 按键存储的表，提供 create-only 与 compare-and-swap 写入
///
/// 所有写操作对单个键是原子的；`list` 只是某一时刻的快照。修订号不匹配或
/// 键已存在时返回 `CaError::Conflict`。
#[async_trait]
pub trait VersionedStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>>;

    /// 仅当键不存在时写入，返回初始修订号
    async fn create(&self, key: &str, value: V) -> Result<u64>;

    /// CAS 更新，返回新修订号
    async fn update(&self, key: &str, value: V, expected_revision: u64) -> Result<u64>;

    /// CAS 删除
    async fn delete(&self, key: &str, expected_revision: u64) -> Result<()>;

    async fn list(&self) -> Result<Vec<(String, Versioned<V>)>>;
}
