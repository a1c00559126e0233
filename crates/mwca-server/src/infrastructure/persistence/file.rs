use async_trait::async_trait;
use mwca_core::error::{CaError, Result};
use mwca_core::utils::write_atomic;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::application::ports::{Versioned, VersionedStore};

type Snapshot<V> = BTreeMap<String, Versioned<V>>;

/// 单文件 JSON 表
///
/// 每次写入都在表锁内完成“读取快照 → 修改 → 原子落盘”。表锁由进程内互斥锁
/// 加上表文件旁 `.lock` 的 flock 组成，多个 `mwca` 进程共享同一目录时写入
/// 仍然串行。读取直接读最新快照。
pub struct JsonFileStore<V> {
    path: Arc<PathBuf>,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonFileStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// 打开（或创建）表文件；已有文件必须可解析
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CaError::from_io_with_path(e, parent))?;
        }
        load_snapshot::<V>(&path)?;
        Ok(Self {
            path: Arc::new(path),
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Snapshot<V>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_snapshot::<V>(&path))
            .await
            .map_err(|e| CaError::internal(format!("storage task failed: {e}")))?
    }

    async fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Snapshot<V>) -> Result<R> + Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let _table_lock = TableLock::acquire(&path)?;
            let mut snapshot = load_snapshot::<V>(&path)?;
            let result = f(&mut snapshot)?;
            save_snapshot(&path, &snapshot)?;
            debug!(path = %path.display(), entries = snapshot.len(), "snapshot written");
            Ok(result)
        })
        .await
        .map_err(|e| CaError::internal(format!("storage task failed: {e}")))?
    }
}

/// 跨进程写锁，drop 时释放
struct TableLock {
    file: std::fs::File,
}

impl TableLock {
    fn acquire(table: &Path) -> Result<Self> {
        let path = lock_path(table);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CaError::from_io_with_path(e, &path))?;
        flock(&file, true).map_err(|e| CaError::from_io_with_path(e, &path))?;
        Ok(Self { file })
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, false) {
            warn!(error = %e, "failed to release table lock");
        }
    }
}

fn lock_path(table: &Path) -> PathBuf {
    let mut name = table.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(unix)]
fn flock(file: &std::fs::File, exclusive: bool) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_UN };
    loop {
        // SAFETY: the descriptor is owned by `file`, which outlives this call.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

// 非 Unix 平台只有进程内互斥
#[cfg(not(unix))]
fn flock(_file: &std::fs::File, _exclusive: bool) -> std::io::Result<()> {
    Ok(())
}

fn load_snapshot<V: DeserializeOwned>(path: &Path) -> Result<Snapshot<V>> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            CaError::storage(format!("Corrupt store file {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(CaError::from_io_with_path(e, path)),
    }
}

fn save_snapshot<V: Serialize>(path: &Path, snapshot: &Snapshot<V>) -> Result<()> {
    let data = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(path, &data, 0o600)
}

fn conflict(key: &str) -> CaError {
    CaError::Conflict {
        key: key.to_string(),
    }
}

#[async_trait]
impl<V> VersionedStore<V> for JsonFileStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>> {
        Ok(self.read().await?.remove(key))
    }

    async fn create(&self, key: &str, value: V) -> Result<u64> {
        let key = key.to_string();
        self.mutate(move |snapshot| {
            if snapshot.contains_key(&key) {
                return Err(conflict(&key));
            }
            snapshot.insert(key, Versioned { value, revision: 1 });
            Ok(1)
        })
        .await
    }

    async fn update(&self, key: &str, value: V, expected_revision: u64) -> Result<u64> {
        let key = key.to_string();
        self.mutate(move |snapshot| {
            let entry = snapshot
                .get_mut(&key)
                .filter(|e| e.revision == expected_revision)
                .ok_or_else(|| conflict(&key))?;
            entry.revision += 1;
            entry.value = value;
            Ok(entry.revision)
        })
        .await
    }

    async fn delete(&self, key: &str, expected_revision: u64) -> Result<()> {
        let key = key.to_string();
        self.mutate(move |snapshot| match snapshot.get(&key) {
            Some(e) if e.revision == expected_revision => {
                snapshot.remove(&key);
                Ok(())
            }
            _ => Err(conflict(&key)),
        })
        .await
    }

    async fn list(&self) -> Result<Vec<(String, Versioned<V>)>> {
        Ok(self.read().await?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tables").join("requests.json");

        let store = JsonFileStore::<String>::open(&path).unwrap();
        store.create("req-1", "pending".into()).await.unwrap();
        store.update("req-1", "approved".into(), 1).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::<String>::open(&path).unwrap();
        let entry = reopened.get("req-1").await.unwrap().unwrap();
        assert_eq!(entry.value, "approved");
        assert_eq!(entry.revision, 2);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cas_conflicts() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::<u32>::open(dir.path().join("t.json")).unwrap();
        store.create("k", 1).await.unwrap();
        assert!(matches!(
            store.create("k", 2).await,
            Err(CaError::Conflict { .. })
        ));
        assert!(store.update("k", 2, 7).await.is_err());
        assert!(store.delete("k", 7).await.is_err());
        store.delete("k", 1).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_handles_do_not_lose_creates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let a = Arc::new(JsonFileStore::<u32>::open(&path).unwrap());
        let b = Arc::new(JsonFileStore::<u32>::open(&path).unwrap());

        let mut handles = Vec::new();
        for i in 0..200u32 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            handles.push(tokio::spawn(async move {
                store.create(&format!("k{i}"), i).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(a.list().await.unwrap().len(), 200);
        assert!(path.with_file_name("tokens.json.lock").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_handles_cas_has_one_winner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("requests.json");
        let a = Arc::new(JsonFileStore::<String>::open(&path).unwrap());
        let b = Arc::new(JsonFileStore::<String>::open(&path).unwrap());

        for round in 0..50 {
            let key = format!("req-{round}");
            a.create(&key, "pending".into()).await.unwrap();

            let (first, second) = tokio::join!(
                {
                    let (store, key) = (a.clone(), key.clone());
                    tokio::spawn(async move { store.update(&key, "approved".into(), 1).await })
                },
                {
                    let (store, key) = (b.clone(), key.clone());
                    tokio::spawn(async move { store.update(&key, "rejected".into(), 1).await })
                },
            );
            let results = [first.unwrap(), second.unwrap()];
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(CaError::Conflict { .. }))));
            assert_eq!(b.get(&key).await.unwrap().unwrap().revision, 2);
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileStore::<u32>::open(&path).err().unwrap();
        assert!(err.to_string().contains("Corrupt store file"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_snapshot_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = JsonFileStore::<String>::open(&path).unwrap();
        store.create("bt-1", "secret".into()).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
