//! 加密 keyring blob 的持久化
//!
//! 引擎只存取不透明的加密字节，明文永远不落盘

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait KeyringPersistence: Send + Sync {
    /// 读取上次保存的 blob；从未保存过返回 None
    async fn load_encrypted_blob(&self) -> EngineResult<Option<Vec<u8>>>;

    async fn save_encrypted_blob(&self, blob: &[u8]) -> EngineResult<()>;
}

/// 内存存储（测试与无持久化部署）
#[derive(Default)]
pub struct InMemoryPersistence {
    blob: RwLock<Option<Vec<u8>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyringPersistence for InMemoryPersistence {
    async fn load_encrypted_blob(&self) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.blob.read().await.clone())
    }

    async fn save_encrypted_blob(&self, blob: &[u8]) -> EngineResult<()> {
        *self.blob.write().await = Some(blob.to_vec());
        Ok(())
    }
}

/// 文件存储：先写临时文件再 rename，避免写一半时崩溃留下损坏的 blob
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl KeyringPersistence for FilePersistence {
    async fn load_encrypted_blob(&self) -> EngineResult<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Persistence(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save_encrypted_blob(&self, blob: &[u8]) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    EngineError::Persistence(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, blob).await.map_err(|e| {
            EngineError::Persistence(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            EngineError::Persistence(format!("failed to replace {}: {}", self.path.display(), e))
        })?;

        tracing::debug!(path = %self.path.display(), bytes = blob.len(), "keyring blob saved");
        Ok(())
    }
}
