use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Opaque snapshot storage. The engine loads full collections at startup and
/// writes full collections after every mutating operation; the only contract
/// is that a load returns the last completed save and never a half-written
/// record.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_raw(&self, name: &str) -> Result<Option<String>>;
    async fn save_raw(&self, name: &str, payload: String) -> Result<()>;
}

/// Load a named collection, treating a missing or corrupt snapshot as empty.
/// Corruption is logged, not propagated: a broken file must not take the
/// whole engine down at startup.
pub async fn load_collection<T: DeserializeOwned>(
    store: &dyn SnapshotStore,
    name: &str,
) -> Result<HashMap<String, T>> {
    match store.load_raw(name).await? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(err) => {
                tracing::warn!("snapshot {} is corrupt, starting empty: {}", name, err);
                Ok(HashMap::new())
            }
        },
        None => Ok(HashMap::new()),
    }
}

pub async fn save_collection<T: Serialize>(
    store: &dyn SnapshotStore,
    name: &str,
    data: &HashMap<String, T>,
) -> Result<()> {
    let payload = serde_json::to_string_pretty(data)
        .with_context(|| format!("failed to serialize snapshot {}", name))?;
    store.save_raw(name, payload).await
}

/// File-backed store: one `{name}.json` per collection under a data
/// directory. Saves go through a temp file and a rename so a concurrent
/// reader never observes a partial write.
pub struct JsonSnapshotStore {
    dir: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn load_raw(&self, name: &str) -> Result<Option<String>> {
        let path = self.path_for(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn save_raw(&self, name: &str, payload: String) -> Result<()> {
        let path = self.path_for(name);
        let tmp = self.dir.join(format!(".{}.json.tmp", name));
        tokio::fs::write(&tmp, payload.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// In-memory store used by tests and by deployments that opt out of
/// persistence entirely.
#[derive(Default)]
pub struct MemorySnapshotStore {
    data: tokio::sync::Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_raw(&self, name: &str) -> Result<Option<String>> {
        Ok(self.data.lock().await.get(name).cloned())
    }

    async fn save_raw(&self, name: &str, payload: String) -> Result<()> {
        self.data.lock().await.insert(name.to_string(), payload);
        Ok(())
    }
}

pub const SESSIONS_SNAPSHOT: &str = "sessions";
pub const EXAMS_SNAPSHOT: &str = "exams";
pub const STUDENTS_SNAPSHOT: &str = "students";
