use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

/// Identifies one ordered queue: a guild can own several independent kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub guild_id: GuildId,
    pub kind: String,
}

impl QueueKey {
    pub const MUSIC: &'static str = "music";

    pub fn new(guild_id: GuildId, kind: impl Into<String>) -> Self {
        Self {
            guild_id,
            kind: kind.into(),
        }
    }

    /// The guild's main playback queue.
    pub fn music(guild_id: GuildId) -> Self {
        Self::new(guild_id, Self::MUSIC)
    }
}

/// Ordered, FIFO list of opaque item identifiers keyed by (guild, kind).
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn peek_first(&self, key: &QueueKey) -> Result<Option<String>>;

    async fn len(&self, key: &QueueKey) -> Result<usize>;

    async fn push(&self, key: &QueueKey, item_id: &str) -> Result<()>;

    /// Removes the head and returns it, `None` when the queue is empty.
    async fn pop_first(&self, key: &QueueKey) -> Result<Option<String>>;

    async fn clear(&self, key: &QueueKey) -> Result<usize>;

    /// Snapshot of the queue in playback order.
    async fn items(&self, key: &QueueKey) -> Result<Vec<String>>;
}

/// In-memory store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    queues: DashMap<QueueKey, VecDeque<String>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn peek_first(&self, key: &QueueKey) -> Result<Option<String>> {
        Ok(self.queues.get(key).and_then(|q| q.front().cloned()))
    }

    async fn len(&self, key: &QueueKey) -> Result<usize> {
        Ok(self.queues.get(key).map_or(0, |q| q.len()))
    }

    async fn push(&self, key: &QueueKey, item_id: &str) -> Result<()> {
        self.queues
            .entry(key.clone())
            .or_default()
            .push_back(item_id.to_string());
        Ok(())
    }

    async fn pop_first(&self, key: &QueueKey) -> Result<Option<String>> {
        Ok(self.queues.get_mut(key).and_then(|mut q| q.pop_front()))
    }

    async fn clear(&self, key: &QueueKey) -> Result<usize> {
        Ok(self.queues.remove(key).map_or(0, |(_, q)| q.len()))
    }

    async fn items(&self, key: &QueueKey) -> Result<Vec<String>> {
        Ok(self
            .queues
            .get(key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// On-disk content of one queue file.
#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    guild_id: GuildId,
    kind: String,
    items: VecDeque<String>,
    updated_at: DateTime<Utc>,
}

/// Queues persisted as JSON files, one per (guild, kind).
///
/// Every mutation is written through to `<data_dir>/queues/guild_<id>_<kind>.json`.
/// Reads are served from memory.
pub struct JsonQueueStore {
    queues_dir: PathBuf,
    queues: DashMap<QueueKey, VecDeque<String>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonQueueStore {
    /// Opens the store, loading every queue file found under `data_dir`.
    pub async fn open(data_dir: PathBuf) -> Result<Self> {
        let queues_dir = data_dir.join("queues");
        fs::create_dir_all(&queues_dir).await?;

        info!("📁 Colas persistidas en: {}", queues_dir.display());

        let store = Self {
            queues_dir,
            queues: DashMap::new(),
            write_lock: tokio::sync::Mutex::new(()),
        };

        store.load_all().await?;

        Ok(store)
    }

    /// Flushes every queue to disk.
    pub async fn close(&self) -> Result<()> {
        let keys: Vec<QueueKey> = self.queues.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.persist(key).await?;
        }
        info!("💾 {} colas guardadas", keys.len());
        Ok(())
    }

    async fn load_all(&self) -> Result<()> {
        let mut files = fs::read_dir(&self.queues_dir).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|content| serde_json::from_str::<QueueFile>(&content).map_err(Into::into));

            match parsed {
                Ok(file) => {
                    let key = QueueKey::new(file.guild_id, file.kind);
                    self.queues.insert(key, file.items);
                    loaded_count += 1;
                }
                Err(e) => {
                    warn!("Error cargando cola {}: {}", path.display(), e);
                }
            }
        }

        if loaded_count > 0 {
            info!("📂 Cargadas {} colas", loaded_count);
        }

        Ok(())
    }

    async fn persist(&self, key: &QueueKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let items = self
            .queues
            .get(key)
            .map(|q| q.value().clone())
            .unwrap_or_default();

        let path = self.file_path(key);
        let file = QueueFile {
            guild_id: key.guild_id,
            kind: key.kind.clone(),
            items,
            updated_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string_pretty(&file)?).await?;
        debug!("💾 Cola guardada: {}", path.display());
        Ok(())
    }

    fn file_path(&self, key: &QueueKey) -> PathBuf {
        let kind: String = key
            .kind
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.queues_dir
            .join(format!("guild_{}_{}.json", key.guild_id, kind))
    }
}

#[async_trait]
impl QueueStore for JsonQueueStore {
    async fn peek_first(&self, key: &QueueKey) -> Result<Option<String>> {
        Ok(self.queues.get(key).and_then(|q| q.front().cloned()))
    }

    async fn len(&self, key: &QueueKey) -> Result<usize> {
        Ok(self.queues.get(key).map_or(0, |q| q.len()))
    }

    async fn push(&self, key: &QueueKey, item_id: &str) -> Result<()> {
        self.queues
            .entry(key.clone())
            .or_default()
            .push_back(item_id.to_string());
        self.persist(key).await
    }

    async fn pop_first(&self, key: &QueueKey) -> Result<Option<String>> {
        let popped = self.queues.get_mut(key).and_then(|mut q| q.pop_front());
        if popped.is_some() {
            // Memory stays authoritative; the next write or `close` catches the file up
            if let Err(e) = self.persist(key).await {
                warn!("Error guardando la cola de guild {} tras quitar un elemento: {:?}", key.guild_id, e);
            }
        }
        Ok(popped)
    }

    async fn clear(&self, key: &QueueKey) -> Result<usize> {
        let cleared = self.queues.get_mut(key).map_or(0, |mut q| {
            let n = q.len();
            q.clear();
            n
        });
        self.persist(key).await?;
        Ok(cleared)
    }

    async fn items(&self, key: &QueueKey) -> Result<Vec<String>> {
        Ok(self
            .queues
            .get(key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }
}
