//! Durable backends for the ledger.
//!
//! A backend only stores whole per-chain snapshots; all record semantics live
//! in `LedgerStore`.
//!
//! Each backend also provides an advisory per-chain lock so a manual `poll`
//! and the scheduler never run a chain's load → poll → flush at the same time.
//!
//! Data model:
//!   file:   {dir}/ledger-{chain_id}.json      → JSON ChainLedgerSnapshot
//!           {dir}/ledger-{chain_id}.lock      → JSON LockFile
//!   valkey: {prefix}:ledger:{chain_id}         → JSON ChainLedgerSnapshot
//!           {prefix}:lock:{chain_id}           → owner (SET NX PX)

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::record::ChainLedgerSnapshot;

#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// `Ok(None)` when nothing has been stored for the chain yet.
    async fn load(&self, chain_id: u64) -> anyhow::Result<Option<ChainLedgerSnapshot>>;

    async fn store(&self, snapshot: &ChainLedgerSnapshot) -> anyhow::Result<()>;

    /// Take the lock for `chain_id` on behalf of `owner` for `ttl`. Re-taking a
    /// lock the owner already holds refreshes it. Returns `false` while another
    /// owner holds an unexpired lock.
    async fn try_lock(&self, chain_id: u64, owner: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Release the lock if `owner` holds it.
    async fn unlock(&self, chain_id: u64, owner: &str) -> anyhow::Result<()>;

    /// Short human description for startup logs and status output.
    fn describe(&self) -> String;
}

// ─── Memory ──────────────────────────────────────────────────────────────────

/// Keeps snapshots in process. Used for dry runs and tests.
#[derive(Default)]
pub struct MemoryBackend {
    snapshots: DashMap<u64, ChainLedgerSnapshot>,
    locks: DashMap<u64, (String, Instant)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerBackend for MemoryBackend {
    async fn load(&self, chain_id: u64) -> anyhow::Result<Option<ChainLedgerSnapshot>> {
        Ok(self.snapshots.get(&chain_id).map(|s| s.clone()))
    }

    async fn store(&self, snapshot: &ChainLedgerSnapshot) -> anyhow::Result<()> {
        self.snapshots.insert(snapshot.chain_id, snapshot.clone());
        Ok(())
    }

    async fn try_lock(&self, chain_id: u64, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Instant::now();
        match self.locks.entry(chain_id) {
            Entry::Vacant(e) => {
                e.insert((owner.to_string(), now + ttl));
                Ok(true)
            }
            Entry::Occupied(mut e) => {
                let (holder, expires) = e.get();
                if holder == owner || *expires <= now {
                    e.insert((owner.to_string(), now + ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn unlock(&self, chain_id: u64, owner: &str) -> anyhow::Result<()> {
        self.locks.remove_if(&chain_id, |_, (holder, _)| holder == owner);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ─── File ────────────────────────────────────────────────────────────────────

/// One JSON file per chain, replaced atomically on every store.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, chain_id: u64) -> PathBuf {
        self.dir.join(format!("ledger-{chain_id}.json"))
    }

    fn lock_path(&self, chain_id: u64) -> PathBuf {
        self.dir.join(format!("ledger-{chain_id}.lock"))
    }

    /// Current holder of the lock file, or `None` if it is absent or expired.
    async fn lock_holder(&self, path: &Path, ttl: Duration) -> anyhow::Result<Option<LockFile>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<LockFile>(&contents) {
            Ok(lock) if lock.expires_at > Utc::now() => Ok(Some(lock)),
            Ok(_) => Ok(None),
            Err(_) => {
                // being written by its creator; stale only once older than ttl
                let modified = tokio::fs::metadata(path).await?.modified()?;
                let age = modified.elapsed().unwrap_or_default();
                if age > ttl {
                    Ok(None)
                } else {
                    Ok(Some(LockFile {
                        owner: String::new(),
                        expires_at: Utc::now(),
                    }))
                }
            }
        }
    }

    async fn write_lock(&self, path: &Path, lock: &LockFile) -> anyhow::Result<()> {
        let tmp = path.with_extension("lock.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(lock)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFile {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl LedgerBackend for FileBackend {
    async fn load(&self, chain_id: u64) -> anyhow::Result<Option<ChainLedgerSnapshot>> {
        let path = self.path(chain_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: ChainLedgerSnapshot = serde_json::from_str(&contents)?;
        debug!(path = %path.display(), records = snapshot.records.len(), "loaded ledger file");
        Ok(Some(snapshot))
    }

    async fn store(&self, snapshot: &ChainLedgerSnapshot) -> anyhow::Result<()> {
        let path = self.path(snapshot.chain_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn try_lock(&self, chain_id: u64, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
        let path = self.lock_path(chain_id);
        let lock = LockFile {
            owner: owner.to_string(),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl)?,
        };

        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match created {
            Ok(_) => {
                self.write_lock(&path, &lock).await?;
                return Ok(true);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        match self.lock_holder(&path, ttl).await? {
            Some(holder) if holder.owner != owner => Ok(false),
            previous => {
                if previous.is_none() {
                    warn!(path = %path.display(), "taking over expired ledger lock");
                }
                self.write_lock(&path, &lock).await?;
                // two takers of an expired lock: the last rename wins
                let won = self
                    .lock_holder(&path, ttl)
                    .await?
                    .map_or(false, |h| h.owner == owner);
                Ok(won)
            }
        }
    }

    async fn unlock(&self, chain_id: u64, owner: &str) -> anyhow::Result<()> {
        let path = self.lock_path(chain_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if let Ok(lock) = serde_json::from_str::<LockFile>(&contents) {
            if lock.owner == owner {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.dir.display())
    }
}

// ─── Valkey ──────────────────────────────────────────────────────────────────

const REFRESH_LOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_LOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Valkey/Redis-backed ledger.
///
/// Keys are namespaced under a configurable prefix so several deployments can
/// share one Valkey without collisions.
#[derive(Clone)]
pub struct ValkeyBackend {
    conn: MultiplexedConnection,
    prefix: String,
}

impl ValkeyBackend {
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }
}

#[async_trait]
impl LedgerBackend for ValkeyBackend {
    async fn load(&self, chain_id: u64) -> anyhow::Result<Option<ChainLedgerSnapshot>> {
        let key = self.key(&format!("ledger:{chain_id}"));
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(&key).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, snapshot: &ChainLedgerSnapshot) -> anyhow::Result<()> {
        let key = self.key(&format!("ledger:{}", snapshot.chain_id));
        let json = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&key, &json).await?;
        Ok(())
    }

    async fn try_lock(&self, chain_id: u64, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
        let key = self.key(&format!("lock:{chain_id}"));
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        if set.is_some() {
            return Ok(true);
        }
        let refreshed: i64 = Script::new(REFRESH_LOCK)
            .key(&key)
            .arg(owner)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn unlock(&self, chain_id: u64, owner: &str) -> anyhow::Result<()> {
        let key = self.key(&format!("lock:{chain_id}"));
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_LOCK)
            .key(&key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("valkey:{}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_backend_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("ledger")).unwrap();

        assert!(backend.load(1).await.unwrap().is_none());

        let snapshot = ChainLedgerSnapshot {
            chain_id: 1,
            watermark: Some(1234),
            records: Vec::new(),
        };
        backend.store(&snapshot).await.unwrap();
        assert_eq!(backend.load(1).await.unwrap(), Some(snapshot));
        assert!(!backend.path(1).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_lock_is_exclusive_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = FileBackend::new(dir.path()).unwrap();
        let manual = FileBackend::new(dir.path()).unwrap();
        let ttl = Duration::from_secs(60);

        assert!(daemon.try_lock(1, "daemon", ttl).await.unwrap());
        assert!(daemon.try_lock(1, "daemon", ttl).await.unwrap());
        assert!(!manual.try_lock(1, "manual", ttl).await.unwrap());
        // other chains are independent
        assert!(manual.try_lock(56, "manual", ttl).await.unwrap());

        // only the holder can release
        manual.unlock(1, "manual").await.unwrap();
        assert!(!manual.try_lock(1, "manual", ttl).await.unwrap());
        daemon.unlock(1, "daemon").await.unwrap();
        assert!(manual.try_lock(1, "manual", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_lock_expires() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        assert!(backend.try_lock(1, "crashed", Duration::ZERO).await.unwrap());
        assert!(backend.try_lock(1, "next", Duration::from_secs(60)).await.unwrap());
        assert!(!backend.try_lock(1, "crashed", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_lock() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        assert!(backend.try_lock(1, "a", ttl).await.unwrap());
        assert!(!backend.try_lock(1, "b", ttl).await.unwrap());
        backend.unlock(1, "a").await.unwrap();
        assert!(backend.try_lock(1, "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_backend_keeps_chains_apart() {
        let backend = MemoryBackend::new();
        backend
            .store(&ChainLedgerSnapshot {
                chain_id: 56,
                watermark: Some(9),
                records: Vec::new(),
            })
            .await
            .unwrap();
        assert!(backend.load(1).await.unwrap().is_none());
        assert_eq!(backend.load(56).await.unwrap().unwrap().watermark, Some(9));
    }
}
