// ABOUTME: Scratchpad-directory artifact store backed by plain files
// ABOUTME: Uses temp-file + rename for atomic saves and a per-name lock table for writers

use super::{validate_name, ArtifactError, ArtifactStore, Result};
use crate::types::CodeArtifact;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Directory (under the scratchpad) holding per-artifact metadata
const META_DIR: &str = ".meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactMeta {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    version: i64,
}

/// Artifact store keeping each source as `<root>/<name>`
///
/// The root doubles as the scratchpad a user can browse: files dropped in by
/// hand are listed and loadable, with metadata synthesized from the file.
pub struct FileArtifactStore {
    root: PathBuf,
    meta_dir: PathBuf,
    locks: LockTable,
}

type LockTable = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Exclusive hold on one artifact name
///
/// The table entry is dropped with the last holder, so waiters always share
/// the lock they queued on and idle names do not accumulate.
struct NameGuard<'a> {
    table: &'a LockTable,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

impl FileArtifactStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta_dir = root.join(META_DIR);

        tokio::fs::create_dir_all(&meta_dir).await.map_err(|e| {
            ArtifactError::WriteFailure(format!(
                "cannot create scratchpad {}: {}",
                root.display(),
                e
            ))
        })?;

        info!("Opened file artifact store at {}", root.display());

        Ok(Self {
            root,
            meta_dir,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn source_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.meta_dir.join(format!("{}.json", name))
    }

    async fn lock_name(&self, name: &str) -> NameGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        NameGuard {
            table: &self.locks,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Read metadata, synthesizing it from the source file when missing
    async fn read_meta(&self, name: &str) -> Result<Option<ArtifactMeta>> {
        match tokio::fs::read(self.meta_path(name)).await {
            Ok(bytes) => match serde_json::from_slice::<ArtifactMeta>(&bytes) {
                Ok(meta) => return Ok(Some(meta)),
                Err(e) => warn!("Ignoring corrupt metadata for artifact {}: {}", name, e),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ArtifactError::ReadFailure(e.to_string())),
        }

        match tokio::fs::metadata(self.source_path(name)).await {
            Ok(file_meta) => {
                let modified: DateTime<Utc> = file_meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(Some(ArtifactMeta {
                    created_at: modified,
                    updated_at: modified,
                    last_run_at: None,
                    version: 1,
                }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArtifactError::ReadFailure(e.to_string())),
        }
    }

    async fn write_meta(&self, name: &str, meta: &ArtifactMeta) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(meta).map_err(|e| ArtifactError::WriteFailure(e.to_string()))?;
        write_atomic(self.meta_dir.clone(), self.meta_path(name), bytes).await
    }

    /// Put metadata back the way it was before a failed save
    async fn restore_meta(&self, name: &str, previous: Option<&ArtifactMeta>, had_file: bool) {
        let restored = match previous {
            Some(meta) if had_file => self.write_meta(name, meta).await,
            _ => match tokio::fs::remove_file(self.meta_path(name)).await {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    Err(ArtifactError::WriteFailure(e.to_string()))
                }
                _ => Ok(()),
            },
        };
        if let Err(e) = restored {
            warn!("Failed to restore metadata for artifact {}: {}", name, e);
        }
    }
}

/// Write `bytes` to `target` so readers see either the old or the new content
///
/// The data goes to a temp file in `dir` (same filesystem as `target`), is
/// flushed to disk, then renamed over the target.
async fn write_atomic(dir: PathBuf, target: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| ArtifactError::WriteFailure(format!("write task failed: {}", e)))?
    .map_err(|e| ArtifactError::WriteFailure(e.to_string()))
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn save(&self, name: &str, source: &str) -> Result<CodeArtifact> {
        validate_name(name)?;

        let _guard = self.lock_name(name).await;

        let had_meta_file = tokio::fs::try_exists(self.meta_path(name))
            .await
            .unwrap_or(false);
        let previous = self.read_meta(name).await?;
        let now = Utc::now();
        let meta = ArtifactMeta {
            created_at: previous.as_ref().map(|m| m.created_at).unwrap_or(now),
            updated_at: now,
            last_run_at: previous.as_ref().and_then(|m| m.last_run_at),
            version: previous.as_ref().map(|m| m.version + 1).unwrap_or(1),
        };

        // Metadata first: until the source rename lands, loads still see the old source
        self.write_meta(name, &meta).await?;
        if let Err(e) = write_atomic(
            self.root.clone(),
            self.source_path(name),
            source.as_bytes().to_vec(),
        )
        .await
        {
            self.restore_meta(name, previous.as_ref(), had_meta_file)
                .await;
            return Err(e);
        }

        debug!("Saved artifact {} (version {})", name, meta.version);

        Ok(CodeArtifact {
            name: name.to_string(),
            source: source.to_string(),
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            last_run_at: meta.last_run_at,
            version: meta.version,
        })
    }

    async fn load(&self, name: &str) -> Result<CodeArtifact> {
        validate_name(name)?;

        let _guard = self.lock_name(name).await;

        let source = match tokio::fs::read_to_string(self.source_path(name)).await {
            Ok(source) => source,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(name.to_string()))
            }
            Err(e) => return Err(ArtifactError::ReadFailure(e.to_string())),
        };
        let meta = self
            .read_meta(name)
            .await?
            .ok_or_else(|| ArtifactError::NotFound(name.to_string()))?;

        Ok(CodeArtifact {
            name: name.to_string(),
            source,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            last_run_at: meta.last_run_at,
            version: meta.version,
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ArtifactError::ReadFailure(e.to_string()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ArtifactError::ReadFailure(e.to_string()))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            // Temp files and anything else that is not a valid name stay hidden
            if let Some(name) = entry.file_name().to_str() {
                if validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;

        let _guard = self.lock_name(name).await;

        match tokio::fs::remove_file(self.source_path(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(name.to_string()))
            }
            Err(e) => return Err(ArtifactError::WriteFailure(e.to_string())),
        }
        match tokio::fs::remove_file(self.meta_path(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove metadata for artifact {}: {}", name, e),
        }

        info!("Deleted artifact {}", name);
        Ok(())
    }

    async fn mark_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        validate_name(name)?;

        let _guard = self.lock_name(name).await;

        let mut meta = self
            .read_meta(name)
            .await?
            .ok_or_else(|| ArtifactError::NotFound(name.to_string()))?;
        meta.last_run_at = Some(at);
        self.write_meta(name, &meta).await
    }

    fn kind(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (FileArtifactStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileArtifactStore::open(dir.path().join("scratchpad"))
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let (store, _dir) = store().await;

        let saved = store
            .save("hello.py", "print('hello')\n")
            .await
            .unwrap();
        assert_eq!(saved.version, 1);
        assert_eq!(saved.last_run_at, None);

        let loaded = store.load("hello.py").await.unwrap();
        assert_eq!(loaded.source, "print('hello')\n");
        assert_eq!(loaded.created_at, saved.created_at);
    }

    #[tokio::test]
    async fn test_resave_overwrites_and_keeps_created_at() {
        let (store, _dir) = store().await;

        let first = store.save("flow.py", "v1").await.unwrap();
        let second = store.save("flow.py", "v2").await.unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(store.load("flow.py").await.unwrap().source, "v2");
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected_before_io() {
        let (store, dir) = store().await;

        for name in ["../escape.py", "evil\0.py", "a/b.py"] {
            let err = store.save(name, "x").await.unwrap_err();
            assert!(matches!(err, ArtifactError::InvalidName { .. }), "{}", name);
        }
        assert!(!dir.path().join("escape.py").exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let (store, _dir) = store().await;
        let err = store.load("missing.py").await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_hides_metadata() {
        let (store, _dir) = store().await;
        store.save("b.py", "b").await.unwrap();
        store.save("a.py", "a").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a.py", "b.py"]);
    }

    #[tokio::test]
    async fn test_delete_removes_artifact() {
        let (store, _dir) = store().await;
        store.save("gone.py", "x").await.unwrap();

        store.delete("gone.py").await.unwrap();

        assert!(matches!(
            store.load("gone.py").await,
            Err(ArtifactError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("gone.py").await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_run_records_timestamp() {
        let (store, _dir) = store().await;
        store.save("run.py", "x").await.unwrap();

        let at = Utc::now();
        store.mark_run("run.py", at).await.unwrap();

        assert_eq!(store.load("run.py").await.unwrap().last_run_at, Some(at));
        // A later save keeps the run history
        let resaved = store.save("run.py", "y").await.unwrap();
        assert_eq!(resaved.last_run_at, Some(at));
    }

    #[tokio::test]
    async fn test_artifacts_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileArtifactStore::open(dir.path()).await.unwrap();
            store.save("durable.py", "print(1)").await.unwrap();
        }

        let reopened = FileArtifactStore::open(dir.path()).await.unwrap();
        let artifact = reopened.load("durable.py").await.unwrap();
        assert_eq!(artifact.source, "print(1)");
        assert_eq!(artifact.version, 1);
    }

    #[tokio::test]
    async fn test_hand_placed_file_is_loadable() {
        let (store, _dir) = store().await;
        std::fs::write(store.root().join("manual.py"), "print('manual')").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["manual.py"]);
        let artifact = store.load("manual.py").await.unwrap();
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.source, "print('manual')");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_metadata_write_keeps_previous_source() {
        let (store, _dir) = store().await;
        store.save("flow.py", "v1").await.unwrap();

        // Metadata directory becomes unwritable
        let meta_dir = store.root().join(META_DIR);
        std::fs::remove_dir_all(&meta_dir).unwrap();
        std::os::unix::fs::symlink(store.root().join("missing"), &meta_dir).unwrap();

        let err = store.save("flow.py", "v2").await.unwrap_err();
        assert!(matches!(err, ArtifactError::WriteFailure(_)), "{:?}", err);

        let loaded = store.load("flow.py").await.unwrap();
        assert_eq!(loaded.source, "v1");
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_failed_source_write_restores_metadata() {
        let (store, _dir) = store().await;
        store.save("flow.py", "v1").await.unwrap();

        // A directory in place of the source makes the rename fail
        let source = store.root().join("flow.py");
        std::fs::remove_file(&source).unwrap();
        std::fs::create_dir(&source).unwrap();

        let err = store.save("flow.py", "v2").await.unwrap_err();
        assert!(matches!(err, ArtifactError::WriteFailure(_)), "{:?}", err);

        let meta = store.read_meta("flow.py").await.unwrap().unwrap();
        assert_eq!(meta.version, 1);
    }

    #[tokio::test]
    async fn test_lock_table_does_not_grow() {
        let (store, _dir) = store().await;
        store.save("kept.py", "x").await.unwrap();
        store.load("kept.py").await.unwrap();
        store.mark_run("kept.py", Utc::now()).await.unwrap();
        for i in 0..32 {
            let name = format!("missing-{}.py", i);
            assert!(store.load(&name).await.is_err());
            assert!(store.mark_run(&name, Utc::now()).await.is_err());
        }
        store.delete("kept.py").await.unwrap();

        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_lock_after_holder_leaves() {
        let (store, _dir) = store().await;
        let store = Arc::new(store);

        let first = store.lock_name("shared.py").await;
        let waiter = tokio::spawn({
            let store = store.clone();
            async move {
                let _guard = store.lock_name("shared.py").await;
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(first);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // The waiter now holds the same lock, so a newcomer must queue behind it
        let newcomer =
            tokio::time::timeout(std::time::Duration::from_millis(100), store.lock_name("shared.py"))
                .await;
        assert!(newcomer.is_err());

        waiter.await.unwrap();
        drop(store.lock_name("shared.py").await);
        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_same_name_never_tear() {
        let (store, _dir) = store().await;
        let store = Arc::new(store);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let body = format!("{}", i).repeat(4096);
                store.save("shared.py", &body).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let artifact = store.load("shared.py").await.unwrap();
        assert_eq!(artifact.version, 16);
        // Whole content comes from exactly one writer
        let unit_len = artifact.source.len() / 4096;
        assert!(unit_len == 1 || unit_len == 2);
        assert_eq!(artifact.source, artifact.source[..unit_len].repeat(4096));
    }
}
