//! Durable task store.
//!
//! A task's YAML file under `.orc/tasks/<id>/task.yaml` is the source of
//! truth. Every mutation takes an exclusive advisory lock on that file,
//! reads the current value, applies the change, and writes back through a
//! temp-file-then-rename so a crash mid-write never leaves a torn record.
//! `list` additionally consults a libsql-backed cache when one is attached,
//! purely to avoid reading every task file on disk; the cache is rebuilt
//! from the YAML files on open and is never the record of truth.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::StoreError;
use crate::model::{Checkpoint, ExecutionRecord, Task, TranscriptLine};

/// File-backed store rooted at a project's `.orc/tasks` directory.
pub struct Store {
    tasks_dir: PathBuf,
    cache: Option<ListCache>,
}

struct ListCache {
    conn: libsql::Connection,
}

impl Store {
    /// Open a store with no list-acceleration cache.
    pub fn open(tasks_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let tasks_dir = tasks_dir.into();
        fs::create_dir_all(&tasks_dir).map_err(|source| StoreError::Write {
            path: tasks_dir.clone(),
            source,
        })?;
        Ok(Self {
            tasks_dir,
            cache: None,
        })
    }

    /// Open a store and attach a libsql cache at `db_path`, rebuilding it
    /// from the YAML files currently on disk.
    pub async fn open_with_cache(
        tasks_dir: impl Into<PathBuf>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, StoreError> {
        let mut store = Self::open(tasks_dir)?;
        let db = libsql::Builder::new_local(db_path.as_ref())
            .build()
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (\
                id TEXT PRIMARY KEY, \
                title TEXT NOT NULL, \
                status TEXT NOT NULL, \
                queue TEXT NOT NULL, \
                weight TEXT NOT NULL, \
                updated_at TEXT NOT NULL\
            )",
            (),
        )
        .await
        .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
        store.cache = Some(ListCache { conn });
        store.rebuild_cache().await?;
        Ok(store)
    }

    async fn rebuild_cache(&self) -> Result<(), StoreError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        cache
            .conn
            .execute("DELETE FROM tasks", ())
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
        for task in self.list_from_disk()? {
            self.upsert_cache_row(&task).await?;
        }
        Ok(())
    }

    async fn upsert_cache_row(&self, task: &Task) -> Result<(), StoreError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        cache
            .conn
            .execute(
                "INSERT INTO tasks (id, title, status, queue, weight, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(id) DO UPDATE SET \
                 title = excluded.title, status = excluded.status, queue = excluded.queue, \
                 weight = excluded.weight, updated_at = excluded.updated_at",
                libsql::params![
                    task.id.clone(),
                    task.title.clone(),
                    serde_yaml::to_string(&task.status).unwrap_or_default(),
                    serde_yaml::to_string(&task.queue).unwrap_or_default(),
                    serde_yaml::to_string(&task.weight).unwrap_or_default(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
        Ok(())
    }

    fn task_dir(&self, id: &str) -> PathBuf {
        self.tasks_dir.join(id)
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.task_dir(id).join("task.yaml")
    }

    fn claim_path(&self, id: &str) -> PathBuf {
        self.task_dir(id).join("claim.yaml")
    }

    fn checkpoints_path(&self, id: &str) -> PathBuf {
        self.task_dir(id).join("checkpoints.yaml")
    }

    fn transcript_path(&self, id: &str, phase: &str, iteration: u32) -> PathBuf {
        self.task_dir(id)
            .join("transcripts")
            .join(format!("{phase}-{iteration:04}.jsonl"))
    }

    /// Acquire an exclusive advisory lock on a task's directory. Held for the
    /// lifetime of the returned guard.
    fn lock(&self, id: &str) -> Result<LockGuard, StoreError> {
        let dir = self.task_dir(id);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;
        let lock_path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StoreError::Write {
                path: lock_path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|_| StoreError::LockFailed(lock_path))?;
        Ok(LockGuard { file })
    }

    /// Write a value atomically: serialize to a sibling temp file, then
    /// rename over the destination.
    fn write_atomic<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp_path = path.with_extension("yaml.tmp");
        let body = serde_yaml::to_string(value)?;
        fs::write(&tmp_path, body).map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, path).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    fn read_yaml<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T, StoreError> {
        let body = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&body)?)
    }

    pub fn create(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.task_path(&task.id);
        if path.exists() {
            return Err(StoreError::Conflict(task.id.clone()));
        }
        let _guard = self.lock(&task.id)?;
        self.write_atomic(&path, task)
    }

    pub fn load(&self, id: &str) -> Result<Task, StoreError> {
        let path = self.task_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.read_yaml(&path)
    }

    /// Read-modify-write a task under the per-task lock.
    pub fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(&mut Task),
    ) -> Result<Task, StoreError> {
        let _guard = self.lock(id)?;
        let mut task = self.load(id)?;
        f(&mut task);
        task.updated_at = Utc::now();
        self.write_atomic(&self.task_path(id), &task)?;
        Ok(task)
    }

    fn list_from_disk(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        if !self.tasks_dir.exists() {
            return Ok(tasks);
        }
        for entry in fs::read_dir(&self.tasks_dir).map_err(|source| StoreError::Read {
            path: self.tasks_dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| StoreError::Read {
                path: self.tasks_dir.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let path = entry.path().join("task.yaml");
            if path.exists() {
                tasks.push(self.read_yaml(&path)?);
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    /// List all tasks. Always authoritative: reads straight from disk. The
    /// cache (if attached) only accelerates filtered/sorted queries a caller
    /// builds on top; this method intentionally bypasses it.
    pub fn list(&self) -> Result<Vec<Task>, StoreError> {
        self.list_from_disk()
    }

    pub fn append_transcript(&self, line: &TranscriptLine) -> Result<(), StoreError> {
        let path = self.transcript_path(&line.task_id, &line.phase.to_string(), line.iteration);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut body = serde_json::to_string(line).map_err(|e| StoreError::Other(e.into()))?;
        body.push('\n');
        use std::io::Write as _;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        file.write_all(body.as_bytes())
            .map_err(|source| StoreError::Write { path, source })?;
        Ok(())
    }

    /// Idempotent on `(task_id, phase, commit)`: recording the same
    /// checkpoint twice yields one entry.
    pub fn record_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let _guard = self.lock(&checkpoint.task_id)?;
        let path = self.checkpoints_path(&checkpoint.task_id);
        let mut checkpoints: Vec<Checkpoint> = if path.exists() {
            self.read_yaml(&path)?
        } else {
            Vec::new()
        };
        let already_recorded = checkpoints.iter().any(|c| {
            c.task_id == checkpoint.task_id && c.phase == checkpoint.phase && c.commit == checkpoint.commit
        });
        if already_recorded {
            return Ok(());
        }
        checkpoints.push(checkpoint.clone());
        self.write_atomic(&path, &checkpoints)
    }

    pub fn checkpoints(&self, id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let path = self.checkpoints_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        self.read_yaml(&path)
    }

    /// Attach an execution claim, failing if another worker's claim is still
    /// fresh (within `max_age`).
    pub fn claim(
        &self,
        id: &str,
        record: ExecutionRecord,
        max_age: chrono::Duration,
    ) -> Result<(), StoreError> {
        let _guard = self.lock(id)?;
        let path = self.claim_path(id);
        if path.exists() {
            let existing: ExecutionRecord = self.read_yaml(&path)?;
            if !existing.is_stale(max_age) {
                return Err(StoreError::AlreadyRunning(id.to_string()));
            }
        }
        self.write_atomic(&path, &record)
    }

    pub fn heartbeat(&self, id: &str, worker_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock(id)?;
        let path = self.claim_path(id);
        let mut record: ExecutionRecord = self.read_yaml(&path)?;
        if record.worker_id != worker_id {
            return Err(StoreError::LostClaim(id.to_string()));
        }
        record.last_heartbeat = Utc::now();
        self.write_atomic(&path, &record)
    }

    pub fn release(&self, id: &str, worker_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock(id)?;
        let path = self.claim_path(id);
        if path.exists() {
            let record: ExecutionRecord = self.read_yaml(&path)?;
            if record.worker_id != worker_id {
                return Err(StoreError::LostClaim(id.to_string()));
            }
            fs::remove_file(&path).map_err(|source| StoreError::Write { path, source })?;
        }
        Ok(())
    }

    pub fn current_claim(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let path = self.claim_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.read_yaml(&path)?))
    }

    /// Ids of tasks whose claim has gone stale (worker crashed without
    /// releasing it) relative to `max_age`.
    pub fn find_orphaned(&self, max_age: chrono::Duration) -> Result<Vec<String>, StoreError> {
        let mut orphaned = Vec::new();
        for task in self.list_from_disk()? {
            if let Some(record) = self.current_claim(&task.id)? {
                if record.is_stale(max_age) {
                    orphaned.push(task.id);
                }
            }
        }
        Ok(orphaned)
    }
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Best-effort timestamp helper so tests don't need to depend on `chrono`
/// directly for freshness windows.
pub fn stale_after(minutes: i64) -> chrono::Duration {
    chrono::Duration::minutes(minutes)
}

pub type Timestamp = DateTime<Utc>;
