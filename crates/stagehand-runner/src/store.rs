//! On-disk record of commands that are still running.
//!
//! One JSON file per command, written while the command runs and removed
//! once it has been waited for. A process that dies in between leaves the
//! record behind for `reattach`.

use crate::executor::Executor;
use serde::{Deserialize, Serialize};
use stagehand_core::{Command, CommandId, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A command together with the executor running it.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Command,
    pub executor: Executor,
}

/// Serialized form of a borrowed record.
#[derive(Serialize)]
struct RecordRef<'a> {
    command: &'a Command,
    executor: &'a Executor,
}

/// Directory of persisted [`CommandRecord`]s.
#[derive(Debug, Clone)]
pub struct ExecutorStore {
    dir: PathBuf,
}

impl ExecutorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &CommandId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write the record, replacing any earlier one for the same command.
    pub async fn save(&self, command: &Command, executor: &Executor) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(&RecordRef { command, executor })?;
        let path = self.record_path(&command.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "Saved command record");
        Ok(())
    }

    pub async fn load(&self, id: &CommandId) -> Result<Option<CommandRecord>> {
        match tokio::fs::read(self.record_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable record, oldest command first. Unreadable files are
    /// skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<CommandRecord>> {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(stagehand_core::Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CommandRecord>(&bytes)?));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable command record"),
            }
        }
        records.sort_by_key(|r| r.command.id);
        Ok(records)
    }

    pub async fn remove(&self, id: &CommandId) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::local::LocalExecutor;
    use crate::probe::ProbeExecutor;

    #[tokio::test]
    async fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutorStore::new(dir.path().join("state"));
        let command = Command::new("probe", "true", dir.path());
        let executor = Executor::Probe(ProbeExecutor::new());

        store.save(&command, &executor).await.unwrap();
        let loaded = store.load(&command.id).await.unwrap().unwrap();
        assert_eq!(loaded.command.id, command.id);
        assert_eq!(loaded.executor.backend(), BackendKind::Probe);

        store.remove(&command.id).await.unwrap();
        store.remove(&command.id).await.unwrap();
        assert!(store.load(&command.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_all_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutorStore::new(dir.path());
        let first = Command::new("first", "true", dir.path());
        let second = Command::new("second", "true", dir.path());
        store
            .save(&second, &Executor::Local(LocalExecutor::new()))
            .await
            .unwrap();
        store
            .save(&first, &Executor::Probe(ProbeExecutor::new()))
            .await
            .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 2);
        let local = records.iter().find(|r| r.command.id == second.id).unwrap();
        assert_eq!(local.executor.backend(), BackendKind::Local);
        assert!(records.iter().any(|r| r.command.id == first.id));
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutorStore::new(dir.path().join("nope"));
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
