//! Detection of files a command produced.
//!
//! Modification times seen after each command are kept in a
//! [`TimestampMap`]. A later scan reports a file as new when the map has no
//! entry for it or its modification time has moved past the recorded one.

use serde::{Deserialize, Serialize};
use stagehand_core::command::COMMAND_LOG_FILENAME;
use stagehand_core::glob::{GlobCache, GlobMatcher};
use stagehand_core::Result;
use std::collections::BTreeMap;
use std::fs::{FileType, Metadata};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Last seen modification time, in milliseconds since the epoch, per file
/// name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampMap(BTreeMap<String, i64>);

/// Where a work directory keeps its timestamp map.
pub fn timestamp_path(work_dir: &Path) -> PathBuf {
    work_dir.join(".stagehand").join("timestamps.json")
}

impl TimestampMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file is an empty map.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, millis: i64) {
        self.0.insert(name.into(), millis);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Record the current modification time of every output file in `dir`.
    pub async fn record(&mut self, dir: &Path) -> Result<()> {
        for (name, metadata) in output_entries(dir).await? {
            if let Some(millis) = modified_millis(&metadata) {
                self.0.insert(name, millis);
            }
        }
        Ok(())
    }
}

/// Modification time in milliseconds since the epoch.
pub fn modified_millis(metadata: &Metadata) -> Option<i64> {
    let modified = metadata.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}

/// Whether a directory entry could be a command output at all.
///
/// The command transcript, log files and directories never are.
pub fn is_non_excluded_output(name: &str, file_type: FileType) -> bool {
    !file_type.is_dir() && name != COMMAND_LOG_FILENAME && !name.ends_with(".log")
}

/// Non-excluded entries of `dir`. A missing directory has none.
async fn output_entries(dir: &Path) -> Result<Vec<(String, Metadata)>> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type().await?;
        if !is_non_excluded_output(&name, file_type) {
            continue;
        }
        match entry.metadata().await {
            Ok(metadata) => entries.push((name, metadata)),
            Err(e) => warn!(file = %name, error = %e, "Cannot read output metadata"),
        }
    }
    Ok(entries)
}

/// Files in `dir` that are new relative to `timestamps`, sorted by path.
pub async fn scan_output_directory(dir: &Path, timestamps: &TimestampMap) -> Result<Vec<PathBuf>> {
    let mut new_files = Vec::new();
    for (name, metadata) in output_entries(dir).await? {
        let is_new = match (timestamps.get(&name), modified_millis(&metadata)) {
            (None, _) => true,
            (Some(recorded), Some(current)) => current > recorded,
            (Some(_), None) => false,
        };
        if is_new {
            new_files.push(dir.join(&name));
        }
    }
    new_files.sort();
    debug!(dir = %dir.display(), count = new_files.len(), "Scanned for new outputs");
    Ok(new_files)
}

/// Picks the declared outputs out of a list of new files.
#[derive(Debug, Clone)]
pub struct OutputMatcher {
    globs: Vec<GlobMatcher>,
    ignorable: Vec<String>,
}

impl OutputMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S], ignorable: Vec<String>, cache: &GlobCache) -> Result<Self> {
        let globs = patterns
            .iter()
            .map(|p| cache.get(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { globs, ignorable })
    }

    pub fn is_declared(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if self.ignorable.iter().any(|i| i == name) {
            return false;
        }
        let full = path.to_string_lossy();
        self.globs.iter().any(|g| g.is_match(&full))
    }

    pub fn declared<'a>(&self, files: &'a [PathBuf]) -> Vec<&'a PathBuf> {
        files.iter().filter(|f| self.is_declared(f)).collect()
    }
}

/// Millisecond modification time of `path`, if it exists.
pub async fn file_millis(path: &Path) -> Option<i64> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    modified_millis(&metadata)
}

/// The names in `files` that do not exist under `base`.
pub async fn missing_files<S: AsRef<str>>(base: &Path, files: &[S]) -> Vec<String> {
    let mut missing = Vec::new();
    for file in files {
        if tokio::fs::metadata(base.join(file.as_ref())).await.is_err() {
            missing.push(file.as_ref().to_string());
        }
    }
    missing
}

/// Whether every declared output exists and none is older than any input.
///
/// A command that declares no outputs is never up to date.
pub async fn outputs_up_to_date<S: AsRef<str>>(base: &Path, outputs: &[S], inputs: &[S]) -> bool {
    if outputs.is_empty() {
        return false;
    }
    let mut oldest_output = i64::MAX;
    for output in outputs {
        match file_millis(&base.join(output.as_ref())).await {
            Some(millis) => oldest_output = oldest_output.min(millis),
            None => return false,
        }
    }
    for input in inputs {
        if let Some(millis) = file_millis(&base.join(input.as_ref())).await {
            if millis > oldest_output {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    fn touch(path: &Path, secs_after_epoch: u64) {
        let file = File::create(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = scan_output_directory(&dir.path().join("absent"), &TimestampMap::new())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_exclusions_apply_regardless_of_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(COMMAND_LOG_FILENAME), 100);
        touch(&dir.path().join("align.log"), 100);
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        touch(&dir.path().join("out.bam"), 100);

        let mut timestamps = TimestampMap::new();
        timestamps.insert("align.log", 1);
        let found = scan_output_directory(dir.path(), &timestamps).await.unwrap();
        assert_eq!(found, vec![dir.path().join("out.bam")]);
    }

    #[tokio::test]
    async fn test_new_means_unrecorded_or_strictly_newer() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("fresh.txt"), 200);
        touch(&dir.path().join("same.txt"), 200);
        touch(&dir.path().join("older.txt"), 100);
        touch(&dir.path().join("newer.txt"), 300);

        let mut timestamps = TimestampMap::new();
        timestamps.insert("same.txt", 200_000);
        timestamps.insert("older.txt", 200_000);
        timestamps.insert("newer.txt", 200_000);

        let found = scan_output_directory(dir.path(), &timestamps).await.unwrap();
        assert_eq!(
            found,
            vec![dir.path().join("fresh.txt"), dir.path().join("newer.txt")]
        );
    }

    #[tokio::test]
    async fn test_record_then_rescan_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.txt"), 500);
        let mut timestamps = TimestampMap::new();
        timestamps.record(dir.path()).await.unwrap();
        assert_eq!(timestamps.get("a.txt"), Some(500_000));
        assert!(scan_output_directory(dir.path(), &timestamps).await.unwrap().is_empty());

        let path = timestamp_path(dir.path());
        timestamps.save(&path).await.unwrap();
        assert_eq!(TimestampMap::load(&path).await.unwrap(), timestamps);
        assert!(TimestampMap::load(&dir.path().join("none.json")).await.unwrap().is_empty());
    }

    #[test]
    fn test_matcher_skips_ignorable_outputs() {
        let cache = GlobCache::new();
        let matcher = OutputMatcher::new(&["*.out", "result.txt"], vec!["cmd.out".to_string()], &cache).unwrap();
        assert!(matcher.is_declared(Path::new("/w/sample.out")));
        assert!(matcher.is_declared(Path::new("/w/result.txt")));
        assert!(!matcher.is_declared(Path::new("/w/cmd.out")));
        assert!(!matcher.is_declared(Path::new("/w/result.txt.gz")));
    }

    #[tokio::test]
    async fn test_up_to_date_rules() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        touch(&base.join("in.fq"), 100);
        touch(&base.join("out.bam"), 200);

        assert!(outputs_up_to_date(base, &["out.bam"], &["in.fq"]).await);
        assert!(!outputs_up_to_date::<&str>(base, &[], &["in.fq"]).await);
        assert!(!outputs_up_to_date(base, &["out.bam", "out.bai"], &["in.fq"]).await);

        let file = File::options().write(true).open(base.join("in.fq")).unwrap();
        file.set_modified(SystemTime::now()).unwrap();
        assert!(!outputs_up_to_date(base, &["out.bam"], &["in.fq"]).await);
        assert_eq!(missing_files(base, &["in.fq", "gone.fq"]).await, vec!["gone.fq"]);
    }
}
