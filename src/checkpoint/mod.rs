//! Checkpoint and snapshot persistence.
//!
//! A checkpoint is a directory `<root>/ckpt_<iteration:012>/` holding three
//! artifacts named after the directory:
//!
//! ```text
//! ckpt_000000100000/
//! ├── ckpt_000000100000.strategy.bin   average strategy table (bincode)
//! ├── ckpt_000000100000.json           metadata (JSON)
//! └── ckpt_000000100000.regrets.bin    full regret store snapshot (bincode)
//! ```
//!
//! Artifacts are written into a hidden temporary directory, synced, and the
//! directory is renamed into place, so a crash mid-write never produces a
//! directory that looks complete.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cfr::config::{DiscountSchedule, TrainingConfig, TrainingMetrics};
use crate::cfr::key::KEY_VERSION;
use crate::cfr::store::{self, RegretStore, StoreBackend, StoreSnapshot, StrategyTable};
use crate::cfr::stream::StreamState;
use crate::error::{Result, SolverError};

/// Layout version of the metadata file.
pub const FORMAT_VERSION: u32 = 1;

const DIR_PREFIX: &str = "ckpt_";
const TMP_PREFIX: &str = ".tmp-ckpt_";

/// The three files that make up a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// Average strategy table.
    Strategy,
    /// Metadata JSON.
    Meta,
    /// Regret store snapshot.
    Regrets,
}

impl Artifact {
    /// All artifacts, in write order.
    pub const ALL: [Artifact; 3] = [Artifact::Strategy, Artifact::Meta, Artifact::Regrets];

    /// File name inside a checkpoint directory named `base`.
    pub fn file_name(&self, base: &str) -> String {
        match self {
            Artifact::Strategy => format!("{base}.strategy.bin"),
            Artifact::Meta => format!("{base}.json"),
            Artifact::Regrets => format!("{base}.regrets.bin"),
        }
    }
}

/// Checkpoint metadata, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Layout version, currently [`FORMAT_VERSION`].
    pub format_version: u32,
    /// Completed iterations.
    pub iteration: u64,
    /// Wall-clock training time so far.
    pub elapsed_seconds: f64,
    /// Metrics at save time.
    pub metrics: TrainingMetrics,
    /// One stream state per worker index.
    pub random_stream_state: Vec<StreamState>,
    /// Hash of the abstraction index the store was trained against.
    pub abstraction_hash: String,
    /// Hash of the training configuration.
    pub config_hash: String,
    /// Infoset key codec version.
    pub key_version: u8,
    /// Number of seats in the game.
    pub num_players: usize,
    /// Store backend.
    pub backend: StoreBackend,
    /// Discount schedule in force.
    pub discount: DiscountSchedule,
    /// Factors of the most recent discount, if any was applied.
    pub last_discount: Option<(f64, f64)>,
    /// Exploration rate at the saved iteration.
    pub epsilon: f64,
    /// Seconds since the Unix epoch when the checkpoint was taken.
    pub created_unix: u64,
}

impl CheckpointMeta {
    /// Build metadata for the given training state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        iteration: u64,
        elapsed_seconds: f64,
        metrics: TrainingMetrics,
        random_stream_state: Vec<StreamState>,
        abstraction_hash: String,
        config: &TrainingConfig,
        num_players: usize,
        last_discount: Option<(f64, f64)>,
    ) -> Result<Self> {
        let created_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(Self {
            format_version: FORMAT_VERSION,
            iteration,
            elapsed_seconds,
            metrics,
            random_stream_state,
            abstraction_hash,
            config_hash: config.config_hash()?,
            key_version: KEY_VERSION,
            num_players,
            backend: config.backend,
            discount: config.sampler.discount.clone(),
            last_discount,
            epsilon: config.sampler.epsilon.epsilon(iteration),
            created_unix,
        })
    }

    /// Log a warning when the checkpoint was written under another config.
    ///
    /// Resuming with a changed config is allowed (for example a different
    /// worker count), so this never fails.
    pub fn warn_on_config_drift(&self, config: &TrainingConfig) {
        match config.config_hash() {
            Ok(current) if current == self.config_hash => {}
            Ok(current) => warn!(
                "checkpoint at iteration {} was written with config {}, resuming with {}",
                self.iteration, self.config_hash, current
            ),
            Err(err) => warn!("could not hash the resumed config: {err}"),
        }
    }
}

/// Strategy artifact as written to `*.strategy.bin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyArtifact {
    /// Hash of the abstraction index.
    pub abstraction_hash: String,
    /// Infoset key codec version.
    pub key_version: u8,
    /// Iteration the table was taken at.
    pub iteration: u64,
    /// Normalized average strategies.
    pub table: StrategyTable,
}

/// A checkpoint read back from disk.
pub struct LoadedCheckpoint {
    /// Directory the checkpoint was read from.
    pub path: PathBuf,
    /// Metadata.
    pub meta: CheckpointMeta,
    /// Store rebuilt from the regret snapshot.
    pub store: Box<dyn RegretStore>,
}

impl std::fmt::Debug for LoadedCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedCheckpoint")
            .field("path", &self.path)
            .field("iteration", &self.meta.iteration)
            .field("infosets", &self.store.num_infosets())
            .finish()
    }
}

/// A checkpoint directory found under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    /// Iteration encoded in the directory name.
    pub iteration: u64,
    /// Directory path.
    pub path: PathBuf,
    /// Whether all artifacts are present.
    pub complete: bool,
}

/// Reads and writes checkpoints under one root directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
    keep: usize,
}

impl CheckpointManager {
    /// Manager for `root`, keeping every checkpoint.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            keep: 0,
        }
    }

    /// Keep only the newest `keep` complete checkpoints (0 keeps all).
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.keep = keep;
        self
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name for a checkpoint at `iteration`.
    pub fn dir_name(iteration: u64) -> String {
        format!("{DIR_PREFIX}{iteration:012}")
    }

    /// Directory a checkpoint at `iteration` is written to.
    pub fn path_for(&self, iteration: u64) -> PathBuf {
        self.root.join(Self::dir_name(iteration))
    }

    /// Write a checkpoint of `store` with `meta`.
    ///
    /// Fails with [`SolverError::CheckpointExists`] if a checkpoint for the
    /// same iteration is already in place. On any failure the temporary
    /// directory is removed again.
    pub fn save(&self, meta: &CheckpointMeta, store: &dyn RegretStore) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let target = self.path_for(meta.iteration);

        let tmp = self
            .root
            .join(format!("{TMP_PREFIX}{}-{}", meta.iteration, std::process::id()));
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let snapshot = store.export();
        let published = Self::stage(&tmp, meta, &snapshot).and_then(|()| {
            // Renaming onto a populated directory fails, so a concurrent
            // writer that got there first is reported rather than replaced.
            fs::rename(&tmp, &target).map_err(|err| {
                if Self::is_populated(&target) {
                    SolverError::CheckpointExists(target.clone())
                } else {
                    SolverError::from(err)
                }
            })
        });
        if let Err(err) = published {
            if let Err(cleanup) = fs::remove_dir_all(&tmp) {
                warn!("could not remove {}: {cleanup}", tmp.display());
            }
            return Err(err);
        }
        sync_dir(&self.root)?;

        info!(
            "checkpoint {} written ({} infosets)",
            target.display(),
            snapshot.len()
        );

        if self.keep > 0 {
            self.prune()?;
        }
        Ok(target)
    }

    fn stage(tmp: &Path, meta: &CheckpointMeta, snapshot: &StoreSnapshot) -> Result<()> {
        let base = Self::dir_name(meta.iteration);
        let strategy = StrategyArtifact {
            abstraction_hash: meta.abstraction_hash.clone(),
            key_version: meta.key_version,
            iteration: meta.iteration,
            table: snapshot.strategy_table(),
        };

        write_synced(&tmp.join(Artifact::Strategy.file_name(&base)), |w| {
            bincode::serialize_into(w, &strategy).map_err(SolverError::from)
        })?;
        write_synced(&tmp.join(Artifact::Meta.file_name(&base)), |w| {
            serde_json::to_writer_pretty(w, meta).map_err(SolverError::from)
        })?;
        write_synced(&tmp.join(Artifact::Regrets.file_name(&base)), |w| {
            bincode::serialize_into(w, snapshot).map_err(SolverError::from)
        })?;
        sync_dir(tmp)
    }

    fn is_populated(path: &Path) -> bool {
        fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Artifacts missing from a checkpoint directory.
    pub fn missing_artifacts(path: &Path) -> Vec<String> {
        let base = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Artifact::ALL.iter().map(|a| a.file_name("?")).collect(),
        };
        Artifact::ALL
            .iter()
            .map(|a| a.file_name(&base))
            .filter(|name| !path.join(name).is_file())
            .collect()
    }

    /// Whether all three artifacts are present.
    pub fn is_complete(path: &Path) -> bool {
        Self::missing_artifacts(path).is_empty()
    }

    /// Checkpoint directories under the root, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_dir() {
                continue;
            }
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(iteration) = name
                .strip_prefix(DIR_PREFIX)
                .and_then(|digits| digits.parse::<u64>().ok())
            else {
                continue;
            };
            let path = dirent.path();
            let complete = Self::is_complete(&path);
            entries.push(CheckpointEntry {
                iteration,
                path,
                complete,
            });
        }
        entries.sort_by_key(|e| e.iteration);
        Ok(entries)
    }

    /// Newest complete checkpoint; incomplete ones are logged and skipped.
    pub fn latest_complete(&self) -> Result<Option<PathBuf>> {
        for entry in self.list()?.into_iter().rev() {
            if entry.complete {
                return Ok(Some(entry.path));
            }
            warn!(
                "skipping incomplete checkpoint {}: missing {:?}",
                entry.path.display(),
                Self::missing_artifacts(&entry.path)
            );
        }
        Ok(None)
    }

    /// Delete all but the newest `keep` complete checkpoints.
    ///
    /// Returns the number of directories removed. Incomplete directories
    /// are left in place for inspection.
    pub fn prune(&self) -> Result<usize> {
        if self.keep == 0 {
            return Ok(0);
        }
        let complete: Vec<_> = self.list()?.into_iter().filter(|e| e.complete).collect();
        let excess = complete.len().saturating_sub(self.keep);
        for entry in &complete[..excess] {
            debug!("removing old checkpoint {}", entry.path.display());
            fs::remove_dir_all(&entry.path)?;
        }
        Ok(excess)
    }

    /// Read only the metadata of a complete checkpoint.
    pub fn read_meta(path: &Path) -> Result<CheckpointMeta> {
        let missing = Self::missing_artifacts(path);
        if !missing.is_empty() {
            return Err(SolverError::IncompleteCheckpoint {
                path: path.to_path_buf(),
                missing,
            });
        }
        let base = dir_base(path)?;
        let file = File::open(path.join(Artifact::Meta.file_name(&base)))?;
        let meta: CheckpointMeta = serde_json::from_reader(BufReader::new(file))?;
        if meta.format_version != FORMAT_VERSION {
            return Err(SolverError::Serialization(format!(
                "checkpoint format v{} is not supported (expected v{})",
                meta.format_version, FORMAT_VERSION
            )));
        }
        Ok(meta)
    }

    /// Load a checkpoint trained against the abstraction `expected_hash`.
    ///
    /// Metadata is checked before any blob is read, so a mismatch costs
    /// nothing and leaves the caller's state as it was.
    pub fn load(&self, path: &Path, expected_hash: &str) -> Result<LoadedCheckpoint> {
        let meta = Self::read_meta(path)?;
        check_provenance(&meta.abstraction_hash, meta.key_version, expected_hash)?;

        let base = dir_base(path)?;
        let file = File::open(path.join(Artifact::Regrets.file_name(&base)))?;
        let snapshot: StoreSnapshot = bincode::deserialize_from(BufReader::new(file))?;
        if snapshot.backend != meta.backend {
            warn!(
                "regret snapshot backend {} differs from metadata {}",
                snapshot.backend, meta.backend
            );
        }
        let store = store::from_snapshot(&snapshot);
        info!(
            "loaded checkpoint {} at iteration {} ({} infosets)",
            path.display(),
            meta.iteration,
            store.num_infosets()
        );
        Ok(LoadedCheckpoint {
            path: path.to_path_buf(),
            meta,
            store,
        })
    }

    /// Load the average strategy table of a checkpoint.
    pub fn load_strategy(path: &Path, expected_hash: &str) -> Result<StrategyArtifact> {
        let meta = Self::read_meta(path)?;
        check_provenance(&meta.abstraction_hash, meta.key_version, expected_hash)?;
        let base = dir_base(path)?;
        let file = File::open(path.join(Artifact::Strategy.file_name(&base)))?;
        let artifact: StrategyArtifact = bincode::deserialize_from(BufReader::new(file))?;
        check_provenance(&artifact.abstraction_hash, artifact.key_version, expected_hash)?;
        Ok(artifact)
    }
}

fn check_provenance(found_hash: &str, found_version: u8, expected_hash: &str) -> Result<()> {
    if found_hash != expected_hash {
        return Err(SolverError::AbstractionMismatch {
            expected: expected_hash.to_string(),
            found: found_hash.to_string(),
        });
    }
    if found_version != KEY_VERSION {
        return Err(SolverError::VersionMismatch {
            expected: KEY_VERSION,
            found: found_version,
        });
    }
    Ok(())
}

fn dir_base(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| SolverError::IncompleteCheckpoint {
            path: path.to_path_buf(),
            missing: Artifact::ALL.iter().map(|a| a.file_name("?")).collect(),
        })
}

fn write_synced<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<()>,
{
    let file = File::create(path)?;
    {
        let mut writer = BufWriter::new(&file);
        write(&mut writer)?;
        writer.flush()?;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfr::key::{History, KeyCodec};
    use crate::cfr::stream::RandomStream;
    use rand::RngCore;

    fn trained_store() -> Box<dyn RegretStore> {
        let mut store = store::new_store(StoreBackend::Dense, Some(-1e6));
        let codec = KeyCodec::current();
        for bucket in 0..4u16 {
            let key = codec.encode(1, bucket, 0, History::new()).unwrap();
            store.update_regret(&key, 0, f64::from(bucket) + 0.5);
            store.update_regret(&key, 1, -2.0);
            store.accumulate_strategy(&key, 1.0, &[0.75, 0.25]);
        }
        store
    }

    fn meta(iteration: u64, hash: &str, stream: StreamState) -> CheckpointMeta {
        CheckpointMeta::new(
            iteration,
            1.5,
            TrainingMetrics::new(),
            vec![stream],
            hash.to_string(),
            &TrainingConfig::default(),
            2,
            Some((0.5, 0.5)),
        )
        .unwrap()
    }

    #[test]
    fn round_trip_restores_store_and_stream() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());

        let mut rng = RandomStream::from_seed(9);
        rng.next_u64();
        let state = rng.state();
        let expected_next = rng.next_u64();

        let store = trained_store();
        let path = manager.save(&meta(100, "abc", state), store.as_ref()).unwrap();
        assert!(path.ends_with("ckpt_000000000100"));
        assert!(CheckpointManager::is_complete(&path));

        let loaded = manager.load(&path, "abc").unwrap();
        assert_eq!(loaded.meta.iteration, 100);
        assert_eq!(loaded.meta.last_discount, Some((0.5, 0.5)));
        assert_eq!(loaded.store.export(), store.export());

        let mut restored = RandomStream::from_state(&loaded.meta.random_stream_state[0]).unwrap();
        assert_eq!(restored.next_u64(), expected_next);

        let strategy = CheckpointManager::load_strategy(&path, "abc").unwrap();
        assert_eq!(strategy.table, store.export().strategy_table());
    }

    #[test]
    fn mismatched_abstraction_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let stream = RandomStream::from_seed(1).state();
        let path = manager
            .save(&meta(10, "aaaa", stream), trained_store().as_ref())
            .unwrap();

        match manager.load(&path, "bbbb") {
            Err(SolverError::AbstractionMismatch { expected, found }) => {
                assert_eq!(expected, "bbbb");
                assert_eq!(found, "aaaa");
            }
            other => panic!("expected abstraction mismatch, got {other:?}"),
        }
        assert!(matches!(
            CheckpointManager::load_strategy(&path, "bbbb"),
            Err(SolverError::AbstractionMismatch { .. })
        ));
    }

    #[test]
    fn incomplete_checkpoints_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let stream = RandomStream::from_seed(1).state();
        let good = manager
            .save(&meta(10, "h", stream.clone()), trained_store().as_ref())
            .unwrap();
        let newer = manager
            .save(&meta(20, "h", stream), trained_store().as_ref())
            .unwrap();
        fs::remove_file(newer.join("ckpt_000000000020.regrets.bin")).unwrap();

        assert!(!CheckpointManager::is_complete(&newer));
        assert_eq!(manager.latest_complete().unwrap(), Some(good));
        match manager.load(&newer, "h") {
            Err(SolverError::IncompleteCheckpoint { missing, .. }) => {
                assert_eq!(missing, vec!["ckpt_000000000020.regrets.bin".to_string()]);
            }
            other => panic!("expected incomplete checkpoint, got {other:?}"),
        }
    }

    #[test]
    fn existing_checkpoint_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let stream = RandomStream::from_seed(1).state();
        let store = trained_store();
        manager.save(&meta(5, "h", stream.clone()), store.as_ref()).unwrap();
        assert!(matches!(
            manager.save(&meta(5, "h", stream), store.as_ref()),
            Err(SolverError::CheckpointExists(_))
        ));
    }

    #[test]
    fn losing_writer_leaves_no_temporary_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let stream = RandomStream::from_seed(1).state();

        // Another writer already published iteration 7.
        let target = manager.path_for(7);
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("ckpt_000000000007.json"), b"{}").unwrap();

        assert!(matches!(
            manager.save(&meta(7, "h", stream), trained_store().as_ref()),
            Err(SolverError::CheckpointExists(_))
        ));
        let leftovers: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(TMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        assert_eq!(fs::read(target.join("ckpt_000000000007.json")).unwrap(), b"{}");
    }

    #[test]
    fn empty_target_directory_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        fs::create_dir_all(manager.path_for(3)).unwrap();
        let stream = RandomStream::from_seed(1).state();
        let path = manager
            .save(&meta(3, "h", stream), trained_store().as_ref())
            .unwrap();
        assert!(CheckpointManager::is_complete(&path));
    }

    #[test]
    fn retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).with_retention(2);
        let stream = RandomStream::from_seed(1).state();
        let store = trained_store();
        for iteration in [10, 20, 30, 40] {
            manager
                .save(&meta(iteration, "h", stream.clone()), store.as_ref())
                .unwrap();
        }
        let kept: Vec<u64> = manager.list().unwrap().iter().map(|e| e.iteration).collect();
        assert_eq!(kept, vec![30, 40]);
    }

    #[test]
    fn empty_root_has_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("missing"));
        assert_eq!(manager.latest_complete().unwrap(), None);
    }
}
