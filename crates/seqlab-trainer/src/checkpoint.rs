//! Per-epoch weight checkpoints with bounded retention.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use seqlab_core::{Result, SeqLabError, SequenceModel};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Writes one checkpoint per epoch under a fold directory.
///
/// Files are written to `epoch_NNNN.tmp` and renamed into place, so a
/// checkpoint path either holds complete weights or does not exist. At most
/// `keep` checkpoints stay on disk; the best one is never pruned. Without a
/// configured root the checkpoints live in a temporary directory that is
/// removed when the manager is dropped.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    _scratch: Option<TempDir>,
    keep: usize,
    saved: VecDeque<(usize, PathBuf)>,
    best: Option<(usize, PathBuf)>,
}

impl CheckpointManager {
    pub fn new(root: Option<&Path>, fold: usize, keep: usize) -> Result<Self> {
        let (base, scratch) = match root {
            Some(root) => (root.to_path_buf(), None),
            None => {
                let scratch = tempfile::Builder::new()
                    .prefix("seqlab-checkpoints-")
                    .tempdir()
                    .map_err(|e| {
                        SeqLabError::persistence(
                            std::env::temp_dir(),
                            format!("cannot create temporary checkpoint directory: {e}"),
                        )
                    })?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };

        let dir = base.join(format!("fold_{fold}"));
        fs::create_dir_all(&dir)
            .map_err(|e| SeqLabError::persistence(&dir, format!("cannot create checkpoint directory: {e}")))?;

        Ok(Self {
            dir,
            _scratch: scratch,
            keep: keep.max(1),
            saved: VecDeque::new(),
            best: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `model` as the checkpoint of `epoch`.
    pub fn save<M: SequenceModel + ?Sized>(
        &mut self,
        model: &M,
        epoch: usize,
        is_best: bool,
    ) -> Result<PathBuf> {
        let tmp = self.dir.join(format!("epoch_{epoch:04}.tmp"));
        let path = self.dir.join(format!("epoch_{epoch:04}.safetensors"));

        model.save(&tmp)?;
        fs::rename(&tmp, &path)
            .map_err(|e| SeqLabError::persistence(&path, format!("cannot move checkpoint into place: {e}")))?;
        debug!(epoch, path = %path.display(), is_best, "checkpoint written");

        self.saved.push_back((epoch, path.clone()));
        if is_best {
            self.best = Some((epoch, path.clone()));
        }
        self.prune();
        Ok(path)
    }

    fn prune(&mut self) {
        while self.saved.len() > self.keep {
            let best = self.best.as_ref().map(|(epoch, _)| *epoch);
            let Some(pos) = self.saved.iter().position(|(epoch, _)| Some(*epoch) != best) else {
                return;
            };
            if let Some((epoch, path)) = self.saved.remove(pos) {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(epoch, error = %e, "failed to remove old checkpoint");
                }
            }
        }
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.as_ref().map(|(epoch, _)| *epoch)
    }

    pub fn best_path(&self) -> Option<&Path> {
        self.best.as_ref().map(|(_, path)| path.as_path())
    }

    /// Epochs whose checkpoints are currently on disk, oldest first.
    pub fn retained_epochs(&self) -> Vec<usize> {
        self.saved.iter().map(|(epoch, _)| *epoch).collect()
    }

    /// Load the best checkpoint into `model`.
    pub fn restore_best<M: SequenceModel + ?Sized>(&self, model: &mut M) -> Result<usize> {
        let (epoch, path) = self
            .best
            .as_ref()
            .ok_or_else(|| SeqLabError::persistence(&self.dir, "no best checkpoint recorded"))?;
        model.load(path)?;
        debug!(epoch, "restored best checkpoint");
        Ok(*epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::CountingModel;
    use tempfile::tempdir;

    #[test]
    fn test_retention_keeps_best() {
        let root = tempdir().unwrap();
        let mut manager = CheckpointManager::new(Some(root.path()), 0, 2).unwrap();
        let mut model = CountingModel::default();

        manager.save(&model, 1, true).unwrap();
        for epoch in 2..=4 {
            model.version = epoch;
            manager.save(&model, epoch, false).unwrap();
        }

        assert_eq!(manager.retained_epochs(), vec![1, 4]);
        assert!(manager.best_path().unwrap().exists());
        assert!(!manager.dir().join("epoch_0002.safetensors").exists());
        assert!(!manager.dir().join("epoch_0004.tmp").exists());

        assert_eq!(manager.restore_best(&mut model).unwrap(), 1);
        assert_eq!(model.version, 0);
    }

    #[test]
    fn test_configured_directory_survives_drop() {
        let root = tempdir().unwrap();
        let mut manager = CheckpointManager::new(Some(root.path()), 1, 1).unwrap();
        manager.save(&CountingModel::default(), 1, true).unwrap();
        let dir = manager.dir().to_path_buf();
        drop(manager);
        assert!(dir.join("epoch_0001.safetensors").exists());
    }

    #[test]
    fn test_temporary_directory_removed_on_drop() {
        let manager = CheckpointManager::new(None, 3, 1).unwrap();
        let dir = manager.dir().to_path_buf();
        assert!(dir.ends_with("fold_3"));
        assert!(dir.exists());
        drop(manager);
        assert!(!dir.exists());
    }

    #[test]
    fn test_restore_without_best() {
        let manager = CheckpointManager::new(None, 0, 1).unwrap();
        let mut model = CountingModel::default();
        assert!(manager.restore_best(&mut model).is_err());
    }
}
