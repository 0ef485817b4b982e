//! チェックポイントの保存・復元と保持数の管理。
//!
//! ディレクトリ構成:
//!
//! ```text
//! <root>/<run_name>/checkpoint_0000010000/
//!     model.mpk   モデルのパラメータ
//!     optim.mpk   オプティマイザの状態
//!     meta.json   ステップ数と損失の重み
//! ```
//!
//! 書き込みは `.tmp` ディレクトリに行い、完了後に名前を変更します。
//! そのため `meta.json` を持つ `checkpoint_*` ディレクトリは常に完全なスナップショットです。

use crate::error::{PinnError, Result};
use crate::weighting::WeightVector;
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const MODEL_FILE: &str = "model";
const OPTIM_FILE: &str = "optim";
const META_FILE: &str = "meta.json";
const PREFIX: &str = "checkpoint_";
const TMP_SUFFIX: &str = ".tmp";

type SnapshotRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// `meta.json` の内容。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub run_name: String,
    pub weights: Option<WeightVector>,
}

/// 復元したスナップショット。
pub struct Checkpoint<M, R> {
    pub step: usize,
    pub model: M,
    pub optimizer: R,
    pub weights: Option<WeightVector>,
    pub path: PathBuf,
}

/// 復元するスナップショットの指定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    Latest,
    Step(usize),
    Path(PathBuf),
}

/// 実行名ごとのディレクトリにスナップショットを保存し、新しい方から
/// `num_keep_ckpts` 個だけを残します。
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    run_name: String,
    num_keep: usize,
}

impl CheckpointManager {
    pub fn new(root: impl AsRef<Path>, run_name: &str, num_keep_ckpts: usize) -> Result<Self> {
        if num_keep_ckpts == 0 {
            return Err(PinnError::InvalidConfig(
                "saving.num_keep_ckpts は 1 以上が必要です".to_string(),
            ));
        }
        let dir = root.as_ref().join(run_name);
        fs::create_dir_all(&dir).map_err(|source| PinnError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            run_name: run_name.to_string(),
            num_keep: num_keep_ckpts,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_dir(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{}{:010}", PREFIX, step))
    }

    /// 完全なスナップショットをステップ順に返します。
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| PinnError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PinnError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_dir() || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let Some(step) = name
                .strip_prefix(PREFIX)
                .and_then(|s| s.parse::<usize>().ok())
            else {
                continue;
            };
            if path.join(META_FILE).is_file() {
                snapshots.push((step, path));
            }
        }
        snapshots.sort_by_key(|(step, _)| *step);
        Ok(snapshots)
    }

    /// 保持しているスナップショットのステップ。
    pub fn steps(&self) -> Result<Vec<usize>> {
        Ok(self.list()?.into_iter().map(|(step, _)| step).collect())
    }

    pub fn latest(&self) -> Result<Option<(usize, PathBuf)>> {
        Ok(self.list()?.pop())
    }

    /// スナップショットを保存し、古いものを削除します。
    ///
    /// 呼び出しは書き込みが完了するまで戻りません。
    pub fn save<B, M, O>(
        &self,
        step: usize,
        model: &M,
        optimizer: &O,
        weights: Option<&WeightVector>,
    ) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let final_dir = self.snapshot_dir(step);
        let tmp_dir = self.dir.join(format!("{}{:010}{}", PREFIX, step, TMP_SUFFIX));
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PinnError::Io { path, source }
        };
        let write_error = |reason: String| PinnError::CheckpointWrite {
            path: final_dir.clone(),
            reason,
        };

        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).map_err(io_error(&tmp_dir))?;
        }
        fs::create_dir_all(&tmp_dir).map_err(io_error(&tmp_dir))?;

        let recorder = SnapshotRecorder::new();
        model
            .clone()
            .save_file(tmp_dir.join(MODEL_FILE), &recorder)
            .map_err(|e| write_error(e.to_string()))?;
        Recorder::<B>::record(&recorder, optimizer.to_record(), tmp_dir.join(OPTIM_FILE))
            .map_err(|e| write_error(e.to_string()))?;

        let meta = CheckpointMeta {
            step,
            run_name: self.run_name.clone(),
            weights: weights.cloned(),
        };
        let json = serde_json::to_string_pretty(&meta).map_err(|e| write_error(e.to_string()))?;
        let meta_path = tmp_dir.join(META_FILE);
        fs::write(&meta_path, json).map_err(io_error(&meta_path))?;

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir).map_err(io_error(&final_dir))?;
        }
        fs::rename(&tmp_dir, &final_dir).map_err(io_error(&final_dir))?;
        tracing::info!("チェックポイントを保存しました: step {} -> {}", step, final_dir.display());

        self.prune()?;
        Ok(final_dir)
    }

    /// 新しい方から `num_keep_ckpts` 個を残して削除し、削除したステップを返します。
    fn prune(&self) -> Result<Vec<usize>> {
        let snapshots = self.list()?;
        if snapshots.len() <= self.num_keep {
            return Ok(Vec::new());
        }
        let excess = snapshots.len() - self.num_keep;
        let mut removed = Vec::with_capacity(excess);
        for (step, path) in snapshots.into_iter().take(excess) {
            fs::remove_dir_all(&path).map_err(|source| PinnError::Io {
                path: path.clone(),
                source,
            })?;
            tracing::info!("古いチェックポイントを削除しました: step {}", step);
            removed.push(step);
        }
        Ok(removed)
    }

    /// スナップショットを読み込みます。
    ///
    /// 見つからなければ `CheckpointNotFound`、読み込めなければ `CorruptCheckpoint` です。
    /// どちらの場合も最初からの学習に切り替えてはいけません。
    pub fn restore<B, M, O>(
        &self,
        target: RestoreTarget,
        model: M,
        device: &B::Device,
    ) -> Result<Checkpoint<M, O::Record>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let path = match target {
            RestoreTarget::Latest => self
                .latest()?
                .map(|(_, path)| path)
                .ok_or_else(|| PinnError::CheckpointNotFound(self.dir.clone()))?,
            RestoreTarget::Step(step) => self.snapshot_dir(step),
            RestoreTarget::Path(path) => path,
        };
        if !path.is_dir() {
            return Err(PinnError::CheckpointNotFound(path));
        }

        let corrupt = |reason: String| PinnError::CorruptCheckpoint {
            path: path.clone(),
            reason,
        };

        let json = fs::read_to_string(path.join(META_FILE))
            .map_err(|e| corrupt(format!("{} を読めません: {}", META_FILE, e)))?;
        let meta: CheckpointMeta =
            serde_json::from_str(&json).map_err(|e| corrupt(e.to_string()))?;

        let recorder = SnapshotRecorder::new();
        let model = model
            .load_file(path.join(MODEL_FILE), &recorder, device)
            .map_err(|e| corrupt(e.to_string()))?;
        let optimizer: O::Record = Recorder::<B>::load(&recorder, path.join(OPTIM_FILE), device)
            .map_err(|e| corrupt(e.to_string()))?;

        tracing::info!("チェックポイントを読み込みました: step {}", meta.step);
        Ok(Checkpoint {
            step: meta.step,
            model,
            optimizer,
            weights: meta.weights,
            path,
        })
    }
}
