//! チェックポイントの保存先管理
//!
//! ```text
//! checkpoints/
//!   model.tar.gz              ← Overwrite
//!   model-00000100.tar.gz     ← Versioned
//!   latest.json               ← 最後に保存したアーカイブ
//! ```

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{EmuError, Result};
use crate::ml::layer_spec::{InputShape, LayerSpec};
use crate::ml::network::{build, EmotionNet};
use crate::model::model_metadata::{CheckpointMetadata, CHECKPOINT_FORMAT_VERSION};
use crate::model::model_storage::{load_checkpoint_archive, save_checkpoint_archive};

const LATEST_POINTER: &str = "latest.json";
const ARCHIVE_EXTENSION: &str = "tar.gz";

/// 保存方針
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// 毎回同じファイルに上書き
    Overwrite,
    /// ステップ番号付きで保存し、新しい順に `keep_last` 個を残す
    Versioned { keep_last: usize },
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy::Overwrite
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LatestPointer {
    file: String,
    step: usize,
}

/// チェックポイントの保存ディレクトリ
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    name: String,
    policy: CheckpointPolicy,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            name: "model".to_string(),
            policy: CheckpointPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> CheckpointPolicy {
        self.policy
    }

    /// 指定ステップのアーカイブパス
    pub fn path_for_step(&self, step: usize) -> PathBuf {
        match self.policy {
            CheckpointPolicy::Overwrite => self.dir.join(format!("{}.{ARCHIVE_EXTENSION}", self.name)),
            CheckpointPolicy::Versioned { .. } => {
                self.dir.join(format!("{}-{:08}.{ARCHIVE_EXTENSION}", self.name, step))
            }
        }
    }

    /// モデルの重みとメタデータを保存し、保存先のパスを返す
    pub fn save<B: Backend>(
        &self,
        model: &EmotionNet<B>,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        let path = self.path_for_step(metadata.step);
        let persist_error = |source: io::Error| EmuError::CheckpointPersistFailure {
            path: path.clone(),
            source,
        };

        let model_binary = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(model.clone().into_record(), ())
            .map_err(|e| persist_error(io::Error::other(format!("{:?}", e))))?;

        save_checkpoint_archive(&path, metadata, &model_binary).map_err(persist_error)?;
        self.write_latest(&path, metadata.step).map_err(persist_error)?;

        if let CheckpointPolicy::Versioned { keep_last } = self.policy {
            // 古いアーカイブの削除失敗は保存自体の失敗ではない
            if let Err(e) = self.prune(keep_last) {
                tracing::warn!("古いチェックポイントの削除に失敗しました: {}", e);
            }
        }

        tracing::debug!(
            "チェックポイントを保存しました: {} ({} バイト)",
            path.display(),
            model_binary.len()
        );
        Ok(path)
    }

    fn write_latest(&self, path: &Path, step: usize) -> io::Result<()> {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let json = serde_json::to_string_pretty(&LatestPointer { file, step })
            .map_err(io::Error::other)?;
        fs::write(self.dir.join(LATEST_POINTER), json)
    }

    fn versioned_archives(&self) -> io::Result<Vec<PathBuf>> {
        let prefix = format!("{}-", self.name);
        let suffix = format!(".{ARCHIVE_EXTENSION}");
        let mut archives: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(&suffix))
            })
            .collect();
        // ステップ番号はゼロ埋めなので名前順 = ステップ順
        archives.sort();
        Ok(archives)
    }

    fn prune(&self, keep_last: usize) -> io::Result<()> {
        let archives = self.versioned_archives()?;
        let excess = archives.len().saturating_sub(keep_last.max(1));
        for path in &archives[..excess] {
            fs::remove_file(path)?;
            tracing::debug!("古いチェックポイントを削除しました: {}", path.display());
        }
        Ok(())
    }

    /// 最後に保存したアーカイブ
    pub fn latest(&self) -> Result<PathBuf> {
        resolve_checkpoint(&self.dir)
    }
}

/// アーカイブまたは保存ディレクトリのパスから読み込むアーカイブを決定
pub fn resolve_checkpoint(path: &Path) -> Result<PathBuf> {
    if path.is_dir() {
        let pointer_path = path.join(LATEST_POINTER);
        let json = fs::read_to_string(&pointer_path)
            .map_err(|e| EmuError::load_failure(&pointer_path, format!("no latest checkpoint: {e}")))?;
        let pointer: LatestPointer = serde_json::from_str(&json)
            .map_err(|e| EmuError::load_failure(&pointer_path, e))?;
        return Ok(path.join(pointer.file));
    }

    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    let with_extension = path.with_extension(ARCHIVE_EXTENSION);
    if with_extension.is_file() {
        return Ok(with_extension);
    }

    Err(EmuError::load_failure(path, "checkpoint not found"))
}

/// チェックポイントからネットワークを復元
///
/// レイヤーリストがチェックポイントと異なる場合、または復元した
/// パラメータ形状が一致しない場合は失敗します。
pub fn restore<B: Backend>(
    spec: &LayerSpec,
    checkpoint_path: &Path,
    device: &B::Device,
) -> Result<(EmotionNet<B>, CheckpointMetadata)> {
    let path = resolve_checkpoint(checkpoint_path)?;
    let (metadata, model_binary) =
        load_checkpoint_archive(&path).map_err(|e| EmuError::load_failure(&path, e))?;

    if metadata.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(EmuError::load_failure(
            &path,
            format!("unsupported format version {}", metadata.format_version),
        ));
    }
    if &metadata.layers != spec {
        return Err(EmuError::load_failure(
            &path,
            "layer spec does not match the checkpoint",
        ));
    }
    if Some(metadata.labels.len()) != spec.category_count() {
        return Err(EmuError::load_failure(
            &path,
            format!("checkpoint has {} labels", metadata.labels.len()),
        ));
    }

    let model: EmotionNet<B> = build(spec, InputShape::new(1, metadata.input_dims), device)
        .map_err(|e| EmuError::load_failure(&path, e))?;
    let expected_shapes = model.parameter_shapes();

    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(model_binary, device)
        .map_err(|e| EmuError::load_failure(&path, format!("{:?}", e)))?;
    let model = model.load_record(record);

    if model.parameter_shapes() != expected_shapes {
        return Err(EmuError::load_failure(
            &path,
            "parameter shapes do not match the layer spec",
        ));
    }

    tracing::info!(
        "チェックポイントを読み込みました: {} (step {})",
        path.display(),
        metadata.step
    );
    Ok((model, metadata))
}
