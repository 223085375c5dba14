//! モデルサブシステムのエラー定義

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = EmuError> = std::result::Result<T, E>;

/// ネットワーク構築・学習・推論で発生するエラー
#[derive(Debug, Error)]
pub enum EmuError {
    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("architecture mismatch: expected {expected}, got {actual}")]
    ArchitectureMismatch { expected: usize, actual: usize },

    #[error("invalid hyperparameters: {0}")]
    InvalidHyperparameters(String),

    #[error("data exhausted: requested {requested} examples, only {available} available")]
    DataExhausted { requested: usize, available: usize },

    #[error("failed to persist checkpoint {path:?}: {source}")]
    CheckpointPersistFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load checkpoint {path:?}: {reason}")]
    CheckpointLoadFailure { path: PathBuf, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("classifier has been closed")]
    ClassifierClosed,
}

impl EmuError {
    pub(crate) fn load_failure(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        EmuError::CheckpointLoadFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// 学習を中断すべき永続化エラーかどうか
    ///
    /// 容量不足と読み取り専用ファイルシステムのみ致命的とみなし、
    /// それ以外の保存失敗はログに残して学習を継続します。
    pub fn is_fatal_storage(&self) -> bool {
        match self {
            EmuError::CheckpointPersistFailure { source, .. } => is_fatal_io(source.kind()),
            _ => false,
        }
    }
}

pub(crate) fn is_fatal_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::StorageFull | io::ErrorKind::ReadOnlyFilesystem
    )
}
