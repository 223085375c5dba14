//! アプリケーション設定管理モジュール
//!
//! ネットワーク構成や学習設定をJSON形式で保存・読み込みします。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::layer_spec::{ImageDims, LayerSpec};
use crate::ml::training::Hyperparameters;
use crate::model::checkpoint::{CheckpointPolicy, CheckpointStore};

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// レイヤーリスト
    pub layers: LayerSpec,
    /// 入力画像サイズ
    pub input_dims: ImageDims,
    /// チェックポイントの保存先ディレクトリ
    pub checkpoint_dir: String,
    /// アーカイブ名（拡張子なし）
    pub checkpoint_name: String,
    pub checkpoint_policy: CheckpointPolicy,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            layers: LayerSpec::default(),
            input_dims: ImageDims::default(),
            checkpoint_dir: "checkpoints".to_string(),
            checkpoint_name: "model".to_string(),
            checkpoint_policy: CheckpointPolicy::default(),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub hyperparameters: Hyperparameters,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f32,
    /// データを使い切ったら再シャッフルして続行する
    pub cycle: bool,
    /// 検証ごとに進捗をログ出力する
    pub log_progress: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            hyperparameters: Hyperparameters::new(),
            seed: 42,
            train_ratio: 0.8,
            cycle: true,
            log_progress: true,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// 学習データのディレクトリ（ラベルごとのサブディレクトリ）
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {:#}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// デフォルトパスに設定を保存する
    pub fn save_default(&self) -> anyhow::Result<()> {
        let path = Self::default_path();
        self.save(&path)?;
        tracing::info!("設定ファイルを保存しました: {}", path.display());
        Ok(())
    }

    /// 設定どおりのチェックポイント保存先
    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.model.checkpoint_dir)
            .with_name(self.model.checkpoint_name.clone())
            .with_policy(self.model.checkpoint_policy)
    }

    /// 設定情報を表示
    pub fn display(&self) {
        let hp = &self.training.hyperparameters;
        println!("=== アプリケーション設定 ===");
        println!("レイヤー数: {}", self.model.layers.len());
        println!(
            "入力サイズ: {}x{}x{}",
            self.model.input_dims.height, self.model.input_dims.width, self.model.input_dims.channels
        );
        println!("保存先: {} ({:?})", self.model.checkpoint_dir, self.model.checkpoint_policy);
        println!("\n--- トレーニング設定 ---");
        println!("最大ステップ数: {}", hp.max_steps);
        println!("バッチサイズ: {}", hp.batch_size);
        println!("学習率: {} (減衰 {} / {} ステップ)", hp.learning_rate, hp.decay_rate, hp.decay_step_interval);
        println!("L2 正則化: {}", hp.l2_regularization_weight);
        println!("早期終了: {} 回 ({:?})", hp.early_stopping_patience, hp.monitored_metric);
        println!("シード: {}", self.training.seed);
        if let Some(ref data_dir) = self.data_dir {
            println!("\n学習データ: {}", data_dir);
        }
        println!("========================\n");
    }
}
