//! チェックポイントのメタデータ定義
//!
//! tar.gz 形式で重みと一緒に保存され、推論時のグラフ再構築に使われます。

use serde::{Deserialize, Serialize};

use crate::ml::layer_spec::{Emotion, ImageDims, LayerSpec};

/// 現在のチェックポイント形式
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// 入出力テンソルの識別子
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorHandles {
    /// 入力画像 [batch, height, width, channels]
    pub input: String,
    /// ロジット [batch, categories]
    pub logits: String,
    /// 予測クラス [batch]
    pub predicted_class: String,
}

impl Default for TensorHandles {
    fn default() -> Self {
        Self {
            input: "images".to_string(),
            logits: "logits".to_string(),
            predicted_class: "predicted_class".to_string(),
        }
    }
}

/// チェックポイントメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub format_version: u32,

    /// 学習時のレイヤーリスト
    pub layers: LayerSpec,

    /// 1枚あたりの入力画像サイズ
    pub input_dims: ImageDims,

    /// カテゴリラベル（出力の並び順）
    pub labels: Vec<String>,

    #[serde(default)]
    pub tensors: TensorHandles,

    /// 保存時の学習ステップ
    pub step: usize,

    /// 保存時の学習率
    pub learning_rate: f64,

    /// 保存時点での最良の検証指標
    #[serde(default)]
    pub best_validation_metric: Option<f64>,

    /// 学習可能パラメータ数
    pub num_params: usize,

    /// 保存時刻（ISO8601形式）
    pub saved_at: String,
}

impl CheckpointMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        layers: LayerSpec,
        input_dims: ImageDims,
        step: usize,
        learning_rate: f64,
        best_validation_metric: Option<f64>,
        num_params: usize,
    ) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            layers,
            input_dims,
            labels: Emotion::labels(),
            tensors: TensorHandles::default(),
            step,
            learning_rate,
            best_validation_metric,
            num_params,
            saved_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let metadata = CheckpointMetadata::new(
            LayerSpec::default(),
            ImageDims::grayscale(48, 48),
            120,
            0.0029,
            Some(1.25),
            7_400_000,
        );
        let json = metadata.to_json_string().unwrap();
        let restored = CheckpointMetadata::from_json_string(&json).unwrap();
        assert_eq!(metadata, restored);
        assert_eq!(restored.labels.len(), Emotion::COUNT);
        assert_eq!(restored.tensors.logits, "logits");
    }

    #[test]
    fn test_optional_fields_default() {
        let json = r#"{
            "format_version": 1,
            "layers": [{"type": "deep", "out_size": 7}],
            "input_dims": {"height": 4, "width": 4, "channels": 1},
            "labels": ["Anger", "Disgust", "Fear", "Happiness", "Sadness", "Surprise", "Neutral"],
            "step": 3,
            "learning_rate": 0.1,
            "num_params": 119,
            "saved_at": "2024-01-01T00:00:00+00:00"
        }"#;
        let metadata = CheckpointMetadata::from_json_string(json).unwrap();
        assert_eq!(metadata.best_validation_metric, None);
        assert_eq!(metadata.tensors, TensorHandles::default());
    }
}
