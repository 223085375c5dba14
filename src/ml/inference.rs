//! 学習済みモデルによる推論

use burn::tensor::{activation::softmax, backend::Backend};
use std::path::Path;
use std::sync::Arc;

use crate::error::{EmuError, Result};
use crate::ml::layer_spec::{Emotion, ImageDims, LayerSpec};
use crate::ml::network::{images_to_tensor, EmotionNet};
use crate::model::checkpoint::restore;
use crate::model::model_metadata::CheckpointMetadata;

/// カテゴリごとの確率（ラベル順序はチェックポイントに従う）
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreVector {
    scores: Vec<f32>,
    labels: Arc<[String]>,
}

impl ScoreVector {
    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// 指定カテゴリの確率
    pub fn get(&self, emotion: Emotion) -> f32 {
        self.scores.get(emotion.index()).copied().unwrap_or(0.0)
    }

    /// 最も確率の高いカテゴリ
    pub fn top(&self) -> (Emotion, f32) {
        Emotion::ALL
            .iter()
            .map(|&emotion| (emotion, self.get(emotion)))
            .fold((Emotion::ALL[0], f32::NEG_INFINITY), |best, current| {
                if current.1 > best.1 {
                    current
                } else {
                    best
                }
            })
    }

    /// (ラベル, 確率) の組を順に返す
    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.labels
            .iter()
            .map(String::as_str)
            .zip(self.scores.iter().copied())
    }
}

/// 推論器
///
/// チェックポイントから復元したネットワークを所有します。
/// [`Classifier::close`] 以降の推論は [`EmuError::ClassifierClosed`] になります。
pub struct Classifier<B: Backend> {
    model: Option<EmotionNet<B>>,
    metadata: Option<CheckpointMetadata>,
    input_dims: ImageDims,
    labels: Arc<[String]>,
    device: B::Device,
}

impl<B: Backend> Classifier<B> {
    /// チェックポイント（アーカイブまたはディレクトリ）を読み込んで推論器を初期化
    pub fn load(spec: &LayerSpec, checkpoint_path: &Path, device: B::Device) -> Result<Self> {
        let (model, metadata) = restore::<B>(spec, checkpoint_path, &device)?;

        Ok(Self {
            model: Some(model),
            input_dims: metadata.input_dims,
            labels: metadata.labels.clone().into(),
            metadata: Some(metadata),
            device,
        })
    }

    /// メモリ上のネットワークから推論器を作成
    pub fn from_network(model: EmotionNet<B>, device: B::Device) -> Self {
        Self {
            input_dims: model.plan().input.image_dims(),
            labels: Emotion::labels().into(),
            model: Some(model),
            metadata: None,
            device,
        }
    }

    pub fn input_dims(&self) -> ImageDims {
        self.input_dims
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// 読み込んだチェックポイントのメタデータ
    pub fn metadata(&self) -> Option<&CheckpointMetadata> {
        self.metadata.as_ref()
    }

    /// 画像のバッチを分類
    ///
    /// 各画像は NHWC 順に平坦化された `height * width * channels` 個の値です。
    pub fn infer<I: AsRef<[f32]>>(&self, images: &[I]) -> Result<Vec<ScoreVector>> {
        let model = self.model.as_ref().ok_or(EmuError::ClassifierClosed)?;

        if images.is_empty() {
            return Err(EmuError::InvalidInput("image batch is empty".to_string()));
        }

        let expected = self.input_dims.len();
        let mut pixels = Vec::with_capacity(images.len() * expected);
        for (index, image) in images.iter().enumerate() {
            let image = image.as_ref();
            if image.len() != expected {
                return Err(EmuError::InvalidInput(format!(
                    "image {index} has {} values, expected {expected} ({}x{}x{})",
                    image.len(),
                    self.input_dims.height,
                    self.input_dims.width,
                    self.input_dims.channels
                )));
            }
            pixels.extend_from_slice(image);
        }

        let tensor = images_to_tensor::<B>(&pixels, images.len(), self.input_dims, &self.device);
        let logits = model.forward(tensor)?;
        let [_, categories] = logits.dims();

        let probabilities = softmax(logits, 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| EmuError::InvalidInput(format!("unexpected output data: {:?}", e)))?;

        Ok(probabilities
            .chunks(categories)
            .map(|scores| ScoreVector {
                scores: scores.to_vec(),
                labels: self.labels.clone(),
            })
            .collect())
    }

    /// 1枚の画像を分類
    pub fn infer_one(&self, image: &[f32]) -> Result<ScoreVector> {
        self.infer(&[image])?
            .pop()
            .ok_or_else(|| EmuError::InvalidInput("no output for image".to_string()))
    }

    /// モデルを解放
    pub fn close(&mut self) {
        if self.model.take().is_some() {
            tracing::debug!("推論器を解放しました");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.model.is_none()
    }
}
