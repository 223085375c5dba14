//! ネットワーク構成の宣言的な定義
//!
//! レイヤーリストは学習設定ファイルと同じ形式でシリアライズされます。
//!
//! ```json
//! [
//!   { "type": "conv", "filters_count": 32, "kernel_size": 5 },
//!   { "type": "pool" },
//!   { "type": "deep", "out_size": 7 }
//! ]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{EmuError, Result};

/// 感情カテゴリ（学習・推論で共通のラベル順序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Anger,
    Disgust,
    Fear,
    Happiness,
    Sadness,
    Surprise,
    Neutral,
}

impl Emotion {
    /// カテゴリ数
    pub const COUNT: usize = 7;

    /// ラベル順序
    pub const ALL: [Emotion; Emotion::COUNT] = [
        Emotion::Anger,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happiness,
        Emotion::Sadness,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Anger => "Anger",
            Emotion::Disgust => "Disgust",
            Emotion::Fear => "Fear",
            Emotion::Happiness => "Happiness",
            Emotion::Sadness => "Sadness",
            Emotion::Surprise => "Surprise",
            Emotion::Neutral => "Neutral",
        }
    }

    /// 全ラベルを文字列で取得
    pub fn labels() -> Vec<String> {
        Self::ALL.iter().map(|e| e.label().to_string()).collect()
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// レイヤー記述子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LayerDescriptor {
    /// same パディングの畳み込み + ReLU
    Conv {
        filters_count: usize,
        kernel_size: usize,
    },
    /// 2x2 マックスプーリング（ストライド 2）
    Pool,
    /// 全結合層
    Deep { out_size: usize },
}

/// レイヤー記述子の順序付きリスト
///
/// 先頭のレイヤーが入力テンソルを受け取ります。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerSpec(Vec<LayerDescriptor>);

impl LayerSpec {
    pub fn new(layers: Vec<LayerDescriptor>) -> Self {
        Self(layers)
    }

    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 最終層の出力サイズ（カテゴリ数）
    pub fn category_count(&self) -> Option<usize> {
        match self.0.last() {
            Some(LayerDescriptor::Deep { out_size }) => Some(*out_size),
            _ => None,
        }
    }

    /// 構造の検証
    ///
    /// - 1層以上
    /// - 畳み込み/プーリングの後に全結合層が続く（全結合層の後に畳み込みは置けない）
    /// - 最終層は出力サイズがカテゴリ数と一致する全結合層
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(EmuError::InvalidArchitecture(
                "layer spec contains no layers".to_string(),
            ));
        }

        let mut seen_deep = false;
        for (index, layer) in self.0.iter().enumerate() {
            match *layer {
                LayerDescriptor::Conv {
                    filters_count,
                    kernel_size,
                } => {
                    if seen_deep {
                        return Err(EmuError::InvalidArchitecture(format!(
                            "layer {index}: convolution after a dense layer"
                        )));
                    }
                    if filters_count == 0 {
                        return Err(EmuError::InvalidArchitecture(format!(
                            "layer {index}: filters_count must be positive"
                        )));
                    }
                    if kernel_size == 0 || kernel_size % 2 == 0 {
                        return Err(EmuError::InvalidArchitecture(format!(
                            "layer {index}: kernel_size must be odd for same padding, got {kernel_size}"
                        )));
                    }
                }
                LayerDescriptor::Pool => {
                    if seen_deep {
                        return Err(EmuError::InvalidArchitecture(format!(
                            "layer {index}: pooling after a dense layer"
                        )));
                    }
                }
                LayerDescriptor::Deep { out_size } => {
                    if out_size == 0 {
                        return Err(EmuError::InvalidArchitecture(format!(
                            "layer {index}: out_size must be positive"
                        )));
                    }
                    seen_deep = true;
                }
            }
        }

        match self.category_count() {
            Some(Emotion::COUNT) => Ok(()),
            Some(other) => Err(EmuError::InvalidArchitecture(format!(
                "final dense layer must have {} outputs, got {other}",
                Emotion::COUNT
            ))),
            None => Err(EmuError::InvalidArchitecture(
                "final layer must be a dense layer".to_string(),
            )),
        }
    }
}

impl Default for LayerSpec {
    fn default() -> Self {
        Self(vec![
            LayerDescriptor::Conv {
                filters_count: 32,
                kernel_size: 5,
            },
            LayerDescriptor::Pool,
            LayerDescriptor::Conv {
                filters_count: 128,
                kernel_size: 5,
            },
            LayerDescriptor::Deep { out_size: 100 },
            LayerDescriptor::Deep {
                out_size: Emotion::COUNT,
            },
        ])
    }
}

impl From<Vec<LayerDescriptor>> for LayerSpec {
    fn from(layers: Vec<LayerDescriptor>) -> Self {
        Self(layers)
    }
}

/// 1枚あたりの画像サイズ（高さ, 幅, チャネル）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDims {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageDims {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// グレースケール画像
    pub fn grayscale(height: usize, width: usize) -> Self {
        Self::new(height, width, 1)
    }

    /// 平坦化した画素数
    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ImageDims {
    fn default() -> Self {
        Self::grayscale(48, 48)
    }
}

/// 入力テンソル形状 (batch, height, width, channels)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputShape {
    pub fn new(batch: usize, dims: ImageDims) -> Self {
        Self {
            batch,
            height: dims.height,
            width: dims.width,
            channels: dims.channels,
        }
    }

    pub fn image_dims(&self) -> ImageDims {
        ImageDims::new(self.height, self.width, self.channels)
    }
}

impl From<(usize, usize, usize, usize)> for InputShape {
    fn from((batch, height, width, channels): (usize, usize, usize, usize)) -> Self {
        Self {
            batch,
            height,
            width,
            channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_is_valid() {
        let spec = LayerSpec::default();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.category_count(), Some(7));
    }

    #[test]
    fn test_empty_spec_is_invalid() {
        let spec = LayerSpec::new(vec![]);
        assert!(matches!(
            spec.validate(),
            Err(EmuError::InvalidArchitecture(_))
        ));
    }

    #[test]
    fn test_spec_must_end_with_dense_layer() {
        let spec = LayerSpec::new(vec![
            LayerDescriptor::Deep { out_size: 7 },
            LayerDescriptor::Conv {
                filters_count: 8,
                kernel_size: 3,
            },
        ]);
        assert!(matches!(
            spec.validate(),
            Err(EmuError::InvalidArchitecture(_))
        ));

        let spec = LayerSpec::new(vec![LayerDescriptor::Pool]);
        assert!(matches!(
            spec.validate(),
            Err(EmuError::InvalidArchitecture(_))
        ));
    }

    #[test]
    fn test_final_layer_must_match_category_count() {
        let spec = LayerSpec::new(vec![LayerDescriptor::Deep { out_size: 5 }]);
        assert!(matches!(
            spec.validate(),
            Err(EmuError::InvalidArchitecture(_))
        ));
    }

    #[test]
    fn test_even_kernel_is_rejected() {
        let spec = LayerSpec::new(vec![
            LayerDescriptor::Conv {
                filters_count: 8,
                kernel_size: 4,
            },
            LayerDescriptor::Deep { out_size: 7 },
        ]);
        assert!(matches!(
            spec.validate(),
            Err(EmuError::InvalidArchitecture(_))
        ));
    }

    #[test]
    fn test_layer_json_format() {
        let json = r#"[
            {"type": "conv", "filters_count": 32, "kernel_size": 5},
            {"type": "pool"},
            {"type": "conv", "filters_count": 128, "kernel_size": 5},
            {"type": "deep", "out_size": 100},
            {"type": "deep", "out_size": 7}
        ]"#;
        let spec: LayerSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec, LayerSpec::default());
    }

    #[test]
    fn test_emotion_ordering() {
        assert_eq!(Emotion::ALL.len(), Emotion::COUNT);
        assert_eq!(Emotion::from_index(3), Some(Emotion::Happiness));
        assert_eq!(Emotion::Neutral.index(), 6);
        assert_eq!(Emotion::from_index(7), None);
        assert_eq!(Emotion::labels()[0], "Anger");
    }
}
