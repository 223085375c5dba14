//! レイヤーリストから CNN を構築する
//!
//! [`NetworkPlan`] がレイヤーリストと入力形状からパラメータ形状と
//! 平坦化後の特徴次元を解析的に求め、[`EmotionNet`] がその計画どおりに
//! Burn のモジュールを組み立てます。

use burn::{
    module::{Ignored, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Initializer, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::error::{EmuError, Result};
use crate::ml::layer_spec::{ImageDims, InputShape, LayerDescriptor, LayerSpec};

/// プーリングの窓サイズとストライド（全段共通）
pub const POOL_SIZE: usize = 2;

/// 畳み込み部の処理段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStage {
    /// `convs[index]` を適用
    Conv(usize),
    Pool,
}

/// 畳み込み層のパラメータ形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvPlan {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
}

/// レイヤーリストと入力形状から決まるネットワークの全形状
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    pub input: InputShape,
    pub features: Vec<FeatureStage>,
    pub convs: Vec<ConvPlan>,
    pub pooling_stages: usize,
    /// 畳み込み部の出力（高さ, 幅, チャネル）
    pub feature_dims: ImageDims,
    /// 全結合部への入力次元
    pub flatten_size: usize,
    /// 全結合層ごとの (入力, 出力)
    pub denses: Vec<[usize; 2]>,
}

impl NetworkPlan {
    /// 形状計算
    ///
    /// 平坦化後の次元は `height * width * last_filters / 4^pooling_stages` で求め、
    /// 各段を追跡した実際の次元と一致しない場合はエラーにします。
    pub fn new(spec: &LayerSpec, input: InputShape) -> Result<Self> {
        spec.validate()?;

        if input.batch == 0 || input.height == 0 || input.width == 0 || input.channels == 0 {
            return Err(EmuError::InvalidArchitecture(format!(
                "input shape must be positive in every dimension: {:?}",
                input
            )));
        }

        let mut features = Vec::new();
        let mut convs = Vec::new();
        let mut denses = Vec::new();
        let mut pooling_stages = 0usize;
        let (mut height, mut width, mut channels) = (input.height, input.width, input.channels);
        let mut uneven_pool = false;

        for layer in spec.layers() {
            match *layer {
                LayerDescriptor::Conv {
                    filters_count,
                    kernel_size,
                } => {
                    features.push(FeatureStage::Conv(convs.len()));
                    convs.push(ConvPlan {
                        in_channels: channels,
                        out_channels: filters_count,
                        kernel_size,
                    });
                    // same パディングなので空間サイズは変わらない
                    channels = filters_count;
                }
                LayerDescriptor::Pool => {
                    features.push(FeatureStage::Pool);
                    uneven_pool |= height % POOL_SIZE != 0 || width % POOL_SIZE != 0;
                    height /= POOL_SIZE;
                    width /= POOL_SIZE;
                    pooling_stages += 1;
                }
                LayerDescriptor::Deep { out_size } => {
                    // 入力次元は平坦化サイズ確定後に埋める
                    denses.push([0, out_size]);
                }
            }
        }

        let last_filters = convs.last().map_or(input.channels, |c| c.out_channels);
        // プーリング段数やフィルタ数が大きい場合の桁あふれは不一致として扱う
        let analytic = (POOL_SIZE * POOL_SIZE)
            .checked_pow(pooling_stages as u32)
            .zip(
                input
                    .height
                    .checked_mul(input.width)
                    .and_then(|n| n.checked_mul(last_filters)),
            )
            .map(|(reduction, total)| total / reduction);
        let tracked = height.checked_mul(width).and_then(|n| n.checked_mul(channels));

        let analytic = match (analytic, tracked) {
            (Some(analytic), Some(tracked)) if !uneven_pool && tracked > 0 && analytic == tracked => {
                analytic
            }
            (analytic, tracked) => {
                return Err(EmuError::ArchitectureMismatch {
                    expected: analytic.unwrap_or(0),
                    actual: tracked.unwrap_or(0),
                })
            }
        };

        if let Some(first) = denses.first_mut() {
            first[0] = analytic;
        }
        // 先頭以外の入力次元は直前の出力次元
        for i in 1..denses.len() {
            denses[i][0] = denses[i - 1][1];
        }

        Ok(Self {
            input,
            features,
            convs,
            pooling_stages,
            feature_dims: ImageDims::new(height, width, channels),
            flatten_size: analytic,
            denses,
        })
    }

    /// カテゴリ数
    pub fn categories(&self) -> usize {
        self.denses.last().map_or(0, |d| d[1])
    }

    /// 計画どおりにモジュールを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmotionNet<B> {
        tracing::debug!(
            "入力: {}x{}x{}",
            self.input.height,
            self.input.width,
            self.input.channels
        );

        let convs = self
            .convs
            .iter()
            .map(|c| {
                tracing::debug!(
                    "Conv {}x{}: {} -> {}",
                    c.kernel_size,
                    c.kernel_size,
                    c.in_channels,
                    c.out_channels
                );
                Conv2dConfig::new([c.in_channels, c.out_channels], [c.kernel_size, c.kernel_size])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device)
            })
            .collect();

        tracing::debug!(
            "畳み込み部の出力: {}x{}x{} (プーリング {} 段), 平坦化後: {}",
            self.feature_dims.height,
            self.feature_dims.width,
            self.feature_dims.channels,
            self.pooling_stages,
            self.flatten_size
        );

        let denses = self
            .denses
            .iter()
            .map(|&[in_size, out_size]| {
                tracing::debug!("FC: {} -> {}", in_size, out_size);
                LinearConfig::new(in_size, out_size)
                    .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                    .init(device)
            })
            .collect();

        EmotionNet {
            convs,
            denses,
            pool: MaxPool2dConfig::new([POOL_SIZE, POOL_SIZE])
                .with_strides([POOL_SIZE, POOL_SIZE])
                .init(),
            activation: Relu::new(),
            plan: Ignored(self.clone()),
        }
    }
}

/// レイヤーリストからネットワークを構築
pub fn build<B: Backend>(
    spec: &LayerSpec,
    input: impl Into<InputShape>,
    device: &B::Device,
) -> Result<EmotionNet<B>> {
    let plan = NetworkPlan::new(spec, input.into())?;
    Ok(plan.init(device))
}

/// 順伝播の出力
#[derive(Debug, Clone)]
pub struct NetworkOutput<B: Backend> {
    /// 正規化前のスコア [batch_size, categories]
    pub logits: Tensor<B, 2>,
    /// 最大ロジットのインデックス [batch_size]
    pub predicted_class: Tensor<B, 1, Int>,
}

/// 感情分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv (same padding) + ReLU | MaxPool 2x2} の任意の列
/// - Flatten
/// - {FC + ReLU} x (n - 1)
/// - FC -> categories（活性化なし）
#[derive(Module, Debug)]
pub struct EmotionNet<B: Backend> {
    convs: Vec<Conv2d<B>>,
    denses: Vec<Linear<B>>,
    pool: MaxPool2d,
    activation: Relu,
    plan: Ignored<NetworkPlan>,
}

impl<B: Backend> EmotionNet<B> {
    pub fn plan(&self) -> &NetworkPlan {
        &self.plan.0
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, channels, height, width]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, categories]
    ///
    /// チャネル数・高さ・幅が構築時の入力形状と異なる場合は
    /// [`EmuError::ArchitectureMismatch`] を返します（最初に異なる次元の値）。
    pub fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let plan = &self.plan.0;
        let [batch_size, channels, height, width] = images.dims();

        let planned = [plan.input.channels, plan.input.height, plan.input.width];
        let given = [channels, height, width];
        if let Some(i) = (0..planned.len()).find(|&i| planned[i] != given[i]) {
            return Err(EmuError::ArchitectureMismatch {
                expected: planned[i],
                actual: given[i],
            });
        }

        let mut x = images;
        for stage in &plan.features {
            x = match *stage {
                FeatureStage::Conv(index) => self.activation.forward(self.convs[index].forward(x)),
                FeatureStage::Pool => self.pool.forward(x),
            };
        }

        // Flatten
        let [_, c, h, w] = x.dims();
        let features = c * h * w;
        if features != plan.flatten_size {
            return Err(EmuError::ArchitectureMismatch {
                expected: plan.flatten_size,
                actual: features,
            });
        }
        let mut x = x.reshape([batch_size, features]);

        let last = self.denses.len().saturating_sub(1);
        for (index, dense) in self.denses.iter().enumerate() {
            x = dense.forward(x);
            if index < last {
                x = self.activation.forward(x);
            }
        }

        Ok(x)
    }

    /// 予測を実行
    pub fn predict(&self, images: Tensor<B, 4>) -> Result<NetworkOutput<B>> {
        let logits = self.forward(images)?;
        let predicted_class = logits.clone().argmax(1).flatten::<1>(0, 1);
        Ok(NetworkOutput {
            logits,
            predicted_class,
        })
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// 損失は交差エントロピーのみ。L2 正則化は [`Self::l2_penalty`] で別途加算します。
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> Result<ClassificationOutput<B>> {
        let output = self.forward(images)?;
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        Ok(ClassificationOutput::new(loss, output, targets))
    }

    /// 全重みの二乗和（バイアスは含まない）
    pub fn l2_penalty(&self, device: &B::Device) -> Tensor<B, 1> {
        let conv_terms = self
            .convs
            .iter()
            .map(|conv| conv.weight.val().powf_scalar(2.0).sum());
        let dense_terms = self
            .denses
            .iter()
            .map(|dense| dense.weight.val().powf_scalar(2.0).sum());

        conv_terms
            .chain(dense_terms)
            .fold(Tensor::zeros([1], device), |acc, term| acc + term)
    }

    /// 学習可能パラメータの形状一覧（層の順）
    pub fn parameter_shapes(&self) -> Vec<Vec<usize>> {
        let mut shapes = Vec::new();
        for conv in &self.convs {
            shapes.push(conv.weight.val().dims().to_vec());
            if let Some(bias) = &conv.bias {
                shapes.push(bias.val().dims().to_vec());
            }
        }
        for dense in &self.denses {
            shapes.push(dense.weight.val().dims().to_vec());
            if let Some(bias) = &dense.bias {
                shapes.push(bias.val().dims().to_vec());
            }
        }
        shapes
    }
}

/// NHWC で平坦化された画素列をモデル入力 [batch, channels, height, width] に変換
pub fn images_to_tensor<B: Backend>(
    pixels: &[f32],
    batch_size: usize,
    dims: ImageDims,
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::<B, 1>::from_floats(pixels, device)
        .reshape([batch_size, dims.height, dims.width, dims.channels])
        .permute([0, 3, 1, 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::layer_spec::Emotion;

    type TestBackend = burn_ndarray::NdArray<f32>;

    fn small_spec() -> LayerSpec {
        LayerSpec::new(vec![
            LayerDescriptor::Conv {
                filters_count: 4,
                kernel_size: 3,
            },
            LayerDescriptor::Pool,
            LayerDescriptor::Conv {
                filters_count: 8,
                kernel_size: 3,
            },
            LayerDescriptor::Pool,
            LayerDescriptor::Deep { out_size: 16 },
            LayerDescriptor::Deep {
                out_size: Emotion::COUNT,
            },
        ])
    }

    #[test]
    fn test_flatten_size_matches_formula() {
        let plan = NetworkPlan::new(&LayerSpec::default(), (1, 48, 48, 1).into()).unwrap();
        assert_eq!(plan.flatten_size, 48 * 48 * 128 / 4);
        assert_eq!(plan.pooling_stages, 1);
        assert_eq!(plan.denses, vec![[73_728, 100], [100, 7]]);

        let plan = NetworkPlan::new(&small_spec(), (2, 16, 12, 1).into()).unwrap();
        assert_eq!(plan.flatten_size, 16 * 12 * 8 / 16);
        assert_eq!(plan.feature_dims, ImageDims::new(4, 3, 8));
        assert_eq!(plan.categories(), Emotion::COUNT);
    }

    #[test]
    fn test_flatten_without_convolution_uses_input_channels() {
        let spec = LayerSpec::new(vec![
            LayerDescriptor::Pool,
            LayerDescriptor::Deep {
                out_size: Emotion::COUNT,
            },
        ]);
        let plan = NetworkPlan::new(&spec, (1, 8, 8, 3).into()).unwrap();
        assert_eq!(plan.flatten_size, 8 * 8 * 3 / 4);
    }

    #[test]
    fn test_conv_channels_chain() {
        let plan = NetworkPlan::new(&small_spec(), (1, 8, 8, 1).into()).unwrap();
        assert_eq!(plan.convs[0].in_channels, 1);
        assert_eq!(plan.convs[1].in_channels, 4);
        assert_eq!(plan.convs[1].out_channels, 8);
    }

    #[test]
    fn test_uneven_pooling_is_a_mismatch() {
        let result = NetworkPlan::new(&small_spec(), (1, 10, 10, 1).into());
        assert!(matches!(
            result,
            Err(EmuError::ArchitectureMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_spec_fails_to_build() {
        let device = Default::default();
        let result = build::<TestBackend>(&LayerSpec::new(vec![]), (1, 48, 48, 1), &device);
        assert!(matches!(result, Err(EmuError::InvalidArchitecture(_))));
    }

    #[test]
    fn test_zero_sized_input_is_rejected() {
        let result = NetworkPlan::new(&small_spec(), (1, 0, 8, 1).into());
        assert!(matches!(result, Err(EmuError::InvalidArchitecture(_))));
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let net = build::<TestBackend>(&small_spec(), (3, 8, 8, 1), &device).unwrap();

        let pixels: Vec<f32> = (0..3 * 64).map(|i| (i % 17) as f32 / 17.0).collect();
        let images = images_to_tensor::<TestBackend>(&pixels, 3, ImageDims::grayscale(8, 8), &device);
        let output = net.predict(images).unwrap();

        assert_eq!(output.logits.dims(), [3, Emotion::COUNT]);
        assert_eq!(output.predicted_class.dims(), [3]);
        let classes = output
            .predicted_class
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .unwrap();
        assert!(classes.iter().all(|&c| (0..Emotion::COUNT as i64).contains(&c)));
    }

    #[test]
    fn test_forward_rejects_unplanned_input_size() {
        let device = Default::default();
        let net = build::<TestBackend>(&small_spec(), (1, 8, 8, 1), &device).unwrap();

        // (入力形状, 期待値, 実際の値)
        let cases = [
            ([1, 1, 16, 16], 8, 16),
            // 画素数は同じでも縦横が異なる
            ([1, 1, 4, 16], 8, 4),
            ([1, 2, 8, 8], 1, 2),
        ];
        for (shape, want_expected, want_actual) in cases {
            let images = Tensor::<TestBackend, 4>::zeros(shape, &device);
            match net.forward(images) {
                Err(EmuError::ArchitectureMismatch { expected, actual }) => {
                    assert_eq!(expected, want_expected);
                    assert_eq!(actual, want_actual);
                }
                other => panic!("unexpected result for {:?}: {:?}", shape, other.map(|t| t.dims())),
            }
        }

        // バッチサイズは構築時と異なってもよい
        let images = Tensor::<TestBackend, 4>::zeros([3, 1, 8, 8], &device);
        assert_eq!(net.forward(images).unwrap().dims(), [3, Emotion::COUNT]);
    }

    #[test]
    fn test_many_pooling_stages_are_a_mismatch() {
        let mut layers = vec![LayerDescriptor::Pool; 40];
        layers.push(LayerDescriptor::Deep {
            out_size: Emotion::COUNT,
        });

        let result = NetworkPlan::new(&LayerSpec::new(layers), (1, 48, 48, 1).into());
        assert!(matches!(
            result,
            Err(EmuError::ArchitectureMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_filters_are_a_mismatch() {
        let spec = LayerSpec::new(vec![
            LayerDescriptor::Conv {
                filters_count: usize::MAX / 2,
                kernel_size: 1,
            },
            LayerDescriptor::Deep {
                out_size: Emotion::COUNT,
            },
        ]);
        let result = NetworkPlan::new(&spec, (1, 48, 48, 1).into());
        assert!(matches!(
            result,
            Err(EmuError::ArchitectureMismatch { .. })
        ));
    }

    #[test]
    fn test_l2_penalty_excludes_biases() {
        let device = Default::default();
        let net = build::<TestBackend>(&small_spec(), (1, 8, 8, 1), &device).unwrap();

        let mut expected = 0.0f64;
        for conv in &net.convs {
            let values = conv.weight.val().into_data().to_vec::<f32>().unwrap();
            expected += values.iter().map(|v| (*v as f64).powi(2)).sum::<f64>();
        }
        for dense in &net.denses {
            let values = dense.weight.val().into_data().to_vec::<f32>().unwrap();
            expected += values.iter().map(|v| (*v as f64).powi(2)).sum::<f64>();
        }

        let penalty = net.l2_penalty(&device).into_data().to_vec::<f32>().unwrap()[0] as f64;
        assert!((penalty - expected).abs() < 1e-3 * expected.max(1.0));
    }

    #[test]
    fn test_parameter_shapes_follow_plan() {
        let device = Default::default();
        let net = build::<TestBackend>(&small_spec(), (1, 8, 8, 1), &device).unwrap();
        let shapes = net.parameter_shapes();

        assert_eq!(shapes[0], vec![4, 1, 3, 3]);
        assert_eq!(shapes[1], vec![4]);
        assert_eq!(shapes[2], vec![8, 4, 3, 3]);
        assert_eq!(shapes[4], vec![32, 16]);
        assert_eq!(shapes[6], vec![16, 7]);
    }

    #[test]
    fn test_images_to_tensor_is_channel_first() {
        let device = Default::default();
        // 1x1x2 画像（2チャネル）: NHWC [a, b] -> NCHW [[a], [b]]
        let tensor =
            images_to_tensor::<TestBackend>(&[1.0, 2.0], 1, ImageDims::new(1, 1, 2), &device);
        assert_eq!(tensor.dims(), [1, 2, 1, 1]);
        let values = tensor.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 2.0]);
    }
}
