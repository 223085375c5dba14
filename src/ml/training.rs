//! モデル学習
//!
//! ステップ単位の学習ループ（Adam + L2 正則化）に、学習率の指数減衰、
//! 定期的な検証と早期終了、チェックポイント保存を組み合わせます。

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EmuError, Result};
use crate::ml::data_source::{DataSource, Sample};
use crate::ml::layer_spec::{ImageDims, InputShape, LayerSpec};
use crate::ml::network::{build, images_to_tensor, EmotionNet};
use crate::model::checkpoint::CheckpointStore;
use crate::model::model_metadata::CheckpointMetadata;

/// 早期終了の判定に使う検証指標
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoredMetric {
    /// 平均交差エントロピー（小さいほど良い）
    Loss,
    /// 正解率（大きいほど良い）
    Accuracy,
}

impl MonitoredMetric {
    fn is_improvement(self, candidate: f64, best: Option<f64>, min_improvement: f64) -> bool {
        match best {
            None => candidate.is_finite(),
            Some(best) => match self {
                MonitoredMetric::Loss => candidate < best - min_improvement,
                MonitoredMetric::Accuracy => candidate > best + min_improvement,
            },
        }
    }
}

/// 学習のハイパーパラメータ
#[derive(Config, Debug)]
pub struct Hyperparameters {
    /// 初期学習率
    #[config(default = 0.003)]
    pub learning_rate: f64,
    /// L2 正則化の係数（バイアスは対象外）
    #[config(default = 0.001)]
    pub l2_regularization_weight: f64,
    /// 最大ステップ数
    #[config(default = 100000)]
    pub max_steps: usize,
    /// ミニバッチのサイズ
    #[config(default = 5)]
    pub batch_size: usize,
    /// 減衰率（`decay_step_interval` ステップごとに乗算）
    #[config(default = 0.99)]
    pub decay_rate: f64,
    #[config(default = 100)]
    pub decay_step_interval: usize,
    #[config(default = 5)]
    pub validation_interval: usize,
    #[config(default = 20)]
    pub checkpoint_interval: usize,
    /// 改善のない検証がこの回数続いたら終了
    #[config(default = 20)]
    pub early_stopping_patience: usize,
    /// 改善とみなす最小の差
    #[config(default = 0.0)]
    pub min_improvement: f64,
    #[config(default = "MonitoredMetric::Loss")]
    pub monitored_metric: MonitoredMetric,
}

impl Hyperparameters {
    /// 学習開始前の検証
    pub fn validate(&self) -> Result<()> {
        let non_negative = |name: &str, value: f64| {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(EmuError::InvalidHyperparameters(format!(
                    "{name} must be a finite non-negative number, got {value}"
                )))
            }
        };
        let positive = |name: &str, value: usize| {
            if value > 0 {
                Ok(())
            } else {
                Err(EmuError::InvalidHyperparameters(format!(
                    "{name} must be positive"
                )))
            }
        };

        non_negative("learning_rate", self.learning_rate)?;
        non_negative("l2_regularization_weight", self.l2_regularization_weight)?;
        non_negative("min_improvement", self.min_improvement)?;

        if !(self.decay_rate.is_finite() && self.decay_rate > 0.0 && self.decay_rate <= 1.0) {
            return Err(EmuError::InvalidHyperparameters(format!(
                "decay_rate must be in (0, 1], got {}",
                self.decay_rate
            )));
        }

        positive("max_steps", self.max_steps)?;
        positive("batch_size", self.batch_size)?;
        positive("decay_step_interval", self.decay_step_interval)?;
        positive("validation_interval", self.validation_interval)?;
        positive("checkpoint_interval", self.checkpoint_interval)?;
        positive("early_stopping_patience", self.early_stopping_patience)?;
        Ok(())
    }
}

/// 階段状の指数減衰スケジュール
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    initial: f64,
    rate: f64,
    interval: usize,
}

impl ExponentialDecay {
    pub fn new(initial: f64, rate: f64, interval: usize) -> Self {
        Self {
            initial,
            rate,
            interval: interval.max(1),
        }
    }

    /// `completed_steps` ステップ終了後の学習率
    pub fn rate_at(&self, completed_steps: usize) -> f64 {
        let decays = (completed_steps / self.interval) as f64;
        self.initial * self.rate.powf(decays)
    }
}

/// 学習ループの状態（外部には公開しない）
#[derive(Debug)]
struct TrainingState {
    current_step: usize,
    best_validation_metric: Option<f64>,
    steps_since_improvement: usize,
    current_learning_rate: f64,
}

impl TrainingState {
    fn new(learning_rate: f64) -> Self {
        Self {
            current_step: 0,
            best_validation_metric: None,
            steps_since_improvement: 0,
            current_learning_rate: learning_rate,
        }
    }

    /// 検証結果を反映し、改善したかを返す
    fn record_validation(&mut self, value: f64, metric: MonitoredMetric, min_improvement: f64) -> bool {
        if metric.is_improvement(value, self.best_validation_metric, min_improvement) {
            self.best_validation_metric = Some(value);
            self.steps_since_improvement = 0;
            true
        } else {
            self.steps_since_improvement += 1;
            false
        }
    }
}

/// 検証結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

impl Evaluation {
    pub fn metric(&self, metric: MonitoredMetric) -> f64 {
        match metric {
            MonitoredMetric::Loss => self.loss,
            MonitoredMetric::Accuracy => self.accuracy,
        }
    }
}

/// 1ステップごとの進捗
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingProgress {
    pub step: usize,
    /// 正則化項を含む学習損失
    pub loss: f64,
    /// ミニバッチの正解率
    pub accuracy: f64,
    /// このステップ終了後の学習率
    pub learning_rate: f64,
    /// このステップで検証を行った場合の結果
    pub validation: Option<Evaluation>,
}

/// 学習の終了理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingOutcome {
    Completed,
    EarlyStopped,
}

/// 学習結果
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingResult {
    pub outcome: TrainingOutcome,
    pub final_step: usize,
    pub best_validation_metric: Option<f64>,
    pub final_learning_rate: f64,
    /// 最終チェックポイント
    pub checkpoint_path: PathBuf,
}

type ProgressCallback = Box<dyn FnMut(&TrainingProgress)>;

/// 学習ドライバ
///
/// 1インスタンスにつき1回だけ [`Trainer::train`] を実行できます。
pub struct Trainer<B: AutodiffBackend> {
    spec: LayerSpec,
    hyperparameters: Hyperparameters,
    store: CheckpointStore,
    device: B::Device,
    log_progress: bool,
    progress: Option<ProgressCallback>,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// ハイパーパラメータとレイヤーリストを検証して学習ドライバを作成
    pub fn new(
        spec: LayerSpec,
        hyperparameters: Hyperparameters,
        store: CheckpointStore,
        device: B::Device,
    ) -> Result<Self> {
        hyperparameters.validate()?;
        spec.validate()?;

        Ok(Self {
            spec,
            hyperparameters,
            store,
            device,
            log_progress: false,
            progress: None,
        })
    }

    /// 検証ごとの進捗ログを有効化
    pub fn with_progress_logging(mut self, enabled: bool) -> Self {
        self.log_progress = enabled;
        self
    }

    /// ステップごとの進捗コールバック
    pub fn on_progress(mut self, callback: impl FnMut(&TrainingProgress) + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// 学習を実行
    pub fn train<D: DataSource + ?Sized>(mut self, source: &mut D) -> Result<TrainingResult> {
        let hp = self.hyperparameters.clone();
        let dims = source.image_dims();

        let mut model: EmotionNet<B> =
            build(&self.spec, InputShape::new(hp.batch_size, dims), &self.device)?;
        let categories = model.plan().categories();

        if source.validation_split().is_empty() {
            return Err(EmuError::DataExhausted {
                requested: 1,
                available: 0,
            });
        }

        tracing::info!(
            "学習を開始します: パラメータ数 {}, 入力 {}x{}x{}, 検証データ {} 枚",
            model.num_params(),
            dims.height,
            dims.width,
            dims.channels,
            source.validation_split().len()
        );
        tracing::info!(
            "最大ステップ数: {}, バッチサイズ: {}, 学習率: {}",
            hp.max_steps,
            hp.batch_size,
            hp.learning_rate
        );

        let mut optim = AdamConfig::new().init();
        let schedule = ExponentialDecay::new(hp.learning_rate, hp.decay_rate, hp.decay_step_interval);
        let mut state = TrainingState::new(hp.learning_rate);
        let mut outcome = TrainingOutcome::Completed;
        let mut last_checkpoint: Option<PathBuf> = None;

        while state.current_step < hp.max_steps {
            let step = state.current_step + 1;

            let batch = source.next_training_batch(hp.batch_size)?;
            if batch.len() < hp.batch_size {
                return Err(EmuError::DataExhausted {
                    requested: hp.batch_size,
                    available: batch.len(),
                });
            }

            let (images, targets) = batch_tensors::<B>(&batch, dims, categories, &self.device)?;
            let output = model.forward_classification(images, targets)?;
            let correct = count_correct(output.output.clone(), output.targets.clone());
            let loss = output.loss
                + model
                    .l2_penalty(&self.device)
                    .mul_scalar(hp.l2_regularization_weight);
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            // Backward pass + Adam update
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(state.current_learning_rate, model, grads);

            state.current_step = step;
            state.current_learning_rate = schedule.rate_at(step);

            if !loss_value.is_finite() {
                tracing::warn!("step {}: 損失が有限値ではありません ({})", step, loss_value);
            }
            tracing::debug!(
                "step {} | loss={:.4} | lr={:.6}",
                step,
                loss_value,
                state.current_learning_rate
            );

            let mut validation = None;
            if step % hp.validation_interval == 0 {
                let evaluation = evaluate(
                    &model.valid(),
                    source.validation_split(),
                    dims,
                    hp.batch_size,
                    &self.device,
                )?;
                let improved = state.record_validation(
                    evaluation.metric(hp.monitored_metric),
                    hp.monitored_metric,
                    hp.min_improvement,
                );
                validation = Some(evaluation);

                if self.log_progress {
                    tracing::info!(
                        "step {:>6}/{} | train_loss={:.4} | train_acc={:.1}% | val_loss={:.4} | val_acc={:.1}% | lr={:.6}{}",
                        step,
                        hp.max_steps,
                        loss_value,
                        correct as f64 / batch.len() as f64 * 100.0,
                        evaluation.loss,
                        evaluation.accuracy * 100.0,
                        state.current_learning_rate,
                        if improved { " *" } else { "" }
                    );
                }
            }

            if let Some(callback) = self.progress.as_mut() {
                callback(&TrainingProgress {
                    step,
                    loss: loss_value,
                    accuracy: correct as f64 / batch.len() as f64,
                    learning_rate: state.current_learning_rate,
                    validation,
                });
            }

            if state.steps_since_improvement >= hp.early_stopping_patience {
                tracing::info!(
                    "検証指標が {} 回改善しなかったため step {} で早期終了します",
                    state.steps_since_improvement,
                    step
                );
                outcome = TrainingOutcome::EarlyStopped;
                break;
            }

            // 最終ステップは終了時に保存する
            if step % hp.checkpoint_interval == 0 && step < hp.max_steps {
                let saved = self.save_checkpoint(&model, &state, dims);
                if let Some(path) = handle_periodic_save(saved, step)? {
                    last_checkpoint = Some(path);
                }
            }
        }

        let saved = self.save_checkpoint(&model, &state, dims);
        let checkpoint_path = finish_checkpoint(saved, last_checkpoint)?;
        tracing::info!(
            "学習完了 ({:?}): step {}, 保存先 {}",
            outcome,
            state.current_step,
            checkpoint_path.display()
        );

        Ok(TrainingResult {
            outcome,
            final_step: state.current_step,
            best_validation_metric: state.best_validation_metric,
            final_learning_rate: state.current_learning_rate,
            checkpoint_path,
        })
    }

    fn save_checkpoint(
        &self,
        model: &EmotionNet<B>,
        state: &TrainingState,
        dims: ImageDims,
    ) -> Result<PathBuf> {
        let metadata = CheckpointMetadata::new(
            self.spec.clone(),
            dims,
            state.current_step,
            state.current_learning_rate,
            state.best_validation_metric,
            model.num_params(),
        );
        self.store.save(model, &metadata)
    }
}

/// 定期保存の結果を処理
///
/// 致命的な保存エラーのみ学習を中断し、それ以外はログに残して継続します。
fn handle_periodic_save(saved: Result<PathBuf>, step: usize) -> Result<Option<PathBuf>> {
    match saved {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.is_fatal_storage() => Err(e),
        Err(e) => {
            tracing::warn!("step {}: チェックポイントを保存できませんでした: {}", step, e);
            Ok(None)
        }
    }
}

/// 最終保存の結果を処理
///
/// 致命的でない失敗の場合は直前に保存できたチェックポイントを返します。
/// 一度も保存できていない場合は失敗をそのまま返します。
fn finish_checkpoint(saved: Result<PathBuf>, last_checkpoint: Option<PathBuf>) -> Result<PathBuf> {
    match (saved, last_checkpoint) {
        (Ok(path), _) => Ok(path),
        (Err(e), Some(previous)) if !e.is_fatal_storage() => {
            tracing::warn!(
                "最終チェックポイントを保存できませんでした: {}。直前のチェックポイントを使用します: {}",
                e,
                previous.display()
            );
            Ok(previous)
        }
        (Err(e), _) => Err(e),
    }
}

/// モデル学習を実行
pub fn train_model<B: AutodiffBackend, D: DataSource + ?Sized>(
    spec: LayerSpec,
    source: &mut D,
    hyperparameters: Hyperparameters,
    store: CheckpointStore,
    device: B::Device,
    log_progress: bool,
) -> Result<TrainingResult> {
    Trainer::<B>::new(spec, hyperparameters, store, device)?
        .with_progress_logging(log_progress)
        .train(source)
}

/// サンプル列をモデル入力とターゲットに変換
pub(crate) fn batch_tensors<B: Backend>(
    samples: &[Sample],
    dims: ImageDims,
    categories: usize,
    device: &B::Device,
) -> Result<(Tensor<B, 4>, Tensor<B, 1, Int>)> {
    let mut pixels = Vec::with_capacity(samples.len() * dims.len());
    let mut labels = Vec::with_capacity(samples.len());

    for (index, sample) in samples.iter().enumerate() {
        if sample.pixels.len() != dims.len() {
            return Err(EmuError::InvalidInput(format!(
                "sample {index} has {} values, expected {}",
                sample.pixels.len(),
                dims.len()
            )));
        }
        if sample.label >= categories {
            return Err(EmuError::InvalidInput(format!(
                "sample {index} has label {} outside [0, {categories})",
                sample.label
            )));
        }
        pixels.extend_from_slice(&sample.pixels);
        labels.push(sample.label as i64);
    }

    let images = images_to_tensor::<B>(&pixels, samples.len(), dims, device);
    let targets = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device);
    Ok((images, targets))
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    // argmax(1) は [batch, 1] を返すので [batch] に平坦化して比較
    let predicted = logits.argmax(1).flatten::<1>(0, 1);
    predicted
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// パラメータを更新せずに検証データ全体の平均損失と正解率を求める
pub fn evaluate<B: Backend>(
    model: &EmotionNet<B>,
    samples: &[Sample],
    dims: ImageDims,
    chunk_size: usize,
    device: &B::Device,
) -> Result<Evaluation> {
    if samples.is_empty() {
        return Err(EmuError::DataExhausted {
            requested: 1,
            available: 0,
        });
    }

    let categories = model.plan().categories();
    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;

    for chunk in samples.chunks(chunk_size.max(1)) {
        let (images, targets) = batch_tensors::<B>(chunk, dims, categories, device)?;
        let output = model.forward_classification(images, targets)?;
        correct += count_correct(output.output, output.targets);
        loss_sum += output.loss.into_scalar().elem::<f64>() * chunk.len() as f64;
    }

    let total = samples.len() as f64;
    Ok(Evaluation {
        loss: loss_sum / total,
        accuracy: correct as f64 / total,
    })
}
