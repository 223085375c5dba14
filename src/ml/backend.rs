//! 計算バックエンドの選択
//!
//! 既定は CPU (NdArray)。`wgpu` フィーチャ有効時は GPU を使います。

use burn::tensor::backend::Backend;

/// 推論用バックエンド
#[cfg(not(feature = "wgpu"))]
pub type InferenceBackend = burn_ndarray::NdArray<f32>;

/// 推論用バックエンド
#[cfg(feature = "wgpu")]
pub type InferenceBackend = burn_wgpu::Wgpu;

/// 学習用バックエンド（自動微分付き）
pub type TrainingBackend = burn_autodiff::Autodiff<InferenceBackend>;

pub type Device = <InferenceBackend as Backend>::Device;

/// 既定のデバイス
pub fn default_device() -> Device {
    Device::default()
}

/// バックエンド名（ログ表示用）
pub fn backend_name() -> &'static str {
    if cfg!(feature = "wgpu") {
        "WGPU (GPU)"
    } else {
        "CPU (NdArray)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_and_inference_share_devices() {
        let device = default_device();
        let _: <TrainingBackend as Backend>::Device = device.clone();
        assert!(!backend_name().is_empty());
    }
}
