//! ディレクトリ構成から学習データを読み込む
//!
//! ```text
//! data_dir/
//!   Anger/      *.png | *.jpg | *.jpeg
//!   Disgust/
//!   ...
//! ```
//!
//! 顔の切り出しは済んでいる前提で、グレースケール化と入力サイズへの
//! リサイズのみを行います。

use anyhow::{Context, Result};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use crate::ml::data_source::{InMemoryDataSource, Sample};
use crate::ml::layer_spec::ImageDims;

/// 読み込み済みのデータセット
pub struct FolderDataset {
    samples: Vec<Sample>,
    class_names: Vec<String>,
    dims: ImageDims,
}

impl FolderDataset {
    /// 指定された順序でディレクトリから学習データを読み込む
    pub fn from_directory_with_order(
        data_dir: &Path,
        class_order: &[String],
        dims: ImageDims,
    ) -> Result<Self> {
        if dims.channels != 1 {
            anyhow::bail!("Only single-channel input is supported, got {} channels", dims.channels);
        }

        let mut samples = Vec::new();

        for (class_id, class_name) in class_order.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.exists() {
                tracing::warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut count = 0usize;
            for path in image_files(&class_dir)? {
                samples.push(Sample::new(load_grayscale(&path, dims)?, class_id));
                count += 1;
            }
            tracing::info!("  クラス '{}': {} 枚", class_name, count);
        }

        if samples.is_empty() {
            anyhow::bail!("No training samples found in {}", data_dir.display());
        }

        Ok(Self {
            samples,
            class_names: class_order.to_vec(),
            dims,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// シャッフルして学習用と検証用に分割
    pub fn into_source(self, train_ratio: f32, seed: u64, cycle: bool) -> InMemoryDataSource {
        let mut samples = self.samples;
        let mut rng = StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let train_len = (samples.len() as f32 * train_ratio.clamp(0.0, 1.0)) as usize;
        let validation = samples.split_off(train_len);

        tracing::info!("学習データ: {} 枚", samples.len());
        tracing::info!("検証データ: {} 枚", validation.len());

        InMemoryDataSource::new(self.dims, samples, validation)
            .with_seed(seed)
            .with_cycle(cycle)
    }
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(ext) = path.extension() {
            let ext_str = ext.to_string_lossy().to_lowercase();
            if ext_str == "png" || ext_str == "jpg" || ext_str == "jpeg" {
                files.push(path);
            }
        }
    }
    // 読み込み順を固定
    files.sort();
    Ok(files)
}

/// 画像を読み込み、グレースケール化・リサイズして [0, 1] に正規化
pub fn load_grayscale(path: &Path, dims: ImageDims) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .to_luma8();

    let (width, height) = (dims.width as u32, dims.height as u32);
    let img = if img.dimensions() == (width, height) {
        img
    } else {
        image::imageops::resize(&img, width, height, FilterType::Triangle)
    };

    Ok(img.pixels().map(|p| p[0] as f32 / 255.0).collect())
}
