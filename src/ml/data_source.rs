//! 学習データの供給インターフェース

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{EmuError, Result};
use crate::ml::layer_spec::ImageDims;

/// 画像とラベルの組
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// NHWC 順に平坦化した画素値
    pub pixels: Vec<f32>,
    /// カテゴリインデックス
    pub label: usize,
}

impl Sample {
    pub fn new(pixels: Vec<f32>, label: usize) -> Self {
        Self { pixels, label }
    }
}

/// 学習ループが消費するデータ供給元
///
/// 枯渇時の巡回やシャッフルの方針は実装側の責務です。
pub trait DataSource {
    /// 1枚あたりの画像サイズ
    fn image_dims(&self) -> ImageDims;

    /// `batch_size` 件のミニバッチを取得
    ///
    /// 満杯のバッチを用意できない場合は [`EmuError::DataExhausted`] を返します。
    fn next_training_batch(&mut self, batch_size: usize) -> Result<Vec<Sample>>;

    /// 検証用データ
    fn validation_split(&self) -> &[Sample];
}

/// メモリ上のサンプルを供給するデータソース
pub struct InMemoryDataSource {
    dims: ImageDims,
    training: Vec<Sample>,
    validation: Vec<Sample>,
    cursor: usize,
    cycle: bool,
    rng: StdRng,
}

impl InMemoryDataSource {
    pub fn new(dims: ImageDims, training: Vec<Sample>, validation: Vec<Sample>) -> Self {
        Self {
            dims,
            training,
            validation,
            cursor: 0,
            cycle: false,
            rng: StdRng::seed_from_u64(42),
        }
    }

    /// 末尾に達したら再シャッフルして先頭から供給する
    pub fn with_cycle(mut self, cycle: bool) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn training_len(&self) -> usize {
        self.training.len()
    }

    pub fn validation_len(&self) -> usize {
        self.validation.len()
    }

    fn reshuffle(&mut self) {
        self.training.shuffle(&mut self.rng);
        self.cursor = 0;
    }
}

impl DataSource for InMemoryDataSource {
    fn image_dims(&self) -> ImageDims {
        self.dims
    }

    fn next_training_batch(&mut self, batch_size: usize) -> Result<Vec<Sample>> {
        let remaining = self.training.len() - self.cursor;

        if self.training.is_empty() || (!self.cycle && remaining < batch_size) {
            return Err(EmuError::DataExhausted {
                requested: batch_size,
                available: remaining,
            });
        }

        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            if self.cursor == self.training.len() {
                self.reshuffle();
            }
            let take = (batch_size - batch.len()).min(self.training.len() - self.cursor);
            batch.extend_from_slice(&self.training[self.cursor..self.cursor + take]);
            self.cursor += take;
        }

        Ok(batch)
    }

    fn validation_split(&self) -> &[Sample] {
        &self.validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n).map(|i| Sample::new(vec![i as f32; 4], i % 7)).collect()
    }

    #[test]
    fn test_batches_in_order_until_exhausted() {
        let mut source = InMemoryDataSource::new(ImageDims::grayscale(2, 2), samples(5), vec![]);

        let first = source.next_training_batch(2).unwrap();
        assert_eq!(first[0].pixels[0], 0.0);
        assert_eq!(first[1].pixels[0], 1.0);
        source.next_training_batch(2).unwrap();

        match source.next_training_batch(2) {
            Err(EmuError::DataExhausted {
                requested,
                available,
            }) => {
                assert_eq!(requested, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_short_source_without_cycle_is_exhausted() {
        let mut source = InMemoryDataSource::new(ImageDims::grayscale(2, 2), samples(3), vec![]);
        assert!(matches!(
            source.next_training_batch(5),
            Err(EmuError::DataExhausted { .. })
        ));
    }

    #[test]
    fn test_cycle_always_returns_full_batches() {
        let mut source = InMemoryDataSource::new(ImageDims::grayscale(2, 2), samples(3), vec![])
            .with_cycle(true)
            .with_seed(7);

        for _ in 0..10 {
            let batch = source.next_training_batch(5).unwrap();
            assert_eq!(batch.len(), 5);
        }
    }

    #[test]
    fn test_cycle_visits_every_sample_per_pass() {
        let mut source =
            InMemoryDataSource::new(ImageDims::grayscale(2, 2), samples(4), vec![]).with_cycle(true);

        source.next_training_batch(4).unwrap();
        let mut second: Vec<usize> = source
            .next_training_batch(4)
            .unwrap()
            .iter()
            .map(|s| s.pixels[0] as usize)
            .collect();
        second.sort_unstable();
        assert_eq!(second, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_source_is_exhausted_even_when_cycling() {
        let mut source =
            InMemoryDataSource::new(ImageDims::grayscale(2, 2), vec![], vec![]).with_cycle(true);
        assert!(matches!(
            source.next_training_batch(1),
            Err(EmuError::DataExhausted { .. })
        ));
    }
}
