#![recursion_limit = "256"]

//! 表情画像から感情カテゴリを推定する CNN のコア
//!
//! - [`ml::network`]: レイヤーリストからのネットワーク構築
//! - [`ml::training`]: 学習ループ・早期終了・チェックポイント保存
//! - [`ml::inference`]: チェックポイントからの推論

pub mod error;
pub mod ml;
pub mod model;

pub use error::{EmuError, Result};
