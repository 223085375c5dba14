//! チェックポイントのメタデータを表示するツール
//!
//! 使い方: inspect_checkpoint <アーカイブまたは保存ディレクトリ>

use anyhow::{Context, Result};
use std::path::PathBuf;

use emu_lib::model::{load_metadata, print_metadata_info, resolve_checkpoint};

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("checkpoints"));

    let archive = resolve_checkpoint(&path)?;
    let metadata = load_metadata(&archive)
        .with_context(|| format!("メタデータを読み込めません: {}", archive.display()))?;

    println!("アーカイブ: {}", archive.display());
    print_metadata_info(&metadata);
    Ok(())
}
