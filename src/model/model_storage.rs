//! チェックポイントアーカイブの読み書き
//!
//! Tar.gz形式で重みとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（レイヤー構成、入力サイズなど）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! エラーは `io::Error` のまま返し、呼び出し側が種類（容量不足など）で判断できるようにします。

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use tar::{Archive, Builder};

use crate::model::model_metadata::CheckpointMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn append_entry<W: io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)
}

/// メタデータと共に重みをTar.gz形式で保存
///
/// 一時ファイルに書き出してから置き換えるため、保存途中のアーカイブが
/// 読み込まれることはありません。
pub fn save_checkpoint_archive(
    output_path: &Path,
    metadata: &CheckpointMetadata,
    model_binary: &[u8],
) -> io::Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json_str = metadata
        .to_json_string()
        .map_err(|e| invalid_data(format!("Failed to serialize metadata: {e}")))?;

    let temp_path = output_path.with_extension("partial");
    {
        let file = File::create(&temp_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut tar_builder = Builder::new(encoder);

        append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
        append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

        let encoder = tar_builder.into_inner()?;
        let file = encoder.finish()?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, output_path)
}

/// Tar.gzからメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> io::Result<CheckpointMetadata> {
    let (metadata, _) = read_entries(tar_gz_path, false)?;
    metadata.ok_or_else(|| invalid_data("metadata.json not found in tar.gz archive"))
}

/// メタデータと重みを共に読み込む
pub fn load_checkpoint_archive(tar_gz_path: &Path) -> io::Result<(CheckpointMetadata, Vec<u8>)> {
    match read_entries(tar_gz_path, true)? {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(invalid_data("metadata.json not found in tar.gz archive")),
        (_, None) => Err(invalid_data("model.bin not found in tar.gz archive")),
    }
}

fn read_entries(
    tar_gz_path: &Path,
    with_model: bool,
) -> io::Result<(Option<CheckpointMetadata>, Option<Vec<u8>>)> {
    let decoder = GzDecoder::new(File::open(tar_gz_path)?);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt = None;
    let mut model_binary_opt = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();

        match path.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                let metadata = CheckpointMetadata::from_json_string(&json_str)
                    .map_err(|e| invalid_data(format!("Failed to parse metadata: {e}")))?;
                metadata_opt = Some(metadata);
                if !with_model {
                    break;
                }
            }
            MODEL_ENTRY if with_model => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    Ok((metadata_opt, model_binary_opt))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &CheckpointMetadata) {
    println!("\n=== チェックポイントメタデータ ===");
    println!("形式バージョン: {}", metadata.format_version);
    println!("レイヤー数: {}", metadata.layers.len());
    for (i, layer) in metadata.layers.layers().iter().enumerate() {
        println!("  {}: {:?}", i, layer);
    }
    println!(
        "入力サイズ: {}x{}x{}",
        metadata.input_dims.height, metadata.input_dims.width, metadata.input_dims.channels
    );
    println!("ラベル: {}", metadata.labels.join(", "));
    println!(
        "テンソル: 入力={}, ロジット={}, 予測={}",
        metadata.tensors.input, metadata.tensors.logits, metadata.tensors.predicted_class
    );
    println!("学習ステップ: {}", metadata.step);
    println!("学習率: {}", metadata.learning_rate);
    match metadata.best_validation_metric {
        Some(metric) => println!("最良の検証指標: {:.6}", metric),
        None => println!("最良の検証指標: なし"),
    }
    println!("パラメータ数: {}", metadata.num_params);
    println!("保存日時: {}", metadata.saved_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::layer_spec::{ImageDims, LayerSpec};

    fn metadata() -> CheckpointMetadata {
        CheckpointMetadata::new(LayerSpec::default(), ImageDims::grayscale(48, 48), 10, 0.003, None, 42)
    }

    #[test]
    fn test_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.tar.gz");
        let binary = vec![1u8, 2, 3, 4, 5];

        save_checkpoint_archive(&path, &metadata(), &binary).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("partial").exists());

        let (restored, restored_binary) = load_checkpoint_archive(&path).unwrap();
        assert_eq!(restored, metadata());
        assert_eq!(restored_binary, binary);
        assert_eq!(load_metadata(&path).unwrap().step, 10);
    }

    #[test]
    fn test_missing_archive_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_checkpoint_archive(&dir.path().join("missing.tar.gz")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        fs::write(&path, b"definitely not gzip").unwrap();
        assert!(load_checkpoint_archive(&path).is_err());
    }
}
