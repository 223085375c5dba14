//! emu - 表情画像の感情分類 CLI
//!
//! - `emu train`: ラベルごとのディレクトリから学習
//! - `emu classify`: 顔画像を分類して確率を表示
//! - `emu init-config`: デフォルト設定ファイルを書き出す

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use emu_lib::ml::{
    backend::{backend_name, default_device, InferenceBackend, TrainingBackend},
    load_grayscale, train_model, Classifier, Emotion, FolderDataset,
};
use emu_lib::model::AppConfig;

#[derive(Parser)]
#[command(name = "emu", version, about = "Facial emotion classifier")]
struct Cli {
    /// 設定ファイル
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 学習を実行してチェックポイントを保存
    Train {
        /// 学習データのディレクトリ（設定ファイルより優先）
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// 最大ステップ数
        #[arg(long)]
        max_steps: Option<usize>,
        /// 保存先ディレクトリ
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },
    /// 画像を分類
    Classify {
        /// チェックポイント（アーカイブまたはディレクトリ）
        #[arg(short = 'm', long)]
        checkpoint: Option<PathBuf>,
        /// 切り出し済みの顔画像
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// デフォルト設定を書き出す
    InitConfig {
        /// 出力先
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emu=info,emu_lib=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(Cli::parse()) {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);

    match cli.command {
        Command::InitConfig { output } => {
            let path = output.unwrap_or(config_path);
            AppConfig::default().save(&path)?;
            tracing::info!("設定ファイルを書き出しました: {}", path.display());
            Ok(())
        }
        Command::Train {
            data_dir,
            max_steps,
            checkpoint_dir,
        } => {
            let mut config = AppConfig::load_or_default_from(&config_path);
            if let Some(steps) = max_steps {
                config.training.hyperparameters.max_steps = steps;
            }
            if let Some(dir) = checkpoint_dir {
                config.model.checkpoint_dir = dir.to_string_lossy().into_owned();
            }
            let data_dir = data_dir
                .or_else(|| config.data_dir.as_ref().map(PathBuf::from))
                .context("学習データのディレクトリが指定されていません (--data-dir)")?;
            train(&config, &data_dir)
        }
        Command::Classify { checkpoint, images } => {
            let config = AppConfig::load_or_default_from(&config_path);
            let checkpoint = checkpoint.unwrap_or_else(|| PathBuf::from(&config.model.checkpoint_dir));
            classify(&config, &checkpoint, &images)
        }
    }
}

fn train(config: &AppConfig, data_dir: &Path) -> Result<()> {
    config.display();
    tracing::info!("バックエンド: {}", backend_name());

    let dataset = FolderDataset::from_directory_with_order(
        data_dir,
        &Emotion::labels(),
        config.model.input_dims,
    )?;
    tracing::info!("読み込んだ画像: {} 枚", dataset.len());

    let mut source = dataset.into_source(
        config.training.train_ratio,
        config.training.seed,
        config.training.cycle,
    );

    let result = train_model::<TrainingBackend, _>(
        config.model.layers.clone(),
        &mut source,
        config.training.hyperparameters.clone(),
        config.checkpoint_store(),
        default_device(),
        config.training.log_progress,
    )
    .context("学習に失敗しました")?;

    println!("\n=== 学習結果 ===");
    println!("終了理由: {:?}", result.outcome);
    println!("ステップ数: {}", result.final_step);
    match result.best_validation_metric {
        Some(metric) => println!("最良の検証指標: {:.6}", metric),
        None => println!("最良の検証指標: なし"),
    }
    println!("最終学習率: {:.6}", result.final_learning_rate);
    println!("チェックポイント: {}", result.checkpoint_path.display());
    Ok(())
}

fn classify(config: &AppConfig, checkpoint: &Path, images: &[PathBuf]) -> Result<()> {
    let mut classifier =
        Classifier::<InferenceBackend>::load(&config.model.layers, checkpoint, default_device())
            .with_context(|| format!("チェックポイントを読み込めません: {}", checkpoint.display()))?;

    let dims = classifier.input_dims();
    let mut pixels = Vec::with_capacity(images.len());
    for path in images {
        pixels.push(load_grayscale(path, dims)?);
    }

    let results = classifier.infer(pixels.as_slice())?;
    for (path, scores) in images.iter().zip(&results) {
        let (top, probability) = scores.top();
        println!("{}: {} ({:.1}%)", path.display(), top, probability * 100.0);
        for (label, score) in scores.iter() {
            println!("  {:<10} {:.4}", label, score);
        }
    }

    classifier.close();
    Ok(())
}
