use crate::config::TrainConfig;
use crate::error::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "Adaptive loss weighting and causal training for PINNs with Burn", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// PINNモデルを最初から学習します
    Train(RunArgs),
    /// チェックポイントから学習を再開します
    Resume {
        #[command(flatten)]
        run: RunArgs,
        /// 再開するステップ。省略時は最新のチェックポイント
        #[arg(long)]
        step: Option<usize>,
    },
    /// 既定値の設定ファイルを書き出します
    InitConfig {
        /// 出力先のパス
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// 設定ファイル (JSON)。省略時は既定値
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// チェックポイントの保存先
    #[arg(long, default_value = "runs")]
    pub workdir: PathBuf,
}

impl RunArgs {
    pub fn load_config(&self) -> Result<TrainConfig> {
        match &self.config {
            Some(path) => TrainConfig::from_file(path),
            None => Ok(TrainConfig::new()),
        }
    }
}
