//! # PINN 学習スケジューラ
//!
//! 1次元の移流方程式を例に、損失項の適応的な重み付けと因果学習、
//! チェックポイントからの再開を行うコマンドラインツールです。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --config advection.json
//! ```
//!
//! ### 再開
//! ```bash
//! cargo run --release -- resume --config advection.json --step 10000
//! ```
//!
//! ### 設定ファイルの作成
//! ```bash
//! cargo run --release -- init-config advection.json
//! ```

use burn::config::Config;
use clap::Parser;
use pinn_scheduler::checkpoint::RestoreTarget;
use pinn_scheduler::cli::{Cli, Commands};
use pinn_scheduler::config::TrainConfig;
use pinn_scheduler::error::{PinnError, Result};
use pinn_scheduler::training;
use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("エラーが発生しました: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Train(args) => {
            let config = args.load_config()?;
            training::run(&config, &args.workdir, None)?;
        }
        Commands::Resume { run, step } => {
            let config = run.load_config()?;
            let target = step.map_or(RestoreTarget::Latest, RestoreTarget::Step);
            training::run(&config, &run.workdir, Some(target))?;
        }
        Commands::InitConfig { path } => {
            TrainConfig::new()
                .save(&path)
                .map_err(|source| PinnError::Io {
                    path: path.clone(),
                    source,
                })?;
            println!("=> 設定を '{}' に保存しました。", path.display());
        }
    }
    Ok(())
}
