//! 学習設定。
//!
//! `burn::config::Config` を使い、JSON で保存・読み込みできるようにしています。
//! 値の範囲チェックは [`TrainConfig::validate`] で行い、範囲外の値を丸めることはしません。

use crate::error::PinnError;
use burn::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 損失項の重み付け方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightingScheme {
    /// 初期重みを固定で使い続けます
    None,
    /// NTK のトレースに反比例する重み
    Ntk,
    /// 勾配ノルムに反比例する重み
    GradNorm,
}

/// 損失の重み付けと因果学習の設定。
#[derive(Config, Debug)]
pub struct WeightingConfig {
    #[config(default = "WeightingScheme::None")]
    pub scheme: WeightingScheme,

    /// 損失項ごとの初期重み。指定のない項は 1.0 から始まります
    #[config(default = "BTreeMap::new()")]
    pub init_weights: BTreeMap<String, f64>,

    #[config(default = "0.9")]
    pub momentum: f64,

    #[config(default = "1000")]
    pub update_every_steps: usize,

    #[config(default = "false")]
    pub use_causal: bool,

    #[config(default = "1.0")]
    pub causal_tol: f64,

    #[config(default = "32")]
    pub num_chunks: usize,

    /// NTK の対角成分を評価する点の数
    #[config(default = "32")]
    pub ntk_samples: usize,
}

/// Adam と学習率スケジュールの設定。
#[derive(Config, Debug)]
pub struct OptimConfig {
    #[config(default = "1e-3")]
    pub learning_rate: f64,

    #[config(default = "0.9")]
    pub beta1: f32,

    #[config(default = "0.999")]
    pub beta2: f32,

    #[config(default = "1e-8")]
    pub eps: f32,

    #[config(default = "0.9")]
    pub decay_rate: f64,

    #[config(default = "5000")]
    pub decay_steps: usize,

    #[config(default = "5000")]
    pub warmup_steps: usize,

    #[config(default = "false")]
    pub staircase: bool,

    /// 0 または 1 なら毎ステップ更新します
    #[config(default = "0")]
    pub grad_accum_steps: usize,
}

impl OptimConfig {
    /// 線形ウォームアップの後、指数減衰する学習率を返します。
    pub fn learning_rate_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.learning_rate * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let mut progress = (step - self.warmup_steps) as f64 / self.decay_steps as f64;
        if self.staircase {
            progress = progress.floor();
        }
        self.learning_rate * self.decay_rate.powf(progress)
    }

    /// 勾配を適用するまでに集めるマイクロバッチ数。
    pub fn effective_accum_steps(&self) -> usize {
        self.grad_accum_steps.max(1)
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = "200000")]
    pub max_steps: usize,

    /// 1 ステップあたりのコロケーション点の数
    #[config(default = "512")]
    pub batch_size: usize,
}

#[derive(Config, Debug)]
pub struct SavingConfig {
    #[config(default = "10000")]
    pub save_every_steps: usize,

    #[config(default = "10")]
    pub num_keep_ckpts: usize,
}

#[derive(Config, Debug)]
pub struct LoggingConfig {
    #[config(default = "100")]
    pub log_every_steps: usize,
}

/// 多層パーセプトロンの大きさ。
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "2")]
    pub input_dim: usize,

    #[config(default = "64")]
    pub hidden_dim: usize,

    #[config(default = "4")]
    pub num_layers: usize,

    #[config(default = "1")]
    pub output_dim: usize,
}

/// 学習全体の設定。
#[derive(Config, Debug)]
pub struct TrainConfig {
    #[config(default = "String::from(\"advection\")")]
    pub run_name: String,

    #[config(default = "42")]
    pub seed: u64,

    #[config(default = "TrainingConfig::new()")]
    pub training: TrainingConfig,

    #[config(default = "OptimConfig::new()")]
    pub optim: OptimConfig,

    #[config(default = "WeightingConfig::new()")]
    pub weighting: WeightingConfig,

    #[config(default = "SavingConfig::new()")]
    pub saving: SavingConfig,

    #[config(default = "LoggingConfig::new()")]
    pub logging: LoggingConfig,

    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
}

impl TrainConfig {
    /// JSON ファイルから設定を読み込み、検証します。
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let config = Self::load(path).map_err(|e| PinnError::ConfigLoad(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 各値の範囲を検証します。
    pub fn validate(&self) -> crate::error::Result<()> {
        let w = &self.weighting;
        ensure(
            w.momentum.is_finite() && (0.0..1.0).contains(&w.momentum),
            format!("weighting.momentum は [0, 1) の範囲が必要です: {}", w.momentum),
        )?;
        ensure(
            w.update_every_steps > 0,
            "weighting.update_every_steps は 1 以上が必要です".to_string(),
        )?;
        ensure(
            w.causal_tol.is_finite() && w.causal_tol >= 0.0,
            format!("weighting.causal_tol は 0 以上が必要です: {}", w.causal_tol),
        )?;
        ensure(
            w.num_chunks >= 1,
            "weighting.num_chunks は 1 以上が必要です".to_string(),
        )?;
        ensure(
            w.ntk_samples >= 1,
            "weighting.ntk_samples は 1 以上が必要です".to_string(),
        )?;
        for (name, weight) in &w.init_weights {
            ensure(
                weight.is_finite() && *weight > 0.0,
                format!("損失項 '{}' の初期重みは正の有限値が必要です: {}", name, weight),
            )?;
        }

        let o = &self.optim;
        ensure(
            o.learning_rate.is_finite() && o.learning_rate > 0.0,
            format!("optim.learning_rate は正の値が必要です: {}", o.learning_rate),
        )?;
        ensure(
            o.decay_rate.is_finite() && o.decay_rate > 0.0,
            format!("optim.decay_rate は正の値が必要です: {}", o.decay_rate),
        )?;
        ensure(
            o.decay_steps > 0,
            "optim.decay_steps は 1 以上が必要です".to_string(),
        )?;

        ensure(
            self.saving.save_every_steps > 0,
            "saving.save_every_steps は 1 以上が必要です".to_string(),
        )?;
        ensure(
            self.saving.num_keep_ckpts >= 1,
            "saving.num_keep_ckpts は 1 以上が必要です".to_string(),
        )?;
        ensure(
            self.training.max_steps > 0,
            "training.max_steps は 1 以上が必要です".to_string(),
        )?;
        ensure(
            self.training.batch_size > 0,
            "training.batch_size は 1 以上が必要です".to_string(),
        )?;
        if w.use_causal {
            ensure(
                self.training.batch_size >= w.num_chunks,
                format!(
                    "training.batch_size ({}) は weighting.num_chunks ({}) 以上が必要です",
                    self.training.batch_size, w.num_chunks
                ),
            )?;
        }
        ensure(
            self.logging.log_every_steps > 0,
            "logging.log_every_steps は 1 以上が必要です".to_string(),
        )?;
        Ok(())
    }
}

fn ensure(condition: bool, message: String) -> crate::error::Result<()> {
    if condition {
        Ok(())
    } else {
        Err(PinnError::InvalidConfig(message))
    }
}
