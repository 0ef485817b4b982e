//! # PINN 学習スケジューラ
//!
//! `burn` フレームワークで物理情報ニューラルネットワーク（PINN）を学習するための
//! 損失項の重み付けと学習ループの部品を提供します。
//!
//! - [`loss`]: 名前付き損失項の登録と評価
//! - [`causal`]: 時間方向の因果重み
//! - [`weighting`]: 損失項の重みの周期的な更新 (NTK / 勾配ノルム)
//! - [`accumulator`]: マイクロバッチの勾配蓄積
//! - [`checkpoint`]: スナップショットの保存と復元
//! - [`scheduler`]: 以上をまとめた学習ステップの状態機械
//!
//! [`pinn`] は 1次元移流方程式の問題設定です。

pub mod accumulator;
pub mod causal;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod loss;
pub mod model;
pub mod observer;
pub mod pinn;
pub mod scheduler;
pub mod training;
pub mod weighting;

pub use accumulator::GradientAccumulator;
pub use causal::CausalWeighter;
pub use checkpoint::{Checkpoint, CheckpointManager, RestoreTarget};
pub use config::{TrainConfig, WeightingScheme};
pub use error::{PinnError, Result};
pub use loss::{FnTerm, LossTerm, LossTermRegistry};
pub use observer::{RecordingObserver, TracingObserver, TrainingObserver};
pub use scheduler::{BatchSampler, SchedulerState, StopHandle, TrainingScheduler, TrainingSummary};
pub use weighting::{AdaptiveWeightScheme, WeightPolicy, WeightVector};
