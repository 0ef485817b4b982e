//! 学習の進行を外部へ通知するためのインターフェース。
//!
//! スケジューラはログの出力先を持たず、ここで定義する記録を観測者へ渡すだけです。

use crate::scheduler::SchedulerState;
use crate::weighting::WeightVector;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// ログ周期ごとの損失。
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: usize,
    pub total_loss: f32,
    pub losses: BTreeMap<String, f32>,
    pub learning_rate: f64,
}

/// 重み更新ごとの記録。
#[derive(Debug, Clone, PartialEq)]
pub struct WeightUpdateRecord {
    pub step: usize,
    pub weights: WeightVector,
    pub causal_weights: Option<Vec<f32>>,
    pub total_loss: f32,
}

pub trait TrainingObserver {
    fn on_log(&mut self, _record: &StepRecord) {}

    fn on_weights_updated(&mut self, _record: &WeightUpdateRecord) {}

    fn on_checkpoint(&mut self, _step: usize, _path: &Path) {}

    fn on_state_change(&mut self, _from: SchedulerState, _to: SchedulerState) {}
}

/// すべてを `tracing` に出力します。
#[derive(Debug, Default)]
pub struct TracingObserver;

impl TrainingObserver for TracingObserver {
    fn on_log(&mut self, record: &StepRecord) {
        let losses = record
            .losses
            .iter()
            .map(|(name, value)| format!("{}: {:.6}", name, value))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(
            "[Step {}] Total Loss: {:.6}, {} (lr {:.2e})",
            record.step,
            record.total_loss,
            losses,
            record.learning_rate
        );
    }

    fn on_weights_updated(&mut self, record: &WeightUpdateRecord) {
        let weights = record
            .weights
            .iter()
            .map(|(name, w)| format!("{}: {:.4}", name, w))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!("[Step {}] 重みを更新しました: {}", record.step, weights);
        if let Some(causal) = &record.causal_weights {
            tracing::debug!("[Step {}] 因果重み: {:?}", record.step, causal);
        }
    }

    fn on_state_change(&mut self, from: SchedulerState, to: SchedulerState) {
        tracing::debug!("状態遷移: {:?} -> {:?}", from, to);
    }
}

/// 通知をメモリに保持します。テストや学習後の集計に使います。
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    pub logs: Vec<StepRecord>,
    pub weight_updates: Vec<WeightUpdateRecord>,
    pub checkpoints: Vec<(usize, PathBuf)>,
    pub transitions: Vec<(SchedulerState, SchedulerState)>,
}

impl TrainingObserver for RecordingObserver {
    fn on_log(&mut self, record: &StepRecord) {
        self.logs.push(record.clone());
    }

    fn on_weights_updated(&mut self, record: &WeightUpdateRecord) {
        self.weight_updates.push(record.clone());
    }

    fn on_checkpoint(&mut self, step: usize, path: &Path) {
        self.checkpoints.push((step, path.to_path_buf()));
    }

    fn on_state_change(&mut self, from: SchedulerState, to: SchedulerState) {
        self.transitions.push((from, to));
    }
}
