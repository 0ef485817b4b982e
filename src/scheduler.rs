//! 学習ステップの状態機械。
//!
//! ```text
//! Initialized → Running → {WeightUpdating, Checkpointing} → Running → ... → Terminated
//! ```
//!
//! 1 ステップの手順:
//! 1. バッチを受け取る
//! 2. 現在の重み（読み取りのみ）で全損失項を評価する
//! 3. 重み付き和の勾配を計算する
//! 4. 勾配を蓄積器に渡す
//! 5. 蓄積器が flush されたらオプティマイザを適用する
//! 6. ステップ数を 1 増やす
//! 7. `step % update_every_steps == 0` なら重みを更新する
//! 8. `step % save_every_steps == 0` ならチェックポイントを保存する
//!
//! 重みの更新と保存はステップの間でだけ行い、完了するまで次のステップに進みません。
//! チェックポイントには蓄積中の勾配を含めないため、保存時に未適用の勾配は捨てます。

use crate::accumulator::GradientAccumulator;
use crate::checkpoint::{Checkpoint, CheckpointManager, RestoreTarget};
use crate::config::{OptimConfig, TrainConfig};
use crate::error::{PinnError, Result};
use crate::loss::LossTermRegistry;
use crate::observer::{StepRecord, TrainingObserver, WeightUpdateRecord};
use crate::weighting::{AdaptiveWeightScheme, Objective, WeightVector};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// スケジューラの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Initialized,
    Running,
    WeightUpdating,
    Checkpointing,
    Terminated,
}

/// ステップ番号からバッチを作ります。
///
/// 同じステップには同じバッチを返す実装にしておくと、チェックポイントから
/// 再開したときも同じ系列のバッチで学習できます。
pub trait BatchSampler<T> {
    fn sample(&mut self, step: usize) -> T;
}

impl<T, F: FnMut(usize) -> T> BatchSampler<T> for F {
    fn sample(&mut self, step: usize) -> T {
        self(step)
    }
}

/// 外部から学習の停止を要求するためのハンドル。ステップの境界でだけ確認します。
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 1 ステップの結果。
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: usize,
    pub total_loss: f32,
    /// このステップでオプティマイザを適用したか
    pub applied: bool,
    pub weights_updated: bool,
    pub checkpoint: Option<PathBuf>,
}

/// 学習終了時の要約。
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub final_step: usize,
    pub last_checkpoint: Option<PathBuf>,
    /// 終了時に適用せず捨てたマイクロバッチの数
    pub discarded_microbatches: usize,
    pub stopped_early: bool,
}

pub struct TrainingScheduler<B, M, O, T>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    model: M,
    optimizer: O,
    registry: LossTermRegistry<B, M, T>,
    weighting: AdaptiveWeightScheme,
    accumulator: GradientAccumulator<M>,
    checkpoints: CheckpointManager,
    optim: OptimConfig,
    save_every_steps: usize,
    log_every_steps: usize,
    max_steps: usize,
    step: usize,
    state: SchedulerState,
    last_saved_step: Option<usize>,
    last_checkpoint: Option<PathBuf>,
    stop: StopHandle,
}

impl<B, M, O, T> TrainingScheduler<B, M, O, T>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    /// 設定を検証してスケジューラを作ります。
    pub fn new(
        config: &TrainConfig,
        model: M,
        optimizer: O,
        registry: LossTermRegistry<B, M, T>,
        checkpoints: CheckpointManager,
    ) -> Result<Self> {
        config.validate()?;
        let weighting = AdaptiveWeightScheme::new(&config.weighting, &registry)?;
        Ok(Self {
            model,
            optimizer,
            registry,
            weighting,
            accumulator: GradientAccumulator::new(config.optim.grad_accum_steps),
            checkpoints,
            optim: config.optim.clone(),
            save_every_steps: config.saving.save_every_steps,
            log_every_steps: config.logging.log_every_steps,
            max_steps: config.training.max_steps,
            step: 0,
            state: SchedulerState::Initialized,
            last_saved_step: None,
            last_checkpoint: None,
            stop: StopHandle::default(),
        })
    }

    /// チェックポイントの状態から学習を再開します。
    ///
    /// ステップ数、モデル、オプティマイザの状態、損失の重みを戻します。
    /// 因果重みは保存しておらず、最初のステップで現在のパラメータから計算し直します。
    pub fn resume_from(mut self, checkpoint: Checkpoint<M, O::Record>) -> Result<Self> {
        match checkpoint.weights {
            Some(weights) => self.weighting.restore_weights(weights)?,
            None => tracing::warn!(
                "チェックポイントに損失の重みがないため、初期重みで再開します"
            ),
        }
        let optimizer = self.optimizer.load_record(checkpoint.optimizer);
        tracing::info!(
            "step {} から学習を再開します ({})",
            checkpoint.step,
            checkpoint.path.display()
        );
        Ok(Self {
            model: checkpoint.model,
            optimizer,
            accumulator: GradientAccumulator::new(self.accumulator.steps()),
            step: checkpoint.step,
            state: SchedulerState::Initialized,
            last_saved_step: Some(checkpoint.step),
            last_checkpoint: Some(checkpoint.path),
            ..self
        })
    }

    /// 自身のチェックポイント置き場からスナップショットを読み込んで再開します。
    ///
    /// 見つからない、または壊れている場合はエラーを返し、最初からの学習には切り替えません。
    pub fn restore(self, target: RestoreTarget, device: &B::Device) -> Result<Self> {
        let checkpoint =
            self.checkpoints
                .restore::<B, M, O>(target, self.model.clone(), device)?;
        self.resume_from(checkpoint)
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn weights(&self) -> &WeightVector {
        self.weighting.weights()
    }

    pub fn weighting(&self) -> &AdaptiveWeightScheme {
        &self.weighting
    }

    pub fn pending_microbatches(&self) -> usize {
        self.accumulator.count()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn transition(&mut self, to: SchedulerState, observer: &mut dyn TrainingObserver) {
        let from = self.state;
        self.state = to;
        observer.on_state_change(from, to);
    }

    fn ensure_not_terminated(&self) -> Result<()> {
        if self.state == SchedulerState::Terminated {
            return Err(PinnError::InvalidConfig(format!(
                "学習は step {} で終了しています",
                self.step
            )));
        }
        Ok(())
    }

    /// 1 ステップ進めます。終了後に呼ぶと `InvalidConfig` です。
    pub fn train_step(
        &mut self,
        batch: &T,
        observer: &mut dyn TrainingObserver,
    ) -> Result<StepOutcome> {
        self.ensure_not_terminated()?;
        if self.state == SchedulerState::Initialized {
            self.transition(SchedulerState::Running, observer);
        }

        let objective = self.weighting.objective(&self.registry, &self.model, batch)?;
        let Objective {
            total,
            total_value,
            losses,
            causal_weights,
        } = objective;

        let grads = GradientsParams::from_grads(total.backward(), &self.model);
        self.accumulator.accumulate::<B>(&self.model, grads);

        let mut applied = false;
        if self.accumulator.should_flush() {
            if let Some(grads) = self.accumulator.flush::<B>(&self.model) {
                let lr = self.optim.learning_rate_at(self.step);
                self.model = self.optimizer.step(lr, self.model.clone(), grads);
                applied = true;
            }
        }

        self.step += 1;
        let step = self.step;

        if step % self.log_every_steps == 0 {
            observer.on_log(&StepRecord {
                step,
                total_loss: total_value,
                losses,
                learning_rate: self.optim.learning_rate_at(step - 1),
            });
        }

        let weights_updated = self.weighting.is_update_step(step);
        if weights_updated {
            self.transition(SchedulerState::WeightUpdating, observer);
            let skipped = self.weighting.update(&self.registry, &self.model, batch)?;
            if !skipped.is_empty() {
                tracing::warn!(
                    "[Step {}] 難しさが 0 または非有限のため重みを据え置きました: {:?}",
                    step,
                    skipped
                );
            }
            observer.on_weights_updated(&WeightUpdateRecord {
                step,
                weights: self.weighting.weights().clone(),
                causal_weights,
                total_loss: total_value,
            });
            self.transition(SchedulerState::Running, observer);
        }

        let checkpoint = if step % self.save_every_steps == 0 {
            Some(self.save(observer)?)
        } else {
            None
        };

        Ok(StepOutcome {
            step,
            total_loss: total_value,
            applied,
            weights_updated,
            checkpoint,
        })
    }

    /// 未適用の蓄積勾配を捨て、捨てたマイクロバッチの数を返します。
    fn discard_pending(&mut self) -> usize {
        let discarded = self.accumulator.discard();
        if discarded > 0 {
            tracing::warn!(
                "[Step {}] 未適用の勾配 {} / {} マイクロバッチ分を破棄しました",
                self.step,
                discarded,
                self.accumulator.steps()
            );
        }
        discarded
    }

    fn save(&mut self, observer: &mut dyn TrainingObserver) -> Result<PathBuf> {
        self.transition(SchedulerState::Checkpointing, observer);
        self.discard_pending();
        let path = self.checkpoints.save::<B, M, O>(
            self.step,
            &self.model,
            &self.optimizer,
            Some(self.weighting.weights()),
        )?;
        observer.on_checkpoint(self.step, &path);
        self.last_saved_step = Some(self.step);
        self.last_checkpoint = Some(path.clone());
        self.transition(SchedulerState::Running, observer);
        Ok(path)
    }

    /// `max_steps` に達するか停止が要求されるまで学習します。
    ///
    /// 終了時には未適用の蓄積勾配を捨て、最後のステップが保存されていなければ
    /// 周期に関係なくチェックポイントを保存します。
    pub fn run<S: BatchSampler<T>>(
        &mut self,
        sampler: &mut S,
        observer: &mut dyn TrainingObserver,
    ) -> Result<TrainingSummary> {
        self.ensure_not_terminated()?;
        let mut stopped_early = false;
        while self.step < self.max_steps {
            if self.stop.is_stop_requested() {
                tracing::info!("[Step {}] 停止要求を受け付けました", self.step);
                stopped_early = true;
                break;
            }
            let batch = sampler.sample(self.step);
            self.train_step(&batch, observer)?;
        }
        self.terminate(stopped_early, observer)
    }

    fn terminate(
        &mut self,
        stopped_early: bool,
        observer: &mut dyn TrainingObserver,
    ) -> Result<TrainingSummary> {
        let discarded = self.discard_pending();

        if self.state == SchedulerState::Initialized {
            self.transition(SchedulerState::Running, observer);
        }
        if self.last_saved_step != Some(self.step) {
            self.save(observer)?;
        }
        self.transition(SchedulerState::Terminated, observer);

        Ok(TrainingSummary {
            final_step: self.step,
            last_checkpoint: self.last_checkpoint.clone(),
            discarded_microbatches: discarded,
            stopped_early,
        })
    }
}
