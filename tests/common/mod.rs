//! 結合テストの共通ヘルパー。
#![allow(dead_code)]

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::optim::Optimizer;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use pinn_scheduler::checkpoint::{Checkpoint, CheckpointManager, RestoreTarget};
use pinn_scheduler::config::{
    LoggingConfig, OptimConfig, SavingConfig, TrainConfig, TrainingConfig, WeightingConfig,
};
use pinn_scheduler::loss::{FnTerm, LossTerm, to_host};
use pinn_scheduler::{LossTermRegistry, Result};

pub type TestBackend = Autodiff<NdArray<f32>>;
pub type InnerBackend = NdArray<f32>;

pub fn test_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// パラメータが 2 つだけの小さなモデル。
#[derive(Module, Debug)]
pub struct Probe<B: Backend> {
    pub linear: Linear<B>,
}

impl<B: Backend> Probe<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(1, 1).init(device),
        }
    }

    /// 入力 1.0 に対する出力。形状は `[1]`
    pub fn output(&self) -> Tensor<B, 1> {
        let device = self.linear.weight.val().device();
        self.linear
            .forward(Tensor::<B, 2>::ones([1, 1], &device))
            .reshape([1])
    }

    pub fn params(&self) -> Vec<f32> {
        let mut params = to_host(&self.linear.weight.val()).unwrap();
        if let Some(bias) = &self.linear.bias {
            params.extend(to_host(&bias.val()).unwrap());
        }
        params
    }
}

pub type TestModel = Probe<TestBackend>;

/// ステップ番号だけを持つバッチ。
#[derive(Debug, Clone, Copy)]
pub struct StubBatch {
    pub step: usize,
}

pub type TestRegistry = LossTermRegistry<TestBackend, TestModel, StubBatch>;

pub fn stub_sampler(step: usize) -> StubBatch {
    StubBatch { step }
}

/// 値は常に `value` だが、パラメータに依存したグラフを持つ損失項。
pub fn constant_term(
    value: f32,
) -> FnTerm<impl Fn(&TestModel, &StubBatch) -> Result<Tensor<TestBackend, 1>>> {
    FnTerm(move |model: &TestModel, _: &StubBatch| {
        Ok(model.output().mul_scalar(0.0).add_scalar(value))
    })
}

/// `scale * (output - 10)^2`。勾配の大きさは `scale` に比例します。
pub fn squared_error_term(
    scale: f32,
) -> FnTerm<impl Fn(&TestModel, &StubBatch) -> Result<Tensor<TestBackend, 1>>> {
    FnTerm(move |model: &TestModel, _: &StubBatch| {
        Ok(model.output().sub_scalar(10.0).powf_scalar(2.0).mul_scalar(scale))
    })
}

/// チャンク損失を `(step, num_chunks)` から決める残差項。
pub struct ChunkedTerm<F>(pub F);

impl<F> ChunkedTerm<F>
where
    F: Fn(usize, usize) -> Vec<f32>,
{
    fn chunks(
        &self,
        model: &TestModel,
        batch: &StubBatch,
        num_chunks: usize,
    ) -> Tensor<TestBackend, 1> {
        let values = (self.0)(batch.step, num_chunks);
        let anchor = model.output().mul_scalar(0.0);
        let anchors = Tensor::cat(vec![anchor; values.len()], 0);
        anchors + Tensor::from_floats(values.as_slice(), &test_device())
    }
}

impl<F> LossTerm<TestBackend, TestModel, StubBatch> for ChunkedTerm<F>
where
    F: Fn(usize, usize) -> Vec<f32>,
{
    fn evaluate(&self, model: &TestModel, batch: &StubBatch) -> Result<Tensor<TestBackend, 1>> {
        Ok(self.chunks(model, batch, 1).mean())
    }

    fn chunkable(&self) -> bool {
        true
    }

    fn evaluate_chunked(
        &self,
        model: &TestModel,
        batch: &StubBatch,
        num_chunks: usize,
    ) -> Result<Tensor<TestBackend, 1>> {
        Ok(self.chunks(model, batch, num_chunks))
    }
}

/// 保存・重み更新・ログの周期を指定した設定。
pub fn test_config(max_steps: usize, update_every: usize, save_every: usize) -> TrainConfig {
    TrainConfig::new()
        .with_run_name("test".to_string())
        .with_training(TrainingConfig::new().with_max_steps(max_steps).with_batch_size(64))
        .with_optim(
            OptimConfig::new()
                .with_learning_rate(1e-2)
                .with_warmup_steps(0)
                .with_decay_steps(1000),
        )
        .with_weighting(WeightingConfig::new().with_update_every_steps(update_every))
        .with_saving(SavingConfig::new().with_save_every_steps(save_every).with_num_keep_ckpts(10))
        .with_logging(LoggingConfig::new().with_log_every_steps(save_every))
}

/// オプティマイザの型を値から推論して復元します。
pub fn restore_like<O>(
    manager: &CheckpointManager,
    target: RestoreTarget,
    template: TestModel,
    _optimizer: &O,
) -> Result<Checkpoint<TestModel, O::Record>>
where
    O: Optimizer<TestModel, TestBackend>,
{
    manager.restore::<TestBackend, TestModel, O>(target, template, &test_device())
}
