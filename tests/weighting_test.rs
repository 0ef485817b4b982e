mod common;

use burn::tensor::Tensor;
use common::*;
use pinn_scheduler::config::{WeightingConfig, WeightingScheme};
use pinn_scheduler::loss::{LossTerm, time_chunk_means};
use pinn_scheduler::{AdaptiveWeightScheme, Result};

/// 点 `i` の出力が `t_i * output` になる残差項。
///
/// `|∂f_i/∂θ|² = 2 t_i²` なので、遅い時刻ほど NTK の対角が大きくなります。
struct TimedTerm {
    times: Vec<f32>,
}

impl TimedTerm {
    fn outputs(&self, model: &TestModel) -> Tensor<TestBackend, 1> {
        let repeated = Tensor::cat(vec![model.output(); self.times.len()], 0);
        repeated * Tensor::from_floats(self.times.as_slice(), &test_device())
    }
}

impl LossTerm<TestBackend, TestModel, StubBatch> for TimedTerm {
    fn evaluate(&self, model: &TestModel, _batch: &StubBatch) -> Result<Tensor<TestBackend, 1>> {
        Ok(self.outputs(model).powf_scalar(2.0).mean())
    }

    fn chunkable(&self) -> bool {
        true
    }

    /// どのチャンクも損失 1
    fn evaluate_chunked(
        &self,
        model: &TestModel,
        _batch: &StubBatch,
        num_chunks: usize,
    ) -> Result<Tensor<TestBackend, 1>> {
        let ones = self.outputs(model).mul_scalar(0.0).add_scalar(1.0);
        time_chunk_means(&self.times, ones, num_chunks)
    }

    fn pointwise(
        &self,
        model: &TestModel,
        _batch: &StubBatch,
    ) -> Option<Result<Tensor<TestBackend, 1>>> {
        Some(Ok(self.outputs(model)))
    }

    fn times(&self, _batch: &StubBatch) -> Option<Vec<f32>> {
        Some(self.times.clone())
    }
}

/// 出力そのものを点ごとの出力とする項。NTK の対角は 2。
struct OutputTerm;

impl LossTerm<TestBackend, TestModel, StubBatch> for OutputTerm {
    fn evaluate(&self, model: &TestModel, _batch: &StubBatch) -> Result<Tensor<TestBackend, 1>> {
        Ok(model.output().sub_scalar(10.0).powf_scalar(2.0))
    }

    fn pointwise(
        &self,
        model: &TestModel,
        _batch: &StubBatch,
    ) -> Option<Result<Tensor<TestBackend, 1>>> {
        Some(Ok(model.output()))
    }
}

/// モーメンタム 0 で 1 回更新し、重みの比から残差項の NTK を逆算します。
fn residual_ntk(use_causal: bool) -> f32 {
    let mut registry = TestRegistry::new();
    registry.register("ics", OutputTerm).unwrap();
    registry
        .register(
            "res",
            TimedTerm {
                times: vec![0.75, 0.25, 1.0, 0.5],
            },
        )
        .unwrap();
    let config = WeightingConfig::new()
        .with_scheme(WeightingScheme::Ntk)
        .with_momentum(0.0)
        .with_use_causal(use_causal)
        .with_causal_tol(1.0)
        .with_num_chunks(2)
        .with_ntk_samples(4);
    let mut scheme = AdaptiveWeightScheme::new(&config, &registry).unwrap();
    let model = TestModel::new(&test_device());

    let skipped = scheme.update(&registry, &model, &stub_sampler(0)).unwrap();
    assert!(skipped.is_empty());
    // w_ics / w_res = K_res / K_ics, K_ics = 2
    let weights = scheme.weights();
    2.0 * weights.get("ics").unwrap() / weights.get("res").unwrap()
}

#[test]
fn ntk_without_causal_mode_averages_every_point() {
    // 2 * (0.75² + 0.25² + 1² + 0.5²) / 4
    let ntk = residual_ntk(false);
    assert!((ntk - 0.9375).abs() < 1e-4, "ntk = {}", ntk);
}

#[test]
fn causal_ntk_weights_each_time_chunk() {
    // 時刻順のチャンク: {0.25, 0.5} と {0.75, 1.0}
    let early = (2.0 * 0.25f32.powi(2) + 2.0 * 0.5f32.powi(2)) / 2.0;
    let late = (2.0 * 0.75f32.powi(2) + 2.0 * 1.0f32.powi(2)) / 2.0;
    // チャンク損失がすべて 1 なので因果重みは [1, e^-1]
    let expected = (early + (-1.0f32).exp() * late) / 2.0;

    let ntk = residual_ntk(true);
    assert!((ntk - expected).abs() < 1e-4, "ntk = {}, expected = {}", ntk, expected);
}

#[test]
fn back_to_back_updates_move_weights_by_at_most_one_minus_beta() {
    let beta = 0.999;
    let mut registry = TestRegistry::new();
    registry.register("ics", squared_error_term(1.0)).unwrap();
    registry.register("data", squared_error_term(100.0)).unwrap();
    let config = WeightingConfig::new()
        .with_scheme(WeightingScheme::GradNorm)
        .with_momentum(beta);
    let mut scheme = AdaptiveWeightScheme::new(&config, &registry).unwrap();
    let model = TestModel::new(&test_device());
    let batch = stub_sampler(0);

    // 勾配ノルムの比は 1 : 100 なので生の重みは ics = 50.5、data = 0.505
    let raw = [("ics", 50.5f32), ("data", 0.505f32)];
    for _ in 0..2 {
        let before = scheme.weights().clone();
        scheme.update(&registry, &model, &batch).unwrap();
        let max_raw_delta = raw
            .iter()
            .map(|(name, w)| (w - before.get(name).unwrap()).abs())
            .fold(0.0, f32::max);
        let change = scheme.weights().max_abs_diff(&before);
        assert!(change > 0.0);
        assert!(
            change <= (1.0 - beta as f32) * max_raw_delta + 1e-4,
            "change = {}",
            change
        );
    }
}
