//! 1次元移流方程式 `u_t + c u_x = 0` の問題設定。
//!
//! 領域は `t ∈ [0, 1]`、`x ∈ [-1, 1]`、初期条件は `u(0, x) = sin(πx)`、
//! 境界は周期境界です。厳密解 `u(t, x) = sin(π(x - ct))` を `data` 項の教師値に使います。
//!
//! モデルの入力は座標 `(t, x)` の順です。

use crate::error::Result;
use crate::loss::{LossTerm, LossTermRegistry, time_chunk_means};
use crate::model::Model;
use crate::scheduler::BatchSampler;
use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

/// 移流速度 `c`
pub const ADVECTION_SPEED: f32 = 1.0;

/// 残差の差分近似に使う刻み幅
const FD_STEP: f32 = 1e-3;

pub fn exact_solution(t: f32, x: f32) -> f32 {
    (PI * (x - ADVECTION_SPEED * t)).sin()
}

/// 1 ステップ分の学習データ。
#[derive(Clone)]
pub struct AdvectionBatch<B: Backend> {
    pub ic_coords: Tensor<B, 2>,
    pub ic_values: Tensor<B, 2>,
    /// `x = -1` の境界点
    pub bc_left: Tensor<B, 2>,
    /// `bc_left` と同じ時刻の `x = 1` の境界点
    pub bc_right: Tensor<B, 2>,
    pub res_coords: Tensor<B, 2>,
    /// `res_coords` の時刻（チャンク分割用）
    pub res_times: Vec<f32>,
    pub data_coords: Tensor<B, 2>,
    pub data_values: Tensor<B, 2>,
}

/// 各損失項の点の数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizes {
    pub ics: usize,
    pub bcs: usize,
    pub res: usize,
    pub data: usize,
}

impl BatchSizes {
    /// 残差点を `batch_size` 個、それ以外を 4 分の 1 ずつにします。
    pub fn from_batch_size(batch_size: usize) -> Self {
        let side = (batch_size / 4).max(1);
        Self {
            ics: side,
            bcs: side,
            res: batch_size.max(1),
            data: side,
        }
    }
}

/// `(seed, step)` だけで決まるバッチを作ります。
pub struct AdvectionSampler<B: Backend> {
    seed: u64,
    sizes: BatchSizes,
    device: B::Device,
}

impl<B: Backend> AdvectionSampler<B> {
    pub fn new(seed: u64, sizes: BatchSizes, device: &B::Device) -> Self {
        Self {
            seed,
            sizes,
            device: device.clone(),
        }
    }

    pub fn sizes(&self) -> BatchSizes {
        self.sizes
    }

    fn coords(&self, t: &[f32], x: &[f32]) -> Tensor<B, 2> {
        let flat: Vec<f32> = t.iter().zip(x).flat_map(|(t, x)| [*t, *x]).collect();
        Tensor::<B, 1>::from_floats(flat.as_slice(), &self.device).reshape([t.len(), 2])
    }

    fn column(&self, values: &[f32]) -> Tensor<B, 2> {
        Tensor::<B, 1>::from_floats(values, &self.device).reshape([values.len(), 1])
    }
}

impl<B: Backend> BatchSampler<AdvectionBatch<B>> for AdvectionSampler<B> {
    fn sample(&mut self, step: usize) -> AdvectionBatch<B> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(step as u64));
        let mut uniform = |n: usize, low: f32, high: f32| -> Vec<f32> {
            (0..n).map(|_| rng.random_range(low..high)).collect()
        };

        let sizes = self.sizes;

        // --- 初期条件 ---
        let x_ic = uniform(sizes.ics, -1.0, 1.0);
        let t_ic = vec![0.0; sizes.ics];
        let u_ic: Vec<f32> = x_ic.iter().map(|x| exact_solution(0.0, *x)).collect();

        // --- 周期境界 ---
        let t_bc = uniform(sizes.bcs, 0.0, 1.0);
        let left = vec![-1.0; sizes.bcs];
        let right = vec![1.0; sizes.bcs];

        // --- コロケーション点 ---
        let t_res = uniform(sizes.res, 0.0, 1.0);
        let x_res = uniform(sizes.res, -1.0, 1.0);

        // --- 観測データ ---
        let t_data = uniform(sizes.data, 0.0, 1.0);
        let x_data = uniform(sizes.data, -1.0, 1.0);
        let u_data: Vec<f32> = t_data
            .iter()
            .zip(&x_data)
            .map(|(t, x)| exact_solution(*t, *x))
            .collect();

        AdvectionBatch {
            ic_coords: self.coords(&t_ic, &x_ic),
            ic_values: self.column(&u_ic),
            bc_left: self.coords(&t_bc, &left),
            bc_right: self.coords(&t_bc, &right),
            res_coords: self.coords(&t_res, &x_res),
            res_times: t_res,
            data_coords: self.coords(&t_data, &x_data),
            data_values: self.column(&u_data),
        }
    }
}

fn flatten<B: Backend>(values: Tensor<B, 2>) -> Tensor<B, 1> {
    let n = values.dims()[0];
    values.reshape([n])
}

/// 移流方程式の点ごとの残差 `u_t + c u_x` を中心差分で近似します。
///
/// 4 つのずらした座標をまとめて 1 回の順伝播で評価します。
pub fn residual<B: Backend>(model: &Model<B>, coords: Tensor<B, 2>) -> Tensor<B, 1> {
    let n = coords.dims()[0];
    let device = coords.device();
    let shift = |dt: f32, dx: f32| {
        coords
            .clone()
            .add(Tensor::<B, 2>::from_floats([[dt, dx]], &device))
    };
    let shifted = Tensor::cat(
        vec![
            shift(FD_STEP, 0.0),
            shift(-FD_STEP, 0.0),
            shift(0.0, FD_STEP),
            shift(0.0, -FD_STEP),
        ],
        0,
    );
    let u = flatten(model.forward(shifted));
    let u_t = (u.clone().slice([0..n]) - u.clone().slice([n..2 * n])).div_scalar(2.0 * FD_STEP);
    let u_x = (u.clone().slice([2 * n..3 * n]) - u.slice([3 * n..4 * n])).div_scalar(2.0 * FD_STEP);
    u_t + u_x.mul_scalar(ADVECTION_SPEED)
}

/// 初期条件の二乗誤差。
#[derive(Debug, Clone, Copy, Default)]
pub struct IcsLoss;

impl<B: Backend> LossTerm<B, Model<B>, AdvectionBatch<B>> for IcsLoss {
    fn evaluate(&self, model: &Model<B>, batch: &AdvectionBatch<B>) -> Result<Tensor<B, 1>> {
        let pred = model.forward(batch.ic_coords.clone());
        Ok(MseLoss::new().forward(pred, batch.ic_values.clone(), Reduction::Mean))
    }

    fn pointwise(
        &self,
        model: &Model<B>,
        batch: &AdvectionBatch<B>,
    ) -> Option<Result<Tensor<B, 1>>> {
        Some(Ok(flatten(model.forward(batch.ic_coords.clone()))))
    }
}

/// 周期境界 `u(t, -1) = u(t, 1)` の二乗誤差。
#[derive(Debug, Clone, Copy, Default)]
pub struct BcsLoss;

impl BcsLoss {
    fn gap<B: Backend>(model: &Model<B>, batch: &AdvectionBatch<B>) -> Tensor<B, 2> {
        model.forward(batch.bc_left.clone()) - model.forward(batch.bc_right.clone())
    }
}

impl<B: Backend> LossTerm<B, Model<B>, AdvectionBatch<B>> for BcsLoss {
    fn evaluate(&self, model: &Model<B>, batch: &AdvectionBatch<B>) -> Result<Tensor<B, 1>> {
        let gap = Self::gap(model, batch);
        Ok(MseLoss::new().forward(gap.clone(), gap.zeros_like(), Reduction::Mean))
    }

    fn pointwise(
        &self,
        model: &Model<B>,
        batch: &AdvectionBatch<B>,
    ) -> Option<Result<Tensor<B, 1>>> {
        Some(Ok(flatten(Self::gap(model, batch))))
    }
}

/// 移流方程式の残差の二乗平均。時間方向に分割できます。
#[derive(Debug, Clone, Copy, Default)]
pub struct ResidualLoss;

impl<B: Backend> LossTerm<B, Model<B>, AdvectionBatch<B>> for ResidualLoss {
    fn evaluate(&self, model: &Model<B>, batch: &AdvectionBatch<B>) -> Result<Tensor<B, 1>> {
        Ok(residual(model, batch.res_coords.clone()).powf_scalar(2.0).mean())
    }

    fn chunkable(&self) -> bool {
        true
    }

    fn evaluate_chunked(
        &self,
        model: &Model<B>,
        batch: &AdvectionBatch<B>,
        num_chunks: usize,
    ) -> Result<Tensor<B, 1>> {
        let squared = residual(model, batch.res_coords.clone()).powf_scalar(2.0);
        time_chunk_means(&batch.res_times, squared, num_chunks)
    }

    fn pointwise(
        &self,
        model: &Model<B>,
        batch: &AdvectionBatch<B>,
    ) -> Option<Result<Tensor<B, 1>>> {
        Some(Ok(residual(model, batch.res_coords.clone())))
    }

    fn times(&self, batch: &AdvectionBatch<B>) -> Option<Vec<f32>> {
        Some(batch.res_times.clone())
    }
}

/// 観測値（厳密解）との二乗誤差。
#[derive(Debug, Clone, Copy, Default)]
pub struct DataLoss;

impl<B: Backend> LossTerm<B, Model<B>, AdvectionBatch<B>> for DataLoss {
    fn evaluate(&self, model: &Model<B>, batch: &AdvectionBatch<B>) -> Result<Tensor<B, 1>> {
        let pred = model.forward(batch.data_coords.clone());
        Ok(MseLoss::new().forward(pred, batch.data_values.clone(), Reduction::Mean))
    }

    fn pointwise(
        &self,
        model: &Model<B>,
        batch: &AdvectionBatch<B>,
    ) -> Option<Result<Tensor<B, 1>>> {
        Some(Ok(flatten(model.forward(batch.data_coords.clone()))))
    }
}

/// `ics`、`bcs`、`res`、`data` の 4 項を登録したレジストリを作ります。
pub fn build_registry<B: Backend>() -> Result<LossTermRegistry<B, Model<B>, AdvectionBatch<B>>> {
    let mut registry = LossTermRegistry::new();
    registry.register("ics", IcsLoss)?;
    registry.register("bcs", BcsLoss)?;
    registry.register("res", ResidualLoss)?;
    registry.register("data", DataLoss)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::loss::to_host;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn sampler(batch_size: usize) -> AdvectionSampler<TestBackend> {
        AdvectionSampler::new(42, BatchSizes::from_batch_size(batch_size), &Default::default())
    }

    #[test]
    fn same_step_gives_same_batch() {
        let a = sampler(64).sample(7);
        let b = sampler(64).sample(7);
        let c = sampler(64).sample(8);
        assert_eq!(to_host(&a.res_coords).unwrap(), to_host(&b.res_coords).unwrap());
        assert_eq!(a.res_times, b.res_times);
        assert_ne!(a.res_times, c.res_times);
    }

    #[test]
    fn batch_shapes_follow_sizes() {
        let batch = sampler(64).sample(0);
        assert_eq!(batch.ic_coords.dims(), [16, 2]);
        assert_eq!(batch.ic_values.dims(), [16, 1]);
        assert_eq!(batch.bc_left.dims(), [16, 2]);
        assert_eq!(batch.res_coords.dims(), [64, 2]);
        assert_eq!(batch.res_times.len(), 64);
        assert_eq!(batch.data_values.dims(), [16, 1]);
        let ic_t = to_host(&batch.ic_coords.slice([0..16, 0..1])).unwrap();
        assert!(ic_t.iter().all(|t| *t == 0.0));
    }

    #[test]
    fn registry_has_one_chunkable_term() {
        let registry = build_registry::<TestBackend>().unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["ics", "bcs", "res", "data"]);
        assert_eq!(registry.chunkable_terms(), ["res"]);
    }

    #[test]
    fn all_terms_evaluate_to_finite_values() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_hidden_dim(8)
            .with_num_layers(2)
            .init::<TestBackend>(&device);
        let batch = sampler(64).sample(0);
        let registry = build_registry::<TestBackend>().unwrap();

        let values = registry.evaluate_all(&model, &batch).unwrap();
        assert_eq!(values.len(), 4);
        assert!(values.values().all(|v| v.is_finite() && *v >= 0.0));

        let chunks = registry.evaluate_chunked("res", &model, &batch, 8).unwrap();
        assert_eq!(chunks.values.len(), 8);
        let mean = chunks.values.iter().sum::<f32>() / 8.0;
        assert!((mean - values["res"]).abs() <= 1e-3 * values["res"].max(1.0));
    }

    #[test]
    fn exact_solution_is_periodic_and_transported() {
        for t in [0.0, 0.25, 0.8] {
            assert!((exact_solution(t, -1.0) - exact_solution(t, 1.0)).abs() < 1e-5);
            let x = 0.3;
            let transported = exact_solution(0.0, x - ADVECTION_SPEED * t);
            assert!((exact_solution(t, x) - transported).abs() < 1e-5);
        }
    }
}
