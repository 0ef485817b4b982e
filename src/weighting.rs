//! 損失項の重み付け。
//!
//! 重みは `update_every_steps` ステップごとにだけ更新します。動的な方式では
//! 損失項ごとの「難しさ」（NTK のトレースまたは勾配ノルム）に反比例する重みを求め、
//! モーメンタム `β` で平滑化します: `w_new = β * w_old + (1 - β) * w_raw`。
//!
//! 因果モードでは残差項の寄与をチャンク損失と因果重みから求め、その値を
//! 目的関数と難しさの計算の両方で使います。

use crate::causal::CausalWeighter;
use crate::config::{WeightingConfig, WeightingScheme};
use crate::error::{PinnError, Result};
use crate::loss::LossTermRegistry;
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 損失項の名前から正の重みへの対応。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightVector(BTreeMap<String, f32>);

impl WeightVector {
    pub fn get(&self, name: &str) -> Option<f32> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(name, weight)| (name.as_str(), *weight))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 2 つの重みベクトルの成分ごとの差の最大値。
    pub fn max_abs_diff(&self, other: &WeightVector) -> f32 {
        self.iter()
            .map(|(name, w)| (w - other.get(name).unwrap_or(0.0)).abs())
            .fold(0.0, f32::max)
    }
}

impl FromIterator<(String, f32)> for WeightVector {
    fn from_iter<I: IntoIterator<Item = (String, f32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// 1 つの損失項の目的関数への寄与。
pub struct Contribution<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub value: f32,
    /// 因果モードの残差項だけが持つチャンクごとの重み
    pub causal_weights: Option<Vec<f32>>,
}

/// 重み付けで参照する 1 つの損失項。
///
/// 因果モードの残差項なら、評価結果には因果重みが適用されています。
pub struct TermContribution<'a, B: Backend, M, T> {
    pub name: &'a str,
    registry: &'a LossTermRegistry<B, M, T>,
    causal: Option<&'a CausalWeighter>,
}

impl<B: Backend, M, T> TermContribution<'_, B, M, T> {
    pub fn is_causal(&self) -> bool {
        self.causal.is_some()
    }

    pub fn evaluate(&self, model: &M, batch: &T) -> Result<Contribution<B>> {
        let Some(weighter) = self.causal else {
            let evaluated = self.registry.evaluate(self.name, model, batch)?;
            return Ok(Contribution {
                loss: evaluated.loss,
                value: evaluated.value,
                causal_weights: None,
            });
        };

        let chunks =
            self.registry
                .evaluate_chunked(self.name, model, batch, weighter.num_chunks())?;
        let weights = weighter.weights(&chunks.values)?;
        // 因果重みは定数として扱い、勾配を流しません
        let mask = Tensor::<B, 1>::from_floats(weights.as_slice(), &chunks.losses.device());
        let loss = (chunks.losses * mask)
            .sum()
            .div_scalar(weighter.num_chunks() as f32);
        Ok(Contribution {
            loss,
            value: weighter.weighted_loss(&chunks.values, &weights),
            causal_weights: Some(weights),
        })
    }

    pub fn pointwise(&self, model: &M, batch: &T) -> Result<Option<Tensor<B, 1>>> {
        self.registry.pointwise(self.name, model, batch)
    }

    /// 因果モードの項なら、点ごとの出力の添字を時刻順のチャンクに分けて返します。
    pub fn time_chunks(&self, batch: &T) -> Result<Option<Vec<Vec<usize>>>> {
        match self.causal {
            Some(weighter) => self
                .registry
                .time_chunks(self.name, batch, weighter.num_chunks()),
            None => Ok(None),
        }
    }
}

/// 損失項の「難しさ」を 1 つのスカラーで返す機能。
///
/// 動的な重み付け方式ごとに実装します。
pub trait DifficultySignal<B: AutodiffBackend, M: AutodiffModule<B>, T> {
    fn difficulty(&self, term: &TermContribution<'_, B, M, T>, model: &M, batch: &T)
    -> Result<f64>;

    /// 難しさから生の重みを求めます。難しさが 0 や非有限の項は含みません。
    fn raw_weights(&self, signals: &BTreeMap<String, f64>) -> BTreeMap<String, f64>;
}

/// 勾配ノルムによる重み付け: `w_raw[t] = mean(|∇L|) / |∇L_t|`。
#[derive(Debug, Clone, Copy, Default)]
pub struct GradNorm;

impl<B: AutodiffBackend, M: AutodiffModule<B>, T> DifficultySignal<B, M, T> for GradNorm {
    fn difficulty(
        &self,
        term: &TermContribution<'_, B, M, T>,
        model: &M,
        batch: &T,
    ) -> Result<f64> {
        let contribution = term.evaluate(model, batch)?;
        let grads = contribution.loss.backward();
        Ok(gradient_sq_norm(model, &grads).sqrt())
    }

    fn raw_weights(&self, signals: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let valid = usable(signals);
        if valid.is_empty() {
            return BTreeMap::new();
        }
        let mean = valid.values().sum::<f64>() / valid.len() as f64;
        valid
            .into_iter()
            .map(|(name, signal)| (name, mean / signal))
            .collect()
    }
}

/// 経験的 NTK の対角平均による重み付け: `w_raw[t] = sum(K) / K_t`。
///
/// 因果モードの残差項では、時刻順のチャンクごとに対角平均 `K_c` を求め、
/// 因果重みを掛けた平均 `mean_c(w_c * K_c)` を難しさとします。
#[derive(Debug, Clone, Copy)]
pub struct NtkTrace {
    pub samples: usize,
}

impl NtkTrace {
    /// `indices` から等間隔に `samples` 点を選び、`|∂f_i/∂θ|²` の平均を返します。
    fn diag_mean<B: AutodiffBackend, M: AutodiffModule<B>, T>(
        term: &TermContribution<'_, B, M, T>,
        model: &M,
        batch: &T,
        indices: &[usize],
        samples: usize,
    ) -> Result<f64> {
        if indices.is_empty() {
            return Ok(0.0);
        }
        // backward でグラフが消費されるため、点ごとに出力を計算し直します
        let samples = samples.clamp(1, indices.len());
        let mut trace = 0.0;
        for j in 0..samples {
            let index = indices[j * indices.len() / samples];
            let outputs = term
                .pointwise(model, batch)?
                .ok_or_else(|| no_pointwise(term.name))?;
            let grads = outputs.slice([index..index + 1]).sum().backward();
            trace += gradient_sq_norm(model, &grads);
        }
        Ok(trace / samples as f64)
    }
}

fn no_pointwise(name: &str) -> PinnError {
    PinnError::InvalidConfig(format!(
        "損失項 '{}' は点ごとの出力を持たないため NTK を計算できません",
        name
    ))
}

impl<B: AutodiffBackend, M: AutodiffModule<B>, T> DifficultySignal<B, M, T> for NtkTrace {
    fn difficulty(
        &self,
        term: &TermContribution<'_, B, M, T>,
        model: &M,
        batch: &T,
    ) -> Result<f64> {
        let num_points = term
            .pointwise(model, batch)?
            .ok_or_else(|| no_pointwise(term.name))?
            .dims()[0];

        if !term.is_causal() {
            let indices: Vec<usize> = (0..num_points).collect();
            return Self::diag_mean(term, model, batch, &indices, self.samples);
        }

        let chunks = term.time_chunks(batch)?.ok_or_else(|| {
            PinnError::InvalidConfig(format!(
                "損失項 '{}' は点ごとの時刻を持たないため因果重み付きの NTK を計算できません",
                term.name
            ))
        })?;
        let counted: usize = chunks.iter().map(Vec::len).sum();
        if counted != num_points {
            return Err(PinnError::LossEvaluation {
                term: term.name.to_string(),
                cause: format!("時刻の数 {} が点の数 {} と一致しません", counted, num_points),
            });
        }
        let weights = term
            .evaluate(model, batch)?
            .causal_weights
            .unwrap_or_else(|| vec![1.0; chunks.len()]);

        let per_chunk = (self.samples / chunks.len()).max(1);
        let mut weighted = 0.0;
        for (chunk, weight) in chunks.iter().zip(&weights) {
            weighted += *weight as f64 * Self::diag_mean(term, model, batch, chunk, per_chunk)?;
        }
        Ok(weighted / chunks.len() as f64)
    }

    fn raw_weights(&self, signals: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let valid = usable(signals);
        let total = valid.values().sum::<f64>();
        valid
            .into_iter()
            .map(|(name, signal)| (name, total / signal))
            .collect()
    }
}

fn usable(signals: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    signals
        .iter()
        .filter(|(_, s)| s.is_finite() && **s > 0.0)
        .map(|(name, s)| (name.clone(), *s))
        .collect()
}

/// モデルの全パラメータにわたる勾配の二乗ノルム。
pub fn gradient_sq_norm<B: AutodiffBackend, M: AutodiffModule<B>>(
    model: &M,
    grads: &B::Gradients,
) -> f64 {
    struct SquaredNorm<'a, B: AutodiffBackend> {
        grads: &'a B::Gradients,
        total: f64,
    }

    impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_, B> {
        fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
            if let Some(grad) = tensor.grad(self.grads) {
                self.total += grad.clone().mul(grad).sum().into_scalar().elem::<f64>();
            }
        }
    }

    let mut visitor = SquaredNorm { grads, total: 0.0 };
    model.visit(&mut visitor);
    visitor.total
}

/// 重み付け方式。設定時に 1 つだけ選びます。
#[derive(Debug, Clone, Copy)]
pub enum WeightPolicy {
    Fixed,
    NtkBalance(NtkTrace),
    GradNormBalance(GradNorm),
}

impl WeightPolicy {
    pub fn from_config(config: &WeightingConfig) -> Self {
        match config.scheme {
            WeightingScheme::None => Self::Fixed,
            WeightingScheme::Ntk => Self::NtkBalance(NtkTrace {
                samples: config.ntk_samples,
            }),
            WeightingScheme::GradNorm => Self::GradNormBalance(GradNorm),
        }
    }

    fn signal<B: AutodiffBackend, M: AutodiffModule<B>, T>(
        &self,
    ) -> Option<&dyn DifficultySignal<B, M, T>> {
        match self {
            Self::Fixed => None,
            Self::NtkBalance(signal) => Some(signal as &dyn DifficultySignal<B, M, T>),
            Self::GradNormBalance(signal) => Some(signal as &dyn DifficultySignal<B, M, T>),
        }
    }
}

/// 目的関数の評価結果。
pub struct Objective<B: Backend> {
    /// `sum(weight[t] * loss[t])`。この値の勾配で最適化します
    pub total: Tensor<B, 1>,
    pub total_value: f32,
    pub losses: BTreeMap<String, f32>,
    pub causal_weights: Option<Vec<f32>>,
}

/// 重みベクトルを保持し、周期的に更新します。
#[derive(Debug, Clone)]
pub struct AdaptiveWeightScheme {
    policy: WeightPolicy,
    weights: WeightVector,
    momentum: f32,
    update_every_steps: usize,
    causal: Option<(String, CausalWeighter)>,
}

impl AdaptiveWeightScheme {
    /// 登録済みの損失項に合わせて重みを初期化します。
    ///
    /// `use_causal` なのに分割可能な残差項がちょうど 1 つ登録されていない場合や、
    /// 未登録の項に初期重みが指定されている場合は `InvalidConfig` です。
    pub fn new<B: Backend, M, T>(
        config: &WeightingConfig,
        registry: &LossTermRegistry<B, M, T>,
    ) -> Result<Self> {
        if !(config.momentum.is_finite() && (0.0..1.0).contains(&config.momentum)) {
            return Err(PinnError::InvalidConfig(format!(
                "weighting.momentum は [0, 1) の範囲が必要です: {}",
                config.momentum
            )));
        }
        if config.update_every_steps == 0 {
            return Err(PinnError::InvalidConfig(
                "weighting.update_every_steps は 1 以上が必要です".to_string(),
            ));
        }
        if registry.is_empty() {
            return Err(PinnError::InvalidConfig(
                "損失項が 1 つも登録されていません".to_string(),
            ));
        }
        if let Some(unknown) = config
            .init_weights
            .keys()
            .find(|name| !registry.contains(name))
        {
            return Err(PinnError::InvalidConfig(format!(
                "初期重みの '{}' は登録された損失項ではありません",
                unknown
            )));
        }

        let mut weights = BTreeMap::new();
        for name in registry.names() {
            let weight = config.init_weights.get(name).copied().unwrap_or(1.0);
            if !(weight.is_finite() && weight > 0.0) {
                return Err(PinnError::InvalidConfig(format!(
                    "損失項 '{}' の初期重みは正の有限値が必要です: {}",
                    name, weight
                )));
            }
            weights.insert(name.to_string(), weight as f32);
        }

        let causal = if config.use_causal {
            let chunkable = registry.chunkable_terms();
            match chunkable.as_slice() {
                [name] => Some((
                    name.to_string(),
                    CausalWeighter::new(config.causal_tol as f32, config.num_chunks)?,
                )),
                [] => {
                    return Err(PinnError::InvalidConfig(
                        "use_causal=true ですが時間方向に分割できる残差項が登録されていません。\
                         use_causal=false にしてください"
                            .to_string(),
                    ));
                }
                names => {
                    return Err(PinnError::InvalidConfig(format!(
                        "時間方向に分割できる損失項が複数あります: {:?}",
                        names
                    )));
                }
            }
        } else {
            None
        };

        Ok(Self {
            policy: WeightPolicy::from_config(config),
            weights: WeightVector(weights),
            momentum: config.momentum as f32,
            update_every_steps: config.update_every_steps,
            causal,
        })
    }

    pub fn weights(&self) -> &WeightVector {
        &self.weights
    }

    pub fn policy(&self) -> &WeightPolicy {
        &self.policy
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// 因果重み付けの対象となる残差項の名前。
    pub fn causal_term(&self) -> Option<&str> {
        self.causal.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn is_update_step(&self, step: usize) -> bool {
        step > 0 && step % self.update_every_steps == 0
    }

    /// チェックポイントから重みを戻します。損失項の集合が一致しなければエラーです。
    pub fn restore_weights(&mut self, weights: WeightVector) -> Result<()> {
        let same_terms = weights.len() == self.weights.len()
            && self.weights.iter().all(|(name, _)| weights.get(name).is_some());
        if !same_terms {
            return Err(PinnError::InvalidConfig(format!(
                "チェックポイントの重み {:?} が登録された損失項と一致しません",
                weights.iter().map(|(n, _)| n).collect::<Vec<_>>()
            )));
        }
        self.weights = weights;
        Ok(())
    }

    fn term<'a, B: Backend, M, T>(
        &'a self,
        registry: &'a LossTermRegistry<B, M, T>,
        name: &'a str,
    ) -> TermContribution<'a, B, M, T> {
        let causal = self
            .causal
            .as_ref()
            .filter(|(causal_name, _)| causal_name == name)
            .map(|(_, weighter)| weighter);
        TermContribution {
            name,
            registry,
            causal,
        }
    }

    /// 現在の重み（読み取りのみ）で目的関数を評価します。
    pub fn objective<B: Backend, M, T>(
        &self,
        registry: &LossTermRegistry<B, M, T>,
        model: &M,
        batch: &T,
    ) -> Result<Objective<B>> {
        let mut weighted = Vec::with_capacity(registry.len());
        let mut losses = BTreeMap::new();
        let mut causal_weights = None;
        let mut total_value = 0.0f32;

        for name in registry.names() {
            let contribution = self.term(registry, name).evaluate(model, batch)?;
            let weight = self.weights.get(name).unwrap_or(1.0);
            total_value += weight * contribution.value;
            weighted.push(contribution.loss.mul_scalar(weight));
            losses.insert(name.to_string(), contribution.value);
            if contribution.causal_weights.is_some() {
                causal_weights = contribution.causal_weights;
            }
        }

        Ok(Objective {
            total: Tensor::cat(weighted, 0).sum(),
            total_value,
            losses,
            causal_weights,
        })
    }

    /// 生の重みをモーメンタムで平滑化して反映します。含まれない項はそのままです。
    pub fn apply_raw_weights(&mut self, raw: &BTreeMap<String, f64>) {
        let beta = self.momentum;
        for (name, weight) in self.weights.0.iter_mut() {
            if let Some(raw) = raw.get(name) {
                *weight = beta * *weight + (1.0 - beta) * *raw as f32;
            }
        }
    }

    /// 重みを更新します。`Fixed` では何もしません。
    ///
    /// すべての項の難しさを計算し終えてから重みを書き換えるため、途中で
    /// 失敗した場合は重みは変わりません。更新しなかった項の名前を返します。
    pub fn update<B: AutodiffBackend, M: AutodiffModule<B>, T>(
        &mut self,
        registry: &LossTermRegistry<B, M, T>,
        model: &M,
        batch: &T,
    ) -> Result<Vec<String>> {
        let policy = self.policy;
        let Some(signal) = policy.signal::<B, M, T>() else {
            return Ok(Vec::new());
        };

        let mut signals = BTreeMap::new();
        for name in registry.names() {
            let term = self.term(registry, name);
            signals.insert(name.to_string(), signal.difficulty(&term, model, batch)?);
        }
        let raw = signal.raw_weights(&signals);
        let skipped = signals
            .keys()
            .filter(|name| !raw.contains_key(*name))
            .cloned()
            .collect();

        self.apply_raw_weights(&raw);
        Ok(skipped)
    }
}
