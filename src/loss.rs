//! 名前付き損失項の登録と評価。
//!
//! 各損失項はモデルとバッチから非負のスカラー損失を計算します。残差項は
//! さらに時間方向のチャンクごとの損失を返せます（因果重み付けに使用）。

use crate::error::{PinnError, Result};
use burn::prelude::Backend;
use burn::tensor::{ElementConversion, Int, Tensor};
use std::collections::BTreeMap;

/// 損失項のインターフェース。
///
/// 実装は純粋関数であることが前提です。同じモデルとバッチに対しては
/// 常に同じ値を返してください。
pub trait LossTerm<B: Backend, M, T> {
    /// 形状 `[1]` の損失を返します。
    fn evaluate(&self, model: &M, batch: &T) -> Result<Tensor<B, 1>>;

    /// 時間方向に分割できる項（残差項）なら `true`。
    fn chunkable(&self) -> bool {
        false
    }

    /// 時間の早い順に並んだ、長さ `num_chunks` のチャンクごとの平均損失。
    fn evaluate_chunked(
        &self,
        _model: &M,
        _batch: &T,
        _num_chunks: usize,
    ) -> Result<Tensor<B, 1>> {
        Err(PinnError::InvalidConfig(
            "この損失項は時間方向に分割できません".to_string(),
        ))
    }

    /// 点ごとの出力（残差や予測誤差）。NTK による重み付けで使います。
    fn pointwise(&self, _model: &M, _batch: &T) -> Option<Result<Tensor<B, 1>>> {
        None
    }

    /// `pointwise` の各点の時刻。チャンク分割できる項は同じ並びで返してください。
    fn times(&self, _batch: &T) -> Option<Vec<f32>> {
        None
    }
}

/// クロージャをスカラー損失項として扱うためのラッパー。
pub struct FnTerm<F>(pub F);

impl<B, M, T, F> LossTerm<B, M, T> for FnTerm<F>
where
    B: Backend,
    F: Fn(&M, &T) -> Result<Tensor<B, 1>>,
{
    fn evaluate(&self, model: &M, batch: &T) -> Result<Tensor<B, 1>> {
        (self.0)(model, batch)
    }
}

/// 評価済みのスカラー損失。`loss` は勾配計算用、`value` はログと検証用です。
pub struct EvaluatedLoss<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub value: f32,
}

/// 評価済みのチャンク損失。
pub struct EvaluatedChunks<B: Backend> {
    pub losses: Tensor<B, 1>,
    pub values: Vec<f32>,
}

/// 名前付き損失項の集まり。登録順を保持します。
pub struct LossTermRegistry<B: Backend, M, T> {
    terms: Vec<(String, Box<dyn LossTerm<B, M, T>>)>,
}

impl<B: Backend, M, T> Default for LossTermRegistry<B, M, T> {
    fn default() -> Self {
        Self { terms: Vec::new() }
    }
}

impl<B: Backend, M, T> LossTermRegistry<B, M, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 損失項を登録します。同じ名前が既にあれば `DuplicateName` になります。
    pub fn register(
        &mut self,
        name: impl Into<String>,
        term: impl LossTerm<B, M, T> + 'static,
    ) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(PinnError::DuplicateName(name));
        }
        self.terms.push((name, Box::new(term)));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.terms.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// 時間方向に分割できる項の名前。
    pub fn chunkable_terms(&self) -> Vec<&str> {
        self.terms
            .iter()
            .filter(|(_, term)| term.chunkable())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    fn term(&self, name: &str) -> Result<&dyn LossTerm<B, M, T>> {
        self.terms
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, term)| term.as_ref())
            .ok_or_else(|| PinnError::UnknownTerm(name.to_string()))
    }

    /// 1 つの項を評価します。非有限値や負の値は `LossEvaluation` になります。
    pub fn evaluate(&self, name: &str, model: &M, batch: &T) -> Result<EvaluatedLoss<B>> {
        let loss = self
            .term(name)?
            .evaluate(model, batch)
            .map_err(|e| evaluation_error(name, e))?;
        let dims = loss.dims();
        if dims[0] != 1 {
            return Err(evaluation_error(
                name,
                PinnError::ShapeMismatch {
                    expected: "[1]".to_string(),
                    got: format!("{:?}", dims),
                },
            ));
        }
        let value = loss.clone().into_scalar().elem::<f32>();
        check_value(name, value)?;
        Ok(EvaluatedLoss { loss, value })
    }

    /// 残差項をチャンクごとに評価します。
    pub fn evaluate_chunked(
        &self,
        name: &str,
        model: &M,
        batch: &T,
        num_chunks: usize,
    ) -> Result<EvaluatedChunks<B>> {
        let term = self.term(name)?;
        if !term.chunkable() {
            return Err(PinnError::InvalidConfig(format!(
                "損失項 '{}' は時間方向に分割できません",
                name
            )));
        }
        let losses = term
            .evaluate_chunked(model, batch, num_chunks)
            .map_err(|e| evaluation_error(name, e))?;
        let values = to_host(&losses).map_err(|e| evaluation_error(name, e))?;
        if values.len() != num_chunks {
            return Err(evaluation_error(
                name,
                PinnError::ShapeMismatch {
                    expected: format!("[{}]", num_chunks),
                    got: format!("[{}]", values.len()),
                },
            ));
        }
        for value in &values {
            check_value(name, *value)?;
        }
        Ok(EvaluatedChunks { losses, values })
    }

    /// 点ごとの出力。対応していない項は `None` です。
    pub fn pointwise(&self, name: &str, model: &M, batch: &T) -> Result<Option<Tensor<B, 1>>> {
        match self.term(name)?.pointwise(model, batch) {
            Some(outputs) => outputs.map(Some).map_err(|e| evaluation_error(name, e)),
            None => Ok(None),
        }
    }

    /// 点ごとの出力の添字を時刻順のチャンクに分けます。時刻を持たない項は `None` です。
    pub fn time_chunks(
        &self,
        name: &str,
        batch: &T,
        num_chunks: usize,
    ) -> Result<Option<Vec<Vec<usize>>>> {
        match self.term(name)?.times(batch) {
            Some(times) => time_chunks(&times, num_chunks)
                .map(Some)
                .map_err(|e| evaluation_error(name, e)),
            None => Ok(None),
        }
    }

    /// すべての項を評価し、名前から損失値への対応を返します。
    ///
    /// 1 つでも失敗したらステップ全体を中止します。
    pub fn evaluate_all(&self, model: &M, batch: &T) -> Result<BTreeMap<String, f32>> {
        self.terms
            .iter()
            .map(|(name, _)| Ok((name.clone(), self.evaluate(name, model, batch)?.value)))
            .collect()
    }
}

fn evaluation_error(term: &str, cause: PinnError) -> PinnError {
    match cause {
        PinnError::LossEvaluation { .. } => cause,
        other => PinnError::LossEvaluation {
            term: term.to_string(),
            cause: other.to_string(),
        },
    }
}

fn check_value(term: &str, value: f32) -> Result<()> {
    if !value.is_finite() {
        return Err(PinnError::LossEvaluation {
            term: term.to_string(),
            cause: format!("非有限の損失値 {}", value),
        });
    }
    if value < 0.0 {
        return Err(PinnError::LossEvaluation {
            term: term.to_string(),
            cause: format!("負の損失値 {}", value),
        });
    }
    Ok(())
}

/// テンソルの値を `f32` としてホストへ取り出します。
pub fn to_host<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| PinnError::ShapeMismatch {
            expected: "f32".to_string(),
            got: format!("{:?}", e),
        })
}

/// 点の添字を時刻 `times` の昇順に並べ、等しい点数の `num_chunks` 個の
/// 連続した区間に分けます。
///
/// 区間の境界は時刻の並びだけで決まり、値の大きさには依存しません。
pub fn time_chunks(times: &[f32], num_chunks: usize) -> Result<Vec<Vec<usize>>> {
    let n = times.len();
    if num_chunks == 0 || n < num_chunks {
        return Err(PinnError::ShapeMismatch {
            expected: format!("{} 個以上の点", num_chunks.max(1)),
            got: format!("{} 個", n),
        });
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));
    Ok((0..num_chunks)
        .map(|c| order[c * n / num_chunks..(c + 1) * n / num_chunks].to_vec())
        .collect())
}

/// 点ごとの値 `values` を [`time_chunks`] で分け、それぞれの平均を返します。
pub fn time_chunk_means<B: Backend>(
    times: &[f32],
    values: Tensor<B, 1>,
    num_chunks: usize,
) -> Result<Tensor<B, 1>> {
    let n = values.dims()[0];
    if times.len() != n {
        return Err(PinnError::ShapeMismatch {
            expected: format!("{} 個の時刻", n),
            got: format!("{} 個", times.len()),
        });
    }

    let device = values.device();
    let means = time_chunks(times, num_chunks)?
        .into_iter()
        .map(|chunk| {
            let chunk: Vec<i32> = chunk.into_iter().map(|i| i as i32).collect();
            let indices = Tensor::<B, 1, Int>::from_ints(chunk.as_slice(), &device);
            values.clone().select(0, indices).mean()
        })
        .collect();
    Ok(Tensor::cat(means, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn constant(value: f32) -> FnTerm<impl Fn(&(), &()) -> Result<Tensor<TestBackend, 1>>> {
        FnTerm(move |_: &(), _: &()| {
            Ok(Tensor::<TestBackend, 1>::from_floats([value], &Default::default()))
        })
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = LossTermRegistry::<TestBackend, (), ()>::new();
        registry.register("ics", constant(1.0)).unwrap();
        let err = registry.register("ics", constant(2.0)).unwrap_err();
        assert!(matches!(err, PinnError::DuplicateName(name) if name == "ics"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn evaluate_all_returns_every_term() {
        let mut registry = LossTermRegistry::<TestBackend, (), ()>::new();
        registry.register("ics", constant(1.5)).unwrap();
        registry.register("data", constant(0.25)).unwrap();
        let values = registry.evaluate_all(&(), &()).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["ics"], 1.5);
        assert_eq!(values["data"], 0.25);
    }

    #[test]
    fn non_finite_loss_aborts_evaluation() {
        let mut registry = LossTermRegistry::<TestBackend, (), ()>::new();
        registry.register("ics", constant(1.0)).unwrap();
        registry.register("res", constant(f32::NAN)).unwrap();
        match registry.evaluate_all(&(), &()) {
            Err(PinnError::LossEvaluation { term, .. }) => assert_eq!(term, "res"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn term_errors_carry_the_term_name() {
        let mut registry = LossTermRegistry::<TestBackend, (), ()>::new();
        registry
            .register(
                "data",
                FnTerm(|_: &(), _: &()| -> Result<Tensor<TestBackend, 1>> {
                    Err(PinnError::InvalidConfig("overflow".to_string()))
                }),
            )
            .unwrap();
        match registry.evaluate("data", &(), &()) {
            Err(PinnError::LossEvaluation { term, cause }) => {
                assert_eq!(term, "data");
                assert!(cause.contains("overflow"));
            }
            _ => panic!("expected LossEvaluation"),
        }
    }

    #[test]
    fn scalar_terms_cannot_be_chunked() {
        let mut registry = LossTermRegistry::<TestBackend, (), ()>::new();
        registry.register("ics", constant(1.0)).unwrap();
        assert!(registry.chunkable_terms().is_empty());
        assert!(registry.evaluate_chunked("ics", &(), &(), 4).is_err());
    }

    #[test]
    fn chunks_follow_time_order_not_magnitude() {
        let device = Default::default();
        // 時刻がばらばらに並んだ 6 点、値は時刻に比例
        let times = [0.5, 0.0, 0.9, 0.1, 0.6, 0.4];
        let values = Tensor::<TestBackend, 1>::from_floats([5.0, 0.0, 9.0, 1.0, 6.0, 4.0], &device);
        let means = time_chunk_means(&times, values, 3).unwrap();
        let means = to_host(&means).unwrap();
        assert_eq!(means.len(), 3);
        assert!((means[0] - 0.5).abs() < 1e-6);
        assert!((means[1] - 4.5).abs() < 1e-6);
        assert!((means[2] - 7.5).abs() < 1e-6);
    }

    #[test]
    fn uneven_points_still_fill_every_chunk() {
        let device = Default::default();
        let times = [0.0, 0.1, 0.2, 0.3, 0.4];
        let values = Tensor::<TestBackend, 1>::from_floats([1.0, 1.0, 2.0, 2.0, 2.0], &device);
        let means = to_host(&time_chunk_means(&times, values, 2).unwrap()).unwrap();
        assert_eq!(means, vec![1.0, 2.0]);
    }

    #[test]
    fn chunk_indices_are_sorted_by_time() {
        let chunks = time_chunks(&[0.5, 0.0, 0.9, 0.1, 0.6, 0.4], 2).unwrap();
        assert_eq!(chunks, vec![vec![1, 3, 5], vec![0, 4, 2]]);
    }

    #[test]
    fn fewer_points_than_chunks_is_an_error() {
        let device = Default::default();
        let values = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device);
        assert!(time_chunk_means(&[0.0, 1.0], values, 3).is_err());
    }
}
