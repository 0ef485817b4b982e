//! 時間方向の因果重み付け。
//!
//! 早い時刻のチャンクの残差が十分小さくなるまで、遅い時刻のチャンクの
//! 重みを小さく抑えます。チャンク `c` の重みは
//! `w_c = exp(-tol * M_c)`、`M_c = L_0 + ... + L_{c-1}` です。

use crate::error::{PinnError, Result};

/// チャンクごとの因果重みを計算します。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CausalWeighter {
    tol: f32,
    num_chunks: usize,
}

impl CausalWeighter {
    pub fn new(tol: f32, num_chunks: usize) -> Result<Self> {
        if !tol.is_finite() || tol < 0.0 {
            return Err(PinnError::InvalidConfig(format!(
                "causal_tol は 0 以上の有限値が必要です: {}",
                tol
            )));
        }
        if num_chunks == 0 {
            return Err(PinnError::InvalidConfig(
                "num_chunks は 1 以上が必要です".to_string(),
            ));
        }
        Ok(Self { tol, num_chunks })
    }

    pub fn tol(&self) -> f32 {
        self.tol
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    /// 現在のパラメータで計算したチャンク損失から重みを求めます。
    ///
    /// 重みの和は 1 に正規化しません。累積損失が有限でなくなった時点で
    /// そのチャンク番号とともに `CausalWeight` を返します。
    pub fn weights(&self, chunk_losses: &[f32]) -> Result<Vec<f32>> {
        if chunk_losses.len() != self.num_chunks {
            return Err(PinnError::ShapeMismatch {
                expected: format!("{} 個のチャンク損失", self.num_chunks),
                got: format!("{} 個", chunk_losses.len()),
            });
        }
        if self.num_chunks == 1 {
            return Ok(vec![1.0]);
        }

        let mut weights = Vec::with_capacity(self.num_chunks);
        let mut cumulative = 0.0f32;
        for (chunk, loss) in chunk_losses.iter().enumerate() {
            if !cumulative.is_finite() {
                return Err(PinnError::CausalWeight { chunk, cumulative });
            }
            weights.push((-self.tol * cumulative).exp());
            cumulative += loss;
        }
        Ok(weights)
    }

    /// 因果重み付きの残差損失 `sum_c(w_c * L_c) / n` を返します。
    pub fn weighted_loss(&self, chunk_losses: &[f32], weights: &[f32]) -> f32 {
        let total: f32 = chunk_losses
            .iter()
            .zip(weights)
            .map(|(loss, weight)| loss * weight)
            .sum();
        total / self.num_chunks as f32
    }
}
