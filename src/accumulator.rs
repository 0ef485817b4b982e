//! マイクロバッチの勾配を溜めてから平均して適用するための蓄積器。
//!
//! `grad_accum_steps` 個のマイクロバッチが溜まったときだけ `flush` で平均勾配を
//! 取り出します。学習が途中で終わったときに残っている勾配は適用せずに捨てます。
//! 設定より少ないサンプルから計算した勾配を適用すると実効バッチサイズが
//! 変わってしまうためです。

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::Tensor;
use burn::tensor::backend::AutodiffBackend;
use std::marker::PhantomData;

/// 勾配の蓄積バッファ。バッファは蓄積器だけが所有します。
pub struct GradientAccumulator<M> {
    buffer: GradientsParams,
    count: usize,
    steps: usize,
    _module: PhantomData<M>,
}

impl<M> GradientAccumulator<M> {
    /// `grad_accum_steps` が 0 または 1 なら毎ステップ適用します。
    pub fn new(grad_accum_steps: usize) -> Self {
        Self {
            buffer: GradientsParams::new(),
            count: 0,
            steps: grad_accum_steps.max(1),
            _module: PhantomData,
        }
    }

    /// 前回の flush 以降に溜めたマイクロバッチの数。
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn should_flush(&self) -> bool {
        self.count >= self.steps
    }

    /// 勾配をバッファに加えます。
    pub fn accumulate<B>(&mut self, module: &M, grads: GradientsParams)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let mut visitor = SumGrads::<B> {
            incoming: grads,
            buffer: &mut self.buffer,
            _backend: PhantomData,
        };
        module.visit(&mut visitor);
        self.count += 1;
    }

    /// 平均勾配 `buffer / count` を返し、バッファを空にします。空なら `None` です。
    pub fn flush<B>(&mut self, module: &M) -> Option<GradientsParams>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if self.count == 0 {
            return None;
        }
        let mut grads = std::mem::replace(&mut self.buffer, GradientsParams::new());
        if self.count > 1 {
            let mut visitor = ScaleGrads::<B> {
                grads: &mut grads,
                factor: 1.0 / self.count as f32,
                _backend: PhantomData,
            };
            module.visit(&mut visitor);
        }
        self.count = 0;
        Some(grads)
    }

    /// 未適用の勾配を捨て、捨てたマイクロバッチの数を返します。
    pub fn discard(&mut self) -> usize {
        let discarded = self.count;
        self.buffer = GradientsParams::new();
        self.count = 0;
        discarded
    }
}

struct SumGrads<'a, B> {
    incoming: GradientsParams,
    buffer: &'a mut GradientsParams,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SumGrads<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.incoming.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let sum = match self.buffer.remove::<B::InnerBackend, D>(id) {
            Some(previous) => previous.add(grad),
            None => grad,
        };
        self.buffer.register::<B::InnerBackend, D>(id, sum);
    }
}

struct ScaleGrads<'a, B> {
    grads: &'a mut GradientsParams,
    factor: f32,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleGrads<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.factor));
        }
    }
}
