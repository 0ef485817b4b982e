use crate::config::ModelConfig;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Tanh};
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// PINNの本体となるニューラルネットワークモデル。
///
/// 座標(t, x)を入力とし、その点における物理量uを予測する多層パーセプトロン（MLP）です。
/// 層の数と幅は [`ModelConfig`] で決まります。
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
    activation: Tanh,
}

impl ModelConfig {
    /// 設定からモデルを初期化します。
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let mut hidden = Vec::with_capacity(self.num_layers.saturating_sub(1));
        let mut fan_in = self.input_dim;
        for _ in 1..self.num_layers.max(2) {
            hidden.push(LinearConfig::new(fan_in, self.hidden_dim).init(device));
            fan_in = self.hidden_dim;
        }
        Model {
            hidden,
            output: LinearConfig::new(fan_in, self.output_dim).init(device),
            activation: Tanh::new(),
        }
    }
}

impl<B: Backend> Model<B> {
    /// モデルの順伝播を実行します。
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self
            .hidden
            .iter()
            .fold(input, |x, linear| self.activation.forward(linear.forward(x)));
        self.output.forward(x)
    }
}
