use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};
use serde::{Deserialize, Serialize};

/// Activation between the two MLP projections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Exact GELU (ViT, DeiT).
    #[default]
    Gelu,
    /// `x * sigmoid(1.702 * x)` (CLIP).
    QuickGelu,
}

/// Two-layer feed-forward block used by ViT-style encoders.
#[derive(Debug, Clone)]
pub struct VitMlp {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl VitMlp {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let fc1 = candle_nn::linear(hidden_size, intermediate_size, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(intermediate_size, hidden_size, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            activation,
        })
    }
}

impl Module for VitMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?;
        let hidden = match self.activation {
            Activation::QuickGelu => quick_gelu(&hidden)?,
            Activation::Gelu => hidden.gelu_erf()?,
        };
        self.fc2.forward(&hidden)
    }
}

/// QuickGELU activation: x * sigmoid(1.702 * x)
pub fn quick_gelu(x: &Tensor) -> Result<Tensor> {
    let sigmoid_input = (x * 1.702)?;
    x.mul(&candle_nn::ops::sigmoid(&sigmoid_input)?)
}
