use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

/// RMSNorm layer.
///
/// Besides the plain [`Module`] forward it offers [`RmsNorm::forward_residual`],
/// which folds the running residual into the input before normalizing.
#[derive(Clone, Debug)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// `(rms(x + residual), x + residual)`, or `(rms(x), x)` without residual.
    pub fn forward_residual(
        &self,
        xs: &Tensor,
        residual: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let summed = match residual {
            Some(r) => (xs + r)?,
            None => xs.clone(),
        };
        let normed = self.forward(&summed)?;
        Ok((normed, summed))
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::rms_norm(&xs.contiguous()?, &self.weight, self.eps as f32)
    }
}

/// Create an RMSNorm layer, loading the weight from a VarBuilder.
pub fn rms_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<RmsNorm> {
    let weight = vb.get(size, "weight")?;
    Ok(RmsNorm::new(weight, eps))
}
