/// Linear layers with non-default parametrizations
use candle_core::{Result, Tensor, Var};
use candle_nn::{Init, Linear, VarBuilder};

use crate::utils::misc::{l2_normalize, trunc_normal_, TruncNormal};

/// Linear layer with truncated-normal weights (std 0.02) and zero bias
pub fn trunc_normal_linear(
    in_features: usize,
    out_features: usize,
    bias: bool,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints((out_features, in_features), "weight", Init::Const(0.))?;
    // the builder hands back the variable itself, so writing through it initializes the parameter
    trunc_normal_(&Var::from_tensor(&weight)?, &TruncNormal::with_std(0.02))?;

    let bias = if bias {
        Some(vb.get_with_hints(out_features, "bias", Init::Const(0.))?)
    } else {
        None
    };

    Ok(Linear::new(weight, bias))
}

/// Weight-normalized linear layer without bias
///
/// The effective weight is `g * v / ||v||` with row norms. With a fixed norm
/// `g` is 1 and only the direction `v` is learned.
pub struct WeightNormLinear {
    weight_v: Tensor,
    weight_g: Option<Tensor>,
}

impl WeightNormLinear {
    /// # Arguments
    /// * `fixed_norm` - Keep `g` at 1 instead of learning it
    pub fn new(in_features: usize, out_features: usize, fixed_norm: bool, vb: VarBuilder) -> Result<Self> {
        let weight_v = vb.get_with_hints(
            (out_features, in_features),
            "weight_v",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let weight_g = if fixed_norm {
            None
        } else {
            Some(vb.get_with_hints((out_features, 1), "weight_g", Init::Const(1.))?)
        };

        Ok(Self { weight_v, weight_g })
    }

    pub fn weight(&self) -> Result<Tensor> {
        let direction = l2_normalize(&self.weight_v)?;
        match &self.weight_g {
            Some(g) => direction.broadcast_mul(g),
            None => Ok(direction),
        }
    }

    /// # Arguments
    /// * `frozen` - Block gradients into the layer
    pub fn forward(&self, x: &Tensor, frozen: bool) -> Result<Tensor> {
        let weight = if frozen { self.weight()?.detach() } else { self.weight()? };
        x.matmul(&weight.t()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Module};
    use candle_nn::VarMap;

    #[test]
    fn test_trunc_normal_linear_init() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let layer = trunc_normal_linear(64, 32, true, vb.pp("fc"))?;

        // std 0.02 truncated at +-2
        let weight = varmap.data().lock().unwrap()["fc.weight"].as_tensor().clone();
        let max = weight.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max > 0.0 && max <= 2.0);
        let std = weight.sqr()?.mean_all()?.sqrt()?.to_scalar::<f32>()?;
        assert!((std - 0.02).abs() < 0.005, "std {std}");

        let out = layer.forward(&Tensor::ones((2, 64), DType::F32, &device)?)?;
        assert_eq!(out.dims(), &[2, 32]);

        Ok(())
    }

    #[test]
    fn test_weight_norm_rows_unit() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let layer = WeightNormLinear::new(8, 5, true, vb)?;
        let norms = layer.weight()?.sqr()?.sum(1)?.to_vec1::<f32>()?;
        for n in norms {
            assert!((n - 1.0).abs() < 1e-5);
        }

        Ok(())
    }

    #[test]
    fn test_frozen_forward_blocks_gradient() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = WeightNormLinear::new(4, 3, false, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 4), &device)?;

        let weight_v = varmap.data().lock().unwrap()["weight_v"].clone();

        let grads = layer.forward(&x, true)?.sum_all()?.backward()?;
        assert!(grads.get(&weight_v).is_none());

        let grads = layer.forward(&x, false)?.sum_all()?.backward()?;
        assert!(grads.get(&weight_v).is_some());

        Ok(())
    }
}
