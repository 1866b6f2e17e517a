/// Weight initialization and small tensor helpers
use candle_core::{DType, Device, Result, Shape, Tensor, Var, D};
use candle_nn::VarMap;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Rejection attempts per element before falling back to clamping
const MAX_REJECTIONS: usize = 1000;

/// Parameters of a normal distribution truncated to `[a, b]`
#[derive(Debug, Clone, Copy)]
pub struct TruncNormal {
    pub mean: f64,
    pub std: f64,
    /// Lower cutoff
    pub a: f64,
    /// Upper cutoff
    pub b: f64,
}

impl Default for TruncNormal {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std: 1.0,
            a: -2.0,
            b: 2.0,
        }
    }
}

impl TruncNormal {
    pub fn with_std(std: f64) -> Self {
        Self {
            std,
            ..Default::default()
        }
    }
}

/// Sample a tensor from a truncated normal distribution
///
/// Values are drawn from N(mean, std) and redrawn until they land in `[a, b]`.
/// When the mean sits more than two standard deviations outside the interval
/// the distribution of the result can be inaccurate, which is logged.
pub fn trunc_normal<S: Into<Shape>>(
    shape: S,
    params: &TruncNormal,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    if params.a > params.b {
        candle_core::bail!("trunc_normal: a ({}) must be <= b ({})", params.a, params.b);
    }
    if params.mean < params.a - 2.0 * params.std || params.mean > params.b + 2.0 * params.std {
        log::warn!(
            "mean {} is more than 2 std from [{}, {}] in trunc_normal, the distribution of values may be incorrect",
            params.mean,
            params.a,
            params.b
        );
    }

    let normal = Normal::new(params.mean, params.std)
        .map_err(|e| candle_core::Error::Msg(format!("invalid normal distribution: {e}")))?;
    let mut rng = rand::thread_rng();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| sample_truncated(&normal, &mut rng, params.a, params.b))
        .collect();

    Tensor::from_vec(values, shape, device)
}

fn sample_truncated<R: Rng + ?Sized>(normal: &Normal<f64>, rng: &mut R, a: f64, b: f64) -> f32 {
    for _ in 0..MAX_REJECTIONS {
        let v = normal.sample(rng);
        if (a..=b).contains(&v) {
            return v as f32;
        }
    }
    normal.sample(rng).clamp(a, b) as f32
}

/// Fill a variable in place with truncated normal values
pub fn trunc_normal_(var: &Var, params: &TruncNormal) -> Result<()> {
    let values = trunc_normal(var.shape(), params, var.device())?.to_dtype(var.dtype())?;
    var.set(&values)
}

/// Register an explicitly created parameter in a `VarMap`
///
/// Used for parameters that need to be mutated outside of the optimizer
/// (e.g. prototype normalization).
pub fn register_var(varmap: &VarMap, name: &str, init: &Tensor) -> Result<Var> {
    let var = Var::from_tensor(init)?;
    let mut data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;
    data.insert(name.to_string(), var.clone());
    Ok(var)
}

/// L2-normalize rows along the last dimension
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    x.broadcast_div(&norm)
}

/// Cosine similarity between matching rows of `a` and `b`
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    (l2_normalize(a)? * l2_normalize(b)?)?.sum(D::Minus1)
}

/// Identity matrix
pub fn eye(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)
}

/// Mask that is 1 off the diagonal and 0 on it
pub fn off_diagonal_mask(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    eye(n, dtype, device)?.affine(-1.0, 1.0)
}

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}

/// L2 norm of a tensor as an f64
pub fn l2_norm(t: &Tensor) -> Result<f64> {
    t.to_dtype(DType::F64)?.sqr()?.sum_all()?.sqrt()?.to_scalar::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trunc_normal_bounds() -> Result<()> {
        let device = Device::Cpu;
        let params = TruncNormal {
            mean: 0.0,
            std: 1.0,
            a: -0.5,
            b: 0.5,
        };
        let t = trunc_normal((64, 32), &params, &device)?;
        assert_eq!(t.dims(), &[64, 32]);

        let min = t.min_all()?.to_scalar::<f32>()?;
        let max = t.max_all()?.to_scalar::<f32>()?;
        assert!(min >= -0.5 && max <= 0.5, "range [{min}, {max}]");

        Ok(())
    }

    #[test]
    fn test_trunc_normal_far_mean_clamps() -> Result<()> {
        let device = Device::Cpu;
        let params = TruncNormal {
            mean: 10.0,
            std: 1.0,
            a: -1.0,
            b: 1.0,
        };
        // rejection sampling gives up and clamps to the nearest bound
        let t = trunc_normal(256, &params, &device)?;
        let min = t.min_all()?.to_scalar::<f32>()?;
        let max = t.max_all()?.to_scalar::<f32>()?;
        assert!(min >= -1.0 && max <= 1.0, "range [{min}, {max}]");
        assert_eq!(max, 1.0);

        Ok(())
    }

    #[test]
    fn test_trunc_normal_std() -> Result<()> {
        let device = Device::Cpu;
        let t = trunc_normal(10_000, &TruncNormal::with_std(0.02), &device)?;

        // with cutoffs at +-2 the small std makes truncation irrelevant
        let std = t.sqr()?.mean_all()?.sqrt()?.to_scalar::<f32>()?;
        assert!((std - 0.02).abs() < 0.002, "std {std}");

        Ok(())
    }

    #[test]
    fn test_trunc_normal_rejects_inverted_bounds() {
        let params = TruncNormal {
            a: 1.0,
            b: -1.0,
            ..Default::default()
        };
        assert!(trunc_normal(4, &params, &Device::Cpu).is_err());
    }

    #[test]
    fn test_trunc_normal_var() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::zeros((8, 8), DType::F32, &device)?;
        trunc_normal_(&var, &TruncNormal::default())?;

        let abs_sum = var.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(abs_sum > 0.0);

        Ok(())
    }

    #[test]
    fn test_l2_normalize() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[3.0f32, 4.0], [0.0, 2.0]], &device)?;
        let n = l2_normalize(&x)?.to_vec2::<f32>()?;

        assert!((n[0][0] - 0.6).abs() < 1e-6);
        assert!((n[0][1] - 0.8).abs() < 1e-6);
        assert!((n[1][1] - 1.0).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_register_var() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let init = Tensor::ones((2, 3), DType::F32, &device)?;
        register_var(&varmap, "head.weight", &init)?;

        assert_eq!(varmap.all_vars().len(), 1);

        Ok(())
    }
}
