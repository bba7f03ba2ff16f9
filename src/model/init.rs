//! Parameter sources: where network tensors come from when it is built.

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::error::{Error, Result};

/// Role of a parameter, used by initializers to pick a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Convolution or transposed-convolution kernel.
    ConvWeight,
    /// Convolution bias; `fan_in` of the matching kernel.
    ConvBias { fan_in: usize },
    /// Batch-norm scale (gamma).
    NormWeight,
    /// Batch-norm shift (beta).
    NormBias,
    /// Batch-norm running mean.
    RunningMean,
    /// Batch-norm running variance.
    RunningVar,
}

/// Supplies named tensors while a network is assembled.
pub trait ParameterSource {
    /// Produce the tensor called `name` with exactly `shape`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is missing or malformed.
    fn fetch(&mut self, name: &str, kind: ParamKind, shape: &[usize]) -> Result<ArrayD<f32>>;
}

/// Fresh parameters: fan-out scaled normal kernels for ReLU networks,
/// identity batch norm, and uniform biases.
pub struct KaimingInit {
    rng: StdRng,
}

impl KaimingInit {
    /// Deterministic initializer.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Initializer seeded from the operating system.
    #[must_use]
    pub fn from_os_rng() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }
}

impl ParameterSource for KaimingInit {
    #[allow(clippy::cast_precision_loss)]
    fn fetch(&mut self, name: &str, kind: ParamKind, shape: &[usize]) -> Result<ArrayD<f32>> {
        let dim = IxDyn(shape);
        let tensor = match kind {
            ParamKind::ConvWeight => {
                // PyTorch treats dim 0 as fan-out for both conv and transposed conv
                let receptive: usize = shape.iter().skip(2).product();
                let fan_out = shape.first().copied().unwrap_or(1) * receptive;
                let std = (2.0 / fan_out.max(1) as f32).sqrt();
                let normal = Normal::new(0.0, std).map_err(|err| Error::InvalidParameter {
                    name: name.to_string(),
                    reason: err.to_string(),
                })?;
                ArrayD::from_shape_simple_fn(dim, || normal.sample(&mut self.rng))
            }
            ParamKind::ConvBias { fan_in } => {
                let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
                let uniform =
                    Uniform::new_inclusive(-bound, bound).map_err(|err| Error::InvalidParameter {
                        name: name.to_string(),
                        reason: err.to_string(),
                    })?;
                ArrayD::from_shape_simple_fn(dim, || uniform.sample(&mut self.rng))
            }
            ParamKind::NormWeight | ParamKind::RunningVar => ArrayD::ones(dim),
            ParamKind::NormBias | ParamKind::RunningMean => ArrayD::zeros(dim),
        };
        Ok(tensor)
    }
}

/// Wraps another source and keeps a copy of every tensor it hands out,
/// in fetch order, so the parameters can be exported afterwards.
pub struct Recorder<S> {
    inner: S,
    recorded: Vec<(String, ArrayD<f32>)>,
}

impl<S: ParameterSource> Recorder<S> {
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            recorded: Vec::new(),
        }
    }

    /// Named tensors in the order they were fetched.
    #[must_use]
    pub fn into_parameters(self) -> Vec<(String, ArrayD<f32>)> {
        self.recorded
    }
}

impl<S: ParameterSource> ParameterSource for Recorder<S> {
    fn fetch(&mut self, name: &str, kind: ParamKind, shape: &[usize]) -> Result<ArrayD<f32>> {
        let tensor = self.inner.fetch(name, kind, shape)?;
        self.recorded.push((name.to_string(), tensor.clone()));
        Ok(tensor)
    }
}
