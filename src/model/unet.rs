//! U-shaped enhancement network.
//!
//! Architecture:
//! - 4 encoder stages (64 -> 128 -> 256 -> 512 channels), each a double
//!   3x3 conv + batch norm + ReLU block whose output is kept as a skip
//!   connection, followed by 2x2 max pooling
//! - Bottleneck double-conv block at 1024 channels
//! - 4 decoder stages: 2x2 stride-2 transposed conv, concatenation with the
//!   matching skip, then a double-conv block (512 -> 256 -> 128 -> 64)
//! - 1x1 conv head to 3 channels and a sigmoid, so outputs lie in [0, 1]

use ndarray::{concatenate, stack, Array1, Array3, Array4, ArrayD, Axis, Ix1, Ix4};

use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::init::{KaimingInit, ParamKind, ParameterSource};
use super::layers::{max_pool2, sigmoid_inplace, BatchNorm, Conv2d, ConvTranspose2d};

/// Number of pooling stages.
pub const DEPTH: usize = 4;

/// Spatial sizes must be multiples of this so every pooling stage divides evenly.
pub const SPATIAL_MULTIPLE: usize = 1 << DEPTH;

/// Channel layout of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Width of the first encoder stage; each stage doubles it.
    pub base_channels: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            base_channels: 64,
        }
    }
}

impl NetworkConfig {
    /// Width of encoder stage `level` (0-based); `DEPTH` gives the bottleneck.
    #[must_use]
    pub const fn width(&self, level: usize) -> usize {
        self.base_channels << level
    }
}

/// Two 3x3 conv + batch norm + ReLU layers.
#[derive(Debug, Clone)]
struct ConvBlock {
    first: Conv2d,
    first_norm: BatchNorm,
    second: Conv2d,
    second_norm: BatchNorm,
}

impl ConvBlock {
    /// Load from `{prefix}.0` (conv), `.1` (norm), `.3` (conv), `.4` (norm).
    fn build(
        source: &mut dyn ParameterSource,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
    ) -> Result<Self> {
        let first = conv3x3(source, &format!("{prefix}.0"), in_channels, out_channels)?;
        let first_norm = batch_norm(source, &format!("{prefix}.1"), out_channels)?;
        let second = conv3x3(source, &format!("{prefix}.3"), out_channels, out_channels)?;
        let second_norm = batch_norm(source, &format!("{prefix}.4"), out_channels)?;

        Ok(Self {
            first,
            first_norm,
            second,
            second_norm,
        })
    }

    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let mut x = self.first.forward(x)?;
        self.first_norm.forward_relu(&mut x);
        let mut x = self.second.forward(&x)?;
        self.second_norm.forward_relu(&mut x);
        Ok(x)
    }
}

#[derive(Debug, Clone)]
struct DecoderStage {
    up: ConvTranspose2d,
    block: ConvBlock,
}

/// The enhancement network with immutable, inference-only weights.
#[derive(Debug, Clone)]
pub struct EnhancementNetwork {
    config: NetworkConfig,
    encoders: Vec<ConvBlock>,
    bottleneck: ConvBlock,
    decoders: Vec<DecoderStage>,
    head: Conv2d,
}

impl EnhancementNetwork {
    /// Assemble the network, pulling every parameter from `source`.
    ///
    /// Parameters are requested in state-dict order: `enc1`..`enc4`,
    /// `bottleneck`, `dec4`..`dec1`, `out_conv`.
    ///
    /// # Errors
    ///
    /// Returns the source's error for any missing or malformed parameter.
    pub fn build(config: NetworkConfig, source: &mut dyn ParameterSource) -> Result<Self> {
        let mut encoders = Vec::with_capacity(DEPTH);
        let mut in_channels = config.in_channels;
        for level in 0..DEPTH {
            let width = config.width(level);
            let prefix = format!("enc{}.conv.conv", level + 1);
            encoders.push(ConvBlock::build(source, &prefix, in_channels, width)?);
            in_channels = width;
        }

        let bottleneck = ConvBlock::build(
            source,
            "bottleneck.conv",
            config.width(DEPTH - 1),
            config.width(DEPTH),
        )?;

        let mut decoders = Vec::with_capacity(DEPTH);
        for level in (0..DEPTH).rev() {
            let width = config.width(level);
            let up_in = config.width(level + 1);
            let name = format!("dec{}", level + 1);

            let weight = fetch4(source, &format!("{name}.up.weight"), [up_in, width, 2, 2])?;
            let bias = fetch1(
                source,
                &format!("{name}.up.bias"),
                ParamKind::ConvBias { fan_in: width * 4 },
                width,
            )?;
            let up = ConvTranspose2d::new(&weight, bias)?;
            let block = ConvBlock::build(source, &format!("{name}.conv.conv"), 2 * width, width)?;
            decoders.push(DecoderStage { up, block });
        }

        let base = config.width(0);
        let weight = fetch4(source, "out_conv.weight", [config.out_channels, base, 1, 1])?;
        let bias = fetch1(
            source,
            "out_conv.bias",
            ParamKind::ConvBias { fan_in: base },
            config.out_channels,
        )?;
        let head = Conv2d::new(&weight, Some(bias))?;

        Ok(Self {
            config,
            encoders,
            bottleneck,
            decoders,
            head,
        })
    }

    /// Freshly initialized network; `seed` makes it reproducible.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub fn initialized(config: NetworkConfig, seed: Option<u64>) -> Result<Self> {
        let mut init = seed.map_or_else(KaimingInit::from_os_rng, KaimingInit::seeded);
        Self::build(config, &mut init)
    }

    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Run the network on an (N, C, H, W) tensor.
    ///
    /// H and W must be positive multiples of [`SPATIAL_MULTIPLE`]. The output
    /// has the same N, H, W and `out_channels` channels, every value in [0, 1].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] for an unsupported input shape and
    /// [`Error::InferenceFailure`] if the output is not finite.
    pub fn forward(&self, input: &ImageTensor) -> Result<ImageTensor> {
        let (batch, channels, height, width) = input.dim();
        let spatial_ok = |side: usize| side > 0 && side % SPATIAL_MULTIPLE == 0;
        if batch == 0
            || channels != self.config.in_channels
            || !spatial_ok(height)
            || !spatial_ok(width)
        {
            return Err(Error::ShapeMismatch {
                expected: format!(
                    "[N>=1, {}, H, W] with H and W multiples of {SPATIAL_MULTIPLE}",
                    self.config.in_channels
                ),
                actual: format!("{:?}", input.shape()),
            });
        }

        let outputs = input
            .outer_iter()
            .map(|sample| self.forward_sample(sample.to_owned()))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = outputs.iter().map(Array3::view).collect();
        let output = stack(Axis(0), &views).map_err(|err| Error::InferenceFailure {
            reason: format!("cannot assemble batch: {err}"),
        })?;

        if output.iter().any(|v| !v.is_finite()) {
            return Err(Error::InferenceFailure {
                reason: "numeric instability: output contains non-finite values".to_string(),
            });
        }

        Ok(output)
    }

    fn forward_sample(&self, mut x: Array3<f32>) -> Result<Array3<f32>> {
        let mut skips = Vec::with_capacity(DEPTH);
        for encoder in &self.encoders {
            let skip = encoder.forward(&x)?;
            x = max_pool2(&skip);
            skips.push(skip);
        }

        x = self.bottleneck.forward(&x)?;

        for (decoder, skip) in self.decoders.iter().zip(skips.iter().rev()) {
            let up = decoder.up.forward(&x)?;
            let merged = concatenate(Axis(0), &[up.view(), skip.view()]).map_err(|err| {
                Error::ShapeMismatch {
                    expected: format!("skip matching {:?}", up.shape()),
                    actual: err.to_string(),
                }
            })?;
            x = decoder.block.forward(&merged)?;
        }

        let mut out = self.head.forward(&x)?;
        sigmoid_inplace(&mut out);
        Ok(out)
    }
}

fn conv3x3(
    source: &mut dyn ParameterSource,
    prefix: &str,
    in_channels: usize,
    out_channels: usize,
) -> Result<Conv2d> {
    let weight = fetch4(
        source,
        &format!("{prefix}.weight"),
        [out_channels, in_channels, 3, 3],
    )?;
    Conv2d::new(&weight, None)
}

fn batch_norm(source: &mut dyn ParameterSource, prefix: &str, channels: usize) -> Result<BatchNorm> {
    let weight = fetch1(source, &format!("{prefix}.weight"), ParamKind::NormWeight, channels)?;
    let bias = fetch1(source, &format!("{prefix}.bias"), ParamKind::NormBias, channels)?;
    let mean = fetch1(
        source,
        &format!("{prefix}.running_mean"),
        ParamKind::RunningMean,
        channels,
    )?;
    let var = fetch1(
        source,
        &format!("{prefix}.running_var"),
        ParamKind::RunningVar,
        channels,
    )?;
    BatchNorm::new(&weight, &bias, &mean, &var)
}

fn fetch4(source: &mut dyn ParameterSource, name: &str, shape: [usize; 4]) -> Result<Array4<f32>> {
    let tensor = source.fetch(name, ParamKind::ConvWeight, &shape)?;
    into_dim::<Ix4>(name, tensor)
}

fn fetch1(
    source: &mut dyn ParameterSource,
    name: &str,
    kind: ParamKind,
    len: usize,
) -> Result<Array1<f32>> {
    let tensor = source.fetch(name, kind, &[len])?;
    into_dim::<Ix1>(name, tensor)
}

fn into_dim<D: ndarray::Dimension>(name: &str, tensor: ArrayD<f32>) -> Result<ndarray::Array<f32, D>> {
    let actual = format!("{:?}", tensor.shape());
    tensor
        .into_dimensionality::<D>()
        .map_err(|_| Error::ShapeMismatch {
            expected: format!("{name} with {} dimensions", D::NDIM.unwrap_or_default()),
            actual,
        })
}
