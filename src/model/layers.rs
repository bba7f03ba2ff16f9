//! Inference-only building blocks operating on single (C, H, W) feature maps.
//!
//! Convolutions are computed as one matrix product per kernel tap, so the
//! weights are stored pre-split as `(out, in)` matrices.

use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView3, Axis};

use crate::error::{Error, Result};

/// Epsilon used by batch normalization.
pub const BATCH_NORM_EPS: f32 = 1e-5;

/// Stride-1 square convolution with "same" zero padding.
#[derive(Debug, Clone)]
pub struct Conv2d {
    taps: Vec<Array2<f32>>,
    bias: Option<Array1<f32>>,
    kernel_size: usize,
    in_channels: usize,
    out_channels: usize,
}

impl Conv2d {
    /// Build from a weight of shape (out, in, k, k) with odd `k`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the kernel is not square and odd or
    /// the bias length differs from the output channels.
    pub fn new(weight: &Array4<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        let (out_channels, in_channels, kh, kw) = weight.dim();
        if kh != kw || kh % 2 == 0 {
            return Err(Error::ShapeMismatch {
                expected: "odd square kernel".to_string(),
                actual: format!("{kh}x{kw}"),
            });
        }
        check_bias(bias.as_ref(), out_channels)?;

        let taps = (0..kh)
            .flat_map(|ky| (0..kw).map(move |kx| (ky, kx)))
            .map(|(ky, kx)| weight.slice(s![.., .., ky, kx]).to_owned())
            .collect();

        Ok(Self {
            taps,
            bias,
            kernel_size: kh,
            in_channels,
            out_channels,
        })
    }

    #[must_use]
    pub const fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Convolve a (C, H, W) feature map, keeping H and W.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if C differs from the layer's input channels.
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (channels, height, width) = input.dim();
        check_channels(channels, self.in_channels)?;

        let pad = self.kernel_size / 2;
        let mut padded = Array3::<f32>::zeros((channels, height + 2 * pad, width + 2 * pad));
        padded
            .slice_mut(s![.., pad..pad + height, pad..pad + width])
            .assign(input);

        let mut out = Array2::<f32>::zeros((self.out_channels, height * width));
        for (index, tap) in self.taps.iter().enumerate() {
            let (ky, kx) = (index / self.kernel_size, index % self.kernel_size);
            let window = padded.slice(s![.., ky..ky + height, kx..kx + width]);
            general_mat_mul(1.0, tap, &flatten(window), 1.0, &mut out);
        }

        if let Some(bias) = &self.bias {
            out += &bias.view().insert_axis(Axis(1));
        }

        Ok(unflatten(&out, height, width))
    }
}

/// 2x2, stride-2 transposed convolution: doubles H and W.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    taps: Vec<Array2<f32>>,
    bias: Array1<f32>,
    in_channels: usize,
    out_channels: usize,
}

impl ConvTranspose2d {
    /// Build from a weight of shape (in, out, 2, 2).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the kernel is not 2x2 or the bias
    /// length differs from the output channels.
    pub fn new(weight: &Array4<f32>, bias: Array1<f32>) -> Result<Self> {
        let (in_channels, out_channels, kh, kw) = weight.dim();
        if (kh, kw) != (2, 2) {
            return Err(Error::ShapeMismatch {
                expected: "2x2 kernel".to_string(),
                actual: format!("{kh}x{kw}"),
            });
        }
        check_bias(Some(&bias), out_channels)?;

        let taps = [(0_usize, 0_usize), (0, 1), (1, 0), (1, 1)]
            .into_iter()
            .map(|(a, b)| weight.slice(s![.., .., a, b]).t().to_owned())
            .collect();

        Ok(Self {
            taps,
            bias,
            in_channels,
            out_channels,
        })
    }

    /// Upsample a (C, H, W) feature map to (out, 2H, 2W).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if C differs from the layer's input channels.
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (channels, height, width) = input.dim();
        check_channels(channels, self.in_channels)?;

        let columns = flatten(input.view());
        let mut out = Array3::<f32>::zeros((self.out_channels, 2 * height, 2 * width));

        for (index, tap) in self.taps.iter().enumerate() {
            let (a, b) = (index / 2, index % 2);
            let product = unflatten(&tap.dot(&columns), height, width);
            out.slice_mut(s![.., a..;2, b..;2]).assign(&product);
        }

        for (mut plane, &bias) in out.outer_iter_mut().zip(self.bias.iter()) {
            plane += bias;
        }

        Ok(out)
    }
}

/// Batch normalization in inference mode, folded to a per-channel affine map.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl BatchNorm {
    /// Fold learned scale/shift and running statistics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the four vectors differ in length.
    pub fn new(
        weight: &Array1<f32>,
        bias: &Array1<f32>,
        running_mean: &Array1<f32>,
        running_var: &Array1<f32>,
    ) -> Result<Self> {
        let channels = weight.len();
        if [bias.len(), running_mean.len(), running_var.len()]
            .iter()
            .any(|&len| len != channels)
        {
            return Err(Error::ShapeMismatch {
                expected: format!("{channels} batch-norm channels"),
                actual: format!(
                    "bias {}, running_mean {}, running_var {}",
                    bias.len(),
                    running_mean.len(),
                    running_var.len()
                ),
            });
        }

        let scale = weight / &running_var.mapv(|var| (var + BATCH_NORM_EPS).sqrt());
        let shift = bias - &(running_mean * &scale);
        Ok(Self { scale, shift })
    }

    /// Normalize and apply ReLU in place.
    pub fn forward_relu(&self, x: &mut Array3<f32>) {
        for ((mut plane, &scale), &shift) in x
            .outer_iter_mut()
            .zip(self.scale.iter())
            .zip(self.shift.iter())
        {
            plane.mapv_inplace(|v| v.mul_add(scale, shift).max(0.0));
        }
    }
}

/// 2x2 max pooling with stride 2; odd trailing rows/columns are dropped.
#[must_use]
pub fn max_pool2(input: &Array3<f32>) -> Array3<f32> {
    let (channels, height, width) = input.dim();
    Array3::from_shape_fn((channels, height / 2, width / 2), |(c, y, x)| {
        let (y, x) = (2 * y, 2 * x);
        input[[c, y, x]]
            .max(input[[c, y, x + 1]])
            .max(input[[c, y + 1, x]])
            .max(input[[c, y + 1, x + 1]])
    })
}

/// Logistic sigmoid, applied in place.
pub fn sigmoid_inplace(x: &mut Array3<f32>) {
    x.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp()));
}

fn check_channels(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::ShapeMismatch {
            expected: format!("{expected} input channels"),
            actual: format!("{actual} channels"),
        });
    }
    Ok(())
}

fn check_bias(bias: Option<&Array1<f32>>, out_channels: usize) -> Result<()> {
    match bias {
        Some(bias) if bias.len() != out_channels => Err(Error::ShapeMismatch {
            expected: format!("bias of length {out_channels}"),
            actual: format!("length {}", bias.len()),
        }),
        _ => Ok(()),
    }
}

/// Copy a (C, H, W) view into a (C, H*W) matrix.
fn flatten(view: ArrayView3<'_, f32>) -> Array2<f32> {
    let (channels, height, width) = view.dim();
    let mut flat = Array2::<f32>::zeros((channels, height * width));
    for (mut row, plane) in flat.outer_iter_mut().zip(view.outer_iter()) {
        row.iter_mut().zip(plane.iter()).for_each(|(dst, &src)| *dst = src);
    }
    flat
}

/// Inverse of [`flatten`].
fn unflatten(flat: &Array2<f32>, height: usize, width: usize) -> Array3<f32> {
    Array3::from_shape_fn((flat.nrows(), height, width), |(c, y, x)| {
        flat[[c, y * width + x]]
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array};

    use super::*;

    #[test]
    fn test_identity_conv3x3() {
        let mut weight = Array4::<f32>::zeros((1, 1, 3, 3));
        weight[[0, 0, 1, 1]] = 1.0;
        let conv = Conv2d::new(&weight, None).unwrap();

        let input = Array::from_shape_fn((1, 4, 5), |(_, y, x)| (y * 5 + x) as f32);
        let output = conv.forward(&input).unwrap();

        assert_eq!(output, input);
    }

    #[test]
    fn test_conv3x3_zero_padding() {
        let weight = Array4::<f32>::ones((1, 1, 3, 3));
        let conv = Conv2d::new(&weight, Some(arr1(&[0.5]))).unwrap();

        let input = Array3::<f32>::ones((1, 3, 3));
        let output = conv.forward(&input).unwrap();

        // Corners see 4 pixels, edges 6, centre 9.
        assert_abs_diff_eq!(output[[0, 0, 0]], 4.5);
        assert_abs_diff_eq!(output[[0, 0, 1]], 6.5);
        assert_abs_diff_eq!(output[[0, 1, 1]], 9.5);
    }

    #[test]
    fn test_conv_sums_input_channels() {
        // out[0] = in[0] - in[1]; out[1] = 2 * in[1]
        let mut weight = Array4::<f32>::zeros((2, 2, 1, 1));
        weight[[0, 0, 0, 0]] = 1.0;
        weight[[0, 1, 0, 0]] = -1.0;
        weight[[1, 1, 0, 0]] = 2.0;
        let conv = Conv2d::new(&weight, None).unwrap();

        let mut input = Array3::<f32>::zeros((2, 2, 2));
        input.slice_mut(s![0, .., ..]).fill(3.0);
        input.slice_mut(s![1, .., ..]).fill(1.0);
        let output = conv.forward(&input).unwrap();

        assert_abs_diff_eq!(output[[0, 1, 1]], 2.0);
        assert_abs_diff_eq!(output[[1, 0, 0]], 2.0);
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let conv = Conv2d::new(&Array4::<f32>::zeros((4, 3, 3, 3)), None).unwrap();
        assert!(matches!(
            conv.forward(&Array3::<f32>::zeros((2, 4, 4))),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_conv_rejects_even_kernel() {
        assert!(Conv2d::new(&Array4::<f32>::zeros((1, 1, 2, 2)), None).is_err());
    }

    #[test]
    fn test_transposed_conv_scatters_taps() {
        let mut weight = Array4::<f32>::zeros((1, 1, 2, 2));
        weight[[0, 0, 0, 0]] = 1.0;
        weight[[0, 0, 0, 1]] = 2.0;
        weight[[0, 0, 1, 0]] = 3.0;
        weight[[0, 0, 1, 1]] = 4.0;
        let up = ConvTranspose2d::new(&weight, arr1(&[0.0])).unwrap();

        let input = Array::from_shape_vec((1, 1, 2), vec![1.0, 10.0]).unwrap();
        let output = up.forward(&input).unwrap();

        assert_eq!(output.dim(), (1, 2, 4));
        let expected = [[1.0, 2.0, 10.0, 20.0], [3.0, 4.0, 30.0, 40.0]];
        for (y, row) in expected.iter().enumerate() {
            for (x, &value) in row.iter().enumerate() {
                assert_abs_diff_eq!(output[[0, y, x]], value);
            }
        }
    }

    #[test]
    fn test_transposed_conv_projects_channels() {
        // weight[in, out, ..]: out[0] = in[0] + in[1], out[1] = in[1]
        let mut weight = Array4::<f32>::zeros((2, 2, 2, 2));
        weight.slice_mut(s![0, 0, .., ..]).fill(1.0);
        weight.slice_mut(s![1, 0, .., ..]).fill(1.0);
        weight.slice_mut(s![1, 1, .., ..]).fill(1.0);
        let up = ConvTranspose2d::new(&weight, arr1(&[0.5, -0.5])).unwrap();

        let mut input = Array3::<f32>::zeros((2, 1, 1));
        input[[0, 0, 0]] = 2.0;
        input[[1, 0, 0]] = 3.0;
        let output = up.forward(&input).unwrap();

        assert_eq!(output.dim(), (2, 2, 2));
        assert!(output.slice(s![0, .., ..]).iter().all(|&v| (v - 5.5).abs() < 1e-6));
        assert!(output.slice(s![1, .., ..]).iter().all(|&v| (v - 2.5).abs() < 1e-6));
    }

    #[test]
    fn test_batch_norm_relu() {
        let norm = BatchNorm::new(
            &arr1(&[2.0, 1.0]),
            &arr1(&[1.0, 0.0]),
            &arr1(&[1.0, 0.0]),
            &arr1(&[4.0 - BATCH_NORM_EPS, 1.0 - BATCH_NORM_EPS]),
        )
        .unwrap();

        let mut x = Array3::<f32>::zeros((2, 1, 2));
        x[[0, 0, 0]] = 3.0;
        x[[0, 0, 1]] = -5.0;
        x[[1, 0, 0]] = -1.0;
        x[[1, 0, 1]] = 0.25;
        norm.forward_relu(&mut x);

        // (3 - 1) / 2 * 2 + 1 = 3; negative results clamp to 0
        assert_abs_diff_eq!(x[[0, 0, 0]], 3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(x[[0, 0, 1]], 0.0);
        assert_abs_diff_eq!(x[[1, 0, 0]], 0.0);
        assert_abs_diff_eq!(x[[1, 0, 1]], 0.25, epsilon = 1e-5);
    }

    #[test]
    fn test_batch_norm_length_mismatch() {
        let one = arr1(&[1.0]);
        let two = arr1(&[1.0, 1.0]);
        assert!(BatchNorm::new(&one, &two, &one, &one).is_err());
    }

    #[test]
    fn test_max_pool2() {
        let input = Array::from_shape_fn((1, 4, 4), |(_, y, x)| (y * 4 + x) as f32);
        let output = max_pool2(&input);

        assert_eq!(output.dim(), (1, 2, 2));
        assert_abs_diff_eq!(output[[0, 0, 0]], 5.0);
        assert_abs_diff_eq!(output[[0, 1, 1]], 15.0);
    }

    #[test]
    fn test_sigmoid_bounds() {
        let mut x = Array::from_shape_vec((1, 1, 3), vec![-1000.0, 0.0, 1000.0]).unwrap();
        sigmoid_inplace(&mut x);

        assert_abs_diff_eq!(x[[0, 0, 0]], 0.0);
        assert_abs_diff_eq!(x[[0, 0, 1]], 0.5);
        assert_abs_diff_eq!(x[[0, 0, 2]], 1.0);
    }
}
