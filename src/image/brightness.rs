//! Mean-brightness diagnostics for low-light detection.

use ndarray::{ArrayBase, Data, Dimension};
use serde::Serialize;

/// Mean brightness below which an image counts as low-light.
pub const LOW_LIGHT_THRESHOLD: f64 = 0.3;

/// Brightness of an image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BrightnessReport {
    /// Mean of all values, in [0, 1].
    pub brightness: f64,
    /// `brightness < threshold`.
    pub is_low_light: bool,
}

/// Analyze a tensor with the default [`LOW_LIGHT_THRESHOLD`].
#[must_use]
pub fn brightness<S, D>(tensor: &ArrayBase<S, D>) -> BrightnessReport
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    analyze_brightness(tensor, LOW_LIGHT_THRESHOLD)
}

/// Mean of every element (batch, channels, and pixels) and its low-light flag.
///
/// The mean is accumulated in `f64`. An empty tensor reports 0.0.
#[must_use]
pub fn analyze_brightness<S, D>(tensor: &ArrayBase<S, D>, threshold: f64) -> BrightnessReport
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let sum: f64 = tensor.iter().map(|&v| f64::from(v)).sum();
    #[allow(clippy::cast_precision_loss)]
    let brightness = if tensor.is_empty() {
        0.0
    } else {
        sum / tensor.len() as f64
    };

    BrightnessReport {
        brightness,
        is_low_light: brightness < threshold,
    }
}
