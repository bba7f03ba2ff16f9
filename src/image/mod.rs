//! Image validation, preprocessing, postprocessing, and brightness analysis.

mod brightness;
mod load;
mod save;
mod validate;

pub use brightness::{analyze_brightness, brightness, BrightnessReport, LOW_LIGHT_THRESHOLD};
pub use load::{decode_and_resize, image_to_tensor};
pub use save::{tensor_to_image, tensor_to_rgb};
pub use validate::{
    check_declared_type, check_dimensions, check_size, read_dimensions, read_limited,
    sniff_media_type, validate, SizeGuard, ValidatedImage, ValidationLimits, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_DIMENSION, DEFAULT_MAX_FILE_SIZE,
};

use ndarray::Array4;
use serde::Serialize;

/// Image tensor in NCHW format (batch, channels, height, width).
/// Values are normalized to [0, 1].
pub type ImageTensor = Array4<f32>;

/// Default square input resolution of the enhancement network.
pub const DEFAULT_INPUT_SIZE: u32 = 256;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;

/// Image types accepted by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Jpeg,
    Png,
}

impl MediaType {
    /// Every accepted type, in allow-list order.
    pub const ALLOWED: [Self; 2] = [Self::Jpeg, Self::Png];

    /// MIME type string, e.g. `image/png`.
    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// Short format name reported to callers (`jpeg` or `png`).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }

    /// Parse a MIME type, ignoring parameters and case.
    #[must_use]
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        Self::ALLOWED
            .into_iter()
            .find(|media| media.mime().eq_ignore_ascii_case(essence))
    }

    /// Map a decoder format onto the allow-list.
    #[must_use]
    pub const fn from_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::Png => Some(Self::Png),
            _ => None,
        }
    }

    /// The decoder format for this type.
    #[must_use]
    pub const fn format(self) -> image::ImageFormat {
        match self {
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Png => image::ImageFormat::Png,
        }
    }
}
