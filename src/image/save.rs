//! Conversion of output tensors back to encoded image bytes.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};

use crate::error::{Error, Result};

use super::{ImageTensor, MediaType, RGB_CHANNELS};

/// Encode a tensor as an image in the given format.
///
/// The tensor is:
/// 1. Stripped of its batch axis (batch size must be 1)
/// 2. Clamped to [0, 1] and scaled to 8 bits per channel
/// 3. Encoded as JPEG (with `quality`) or PNG
///
/// # Arguments
///
/// * `tensor` - NCHW tensor with shape (1, 3, H, W)
/// * `media_type` - Output format, normally the upload's sniffed type
/// * `quality` - JPEG quality (1-100), ignored for PNG
///
/// # Errors
///
/// Returns an error if the tensor has the wrong shape or encoding fails.
pub fn tensor_to_image(tensor: &ImageTensor, media_type: MediaType, quality: u8) -> Result<Vec<u8>> {
    let img = DynamicImage::ImageRgb8(tensor_to_rgb(tensor)?);
    let mut output = Vec::new();

    let encoded = match media_type {
        MediaType::Jpeg => {
            img.write_with_encoder(JpegEncoder::new_with_quality(&mut output, quality))
        }
        MediaType::Png => img.write_with_encoder(PngEncoder::new(&mut output)),
    };
    encoded.map_err(|source| Error::ImageEncode {
        format: media_type.name(),
        source,
    })?;

    Ok(output)
}

/// Convert a (1, 3, H, W) tensor to an RGB raster.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] for any other shape.
#[allow(clippy::cast_possible_truncation)]
pub fn tensor_to_rgb(tensor: &ImageTensor) -> Result<RgbImage> {
    let (batch, channels, height, width) = tensor.dim();
    if batch != 1 || channels != RGB_CHANNELS {
        return Err(Error::ShapeMismatch {
            expected: format!("[1, {RGB_CHANNELS}, H, W]"),
            actual: format!("{:?}", tensor.shape()),
        });
    }
    let (Ok(w), Ok(h)) = (u32::try_from(width), u32::try_from(height)) else {
        return Err(Error::ShapeMismatch {
            expected: "spatial size within u32".to_string(),
            actual: format!("{width}x{height}"),
        });
    };

    Ok(ImageBuffer::from_fn(w, h, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[0, 0, y, x]]),
            denormalize(tensor[[0, 1, y, x]]),
            denormalize(tensor[[0, 2, y, x]]),
        ])
    }))
}

/// Map a value from [0, 1] to [0, 255], clamping first and truncating
/// like `mul(255).byte()`.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    (value.clamp(0.0, 1.0) * 255.0) as u8
}
