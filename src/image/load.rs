//! Image decoding and conversion to the network's input tensor.

use std::io::Cursor;

use image::{imageops::FilterType, DynamicImage, ImageReader, Limits};
use ndarray::Array4;

use crate::error::{Error, Result};

use super::validate::{check_dimensions, read_dimensions, sniff_media_type};
use super::{ImageTensor, RGB_CHANNELS};

/// Decode image bytes and convert them to a normalized tensor.
///
/// The image is:
/// 1. Sniffed and header-checked against `max_dimension`
/// 2. Decoded with the same limit enforced by the decoder
/// 3. Converted to RGB (alpha dropped, grayscale expanded)
/// 4. Resized to `input_size` x `input_size` with bilinear filtering
/// 5. Normalized to [0, 1] and returned as NCHW tensor (1, 3, size, size)
///
/// Returns the tensor together with the original `(width, height)`.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMediaType`] for non JPEG/PNG bytes,
/// [`Error::DimensionTooLarge`] for oversized rasters, and
/// [`Error::InvalidImage`] when decoding fails.
pub fn decode_and_resize(
    bytes: &[u8],
    input_size: u32,
    max_dimension: u32,
) -> Result<(ImageTensor, (u32, u32))> {
    let media_type = sniff_media_type(bytes)?;
    let (width, height) = read_dimensions(bytes, media_type)?;
    check_dimensions(width, height, max_dimension)?;

    let mut limits = Limits::default();
    limits.max_image_width = Some(max_dimension);
    limits.max_image_height = Some(max_dimension);

    let mut reader = ImageReader::with_format(Cursor::new(bytes), media_type.format());
    reader.limits(limits);
    let img = reader.decode().map_err(|source| Error::InvalidImage {
        reason: format!("cannot decode {} image", media_type.name()),
        source: Some(source),
    })?;

    tracing::debug!(
        media_type = media_type.mime(),
        width,
        height,
        input_size,
        "decoded image"
    );

    Ok((image_to_tensor(&img, input_size), (width, height)))
}

/// Convert a `DynamicImage` to a normalized NCHW tensor of side `size`.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn image_to_tensor(img: &DynamicImage, size: u32) -> ImageTensor {
    // Triangle is bilinear: deterministic and cheap
    let resized = img.resize_exact(size, size, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let side = size as usize;

    Array4::from_shape_fn((1, RGB_CHANNELS, side, side), |(_, c, y, x)| {
        // Safe: x and y are bounded by size, which is a u32
        let pixel = rgb.get_pixel(x as u32, y as u32);
        f32::from(pixel[c]) / 255.0
    })
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;
    use crate::image::test_support::encoded_rgb;

    #[test]
    fn test_tensor_shape() {
        let img = DynamicImage::new_rgb8(100, 60);
        let tensor = image_to_tensor(&img, 256);

        assert_eq!(tensor.shape(), &[1, 3, 256, 256]);
    }

    #[test]
    fn test_normalization_range() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            20,
            20,
            image::Rgb([255, 0, 51]),
        ));
        let tensor = image_to_tensor(&img, 32);

        assert!(tensor.iter().all(|&v| (0.0..=1.0).contains(&v)));
        approx::assert_abs_diff_eq!(tensor[[0, 0, 5, 5]], 1.0);
        approx::assert_abs_diff_eq!(tensor[[0, 1, 5, 5]], 0.0);
        approx::assert_abs_diff_eq!(tensor[[0, 2, 5, 5]], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_alpha_is_dropped() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([10, 20, 30, 200])));
        let tensor = image_to_tensor(&img, 16);

        assert_eq!(tensor.shape(), &[1, 3, 16, 16]);
        approx::assert_abs_diff_eq!(tensor[[0, 2, 0, 0]], 30.0 / 255.0, epsilon = 1.5 / 255.0);
    }

    #[test]
    fn test_decode_and_resize_is_deterministic() {
        let png = encoded_rgb(50, 70, [90, 120, 200], ImageFormat::Png);

        let (first, dims) = decode_and_resize(&png, 64, 4096).unwrap();
        let (second, _) = decode_and_resize(&png, 64, 4096).unwrap();

        assert_eq!(dims, (50, 70));
        assert_eq!(first.shape(), &[1, 3, 64, 64]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_corrupt_stream_is_invalid_image() {
        let mut jpeg = encoded_rgb(32, 32, [1, 2, 3], ImageFormat::Jpeg);
        jpeg.truncate(100);

        assert!(matches!(
            decode_and_resize(&jpeg, 32, 4096),
            Err(Error::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_decode_enforces_dimension_limit() {
        let png = encoded_rgb(40, 10, [0, 0, 0], ImageFormat::Png);

        assert!(matches!(
            decode_and_resize(&png, 32, 32),
            Err(Error::DimensionTooLarge { width: 40, height: 10, max: 32 })
        ));
    }
}
